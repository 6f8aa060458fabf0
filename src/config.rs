//! Configuration for the agent runtime.
//!
//! Values come from the environment (optionally seeded from a `.env` file via
//! `dotenvy`). Every setting has a default so a bare `ironwake run` only needs
//! `LLM_API_KEY`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::cron::TimerJob;
use crate::error::ConfigError;

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
const DEFAULT_MODEL: &str = "deepseek-chat";
const DEFAULT_MAX_TOKENS: u32 = 8192;
const DEFAULT_TEMPERATURE: f32 = 0.95;
const DEFAULT_CONTEXT_WINDOW_TOKENS: usize = 128_000;
const DEFAULT_CONTEXT_WARN_RATIO: f64 = 0.8;
const DEFAULT_CRON_RELOAD_SECS: u64 = 60;

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub llm: LlmConfig,
    pub thread: ThreadSettings,
    pub cron: CronConfig,
    pub channels: ChannelsConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let workspace = WorkspaceConfig::from_env()?;
        let cron = CronConfig::from_env(&workspace.dir)?;

        Ok(Self {
            llm: LlmConfig::from_env()?,
            thread: ThreadSettings::from_env()?,
            channels: ChannelsConfig::from_env()?,
            workspace,
            cron,
        })
    }
}

/// Workspace layout.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Root directory holding sessions, personas, skills, and the job store.
    pub dir: PathBuf,
}

impl WorkspaceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let dir = match optional_env("IRONWAKE_WORKSPACE") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or_else(|| ConfigError::MissingRequired {
                    key: "IRONWAKE_WORKSPACE".to_string(),
                    hint: "No home directory found; set the workspace path explicitly".to_string(),
                })?
                .join(".ironwake"),
        };
        Ok(Self { dir })
    }

    /// Directory holding session transcripts.
    pub fn sessions_dir(&self) -> PathBuf {
        self.dir.join("sessions")
    }

    /// Directory holding persona templates.
    pub fn agents_dir(&self) -> PathBuf {
        self.dir.join("agents")
    }

    /// Directory holding skill definitions.
    pub fn skills_dir(&self) -> PathBuf {
        self.dir.join("skills")
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl LlmConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            base_url: optional_env("LLM_BASE_URL").unwrap_or(defaults.base_url),
            api_key: optional_env("LLM_API_KEY").map(SecretString::from),
            model: optional_env("LLM_MODEL").unwrap_or(defaults.model),
            max_tokens: parse_env("LLM_MAX_TOKENS", defaults.max_tokens)?,
            temperature: parse_env("LLM_TEMPERATURE", defaults.temperature)?,
            request_timeout: Duration::from_secs(parse_env(
                "LLM_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
        })
    }
}

/// Scheduler and turn limits.
#[derive(Debug, Clone)]
pub struct ThreadSettings {
    /// Maximum number of turns running at once across all sessions.
    pub max_concurrency: usize,
    /// Capacity of each thread's inbox before producers wait.
    pub inbox_capacity: usize,
    /// Tool-loop ceiling for a single turn.
    pub max_tool_iterations: usize,
    pub context_window_tokens: usize,
    /// Fraction of the context window that triggers pre-turn hooks.
    pub context_warn_ratio: f64,
    /// Transcript length retained after each turn.
    pub max_session_messages: usize,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            inbox_capacity: 64,
            max_tool_iterations: 40,
            context_window_tokens: DEFAULT_CONTEXT_WINDOW_TOKENS,
            context_warn_ratio: DEFAULT_CONTEXT_WARN_RATIO,
            max_session_messages: 400,
        }
    }
}

impl ThreadSettings {
    /// Set the global turn limit.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut settings = Self {
            max_concurrency: parse_env("THREAD_MAX_CONCURRENCY", defaults.max_concurrency)?,
            inbox_capacity: parse_env("THREAD_INBOX_CAPACITY", defaults.inbox_capacity)?,
            max_tool_iterations: parse_env(
                "THREAD_MAX_TOOL_ITERATIONS",
                defaults.max_tool_iterations,
            )?,
            context_window_tokens: parse_env(
                "CONTEXT_WINDOW_TOKENS",
                defaults.context_window_tokens,
            )?,
            context_warn_ratio: parse_env("CONTEXT_WARN_RATIO", defaults.context_warn_ratio)?,
            max_session_messages: parse_env(
                "SESSION_MAX_MESSAGES",
                defaults.max_session_messages,
            )?,
        };
        settings.normalize();
        Ok(settings)
    }

    /// Replace out-of-range values with defaults.
    pub fn normalize(&mut self) {
        let defaults = Self::default();
        if self.max_concurrency == 0 {
            self.max_concurrency = defaults.max_concurrency;
        }
        if self.inbox_capacity == 0 {
            self.inbox_capacity = defaults.inbox_capacity;
        }
        if self.max_tool_iterations == 0 {
            self.max_tool_iterations = defaults.max_tool_iterations;
        }
        if self.context_window_tokens == 0 {
            self.context_window_tokens = defaults.context_window_tokens;
        }
        if self.context_warn_ratio <= 0.0 || self.context_warn_ratio >= 1.0 {
            self.context_warn_ratio = defaults.context_warn_ratio;
        }
        if self.max_session_messages == 0 {
            self.max_session_messages = defaults.max_session_messages;
        }
    }
}

/// Timer/cron store configuration.
#[derive(Debug, Clone)]
pub struct CronConfig {
    /// JSONL job store.
    pub store_path: PathBuf,
    /// How often the store is re-read to pick up out-of-process edits.
    pub reload_interval: Duration,
    /// Configuration-defined jobs; scheduled on every load, never persisted.
    pub seeds: Vec<TimerJob>,
}

impl CronConfig {
    /// A store at `store_path` with no seeds, reloaded every minute.
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            reload_interval: Duration::from_secs(DEFAULT_CRON_RELOAD_SECS),
            seeds: Vec::new(),
        }
    }

    /// Set how often the store is re-read.
    pub fn with_reload_interval(mut self, interval: Duration) -> Self {
        self.reload_interval = interval;
        self
    }

    /// Set the configuration-defined jobs.
    pub fn with_seeds(mut self, seeds: Vec<TimerJob>) -> Self {
        self.seeds = seeds;
        self
    }

    fn from_env(workspace: &Path) -> Result<Self, ConfigError> {
        let store_path = optional_env("CRON_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace.join("cron.jsonl"));

        let seeds = match optional_env("CRON_SEEDS_FILE") {
            Some(path) => load_seed_file(Path::new(&path))?,
            None => default_seed_jobs(),
        };

        let reload = parse_env("CRON_RELOAD_SECS", DEFAULT_CRON_RELOAD_SECS)?;
        Ok(Self::new(store_path)
            .with_reload_interval(Duration::from_secs(reload))
            .with_seeds(seeds))
    }
}

/// Seed jobs shipped with a fresh install.
pub fn default_seed_jobs() -> Vec<TimerJob> {
    let mut heartbeat = TimerJob::recurring("heartbeat", "*/30 * * * *", "heartbeat");
    heartbeat.agent = Some("heartbeat".to_string());
    heartbeat.silent = true;

    let mut tidyup = TimerJob::recurring("tidyup", "0 4 * * *", "tidyup");
    tidyup.agent = Some("tidyup".to_string());
    tidyup.silent = true;

    vec![heartbeat, tidyup]
}

fn load_seed_file(path: &Path) -> Result<Vec<TimerJob>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
        key: "CRON_SEEDS_FILE".to_string(),
        message: e.to_string(),
    })
}

/// Channel configuration.
#[derive(Debug, Clone, Default)]
pub struct ChannelsConfig {
    pub cli_enabled: bool,
    /// User or chat id -> persona name.
    pub user_agents: HashMap<String, String>,
}

impl ChannelsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let user_agents = match optional_env("CHANNEL_USER_AGENTS") {
            Some(raw) => parse_user_agents(&raw)?,
            None => HashMap::new(),
        };
        Ok(Self {
            cli_enabled: parse_env("CLI_ENABLED", true)?,
            user_agents,
        })
    }
}

/// Parse `user=persona,user2=persona2`.
fn parse_user_agents(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut out = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (user, agent) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: "CHANNEL_USER_AGENTS".to_string(),
            message: format!("expected user=agent, got '{}'", pair),
        })?;
        out.insert(user.trim().to_string(), agent.trim().to_string());
    }
    Ok(out)
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_clamps_warn_ratio() {
        let mut settings = ThreadSettings {
            context_warn_ratio: 1.5,
            max_concurrency: 0,
            ..ThreadSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.context_warn_ratio, DEFAULT_CONTEXT_WARN_RATIO);
        assert_eq!(settings.max_concurrency, 16);
    }

    #[test]
    fn test_default_seeds_are_silent_recurring() {
        let seeds = default_seed_jobs();
        let ids: Vec<_> = seeds.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["heartbeat", "tidyup"]);
        assert!(seeds.iter().all(|j| j.silent && j.validate_schedule().is_ok()));
    }

    #[test]
    fn test_cron_config_builder() {
        let config = CronConfig::new("/tmp/jobs.jsonl")
            .with_reload_interval(Duration::from_secs(5))
            .with_seeds(default_seed_jobs());
        assert_eq!(config.store_path, PathBuf::from("/tmp/jobs.jsonl"));
        assert_eq!(config.reload_interval, Duration::from_secs(5));
        assert_eq!(config.seeds.len(), 2);
        assert_eq!(
            CronConfig::new("x").reload_interval,
            Duration::from_secs(DEFAULT_CRON_RELOAD_SECS)
        );
    }

    #[test]
    fn test_parse_user_agents() {
        let map = parse_user_agents("42=coder, 7 = tutor").unwrap();
        assert_eq!(map.get("42").map(String::as_str), Some("coder"));
        assert_eq!(map.get("7").map(String::as_str), Some("tutor"));
        assert!(parse_user_agents("oops").is_err());
    }

    #[test]
    fn test_seed_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.json");
        std::fs::write(
            &path,
            r#"[{"id":"daily","kind":"cron","expr":"0 9 * * *","task":"brief me","enabled":true}]"#,
        )
        .unwrap();
        let seeds = load_seed_file(&path).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, "daily");
    }
}
