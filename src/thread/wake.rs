//! Wake messages, delivery sinks, and the wake payload format.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::error::ChannelError;

/// Why a thread was woken.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WakeSource {
    Telegram,
    Discord,
    Feishu,
    Cli,
    Web,
    /// Another session asked this one to resume.
    UserActive,
    /// A parent delegated a task to this child.
    ChildTask,
    /// A child reported back to its parent.
    ChildCompleted,
    SleepCompleted,
    Cron,
    CronFinished,
    External,
    Other(String),
}

impl WakeSource {
    /// Wire name used in payload headers and logs.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Feishu => "feishu",
            Self::Cli => "cli",
            Self::Web => "web",
            Self::UserActive => "user_active",
            Self::ChildTask => "child_task",
            Self::ChildCompleted => "child_completed",
            Self::SleepCompleted => "sleep_completed",
            Self::Cron => "cron",
            Self::CronFinished => "cron_finished",
            Self::External => "external",
            Self::Other(name) => name,
        }
    }

    /// Instruction shown to the model under `[Wake Action]`.
    pub fn action_hint(&self) -> &'static str {
        match self {
            Self::Telegram | Self::Discord | Self::Feishu | Self::Cli | Self::Web => {
                "Respond directly to the user request."
            }
            Self::UserActive => "Resume the target session and respond to this wake message.",
            Self::ChildTask => "Execute this delegated task and return a result.",
            Self::ChildCompleted => {
                "A child thread completed. Summarize the result and report the original result."
            }
            Self::SleepCompleted => {
                "You previously set a sleep timer. You have been woken up. Resume your session."
            }
            Self::Cron => {
                "A scheduled cron task has started. Execute it based on the provided job context."
            }
            Self::CronFinished => {
                "A cron task has finished. Summarize the result and report the original result."
            }
            Self::External => "Process this external wake message and continue the session.",
            Self::Other(_) => "Process this wake message and continue.",
        }
    }
}

impl From<&str> for WakeSource {
    fn from(raw: &str) -> Self {
        match raw.trim() {
            "telegram" => Self::Telegram,
            "discord" => Self::Discord,
            "feishu" => Self::Feishu,
            "cli" => Self::Cli,
            "web" => Self::Web,
            "user_active" => Self::UserActive,
            "child_task" => Self::ChildTask,
            "child_completed" => Self::ChildCompleted,
            "sleep_completed" => Self::SleepCompleted,
            "cron" => Self::Cron,
            "cron_finished" => Self::CronFinished,
            "external" => Self::External,
            "" => Self::Other("unknown".to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for WakeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for a turn's response.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Deliver one response.
    async fn send(&self, text: &str) -> Result<(), ChannelError>;

    /// Whether blank responses are still worth delivering.
    fn accepts_empty(&self) -> bool {
        false
    }
}

/// A labelled delivery target.
///
/// A sink without a target is the zero sink: responses routed to it are
/// dropped and the model is told there is no auto-delivery.
#[derive(Clone, Default)]
pub struct Sink {
    pub label: String,
    /// Safe to call repeatedly within one turn (used for streaming
    /// intermediate assistant text).
    pub idempotent: bool,
    target: Option<Arc<dyn Deliver>>,
}

impl Sink {
    /// Create a sink that delivers to `target`.
    pub fn new(label: impl Into<String>, target: Arc<dyn Deliver>) -> Self {
        Self {
            label: label.into(),
            idempotent: false,
            target: Some(target),
        }
    }

    /// The zero sink.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Mark the sink as safe for repeated sends.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn is_zero(&self) -> bool {
        self.target.is_none()
    }

    pub fn accepts_empty(&self) -> bool {
        self.target.as_ref().is_some_and(|t| t.accepts_empty())
    }

    /// Send `text` to the target. The zero sink accepts and drops everything.
    pub async fn send(&self, text: &str) -> Result<(), ChannelError> {
        match &self.target {
            Some(target) => target.send(text).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("label", &self.label)
            .field("idempotent", &self.idempotent)
            .field("zero", &self.is_zero())
            .finish()
    }
}

/// One unit of work queued for a thread.
#[derive(Debug, Clone)]
pub struct WakeMessage {
    pub source: WakeSource,
    pub message: String,
    /// `None` uses the thread's default sink.
    pub sink: Option<Sink>,
    /// Persona to switch to before the turn.
    pub agent: Option<String>,
    pub vars: BTreeMap<String, String>,
}

impl WakeMessage {
    /// Create a wake message with no sink, persona, or vars override.
    pub fn new(source: WakeSource, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
            sink: None,
            agent: None,
            vars: BTreeMap::new(),
        }
    }

    pub fn with_sink(mut self, sink: Sink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        let agent = agent.into();
        self.agent = if agent.trim().is_empty() {
            None
        } else {
            Some(agent.trim().to_string())
        };
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Messages merge only when source, persona override, and vars all match.
    pub fn can_merge(&self, other: &WakeMessage) -> bool {
        self.source == other.source && self.agent == other.agent && self.vars == other.vars
    }

    /// Fold `next` into this message. The later sink wins.
    pub fn absorb(&mut self, next: WakeMessage) {
        self.message.push('\n');
        self.message.push_str(&next.message);
        self.sink = next.sink;
    }
}

/// Build the user message the model sees for a wake.
///
/// Returns an empty string when there is no text to act on.
pub fn build_wake_payload(
    source: &WakeSource,
    message: &str,
    thread_id: &str,
    session_key: &str,
    delivery_label: &str,
) -> String {
    build_wake_payload_at(
        source,
        message,
        thread_id,
        session_key,
        delivery_label,
        Local::now(),
    )
}

pub(crate) fn build_wake_payload_at(
    source: &WakeSource,
    message: &str,
    thread_id: &str,
    session_key: &str,
    delivery_label: &str,
    now: DateTime<Local>,
) -> String {
    let message = message.trim();
    if message.is_empty() {
        return String::new();
    }

    let header = format!(
        "[Wake reason: {} | thread: {} | session: {} | {} ({}, UTC{})]",
        source,
        thread_id,
        session_key,
        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
        now.format("%A"),
        now.format("%:z"),
    );

    let delivery = if delivery_label.trim().is_empty() {
        "[Delivery: no auto-delivery, use tools to send messages if needed]".to_string()
    } else {
        format!("[Delivery: {}]", delivery_label.trim())
    };

    format!(
        "{}\n{}\n[Wake Action]\n{}\n\n{}",
        header,
        delivery,
        source.action_hint(),
        message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_source_round_trips_through_str() {
        for name in [
            "telegram",
            "discord",
            "feishu",
            "cli",
            "web",
            "user_active",
            "child_task",
            "child_completed",
            "sleep_completed",
            "cron",
            "cron_finished",
            "external",
        ] {
            assert_eq!(WakeSource::from(name).as_str(), name);
        }
        assert_eq!(
            WakeSource::from("webhook"),
            WakeSource::Other("webhook".to_string())
        );
    }

    #[test]
    fn test_action_hint_fallback() {
        assert_eq!(
            WakeSource::Other("webhook".into()).action_hint(),
            "Process this wake message and continue."
        );
        assert_eq!(
            WakeSource::Cli.action_hint(),
            "Respond directly to the user request."
        );
    }

    #[test]
    fn test_can_merge_requires_matching_agent_and_vars() {
        let a = WakeMessage::new(WakeSource::Telegram, "hi");
        let b = WakeMessage::new(WakeSource::Telegram, "there");
        assert!(a.can_merge(&b));

        let other_agent = b.clone().with_agent("coder");
        assert!(!a.can_merge(&other_agent));

        let other_vars = b.clone().with_var("lang", "fr");
        assert!(!a.can_merge(&other_vars));

        let other_source = WakeMessage::new(WakeSource::Cron, "there");
        assert!(!a.can_merge(&other_source));
    }

    #[test]
    fn test_absorb_joins_text_and_takes_last_sink() {
        let mut first = WakeMessage::new(WakeSource::Cli, "one").with_sink(Sink::zero());
        let mut second = WakeMessage::new(WakeSource::Cli, "two");
        second.sink = None;
        first.absorb(second);
        assert_eq!(first.message, "one\ntwo");
        assert!(first.sink.is_none());
    }

    #[test]
    fn test_payload_format() {
        let now = Local.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap();
        let payload = build_wake_payload_at(
            &WakeSource::Telegram,
            "  hello  ",
            "thread-1",
            "telegram:42",
            "telegram reply",
            now,
        );
        let lines: Vec<&str> = payload.lines().collect();
        assert!(lines[0].starts_with(
            "[Wake reason: telegram | thread: thread-1 | session: telegram:42 | 2026-03-02T09:30:00"
        ));
        assert!(lines[0].contains("(Monday, UTC"));
        assert_eq!(lines[1], "[Delivery: telegram reply]");
        assert_eq!(lines[2], "[Wake Action]");
        assert_eq!(lines[3], "Respond directly to the user request.");
        assert_eq!(lines[4], "");
        assert_eq!(lines[5], "hello");
    }

    #[test]
    fn test_payload_without_delivery_and_empty_text() {
        let payload = build_wake_payload(&WakeSource::Cron, "tick", "t", "main", "");
        assert!(
            payload.contains("[Delivery: no auto-delivery, use tools to send messages if needed]")
        );
        assert!(build_wake_payload(&WakeSource::Cron, "   ", "t", "main", "x").is_empty());
    }

    #[tokio::test]
    async fn test_zero_sink_drops() {
        let sink = Sink::zero();
        assert!(sink.is_zero());
        assert!(!sink.accepts_empty());
        assert!(sink.send("ignored").await.is_ok());
    }
}
