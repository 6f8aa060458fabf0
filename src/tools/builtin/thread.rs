//! Tools that let a thread delegate, sleep, and coordinate with other threads.
//!
//! Every tool here is bound to the thread that owns it through a weak
//! handle, so a thread's registry never keeps the thread alive.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::thread::{Thread, WakeSource};
use crate::tools::tool::{optional_str, require_str};
use crate::tools::{Tool, ToolContext, ToolError, ToolOutput};

pub(crate) fn bound(thread: &Weak<Thread>) -> Result<Arc<Thread>, ToolError> {
    thread
        .upgrade()
        .ok_or_else(|| ToolError::Unavailable("owning thread is gone".to_string()))
}

/// Parse `"90s"`, `"30m"`, `"2h"`, or compound forms like `"1h30m"`.
///
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !c.is_ascii_digit())?;
        if num_end == 0 {
            return None;
        }
        let num: u64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "s" | "sec" | "secs" => 1,
            "m" | "min" | "mins" => 60,
            "h" | "hr" | "hrs" => 3600,
            _ => return None,
        };
        total = total.checked_add(num.checked_mul(scale)?)?;
        rest = &rest[unit_end..];
    }
    Some(Duration::from_secs(total))
}

/// Delegate a task to a new child thread.
pub struct SpawnThreadTool {
    thread: Weak<Thread>,
}

impl SpawnThreadTool {
    pub fn new(thread: Weak<Thread>) -> Self {
        Self { thread }
    }
}

#[async_trait]
impl Tool for SpawnThreadTool {
    fn name(&self) -> &str {
        "spawn_thread"
    }

    fn description(&self) -> &str {
        "Spawn a child thread for a delegated task. Always asynchronous: returns the child's \
         session key immediately, and the child wakes this thread with a 'child_completed' \
         message when it is done."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "description": "Optional persona name from agents/*.md"
                },
                "task": {
                    "type": "string",
                    "description": "Task for the child, with the background and \
                                    instructions it needs"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let task = require_str(&params, "task")?;
        let agent = optional_str(&params, "agent");

        let thread = bound(&self.thread)?;
        let child = thread.spawn_child(agent, task).await?;
        Ok(ToolOutput::text(
            format!(
                "Thread spawned with session key: {}\nThe child will wake this thread with a \
                 'child_completed' message when done.",
                child
            ),
            start.elapsed(),
        ))
    }
}

/// Suspend the current turn's output and wake this session later.
pub struct SleepThreadTool {
    thread: Weak<Thread>,
}

impl SleepThreadTool {
    pub fn new(thread: Weak<Thread>) -> Self {
        Self { thread }
    }
}

#[async_trait]
impl Tool for SleepThreadTool {
    fn name(&self) -> &str {
        "sleep_thread"
    }

    fn description(&self) -> &str {
        "Sleep the current thread and schedule a delayed wake-up. Use this when you decide not \
         to respond now and want to be woken later. Your output for this turn is suppressed: \
         the user will NOT receive any message."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "duration": {
                    "type": "string",
                    "description": "How long to sleep (max 24h), e.g. \"30m\", \"2h\", \"1h30m\""
                },
                "message": {
                    "type": "string",
                    "description": "Optional note delivered with the wake-up"
                }
            },
            "required": ["duration"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let raw = require_str(&params, "duration")?;
        let duration = parse_duration(raw).ok_or_else(|| {
            ToolError::InvalidParameters(format!("invalid duration '{}'", raw))
        })?;
        let message = optional_str(&params, "message").unwrap_or("");

        let thread = bound(&self.thread)?;
        let wake_at = thread.sleep(duration, message).await?;
        Ok(ToolOutput::text(
            format!(
                "Sleep scheduled. Wake at {} ({} from now).\nYou MUST output only \"SLEEP_OK\" \
                 and stop. Do not call any other tools or produce any other output.",
                wake_at
                    .with_timezone(&chrono::Local)
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
                raw
            ),
            start.elapsed(),
        ))
    }
}

/// Wake another session with an instruction.
pub struct WakeThreadTool {
    thread: Weak<Thread>,
}

impl WakeThreadTool {
    pub fn new(thread: Weak<Thread>) -> Self {
        Self { thread }
    }
}

#[async_trait]
impl Tool for WakeThreadTool {
    fn name(&self) -> &str {
        "wake_thread"
    }

    fn description(&self) -> &str {
        "Wake a thread by session key and inject a message for follow-up reasoning. The \
         thread is created if needed. Waking forces it to run a turn and may notify the user \
         through that session's default delivery."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "session_key": {
                    "type": "string",
                    "description": "Target session key, e.g. 'main' or 'telegram:12345'"
                },
                "message": {
                    "type": "string",
                    "description": "Instruction for the target thread's model \
                                    (not text for the end user)"
                }
            },
            "required": ["session_key", "message"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let session_key = require_str(&params, "session_key")?;
        let message = require_str(&params, "message")?;

        let thread = bound(&self.thread)?;
        let manager = thread
            .manager()
            .ok_or_else(|| ToolError::Unavailable("thread manager stopped".to_string()))?;
        manager
            .wake_with(session_key, WakeSource::UserActive, message)
            .await;
        Ok(ToolOutput::text(
            format!("Thread awakened: {}", session_key),
            start.elapsed(),
        ))
    }
}

/// Report every thread's state and live turn metrics.
pub struct ListThreadsTool {
    thread: Weak<Thread>,
}

impl ListThreadsTool {
    pub fn new(thread: Weak<Thread>) -> Self {
        Self { thread }
    }
}

#[async_trait]
impl Tool for ListThreadsTool {
    fn name(&self) -> &str {
        "list_threads"
    }

    fn description(&self) -> &str {
        "List all threads with their persona, state, pending wakes, and the progress of any \
         running turn."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let thread = bound(&self.thread)?;
        let manager = thread
            .manager()
            .ok_or_else(|| ToolError::Unavailable("thread manager stopped".to_string()))?;
        let threads = manager.list_threads().await;
        let value = serde_json::to_value(&threads)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::success(value, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingJobs, ScriptedProvider};
    use crate::thread::{Manager, ThreadDeps};

    fn manager() -> Manager {
        Manager::new(ThreadDeps::new(Arc::new(ScriptedProvider::new())))
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration(" 2h "), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[tokio::test]
    async fn test_spawn_thread_creates_queued_child() {
        let m = manager();
        let parent = m.get_or_create("main", None).await;
        let tool = SpawnThreadTool::new(Arc::downgrade(&parent));

        let out = tool
            .execute(serde_json::json!({"task": "research"}), &ToolContext::default())
            .await
            .unwrap()
            .into_text();
        let key = out
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("Thread spawned with session key: "))
            .unwrap()
            .to_string();
        assert!(key.starts_with("main:thread:"));
        assert_eq!(key.len(), "main:thread:".len() + 8);

        let child = m.thread(&key).await.unwrap();
        assert_eq!(child.pending().await, 1);
    }

    #[tokio::test]
    async fn test_sleep_schedules_direct_wake_and_suppresses() {
        let m = manager();
        let jobs = Arc::new(RecordingJobs::default());
        m.set_job_scheduler(jobs.clone());
        let thread = m.get_or_create("telegram:42", None).await;
        let tool = SleepThreadTool::new(Arc::downgrade(&thread));

        let out = tool
            .execute(
                serde_json::json!({"duration": "45m"}),
                &ToolContext::default(),
            )
            .await
            .unwrap()
            .into_text();
        assert!(out.contains("SLEEP_OK"));

        let added = jobs.jobs();
        assert_eq!(added.len(), 1);
        assert!(added[0].id.starts_with(&format!("sleep-{}-", thread.id())));
        assert_eq!(added[0].wake_session, "telegram:42");
        assert_eq!(added[0].task, "Sleep timer expired.");
        assert!(added[0].direct_wake);
    }

    #[tokio::test]
    async fn test_sleep_rejects_out_of_range() {
        let m = manager();
        m.set_job_scheduler(Arc::new(RecordingJobs::default()));
        let thread = m.get_or_create("main", None).await;
        let tool = SleepThreadTool::new(Arc::downgrade(&thread));

        for duration in ["0s", "25h"] {
            let err = tool
                .execute(
                    serde_json::json!({"duration": duration}),
                    &ToolContext::default(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ToolError::InvalidParameters(_)), "{duration}");
        }
    }

    #[tokio::test]
    async fn test_wake_thread_and_list() {
        let m = manager();
        let me = m.get_or_create("main", None).await;
        let wake = WakeThreadTool::new(Arc::downgrade(&me));
        wake.execute(
            serde_json::json!({"session_key": "other", "message": "check in"}),
            &ToolContext::default(),
        )
        .await
        .unwrap();

        let list = ListThreadsTool::new(Arc::downgrade(&me));
        let out = list
            .execute(serde_json::json!({}), &ToolContext::default())
            .await
            .unwrap();
        let entries = out.result.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["session_key"], "other");
        assert_eq!(entries[1]["pending"], 1);
        assert_eq!(entries[1]["state"], "idle");
    }

    #[tokio::test]
    async fn test_tools_fail_after_thread_dropped() {
        let tool = SpawnThreadTool::new(Weak::new());
        let err = tool
            .execute(serde_json::json!({"task": "x"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unavailable(_)));
    }
}
