//! Live execution metrics and thread snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;

const PREVIEW_CHARS: usize = 200;

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Idle,
    Running,
}

/// One tool invocation inside a turn.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub args_preview: String,
    pub result_preview: String,
    pub duration_ms: u64,
    pub error: bool,
}

impl ToolCallRecord {
    pub fn new(name: &str, args: &str, result: &str, duration_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            args_preview: preview(args),
            result_preview: preview(result),
            duration_ms,
            error: result.starts_with("Error"),
        }
    }
}

/// Progress of the turn currently running on a thread.
#[derive(Debug, Clone, Serialize)]
pub struct ExecMetrics {
    pub turn_start: DateTime<Utc>,
    pub iterations: usize,
    pub total_tool_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ExecMetrics {
    pub fn start() -> Self {
        Self {
            turn_start: Utc::now(),
            iterations: 0,
            total_tool_calls: 0,
            current_tool: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn record(&mut self, call: ToolCallRecord) {
        self.total_tool_calls += 1;
        self.current_tool = None;
        self.tool_calls.push(call);
    }
}

/// Point-in-time view of a thread for observability.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub id: String,
    pub session_key: String,
    pub agent: String,
    pub state: ThreadState,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExecMetrics>,
}

/// First `PREVIEW_CHARS` characters of `s`, with an ellipsis if cut.
pub fn preview(s: &str) -> String {
    if s.chars().count() <= PREVIEW_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(PREVIEW_CHARS).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_respects_char_boundaries() {
        let long = "é".repeat(300);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn test_record_flags_errors() {
        let mut m = ExecMetrics::start();
        m.current_tool = Some("echo".into());
        m.record(ToolCallRecord::new("echo", "{}", "Error: boom", 3));
        assert_eq!(m.total_tool_calls, 1);
        assert!(m.current_tool.is_none());
        assert!(m.tool_calls[0].error);
    }
}
