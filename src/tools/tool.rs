//! Tool trait and types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Not available: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::ExecutionFailed(err.to_string())
    }
}

impl From<crate::error::CronError> for ToolError {
    fn from(err: crate::error::CronError) -> Self {
        ToolError::ExecutionFailed(err.to_string())
    }
}

impl From<crate::error::DelegationError> for ToolError {
    fn from(err: crate::error::DelegationError) -> Self {
        match err {
            crate::error::DelegationError::ManagerUnavailable => {
                ToolError::Unavailable(err.to_string())
            }
            crate::error::DelegationError::EmptyTask
            | crate::error::DelegationError::InvalidDuration { .. } => {
                ToolError::InvalidParameters(err.to_string())
            }
            crate::error::DelegationError::Scheduler(e) => e.into(),
        }
    }
}

/// Who is calling a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub thread_id: String,
    pub session_key: String,
    /// Active persona of the calling thread.
    pub agent: String,
}

impl ToolContext {
    /// Create a new tool context.
    pub fn new(thread_id: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            session_key: session_key.into(),
            agent: String::new(),
        }
    }

    /// Set the persona name.
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The result data.
    pub result: serde_json::Value,
    /// Time taken.
    pub duration: Duration,
}

impl ToolOutput {
    /// Create a successful output with a JSON result.
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    /// Create a text output.
    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }

    /// Render the result as the string handed back to the model.
    pub fn into_text(self) -> String {
        match self.result {
            serde_json::Value::String(s) => s,
            other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// Definition of a tool's parameters using JSON Schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    /// Create a new tool schema.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    /// Set the parameters schema.
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Trait for tools that the agent can use.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Get a description of what the tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    /// Get the tool schema for LLM function calling.
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Read a required, non-blank string parameter.
pub(crate) fn require_str<'a>(
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", key)))
}

/// Read an optional string parameter; blank counts as absent.
pub(crate) fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_str_rejects_blank() {
        let params = serde_json::json!({"task": "  ", "agent": "coder"});
        assert!(matches!(
            require_str(&params, "task"),
            Err(ToolError::InvalidParameters(_))
        ));
        assert_eq!(require_str(&params, "agent").unwrap(), "coder");
        assert_eq!(optional_str(&params, "task"), None);
    }

    #[test]
    fn test_into_text() {
        let out = ToolOutput::text("hi", Duration::ZERO);
        assert_eq!(out.into_text(), "hi");

        let out = ToolOutput::success(serde_json::json!({"ok": true}), Duration::ZERO);
        assert!(out.into_text().contains("\"ok\": true"));
    }
}
