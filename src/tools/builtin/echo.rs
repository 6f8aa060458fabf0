//! Echo tool.

use std::time::Instant;

use async_trait::async_trait;

use crate::tools::tool::require_str;
use crate::tools::{Tool, ToolContext, ToolError, ToolOutput};

/// Echoes its input back. Handy for checking tool wiring end to end.
#[derive(Debug)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the input message. Useful for testing."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo back"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let message = require_str(&params, "message")?;
        Ok(ToolOutput::text(message, start.elapsed()))
    }
}
