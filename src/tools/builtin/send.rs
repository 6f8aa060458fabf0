//! Proactive delivery to a named channel.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::channels::{ChannelManager, OutgoingResponse};
use crate::tools::tool::{optional_str, require_str};
use crate::tools::{Tool, ToolContext, ToolError, ToolOutput};

/// Sends a message through a channel without waiting for a turn's reply.
///
/// This is how silent timer turns and child threads reach the user.
pub struct SendMessageTool {
    channels: Arc<ChannelManager>,
}

impl SendMessageTool {
    pub fn new(channels: Arc<ChannelManager>) -> Self {
        Self { channels }
    }
}

/// Recipient used when the model gives no `reply_to`: the user half of a
/// `channel:user` session key on the same channel, otherwise the channel's
/// own default.
fn default_recipient<'a>(session_key: &'a str, channel: &str) -> &'a str {
    match session_key.split_once(':') {
        Some((ch, user)) if ch == channel && !user.contains(':') => user,
        _ => "",
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to a specific channel (e.g. telegram, cli). Use it to notify the \
         user proactively when your reply is not delivered automatically."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "channel": {
                    "type": "string",
                    "description": "Target channel name (e.g. 'telegram', 'cli')"
                },
                "text": {
                    "type": "string",
                    "description": "The message text to send"
                },
                "reply_to": {
                    "type": "string",
                    "description": "Optional recipient or chat id"
                }
            },
            "required": ["channel", "text"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let channel = require_str(&params, "channel")?;
        let text = require_str(&params, "text")?;

        if !self.channels.contains(channel) {
            return Err(ToolError::InvalidParameters(format!(
                "unknown channel '{}', available: {}",
                channel,
                self.channels.channel_names().join(", ")
            )));
        }

        let recipient = optional_str(&params, "reply_to")
            .unwrap_or_else(|| default_recipient(&ctx.session_key, channel));
        self.channels
            .broadcast(channel, recipient, OutgoingResponse::text(text))
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        tracing::debug!(channel, recipient, session = %ctx.session_key, "send_message delivered");
        Ok(ToolOutput::text(
            format!("Message sent to channel '{}'", channel),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;

    fn tool_with(channel: &Arc<MemoryChannel>) -> SendMessageTool {
        let mut channels = ChannelManager::new();
        channels.add(channel.clone());
        SendMessageTool::new(Arc::new(channels))
    }

    #[tokio::test]
    async fn test_sends_to_explicit_recipient() {
        let telegram = Arc::new(MemoryChannel::new("telegram"));
        let tool = tool_with(&telegram);

        let out = tool
            .execute(
                serde_json::json!({"channel": "telegram", "text": "done", "reply_to": "99"}),
                &ToolContext::new("t1", "main"),
            )
            .await
            .unwrap();

        assert_eq!(out.into_text(), "Message sent to channel 'telegram'");
        assert_eq!(telegram.sent(), vec![("99".to_string(), "done".to_string())]);
    }

    #[tokio::test]
    async fn test_recipient_defaults_to_session_user() {
        let telegram = Arc::new(MemoryChannel::new("telegram"));
        let tool = tool_with(&telegram);

        tool.execute(
            serde_json::json!({"channel": "telegram", "text": "from a timer"}),
            &ToolContext::new("t1", "telegram:42"),
        )
        .await
        .unwrap();
        tool.execute(
            serde_json::json!({"channel": "telegram", "text": "from a child"}),
            &ToolContext::new("t2", "telegram:42:thread:ab12"),
        )
        .await
        .unwrap();

        assert_eq!(
            telegram.sent(),
            vec![
                ("42".to_string(), "from a timer".to_string()),
                (String::new(), "from a child".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_channel_is_rejected() {
        let telegram = Arc::new(MemoryChannel::new("telegram"));
        let tool = tool_with(&telegram);

        let err = tool
            .execute(
                serde_json::json!({"channel": "discord", "text": "hi"}),
                &ToolContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(ref m) if m.contains("telegram")));

        let err = tool
            .execute(serde_json::json!({"channel": "telegram"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
        assert!(telegram.sent().is_empty());
    }
}
