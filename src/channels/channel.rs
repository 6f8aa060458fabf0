//! Channel trait and message types.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use uuid::Uuid;

use crate::error::ChannelError;

/// A message received from an external channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Unique message ID.
    pub id: Uuid,
    /// Channel this message came from.
    pub channel: String,
    /// User identifier within the channel.
    pub user_id: String,
    /// Optional display name.
    pub user_name: Option<String>,
    /// Message content.
    pub content: String,
    /// Chat or conversation the message was posted in.
    pub thread_id: Option<String>,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
    /// Channel-specific metadata (`chat_type`, `chat_id`, `agent`, ...).
    pub metadata: serde_json::Value,
}

impl IncomingMessage {
    /// Create a new incoming message.
    pub fn new(
        channel: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            user_id: user_id.into(),
            user_name: None,
            content: content.into(),
            thread_id: None,
            received_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the chat ID.
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Set metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set user name.
    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    /// A trimmed, non-empty string metadata field.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// The chat this message belongs to: `chat_id` metadata, else the thread ID.
    pub fn chat_id(&self) -> Option<&str> {
        self.meta("chat_id").or_else(|| {
            self.thread_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
    }

    /// Whether the message was posted in a shared group chat.
    pub fn is_group(&self) -> bool {
        matches!(self.meta("chat_type"), Some("group" | "supergroup"))
    }
}

/// Stream of incoming messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// Response to send back to a channel.
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    /// The content to send.
    pub content: String,
    /// Optional chat ID to reply in.
    pub thread_id: Option<String>,
}

impl OutgoingResponse {
    /// Create a simple text response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            thread_id: None,
        }
    }

    /// Set the chat ID for the response.
    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// Trait for message channels.
///
/// Channels are pure I/O: they turn external input into
/// [`IncomingMessage`]s and deliver text back. Routing to sessions is the
/// dispatcher's job.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name (e.g., "cli", "telegram").
    fn name(&self) -> &str;

    /// Start listening for messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Send a response in the context of the original message.
    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError>;

    /// Send a proactive message to a user without a prior incoming message.
    ///
    /// Used when a timer or another thread wakes a session whose turn has no
    /// per-wake reply target.
    async fn broadcast(
        &self,
        user_id: &str,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError>;

    /// Gracefully shut down the channel.
    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_helpers() {
        let msg = IncomingMessage::new("telegram", "42", "hi")
            .with_thread("-100")
            .with_metadata(serde_json::json!({"chat_type": "supergroup", "agent": "  "}));
        assert!(msg.is_group());
        assert_eq!(msg.meta("agent"), None);
        assert_eq!(msg.chat_id(), Some("-100"));

        let direct = IncomingMessage::new("telegram", "42", "hi")
            .with_metadata(serde_json::json!({"chat_id": "42"}));
        assert!(!direct.is_group());
        assert_eq!(direct.chat_id(), Some("42"));
    }
}
