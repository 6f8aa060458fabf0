//! Conversation transcripts and their persistence.
//!
//! The turn routine never holds a session across a model call: it reloads
//! before every save so edits made elsewhere (another process, a manual
//! cleanup) are appended to rather than overwritten.

mod file_store;

pub use file_store::FileSessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::llm::{ChatMessage, Role};

/// Key used when a wake names no session.
pub const DEFAULT_SESSION_KEY: &str = "main";

/// A persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create an empty session.
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append messages and bump `updated_at`.
    pub fn append(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.messages.extend(messages);
        self.updated_at = Utc::now();
    }

    /// Keep at most `max` trailing messages.
    ///
    /// The retained window never starts on a tool result, since a tool result
    /// without its preceding tool call is rejected by providers.
    pub fn cap(&mut self, max: usize) {
        if self.messages.len() <= max {
            return;
        }
        let mut start = self.messages.len() - max;
        while start < self.messages.len() && self.messages[start].role == Role::Tool {
            start += 1;
        }
        self.messages.drain(..start);
    }
}

/// Storage for session transcripts.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the latest persisted state. A missing session is empty, not an error.
    async fn reload(&self, key: &str) -> Result<Session, SessionError>;

    /// Persist the whole session.
    async fn save(&self, session: &Session) -> Result<(), SessionError>;
}
