//! Routes channel messages to session threads.
//!
//! Session keys:
//! - `cli` and `web` share the `cli` session.
//! - Group chats share one session per chat: `<channel>:<chat id>`.
//! - Direct chats get one session per user: `<channel>:<user id>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelManager, IncomingMessage, MessageStream, OutgoingResponse};
use crate::config::ChannelsConfig;
use crate::error::ChannelError;
use crate::thread::{Deliver, Manager, Sink, SinkResolver, WakeMessage, WakeSource};

const CLI_SESSION: &str = "cli";

/// Session key for an incoming message.
pub fn session_key_for(msg: &IncomingMessage) -> String {
    let channel = msg.channel.trim();
    if channel == "cli" || channel == "web" {
        return CLI_SESSION.to_string();
    }

    let user = msg.user_id.trim();
    if msg.is_group() {
        if let Some(chat) = msg.chat_id() {
            return format!("{}:{}", channel, chat);
        }
    }
    if !user.is_empty() {
        return format!("{}:{}", channel, user);
    }
    match msg.chat_id() {
        Some(chat) => format!("{}:{}", channel, chat),
        None => channel.to_string(),
    }
}

/// Text handed to the model: media summary first, sender prefix in groups.
pub fn preprocess(msg: &IncomingMessage) -> String {
    let mut text = msg.content.clone();
    if let Some(summary) = msg.meta("media_summary") {
        text = format!("{}\n\n{}", summary, text);
    }
    if msg.is_group() {
        let sender = msg
            .user_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| msg.meta("first_name"));
        if let Some(sender) = sender {
            text = format!("[{}]: {}", sender, text);
        }
    }
    text
}

/// Delivers a turn's response as a reply to the originating message.
struct ChannelReply {
    channels: Arc<ChannelManager>,
    msg: IncomingMessage,
}

#[async_trait]
impl Deliver for ChannelReply {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let mut response = OutgoingResponse::text(text);
        if let Some(chat) = self.msg.chat_id() {
            response = response.in_thread(chat);
        }
        self.channels.respond(&self.msg, response).await
    }
}

/// Delivers to a user without an originating message.
struct ChannelPush {
    channels: Arc<ChannelManager>,
    channel: String,
    user_id: String,
}

#[async_trait]
impl Deliver for ChannelPush {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.channels
            .broadcast(&self.channel, &self.user_id, OutgoingResponse::text(text))
            .await
    }
}

/// Default sinks for channel-owned sessions.
///
/// `cli` and `<channel>:<id>` keys deliver to that channel when it is
/// registered. Child sessions (`...:thread:...`) and unknown prefixes get no
/// default sink.
pub fn default_sink_resolver(channels: Arc<ChannelManager>) -> SinkResolver {
    Arc::new(move |session_key: &str| {
        if session_key.contains(":thread:") {
            return None;
        }
        let (channel, user) = match session_key.split_once(':') {
            Some((channel, user)) => (channel, user),
            None if session_key == CLI_SESSION => ("cli", "local"),
            None => return None,
        };
        if !channels.contains(channel) {
            return None;
        }
        let target = ChannelPush {
            channels: Arc::clone(&channels),
            channel: channel.to_string(),
            user_id: user.to_string(),
        };
        Some(
            Sink::new(
                format!("your response will be sent to the user via {}", channel),
                Arc::new(target),
            )
            .idempotent(),
        )
    })
}

/// Bridges the channel layer (pure I/O) and the thread layer.
pub struct Dispatcher {
    channels: Arc<ChannelManager>,
    threads: Manager,
    user_agents: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(channels: Arc<ChannelManager>, threads: Manager, config: &ChannelsConfig) -> Self {
        Self {
            channels,
            threads,
            user_agents: config.user_agents.clone(),
        }
    }

    /// Persona for a message: `agent` metadata, else the per-user or
    /// per-chat mapping.
    pub fn resolve_agent(&self, msg: &IncomingMessage) -> Option<String> {
        if let Some(agent) = msg.meta("agent") {
            return Some(agent.to_string());
        }
        let by_user = Some(msg.user_id.trim())
            .filter(|u| !u.is_empty())
            .and_then(|u| self.user_agents.get(u));
        by_user
            .or_else(|| msg.chat_id().and_then(|c| self.user_agents.get(c)))
            .cloned()
    }

    /// Build the session key and wake message for `msg`.
    pub fn translate(&self, msg: &IncomingMessage) -> (String, WakeMessage) {
        let session_key = session_key_for(msg);
        let sink = Sink::new(
            format!("your response will be sent to the user via {}", msg.channel),
            Arc::new(ChannelReply {
                channels: Arc::clone(&self.channels),
                msg: msg.clone(),
            }),
        )
        .idempotent();

        let mut wake = WakeMessage::new(WakeSource::from(msg.channel.as_str()), preprocess(msg))
            .with_sink(sink);
        if let Some(agent) = self.resolve_agent(msg) {
            wake = wake.with_agent(agent);
            if let Some(task) = msg.meta("task") {
                wake = wake.with_var("TASK", task);
            }
        }
        (session_key, wake)
    }

    /// Hand one message to its session thread.
    pub async fn dispatch(&self, msg: IncomingMessage) {
        let (session_key, wake) = self.translate(&msg);
        tracing::debug!(
            channel = %msg.channel,
            user = %msg.user_id,
            session_key = %session_key,
            "Dispatching message"
        );
        self.threads.wake(&session_key, wake).await;
    }

    /// Dispatch messages from `stream` until it ends or `cancel` fires.
    pub async fn run(&self, mut stream: MessageStream, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = stream.next() => msg,
            };
            match msg {
                Some(msg) => self.dispatch(msg).await,
                None => {
                    tracing::info!("All channel streams ended");
                    break;
                }
            }
        }
    }
}
