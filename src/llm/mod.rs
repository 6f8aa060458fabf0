//! LLM integration for the agent.
//!
//! The turn routine only depends on [`LlmProvider`]; the bundled
//! [`OpenAiChatProvider`] speaks the OpenAI-compatible Chat Completions API.

mod openai_chat;
mod provider;

pub use openai_chat::OpenAiChatProvider;
pub use provider::{
    ChatMessage, FinishReason, LlmProvider, Role, ToolCall, ToolCompletionRequest,
    ToolCompletionResponse, ToolDefinition,
};

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create an LLM provider based on configuration.
pub fn create_llm_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    tracing::info!(
        "Using chat completions API at {} (model {})",
        config.base_url,
        config.model
    );
    Ok(Arc::new(OpenAiChatProvider::new(config.clone())?))
}
