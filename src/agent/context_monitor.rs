//! Context window monitoring.
//!
//! Estimates the size of a conversation so the turn routine can warn the
//! model before the provider starts rejecting requests.

use crate::llm::{ChatMessage, Role};

/// Approximate tokens per word (rough estimate for English).
const TOKENS_PER_WORD: f64 = 1.3;

/// Per-message overhead for role and structure.
const MESSAGE_OVERHEAD: usize = 4;

/// Tracks a context budget.
#[derive(Debug, Clone, Copy)]
pub struct ContextMonitor {
    /// Maximum tokens allowed in context.
    context_limit: usize,
    /// Fraction of the limit that counts as "under pressure".
    threshold_ratio: f64,
}

impl ContextMonitor {
    /// Create a monitor for a window of `context_limit` tokens.
    pub fn new(context_limit: usize, threshold_ratio: f64) -> Self {
        Self {
            context_limit: context_limit.max(1),
            threshold_ratio: threshold_ratio.clamp(0.05, 0.99),
        }
    }

    /// Estimate the token count for a list of messages.
    pub fn estimate_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(estimate_message_tokens).sum()
    }

    /// Whether `tokens` is past the warning threshold.
    pub fn exceeds_threshold(&self, tokens: usize) -> bool {
        tokens > self.threshold()
    }

    /// Usage of the window as a percentage.
    pub fn usage_percent(&self, tokens: usize) -> f64 {
        (tokens as f64 / self.context_limit as f64) * 100.0
    }

    /// Get the context limit.
    pub fn limit(&self) -> usize {
        self.context_limit
    }

    pub fn threshold_ratio(&self) -> f64 {
        self.threshold_ratio
    }

    /// Get the current threshold in tokens.
    pub fn threshold(&self) -> usize {
        (self.context_limit as f64 * self.threshold_ratio) as usize
    }
}

/// Estimate tokens for a single message.
pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    let mut words = message.content.split_whitespace().count();
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            words += 1 + call.arguments.to_string().split_whitespace().count();
        }
    }
    (words as f64 * TOKENS_PER_WORD) as usize + MESSAGE_OVERHEAD
}

/// Estimate tokens for raw text.
pub fn estimate_text_tokens(text: &str) -> usize {
    let word_count = text.split_whitespace().count();
    (word_count as f64 * TOKENS_PER_WORD) as usize
}

/// Context size breakdown for reporting.
#[derive(Debug, Clone, Default)]
pub struct ContextBreakdown {
    pub total_tokens: usize,
    pub system_tokens: usize,
    pub user_tokens: usize,
    pub assistant_tokens: usize,
    pub tool_tokens: usize,
    pub message_count: usize,
}

impl ContextBreakdown {
    /// Analyze a list of messages.
    pub fn analyze(messages: &[ChatMessage]) -> Self {
        let mut breakdown = Self {
            message_count: messages.len(),
            ..Self::default()
        };

        for message in messages {
            let tokens = estimate_message_tokens(message);
            breakdown.total_tokens += tokens;

            match message.role {
                Role::System => breakdown.system_tokens += tokens,
                Role::User => breakdown.user_tokens += tokens,
                Role::Assistant => breakdown.assistant_tokens += tokens,
                Role::Tool => breakdown.tool_tokens += tokens,
            }
        }

        breakdown
    }
}
