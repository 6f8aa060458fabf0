//! Error types for the agent runtime.

use std::time::Duration;

use thiserror::Error;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Cron error: {0}")]
    Cron(#[from] CronError),

    #[error("Turn error: {0}")]
    Turn(#[from] TurnError),

    #[error("Delegation error: {0}")]
    Delegation(#[from] DelegationError),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },
}

/// Channel-related errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Channel {name} disconnected: {reason}")]
    Disconnected { name: String, reason: String },
}

/// Session persistence errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error on session {key}: {reason}")]
    Io { key: String, reason: String },

    #[error("Corrupt session file for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Timer and cron store errors.
#[derive(Debug, Error)]
pub enum CronError {
    /// A job is missing a field its kind requires.
    #[error("{field} is required")]
    MissingField { field: &'static str },

    /// A store job with this id already exists.
    #[error("Job already exists: {id}")]
    Duplicate { id: String },

    /// No store job has this id.
    #[error("Job not found: {id}")]
    NotFound { id: String },

    /// Cron expression failed to parse.
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    /// One-shot added with a fire time that already passed.
    #[error("at_time must be in the future")]
    AtTimeInPast,

    /// No scheduler attached to the thread manager.
    #[error("Job scheduler not configured")]
    Unavailable,

    /// Store file unreadable or a line failed to parse.
    #[error("Failed to read job store {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    /// Writing or renaming the store file failed; in-memory state was rolled back.
    #[error("Failed to persist job store {path}: {reason}")]
    PersistFailed { path: String, reason: String },
}

/// Errors from delegating work to other threads or timers.
#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("thread manager is no longer running")]
    ManagerUnavailable,

    #[error("task is required")]
    EmptyTask,

    #[error("invalid sleep duration: {reason}")]
    InvalidDuration { reason: String },

    #[error(transparent)]
    Scheduler(#[from] CronError),
}

/// Errors that abort a single turn.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("tool loop exceeded {max} iterations")]
    IterationLimit { max: usize },

    #[error("turn cancelled")]
    Cancelled,
}

/// Result type alias for the agent runtime.
pub type Result<T> = std::result::Result<T, Error>;
