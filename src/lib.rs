//! Ironwake: a session-affine task scheduler for a personal LLM agent.
//!
//! Channels, timers, and other threads wake sessions by key. Each session is
//! served by one [`thread::Thread`] that runs at most one model turn at a
//! time; messages that arrive mid-turn are merged into the next one.

pub mod agent;
pub mod channels;
pub mod cli;
pub mod config;
pub mod cron;
pub mod error;
pub mod llm;
pub mod session;
/// Test doubles for the integration tests under `tests/`; not part of the
/// supported API.
#[doc(hidden)]
pub mod testing;
pub mod thread;
pub mod tools;

pub use config::Config;
pub use error::{Error, Result};
