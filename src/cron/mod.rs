//! Recurring and one-shot timer jobs that wake sessions.

mod job;
mod scheduler;
pub mod store;

pub use job::{JobKind, StoredCheck, TimerJob, parse_schedule};
pub use scheduler::{CronScheduler, JobOptions, ThreadWaker, wake_for};
