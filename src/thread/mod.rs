//! Session-affine threads and the dispatch loop that schedules their turns.
//!
//! Every session key maps to exactly one [`Thread`]. Producers (channels,
//! timers, other threads) hand a [`WakeMessage`] to [`Manager::wake`]; the
//! manager's dispatch loop runs at most one turn per thread at a time while
//! bounding total concurrency across threads.

mod delegation;
mod inbox;
mod manager;
mod metrics;
mod runner;
mod turn;
mod unit;
mod wake;

pub use delegation::ChildCompletionSink;
pub use inbox::Inbox;
pub use manager::{AgentResolver, Manager, SinkResolver, ThreadDeps};
pub use metrics::{ExecMetrics, ThreadInfo, ThreadState, ToolCallRecord, preview};
pub use runner::{Runner, TurnObserver};
pub use turn::{ContextPressureHook, TurnContext, TurnHook};
pub use unit::Thread;
pub use wake::{Deliver, Sink, WakeMessage, WakeSource, build_wake_payload};

use async_trait::async_trait;

use crate::cron::TimerJob;
use crate::error::CronError;

/// Timer operations threads need for delegation and the cron tool.
///
/// Implemented by the cron scheduler; the manager only holds it behind this
/// trait so the two can reference each other without a module cycle.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn add_job(&self, job: TimerJob) -> Result<TimerJob, CronError>;
    async fn remove_job(&self, id: &str) -> Result<(), CronError>;
    async fn list_jobs(&self) -> Vec<TimerJob>;
}

/// Eight random lowercase hex digits, used in child keys and sleep job ids.
pub(crate) fn random_hex8() -> String {
    format!("{:08x}", rand::random::<u32>())
}
