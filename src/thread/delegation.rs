//! Child threads and self-scheduled sleeps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cron::TimerJob;
use crate::error::{ChannelError, CronError, DelegationError};
use crate::thread::manager::WeakManager;
use crate::thread::random_hex8;
use crate::thread::unit::Thread;
use crate::thread::wake::{Deliver, Sink, WakeMessage, WakeSource};

/// Longest sleep a thread may schedule for itself.
pub const MAX_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_SLEEP_MESSAGE: &str = "Sleep timer expired.";

/// Reports a child thread's final response back to its parent session.
pub struct ChildCompletionSink {
    manager: WeakManager,
    parent_key: String,
    child_key: String,
}

impl ChildCompletionSink {
    fn report(&self, text: &str) -> String {
        let text = text.trim();
        let outcome = if text.starts_with("[Error]") {
            "failed"
        } else {
            "completed"
        };
        let body = if text.is_empty() { "(no output)" } else { text };
        format!("[Child thread {} {}]\n{}", self.child_key, outcome, body)
    }
}

#[async_trait]
impl Deliver for ChildCompletionSink {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        let manager = self.manager.upgrade().ok_or_else(|| ChannelError::SendFailed {
            name: "child".to_string(),
            reason: "thread manager stopped".to_string(),
        })?;
        manager
            .wake(
                &self.parent_key,
                WakeMessage::new(WakeSource::ChildCompleted, self.report(text)),
            )
            .await;
        Ok(())
    }

    fn accepts_empty(&self) -> bool {
        true
    }
}

impl Thread {
    /// Start a child thread on `task` and return its session key.
    ///
    /// The child runs asynchronously; its final response wakes this thread
    /// with a `child_completed` message.
    pub async fn spawn_child(
        &self,
        agent: Option<&str>,
        task: &str,
    ) -> Result<String, DelegationError> {
        let task = task.trim();
        if task.is_empty() {
            return Err(DelegationError::EmptyTask);
        }
        let manager = self.manager().ok_or(DelegationError::ManagerUnavailable)?;
        let agent = agent.map(str::trim).filter(|a| !a.is_empty());

        let child_key = format!("{}:thread:{}", self.session_key, random_hex8());
        manager.get_or_create(&child_key, agent).await;

        let target = ChildCompletionSink {
            manager: manager.downgrade(),
            parent_key: self.session_key.clone(),
            child_key: child_key.clone(),
        };
        let sink = Sink::new(
            format!(
                "your final response is reported back to session {}",
                self.session_key
            ),
            Arc::new(target),
        );
        let mut msg = WakeMessage::new(WakeSource::ChildTask, task).with_sink(sink);
        if let Some(agent) = agent {
            msg = msg.with_agent(agent);
        }

        tracing::info!(
            thread_id = %self.id,
            parent = %self.session_key,
            child = %child_key,
            agent = agent.unwrap_or(""),
            "Spawning child thread"
        );
        manager.wake(&child_key, msg).await;
        Ok(child_key)
    }

    /// Schedule a `sleep_completed` wake of this session after `duration`
    /// and suppress delivery of the current turn's response.
    ///
    /// Returns when the wake is due.
    pub async fn sleep(
        &self,
        duration: Duration,
        message: &str,
    ) -> Result<DateTime<Utc>, DelegationError> {
        if duration.is_zero() || duration > MAX_SLEEP {
            return Err(DelegationError::InvalidDuration {
                reason: format!("must be between 1s and 24h, got {:?}", duration),
            });
        }
        let manager = self.manager().ok_or(DelegationError::ManagerUnavailable)?;
        let jobs = manager
            .job_scheduler()
            .ok_or(DelegationError::Scheduler(CronError::Unavailable))?;

        let delay = chrono::Duration::from_std(duration).map_err(|e| {
            DelegationError::InvalidDuration {
                reason: e.to_string(),
            }
        })?;
        let wake_at = Utc::now() + delay;
        let message = match message.trim() {
            "" => DEFAULT_SLEEP_MESSAGE,
            m => m,
        };

        let mut job = TimerJob::one_shot(
            format!("sleep-{}-{}", self.id, random_hex8()),
            wake_at,
            message,
        )
        .with_wake_session(self.session_key.as_str());
        job.direct_wake = true;
        let job = jobs.add_job(job).await?;

        tracing::info!(
            thread_id = %self.id,
            job_id = %job.id,
            wake_at = %wake_at,
            "Thread sleeping"
        );
        self.set_suppress_sink();
        Ok(wake_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> ChildCompletionSink {
        ChildCompletionSink {
            manager: WeakManager::default(),
            parent_key: "main".to_string(),
            child_key: "main:thread:0badf00d".to_string(),
        }
    }

    #[test]
    fn test_report_format() {
        let s = sink();
        assert_eq!(
            s.report("  all done "),
            "[Child thread main:thread:0badf00d completed]\nall done"
        );
        assert_eq!(
            s.report("[Error] provider error: boom"),
            "[Child thread main:thread:0badf00d failed]\n[Error] provider error: boom"
        );
        assert_eq!(
            s.report(""),
            "[Child thread main:thread:0badf00d completed]\n(no output)"
        );
    }

    #[tokio::test]
    async fn test_send_without_manager_fails() {
        assert!(sink().send("x").await.is_err());
    }
}
