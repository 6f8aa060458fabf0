//! Durable timer and cron scheduler.
//!
//! Jobs come from two places. Store jobs live in the JSONL file and are
//! persisted on every change. Seed jobs come from configuration, are scheduled
//! on every load, and are never written; a store job with the same id wins.
//!
//! Every scheduled job runs in its own task holding a child of the
//! scheduler's root [`CancellationToken`], so `load` and `stop` can tear
//! registrations down without tracking join handles.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CronConfig;
use crate::cron::job::{JobKind, StoredCheck, TimerJob};
use crate::cron::store;
use crate::error::CronError;
use crate::session::DEFAULT_SESSION_KEY;
use crate::thread::{JobScheduler, Sink, WakeMessage, WakeSource};

/// Delivers scheduled wakes to sessions.
#[async_trait]
pub trait ThreadWaker: Send + Sync {
    async fn wake(&self, session_key: &str, msg: WakeMessage);
}

/// Optional fields for [`CronScheduler::add`] and [`CronScheduler::add_at`].
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub agent: Option<String>,
    /// Session to wake; blank means the default session.
    pub wake_session: String,
    pub silent: bool,
    pub direct_wake: bool,
}

impl JobOptions {
    fn apply(self, mut job: TimerJob) -> TimerJob {
        job.agent = self.agent;
        job.wake_session = self.wake_session;
        job.silent = self.silent;
        job.direct_wake = self.direct_wake;
        job
    }
}

#[derive(Default)]
struct CronState {
    /// Store-sourced jobs, keyed by id.
    jobs: HashMap<String, TimerJob>,
    /// Live registrations for store and seed jobs.
    registrations: HashMap<String, CancellationToken>,
}

/// Schedules timer jobs and wakes their target sessions when they fire.
pub struct CronScheduler {
    store_path: PathBuf,
    seeds: Vec<TimerJob>,
    waker: Arc<dyn ThreadWaker>,
    state: Mutex<CronState>,
    root: CancellationToken,
    me: Weak<CronScheduler>,
}

impl CronScheduler {
    /// Create a scheduler. Nothing is scheduled until [`load`](Self::load).
    pub fn new(config: &CronConfig, waker: Arc<dyn ThreadWaker>) -> Arc<Self> {
        let seeds = config
            .seeds
            .iter()
            .cloned()
            .map(TimerJob::normalize)
            .collect();
        Arc::new_cyclic(|me| Self {
            store_path: config.store_path.clone(),
            seeds,
            waker,
            state: Mutex::new(CronState::default()),
            root: CancellationToken::new(),
            me: me.clone(),
        })
    }

    /// Re-read the store and reschedule everything.
    ///
    /// Invalid entries are dropped. Enabled one-shot jobs whose time has
    /// passed are dropped and the store is rewritten without them, unless
    /// they were still armed when the reload started: those were due but had
    /// not fired yet, so they are rescheduled and fire at once.
    pub async fn load(&self) -> Result<(), CronError> {
        let raw = store::read_jobs(&self.store_path)?;
        let now = Utc::now();

        let mut state = self.state.lock().await;
        let previous = std::mem::take(&mut state.jobs);
        let mut armed = HashSet::new();
        for (id, token) in state.registrations.drain() {
            if !token.is_cancelled() {
                armed.insert(id);
            }
            token.cancel();
        }

        let mut dirty = false;
        for job in raw {
            let job = job.normalize();
            match job.check_stored(now) {
                StoredCheck::Keep => {}
                StoredCheck::Invalid => {
                    tracing::warn!(id = %job.id, "Dropping invalid timer job");
                    continue;
                }
                StoredCheck::Expired if still_pending(&job, &previous, &armed) => {
                    tracing::info!(id = %job.id, "One-shot job came due during reload");
                }
                StoredCheck::Expired => {
                    tracing::info!(id = %job.id, "Pruning expired one-shot job");
                    dirty = true;
                    continue;
                }
            }
            if state.jobs.contains_key(&job.id) {
                tracing::warn!(id = %job.id, "Dropping duplicate timer job");
                dirty = true;
                continue;
            }
            state.jobs.insert(job.id.clone(), job);
        }

        let store_jobs: Vec<TimerJob> = state.jobs.values().cloned().collect();
        for job in &store_jobs {
            if job.enabled {
                self.register(&mut state, job);
            }
        }

        let mut seeded = 0;
        for seed in &self.seeds {
            if state.jobs.contains_key(&seed.id) {
                tracing::debug!(id = %seed.id, "Store job overrides seed");
                continue;
            }
            if let Err(e) = seed.validate_schedule() {
                tracing::warn!(id = %seed.id, "Skipping invalid seed job: {}", e);
                continue;
            }
            if seed.check_stored(now) == StoredCheck::Expired {
                tracing::debug!(id = %seed.id, "Skipping past one-shot seed");
                continue;
            }
            if seed.enabled {
                self.register(&mut state, seed);
                seeded += 1;
            }
        }

        if dirty {
            self.persist(&state)?;
        }

        tracing::info!(
            jobs = state.jobs.len(),
            seeds = seeded,
            "Loaded timer jobs from {}",
            self.store_path.display()
        );
        Ok(())
    }

    /// Add a recurring job.
    pub async fn add(
        &self,
        id: &str,
        expr: &str,
        task: &str,
        options: JobOptions,
    ) -> Result<TimerJob, CronError> {
        self.insert(options.apply(TimerJob::recurring(id, expr, task)))
            .await
    }

    /// Add a one-shot job firing at `at`.
    pub async fn add_at(
        &self,
        id: &str,
        at: DateTime<Utc>,
        task: &str,
        options: JobOptions,
    ) -> Result<TimerJob, CronError> {
        self.insert(options.apply(TimerJob::one_shot(id, at, task)))
            .await
    }

    /// Validate, schedule, and persist a job. Nothing changes if persisting fails.
    pub async fn insert(&self, job: TimerJob) -> Result<TimerJob, CronError> {
        let job = job.normalize();
        let mut state = self.state.lock().await;
        job.validate_new(&state.jobs, Utc::now())?;

        state.jobs.insert(job.id.clone(), job.clone());
        if job.enabled {
            self.register(&mut state, &job);
        }

        if let Err(e) = self.persist(&state) {
            state.jobs.remove(&job.id);
            if let Some(token) = state.registrations.remove(&job.id) {
                token.cancel();
            }
            self.restore_seed(&mut state, &job.id);
            return Err(e);
        }

        tracing::info!(id = %job.id, kind = %job.kind, "Added timer job");
        Ok(job)
    }

    /// Remove a store job.
    pub async fn remove(&self, id: &str) -> Result<(), CronError> {
        let id = id.trim();
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.remove(id) else {
            return Err(CronError::NotFound { id: id.to_string() });
        };

        if let Err(e) = self.persist(&state) {
            state.jobs.insert(job.id.clone(), job);
            return Err(e);
        }

        if let Some(token) = state.registrations.remove(id) {
            token.cancel();
        }
        self.restore_seed(&mut state, id);
        tracing::info!(id = %id, "Removed timer job");
        Ok(())
    }

    /// Store jobs, sorted by id.
    pub async fn list(&self) -> Vec<TimerJob> {
        let state = self.state.lock().await;
        let mut jobs: Vec<TimerJob> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Configured seed jobs.
    pub fn seeds(&self) -> &[TimerJob] {
        &self.seeds
    }

    /// Cancel every registration. The scheduler does not fire again.
    pub fn stop(&self) {
        self.root.cancel();
    }

    /// Reload the store every `interval` until `cancel` fires.
    pub fn spawn_reload_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = scheduler.load().await {
                    tracing::warn!("Failed to reload timer jobs: {}", e);
                }
            }
        })
    }

    fn persist(&self, state: &CronState) -> Result<(), CronError> {
        let jobs: Vec<TimerJob> = state.jobs.values().cloned().collect();
        store::write_jobs(&self.store_path, &jobs)
    }

    fn restore_seed(&self, state: &mut CronState, id: &str) {
        if let Some(seed) = self.seeds.iter().find(|s| s.id == id && s.enabled) {
            let seed = seed.clone();
            self.register(state, &seed);
        }
    }

    fn register(&self, state: &mut CronState, job: &TimerJob) {
        let token = self.root.child_token();
        if let Some(old) = state.registrations.insert(job.id.clone(), token.clone()) {
            old.cancel();
        }
        tokio::spawn(run_registration(
            job.clone(),
            Arc::clone(&self.waker),
            self.me.clone(),
            token,
        ));
    }

    /// Consume a due one-shot job before it fires.
    ///
    /// Returns false when a reload or removal already replaced this
    /// registration; the caller must not fire.
    async fn claim_one_shot(&self, id: &str, token: &CancellationToken) -> bool {
        let mut state = self.state.lock().await;
        if token.is_cancelled() {
            return false;
        }
        state.registrations.remove(id);
        if state.jobs.remove(id).is_some() {
            if let Err(e) = self.persist(&state) {
                tracing::warn!(id = %id, "Failed to persist after one-shot fired: {}", e);
            }
        }
        true
    }
}

#[async_trait]
impl JobScheduler for CronScheduler {
    async fn add_job(&self, job: TimerJob) -> Result<TimerJob, CronError> {
        self.insert(job).await
    }

    async fn remove_job(&self, id: &str) -> Result<(), CronError> {
        self.remove(id).await
    }

    async fn list_jobs(&self) -> Vec<TimerJob> {
        self.list().await
    }
}

async fn run_registration(
    job: TimerJob,
    waker: Arc<dyn ThreadWaker>,
    scheduler: Weak<CronScheduler>,
    token: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let next = match job.kind {
            JobKind::At => job.at_time,
            JobKind::Cron => job.next_fire_after(now),
        };
        let Some(next) = next else {
            tracing::warn!(id = %job.id, "Timer job has no upcoming fire time");
            return;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let one_shot = job.kind == JobKind::At;
        if one_shot {
            let Some(scheduler) = scheduler.upgrade() else {
                return;
            };
            if !scheduler.claim_one_shot(&job.id, &token).await {
                return;
            }
        }

        let (session_key, msg) = wake_for(&job);
        tracing::info!(id = %job.id, session = %session_key, "Timer job fired");
        waker.wake(&session_key, msg).await;

        if one_shot {
            return;
        }
    }
}

/// An expired one-shot that was loaded before, is unchanged, and still had an
/// armed registration has not fired yet.
fn still_pending(
    job: &TimerJob,
    previous: &HashMap<String, TimerJob>,
    armed: &HashSet<String>,
) -> bool {
    armed.contains(&job.id)
        && previous
            .get(&job.id)
            .is_some_and(|p| p.kind == JobKind::At && p.at_time == job.at_time)
}

/// The session and wake message a job produces when it fires.
pub fn wake_for(job: &TimerJob) -> (String, WakeMessage) {
    let source = if job.direct_wake {
        WakeSource::SleepCompleted
    } else {
        WakeSource::Cron
    };
    let mut msg = WakeMessage::new(source, job.task.clone());
    if let Some(agent) = &job.agent {
        msg = msg.with_agent(agent.clone());
    }
    if job.silent {
        msg = msg.with_sink(Sink::zero());
    }
    let session = match job.wake_session.trim() {
        "" => DEFAULT_SESSION_KEY.to_string(),
        s => s.to_string(),
    };
    (session, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct ChannelWaker(mpsc::UnboundedSender<(String, WakeMessage)>);

    #[async_trait]
    impl ThreadWaker for ChannelWaker {
        async fn wake(&self, session_key: &str, msg: WakeMessage) {
            let _ = self.0.send((session_key.to_string(), msg));
        }
    }

    fn scheduler_with(
        dir: &std::path::Path,
        seeds: Vec<TimerJob>,
    ) -> (Arc<CronScheduler>, mpsc::UnboundedReceiver<(String, WakeMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = CronConfig::new(dir.join("cron.jsonl")).with_seeds(seeds);
        (CronScheduler::new(&config, Arc::new(ChannelWaker(tx))), rx)
    }

    #[tokio::test]
    async fn test_load_prunes_expired_one_shots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.jsonl");
        let past = TimerJob::one_shot("old", Utc::now() - chrono::Duration::hours(1), "late");
        let mut disabled_past =
            TimerJob::one_shot("kept", Utc::now() - chrono::Duration::hours(1), "off");
        disabled_past.enabled = false;
        let daily = TimerJob::recurring("daily", "0 9 * * *", "brief");
        store::write_jobs(&path, &[past, disabled_past, daily]).unwrap();

        let (scheduler, _rx) = scheduler_with(dir.path(), vec![]);
        scheduler.load().await.unwrap();

        let ids: Vec<String> = scheduler.list().await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["daily".to_string(), "kept".to_string()]);

        let on_disk: Vec<String> = store::read_jobs(&path)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(on_disk, ids);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_seed_skipped_when_store_has_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.jsonl");
        store::write_jobs(&path, &[TimerJob::recurring("heartbeat", "0 * * * *", "mine")])
            .unwrap();

        let seed = TimerJob::recurring("heartbeat", "*/30 * * * *", "seed");
        let other_seed = TimerJob::recurring("tidyup", "0 4 * * *", "tidy");
        let (scheduler, _rx) = scheduler_with(dir.path(), vec![seed, other_seed]);
        scheduler.load().await.unwrap();

        let state = scheduler.state.lock().await;
        assert_eq!(state.jobs["heartbeat"].task, "mine");
        assert!(state.registrations.contains_key("tidyup"));
        assert!(!state.jobs.contains_key("tidyup"));
        drop(state);

        // Seeds are never written to the store.
        let on_disk = store::read_jobs(&path).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(scheduler.seeds().len(), 2);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_add_validation_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _rx) = scheduler_with(dir.path(), vec![]);
        scheduler.load().await.unwrap();

        scheduler
            .add("daily", "0 9 * * *", "brief", JobOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            scheduler
                .add("daily", "0 9 * * *", "again", JobOptions::default())
                .await,
            Err(CronError::Duplicate { .. })
        ));
        assert!(matches!(
            scheduler
                .add("bad", "whenever", "x", JobOptions::default())
                .await,
            Err(CronError::InvalidExpression { .. })
        ));
        assert!(matches!(
            scheduler
                .add_at(
                    "late",
                    Utc::now() - chrono::Duration::seconds(5),
                    "x",
                    JobOptions::default()
                )
                .await,
            Err(CronError::AtTimeInPast)
        ));

        assert!(matches!(
            scheduler.remove("ghost").await,
            Err(CronError::NotFound { .. })
        ));
        scheduler.remove("daily").await.unwrap();
        assert!(scheduler.list().await.is_empty());
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_add_at_fires_once_and_removes_itself() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, mut rx) = scheduler_with(dir.path(), vec![]);
        scheduler.load().await.unwrap();

        let options = JobOptions {
            wake_session: "telegram:42".to_string(),
            direct_wake: true,
            ..JobOptions::default()
        };
        scheduler
            .add_at(
                "nap",
                Utc::now() + chrono::Duration::milliseconds(200),
                "wake up",
                options,
            )
            .await
            .unwrap();
        assert_eq!(scheduler.list().await.len(), 1);

        let (session, msg) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session, "telegram:42");
        assert_eq!(msg.source, WakeSource::SleepCompleted);
        assert_eq!(msg.message, "wake up");

        for _ in 0..50 {
            if scheduler.list().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(scheduler.list().await.is_empty());
        assert!(store::read_jobs(&dir.path().join("cron.jsonl")).unwrap().is_empty());
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_reload_fires_one_shot_that_came_due_while_armed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.jsonl");
        let at = Utc::now() - chrono::Duration::milliseconds(5);
        let due = TimerJob::one_shot("due", at, "fire me");
        let stale = TimerJob::one_shot("stale", at, "too late");
        store::write_jobs(&path, &[due.clone(), stale]).unwrap();

        let (scheduler, mut rx) = scheduler_with(dir.path(), vec![]);
        {
            // Left behind by an earlier load whose timer task has not run yet.
            let mut state = scheduler.state.lock().await;
            state.jobs.insert(due.id.clone(), due.clone());
            let token = scheduler.root.child_token();
            state.registrations.insert(due.id.clone(), token);
        }
        scheduler.load().await.unwrap();

        let (_, msg) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.message, "fire me");

        for _ in 0..50 {
            if scheduler.list().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(scheduler.list().await.is_empty());
        assert!(store::read_jobs(&path).unwrap().is_empty());

        // Fired exactly once; the unarmed expired job never fires.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_insert_rolls_back_when_persist_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.jsonl");
        let seed = TimerJob::recurring("heartbeat", "*/30 * * * *", "seed");
        let (scheduler, _rx) = scheduler_with(dir.path(), vec![seed]);
        scheduler.load().await.unwrap();
        scheduler
            .add("daily", "0 9 * * *", "brief", JobOptions::default())
            .await
            .unwrap();

        // A directory where the store file should be makes the rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = scheduler
            .add("nightly", "0 22 * * *", "wind down", JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::PersistFailed { .. }));
        let err = scheduler
            .add("heartbeat", "0 * * * *", "mine", JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::PersistFailed { .. }));

        let ids: Vec<String> = scheduler.list().await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["daily".to_string()]);

        let state = scheduler.state.lock().await;
        let mut armed: Vec<&str> = state.registrations.keys().map(String::as_str).collect();
        armed.sort();
        // The seed the failed insert tried to override is scheduled again.
        assert_eq!(armed, vec!["daily", "heartbeat"]);
        drop(state);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_past_one_shot_seed_is_not_scheduled() {
        let dir = tempfile::tempdir().unwrap();
        let past = TimerJob::one_shot("launch", Utc::now() - chrono::Duration::hours(1), "go");
        let (scheduler, mut rx) = scheduler_with(dir.path(), vec![past]);
        scheduler.load().await.unwrap();

        assert!(scheduler.state.lock().await.registrations.is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        scheduler.stop();
    }

    #[test]
    fn test_wake_for_silent_job_uses_zero_sink() {
        let mut job = TimerJob::recurring("hb", "*/30 * * * *", "heartbeat");
        job.silent = true;
        job.agent = Some("heartbeat".into());
        let (session, msg) = wake_for(&job);
        assert_eq!(session, "main");
        assert_eq!(msg.source, WakeSource::Cron);
        assert_eq!(msg.agent.as_deref(), Some("heartbeat"));
        assert!(msg.sink.as_ref().is_some_and(Sink::is_zero));
    }
}
