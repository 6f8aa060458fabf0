//! Thread registry and the dispatch loop.
//!
//! The loop sleeps on a coalesced [`Notify`]. Every wake raises it; every
//! finished turn raises it again if the thread still has work. On each signal
//! the loop scans all threads and starts a turn for every idle thread with a
//! non-empty inbox. Turns wait for a permit from a shared semaphore, so at
//! most `max_concurrency` model calls are in flight across all sessions.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::{PersonaRegistry, SkillRegistry};
use crate::config::ThreadSettings;
use crate::cron::ThreadWaker;
use crate::llm::LlmProvider;
use crate::session::{DEFAULT_SESSION_KEY, SessionStore};
use crate::thread::JobScheduler;
use crate::thread::metrics::ThreadInfo;
use crate::thread::turn::{ContextPressureHook, TurnHook};
use crate::thread::unit::Thread;
use crate::thread::wake::{Sink, WakeMessage, WakeSource};
use crate::tools::ToolRegistry;

/// Resolves the fallback sink for a session key.
pub type SinkResolver = Arc<dyn Fn(&str) -> Option<Sink> + Send + Sync>;

/// Resolves the initial persona for a session key.
pub type AgentResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Collaborators shared by every thread.
pub struct ThreadDeps {
    pub llm: Arc<dyn LlmProvider>,
    /// Shared tools; each thread clones this and adds its own bound tools.
    pub tools: ToolRegistry,
    pub personas: PersonaRegistry,
    pub skills: SkillRegistry,
    /// `None` runs every session without persistence.
    pub sessions: Option<Arc<dyn SessionStore>>,
    pub settings: ThreadSettings,
    pub hooks: Vec<Arc<dyn TurnHook>>,
    pub default_sink_for: Option<SinkResolver>,
    pub default_agent_for: Option<AgentResolver>,
}

impl ThreadDeps {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            tools: ToolRegistry::new(),
            personas: PersonaRegistry::builtin(),
            skills: SkillRegistry::empty(),
            sessions: None,
            settings: ThreadSettings::default(),
            hooks: vec![Arc::new(ContextPressureHook)],
            default_sink_for: None,
            default_agent_for: None,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_personas(mut self, personas: PersonaRegistry) -> Self {
        self.personas = personas;
        self
    }

    pub fn with_skills(mut self, skills: SkillRegistry) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_settings(mut self, mut settings: ThreadSettings) -> Self {
        settings.normalize();
        self.settings = settings;
        self
    }

    /// Add a pre-turn hook after the built-in ones.
    pub fn with_hook(mut self, hook: Arc<dyn TurnHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_default_sink_for(mut self, resolver: SinkResolver) -> Self {
        self.default_sink_for = Some(resolver);
        self
    }

    pub fn with_default_agent_for(mut self, resolver: AgentResolver) -> Self {
        self.default_agent_for = Some(resolver);
        self
    }
}

struct Shared {
    deps: Arc<ThreadDeps>,
    threads: Mutex<HashMap<String, Arc<Thread>>>,
    work: Notify,
    jobs: OnceLock<Arc<dyn JobScheduler>>,
}

/// Owns every thread and schedules their turns.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<Shared>,
}

/// Non-owning manager handle held by threads, sinks, and the cron waker.
#[derive(Clone, Default)]
pub(crate) struct WeakManager(Weak<Shared>);

impl WeakManager {
    pub(crate) fn upgrade(&self) -> Option<Manager> {
        self.0.upgrade().map(|shared| Manager { shared })
    }
}

fn normalize_key(session_key: &str) -> &str {
    match session_key.trim() {
        "" => DEFAULT_SESSION_KEY,
        key => key,
    }
}

impl Manager {
    pub fn new(deps: ThreadDeps) -> Self {
        Self {
            shared: Arc::new(Shared {
                deps: Arc::new(deps),
                threads: Mutex::new(HashMap::new()),
                work: Notify::new(),
                jobs: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.shared))
    }

    pub fn settings(&self) -> &ThreadSettings {
        &self.shared.deps.settings
    }

    /// Install the timer backend used by `sleep_thread` and `manage_cron`.
    ///
    /// Only the first call takes effect.
    pub fn set_job_scheduler(&self, jobs: Arc<dyn JobScheduler>) {
        if self.shared.jobs.set(jobs).is_err() {
            tracing::warn!("Job scheduler already set; ignoring");
        }
    }

    pub fn job_scheduler(&self) -> Option<Arc<dyn JobScheduler>> {
        self.shared.jobs.get().cloned()
    }

    /// A waker for the cron scheduler that does not keep the manager alive.
    pub fn waker(&self) -> Arc<dyn ThreadWaker> {
        Arc::new(ManagerWaker(self.downgrade()))
    }

    /// Queue `msg` on the session's thread, creating the thread if needed.
    ///
    /// Waits while the thread's inbox is full.
    pub async fn wake(&self, session_key: &str, msg: WakeMessage) {
        let thread = self.get_or_create(session_key, msg.agent.as_deref()).await;
        tracing::debug!(
            thread_id = %thread.id(),
            session_key = %thread.session_key(),
            source = %msg.source,
            "Wake"
        );
        thread.enqueue(msg).await;
        self.shared.work.notify_one();
    }

    /// Wake with a plain message: no sink, persona, or vars override.
    pub async fn wake_with(&self, session_key: &str, source: WakeSource, message: &str) {
        self.wake(session_key, WakeMessage::new(source, message))
            .await;
    }

    /// Return the session's thread, creating it with `agent` if it does not
    /// exist yet. `agent` is ignored for existing threads.
    pub async fn get_or_create(&self, session_key: &str, agent: Option<&str>) -> Arc<Thread> {
        let key = normalize_key(session_key);
        let mut threads = self.shared.threads.lock().await;
        if let Some(thread) = threads.get(key) {
            return Arc::clone(thread);
        }

        let deps = &self.shared.deps;
        let fallback = match agent {
            Some(_) => None,
            None => deps.default_agent_for.as_ref().and_then(|f| f(key)),
        };
        let thread = Thread::new(
            key,
            agent.or(fallback.as_deref()),
            Arc::clone(deps),
            self.downgrade(),
        );
        tracing::info!(thread_id = %thread.id(), session_key = key, "Created thread");
        threads.insert(key.to_string(), Arc::clone(&thread));
        thread
    }

    /// Look up an existing thread.
    pub async fn thread(&self, session_key: &str) -> Option<Arc<Thread>> {
        let key = normalize_key(session_key);
        self.shared.threads.lock().await.get(key).cloned()
    }

    /// Snapshot every thread, sorted by session key.
    pub async fn list_threads(&self) -> Vec<ThreadInfo> {
        let threads: Vec<Arc<Thread>> =
            self.shared.threads.lock().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(threads.len());
        for thread in threads {
            infos.push(thread.info().await);
        }
        infos.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        infos
    }

    // Long-idle threads are never collected; a GC pass would drop idle
    // threads with empty inboxes from the map after a TTL.

    /// Run the dispatch loop until `cancel` fires.
    ///
    /// In-flight turns observe the same token; the loop waits for them to
    /// wind down before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.shared.deps.settings.max_concurrency));
        let mut turns: JoinSet<()> = JoinSet::new();
        tracing::info!(
            max_concurrency = self.shared.deps.settings.max_concurrency,
            "Thread manager started"
        );

        loop {
            self.dispatch_ready(&mut turns, &permits, &cancel).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shared.work.notified() => {}
                Some(joined) = turns.join_next(), if !turns.is_empty() => log_join(joined),
            }
        }

        tracing::info!(in_flight = turns.len(), "Thread manager stopping");
        while let Some(joined) = turns.join_next().await {
            log_join(joined);
        }
    }

    async fn dispatch_ready(
        &self,
        turns: &mut JoinSet<()>,
        permits: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) {
        let threads = self.shared.threads.lock().await;
        for thread in threads.values() {
            if thread.is_running() || thread.inbox.is_empty().await || !thread.try_start() {
                continue;
            }

            let guard = RunningGuard {
                thread: Arc::clone(thread),
                shared: Arc::clone(&self.shared),
                released: false,
            };
            let permits = Arc::clone(permits);
            let cancel = cancel.clone();
            turns.spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                guard.thread.run_once(&cancel).await;
                drop(permit);
                guard.release().await;
            });
        }
    }
}

/// Returns a thread to Idle when its turn task ends, including by panic.
struct RunningGuard {
    thread: Arc<Thread>,
    shared: Arc<Shared>,
    released: bool,
}

impl RunningGuard {
    async fn release(mut self) {
        self.released = true;
        self.thread.finish();
        if !self.thread.inbox.is_empty().await {
            self.shared.work.notify_one();
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if !self.released {
            self.thread.finish();
            self.shared.work.notify_one();
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!("Turn task panicked: {}", e);
        }
    }
}

struct ManagerWaker(WeakManager);

#[async_trait]
impl ThreadWaker for ManagerWaker {
    async fn wake(&self, session_key: &str, msg: WakeMessage) {
        match self.0.upgrade() {
            Some(manager) => manager.wake(session_key, msg).await,
            None => tracing::debug!(session_key, "Manager gone, dropping timer wake"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    fn manager() -> Manager {
        Manager::new(ThreadDeps::new(Arc::new(ScriptedProvider::new())))
    }

    #[tokio::test]
    async fn test_blank_key_maps_to_main_and_threads_are_reused() {
        let m = manager();
        let a = m.get_or_create("  ", None).await;
        let b = m.get_or_create("main", Some("ignored")).await;
        assert_eq!(a.session_key(), "main");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.agent().await, "soul");
    }

    #[tokio::test]
    async fn test_wake_queues_without_running() {
        let m = manager();
        m.wake_with("b", WakeSource::Cli, "one").await;
        m.wake_with("a", WakeSource::Cli, "two").await;

        let infos = m.list_threads().await;
        let keys: Vec<_> = infos.iter().map(|i| i.session_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(infos.iter().all(|i| i.pending == 1));
        assert!(infos.iter().all(|i| i.state == crate::thread::ThreadState::Idle));
    }

    #[tokio::test]
    async fn test_default_agent_resolver_applies_to_new_threads() {
        let deps = ThreadDeps::new(Arc::new(ScriptedProvider::new()))
            .with_default_agent_for(Arc::new(|key: &str| {
                key.starts_with("ops:").then(|| "soul".to_string())
            }));
        let m = Manager::new(deps);
        let t = m.get_or_create("ops:1", None).await;
        assert_eq!(t.agent().await, "soul");
    }

    #[tokio::test]
    async fn test_job_scheduler_absent_by_default() {
        assert!(manager().job_scheduler().is_none());
    }
}
