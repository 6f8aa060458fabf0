//! A session-bound execution unit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::Persona;
use crate::error::TurnError;
use crate::thread::inbox::Inbox;
use crate::thread::manager::{Manager, ThreadDeps, WeakManager};
use crate::thread::metrics::{ExecMetrics, ThreadInfo, ThreadState};
use crate::thread::wake::{Sink, WakeMessage, build_wake_payload};
use crate::tools::ToolRegistry;
use crate::tools::builtin::thread_tools;

pub(super) struct ThreadStatus {
    pub(super) persona: Persona,
    pub(super) last_active_at: Option<DateTime<Utc>>,
    /// Present only while a turn is in flight.
    pub(super) metrics: Option<Arc<Mutex<ExecMetrics>>>,
}

/// One thread per session key. At most one turn runs at a time; the manager
/// enforces that through [`Thread::try_start`].
pub struct Thread {
    pub(super) id: String,
    pub(super) session_key: String,
    pub(super) inbox: Inbox,
    pub(super) default_sink: Option<Sink>,
    pub(super) deps: Arc<ThreadDeps>,
    pub(super) tools: ToolRegistry,
    pub(super) status: Mutex<ThreadStatus>,
    manager: WeakManager,
    running: AtomicBool,
    suppress_sink: AtomicBool,
}

impl Thread {
    pub(super) fn new(
        session_key: &str,
        agent: Option<&str>,
        deps: Arc<ThreadDeps>,
        manager: WeakManager,
    ) -> Arc<Self> {
        let persona = match agent.map(str::trim).filter(|a| !a.is_empty()) {
            Some(name) => deps.personas.load(name).unwrap_or_else(|| {
                tracing::warn!(agent = name, session_key, "Unknown persona, using default");
                deps.personas.load_default()
            }),
            None => deps.personas.load_default(),
        };
        let default_sink = deps.default_sink_for.as_ref().and_then(|f| f(session_key));

        Arc::new_cyclic(|me: &Weak<Thread>| Thread {
            id: format!("thread-{}", Uuid::new_v4().simple()),
            session_key: session_key.to_string(),
            inbox: Inbox::new(deps.settings.inbox_capacity),
            default_sink,
            tools: deps.tools.clone_with(thread_tools(me.clone())),
            status: Mutex::new(ThreadStatus {
                persona,
                last_active_at: None,
                metrics: None,
            }),
            deps,
            manager,
            running: AtomicBool::new(false),
            suppress_sink: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Name of the active persona.
    pub async fn agent(&self) -> String {
        self.status.lock().await.persona.name().to_string()
    }

    /// The owning manager, if it is still alive.
    pub fn manager(&self) -> Option<Manager> {
        self.manager.upgrade()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Append a wake message, waiting while the inbox is full.
    ///
    /// This does not signal the dispatch loop; go through [`Manager::wake`]
    /// unless the caller signals itself.
    pub async fn enqueue(&self, msg: WakeMessage) {
        self.inbox.push(msg).await;
    }

    pub async fn pending(&self) -> usize {
        self.inbox.len().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Idle -> Running. Returns false if a turn is already in flight.
    pub(super) fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Running -> Idle.
    pub(super) fn finish(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Skip delivery of the current turn's response.
    pub fn set_suppress_sink(&self) {
        self.suppress_sink.store(true, Ordering::Release);
    }

    fn take_suppress_sink(&self) -> bool {
        self.suppress_sink.swap(false, Ordering::AcqRel)
    }

    /// Snapshot for observability.
    pub async fn info(&self) -> ThreadInfo {
        let pending = self.inbox.len().await;
        let (agent, last_active_at, metrics) = {
            let status = self.status.lock().await;
            (
                status.persona.name().to_string(),
                status.last_active_at,
                status.metrics.clone(),
            )
        };
        let metrics = match metrics {
            Some(m) => Some(m.lock().await.clone()),
            None => None,
        };
        ThreadInfo {
            id: self.id.clone(),
            session_key: self.session_key.clone(),
            agent,
            state: if self.is_running() {
                ThreadState::Running
            } else {
                ThreadState::Idle
            },
            pending,
            last_active_at,
            metrics,
        }
    }

    /// Dequeue one (merged) message, run a turn for it, and deliver the result.
    pub async fn run_once(&self, cancel: &CancellationToken) {
        let Some((msg, merged)) = self.inbox.take_merged().await else {
            return;
        };
        if merged > 1 {
            tracing::info!(
                thread_id = %self.id,
                session_key = %self.session_key,
                source = %msg.source,
                merged,
                "Merged wake messages"
            );
        }

        {
            let mut status = self.status.lock().await;
            if let Some(name) = &msg.agent {
                match self.deps.personas.load(name) {
                    Some(persona) => status.persona = persona,
                    None => tracing::warn!(
                        thread_id = %self.id,
                        agent = %name,
                        "Persona not found, keeping current"
                    ),
                }
            }
            for (key, value) in &msg.vars {
                status.persona.set(key.as_str(), value.as_str());
            }
        }

        let sink = msg
            .sink
            .clone()
            .or_else(|| self.default_sink.clone())
            .unwrap_or_default();
        let delivery_label = if sink.is_zero() { "" } else { sink.label.as_str() };
        let payload = build_wake_payload(
            &msg.source,
            &msg.message,
            &self.id,
            &self.session_key,
            delivery_label,
        );

        let response = match self
            .run_turn(&payload, &msg, &sink, delivery_label, cancel)
            .await
        {
            Ok(response) => response,
            Err(TurnError::Cancelled) => {
                tracing::info!(thread_id = %self.id, "Turn cancelled");
                self.take_suppress_sink();
                return;
            }
            Err(e) => {
                tracing::error!(
                    thread_id = %self.id,
                    session_key = %self.session_key,
                    source = %msg.source,
                    "Turn failed: {}",
                    e
                );
                format!("[Error] {}", e)
            }
        };

        self.status.lock().await.last_active_at = Some(Utc::now());

        let suppress = self.take_suppress_sink();
        if suppress || sink.is_zero() {
            return;
        }
        if response.trim().is_empty() && !sink.accepts_empty() {
            return;
        }
        if let Err(e) = sink.send(&response).await {
            tracing::error!(
                thread_id = %self.id,
                session_key = %self.session_key,
                "Sink delivery failed: {}",
                e
            );
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("session_key", &self.session_key)
            .field("running", &self.is_running())
            .finish()
    }
}
