//! In-memory doubles for the provider, timer, channel, and session seams.
//!
//! Public so integration tests under `tests/` can drive a full manager
//! without network or disk.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
use crate::cron::TimerJob;
use crate::error::{ChannelError, CronError, LlmError, SessionError};
use crate::llm::{
    FinishReason, LlmProvider, ToolCall, ToolCompletionRequest, ToolCompletionResponse,
};
use crate::session::{Session, SessionStore};
use crate::thread::{Deliver, JobScheduler, Sink};

/// Reply used once the script runs out.
pub const DEFAULT_REPLY: &str = "ok";

#[derive(Debug, Clone)]
enum Step {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    Error(String),
}

/// A provider that replays a fixed script of responses.
///
/// Every request is recorded. When the script is exhausted the provider
/// answers [`DEFAULT_REPLY`].
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ToolCompletionRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.push(Step::Text(text.into()))
    }

    pub fn then_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        self.push(Step::ToolCalls(calls))
    }

    pub fn then_error(self, reason: impl Into<String>) -> Self {
        self.push(Step::Error(reason.into()))
    }

    /// Hold every call open for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<ToolCompletionRequest> {
        lock(&self.requests).clone()
    }

    /// Highest number of calls that were in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn push(self, step: Step) -> Self {
        lock(&self.script).push_back(step);
        self
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete_with_tools(
        &self,
        req: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak.fetch_max(now, Ordering::SeqCst);

        lock(&self.requests).push(req);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let step = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Step::Text(DEFAULT_REPLY.to_string()));
        match step {
            Step::Text(text) => Ok(ToolCompletionResponse {
                content: Some(text),
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
                input_tokens: 0,
                output_tokens: 0,
            }),
            Step::ToolCalls(calls) => Ok(ToolCompletionResponse {
                content: None,
                tool_calls: calls,
                finish_reason: FinishReason::ToolUse,
                input_tokens: 0,
                output_tokens: 0,
            }),
            Step::Error(reason) => Err(LlmError::RequestFailed {
                provider: "scripted".to_string(),
                reason,
            }),
        }
    }
}

/// A job scheduler that only records what it is asked to do.
#[derive(Debug, Default)]
pub struct RecordingJobs {
    jobs: Mutex<Vec<TimerJob>>,
}

impl RecordingJobs {
    pub fn jobs(&self) -> Vec<TimerJob> {
        lock(&self.jobs).clone()
    }
}

#[async_trait]
impl JobScheduler for RecordingJobs {
    async fn add_job(&self, job: TimerJob) -> Result<TimerJob, CronError> {
        let job = job.normalize();
        let mut jobs = lock(&self.jobs);
        if jobs.iter().any(|j| j.id == job.id) {
            return Err(CronError::Duplicate { id: job.id });
        }
        jobs.push(job.clone());
        Ok(job)
    }

    async fn remove_job(&self, id: &str) -> Result<(), CronError> {
        let mut jobs = lock(&self.jobs);
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Err(CronError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn list_jobs(&self) -> Vec<TimerJob> {
        self.jobs()
    }
}

/// A channel fed by [`push`](MemoryChannel::push) that records what it sends.
pub struct MemoryChannel {
    name: String,
    tx: mpsc::Sender<IncomingMessage>,
    rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(Some(rx)),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Inject an incoming message.
    pub async fn push(&self, msg: IncomingMessage) {
        if self.tx.send(msg).await.is_err() {
            tracing::debug!(channel = %self.name, "Memory channel stream dropped");
        }
    }

    /// `(user_id, content)` pairs delivered so far.
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let rx = lock(&self.rx)
            .take()
            .ok_or_else(|| ChannelError::StartupFailed {
                name: self.name.clone(),
                reason: "already started".to_string(),
            })?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        lock(&self.sent).push((msg.user_id.clone(), response.content));
        Ok(())
    }

    async fn broadcast(
        &self,
        user_id: &str,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        lock(&self.sent).push((user_id.to_string(), response.content));
        Ok(())
    }
}

/// Session store kept in a map.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    saves: AtomicUsize,
    fail_reloads: AtomicBool,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last saved state of `key`, if any.
    pub fn get(&self, key: &str) -> Option<Session> {
        lock(&self.sessions).get(key).cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Change a stored session behind the back of any running turn, the way
    /// another process editing the transcript would.
    pub fn edit(&self, key: &str, update: impl FnOnce(&mut Session)) {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key));
        update(session);
    }

    /// Make every following reload fail until switched off again.
    pub fn fail_reloads(&self, fail: bool) {
        self.fail_reloads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn reload(&self, key: &str) -> Result<Session, SessionError> {
        if self.fail_reloads.load(Ordering::SeqCst) {
            return Err(SessionError::Unavailable("reloads switched off".to_string()));
        }
        Ok(self.get(key).unwrap_or_else(|| Session::new(key)))
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        lock(&self.sessions).insert(session.key.clone(), session.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A delivery target that collects every response.
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<String>>,
    notify: Notify,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink delivering into `self`.
    pub fn sink(self: &Arc<Self>, label: impl Into<String>) -> Sink {
        Sink::new(label, Arc::clone(self) as Arc<dyn Deliver>)
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }

    /// Wait until at least `n` responses arrived or `timeout` passes, then
    /// return what was collected.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let current = self.messages();
            if current.len() >= n {
                return current;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.messages();
            }
        }
    }
}

#[async_trait]
impl Deliver for CollectingSink {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        lock(&self.messages).push(text.to_string());
        self.notify.notify_waiters();
        Ok(())
    }

    fn accepts_empty(&self) -> bool {
        true
    }
}
