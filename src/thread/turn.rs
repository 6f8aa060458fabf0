//! One turn: build the prompt, run the tool loop, persist the transcript.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::context_monitor::{ContextMonitor, estimate_message_tokens};
use crate::error::TurnError;
use crate::llm::{ChatMessage, Role};
use crate::session::Session;
use crate::thread::metrics::ExecMetrics;
use crate::thread::runner::{Runner, TurnObserver};
use crate::thread::unit::Thread;
use crate::thread::wake::{Sink, WakeMessage, build_wake_payload};

const FALLBACK_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// What a [`TurnHook`] sees before the model is called.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub thread_id: String,
    pub session_key: String,
    pub user_message: String,
    /// Estimated tokens of the stored transcript alone.
    pub session_tokens: usize,
    /// Estimated tokens of the full request, system prompt included.
    pub request_tokens: usize,
    pub context_window_tokens: usize,
    pub context_warn_ratio: f64,
}

/// Runs before every turn and may inject an extra user message.
pub trait TurnHook: Send + Sync {
    fn before_turn(&self, ctx: &TurnContext) -> Option<String>;
}

/// Asks the model to compress its context once the request nears the window.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextPressureHook;

impl TurnHook for ContextPressureHook {
    fn before_turn(&self, ctx: &TurnContext) -> Option<String> {
        let monitor = ContextMonitor::new(ctx.context_window_tokens, ctx.context_warn_ratio);
        if !monitor.exceeds_threshold(ctx.request_tokens) {
            return None;
        }
        tracing::info!(
            thread_id = %ctx.thread_id,
            session_key = %ctx.session_key,
            request_tokens = ctx.request_tokens,
            window = monitor.limit(),
            "Context pressure, asking model to compress"
        );
        Some(format!(
            "[Context Pressure] This conversation uses about {:.0}% of the context window \
             ({} of {} estimated tokens). Before continuing, summarize older context into a \
             short recap and keep further replies concise.",
            monitor.usage_percent(ctx.request_tokens),
            ctx.request_tokens,
            monitor.limit(),
        ))
    }
}

/// Placeholder contents some providers emit instead of real text.
fn is_user_facing(content: &str) -> bool {
    let content = content.trim();
    !content.is_empty() && content != "(tool call)" && content != "(empty assistant message)"
}

/// Collects intermediates, streams them to idempotent sinks, and injects
/// mergeable inbox messages between iterations.
struct TurnRecorder<'a> {
    thread: &'a Thread,
    driver: &'a WakeMessage,
    sink: &'a Sink,
    delivery_label: &'a str,
    intermediates: Vec<ChatMessage>,
}

#[async_trait]
impl TurnObserver for TurnRecorder<'_> {
    async fn on_message(&mut self, msg: &ChatMessage) {
        self.intermediates.push(msg.clone());
        if msg.role == Role::Assistant
            && is_user_facing(&msg.content)
            && !self.sink.is_zero()
            && self.sink.idempotent
        {
            if let Err(e) = self.sink.send(&msg.content).await {
                tracing::warn!(thread_id = %self.thread.id, "Intermediate delivery failed: {}", e);
            }
        }
    }

    async fn on_iteration_end(&mut self) -> Vec<ChatMessage> {
        let mut injected = Vec::new();
        for next in self.thread.inbox.drain_mergeable(self.driver).await {
            let payload = build_wake_payload(
                &next.source,
                &next.message,
                &self.thread.id,
                &self.thread.session_key,
                self.delivery_label,
            );
            if payload.is_empty() {
                continue;
            }
            tracing::info!(
                thread_id = %self.thread.id,
                session_key = %self.thread.session_key,
                source = %next.source,
                "Injected mid-turn message"
            );
            injected.push(ChatMessage::user(payload));
        }
        injected
    }
}

impl Thread {
    fn system_prompt(&self, persona: &crate::agent::Persona) -> String {
        let mut persona = persona.clone();
        persona.set("TIME", Local::now().format("%Y-%m-%d %H:%M:%S %:z (%A)").to_string());
        persona.set("TOOLS", self.tools.names().join(", "));
        persona.set("SKILLS", self.deps.skills.prompt_section());
        persona.set("SESSION", self.session_key.as_str());
        let prompt = persona.render();
        if prompt.trim().is_empty() {
            FALLBACK_SYSTEM_PROMPT.to_string()
        } else {
            prompt
        }
    }

    /// Load the transcript, or `None` when running without persistence.
    async fn load_session(&self) -> Option<Session> {
        let store = self.deps.sessions.as_ref()?;
        match store.reload(&self.session_key).await {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(session_key = %self.session_key, "Failed to load session: {}", e);
                None
            }
        }
    }

    /// Reload, apply `update`, save. Failures are logged and skipped.
    async fn update_session(&self, what: &str, update: impl FnOnce(&mut Session)) {
        let Some(store) = self.deps.sessions.as_ref() else {
            return;
        };
        let mut latest = match store.reload(&self.session_key).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(
                    session_key = %self.session_key,
                    "Skipping {} save, reload failed: {}",
                    what,
                    e
                );
                return;
            }
        };
        update(&mut latest);
        if let Err(e) = store.save(&latest).await {
            tracing::warn!(session_key = %self.session_key, "{} save failed: {}", what, e);
        }
    }

    /// Execute one turn for an already-built wake payload.
    pub(super) async fn run_turn(
        &self,
        user_message: &str,
        driver: &WakeMessage,
        sink: &Sink,
        delivery_label: &str,
        cancel: &CancellationToken,
    ) -> Result<String, TurnError> {
        let user_message = user_message.trim();
        if user_message.is_empty() {
            return Ok(String::new());
        }
        let settings = &self.deps.settings;

        let persona = self.status.lock().await.persona.clone();
        let mut messages = vec![ChatMessage::system(self.system_prompt(&persona))];

        let session = self.load_session().await;
        if let Some(session) = &session {
            messages.extend(session.messages.iter().cloned());
        }

        let mut turn_user = vec![ChatMessage::user(user_message)];
        messages.extend(turn_user.iter().cloned());

        let session_tokens = session
            .as_ref()
            .map(|s| s.messages.iter().map(estimate_message_tokens).sum())
            .unwrap_or(0);
        let request_tokens: usize = messages.iter().map(estimate_message_tokens).sum();
        tracing::debug!(
            thread_id = %self.id,
            session_key = %self.session_key,
            session_tokens,
            request_tokens,
            window = settings.context_window_tokens,
            "Context estimate"
        );

        let hook_ctx = TurnContext {
            thread_id: self.id.clone(),
            session_key: self.session_key.clone(),
            user_message: user_message.to_string(),
            session_tokens,
            request_tokens,
            context_window_tokens: settings.context_window_tokens,
            context_warn_ratio: settings.context_warn_ratio,
        };
        for hook in &self.deps.hooks {
            if let Some(extra) = hook.before_turn(&hook_ctx) {
                let extra = extra.trim();
                if !extra.is_empty() {
                    let msg = ChatMessage::user(extra);
                    messages.push(msg.clone());
                    turn_user.push(msg);
                }
            }
        }

        // Write-ahead so the request survives a crash mid-turn.
        if session.is_some() {
            self.update_session("write-ahead", |s| s.append(turn_user)).await;
        }

        let metrics = Arc::new(Mutex::new(ExecMetrics::start()));
        self.status.lock().await.metrics = Some(Arc::clone(&metrics));

        let mut recorder = TurnRecorder {
            thread: self,
            driver,
            sink,
            delivery_label,
            intermediates: Vec::new(),
        };
        let ctx = crate::tools::ToolContext::new(&self.id, &self.session_key)
            .with_agent(persona.name());
        let result = Runner::new(self.deps.llm.as_ref(), &self.tools, settings.max_tool_iterations)
            .with_metrics(metrics)
            .with_cancel(cancel.clone())
            .run(messages, &ctx, &mut recorder)
            .await;

        self.status.lock().await.metrics = None;
        let response = result?;

        if session.is_some() {
            let intermediates = recorder.intermediates;
            let max = settings.max_session_messages;
            let final_msg = ChatMessage::assistant(response.clone());
            self.update_session("end-of-turn", move |s| {
                s.append(intermediates.into_iter().chain(std::iter::once(final_msg)));
                s.cap(max);
            })
            .await;
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(request_tokens: usize) -> TurnContext {
        TurnContext {
            thread_id: "t".to_string(),
            session_key: "main".to_string(),
            user_message: "hi".to_string(),
            session_tokens: 0,
            request_tokens,
            context_window_tokens: 1000,
            context_warn_ratio: 0.8,
        }
    }

    #[test]
    fn test_pressure_hook_threshold() {
        assert!(ContextPressureHook.before_turn(&ctx(800)).is_none());
        let advisory = ContextPressureHook.before_turn(&ctx(900)).unwrap();
        assert!(advisory.starts_with("[Context Pressure]"));
        assert!(advisory.contains("900 of 1000"));
    }

    #[test]
    fn test_placeholder_content_is_not_user_facing() {
        assert!(!is_user_facing("  "));
        assert!(!is_user_facing("(tool call)"));
        assert!(is_user_facing("Looking that up now."));
    }
}
