//! The tool-calling loop for one turn.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::TurnError;
use crate::llm::{ChatMessage, LlmProvider, ToolCompletionRequest};
use crate::thread::metrics::{ExecMetrics, ToolCallRecord};
use crate::tools::{ToolContext, ToolRegistry};

/// Receives messages produced mid-turn.
#[async_trait]
pub trait TurnObserver: Send {
    /// Called for each assistant tool-call message, tool result, and
    /// injected message, in conversation order.
    async fn on_message(&mut self, msg: &ChatMessage);

    /// Called after each round of tool calls. Returned messages are appended
    /// to the conversation before the next model call.
    async fn on_iteration_end(&mut self) -> Vec<ChatMessage> {
        Vec::new()
    }
}

/// Drives model calls and tool execution until the model answers in text.
pub struct Runner<'a> {
    llm: &'a dyn LlmProvider,
    tools: &'a ToolRegistry,
    max_iterations: usize,
    metrics: Option<Arc<Mutex<ExecMetrics>>>,
    cancel: CancellationToken,
}

impl<'a> Runner<'a> {
    pub fn new(llm: &'a dyn LlmProvider, tools: &'a ToolRegistry, max_iterations: usize) -> Self {
        Self {
            llm,
            tools,
            max_iterations: max_iterations.max(1),
            metrics: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Publish progress into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Mutex<ExecMetrics>>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the loop over `messages` and return the final assistant text.
    pub async fn run(
        &self,
        mut messages: Vec<ChatMessage>,
        ctx: &ToolContext,
        observer: &mut dyn TurnObserver,
    ) -> Result<String, TurnError> {
        let definitions = self.tools.definitions();

        for _ in 0..self.max_iterations {
            if let Some(metrics) = &self.metrics {
                let mut m = metrics.lock().await;
                m.iterations += 1;
                m.current_tool = None;
            }

            let request = ToolCompletionRequest::new(messages.clone(), definitions.clone());
            let response = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TurnError::Cancelled),
                r = self.llm.complete_with_tools(request) => r?,
            };

            if !response.has_tool_calls() {
                return Ok(response.content.unwrap_or_default());
            }

            let assistant = ChatMessage::assistant_with_tool_calls(
                response.content.unwrap_or_default(),
                response.tool_calls.clone(),
            );
            observer.on_message(&assistant).await;
            messages.push(assistant);

            for call in response.tool_calls {
                if self.cancel.is_cancelled() {
                    return Err(TurnError::Cancelled);
                }
                if let Some(metrics) = &self.metrics {
                    metrics.lock().await.current_tool = Some(call.name.clone());
                }

                let start = Instant::now();
                let result = self
                    .tools
                    .run(&call.name, call.arguments.clone(), ctx)
                    .await;
                let elapsed = start.elapsed().as_millis() as u64;
                if result.starts_with("Error") {
                    tracing::warn!(tool = %call.name, "Tool error: {}", result);
                } else {
                    tracing::debug!(tool = %call.name, ms = elapsed, "Tool finished");
                }

                if let Some(metrics) = &self.metrics {
                    metrics.lock().await.record(ToolCallRecord::new(
                        &call.name,
                        &call.arguments.to_string(),
                        &result,
                        elapsed,
                    ));
                }

                let tool_msg = ChatMessage::tool_result(&call.id, &call.name, result);
                observer.on_message(&tool_msg).await;
                messages.push(tool_msg);
            }

            for injected in observer.on_iteration_end().await {
                observer.on_message(&injected).await;
                messages.push(injected);
            }
        }

        Err(TurnError::IterationLimit {
            max: self.max_iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Role, ToolCall};
    use crate::testing::ScriptedProvider;
    use crate::tools::builtin::EchoTool;

    #[derive(Default)]
    struct Collect {
        seen: Vec<ChatMessage>,
        inject_once: Option<ChatMessage>,
    }

    #[async_trait]
    impl TurnObserver for Collect {
        async fn on_message(&mut self, msg: &ChatMessage) {
            self.seen.push(msg.clone());
        }

        async fn on_iteration_end(&mut self) -> Vec<ChatMessage> {
            self.inject_once.take().into_iter().collect()
        }
    }

    fn echo_call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "echo".to_string(),
            arguments: serde_json::json!({"message": "ping"}),
        }
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let llm = ScriptedProvider::new()
            .then_tool_calls(vec![echo_call("c1")])
            .then_text("done");
        let tools = ToolRegistry::new().with(Arc::new(EchoTool));
        let metrics = Arc::new(Mutex::new(ExecMetrics::start()));
        let runner = Runner::new(&llm, &tools, 5).with_metrics(Arc::clone(&metrics));

        let mut observer = Collect {
            inject_once: Some(ChatMessage::user("also this")),
            ..Collect::default()
        };
        let out = runner
            .run(vec![ChatMessage::user("hi")], &ToolContext::default(), &mut observer)
            .await
            .unwrap();

        assert_eq!(out, "done");
        let roles: Vec<Role> = observer.seen.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::Tool, Role::User]);
        assert_eq!(observer.seen[1].content, "ping");

        let m = metrics.lock().await;
        assert_eq!(m.iterations, 2);
        assert_eq!(m.total_tool_calls, 1);
        assert_eq!(m.tool_calls[0].name, "echo");

        // The second request carried the injected message.
        let requests = llm.requests();
        assert_eq!(requests[1].messages.last().unwrap().content, "also this");
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let llm = ScriptedProvider::new()
            .then_tool_calls(vec![echo_call("a")])
            .then_tool_calls(vec![echo_call("b")])
            .then_tool_calls(vec![echo_call("c")]);
        let tools = ToolRegistry::new().with(Arc::new(EchoTool));
        let runner = Runner::new(&llm, &tools, 2);

        let err = runner
            .run(
                vec![ChatMessage::user("loop")],
                &ToolContext::default(),
                &mut Collect::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::IterationLimit { max: 2 }));
    }

    #[tokio::test]
    async fn test_provider_error_surfaces() {
        let llm = ScriptedProvider::new().then_error("boom");
        let tools = ToolRegistry::new();
        let runner = Runner::new(&llm, &tools, 3);
        let err = runner
            .run(vec![ChatMessage::user("x")], &ToolContext::default(), &mut Collect::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Provider(_)));
    }
}
