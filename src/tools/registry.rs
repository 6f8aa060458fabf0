//! Tool registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::llm::ToolDefinition;
use crate::tools::{Tool, ToolContext};

/// Named set of tools available to a thread.
///
/// Cloning is cheap; each thread gets a clone of the shared registry with its
/// thread-bound tools added.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::debug!("Replaced tool: {}", name);
        }
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Clone this registry and add `extra` tools.
    pub fn clone_with(&self, extra: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        let mut out = self.clone();
        for tool in extra {
            out.register(tool);
        }
        out
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Function-calling definitions for the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| {
                let schema = tool.schema();
                ToolDefinition {
                    name: schema.name,
                    description: schema.description,
                    parameters: schema.parameters,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run a tool by name. Failures come back as `"Error: ..."` text.
    pub async fn run(&self, name: &str, args: serde_json::Value, ctx: &ToolContext) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!("Error: unknown tool '{}'", name);
        };
        match tool.execute(args, ctx).await {
            Ok(output) => output.into_text(),
            Err(e) => format!("Error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::EchoTool;

    #[tokio::test]
    async fn test_run_reports_errors_as_text() {
        let registry = ToolRegistry::new().with(Arc::new(EchoTool));
        let ctx = ToolContext::default();

        let ok = registry
            .run("echo", serde_json::json!({"message": "hi"}), &ctx)
            .await;
        assert_eq!(ok, "hi");

        let bad = registry.run("echo", serde_json::json!({}), &ctx).await;
        assert!(bad.starts_with("Error: Invalid parameters"));

        let missing = registry.run("nope", serde_json::json!({}), &ctx).await;
        assert_eq!(missing, "Error: unknown tool 'nope'");
    }

    #[test]
    fn test_clone_with_leaves_base_untouched() {
        let base = ToolRegistry::new();
        let extended = base.clone_with([Arc::new(EchoTool) as Arc<dyn Tool>]);
        assert!(base.is_empty());
        assert_eq!(extended.names(), vec!["echo".to_string()]);
        assert_eq!(extended.definitions()[0].name, "echo");
    }
}
