use std::collections::HashMap;
use std::sync::Arc;

use opta_core::tools::{Tool, ToolDefinition};

/// Tools the agent loop may call, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions advertised to the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use opta_core::tools::{ToolContext, ToolError, ToolResult};

    struct DummyTool {
        name: String,
    }

    impl DummyTool {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A dummy tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResult, ToolError> {
            Ok(ToolResult {
                content: "ok".into(),
                is_error: false,
                duration: std::time::Duration::from_millis(1),
            })
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("read_file")));

        assert!(registry.contains("read_file"));
        assert!(!registry.contains("write_file"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("read_file").is_some());
    }

    #[test]
    fn names_and_definitions_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("write_file")));
        registry.register(Arc::new(DummyTool::new("read_file")));

        assert_eq!(registry.names(), vec!["read_file", "write_file"]);
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "read_file");
        assert_eq!(defs[1].description, "A dummy tool for testing");
    }

    #[test]
    fn re_registering_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("read_file")));
        registry.register(Arc::new(DummyTool::new("read_file")));
        assert_eq!(registry.len(), 1);
    }
}
