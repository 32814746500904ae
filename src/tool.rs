use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};

/// Something that can run a tool by name.
///
/// A provider connection implements this once and serves every tool it
/// advertises, which is why the tool name is passed along with the
/// arguments.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: Value) -> Result<Value>;
}

/// Adapts an async closure into a [`ToolExecutor`].
pub struct FnExecutor<F>(F);

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> ToolExecutor for FnExecutor<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn execute(&self, _name: &str, arguments: Value) -> Result<Value> {
        (self.0)(arguments).await
    }
}

/// Catalog entry in the shape a model request expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub executor: Arc<dyn ToolExecutor>,
}

impl ToolDescriptor {
    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

#[derive(Default, Clone, Debug)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Inserts a tool, replacing any tool already registered under `name`.
    /// The replaced descriptor is returned.
    pub fn register_tool(
        &mut self,
        name: impl Into<String>,
        executor: Arc<dyn ToolExecutor>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Option<ToolDescriptor> {
        let name = name.into();
        let descriptor = ToolDescriptor {
            name: name.clone(),
            description: description.into(),
            input_schema,
            executor,
        };
        let previous = self.tools.insert(name.clone(), descriptor);
        if previous.is_some() {
            tracing::warn!(tool = %name, "tool name collision, keeping the latest registration");
        }
        previous
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) -> Option<ToolDescriptor>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register_tool(name, Arc::new(FnExecutor::new(f)), description, input_schema)
    }

    /// Catalog for a model request, ordered by name.
    pub fn get_tools(&self) -> Vec<ToolSpec> {
        self.tools.values().map(ToolDescriptor::spec).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Runs a registered tool. Executor errors are returned untouched.
    pub async fn execute_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        tool.executor.execute(name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn later_registration_wins() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("lookup", "first", json!({}), |_| async { Ok(json!("first")) });
        let replaced =
            registry.register_fn("lookup", "second", json!({}), |_| async { Ok(json!("second")) });

        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_tools()[0].description, "second");
        let out = registry.execute_tool("lookup", json!({})).await.unwrap();
        assert_eq!(out, json!("second"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let err = registry.execute_tool("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn executor_errors_propagate_unchanged() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("boom", "fails", json!({}), |_| async {
            Err(AgentError::ToolExecution {
                name: "boom".into(),
                message: "disk on fire".into(),
            })
        });

        let err = registry.execute_tool("boom", json!({})).await.unwrap_err();
        assert!(err.is_provider_failure());
        assert!(err.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn shared_executor_receives_tool_name() {
        struct Named;

        #[async_trait]
        impl ToolExecutor for Named {
            async fn execute(&self, name: &str, arguments: Value) -> Result<Value> {
                Ok(json!({ "tool": name, "args": arguments }))
            }
        }

        let executor: Arc<dyn ToolExecutor> = Arc::new(Named);
        let mut registry = ToolRegistry::new();
        registry.register_tool("read", executor.clone(), "read a file", json!({}));
        registry.register_tool("write", executor, "write a file", json!({}));

        let out = registry.execute_tool("write", json!({"path": "a"})).await.unwrap();
        assert_eq!(out, json!({"tool": "write", "args": {"path": "a"}}));
        assert_eq!(registry.names(), vec!["read".to_string(), "write".to_string()]);
    }

    #[test]
    fn empty_registry_has_no_catalog() {
        assert!(ToolRegistry::new().get_tools().is_empty());
    }
}
