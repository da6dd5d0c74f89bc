//! Tool descriptors, the tool-service contract, and an in-process registry
//!
//! Tools are the "act" half of an agent's loop. The core consumes them
//! through [`ToolService`], an external capability broker: given a name and
//! JSON arguments it returns a [`Role::Tool`](crate::messages::Role) message.
//! Tool failures are *data* - an error-flagged message the LLM can read and
//! react to - never a `CoreError`; only transport-level breakage surfaces on
//! the error channel.
//!
//! [`ToolRegistry`] is the degenerate in-address-space broker: async
//! closures registered under a [`Tool`] descriptor. It also implements the
//! tag-matching rule used to advertise tools per task: a tool annotated with
//! `tags = "a,b"` is advertised to tasks tagged `a` or `b`; a tool without
//! a `tags` annotation is advertised to everyone.

use crate::error::{CoreError, Result};
use crate::messages::Message;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Annotation key carrying a tool's comma-separated tag list.
pub const TAGS_ANNOTATION: &str = "tags";

/// A tool as advertised to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Unique tool name.
    pub name: String,
    /// Natural-language description the LLM selects by.
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
    /// Free-form annotations (tag routing, provenance, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Tool {
    /// Create a tool descriptor.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            annotations: HashMap::new(),
        }
    }

    /// Attach an annotation.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Attach a comma-joined `tags` annotation.
    pub fn with_tags<I: IntoIterator<Item = T>, T: Into<String>>(self, tags: I) -> Self {
        let joined = tags
            .into_iter()
            .map(Into::into)
            .collect::<Vec<_>>()
            .join(",");
        self.with_annotation(TAGS_ANNOTATION, joined)
    }

    /// The tool's tags, parsed from its `tags` annotation.
    pub fn tags(&self) -> HashSet<String> {
        self.annotations
            .get(TAGS_ANNOTATION)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether this tool should be advertised to a task with `task_tags`.
    ///
    /// Untagged tools match everything; tagged tools need at least one tag
    /// in common.
    pub fn matches_tags(&self, task_tags: &HashSet<String>) -> bool {
        let own = self.tags();
        own.is_empty() || own.intersection(task_tags).next().is_some()
    }
}

/// External capability broker the agent's `act` primitive calls into.
#[async_trait]
pub trait ToolService: Send + Sync {
    /// All tools this service can execute.
    fn list_tools(&self) -> Vec<Tool>;

    /// Execute one tool.
    ///
    /// Returns a [`Role::Tool`](crate::messages::Role) message; execution
    /// failures are reported in-band with `is_error = true`. An `Err` means
    /// the service itself is broken (the caller folds it into an error
    /// message anyway).
    async fn call(&self, name: &str, args: &Map<String, Value>) -> Result<Message>;
}

/// Async closure executing one registered tool.
pub type ToolExecutorFn =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct RegisteredTool {
    descriptor: Tool,
    executor: ToolExecutorFn,
}

/// In-process [`ToolService`] over registered async closures.
///
/// ```rust
/// use taskgraph_core::tool::{Tool, ToolRegistry, ToolService};
/// use serde_json::json;
///
/// let mut registry = ToolRegistry::new();
/// registry.register(
///     Tool::new("echo", "Echo the input back", json!({"type": "object"})),
///     |args| Box::pin(async move { Ok(args.get("text").cloned().unwrap_or_default()) }),
/// );
/// assert_eq!(registry.list_tools().len(), 1);
/// ```
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its descriptor's name, replacing any previous
    /// registration.
    pub fn register<F>(&mut self, descriptor: Tool, executor: F)
    where
        F: Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        let name = descriptor.name.clone();
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(
            name,
            RegisteredTool {
                descriptor,
                executor: Arc::new(executor),
            },
        );
    }

    /// Descriptors of tools advertised to a task with the given tags.
    pub fn tools_for_tags(&self, task_tags: &HashSet<String>) -> Vec<Tool> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .filter(|t| t.descriptor.matches_tags(task_tags))
            .map(|t| t.descriptor.clone())
            .collect()
    }

    /// Names of registered tools that do *not* match the given tags,
    /// suitable for `CompletionConfig::exclude_tools`.
    pub fn excluded_for_tags(&self, task_tags: &HashSet<String>) -> HashSet<String> {
        self.tools
            .values()
            .filter(|t| !t.descriptor.matches_tags(task_tags))
            .map(|t| t.descriptor.name.clone())
            .collect()
    }
}

#[async_trait]
impl ToolService for ToolRegistry {
    fn list_tools(&self) -> Vec<Tool> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.descriptor.clone())
            .collect()
    }

    async fn call(&self, name: &str, args: &Map<String, Value>) -> Result<Message> {
        let Some(registered) = self.tools.get(name) else {
            tracing::warn!(tool = %name, "unknown tool requested");
            return Ok(Message::new(
                crate::messages::Role::Tool,
                format!("unknown tool '{name}'"),
            )
            .with_error(true));
        };

        tracing::debug!(tool = %name, "executing tool");
        match (registered.executor)(args.clone()).await {
            Ok(value) => {
                let content = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Ok(Message::new(crate::messages::Role::Tool, content))
            }
            Err(err) => {
                tracing::warn!(tool = %name, error = %err, "tool execution failed");
                Ok(
                    Message::new(crate::messages::Role::Tool, err.to_string())
                        .with_error(true),
                )
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}
