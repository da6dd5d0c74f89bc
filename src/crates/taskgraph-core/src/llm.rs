//! LLM adapter interface and completion configuration
//!
//! The core is an orchestration engine, not an LLM client: providers are
//! integrated by implementing [`LanguageModel`] and handing the trait object
//! to an [`Agent`](crate::agent::Agent) under a name. Adapters own message
//! format conversion, HTTP I/O, retries, and timeouts; the core only calls
//! `completion` (or `completion_streaming`) and consumes the returned
//! [`Message`].
//!
//! Adapter obligations, in addition to the trait contract:
//!
//! - render each input message through [`Message::delimited_text`] (the
//!   `<block>…</block>` convention) so consecutive same-role messages stay
//!   distinguishable,
//! - translate [`CompletionConfig::effective_tools`] into the provider's
//!   tool schema and force `tool_choice` when set,
//! - request strict-JSON output when `format_json` is set and the provider
//!   supports it,
//! - report [`StopReason::ToolCall`](crate::messages::StopReason::ToolCall)
//!   whenever the response carries tool calls, and fill
//!   [`CompletionUsage`](crate::messages::CompletionUsage) (or the
//!   `unknown()` sentinel).

use crate::error::{CoreError, Result};
use crate::messages::Message;
use crate::queue::OutQueue;
use crate::tool::Tool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Generation knobs passed through to the provider.
///
/// Unset options mean "provider default". Built with `with_*` chaining:
///
/// ```rust
/// use taskgraph_core::llm::CompletionConfig;
///
/// let config = CompletionConfig::new()
///     .with_model("gpt-4o-mini")
///     .with_temperature(0.2)
///     .with_format_json(true);
/// assert_eq!(config.model.as_deref(), Some("gpt-4o-mini"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Model identifier.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter.
    pub top_p: Option<f32>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Frequency penalty.
    pub frequency_penalty: Option<f32>,
    /// Require a strict-JSON object response.
    pub format_json: bool,
    /// Enable the provider's thinking/reasoning mode where available.
    pub allow_thinking: bool,
    /// Tools advertised to the model.
    pub tools: Vec<Tool>,
    /// Tool names withheld from the model.
    pub exclude_tools: HashSet<String>,
    /// Force the model to call this tool.
    pub tool_choice: Option<String>,
}

impl CompletionConfig {
    /// An empty configuration (all provider defaults).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the nucleus sampling parameter.
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Set the generation token limit.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the frequency penalty.
    pub fn with_frequency_penalty(mut self, penalty: f32) -> Self {
        self.frequency_penalty = Some(penalty);
        self
    }

    /// Require a strict-JSON object response.
    pub fn with_format_json(mut self, format_json: bool) -> Self {
        self.format_json = format_json;
        self
    }

    /// Toggle the provider's thinking mode.
    pub fn with_allow_thinking(mut self, allow: bool) -> Self {
        self.allow_thinking = allow;
        self
    }

    /// Advertise tools to the model.
    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    /// Withhold the named tools from the model.
    pub fn with_exclude_tools(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.exclude_tools = names.into_iter().collect();
        self
    }

    /// Force the model to call one specific tool.
    pub fn with_tool_choice(mut self, name: impl Into<String>) -> Self {
        self.tool_choice = Some(name.into());
        self
    }

    /// Tools actually visible to the provider: `tools` minus
    /// `exclude_tools`, narrowed to `tool_choice` when set.
    pub fn effective_tools(&self) -> Vec<&Tool> {
        self.tools
            .iter()
            .filter(|t| !self.exclude_tools.contains(&t.name))
            .filter(|t| {
                self.tool_choice
                    .as_deref()
                    .map(|choice| t.name == choice)
                    .unwrap_or(true)
            })
            .collect()
    }
}

/// Provider adapter for chat completion (and, optionally, embeddings).
///
/// Implementations must be `Send + Sync`; share them across agents as
/// `Arc<dyn LanguageModel>`.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate one assistant message from the conversation.
    async fn completion(
        &self,
        messages: &[Message],
        config: &CompletionConfig,
    ) -> Result<Message>;

    /// Generate while streaming interim tokens to `sink`.
    ///
    /// The default forwards to [`completion`](Self::completion) without
    /// streaming; adapters that stream should push partial assistant
    /// messages to `sink` and still return the complete reply.
    async fn completion_streaming(
        &self,
        messages: &[Message],
        config: &CompletionConfig,
        _sink: &OutQueue,
    ) -> Result<Message> {
        self.completion(messages, config).await
    }

    /// Whether [`completion_streaming`](Self::completion_streaming) streams
    /// for real. `Agent::think` prefers it when true.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Embed one content string. Used only by memory hooks; not by the core.
    async fn embed(&self, _content: &str, _dimensions: usize) -> Result<Vec<f32>> {
        Err(CoreError::Llm("embeddings are not supported".into()))
    }

    /// Embed a batch of content strings. Used only by memory hooks.
    async fn embed_batch(&self, _content: &[String], _dimensions: usize) -> Result<Vec<Vec<f32>>> {
        Err(CoreError::Llm("embeddings are not supported".into()))
    }

    /// Human-readable adapter name for logging.
    fn name(&self) -> &str {
        "language-model"
    }
}
