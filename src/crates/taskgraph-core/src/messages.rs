//! Message data model shared by tasks, agents, and adapters
//!
//! Everything the core moves around - conversation history in task context
//! buffers, LLM replies, tool results, scheduler notifications on the out
//! queue - is a [`Message`]: a role, an ordered list of content blocks,
//! optional tool-call plumbing, and bookkeeping (stop reason, usage, error
//! flag, free-form metadata).
//!
//! # Roles
//!
//! - [`Role::System`] - instructions and notifications
//! - [`Role::User`] - task input and injected context
//! - [`Role::Assistant`] - LLM output, possibly carrying tool calls
//! - [`Role::Tool`] - one tool result, keyed by `tool_call_id`
//!
//! # Block delimiter convention
//!
//! LLM adapters must wrap every content block in `<block>…</block>` when
//! rendering a message for a provider, so the model can distinguish
//! consecutive same-role messages. [`Message::delimited_text`] produces that
//! rendering; adapters are expected to use it (or replicate it exactly).
//!
//! # Example
//!
//! ```rust
//! use taskgraph_core::messages::{Message, Role};
//!
//! let question = Message::user("What is 2+2?");
//! let reply = Message::assistant("4");
//!
//! assert_eq!(question.role, Role::User);
//! assert_eq!(reply.text(), "4");
//! assert_eq!(reply.delimited_text(), "<block>4</block>");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions, protocol text, scheduler notifications.
    System,
    /// End-user input or synthetically injected context.
    User,
    /// LLM output.
    Assistant,
    /// Tool execution result.
    Tool,
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of generation.
    Stop,
    /// Token limit reached.
    Length,
    /// The response carries one or more tool calls.
    ToolCall,
    /// Provider-side content filtering intervened.
    ContentFilter,
}

/// One piece of message content.
///
/// Blocks are ordered within a message; a plain text reply is a single
/// [`ContentBlock::Text`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Textual content.
    Text {
        /// The text.
        text: String,
    },
    /// Image content via URL or embedded base64 data.
    Image {
        /// Image URL (mutually exclusive with `base64`).
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Base64 payload with media type (mutually exclusive with `url`).
        #[serde(skip_serializing_if = "Option::is_none")]
        base64: Option<ImageData>,
    },
    /// Video content by URL.
    Video {
        /// Video URL.
        url: String,
    },
}

/// Embedded base64 image payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

impl ContentBlock {
    /// Create a text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an image block referencing a URL.
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::Image {
            url: Some(url.into()),
            base64: None,
        }
    }

    /// Create an image block from base64 data.
    pub fn image_base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            url: None,
            base64: Some(ImageData {
                media_type: media_type.into(),
                data: data.into(),
            }),
        }
    }

    /// Create a video block referencing a URL.
    pub fn video_url(url: impl Into<String>) -> Self {
        Self::Video { url: url.into() }
    }
}

/// A tool invocation requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call id; echoed back on the result message.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments as a JSON object.
    pub args: Map<String, Value>,
    /// Call type as reported by the provider (usually `"function"`).
    pub call_type: String,
}

impl ToolCallRequest {
    /// Create a function-type call request with a fresh id.
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            args,
            call_type: "function".to_string(),
        }
    }
}

/// Token accounting reported by an LLM adapter.
///
/// Adapters that cannot obtain usage report [`CompletionUsage::unknown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated.
    pub completion_tokens: u64,
    /// Total billed tokens.
    pub total_tokens: u64,
}

impl CompletionUsage {
    /// Construct from known counts.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Sentinel value for providers that do not report usage.
    pub fn unknown() -> Self {
        Self::default()
    }
}

/// Metadata key marking a message produced by human interference.
const INTERFERENCE_KEY: &str = "interference";

/// A single message: role, content blocks, tool plumbing, bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier.
    pub id: String,

    /// Who produced the message.
    pub role: Role,

    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,

    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// For [`Role::Tool`] messages: the call this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Why generation stopped (assistant messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,

    /// Token usage (assistant messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,

    /// Whether this message represents a failure (tool error, caught LLM
    /// error, interference sentinel).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,

    /// Free-form metadata consumed by hooks and workflow actions.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Create a message with the given role and a single text block.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: vec![ContentBlock::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
            stop_reason: None,
            usage: None,
            is_error: false,
            metadata: Map::new(),
        }
    }

    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Create a tool-result message answering `tool_call_id`.
    pub fn tool(text: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, text);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Synthetic user message recording human interference.
    ///
    /// Flagged as an error and marked in metadata so workflow actions can
    /// distinguish it from a genuine failure.
    pub fn interference(reason: impl Into<String>) -> Self {
        Self::user(reason).with_error(true).with_interference_flag()
    }

    /// Synthetic tool-result message recording human interference during a
    /// tool call.
    pub fn interference_for_call(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::tool(reason, call_id)
            .with_error(true)
            .with_interference_flag()
    }

    /// Replace the content blocks.
    pub fn with_content(mut self, content: Vec<ContentBlock>) -> Self {
        self.content = content;
        self
    }

    /// Attach tool calls (assistant messages).
    pub fn with_tool_calls(mut self, calls: Vec<ToolCallRequest>) -> Self {
        if !calls.is_empty() {
            self.stop_reason = Some(StopReason::ToolCall);
        }
        self.tool_calls = calls;
        self
    }

    /// Set the tool-call id (tool messages).
    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    /// Set the stop reason.
    pub fn with_stop_reason(mut self, reason: StopReason) -> Self {
        self.stop_reason = Some(reason);
        self
    }

    /// Set the usage report.
    pub fn with_usage(mut self, usage: CompletionUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Set the error flag.
    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    /// Insert a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    fn with_interference_flag(self) -> Self {
        self.with_metadata(INTERFERENCE_KEY, Value::Bool(true))
    }

    /// Whether this message is an interference sentinel.
    pub fn is_interference(&self) -> bool {
        self.metadata
            .get(INTERFERENCE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether the assistant requested any tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// All text blocks concatenated with newlines.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        parts.join("\n")
    }

    /// Render every content block wrapped in `<block>…</block>`.
    ///
    /// This is the form LLM adapters must feed providers; see the
    /// [module docs](self).
    pub fn delimited_text(&self) -> String {
        self.content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => format!("<block>{text}</block>"),
                ContentBlock::Image { url, base64 } => {
                    let inner = url
                        .clone()
                        .or_else(|| base64.as_ref().map(|b| format!("base64:{}", b.media_type)))
                        .unwrap_or_default();
                    format!("<block>[image {inner}]</block>")
                }
                ContentBlock::Video { url } => format!("<block>[video {url}]</block>"),
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Messages with the given role, in order.
pub fn filter_by_role(messages: &[Message], role: Role) -> Vec<&Message> {
    messages.iter().filter(|m| m.role == role).collect()
}

/// The most recent message with the given role, if any.
pub fn last_of_role(messages: &[Message], role: Role) -> Option<&Message> {
    messages.iter().rev().find(|m| m.role == role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        let t = Message::tool("out", "call-1");
        assert_eq!(t.role, Role::Tool);
        assert_eq!(t.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn tool_calls_imply_stop_reason() {
        let mut args = Map::new();
        args.insert("query".to_string(), json!("weather"));
        let msg =
            Message::assistant("checking").with_tool_calls(vec![ToolCallRequest::new("search", args)]);
        assert!(msg.has_tool_calls());
        assert_eq!(msg.stop_reason, Some(StopReason::ToolCall));
    }

    #[test]
    fn delimited_text_wraps_every_block() {
        let msg = Message::assistant("one").with_content(vec![
            ContentBlock::text("one"),
            ContentBlock::text("two"),
        ]);
        assert_eq!(msg.delimited_text(), "<block>one</block><block>two</block>");
    }

    #[test]
    fn interference_is_flagged_and_detectable() {
        let msg = Message::interference("approval required");
        assert!(msg.is_error);
        assert!(msg.is_interference());
        assert_eq!(msg.role, Role::User);

        let tool = Message::interference_for_call("c1", "approval required");
        assert_eq!(tool.role, Role::Tool);
        assert!(tool.is_interference());
        assert_eq!(tool.tool_call_id.as_deref(), Some("c1"));

        let plain_error = Message::tool("boom", "c2").with_error(true);
        assert!(!plain_error.is_interference());
    }

    #[test]
    fn role_filters() {
        let messages = vec![
            Message::system("proto"),
            Message::user("q"),
            Message::assistant("a1"),
            Message::assistant("a2"),
        ];
        assert_eq!(filter_by_role(&messages, Role::Assistant).len(), 2);
        assert_eq!(
            last_of_role(&messages, Role::Assistant).unwrap().text(),
            "a2"
        );
        assert!(last_of_role(&messages, Role::Tool).is_none());
    }

    #[test]
    fn usage_totals() {
        let usage = CompletionUsage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(CompletionUsage::unknown(), CompletionUsage::default());
    }

    #[test]
    fn serde_round_trip() {
        let msg = Message::assistant("hello")
            .with_usage(CompletionUsage::new(3, 2))
            .with_stop_reason(StopReason::Stop);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["stop_reason"], "stop");
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back.text(), "hello");
    }
}
