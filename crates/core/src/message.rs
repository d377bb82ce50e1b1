//! Message and conversation request domain types.
//!
//! These are the value objects that flow through the entire proxy:
//! client request → pipeline stages → upstream call.
//! Stages never mutate a message in place; they build new lists.

use serde::{Deserialize, Serialize};

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The model
    Assistant,
    /// Tool execution result
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as JSON string
    pub arguments: String,
}

/// Structured, non-text content carried by a message.
///
/// Any message with a payload is protected: the pipeline forwards it
/// byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Tool calls requested by the assistant.
    ToolCalls { calls: Vec<ToolCall> },
    /// A tool result answering an earlier call.
    ToolResult { tool_call_id: String },
    /// A reference to an attached file or blob.
    Attachment(Attachment),
}

/// Reference to an attachment owned by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A single message in a conversation.
///
/// Deserialization accepts both the native form (`payload`) and the
/// OpenAI chat form (`tool_calls`, `tool_call_id`, `content: null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireMessage")]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// The text content (possibly empty)
    #[serde(default)]
    pub content: String,

    /// Tool-call descriptor, tool-result reference, or attachment reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,

    /// Set by the sanitizer; never serialized to the upstream.
    #[serde(skip)]
    pub protected: bool,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            payload: None,
            protected: false,
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            payload: Some(Payload::ToolResult {
                tool_call_id: tool_call_id.into(),
            }),
            ..Self::with_role(Role::Tool, content)
        }
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            payload: Some(Payload::ToolCalls { calls }),
            ..Self::with_role(Role::Assistant, "")
        }
    }

    /// Attach a payload, consuming the message.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Return a copy of this message carrying the protection flag.
    pub fn into_protected(mut self) -> Self {
        self.protected = true;
        self
    }

    /// Whether this message carries tool-call or tool-result structure.
    pub fn is_tool_structured(&self) -> bool {
        matches!(
            self.payload,
            Some(Payload::ToolCalls { .. }) | Some(Payload::ToolResult { .. })
        )
    }

    pub fn has_attachment(&self) -> bool {
        matches!(self.payload, Some(Payload::Attachment(_)))
    }
}

// ── Wire forms ──────────────────────────────────────────────

#[derive(Deserialize)]
struct WireMessage {
    role: Role,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    payload: Option<Payload>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default)]
    tool_call_id: Option<String>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        // An explicit native payload wins over the OpenAI fields
        let payload = wire.payload.or_else(|| {
            let calls = wire.tool_calls.filter(|calls| !calls.is_empty());
            if let Some(calls) = calls {
                Some(Payload::ToolCalls {
                    calls: calls
                        .into_iter()
                        .map(|c| ToolCall {
                            id: c.id,
                            name: c.function.name,
                            arguments: c.function.arguments,
                        })
                        .collect(),
                })
            } else {
                wire.tool_call_id
                    .map(|tool_call_id| Payload::ToolResult { tool_call_id })
            }
        });
        Self {
            role: wire.role,
            content: wire.content.unwrap_or_default(),
            payload,
            protected: false,
        }
    }
}

#[derive(Deserialize)]
struct FlatToolDefinition {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: serde_json::Value,
}

/// `{"type": "function", "function": {...}}` or the flat form.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireToolDefinition {
    Wrapped { function: FlatToolDefinition },
    Flat(FlatToolDefinition),
}

impl From<WireToolDefinition> for ToolDefinition {
    fn from(wire: WireToolDefinition) -> Self {
        let (WireToolDefinition::Wrapped { function: flat } | WireToolDefinition::Flat(flat)) = wire;
        Self {
            name: flat.name,
            description: flat.description,
            parameters: flat.parameters,
        }
    }
}

/// A tool definition forwarded to the upstream so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireToolDefinition")]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    #[serde(default)]
    pub description: String,

    /// JSON Schema describing the tool's parameters
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// An inbound chat request as received from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRequest {
    /// Requested model, possibly `provider:model`
    pub model: String,

    /// The ordered conversation
    pub messages: Vec<Message>,

    /// Tool definitions offered to the model
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Whether the caller wants a streamed response
    #[serde(default)]
    pub stream: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,

    /// Client-supplied conversation key for sliding-window tracking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ConversationRequest {
    /// A minimal request: model plus messages, everything else defaulted.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            stream: false,
            temperature: None,
            max_tokens: None,
            tool_choice: None,
            conversation_id: None,
        }
    }

    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        last_user_text(&self.messages)
    }
}

/// Text of the most recent user message in a sequence.
pub fn last_user_text(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}

/// Coarse intent label that drives the assembly strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Chat,
    Code,
    Retrieval,
    ToolUse,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Code => "code",
            Self::Retrieval => "retrieval",
            Self::ToolUse => "tool_use",
        }
    }

    /// Whether the assembler should try to inject long-term memory.
    pub fn wants_memory(&self) -> bool {
        matches!(self, Self::Chat | Self::Retrieval)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
