//! Message, ContentPart, ToolCall, ToolResult — spec.md §3.
//!
//! Grounded in the teacher crate's `schemas::messages::Message` /
//! `MessageType` tagged-union pattern, reshaped around this runtime's four
//! roles and the streaming/merge rules spec.md §3 describes. Constructors
//! validate the stated invariants and return `Result` instead of panicking
//! (spec.md §9: "exceptions for control flow" → explicit result types).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("{role} messages must have non-empty content")]
    EmptyContent { role: &'static str },

    #[error("tool-role messages must carry at least one ToolResult")]
    MissingToolResult,

    #[error("only assistant messages may carry tool_calls")]
    ToolCallsOnNonAssistant,
}

/// Message role (spec.md §3 `Message`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Completion status of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Complete,
    Cancelled,
    Length,
}

impl Default for MessageStatus {
    fn default() -> Self {
        MessageStatus::Complete
    }
}

/// One chunk of message content. Tagged by `type`, matching the teacher's
/// discriminator convention for wire types.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        content: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        options: HashMap<String, Value>,
    },
    Image {
        content: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        options: HashMap<String, Value>,
    },
    ImageUrl {
        content: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        options: HashMap<String, Value>,
    },
    FileUrl {
        content: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        options: HashMap<String, Value>,
    },
    Thinking {
        content: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        options: HashMap<String, Value>,
    },
    RedactedThinking {
        content: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        options: HashMap<String, Value>,
    },
}

impl ContentPart {
    pub fn text(content: impl Into<String>) -> Self {
        ContentPart::Text {
            content: content.into(),
            options: HashMap::new(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ContentPart::Text { content, .. }
            | ContentPart::Image { content, .. }
            | ContentPart::ImageUrl { content, .. }
            | ContentPart::FileUrl { content, .. }
            | ContentPart::Thinking { content, .. }
            | ContentPart::RedactedThinking { content, .. } => content,
        }
    }

    fn append(&mut self, extra: &str) {
        match self {
            ContentPart::Text { content, .. }
            | ContentPart::Image { content, .. }
            | ContentPart::ImageUrl { content, .. }
            | ContentPart::FileUrl { content, .. }
            | ContentPart::Thinking { content, .. }
            | ContentPart::RedactedThinking { content, .. } => content.push_str(extra),
        }
    }

    /// Merge a streamed delta at `index` into `parts` (spec.md §3 merge rule):
    /// two parts merge by appending content at the same index; parts of
    /// incompatible types at the same index are kept separate (inserted,
    /// rather than overwriting).
    pub fn merge_delta(parts: &mut Vec<ContentPart>, index: usize, delta: ContentPart) {
        match parts.get_mut(index) {
            Some(existing) if std::mem::discriminant(existing) == std::mem::discriminant(&delta) => {
                existing.append(delta.content());
            }
            Some(_) => parts.push(delta),
            None => {
                while parts.len() < index {
                    parts.push(ContentPart::text(""));
                }
                parts.push(delta);
            }
        }
    }
}

/// Message content: either a plain string or an ordered list of parts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Parts(p) => p.is_empty(),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .map(|p| p.content())
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Status of a streamed tool call. A call is `Complete` only once its
/// `arguments` JSON has parsed successfully (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Streaming,
    Complete,
    Failed,
}

/// A tool call requested by the assistant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    /// Parsed arguments once `status == Complete`; empty object while streaming.
    pub arguments: Map<String, Value>,
    pub index: usize,
    pub status: ToolCallStatus,
    /// Accumulation buffer for streamed argument JSON. Not part of the wire
    /// contract once complete — kept to let `append_argument_delta` retry
    /// parsing as more characters arrive.
    #[serde(skip, default)]
    raw_arguments: String,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, index: usize) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments: Map::new(),
            index,
            status: ToolCallStatus::Streaming,
            raw_arguments: String::new(),
        }
    }

    /// A tool call that already arrived whole (non-streamed transport).
    pub fn complete(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
        index: usize,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
            index,
            status: ToolCallStatus::Complete,
            raw_arguments: String::new(),
        }
    }

    /// Append a chunk of streamed argument JSON and attempt to parse. The
    /// call transitions to `Complete` the moment the accumulated buffer
    /// parses as a JSON object; otherwise it stays `Streaming`.
    pub fn append_argument_delta(&mut self, delta: &str) {
        self.raw_arguments.push_str(delta);
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&self.raw_arguments) {
            self.arguments = map;
            self.status = ToolCallStatus::Complete;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ToolCallStatus::Complete
    }

    pub fn raw_arguments(&self) -> &str {
        &self.raw_arguments
    }
}

/// Content returned by a tool invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl ToolResultContent {
    pub fn as_text(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Parts(parts) => {
                parts.iter().map(|p| p.content()).collect::<Vec<_>>().join("")
            }
        }
    }
}

/// The structured reply to one tool call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: ToolResultContent,
    #[serde(default)]
    pub is_error: bool,
    /// Opaque payload for local (non-LLM-facing) use. Never serialized into
    /// the persisted state or sent to the model.
    #[serde(skip)]
    pub processed_content: Option<Value>,
    pub display_text: Option<String>,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: ToolResultContent::Text(content.into()),
            is_error: false,
            processed_content: None,
            display_text: None,
            options: HashMap::new(),
        }
    }

    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: ToolResultContent::Text(content.into()),
            is_error: true,
            processed_content: None,
            display_text: None,
            options: HashMap::new(),
        }
    }

    /// Synthetic rejection result per spec.md §4.5/§4.9/§8 (Resume completeness).
    pub fn rejected_by_reviewer(tool_call_id: impl Into<String>) -> Self {
        Self::error(tool_call_id, "Tool execution rejected by human reviewer")
    }
}

/// A single message in the conversation (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Result<Self, MessageError> {
        let content = content.into();
        if content.is_empty() {
            return Err(MessageError::EmptyContent { role: "system" });
        }
        Ok(Self::bare(Role::System, Content::Text(content)))
    }

    pub fn user(content: impl Into<String>) -> Result<Self, MessageError> {
        let content = content.into();
        if content.is_empty() {
            return Err(MessageError::EmptyContent { role: "user" });
        }
        Ok(Self::bare(Role::User, Content::Text(content)))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, Content::Text(content.into()))
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut m = Self::bare(Role::Assistant, Content::Text(content.into()));
        m.tool_calls = Some(tool_calls);
        m
    }

    pub fn tool(results: Vec<ToolResult>) -> Result<Self, MessageError> {
        if results.is_empty() {
            return Err(MessageError::MissingToolResult);
        }
        let mut m = Self::bare(Role::Tool, Content::Text(String::new()));
        m.tool_results = Some(results);
        Ok(m)
    }

    fn bare(role: Role, content: Content) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_results: None,
            status: MessageStatus::Complete,
            index: None,
            metadata: None,
        }
    }

    /// Validates the role invariants of spec.md §3 against an already-built
    /// message (used when constructing via deserialization).
    pub fn validate(&self) -> Result<(), MessageError> {
        match self.role {
            Role::System if self.content.is_empty() => {
                Err(MessageError::EmptyContent { role: "system" })
            }
            Role::User if self.content.is_empty() => {
                Err(MessageError::EmptyContent { role: "user" })
            }
            Role::Tool if self.tool_results.as_ref().map_or(true, |r| r.is_empty()) => {
                Err(MessageError::MissingToolResult)
            }
            _ if self.role != Role::Assistant && self.tool_calls.is_some() => {
                Err(MessageError::ToolCallsOnNonAssistant)
            }
            _ => Ok(()),
        }
    }
}
