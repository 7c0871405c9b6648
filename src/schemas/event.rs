//! Broadcast event types — spec.md §6 "Event topics".
//!
//! Two topics exist per agent: the user-facing `agent_server:<agent_id>`
//! topic (`Event`) and the `agent_server:debug:<agent_id>` topic
//! (`DebugEvent`), which additionally mirrors sub-agent progress. Grounded in
//! the teacher's tagged-enum wire types (`schemas::agent`), generalized per
//! spec.md §9's "runtime-tagged message values" guidance: one discriminated
//! enum per topic instead of an untyped map.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::messages::{ContentPart, Message};
use super::todo::Todo;

/// The AgentServer status state machine (spec.md §4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Interrupted,
    Cancelled,
    Error,
}

/// Token usage reported by the LLM transport alongside a completed message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// A message forwarded to an application-level persistence/display layer
/// (the return value of `save_new_message_fn`, spec.md §4.7 "Persistence hook").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub conversation_id: String,
    pub message: Message,
}

/// Events delivered on the per-agent topic `agent_server:<agent_id>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StatusChanged {
        status: AgentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    LlmDeltas {
        deltas: Vec<ContentPart>,
    },
    LlmMessage {
        message: Message,
    },
    LlmTokenUsage {
        usage: TokenUsage,
    },
    ToolResponse {
        message: Message,
    },
    TodosUpdated {
        todos: Vec<Todo>,
    },
    DisplayMessageSaved {
        display_message: DisplayMessage,
    },
    AgentShutdown {
        reason: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        details: HashMap<String, Value>,
    },
    StateRestored {
        state: Value,
    },
}

impl Event {
    pub fn status_changed(status: AgentStatus) -> Self {
        Event::StatusChanged { status, payload: None }
    }

    pub fn status_changed_with_payload(status: AgentStatus, payload: Value) -> Self {
        Event::StatusChanged {
            status,
            payload: Some(payload),
        }
    }
}

/// Sub-agent progress events, wrapped as `{:subagent, sub_agent_id, <event>}`
/// on the debug topic (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubAgentEvent {
    SubagentStarted { meta: Value },
    SubagentStatusChanged { status: AgentStatus },
    SubagentLlmMessage { message: Message },
    SubagentCompleted { meta: Value },
    SubagentError { reason: String },
}

/// Events delivered on the per-agent debug topic `agent_server:debug:<agent_id>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebugEvent {
    AgentStateUpdate {
        state: Value,
    },
    MiddlewareStateUpdate {
        middleware_id: String,
        state: Value,
    },
    Subagent {
        sub_agent_id: String,
        event: SubAgentEvent,
    },
}

/// Stamped envelope used when an event is recorded for later inspection
/// (tests, `get_info`) rather than pushed straight to a subscriber channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub at: DateTime<Utc>,
    pub event: Event,
}
