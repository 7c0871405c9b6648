//! Human-in-the-loop interrupt protocol — spec.md §3, §4.9.
//!
//! Adapted from the teacher's `agent::hitl` module (`HitlDecision`,
//! `InterruptConfig`, `ActionRequest`, `ReviewConfig`, `InterruptPayload`),
//! renamed to the spec's vocabulary (`InterruptPayload` → `InterruptData`)
//! and extended with the gating/validation algorithms of §4.9, which the
//! teacher's module leaves to its caller.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::schemas::{ToolCall, ToolResult};

#[derive(Debug, Error)]
pub enum InterruptProtocolError {
    #[error("resume supplied {got} decisions but {expected} action requests are pending")]
    LengthMismatch { expected: usize, got: usize },

    #[error("decision kind '{kind}' is not allowed for tool '{tool_name}'")]
    DisallowedDecision { tool_name: String, kind: &'static str },

    #[error("no decision supplied for pending call '{0}'")]
    MissingDecision(String),

    #[error("resume requested but no HumanInTheLoop middleware is active")]
    NoActiveInterrupt,
}

pub const DEFAULT_ALLOWED_DECISIONS: &[DecisionKind] =
    &[DecisionKind::Approve, DecisionKind::Edit, DecisionKind::Reject];

/// The kind of a `Decision`, used when checking against `allowed_decisions`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Approve,
    Edit,
    Reject,
}

impl DecisionKind {
    fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Approve => "approve",
            DecisionKind::Edit => "edit",
            DecisionKind::Reject => "reject",
        }
    }
}

/// A human reviewer's decision for one pending tool call (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Edit { arguments: Map<String, Value> },
    Reject,
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Approve => DecisionKind::Approve,
            Decision::Edit { .. } => DecisionKind::Edit,
            Decision::Reject => DecisionKind::Reject,
        }
    }
}

/// Per-call configuration: `interrupt_on[tool_name]` (spec.md §4.9).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InterruptOn {
    Flag(bool),
    Config { allowed_decisions: Vec<DecisionKind> },
}

impl InterruptOn {
    /// `None` if this tool is not gated; `Some(allowed_decisions)` if it is.
    fn allowed_decisions(&self) -> Option<Vec<DecisionKind>> {
        match self {
            InterruptOn::Flag(false) => None,
            InterruptOn::Flag(true) => Some(DEFAULT_ALLOWED_DECISIONS.to_vec()),
            InterruptOn::Config { allowed_decisions } => Some(allowed_decisions.clone()),
        }
    }
}

pub type InterruptOnMap = HashMap<String, InterruptOn>;

/// One pending tool call awaiting a human decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

/// The decisions allowed for one gated tool, keyed by tool name in
/// `InterruptData::review_configs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReviewConfig {
    pub allowed_decisions: Vec<DecisionKind>,
}

/// Tags an `InterruptData` that was propagated up from a sub-agent's own
/// gated tool call rather than raised by this agent's own middleware
/// (spec.md §4.6 "a child interrupt is wrapped `{type: subagent_hitl,
/// sub_agent_id, interrupt_data}` and bubbles up through the parent's
/// tool-execution result as an interrupt signal"). `completed_results` and
/// `remaining_calls` let `resume` avoid re-running sibling tool calls in the
/// same batch: the former already ran before the gated call was reached, the
/// latter are deferred until the sub-agent itself resolves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubAgentHitl {
    pub sub_agent_id: String,
    pub parent_tool_call_id: String,
    #[serde(default)]
    pub completed_results: Vec<ToolResult>,
    #[serde(default)]
    pub remaining_calls: Vec<ToolCall>,
}

/// The payload the engine parks on and the application resumes with
/// decisions for (spec.md §3 `InterruptData`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InterruptData {
    pub action_requests: Vec<ActionRequest>,
    pub hitl_tool_call_ids: Vec<String>,
    pub review_configs: HashMap<String, ReviewConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_hitl: Option<SubAgentHitl>,
}

/// Inspects an assistant turn's tool calls against `interrupt_on` and
/// produces `InterruptData` if any call is gated. Returns `None` if no call
/// requires review (spec.md §4.9: "filter to those whose name maps to a
/// truthy value; if non-empty, emit InterruptData and park").
pub fn detect_interrupt(interrupt_on: &InterruptOnMap, tool_calls: &[ToolCall]) -> Option<InterruptData> {
    let mut action_requests = Vec::new();
    let mut hitl_tool_call_ids = Vec::new();
    let mut review_configs = HashMap::new();

    for call in tool_calls {
        let Some(config) = interrupt_on.get(&call.name) else {
            continue;
        };
        let Some(allowed_decisions) = config.allowed_decisions() else {
            continue;
        };

        action_requests.push(ActionRequest {
            tool_call_id: call.call_id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        });
        hitl_tool_call_ids.push(call.call_id.clone());
        review_configs
            .entry(call.name.clone())
            .or_insert(ReviewConfig { allowed_decisions });
    }

    if action_requests.is_empty() {
        None
    } else {
        Some(InterruptData {
            action_requests,
            hitl_tool_call_ids,
            review_configs,
            subagent_hitl: None,
        })
    }
}

/// Validates a resume's decisions against the parked `InterruptData`
/// (spec.md §4.9, §8 invariant 4): same length, and each decision's kind is
/// in the allowed set for the corresponding request's tool.
pub fn validate_resume(
    interrupt_data: &InterruptData,
    decisions: &[Decision],
) -> Result<(), InterruptProtocolError> {
    if decisions.len() != interrupt_data.action_requests.len() {
        return Err(InterruptProtocolError::LengthMismatch {
            expected: interrupt_data.action_requests.len(),
            got: decisions.len(),
        });
    }

    for (request, decision) in interrupt_data.action_requests.iter().zip(decisions) {
        let allowed = interrupt_data
            .review_configs
            .get(&request.tool_name)
            .map(|rc| rc.allowed_decisions.as_slice())
            .unwrap_or(DEFAULT_ALLOWED_DECISIONS);

        if !allowed.contains(&decision.kind()) {
            return Err(InterruptProtocolError::DisallowedDecision {
                tool_name: request.tool_name.clone(),
                kind: decision.kind().as_str(),
            });
        }
    }

    Ok(())
}

/// Builds the full per-call decision vector for resume (spec.md §4.5 step 4):
/// HITL-gated calls use the matching supplied decision; non-gated calls in
/// the same assistant message are auto-approved.
pub fn build_full_decision_vector(
    interrupt_data: &InterruptData,
    all_tool_calls: &[ToolCall],
    decisions: &[Decision],
) -> HashMap<String, Decision> {
    let mut by_call_id: HashMap<String, Decision> = interrupt_data
        .action_requests
        .iter()
        .zip(decisions)
        .map(|(req, dec)| (req.tool_call_id.clone(), dec.clone()))
        .collect();

    for call in all_tool_calls {
        by_call_id.entry(call.call_id.clone()).or_insert(Decision::Approve);
    }

    by_call_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall::complete(id, name, Map::new(), 0)
    }

    #[test]
    fn detect_interrupt_ignores_non_gated_tools() {
        let mut interrupt_on = InterruptOnMap::new();
        interrupt_on.insert("write_file".into(), InterruptOn::Flag(true));
        let calls = vec![call("1", "list_files")];
        assert!(detect_interrupt(&interrupt_on, &calls).is_none());
    }

    #[test]
    fn detect_interrupt_gates_matching_tool() {
        let mut interrupt_on = InterruptOnMap::new();
        interrupt_on.insert("write_file".into(), InterruptOn::Flag(true));
        let calls = vec![call("A", "write_file")];
        let data = detect_interrupt(&interrupt_on, &calls).unwrap();
        assert_eq!(data.hitl_tool_call_ids, vec!["A".to_string()]);
    }

    #[test]
    fn validate_resume_rejects_length_mismatch() {
        let data = InterruptData {
            action_requests: vec![ActionRequest {
                tool_call_id: "A".into(),
                tool_name: "write_file".into(),
                arguments: Map::new(),
            }],
            hitl_tool_call_ids: vec!["A".into()],
            review_configs: HashMap::new(),
            subagent_hitl: None,
        };
        let err = validate_resume(&data, &[]).unwrap_err();
        assert!(matches!(err, InterruptProtocolError::LengthMismatch { .. }));
    }

    #[test]
    fn validate_resume_rejects_disallowed_decision_kind() {
        let mut review_configs = HashMap::new();
        review_configs.insert(
            "write_file".to_string(),
            ReviewConfig {
                allowed_decisions: vec![DecisionKind::Approve, DecisionKind::Reject],
            },
        );
        let data = InterruptData {
            action_requests: vec![ActionRequest {
                tool_call_id: "A".into(),
                tool_name: "write_file".into(),
                arguments: Map::new(),
            }],
            hitl_tool_call_ids: vec!["A".into()],
            review_configs,
            subagent_hitl: None,
        };
        let err = validate_resume(
            &data,
            &[Decision::Edit { arguments: Map::new() }],
        )
        .unwrap_err();
        assert!(matches!(err, InterruptProtocolError::DisallowedDecision { .. }));
    }
}
