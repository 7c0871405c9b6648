//! The in-flight conversation object — spec.md §6 GLOSSARY "Chain", §4.5.
//!
//! Grounded in the teacher's `UnifiedAgent`/`AgentExecutor<AgentBox>` pair,
//! which thread a prompt-args/messages value through repeated LLM calls and
//! tool executions; this crate collapses that into one `Chain` value exposing
//! exactly the operations spec.md §6 names (`last_message`,
//! `exchanged_messages`, `needs_response`, `execute_tool_calls`,
//! `execute_tool_calls_with_decisions`).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Map;

use crate::hitl::Decision;
use crate::llm::ModelHandle;
use crate::pubsub::Topic;
use crate::schemas::event::DebugEvent;
use crate::schemas::{Message, Role, ToolResult};
use crate::state::State;
use crate::tool::{ToolContext, ToolOutcome, ToolSpec};
use crate::vfs::VfsHandle;

/// Outcome of executing one batch of pending tool calls (spec.md §4.5 step
/// 3b, §4.6 interrupt propagation).
pub enum ToolBatchOutcome {
    /// Every call ran; each element is a state fragment to merge.
    Resolved(Vec<State>),
    /// One call (in practice the `task` tool) discovered its own nested
    /// human-review gate. Calls before it already ran; the interrupt's
    /// `subagent_hitl` carries their results plus the calls still owed so
    /// `resume` can pick up exactly where the batch stopped.
    Interrupted { fragments: Vec<State>, data: crate::hitl::InterruptData },
}

/// A single conversation in flight: the messages sent to the model, the
/// tools it may call, and the subset of messages produced during this
/// execution (the part that gets merged back into `State` when the turn
/// finishes).
pub struct Chain {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub model_handle: ModelHandle,
    exchanged_from: usize,
}

impl Chain {
    /// Builds a chain from the assembled system prompt prepended to the
    /// current state's messages (spec.md §4.5 step 2).
    pub fn new(system_prompt: &str, state_messages: Vec<Message>, tools: Vec<ToolSpec>, model_handle: ModelHandle) -> Self {
        let mut messages = Vec::with_capacity(state_messages.len() + 1);
        if !system_prompt.is_empty() {
            if let Ok(system) = Message::system(system_prompt) {
                messages.push(system);
            }
        }
        let exchanged_from = messages.len() + state_messages.len();
        messages.extend(state_messages);
        Self {
            messages,
            tools,
            model_handle,
            exchanged_from,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Messages produced since this chain was built — what gets merged back
    /// into `State` (spec.md §4.5 step 4).
    pub fn exchanged_messages(&self) -> &[Message] {
        &self.messages[self.exchanged_from.min(self.messages.len())..]
    }

    /// True when the chain is waiting on an LLM response: either no messages
    /// yet or the most recent message is not an assistant turn (a user
    /// message just arrived, or a tool message was just appended after
    /// executing the previous assistant turn's tool calls).
    pub fn needs_response(&self) -> bool {
        !matches!(self.last_message(), Some(m) if m.role == Role::Assistant)
    }

    /// True when the last assistant message has tool calls still pending
    /// execution.
    pub fn has_pending_tool_calls(&self) -> bool {
        matches!(self.last_message(), Some(m) if m.role == Role::Assistant && has_pending_tool_calls(m))
    }

    fn find_tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Executes all pending tool calls in the last assistant message with
    /// their original arguments (non-HITL path, spec.md §4.5 step 3b).
    pub async fn execute_tool_calls(
        &mut self,
        agent_id: &str,
        vfs: VfsHandle,
        state: Arc<State>,
        debug_events: &Topic<DebugEvent>,
    ) -> ToolBatchOutcome {
        let Some(Message { tool_calls: Some(calls), .. }) = self.last_message().cloned() else {
            return ToolBatchOutcome::Resolved(Vec::new());
        };

        let mut results = Vec::new();
        let mut fragments = Vec::new();
        for (i, call) in calls.iter().enumerate() {
            let ctx = ToolContext {
                agent_id: agent_id.to_string(),
                call_id: call.call_id.clone(),
                vfs: vfs.clone(),
                state: state.clone(),
                debug_events: debug_events.clone(),
            };
            let outcome = self.invoke(&call.name, call.call_id.clone(), call.arguments.clone(), ctx).await;
            if let Some(mut data) = outcome.interrupt {
                if let Some(hitl) = data.subagent_hitl.as_mut() {
                    hitl.completed_results = results.clone();
                    hitl.remaining_calls = calls[i + 1..].to_vec();
                }
                return ToolBatchOutcome::Interrupted { fragments, data };
            }
            results.push(outcome.result);
            if let Some(fragment) = outcome.state_fragment {
                fragments.push(fragment);
            }
        }

        if let Ok(tool_message) = Message::tool(results) {
            self.push(tool_message);
        }
        ToolBatchOutcome::Resolved(fragments)
    }

    /// Executes tool calls honoring a per-call `Decision` map built by
    /// `hitl::build_full_decision_vector` (spec.md §4.5 step 5).
    pub async fn execute_tool_calls_with_decisions(
        &mut self,
        agent_id: &str,
        vfs: VfsHandle,
        state: Arc<State>,
        decisions: &HashMap<String, Decision>,
        debug_events: &Topic<DebugEvent>,
    ) -> ToolBatchOutcome {
        let Some(Message { tool_calls: Some(calls), .. }) = self.last_message().cloned() else {
            return ToolBatchOutcome::Resolved(Vec::new());
        };

        let mut results = Vec::new();
        let mut fragments = Vec::new();
        for (i, call) in calls.iter().enumerate() {
            let decision = decisions.get(&call.call_id);
            if let Some(Decision::Reject) = decision {
                results.push(ToolResult::rejected_by_reviewer(call.call_id.clone()));
                continue;
            }

            let arguments = match decision {
                Some(Decision::Edit { arguments }) => arguments.clone(),
                _ => call.arguments.clone(),
            };
            let ctx = ToolContext {
                agent_id: agent_id.to_string(),
                call_id: call.call_id.clone(),
                vfs: vfs.clone(),
                state: state.clone(),
                debug_events: debug_events.clone(),
            };
            let outcome = self.invoke(&call.name, call.call_id.clone(), arguments, ctx).await;
            if let Some(mut data) = outcome.interrupt {
                if let Some(hitl) = data.subagent_hitl.as_mut() {
                    hitl.completed_results = results.clone();
                    hitl.remaining_calls = calls[i + 1..].to_vec();
                }
                return ToolBatchOutcome::Interrupted { fragments, data };
            }
            results.push(outcome.result);
            if let Some(fragment) = outcome.state_fragment {
                fragments.push(fragment);
            }
        }

        if let Ok(tool_message) = Message::tool(results) {
            self.push(tool_message);
        }
        ToolBatchOutcome::Resolved(fragments)
    }

    pub(crate) async fn invoke(
        &self,
        name: &str,
        call_id: String,
        arguments: Map<String, serde_json::Value>,
        ctx: ToolContext,
    ) -> ToolOutcome {
        let Some(tool) = self.find_tool(name) else {
            log::warn!("tool call referenced unknown tool '{name}'");
            return ToolOutcome::result_only(ToolResult::error(call_id, format!("unknown tool: {name}")));
        };

        match (tool.function)(arguments, ctx).await {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("tool '{name}' execution failed: {err}");
                ToolOutcome::result_only(ToolResult::error(call_id, err.to_string()))
            }
        }
    }
}

fn has_pending_tool_calls(message: &Message) -> bool {
    message.tool_calls.as_ref().map_or(false, |calls| !calls.is_empty())
}
