//! The SubAgent engine — spec.md §4.6.
//!
//! Grounded in the teacher's `deep_agent::tools::task::TaskTool` /
//! `SubagentTool::run_with_runtime` (a child `UnifiedAgent` run to completion
//! and folded back into one tool result), reshaped around this crate's
//! `Chain`/`State` so the sub-agent reuses the exact same model/tool-call
//! loop body as the top-level agent (`crate::engine`) instead of the
//! teacher's own executor. Unlike the top-level agent, a sub-agent's turn
//! has no `before_model`/`after_model` middleware stack of its own — spec.md
//! §4.6 only asks for "identical inner loop to §4.5 steps 3(a-c)" — so HITL
//! gating here is a direct `hitl::detect_interrupt` call against the
//! sub-agent's own `interrupt_on` map, not a layered `Middleware`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::chain::{Chain, ToolBatchOutcome};
use crate::error::RuntimeError;
use crate::hitl::{self, Decision, InterruptData, InterruptOnMap};
use crate::llm::{LlmCallbacks, LlmRequest, ModelHandle};
use crate::pubsub::Topic;
use crate::schemas::event::{AgentStatus, DebugEvent, SubAgentEvent};
use crate::schemas::Message;
use crate::state::State;
use crate::tool::ToolSpec;
use crate::vfs::VfsHandle;

/// Maps a sub-agent's own status vocabulary onto the shared `AgentStatus`
/// wire type used for `SubAgentEvent::SubagentStatusChanged` (spec.md §6):
/// `Completed` settles to the same `Idle` value a top-level agent reaches
/// after finishing a turn, since the debug topic has no separate terminal
/// "done" status.
fn as_agent_status(status: SubAgentStatus) -> AgentStatus {
    match status {
        SubAgentStatus::Idle => AgentStatus::Idle,
        SubAgentStatus::Running => AgentStatus::Running,
        SubAgentStatus::Interrupted => AgentStatus::Interrupted,
        SubAgentStatus::Completed => AgentStatus::Idle,
        SubAgentStatus::Error => AgentStatus::Error,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubAgentStatus {
    Idle,
    Running,
    Interrupted,
    Completed,
    Error,
}

/// A compiled sub-agent definition (spec.md §4.6 "agent_config OR
/// compiled_agent"): everything needed to run an isolated child turn,
/// carried alongside the `task` tool rather than resolved through the
/// parent's own `Agent`, since middleware tools have no reference to it.
#[derive(Clone)]
pub struct SubAgentDefinition {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub model_handle: ModelHandle,
    pub tools: Vec<ToolSpec>,
    pub interrupt_on: InterruptOnMap,
}

impl SubAgentDefinition {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>, model_handle: ModelHandle) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            system_prompt: system_prompt.into(),
            model_handle,
            tools: Vec::new(),
            interrupt_on: InterruptOnMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_interrupt_on(mut self, interrupt_on: InterruptOnMap) -> Self {
        self.interrupt_on = interrupt_on;
        self
    }
}

/// A running or parked child computation (spec.md §4.6 value).
pub struct SubAgent {
    pub id: String,
    pub parent_agent_id: String,
    pub status: SubAgentStatus,
    pub interrupt_on: InterruptOnMap,
    pub interrupt_data: Option<InterruptData>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    chain: Chain,
    /// Accumulated across the whole lifetime of the sub-agent, including
    /// across a park/`resume` boundary — promoted out of `run`'s stack frame
    /// so an interrupted sub-agent can be resumed instead of restarted.
    local_state: State,
}

/// Monotonic per-parent counter for `"<parent>-sub-<n>"` ids (spec.md §4.6).
#[derive(Default)]
pub struct SubAgentCounter(AtomicU64);

impl SubAgentCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn next_id(&self, parent_agent_id: &str) -> String {
        let n = self.0.fetch_add(1, Ordering::SeqCst);
        format!("{parent_agent_id}-sub-{n}")
    }
}

pub enum SubAgentOutcome {
    Completed { text: String, propagated_state: State },
    Interrupted { interrupt_data: InterruptData },
}

impl SubAgent {
    /// Builds initial messages `[system(prompt), user(instructions)]` per
    /// spec.md §4.6; deliberately does not inherit the parent's messages or
    /// todos, only a snapshot is used to seed nothing — files/metadata
    /// sharing happens through the shared `VfsHandle`, not through `State`.
    pub fn new(
        counter: &SubAgentCounter,
        parent_agent_id: &str,
        instructions: &str,
        definition: &SubAgentDefinition,
    ) -> Self {
        let id = counter.next_id(parent_agent_id);
        let messages = vec![
            Message::system(definition.system_prompt.as_str()).unwrap_or_else(|_| Message::assistant("")),
            Message::user(instructions).unwrap_or_else(|_| Message::assistant("continue")),
        ];
        let chain = Chain::new("", messages, definition.tools.clone(), definition.model_handle.clone());
        Self {
            id,
            parent_agent_id: parent_agent_id.to_string(),
            status: SubAgentStatus::Idle,
            interrupt_on: definition.interrupt_on.clone(),
            interrupt_data: None,
            error: None,
            created_at: Utc::now(),
            chain,
            local_state: State::new(),
        }
    }

    fn merge_local(&mut self, fragment: State) {
        let current = std::mem::replace(&mut self.local_state, State::new());
        self.local_state = current.merge(fragment);
    }

    fn publish(&self, debug_events: &Topic<DebugEvent>, event: SubAgentEvent) {
        debug_events.publish(DebugEvent::Subagent {
            sub_agent_id: self.id.clone(),
            event,
        });
    }

    /// Runs the inner loop to completion or interrupt (spec.md §4.6
    /// "identical inner loop to §4.5 steps 3(a-c)").
    pub async fn run(
        &mut self,
        vfs: VfsHandle,
        parent_metadata: serde_json::Map<String, serde_json::Value>,
        debug_events: &Topic<DebugEvent>,
        cancel: &CancellationToken,
    ) -> Result<SubAgentOutcome, RuntimeError> {
        self.local_state.metadata = parent_metadata;
        self.publish(
            debug_events,
            SubAgentEvent::SubagentStarted {
                meta: serde_json::json!({ "parent_agent_id": self.parent_agent_id }),
            },
        );
        self.run_inner(vfs, debug_events, cancel).await
    }

    /// Continues a parked sub-agent after a human decision on its own gated
    /// tool call (spec.md §4.6 interrupt propagation, resume side). Applies
    /// `decisions` to exactly the batch that parked, same as
    /// `engine::resume` does for a top-level agent.
    pub async fn resume(
        &mut self,
        vfs: VfsHandle,
        decisions: Vec<Decision>,
        debug_events: &Topic<DebugEvent>,
        cancel: &CancellationToken,
    ) -> Result<SubAgentOutcome, RuntimeError> {
        let interrupt_data = self
            .interrupt_data
            .clone()
            .ok_or_else(|| RuntimeError::Other(format!("sub-agent '{}' has no pending interrupt to resume", self.id)))?;
        hitl::validate_resume(&interrupt_data, &decisions)
            .map_err(|err| RuntimeError::Other(err.to_string()))?;

        let Some(Message { tool_calls: Some(calls), .. }) = self.chain.last_message().cloned() else {
            return Err(RuntimeError::Other(format!(
                "sub-agent '{}' has no pending tool calls to resume",
                self.id
            )));
        };
        let decision_vector = hitl::build_full_decision_vector(&interrupt_data, &calls, &decisions);

        let batch = self
            .chain
            .execute_tool_calls_with_decisions(&self.id, vfs.clone(), Arc::new(self.local_state.clone()), &decision_vector, debug_events)
            .await;
        match batch {
            ToolBatchOutcome::Resolved(fragments) => {
                for fragment in fragments {
                    self.merge_local(fragment);
                }
                self.interrupt_data = None;
                self.publish(debug_events, SubAgentEvent::SubagentStatusChanged { status: AgentStatus::Running });
                self.run_inner(vfs, debug_events, cancel).await
            }
            ToolBatchOutcome::Interrupted { fragments, data } => {
                for fragment in fragments {
                    self.merge_local(fragment);
                }
                self.status = SubAgentStatus::Interrupted;
                self.interrupt_data = Some(data.clone());
                self.publish(debug_events, SubAgentEvent::SubagentStatusChanged { status: AgentStatus::Interrupted });
                Ok(SubAgentOutcome::Interrupted { interrupt_data: data })
            }
        }
    }

    async fn run_inner(
        &mut self,
        vfs: VfsHandle,
        debug_events: &Topic<DebugEvent>,
        cancel: &CancellationToken,
    ) -> Result<SubAgentOutcome, RuntimeError> {
        self.status = SubAgentStatus::Running;
        let callbacks = LlmCallbacks::default();

        loop {
            if cancel.is_cancelled() {
                self.status = SubAgentStatus::Error;
                self.error = Some("cancelled".into());
                self.publish(debug_events, SubAgentEvent::SubagentError { reason: "cancelled".into() });
                return Err(RuntimeError::Other(format!("sub-agent '{}' cancelled", self.id)));
            }

            if self.chain.needs_response() {
                let request = LlmRequest {
                    messages: self.chain.messages.clone(),
                    tools: self.chain.tools.clone(),
                };
                let response = self.chain.model_handle.transport.call(request, &callbacks).await?;
                self.chain.push(response.message.clone());
                self.publish(debug_events, SubAgentEvent::SubagentLlmMessage { message: response.message });
            }

            if self.chain.has_pending_tool_calls() {
                let Some(crate::schemas::Message { tool_calls: Some(calls), .. }) = self.chain.last_message().cloned()
                else {
                    continue;
                };

                if let Some(data) = hitl::detect_interrupt(&self.interrupt_on, &calls) {
                    self.status = SubAgentStatus::Interrupted;
                    self.interrupt_data = Some(data.clone());
                    self.publish(debug_events, SubAgentEvent::SubagentStatusChanged { status: AgentStatus::Interrupted });
                    return Ok(SubAgentOutcome::Interrupted { interrupt_data: data });
                }

                let batch = self
                    .chain
                    .execute_tool_calls(&self.id, vfs.clone(), Arc::new(self.local_state.clone()), debug_events)
                    .await;
                match batch {
                    ToolBatchOutcome::Resolved(fragments) => {
                        for fragment in fragments {
                            self.merge_local(fragment);
                        }
                        continue;
                    }
                    ToolBatchOutcome::Interrupted { fragments, data } => {
                        for fragment in fragments {
                            self.merge_local(fragment);
                        }
                        self.status = SubAgentStatus::Interrupted;
                        self.interrupt_data = Some(data.clone());
                        self.publish(debug_events, SubAgentEvent::SubagentStatusChanged { status: AgentStatus::Interrupted });
                        return Ok(SubAgentOutcome::Interrupted { interrupt_data: data });
                    }
                }
            }

            self.status = SubAgentStatus::Completed;
            let text = self.chain.last_message().map(|m| m.content.as_text()).unwrap_or_default();

            // Discard the child's own conversation/todos; only metadata
            // changes propagate (spec.md §4.6 state-transfer discipline).
            let propagated_state = State {
                messages: Vec::new(),
                todos: Vec::new(),
                files_index: self.local_state.files_index.clone(),
                metadata: self.local_state.metadata.clone(),
                middleware_state: HashMap::new(),
                interrupt_data: None,
            };
            self.publish(
                debug_events,
                SubAgentEvent::SubagentCompleted {
                    meta: serde_json::json!({ "status": as_agent_status(self.status) }),
                },
            );
            return Ok(SubAgentOutcome::Completed { text, propagated_state });
        }
    }
}

/// The sub-agents dynamic supervisor child (spec.md §4.8: VFS →
/// AgentServer → SubAgentsDynamicSupervisor). Sub-agents here are spawned
/// per-call from inside a `task` tool invocation rather than as long-lived
/// registered processes, so this child's job is periodic housekeeping over
/// the parked-sub-agent registry (reporting how many are sitting on human
/// review) rather than owning any sub-agent's own task. Runs until `cancel`
/// fires, which the supervisor's `rest_for_one` restart does alongside the
/// VFS/AgentServer children.
pub async fn run_dynamic_supervisor(
    agent_id: String,
    parked: Option<crate::middleware::subagent::ParkedSubAgents>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("agent '{agent_id}' sub-agent dynamic supervisor stopping");
                return;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
                if let Some(parked) = &parked {
                    if !parked.is_empty() {
                        log::debug!("agent '{agent_id}' has {} sub-agent(s) parked on human review", parked.len());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::vfs;

    #[tokio::test]
    async fn completes_and_propagates_only_metadata() {
        let model = MockLlm::handle("mock", vec![Message::assistant("the report is done")]);
        let definition = SubAgentDefinition::new("researcher", "You are a researcher.", model);
        let counter = SubAgentCounter::new();
        let mut sub = SubAgent::new(&counter, "parent-1", "research X", &definition);
        assert_eq!(sub.id, "parent-1-sub-0");

        let (vfs, _join) = vfs::spawn("parent-1");
        let debug_events = crate::pubsub::debug_topic("parent-1");
        let outcome = sub.run(vfs, serde_json::Map::new(), &debug_events, &CancellationToken::new()).await.unwrap();
        match outcome {
            SubAgentOutcome::Completed { text, propagated_state } => {
                assert_eq!(text, "the report is done");
                assert!(propagated_state.messages.is_empty());
                assert!(propagated_state.todos.is_empty());
            }
            _ => panic!("expected completion"),
        }
        assert_eq!(sub.status, SubAgentStatus::Completed);
    }

    #[tokio::test]
    async fn interrupts_on_its_own_gated_tool() {
        use crate::hitl::InterruptOn;
        use crate::schemas::ToolCall;
        use serde_json::Map;

        let call = ToolCall::complete("c1", "write_file", Map::new(), 0);
        let model = MockLlm::handle("mock", vec![Message::assistant_with_tool_calls("", vec![call])]);
        let mut interrupt_on = InterruptOnMap::new();
        interrupt_on.insert("write_file".into(), InterruptOn::Flag(true));
        let definition = SubAgentDefinition::new("writer", "You write files.", model).with_interrupt_on(interrupt_on);

        let counter = SubAgentCounter::new();
        let mut sub = SubAgent::new(&counter, "parent-1", "write it", &definition);
        let (vfs, _join) = vfs::spawn("parent-1");
        let debug_events = crate::pubsub::debug_topic("parent-1");
        let outcome = sub.run(vfs, Map::new(), &debug_events, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, SubAgentOutcome::Interrupted { .. }));
        assert_eq!(sub.status, SubAgentStatus::Interrupted);
    }
}
