//! The shared execute/resume inner loop — spec.md §4.5.
//!
//! Grounded in the teacher's `AgentExecutor::run` (the ReAct think/act loop
//! threading one mutable scratchpad through repeated model calls and tool
//! executions), reshaped around this crate's `Chain`/`State` split so the
//! exact same loop body drives `Agent::execute`, `Agent::resume`, and the
//! `SubAgent` engine (spec.md §4.6 reuses "the same inner loop logic").
//!
//! Cancellation threads a `CancellationToken` through the loop (spec.md §9:
//! "thread a cancellation token through the agent task; the `cancel`
//! operation closes the token and the worker promptly returns") rather than
//! the teacher's own executor, which has no cancellation concept at all —
//! `cancel` races the token against whichever await point is in flight (the
//! LLM call or a tool execution) so an abandoned turn returns promptly
//! instead of waiting out the call (spec.md §5 "any in-flight LLM-provider
//! request is abandoned; tool-result messages not yet committed to State are
//! lost").

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::chain::{Chain, ToolBatchOutcome};
use crate::error::RuntimeError;
use crate::hitl::{Decision, InterruptData};
use crate::llm::{LlmCallbacks, LlmRequest};
use crate::middleware::subagent::SubAgentMiddleware;
use crate::middleware::{self, AfterModelOutcome, MiddlewareEntry};
use crate::pubsub::Topic;
use crate::schemas::event::DebugEvent;
use crate::schemas::{Message, ToolResult};
use crate::state::State;
use crate::subagent::SubAgentOutcome;
use crate::vfs::VfsHandle;

/// What one `drive` call produced (spec.md §4.5 "ExecuteOutcome").
pub enum ExecuteOutcome {
    Completed(State),
    Interrupted(State, InterruptData),
    Cancelled(State),
}

/// Runs the model/tool loop until the turn completes, parks on a human
/// review interrupt, or is cancelled. `state` must already have had
/// `run_before_model` applied and `chain` already holds the messages to send
/// (spec.md §4.5 steps 1-2 are the caller's responsibility; this is steps
/// 3-4).
pub async fn drive(
    agent_id: &str,
    vfs: VfsHandle,
    mut chain: Chain,
    middleware: &[MiddlewareEntry],
    mut state: State,
    callbacks: &LlmCallbacks,
    debug_events: &Topic<DebugEvent>,
    cancel: &CancellationToken,
) -> Result<ExecuteOutcome, RuntimeError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(ExecuteOutcome::Cancelled(state));
        }

        if chain.needs_response() {
            let request = LlmRequest {
                messages: chain.messages.clone(),
                tools: chain.tools.clone(),
            };
            let call = chain.model_handle.transport.call(request, callbacks);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("agent '{agent_id}' cancelled while awaiting the model");
                    return Ok(ExecuteOutcome::Cancelled(state));
                }
                result = call => {
                    chain.push(result?.message);
                }
            }
        }

        if chain.has_pending_tool_calls() {
            let snapshot = state.clone().add_messages(chain.exchanged_messages().to_vec());
            match middleware::run_after_model(middleware, snapshot).await? {
                AfterModelOutcome::Interrupt(merged, data) => {
                    return Ok(ExecuteOutcome::Interrupted(merged, data));
                }
                AfterModelOutcome::Continue(patched) => {
                    sync_patched_tail(&mut chain, &patched);
                }
            }

            let batch = execute_tools_cancellable(agent_id, &vfs, &mut chain, &state, debug_events, cancel).await;
            let Some(batch) = batch else {
                return Ok(ExecuteOutcome::Cancelled(state));
            };
            match batch {
                ToolBatchOutcome::Resolved(fragments) => {
                    for fragment in fragments {
                        state = state.merge(fragment);
                    }
                    continue;
                }
                ToolBatchOutcome::Interrupted { fragments, data } => {
                    for fragment in fragments {
                        state = state.merge(fragment);
                    }
                    let merged = state.add_messages(chain.exchanged_messages().to_vec());
                    return Ok(ExecuteOutcome::Interrupted(merged, data));
                }
            }
        }

        let final_state = state.clone().add_messages(chain.exchanged_messages().to_vec());
        return match middleware::run_after_model(middleware, final_state).await? {
            AfterModelOutcome::Continue(merged) => Ok(ExecuteOutcome::Completed(merged)),
            AfterModelOutcome::Interrupt(merged, data) => Ok(ExecuteOutcome::Interrupted(merged, data)),
        };
    }
}

async fn execute_tools_cancellable(
    agent_id: &str,
    vfs: &VfsHandle,
    chain: &mut Chain,
    state: &State,
    debug_events: &Topic<DebugEvent>,
    cancel: &CancellationToken,
) -> Option<ToolBatchOutcome> {
    let execution = chain.execute_tool_calls(agent_id, vfs.clone(), Arc::new(state.clone()), debug_events);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            log::info!("agent '{agent_id}' cancelled while executing tool calls");
            None
        }
        batch = execution => Some(batch),
    }
}

/// Resumes a parked chain with human decisions (spec.md §4.5 resume steps):
/// validates the decisions, executes the pending tool calls honoring them,
/// clears the interrupt, and continues the same inner loop.
pub async fn resume(
    agent_id: &str,
    vfs: VfsHandle,
    mut chain: Chain,
    middleware: &[MiddlewareEntry],
    mut state: State,
    interrupt_data: &InterruptData,
    decisions: Vec<Decision>,
    callbacks: &LlmCallbacks,
    debug_events: &Topic<DebugEvent>,
    cancel: &CancellationToken,
) -> Result<ExecuteOutcome, RuntimeError> {
    if let Some(hitl) = interrupt_data.subagent_hitl.clone() {
        return resume_subagent(agent_id, vfs, chain, middleware, state, hitl, decisions, callbacks, debug_events, cancel).await;
    }

    crate::hitl::validate_resume(interrupt_data, &decisions)?;

    let Some(crate::schemas::Message { tool_calls: Some(calls), .. }) = chain.last_message().cloned() else {
        return Err(RuntimeError::Other("resume called without a pending tool-call turn".into()));
    };

    let decision_vector = crate::hitl::build_full_decision_vector(interrupt_data, &calls, &decisions);
    let batch = chain
        .execute_tool_calls_with_decisions(agent_id, vfs.clone(), Arc::new(state.clone()), &decision_vector, debug_events)
        .await;
    match batch {
        ToolBatchOutcome::Resolved(fragments) => {
            for fragment in fragments {
                state = state.merge(fragment);
            }
            state.interrupt_data = None;
            drive(agent_id, vfs, chain, middleware, state, callbacks, debug_events, cancel).await
        }
        ToolBatchOutcome::Interrupted { fragments, data } => {
            for fragment in fragments {
                state = state.merge(fragment);
            }
            state.interrupt_data = None;
            let merged = state.add_messages(chain.exchanged_messages().to_vec());
            Ok(ExecuteOutcome::Interrupted(merged, data))
        }
    }
}

/// Routes a resume whose parked `InterruptData` originated from a sub-agent
/// (spec.md §4.6): continues the parked `SubAgent` itself through the
/// `subagent` middleware's registry rather than re-invoking the `task` tool
/// call, which would restart the child from scratch.
#[allow(clippy::too_many_arguments)]
async fn resume_subagent(
    agent_id: &str,
    vfs: VfsHandle,
    mut chain: Chain,
    middleware: &[MiddlewareEntry],
    mut state: State,
    hitl: crate::hitl::SubAgentHitl,
    decisions: Vec<Decision>,
    callbacks: &LlmCallbacks,
    debug_events: &Topic<DebugEvent>,
    cancel: &CancellationToken,
) -> Result<ExecuteOutcome, RuntimeError> {
    let subagent_middleware = middleware
        .iter()
        .find_map(|entry| entry.implementation.as_any().downcast_ref::<SubAgentMiddleware>())
        .ok_or_else(|| RuntimeError::Other("resume targeted a sub-agent interrupt but no subagent middleware is active".into()))?;

    let outcome = subagent_middleware
        .resume_parked(&hitl.sub_agent_id, vfs.clone(), decisions, debug_events, cancel)
        .await?;

    match outcome {
        SubAgentOutcome::Completed { text, propagated_state } => {
            let mut results: Vec<ToolResult> = hitl.completed_results.clone();
            results.push(ToolResult::ok(hitl.parent_tool_call_id.clone(), text));

            for call in &hitl.remaining_calls {
                let ctx = crate::tool::ToolContext {
                    agent_id: agent_id.to_string(),
                    call_id: call.call_id.clone(),
                    vfs: vfs.clone(),
                    state: Arc::new(state.clone()),
                    debug_events: debug_events.clone(),
                };
                let outcome = chain.invoke(&call.name, call.call_id.clone(), call.arguments.clone(), ctx).await;
                if outcome.interrupt.is_some() {
                    return Err(RuntimeError::Other(format!(
                        "deferred call '{}' raised a nested interrupt; not supported while resuming sub-agent '{}'",
                        call.call_id, hitl.sub_agent_id
                    )));
                }
                results.push(outcome.result);
                if let Some(fragment) = outcome.state_fragment {
                    state = state.merge(fragment);
                }
            }

            state = state.merge(propagated_state);
            if let Ok(tool_message) = Message::tool(results) {
                chain.push(tool_message);
            }
            state.interrupt_data = None;
            drive(agent_id, vfs, chain, middleware, state, callbacks, debug_events, cancel).await
        }
        SubAgentOutcome::Interrupted { interrupt_data: mut new_data } => {
            new_data.subagent_hitl = Some(hitl);
            let merged = state.add_messages(chain.exchanged_messages().to_vec());
            Ok(ExecuteOutcome::Interrupted(merged, new_data))
        }
    }
}

/// After `after_model` middleware (e.g. `PatchToolCalls`) repairs the most
/// recent assistant message inside a `State` snapshot, write that repair
/// back into the chain's own copy so the subsequent tool execution sees it.
fn sync_patched_tail(chain: &mut Chain, patched: &State) {
    if let (Some(patched_last), Some(chain_last)) = (patched.messages.last(), chain.messages.last_mut()) {
        *chain_last = patched_last.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::schemas::{Message, ToolCall};
    use crate::vfs;
    use serde_json::Map;

    #[tokio::test]
    async fn drive_completes_on_plain_assistant_reply() {
        let model = MockLlm::handle("mock", vec![Message::assistant("hello there")]);
        let chain = Chain::new("", vec![Message::user("hi").unwrap()], vec![], model);
        let (vfs, _join) = vfs::spawn("agent-1");
        let outcome = drive(
            "agent-1",
            vfs,
            chain,
            &[],
            State::new(),
            &LlmCallbacks::default(),
            &crate::pubsub::debug_topic("agent-1"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        match outcome {
            ExecuteOutcome::Completed(state) => {
                assert_eq!(state.messages.last().unwrap().content.as_text(), "hello there");
            }
            _ => panic!("expected completed"),
        }
    }

    #[tokio::test]
    async fn drive_interrupts_when_hitl_middleware_gates_a_tool_call() {
        use crate::hitl::InterruptOn;
        use crate::middleware::human_in_the_loop::HumanInTheLoopMiddleware;

        let call = ToolCall::complete("c1", "write_file", Map::new(), 0);
        let model = MockLlm::handle("mock", vec![Message::assistant_with_tool_calls("", vec![call])]);
        let chain = Chain::new("", vec![Message::user("write it").unwrap()], vec![], model);
        let (vfs, _join) = vfs::spawn("agent-1");

        let mut interrupt_on = crate::hitl::InterruptOnMap::new();
        interrupt_on.insert("write_file".into(), InterruptOn::Flag(true));
        let entries = vec![MiddlewareEntry::new(
            Arc::new(HumanInTheLoopMiddleware::new(interrupt_on)),
            Map::new(),
        )];

        let outcome = drive(
            "agent-1",
            vfs,
            chain,
            &entries,
            State::new(),
            &LlmCallbacks::default(),
            &crate::pubsub::debug_topic("agent-1"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        match outcome {
            ExecuteOutcome::Interrupted(_, data) => {
                assert_eq!(data.hitl_tool_call_ids, vec!["c1".to_string()]);
            }
            _ => panic!("expected interrupt"),
        }
    }

    #[tokio::test]
    async fn drive_respects_a_token_cancelled_before_the_call() {
        let model = MockLlm::handle("mock", vec![]);
        let chain = Chain::new("", vec![Message::user("hi").unwrap()], vec![], model);
        let (vfs, _join) = vfs::spawn("agent-1");
        let token = CancellationToken::new();
        token.cancel();

        let outcome = drive(
            "agent-1",
            vfs,
            chain,
            &[],
            State::new(),
            &LlmCallbacks::default(),
            &crate::pubsub::debug_topic("agent-1"),
            &token,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, ExecuteOutcome::Cancelled(_)));
    }
}
