//! SubAgent middleware — spec.md §2 default stack, §4.4 step 3, §4.6.
//!
//! Grounded in the teacher's `deep_agent::tools::task::TaskTool`
//! (`SubagentTool::run_with_runtime`, which looks up a named sub-agent
//! definition and runs it to completion as one tool call). Contributes a
//! single `task` tool; the actual child run is delegated to
//! `crate::subagent::SubAgent`, which reuses the shared inner loop rather
//! than a second copy of the teacher's `AgentExecutor`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::Middleware;
use crate::error::RuntimeError;
use crate::hitl::{Decision, SubAgentHitl};
use crate::pubsub::Topic;
use crate::schemas::event::DebugEvent;
use crate::schemas::ToolResult;
use crate::subagent::{SubAgent, SubAgentCounter, SubAgentDefinition, SubAgentOutcome};
use crate::tool::{FunctionParam, ParamType, ToolContext, ToolError, ToolOutcome, ToolSpec};
use crate::vfs::VfsHandle;

/// Sub-agents parked on their own gated tool call, keyed by `sub_agent_id`
/// (spec.md §4.6 interrupt propagation): `run_task` inserts one when the
/// child itself interrupts instead of discarding it, and `resume_parked`
/// removes it again once a human decision lets the child continue or finish.
pub type ParkedSubAgents = Arc<DashMap<String, SubAgent>>;

/// Contributes the `task` tool, dispatching by `subagent_id` to one of a
/// fixed set of compiled sub-agent definitions (spec.md §4.6 "agent_config
/// OR compiled_agent").
pub struct SubAgentMiddleware {
    definitions: Vec<SubAgentDefinition>,
    counter: Arc<SubAgentCounter>,
    parked: ParkedSubAgents,
}

impl SubAgentMiddleware {
    pub const ID: &'static str = "subagent";

    pub fn new(definitions: Vec<SubAgentDefinition>) -> Self {
        Self {
            definitions,
            counter: Arc::new(SubAgentCounter::new()),
            parked: Arc::new(DashMap::new()),
        }
    }

    fn describe_available(&self) -> String {
        self.definitions
            .iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Shared handle onto the parked-sub-agent registry, for the dynamic
    /// supervisor child to inspect/clear on a subtree restart.
    pub fn parked(&self) -> ParkedSubAgents {
        self.parked.clone()
    }

    /// Continues a sub-agent parked by a prior `task` call (`engine::resume`'s
    /// `subagent_hitl` path). Removes the entry on both completion and a
    /// repeated interrupt; a repeated interrupt is re-inserted by the caller
    /// rebuilding a fresh `SubAgentHitl`-tagged `InterruptData`, mirroring
    /// what `run_task` does the first time the child parks.
    pub async fn resume_parked(
        &self,
        sub_agent_id: &str,
        vfs: VfsHandle,
        decisions: Vec<Decision>,
        debug_events: &Topic<DebugEvent>,
        cancel: &CancellationToken,
    ) -> Result<SubAgentOutcome, RuntimeError> {
        let (_, mut sub) = self
            .parked
            .remove(sub_agent_id)
            .ok_or_else(|| RuntimeError::Other(format!("no parked sub-agent '{sub_agent_id}'")))?;

        let outcome = sub.resume(vfs, decisions, debug_events, cancel).await?;
        if matches!(outcome, SubAgentOutcome::Interrupted { .. }) {
            self.parked.insert(sub_agent_id.to_string(), sub);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Middleware for SubAgentMiddleware {
    fn id(&self) -> &str {
        Self::ID
    }

    fn system_prompt(&self, _config: &Map<String, Value>) -> Vec<String> {
        if self.definitions.is_empty() {
            return Vec::new();
        }
        vec![format!(
            "You can delegate focused sub-tasks to the `task` tool. Available sub-agents:\n{}",
            self.describe_available()
        )]
    }

    fn tools(&self, _config: &Map<String, Value>) -> Vec<ToolSpec> {
        if self.definitions.is_empty() {
            return Vec::new();
        }

        let definitions = self.definitions.clone();
        let counter = self.counter.clone();
        let parked = self.parked.clone();

        vec![ToolSpec::new(
            "task",
            "Delegates a self-contained instruction to a named sub-agent and returns its final answer.",
            vec![
                FunctionParam::new("subagent_id", ParamType::String)
                    .with_description("Name of the sub-agent to run")
                    .required(),
                FunctionParam::new("instructions", ParamType::String)
                    .with_description("The task instructions handed to the sub-agent as its user turn")
                    .required(),
            ],
            Arc::new(move |args, ctx: ToolContext| {
                let definitions = definitions.clone();
                let counter = counter.clone();
                let parked = parked.clone();
                Box::pin(async move { run_task(args, ctx, &definitions, &counter, &parked).await })
            }),
        )]
    }
}

async fn run_task(
    args: Map<String, Value>,
    ctx: ToolContext,
    definitions: &[SubAgentDefinition],
    counter: &SubAgentCounter,
    parked: &ParkedSubAgents,
) -> Result<ToolOutcome, ToolError> {
    let subagent_id = args
        .get("subagent_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::ExecutionFailed {
            name: "task".into(),
            reason: "missing 'subagent_id' argument".into(),
        })?;
    let instructions = args
        .get("instructions")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::ExecutionFailed {
            name: "task".into(),
            reason: "missing 'instructions' argument".into(),
        })?;

    let definition = definitions
        .iter()
        .find(|d| d.name == subagent_id)
        .ok_or_else(|| ToolError::ExecutionFailed {
            name: "task".into(),
            reason: format!("unknown sub-agent '{subagent_id}'"),
        })?;

    let mut sub = SubAgent::new(counter, &ctx.agent_id, instructions, definition);
    let cancel = CancellationToken::new();
    let outcome = sub
        .run(ctx.vfs.clone(), ctx.state.metadata.clone(), &ctx.debug_events, &cancel)
        .await
        .map_err(|e| ToolError::ExecutionFailed {
            name: "task".into(),
            reason: e.to_string(),
        })?;

    match outcome {
        SubAgentOutcome::Completed { text, propagated_state } => Ok(ToolOutcome::with_state_fragment(
            ToolResult::ok(ctx.call_id.clone(), text),
            propagated_state,
        )),
        SubAgentOutcome::Interrupted { mut interrupt_data } => {
            log::info!(
                "sub-agent '{}' parked on human review for {} call(s)",
                sub.id,
                interrupt_data.hitl_tool_call_ids.len()
            );
            let sub_agent_id = sub.id.clone();
            interrupt_data.subagent_hitl = Some(SubAgentHitl {
                sub_agent_id: sub_agent_id.clone(),
                parent_tool_call_id: ctx.call_id.clone(),
                completed_results: Vec::new(),
                remaining_calls: Vec::new(),
            });
            parked.insert(sub_agent_id, sub);

            // A placeholder never shown to the LLM — the chain parks the
            // whole turn instead of appending a tool-result message here.
            let placeholder = ToolResult::error(ctx.call_id.clone(), "awaiting human review".to_string());
            Ok(ToolOutcome::interrupted(placeholder, interrupt_data))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::schemas::Message;
    use crate::state::State;
    use crate::vfs;

    #[tokio::test]
    async fn task_tool_routes_to_named_subagent_and_returns_its_text() {
        let model = MockLlm::handle("mock", vec![Message::assistant("summary: done")]);
        let definition = SubAgentDefinition::new("researcher", "You research.", model)
            .with_description("Looks things up");
        let middleware = SubAgentMiddleware::new(vec![definition]);
        let tools = middleware.tools(&Map::new());
        assert_eq!(tools.len(), 1);

        let (vfs, _join) = vfs::spawn("agent-1");
        let ctx = ToolContext {
            agent_id: "agent-1".into(),
            call_id: "call-1".into(),
            vfs,
            state: Arc::new(State::new()),
            debug_events: crate::pubsub::debug_topic("agent-1"),
        };
        let mut args = Map::new();
        args.insert("subagent_id".into(), Value::String("researcher".into()));
        args.insert("instructions".into(), Value::String("look up X".into()));

        let outcome = (tools[0].function)(args, ctx).await.unwrap();
        assert_eq!(outcome.result.content.as_text(), "summary: done");
        assert!(!outcome.result.is_error);
    }

    #[tokio::test]
    async fn task_tool_errors_on_unknown_subagent() {
        let middleware = SubAgentMiddleware::new(vec![SubAgentDefinition::new(
            "researcher",
            "You research.",
            MockLlm::handle("mock", vec![]),
        )]);
        let tools = middleware.tools(&Map::new());
        let (vfs, _join) = vfs::spawn("agent-1");
        let ctx = ToolContext {
            agent_id: "agent-1".into(),
            call_id: "call-1".into(),
            vfs,
            state: Arc::new(State::new()),
            debug_events: crate::pubsub::debug_topic("agent-1"),
        };
        let mut args = Map::new();
        args.insert("subagent_id".into(), Value::String("ghost".into()));
        args.insert("instructions".into(), Value::String("go".into()));

        let result = (tools[0].function)(args, ctx).await;
        assert!(result.is_err());
    }
}
