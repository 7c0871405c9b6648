//! The `Agent` value and its construction rules — spec.md §4.4.
//!
//! Grounded in the teacher's `UnifiedAgent::builder()` (collects a model,
//! tools, and a middleware-ish plugin list, then assembles one system prompt
//! and one tool set at construction time), reshaped to spec.md's exact
//! default middleware stack and id-generation rule.

use std::sync::Arc;

use uuid::Uuid;

use crate::engine::{self, ExecuteOutcome};
use crate::error::{ConfigError, RuntimeError};
use crate::hitl::{Decision, InterruptData, InterruptOnMap};
use crate::llm::{LlmCallbacks, ModelHandle};
use crate::middleware::filesystem::FileSystemMiddleware;
use crate::middleware::human_in_the_loop::HumanInTheLoopMiddleware;
use crate::middleware::patch_tool_calls::PatchToolCallsMiddleware;
use crate::middleware::subagent::SubAgentMiddleware;
use crate::middleware::summarization::SummarizationMiddleware;
use crate::middleware::todo_list::TodoListMiddleware;
use crate::middleware::{self, Middleware, MiddlewareEntry};
use crate::pubsub::Topic;
use crate::schemas::event::DebugEvent;
use crate::schemas::Message;
use crate::state::State;
use crate::subagent::SubAgentDefinition;
use crate::tool::ToolSpec;
use crate::vfs::VfsHandle;

/// Everything needed to build an `Agent` (spec.md §4.4 step 1-2).
pub struct AgentConfig {
    pub model_handle: ModelHandle,
    pub base_system_prompt: String,
    pub tools: Vec<ToolSpec>,
    pub interrupt_on: InterruptOnMap,
    pub subagents: Vec<SubAgentDefinition>,
    pub extra_middleware: Vec<Arc<dyn Middleware>>,
}

impl AgentConfig {
    pub fn new(model_handle: ModelHandle) -> Self {
        Self {
            model_handle,
            base_system_prompt: String::new(),
            tools: Vec::new(),
            interrupt_on: InterruptOnMap::new(),
            subagents: Vec::new(),
            extra_middleware: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.base_system_prompt = prompt.into();
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

    pub fn with_subagents(mut self, subagents: Vec<SubAgentDefinition>) -> Self {
        self.subagents = subagents;
        self
    }
}

/// A fully assembled agent: one model, one middleware stack, one tool set,
/// one system prompt, all fixed at construction time (spec.md §4.4).
/// Immutable during a run; an `AgentServer` replaces it atomically via
/// `update_agent_and_state` (spec.md §5) rather than mutating it in place.
#[derive(Clone)]
pub struct Agent {
    pub id: String,
    pub model_handle: ModelHandle,
    pub middleware: Vec<MiddlewareEntry>,
    pub tools: Vec<ToolSpec>,
    pub assembled_system_prompt: String,
}

impl Agent {
    /// Builds the default middleware stack (spec.md §4.4 step 3:
    /// `[TodoList, FileSystem, SubAgent, Summarization, PatchToolCalls]`,
    /// plus `HumanInTheLoop` only when at least one tool is gated) and
    /// assembles the system prompt and tool set from it.
    pub fn new(config: AgentConfig) -> Result<Self, ConfigError> {
        let id = format!("agent_{}", Uuid::new_v4().simple());

        let mut stack: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(TodoListMiddleware::new()),
            Arc::new(FileSystemMiddleware::new()),
            Arc::new(SubAgentMiddleware::new(config.subagents)),
            Arc::new(SummarizationMiddleware::new()),
            Arc::new(PatchToolCallsMiddleware::new()),
        ];
        if !config.interrupt_on.is_empty() {
            stack.push(Arc::new(HumanInTheLoopMiddleware::new(config.interrupt_on)));
        }
        stack.extend(config.extra_middleware);

        let mut seen = std::collections::HashSet::new();
        let mut entries = Vec::with_capacity(stack.len());
        for implementation in stack {
            let entry = MiddlewareEntry::new(implementation, serde_json::Map::new());
            if !seen.insert(entry.id.clone()) {
                return Err(ConfigError::DuplicateMiddlewareId(entry.id));
            }
            entries.push(entry);
        }

        let tools = middleware::union_tools(&entries, config.tools);
        let assembled_system_prompt = middleware::assemble_system_prompt(&config.base_system_prompt, &entries);

        Ok(Self {
            id,
            model_handle: config.model_handle,
            middleware: entries,
            tools,
            assembled_system_prompt,
        })
    }

    /// Runs one full turn: appends `user_input` (when given) to `state`, runs
    /// `before_model`, then drives the model/tool-call loop to completion,
    /// interrupt, or cancellation (spec.md §4.5 steps 1-4).
    pub async fn execute(
        &self,
        vfs: VfsHandle,
        mut state: State,
        user_input: Option<String>,
        callbacks: &LlmCallbacks,
        debug_events: &Topic<DebugEvent>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<ExecuteOutcome, RuntimeError> {
        if let Some(text) = user_input {
            let message = Message::user(text).map_err(|e| RuntimeError::Other(e.to_string()))?;
            state = state.add_message(message);
        }

        let state = middleware::run_before_model(&self.middleware, state).await?;
        let chain = crate::chain::Chain::new(
            &self.assembled_system_prompt,
            state.messages.clone(),
            self.tools.clone(),
            self.model_handle.clone(),
        );

        engine::drive(&self.id, vfs, chain, &self.middleware, state, callbacks, debug_events, cancel).await
    }

    /// Resumes a parked turn with human decisions (spec.md §4.5 resume
    /// steps). `state` must be the `Interrupted` state returned by a prior
    /// `execute`/`resume` call, whose last message is the gated assistant
    /// tool-call turn.
    pub async fn resume(
        &self,
        vfs: VfsHandle,
        state: State,
        interrupt_data: &InterruptData,
        decisions: Vec<Decision>,
        callbacks: &LlmCallbacks,
        debug_events: &Topic<DebugEvent>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<ExecuteOutcome, RuntimeError> {
        let chain = crate::chain::Chain::new(
            &self.assembled_system_prompt,
            state.messages.clone(),
            self.tools.clone(),
            self.model_handle.clone(),
        );

        engine::resume(
            &self.id,
            vfs,
            chain,
            &self.middleware,
            state,
            interrupt_data,
            decisions,
            callbacks,
            debug_events,
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::vfs;

    #[tokio::test]
    async fn execute_runs_a_plain_turn_to_completion() {
        let model = MockLlm::handle("mock", vec![Message::assistant("hi there")]);
        let agent = Agent::new(AgentConfig::new(model)).unwrap();
        let (vfs, _join) = vfs::spawn(agent.id.clone());

        let debug_events = crate::pubsub::debug_topic(&agent.id);
        let outcome = agent
            .execute(
                vfs,
                State::new(),
                Some("hello".into()),
                &LlmCallbacks::default(),
                &debug_events,
                &tokio_util::sync::CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            ExecuteOutcome::Completed(state) => {
                assert_eq!(state.messages.last().unwrap().content.as_text(), "hi there");
            }
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn default_stack_assembles_todo_and_filesystem_tool_names() {
        let model = MockLlm::handle("mock", vec![]);
        let agent = Agent::new(AgentConfig::new(model)).unwrap();
        let names: Vec<&str> = agent.tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"write_todos"));
        assert!(names.contains(&"write_file"));
    }

    #[test]
    fn agent_id_has_the_required_prefix() {
        let model = MockLlm::handle("mock", vec![]);
        let agent = Agent::new(AgentConfig::new(model)).unwrap();
        assert!(agent.id.starts_with("agent_"));
    }
}
