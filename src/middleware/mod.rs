//! The middleware contract and its composition rules — spec.md §4.3.
//!
//! Reauthored from scratch against spec.md's exact hook set (the teacher's
//! own `agent::middleware::Middleware` trait has a much larger, differently
//! shaped hook surface — `before_tool_call`/`after_tool_call`/`before_agent_plan`
//! etc. — aimed at its ReAct executor). What is kept from the teacher is the
//! *idiom*: every hook optional with an identity default, and an explicit
//! bookkeeping value (`MiddlewareContext` in the teacher, folded into
//! `State`/`config` here) threaded through instead of shared mutable state.

pub mod filesystem;
pub mod human_in_the_loop;
pub mod patch_tool_calls;
pub mod subagent;
pub mod summarization;
pub mod todo_list;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::hitl::InterruptData;
use crate::state::State;
use crate::tool::ToolSpec;

#[derive(Debug, Error)]
#[error("middleware aborted the turn: {0}")]
pub struct MiddlewareError(pub String);

/// Outcome of `after_model`: either the turn continues normally, or the
/// middleware detected work that must park for human review.
pub enum AfterModelOutcome {
    Continue(State),
    Interrupt(State, InterruptData),
}

/// A composable hook-provider (spec.md §4.3). All methods default to
/// identity — a middleware implements only the hooks it needs.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable identity used as the default `MiddlewareEntry.id` and as the
    /// debug-topic `middleware_id` for `DebugEvent::MiddlewareStateUpdate`.
    fn id(&self) -> &str;

    /// Called once at agent construction; returns the runtime config map
    /// that subsequent hooks receive.
    fn init(&self, config: Map<String, Value>) -> Map<String, Value> {
        config
    }

    /// Contributed to the assembled system prompt, in declaration order,
    /// joined with blank-line separators; empty entries are dropped.
    fn system_prompt(&self, _config: &Map<String, Value>) -> Vec<String> {
        Vec::new()
    }

    /// Tool specs added to the agent's tool set.
    fn tools(&self, _config: &Map<String, Value>) -> Vec<ToolSpec> {
        Vec::new()
    }

    async fn before_model(&self, state: State, _config: &Map<String, Value>) -> Result<State, MiddlewareError> {
        Ok(state)
    }

    async fn after_model(
        &self,
        state: State,
        _config: &Map<String, Value>,
    ) -> Result<AfterModelOutcome, MiddlewareError> {
        Ok(AfterModelOutcome::Continue(state))
    }

    /// Receives asynchronous payloads addressed to this middleware id.
    async fn handle_message(&self, state: State, _message: Value, _config: &Map<String, Value>) -> Result<State, MiddlewareError> {
        Ok(state)
    }

    /// Called once when the agent server starts or restarts.
    async fn on_server_start(&self, state: State, _config: &Map<String, Value>) -> Result<State, MiddlewareError> {
        Ok(state)
    }

    /// Downcast hook for callers that need a concrete middleware type back
    /// out of a `dyn Middleware` (the engine's resume path looks up the
    /// active `SubAgentMiddleware` this way to reach its parked sub-agents).
    fn as_any(&self) -> &dyn std::any::Any
    where
        Self: 'static,
    {
        self
    }
}

/// `{id, implementation, config}` (spec.md §3 `MiddlewareEntry`).
#[derive(Clone)]
pub struct MiddlewareEntry {
    pub id: String,
    pub implementation: Arc<dyn Middleware>,
    pub config: Map<String, Value>,
}

impl MiddlewareEntry {
    pub fn new(implementation: Arc<dyn Middleware>, raw_config: Map<String, Value>) -> Self {
        let id = implementation.id().to_string();
        let config = implementation.init(raw_config);
        Self { id, implementation, config }
    }
}

/// Assembles the system prompt from a base prompt plus each entry's
/// contribution, in declaration order (spec.md §4.4 step 5).
pub fn assemble_system_prompt(base_prompt: &str, entries: &[MiddlewareEntry]) -> String {
    let mut sections: Vec<String> = Vec::new();
    if !base_prompt.is_empty() {
        sections.push(base_prompt.to_string());
    }
    for entry in entries {
        for section in entry.implementation.system_prompt(&entry.config) {
            if !section.is_empty() {
                sections.push(section);
            }
        }
    }
    sections.join("\n\n")
}

/// Unions middleware-provided tools with user-provided tools (spec.md §4.4
/// step 6). Middleware tools are added first, in declaration order; a
/// user-provided tool with the same name overrides a middleware one.
pub fn union_tools(entries: &[MiddlewareEntry], user_tools: Vec<ToolSpec>) -> Vec<ToolSpec> {
    let mut by_name: Vec<ToolSpec> = Vec::new();
    for entry in entries {
        for tool in entry.implementation.tools(&entry.config) {
            by_name.retain(|t: &ToolSpec| t.name != tool.name);
            by_name.push(tool);
        }
    }
    for tool in user_tools {
        by_name.retain(|t: &ToolSpec| t.name != tool.name);
        by_name.push(tool);
    }
    by_name
}

/// Runs `before_model` in declaration order (spec.md §4.3, §4.5 step 1).
/// Aborts at the first error.
pub async fn run_before_model(entries: &[MiddlewareEntry], mut state: State) -> Result<State, MiddlewareError> {
    for entry in entries {
        state = entry.implementation.before_model(state, &entry.config).await?;
    }
    Ok(state)
}

/// Runs `after_model` in REVERSE declaration order (spec.md §4.3). Stops and
/// surfaces an interrupt as soon as one is raised, without running any
/// earlier-declared (now-later-executing) middleware's `after_model`.
pub async fn run_after_model(entries: &[MiddlewareEntry], mut state: State) -> Result<AfterModelOutcome, MiddlewareError> {
    for entry in entries.iter().rev() {
        match entry.implementation.after_model(state, &entry.config).await? {
            AfterModelOutcome::Continue(next) => state = next,
            interrupted @ AfterModelOutcome::Interrupt(..) => return Ok(interrupted),
        }
    }
    Ok(AfterModelOutcome::Continue(state))
}

/// Runs `on_server_start` for every entry, in declaration order.
pub async fn run_on_server_start(entries: &[MiddlewareEntry], mut state: State) -> Result<State, MiddlewareError> {
    for entry in entries {
        state = entry.implementation.on_server_start(state, &entry.config).await?;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Prefixing(&'static str);

    #[async_trait]
    impl Middleware for Prefixing {
        fn id(&self) -> &str {
            self.0
        }

        fn system_prompt(&self, _config: &Map<String, Value>) -> Vec<String> {
            vec![format!("[{}]", self.0)]
        }

        async fn before_model(&self, state: State, _config: &Map<String, Value>) -> Result<State, MiddlewareError> {
            Ok(state.put_metadata(self.0, Value::Bool(true)))
        }
    }

    struct AlwaysAborts;

    #[async_trait]
    impl Middleware for AlwaysAborts {
        fn id(&self) -> &str {
            "aborts"
        }

        async fn before_model(&self, _state: State, _config: &Map<String, Value>) -> Result<State, MiddlewareError> {
            Err(MiddlewareError("nope".into()))
        }
    }

    fn entry(m: impl Middleware + 'static) -> MiddlewareEntry {
        MiddlewareEntry::new(Arc::new(m), Map::new())
    }

    #[test]
    fn assembles_prompt_in_declaration_order() {
        let entries = vec![entry(Prefixing("a")), entry(Prefixing("b"))];
        let prompt = assemble_system_prompt("base", &entries);
        assert_eq!(prompt, "base\n\n[a]\n\n[b]");
    }

    #[tokio::test]
    async fn before_model_runs_in_order_and_aborts_on_error() {
        let entries = vec![entry(Prefixing("a")), entry(AlwaysAborts), entry(Prefixing("b"))];
        let result = run_before_model(&entries, State::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn before_model_threads_state_through_each_entry() {
        let entries = vec![entry(Prefixing("a")), entry(Prefixing("b"))];
        let state = run_before_model(&entries, State::new()).await.unwrap();
        assert_eq!(state.get_metadata("a").unwrap(), &Value::Bool(true));
        assert_eq!(state.get_metadata("b").unwrap(), &Value::Bool(true));
    }
}
