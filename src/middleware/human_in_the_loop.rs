//! HumanInTheLoop middleware — spec.md §2 conditional default stack, §4.9.
//!
//! Grounded in the teacher's `agent::middleware::human_in_loop::HumanInTheLoopMiddleware`
//! (`interrupt_on`/`before_tool_call`/`before_finish` gating a tool call on a
//! `wait_for_approval()` placeholder), adapted to this crate's single
//! `after_model` hook: rather than gating execution tool-by-tool inline, this
//! middleware inspects the full pending tool-call set of the freshly produced
//! assistant turn and, if any call is gated by `interrupt_on`, raises
//! `AfterModelOutcome::Interrupt` so the engine parks the whole turn (spec.md
//! §4.5 step 3c) instead of executing anything. Only added to an agent's
//! middleware stack when at least one tool is actually gated (spec.md §4.4
//! step 2: "conditional" default).

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{AfterModelOutcome, Middleware, MiddlewareError};
use crate::hitl::{self, InterruptOnMap};
use crate::schemas::Role;
use crate::state::State;

pub struct HumanInTheLoopMiddleware {
    interrupt_on: InterruptOnMap,
}

impl HumanInTheLoopMiddleware {
    pub const ID: &'static str = "human_in_the_loop";

    pub fn new(interrupt_on: InterruptOnMap) -> Self {
        Self { interrupt_on }
    }
}

#[async_trait]
impl Middleware for HumanInTheLoopMiddleware {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn after_model(
        &self,
        state: State,
        _config: &Map<String, Value>,
    ) -> Result<AfterModelOutcome, MiddlewareError> {
        let Some(last) = state.messages.last() else {
            return Ok(AfterModelOutcome::Continue(state));
        };
        if last.role != Role::Assistant {
            return Ok(AfterModelOutcome::Continue(state));
        }
        let Some(tool_calls) = last.tool_calls.clone() else {
            return Ok(AfterModelOutcome::Continue(state));
        };

        match hitl::detect_interrupt(&self.interrupt_on, &tool_calls) {
            Some(interrupt_data) => {
                log::info!(
                    "human_in_the_loop parking turn on {} gated call(s)",
                    interrupt_data.hitl_tool_call_ids.len()
                );
                Ok(AfterModelOutcome::Interrupt(state, interrupt_data))
            }
            None => Ok(AfterModelOutcome::Continue(state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::InterruptOn;
    use crate::schemas::{Message, ToolCall};

    #[tokio::test]
    async fn passes_through_when_no_tool_is_gated() {
        let middleware = HumanInTheLoopMiddleware::new(InterruptOnMap::new());
        let message = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::complete("c1", "ls", Map::new(), 0)],
        );
        let state = State::new().add_message(message);
        let outcome = middleware.after_model(state, &Map::new()).await.unwrap();
        assert!(matches!(outcome, AfterModelOutcome::Continue(_)));
    }

    #[tokio::test]
    async fn interrupts_when_a_gated_tool_is_called() {
        let mut interrupt_on = InterruptOnMap::new();
        interrupt_on.insert("write_file".into(), InterruptOn::Flag(true));
        let middleware = HumanInTheLoopMiddleware::new(interrupt_on);

        let message = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::complete("c1", "write_file", Map::new(), 0)],
        );
        let state = State::new().add_message(message);
        let outcome = middleware.after_model(state, &Map::new()).await.unwrap();
        match outcome {
            AfterModelOutcome::Interrupt(_, data) => {
                assert_eq!(data.hitl_tool_call_ids, vec!["c1".to_string()]);
            }
            _ => panic!("expected interrupt"),
        }
    }

    #[tokio::test]
    async fn ignores_non_assistant_last_message() {
        let middleware = HumanInTheLoopMiddleware::new(InterruptOnMap::new());
        let state = State::new().add_message(Message::user("hi").unwrap());
        let outcome = middleware.after_model(state, &Map::new()).await.unwrap();
        assert!(matches!(outcome, AfterModelOutcome::Continue(_)));
    }
}
