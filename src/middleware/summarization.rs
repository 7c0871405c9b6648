//! Summarization middleware — spec.md §2 default stack, §4.4 step 3.
//!
//! Grounded in the teacher's `agent::middleware::summarization::SummarizationMiddleware`
//! (`token_threshold`/`message_threshold`/`preserve_recent`/`summarization_prompt`,
//! a `should_summarize` gate, and a placeholder `summarize_history` that the
//! teacher leaves for a caller to wire to a real model call), hooked into
//! `before_model` here rather than the teacher's `before_agent_plan` since
//! this crate's middleware contract has no separate planning hook.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Middleware, MiddlewareError};
use crate::schemas::{Message, Role};
use crate::state::State;

const DEFAULT_TOKEN_THRESHOLD: usize = 8000;
const DEFAULT_MESSAGE_THRESHOLD: usize = 40;
const DEFAULT_PRESERVE_RECENT: usize = 10;

pub struct SummarizationMiddleware {
    token_threshold: usize,
    message_threshold: usize,
    preserve_recent: usize,
}

impl SummarizationMiddleware {
    pub const ID: &'static str = "summarization";

    pub fn new() -> Self {
        Self {
            token_threshold: DEFAULT_TOKEN_THRESHOLD,
            message_threshold: DEFAULT_MESSAGE_THRESHOLD,
            preserve_recent: DEFAULT_PRESERVE_RECENT,
        }
    }

    pub fn with_thresholds(mut self, token_threshold: usize, message_threshold: usize) -> Self {
        self.token_threshold = token_threshold;
        self.message_threshold = message_threshold;
        self
    }

    pub fn with_preserve_recent(mut self, preserve_recent: usize) -> Self {
        self.preserve_recent = preserve_recent;
        self
    }

    fn should_summarize(&self, messages: &[Message]) -> bool {
        if messages.len() <= self.preserve_recent {
            return false;
        }
        messages.len() > self.message_threshold || estimate_tokens(messages) > self.token_threshold
    }
}

impl Default for SummarizationMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for SummarizationMiddleware {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn before_model(&self, mut state: State, _config: &Map<String, Value>) -> Result<State, MiddlewareError> {
        if !self.should_summarize(&state.messages) {
            return Ok(state);
        }

        let split_at = state.messages.len() - self.preserve_recent;
        let (to_summarize, recent) = state.messages.split_at(split_at);
        let summary_text = summarize_history(to_summarize);

        let mut rebuilt = Vec::with_capacity(recent.len() + 1);
        rebuilt.push(Message::system(summary_text).map_err(|e| MiddlewareError(e.to_string()))?);
        rebuilt.extend_from_slice(recent);

        log::info!(
            "summarization compacted {} message(s) into one summary, preserving the last {}",
            to_summarize.len(),
            recent.len()
        );
        state.messages = rebuilt;
        Ok(state)
    }
}

/// Placeholder for a real summarizing model call: the engine that wires an
/// `Agent` to a live `ModelHandle` is expected to replace this with an actual
/// LLM-produced summary. Kept deterministic here so behavior stays testable
/// without a transport.
fn summarize_history(messages: &[Message]) -> String {
    let user_turns = messages.iter().filter(|m| m.role == Role::User).count();
    format!(
        "[Summarized conversation history: {} message(s), {} user turn(s)]",
        messages.len(),
        user_turns
    )
}

fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.content.as_text().len() / 4).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_messages(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("message {i}")).unwrap()).collect()
    }

    #[tokio::test]
    async fn leaves_short_history_untouched() {
        let middleware = SummarizationMiddleware::new().with_thresholds(8000, 40);
        let state = State::new().add_messages(user_messages(3));
        let result = middleware.before_model(state, &Map::new()).await.unwrap();
        assert_eq!(result.messages.len(), 3);
    }

    #[tokio::test]
    async fn compacts_history_past_message_threshold() {
        let middleware = SummarizationMiddleware::new()
            .with_thresholds(1_000_000, 5)
            .with_preserve_recent(2);
        let state = State::new().add_messages(user_messages(10));
        let result = middleware.before_model(state, &Map::new()).await.unwrap();
        // one synthetic summary message + the preserved recent 2
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.messages[0].role, Role::System);
    }
}
