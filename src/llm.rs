//! LLM transport boundary — spec.md §6.
//!
//! The transport itself, concrete providers, and streaming wire formats are
//! explicitly out of scope (spec.md §1); this module only defines the trait
//! boundary the engine calls through, plus a `MockLlm` used solely by tests
//! (grounded in the teacher's `llm/mod.rs` mock client pattern — the teacher
//! depends on `mockito` for HTTP-level provider mocking, which is irrelevant
//! here since there is no concrete HTTP provider in this crate).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::LlmError;
use crate::schemas::{ContentPart, Message};
use crate::schemas::event::TokenUsage;
use crate::tool::ToolSpec;

/// Streaming callbacks the transport invokes during `call_streaming`
/// (spec.md §9: "model as a small struct of optional function-typed
/// fields; the transport invokes whichever are set").
#[derive(Clone, Default)]
pub struct LlmCallbacks {
    pub on_llm_new_delta: Option<Arc<dyn Fn(&[ContentPart]) + Send + Sync>>,
    pub on_message_processed: Option<Arc<dyn Fn(&Message) + Send + Sync>>,
    pub on_llm_token_usage: Option<Arc<dyn Fn(&TokenUsage) + Send + Sync>>,
}

pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

pub struct LlmResponse {
    pub message: Message,
    pub token_usage: Option<TokenUsage>,
}

/// The only thing the engine knows about a model: an opaque handle that can
/// be asked to produce one more assistant turn.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn call(&self, request: LlmRequest, callbacks: &LlmCallbacks) -> Result<LlmResponse, LlmError>;
}

/// `Agent::model_handle` — opaque to the engine beyond "can be called".
#[derive(Clone)]
pub struct ModelHandle {
    pub name: String,
    pub transport: Arc<dyn LlmTransport>,
}

impl ModelHandle {
    pub fn new(name: impl Into<String>, transport: Arc<dyn LlmTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }
}

/// A transport that replays a fixed queue of assistant messages, for tests
/// that need the engine to "call the LLM" without a real provider.
pub struct MockLlm {
    responses: Mutex<VecDeque<Message>>,
}

impl MockLlm {
    pub fn new(responses: Vec<Message>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn handle(name: impl Into<String>, responses: Vec<Message>) -> ModelHandle {
        ModelHandle::new(name, Arc::new(MockLlm::new(responses)))
    }
}

#[async_trait]
impl LlmTransport for MockLlm {
    async fn call(&self, _request: LlmRequest, callbacks: &LlmCallbacks) -> Result<LlmResponse, LlmError> {
        let message = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Transport("MockLlm exhausted its scripted responses".into()))?;

        if let Some(on_processed) = &callbacks.on_message_processed {
            on_processed(&message);
        }

        Ok(LlmResponse {
            message,
            token_usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_llm_replays_scripted_responses_in_order() {
        let mock = MockLlm::new(vec![Message::assistant("first"), Message::assistant("second")]);
        let callbacks = LlmCallbacks::default();
        let first = mock
            .call(LlmRequest { messages: vec![], tools: vec![] }, &callbacks)
            .await
            .unwrap();
        assert_eq!(first.message.content.as_text(), "first");
        let second = mock
            .call(LlmRequest { messages: vec![], tools: vec![] }, &callbacks)
            .await
            .unwrap();
        assert_eq!(second.message.content.as_text(), "second");
    }

    #[tokio::test]
    async fn mock_llm_errors_when_exhausted() {
        let mock = MockLlm::new(vec![]);
        let callbacks = LlmCallbacks::default();
        let result = mock.call(LlmRequest { messages: vec![], tools: vec![] }, &callbacks).await;
        assert!(result.is_err());
    }
}
