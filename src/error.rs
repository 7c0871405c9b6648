//! Top-level error taxonomy.
//!
//! Each subsystem defines its own `thiserror::Error` enum close to where the
//! failure originates (`state::SerializationError`, `vfs::VfsError`,
//! `tool::ToolError`, `hitl::InterruptProtocolError`). `RuntimeError` composes
//! them with `#[from]`, the same shape the teacher crate uses to compose
//! `LangChainError` from per-module errors in `error/mod.rs`.

use thiserror::Error;

use crate::hitl::InterruptProtocolError;
use crate::middleware::MiddlewareError;
use crate::server::ServerError;
use crate::state::SerializationError;
use crate::tool::ToolError;
use crate::vfs::VfsError;

/// Invalid agent attributes (missing model, unknown middleware, bad tool
/// schema). Raised at construction time; never reaches a running agent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("model handle is required")]
    MissingModel,

    #[error("duplicate middleware id: {0}")]
    DuplicateMiddlewareId(String),

    #[error("invalid tool schema for '{name}': {reason}")]
    InvalidToolSchema { name: String, reason: String },

    #[error("unknown middleware referenced: {0}")]
    UnknownMiddleware(String),
}

/// Upstream LLM transport failure. Turn aborts; status becomes `Error`; the
/// state preceding the call is preserved.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("LLM call cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Interrupt(#[from] InterruptProtocolError),

    #[error(transparent)]
    Vfs(#[from] VfsError),

    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("inactivity timeout reached")]
    InactivityTimeout,

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
