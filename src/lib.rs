//! # deepagent-rt
//!
//! A hierarchical LLM agent runtime: a middleware-composed agent loop, a
//! per-agent supervision tree (virtual filesystem, agent server, sub-agent
//! dispatch), debounced virtual-filesystem persistence, and a
//! human-in-the-loop interrupt protocol for gating sensitive tool calls.
//!
//! ## Overview
//!
//! - **Agent** — one model, one assembled system prompt, one tool set, and
//!   an ordered middleware stack, all fixed at construction time.
//! - **Middleware** — a small hook trait (`before_model`, `after_model`,
//!   `handle_message`, ...) composed into the default stack: to-do list,
//!   filesystem, sub-agent dispatch, summarization, tool-call repair, and
//!   optionally human-in-the-loop.
//! - **Engine** — the model/tool-call loop that drives one turn to
//!   completion, an interrupt, or a cancellation.
//! - **AgentServer** — an actor wrapping one `Agent` + `State`, exposing
//!   execute/cancel/resume/export/restore over a mailbox, and publishing a
//!   typed event stream.
//! - **AgentSupervisor** — owns one agent's VFS and AgentServer children and
//!   restarts them with a `rest_for_one` policy on crash.
//! - **Vfs** — an in-memory virtual filesystem actor with debounced,
//!   pluggable persistence backends.
//! - **hitl** — the interrupt/decision protocol that gates individual tool
//!   calls on human approval, edit, or rejection.
//!
//! ## Example
//!
//! ```ignore
//! use deepagent_rt::agent::{Agent, AgentConfig};
//! use deepagent_rt::llm::MockLlm;
//! use deepagent_rt::server::AgentServerConfig;
//! use deepagent_rt::vfs;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let model = MockLlm::handle("mock", vec![]);
//! let agent = Agent::new(AgentConfig::new(model))?;
//! let (vfs, _join) = vfs::spawn(agent.id.clone());
//! let (server, _join) = deepagent_rt::server::spawn(
//!     agent,
//!     vfs,
//!     deepagent_rt::state::State::new(),
//!     AgentServerConfig::default(),
//!     None,
//! );
//! server.execute(Some("hello".into())).await?;
//! # Ok(()) }
//! ```

/// The assembled `Agent` value: model, middleware stack, tool set, system
/// prompt, and the `execute`/`resume` entry points.
pub mod agent;
/// The in-memory conversation view (`Chain`) a turn is driven against.
pub mod chain;
/// The model/tool-call loop that drives one turn.
pub mod engine;
/// The composed runtime error taxonomy.
pub mod error;
/// The human-in-the-loop interrupt/decision protocol.
pub mod hitl;
/// LLM transport trait, model handle, callbacks, and the test-only `MockLlm`.
pub mod llm;
/// The middleware contract and the default middleware stack.
pub mod middleware;
/// Typed broadcast topics for agent events and debug events.
pub mod pubsub;
/// Concurrent agent-id to `ServerHandle` lookup, with glob matching.
pub mod registry;
/// Wire types: messages, content parts, tool calls/results, todos, events.
pub mod schemas;
/// The `AgentServer` actor: execute/cancel/resume/export/restore over a
/// mailbox, plus its typed event stream.
pub mod server;
/// The pure, value-semantic conversation `State` and its merge/serialization
/// rules.
pub mod state;
/// Sub-agent definitions and the isolated child-run loop.
pub mod subagent;
/// Per-agent supervision tree with a `rest_for_one` restart policy.
pub mod supervisor;
/// Tool parameter schemas, invocation context, and the `ToolSpec` contract.
pub mod tool;
/// The virtual filesystem actor: in-memory state with debounced,
/// pluggable persistence.
pub mod vfs;

pub use agent::{Agent, AgentConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use server::{AgentServerConfig, ServerHandle};
pub use state::State;
pub use supervisor::AgentSupervisor;
