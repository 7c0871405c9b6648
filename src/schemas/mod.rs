//! Wire-level value types shared across the runtime: messages, content
//! parts, tool calls/results, todos, file metadata, and broadcast events.
//!
//! Grounded in the teacher crate's `schemas/messages.rs` and `schemas/agent.rs`
//! tagged-union style, generalized to the roles and invariants of the
//! hierarchical agent runtime (`role` / `type` discriminator fields, per
//! spec.md §9's "runtime-tagged message values" guidance).

pub mod event;
pub mod file_entry;
pub mod messages;
pub mod todo;

pub use event::Event;
pub use file_entry::FileEntry;
pub use messages::{ContentPart, Message, MessageStatus, Role, ToolCall, ToolCallStatus, ToolResult};
pub use todo::{Todo, TodoStatus};
