//! Persistence backend contract — spec.md §4.2.
//!
//! Grounded in the teacher's `FileBackend` trait (`deep_agent::backends`),
//! which the teacher implements twice (`WorkspaceBackend` over real disk,
//! `StoreBackend` over an in-memory `ToolStore`). This crate keeps the trait
//! boundary but drops both concrete implementations: the spec treats
//! "concrete persistence backends (disk, database, object store)" as an
//! external collaborator, so only the pluggable contract lives here. Default
//! is in-memory-only (no backend registered for a path).

use async_trait::async_trait;

/// Context passed to every backend callback: which agent and which base
/// directory the call concerns.
#[derive(Clone, Debug)]
pub struct PersistContext {
    pub agent_id: String,
    pub base_directory: String,
}

#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn on_write(&self, path: &str, content: &str, ctx: &PersistContext) -> Result<(), String>;

    /// `Ok(None)` means not found; `Ok(Some(content))` is a hit.
    async fn on_read(&self, path: &str, ctx: &PersistContext) -> Result<Option<String>, String>;

    async fn on_delete(&self, path: &str, ctx: &PersistContext) -> Result<(), String>;

    /// Optional: backends that can't enumerate return the default empty list.
    async fn on_list(&self, _ctx: &PersistContext) -> Result<Vec<String>, String> {
        Ok(Vec::new())
    }
}
