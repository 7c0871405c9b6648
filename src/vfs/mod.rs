//! The per-agent virtual filesystem process — spec.md §4.2.
//!
//! Modeled the way spec.md §9 asks for supervised processes in a systems
//! language: a tokio task owning all mutable state plus an mpsc mailbox
//! (`VfsHandle` is the cheaply-cloneable sender side). Every operation is a
//! call/reply round trip through the task, so all VFS mutation is serialized
//! exactly as spec.md requires ("all access goes through its message queue").
//! Grounded in the teacher's `WorkspaceBackend`/`StoreBackend`
//! (`ls`/`read`/`write`/`edit`/`glob`/`grep`) for the read/write surface, and
//! in `hi-youichi-loom`'s `serve::run` task+channel pattern for the actor
//! shape itself.

pub mod backend;

use std::collections::HashMap;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use backend::{PersistContext, PersistenceBackend};

use crate::schemas::FileEntry;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence backend error on '{path}': {reason}")]
    PersistenceError { path: String, reason: String },

    #[error("base directory already registered: {0}")]
    DuplicateBaseDirectory(String),

    #[error("VFS process is no longer running")]
    ProcessGone,
}

#[derive(Clone, Debug, Default)]
pub struct VfsStats {
    pub total_entries: usize,
    pub dirty_entries: usize,
    pub persistent_entries: usize,
}

struct BaseDirectoryConfig {
    debounce_ms: u64,
    backend: std::sync::Arc<dyn PersistenceBackend>,
}

pub struct PersistenceRegistration {
    pub base_directory: String,
    pub debounce_ms: u64,
    pub backend: std::sync::Arc<dyn PersistenceBackend>,
}

enum Command {
    Write {
        path: String,
        content: String,
        reply: oneshot::Sender<()>,
    },
    Read {
        path: String,
        reply: oneshot::Sender<Result<String, VfsError>>,
    },
    Delete {
        path: String,
        reply: oneshot::Sender<()>,
    },
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
    Exists {
        path: String,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<VfsStats>,
    },
    FlushAll {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    RegisterPersistence {
        registration: PersistenceRegistration,
        reply: oneshot::Sender<Result<(), VfsError>>,
    },
    RegisterFiles {
        entries: Vec<FileEntry>,
        reply: oneshot::Sender<()>,
    },
    DebounceFired {
        path: String,
    },
    Terminate {
        reply: oneshot::Sender<()>,
    },
}

/// Cheaply-cloneable handle to a running VFS task.
#[derive(Clone)]
pub struct VfsHandle {
    tx: mpsc::Sender<Command>,
}

impl VfsHandle {
    pub async fn write(&self, path: impl Into<String>, content: impl Into<String>) -> Result<(), VfsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Write {
            path: path.into(),
            content: content.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| VfsError::ProcessGone)
    }

    pub async fn read(&self, path: impl Into<String>) -> Result<String, VfsError> {
        let (reply, rx) = oneshot::channel();
        let path = path.into();
        self.send(Command::Read { path, reply }).await?;
        rx.await.map_err(|_| VfsError::ProcessGone)?
    }

    pub async fn delete(&self, path: impl Into<String>) -> Result<(), VfsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Delete { path: path.into(), reply }).await?;
        rx.await.map_err(|_| VfsError::ProcessGone)
    }

    pub async fn list(&self) -> Result<Vec<String>, VfsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::List { reply }).await?;
        rx.await.map_err(|_| VfsError::ProcessGone)
    }

    pub async fn exists(&self, path: impl Into<String>) -> Result<bool, VfsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Exists { path: path.into(), reply }).await?;
        rx.await.map_err(|_| VfsError::ProcessGone)
    }

    pub async fn stats(&self) -> Result<VfsStats, VfsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| VfsError::ProcessGone)
    }

    pub async fn flush_all(&self) -> Result<(), VfsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FlushAll { reply }).await?;
        rx.await.map_err(|_| VfsError::ProcessGone)
    }

    pub async fn reset(&self) -> Result<(), VfsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { reply }).await?;
        rx.await.map_err(|_| VfsError::ProcessGone)
    }

    pub async fn register_persistence(&self, registration: PersistenceRegistration) -> Result<(), VfsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RegisterPersistence { registration, reply }).await?;
        rx.await.map_err(|_| VfsError::ProcessGone)?
    }

    pub async fn register_files(&self, entries: Vec<FileEntry>) -> Result<(), VfsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RegisterFiles { entries, reply }).await?;
        rx.await.map_err(|_| VfsError::ProcessGone)
    }

    /// Flushes all dirty entries then stops the task (spec.md §4.2 `terminate`).
    pub async fn terminate(&self) -> Result<(), VfsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Terminate { reply }).await?;
        rx.await.map_err(|_| VfsError::ProcessGone)
    }

    async fn send(&self, cmd: Command) -> Result<(), VfsError> {
        self.tx.send(cmd).await.map_err(|_| VfsError::ProcessGone)
    }
}

/// Spawns the VFS task and returns a handle plus its `JoinHandle`, so the
/// owning `AgentSupervisor` can wait on/restart it (spec.md §4.8).
pub fn spawn(agent_id: impl Into<String>) -> (VfsHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let handle = VfsHandle { tx: tx.clone() };
    let join = tokio::spawn(run(agent_id.into(), rx, tx));
    (handle, join)
}

async fn run(agent_id: String, mut rx: mpsc::Receiver<Command>, self_tx: mpsc::Sender<Command>) {
    let mut entries: HashMap<String, FileEntry> = HashMap::new();
    let mut backends: HashMap<String, BaseDirectoryConfig> = HashMap::new();
    let mut pending_timers: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Write { path, content, reply } => {
                handle_write(&agent_id, &mut entries, &backends, &mut pending_timers, &self_tx, path, content);
                let _ = reply.send(());
            }
            Command::Read { path, reply } => {
                let result = handle_read(&agent_id, &mut entries, &backends, &path).await;
                let _ = reply.send(result);
            }
            Command::Delete { path, reply } => {
                handle_delete(&agent_id, &mut entries, &backends, &mut pending_timers, &path).await;
                let _ = reply.send(());
            }
            Command::List { reply } => {
                let _ = reply.send(entries.keys().cloned().collect());
            }
            Command::Exists { path, reply } => {
                let _ = reply.send(entries.contains_key(&path));
            }
            Command::Stats { reply } => {
                let stats = VfsStats {
                    total_entries: entries.len(),
                    dirty_entries: entries.values().filter(|e| e.dirty).count(),
                    persistent_entries: entries.values().filter(|e| e.persistent).count(),
                };
                let _ = reply.send(stats);
            }
            Command::FlushAll { reply } => {
                flush_all(&agent_id, &mut entries, &backends, &mut pending_timers).await;
                let _ = reply.send(());
            }
            Command::Reset { reply } => {
                reset(&mut entries, &mut pending_timers);
                let _ = reply.send(());
            }
            Command::RegisterPersistence { registration, reply } => {
                let result = if backends.contains_key(&registration.base_directory) {
                    Err(VfsError::DuplicateBaseDirectory(registration.base_directory.clone()))
                } else {
                    backends.insert(
                        registration.base_directory.clone(),
                        BaseDirectoryConfig {
                            debounce_ms: registration.debounce_ms,
                            backend: registration.backend,
                        },
                    );
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::RegisterFiles { entries: new_entries, reply } => {
                for entry in new_entries {
                    entries.insert(entry.path.clone(), entry);
                }
                let _ = reply.send(());
            }
            Command::DebounceFired { path } => {
                fire_debounce(&agent_id, &mut entries, &backends, &mut pending_timers, &path).await;
            }
            Command::Terminate { reply } => {
                flush_all(&agent_id, &mut entries, &backends, &mut pending_timers).await;
                let _ = reply.send(());
                break;
            }
        }
    }
}

fn base_directory_for(backends: &HashMap<String, BaseDirectoryConfig>, path: &str) -> Option<String> {
    backends
        .keys()
        .filter(|base| path.starts_with(base.as_str()))
        .max_by_key(|base| base.len())
        .cloned()
}

fn handle_write(
    agent_id: &str,
    entries: &mut HashMap<String, FileEntry>,
    backends: &HashMap<String, BaseDirectoryConfig>,
    pending_timers: &mut HashMap<String, JoinHandle<()>>,
    self_tx: &mpsc::Sender<Command>,
    path: String,
    content: String,
) {
    let now = Utc::now();
    let base_directory = base_directory_for(backends, &path);

    let entry = entries.entry(path.clone()).or_insert_with(|| match &base_directory {
        Some(base) => FileEntry::new_persistent(path.clone(), content.clone(), base.clone(), now),
        None => FileEntry::new_in_memory(path.clone(), content.clone(), now),
    });

    entry.content = Some(content);
    entry.loaded = true;
    entry.modified_at = now;

    let Some(base) = base_directory else {
        return;
    };
    entry.persistent = true;
    entry.base_directory = Some(base.clone());
    entry.dirty = true;

    if let Some(old_timer) = pending_timers.remove(&path) {
        old_timer.abort();
    }

    let debounce_ms = backends.get(&base).map(|c| c.debounce_ms).unwrap_or(0);
    let self_tx = self_tx.clone();
    let timer_path = path.clone();
    entry.pending_timer = true;
    let timer = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(debounce_ms)).await;
        let _ = self_tx.send(Command::DebounceFired { path: timer_path }).await;
    });
    pending_timers.insert(path, timer);

    let _ = agent_id;
}

async fn fire_debounce(
    agent_id: &str,
    entries: &mut HashMap<String, FileEntry>,
    backends: &HashMap<String, BaseDirectoryConfig>,
    pending_timers: &mut HashMap<String, JoinHandle<()>>,
    path: &str,
) {
    pending_timers.remove(path);

    let Some(entry) = entries.get_mut(path) else { return };
    entry.pending_timer = false;
    if !entry.dirty {
        return;
    }
    let Some(base) = entry.base_directory.clone() else { return };
    let Some(config) = backends.get(&base) else { return };
    let Some(content) = entry.content.clone() else { return };

    let ctx = PersistContext {
        agent_id: agent_id.to_string(),
        base_directory: base,
    };
    match config.backend.on_write(path, &content, &ctx).await {
        Ok(()) => entry.dirty = false,
        Err(reason) => {
            log::warn!("VFS persist failed for '{path}': {reason}; will retry on next write or flush_all");
        }
    }
}

async fn handle_read(
    agent_id: &str,
    entries: &mut HashMap<String, FileEntry>,
    backends: &HashMap<String, BaseDirectoryConfig>,
    path: &str,
) -> Result<String, VfsError> {
    let needs_load = match entries.get(path) {
        None => return Err(VfsError::NotFound(path.to_string())),
        Some(entry) if entry.loaded => {
            return Ok(entry.content.clone().unwrap_or_default());
        }
        Some(_) => true,
    };

    if !needs_load {
        unreachable!();
    }

    let base = entries.get(path).and_then(|e| e.base_directory.clone());
    let Some(base) = base else {
        return Err(VfsError::NotFound(path.to_string()));
    };
    let Some(config) = backends.get(&base) else {
        return Err(VfsError::NotFound(path.to_string()));
    };

    let ctx = PersistContext {
        agent_id: agent_id.to_string(),
        base_directory: base,
    };
    match config.backend.on_read(path, &ctx).await {
        Ok(Some(content)) => {
            if let Some(entry) = entries.get_mut(path) {
                entry.loaded = true;
                entry.content = Some(content.clone());
            }
            Ok(content)
        }
        Ok(None) => Err(VfsError::NotFound(path.to_string())),
        Err(reason) => Err(VfsError::PersistenceError {
            path: path.to_string(),
            reason,
        }),
    }
}

async fn handle_delete(
    agent_id: &str,
    entries: &mut HashMap<String, FileEntry>,
    backends: &HashMap<String, BaseDirectoryConfig>,
    pending_timers: &mut HashMap<String, JoinHandle<()>>,
    path: &str,
) {
    if let Some(timer) = pending_timers.remove(path) {
        timer.abort();
    }

    let Some(entry) = entries.remove(path) else { return };
    if !entry.persistent {
        return;
    }
    let Some(base) = entry.base_directory else { return };
    let Some(config) = backends.get(&base) else { return };

    let ctx = PersistContext {
        agent_id: agent_id.to_string(),
        base_directory: base,
    };
    if let Err(reason) = config.backend.on_delete(path, &ctx).await {
        log::warn!("VFS backend on_delete failed for '{path}': {reason}");
    }
}

async fn flush_all(
    agent_id: &str,
    entries: &mut HashMap<String, FileEntry>,
    backends: &HashMap<String, BaseDirectoryConfig>,
    pending_timers: &mut HashMap<String, JoinHandle<()>>,
) {
    let dirty_paths: Vec<String> = entries
        .iter()
        .filter(|(_, e)| e.dirty)
        .map(|(p, _)| p.clone())
        .collect();

    for path in dirty_paths {
        if let Some(timer) = pending_timers.remove(&path) {
            timer.abort();
        }
        fire_debounce_unconditionally(agent_id, entries, backends, &path).await;
    }
}

async fn fire_debounce_unconditionally(
    agent_id: &str,
    entries: &mut HashMap<String, FileEntry>,
    backends: &HashMap<String, BaseDirectoryConfig>,
    path: &str,
) {
    let Some(entry) = entries.get_mut(path) else { return };
    entry.pending_timer = false;
    let Some(base) = entry.base_directory.clone() else { return };
    let Some(config) = backends.get(&base) else { return };
    let Some(content) = entry.content.clone() else { return };

    let ctx = PersistContext {
        agent_id: agent_id.to_string(),
        base_directory: base,
    };
    match config.backend.on_write(path, &content, &ctx).await {
        Ok(()) => entry.dirty = false,
        Err(reason) => log::warn!("VFS flush_all persist failed for '{path}': {reason}"),
    }
}

/// Drops memory-only files and reverts persisted files to unloaded
/// (spec.md §4.2 `reset`: "the persisted state is the fallback truth").
fn reset(entries: &mut HashMap<String, FileEntry>, pending_timers: &mut HashMap<String, JoinHandle<()>>) {
    for timer in pending_timers.values() {
        timer.abort();
    }
    pending_timers.clear();

    entries.retain(|_, entry| entry.persistent);
    for entry in entries.values_mut() {
        entry.loaded = false;
        entry.content = None;
        entry.dirty = false;
        entry.pending_timer = false;
    }
}
