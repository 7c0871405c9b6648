//! File metadata tracked by the VFS — spec.md §3, §4.2.
//!
//! The VFS (`crate::vfs`) is the sole owner of `FileEntry` values and of the
//! actual debounce timer handles; this type only carries the data shape.
//! `pending_timer` is kept as a flag here (not a real tokio handle — the VFS
//! process keeps the `JoinHandle`/abort-handle for a path in its own side
//! table) so read-only introspection (`get_info`, `stats`) can report it
//! without leaking task handles into a `Clone + Serialize` value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub loaded: bool,
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_timer: bool,
}

impl FileEntry {
    /// A brand-new in-memory (non-persistent) entry, as created by the first
    /// `write` to a path under no registered base directory.
    pub fn new_in_memory(path: impl Into<String>, content: String, now: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            content: Some(content),
            loaded: true,
            persistent: false,
            base_directory: None,
            mime_type: None,
            created_at: now,
            modified_at: now,
            dirty: false,
            pending_timer: false,
        }
    }

    /// A brand-new entry under a registered base directory (persistent).
    pub fn new_persistent(
        path: impl Into<String>,
        content: String,
        base_directory: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            path: path.into(),
            content: Some(content),
            loaded: true,
            persistent: true,
            base_directory: Some(base_directory.into()),
            mime_type: None,
            created_at: now,
            modified_at: now,
            dirty: true,
            pending_timer: false,
        }
    }

    /// A lazily-loaded placeholder registered during restore (§4.2
    /// `register_files`): metadata only, content absent until first read.
    pub fn placeholder(
        path: impl Into<String>,
        base_directory: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            path: path.into(),
            content: None,
            loaded: false,
            persistent: true,
            base_directory: Some(base_directory.into()),
            mime_type: None,
            created_at: now,
            modified_at: now,
            dirty: false,
            pending_timer: false,
        }
    }
}
