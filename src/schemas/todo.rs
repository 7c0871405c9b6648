//! Todo list entries — spec.md §3.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TodoError {
    #[error("todo content must be 1..1000 chars, got {0}")]
    ContentLength(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
}

impl Todo {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Result<Self, TodoError> {
        let content = content.into();
        let len = content.chars().count();
        if len == 0 || len > 1000 {
            return Err(TodoError::ContentLength(len));
        }
        Ok(Self {
            id: id.into(),
            content,
            status: TodoStatus::Pending,
        })
    }

    pub fn with_status(mut self, status: TodoStatus) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_overlong_content() {
        assert!(Todo::new("1", "").is_err());
        let too_long: String = "a".repeat(1001);
        assert!(Todo::new("1", too_long).is_err());
        assert!(Todo::new("1", "write the report").is_ok());
    }

    #[test]
    fn defaults_to_pending() {
        let t = Todo::new("1", "draft outline").unwrap();
        assert_eq!(t.status, TodoStatus::Pending);
    }
}
