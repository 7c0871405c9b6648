//! The `State` value — spec.md §3, §4.1.
//!
//! Pure value type: every mutating operation takes `self` by value and
//! returns a new `State`. Grounded in the teacher's `agent::state::AgentState`
//! (itself a plain struct of fields with a `Command` enum for mutation), but
//! shaped to spec.md's exact field set and merge semantics rather than the
//! teacher's ReAct-specific fields. `agent_id` is never a field here — it is
//! a runtime identifier owned by the AgentServer, supplied at restore time.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::hitl::InterruptData;
use crate::schemas::{FileEntry, Message, Todo, TodoStatus};

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("missing version tag")]
    MissingVersion,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("malformed field '{0}': {1}")]
    MalformedField(&'static str, String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct State {
    pub messages: Vec<Message>,
    pub todos: Vec<Todo>,
    /// Metadata only; authoritative file content lives in the VFS process.
    pub files_index: HashMap<String, FileEntry>,
    pub metadata: Map<String, Value>,
    pub middleware_state: HashMap<String, Value>,
    pub interrupt_data: Option<InterruptData>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn add_messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn set_todos(mut self, todos: Vec<Todo>) -> Self {
        self.todos = todos;
        self
    }

    /// Adds `todo`, or replaces the existing entry with the same id.
    pub fn upsert_todo(mut self, todo: Todo) -> Self {
        match self.todos.iter_mut().find(|t| t.id == todo.id) {
            Some(existing) => *existing = todo,
            None => self.todos.push(todo),
        }
        self
    }

    pub fn delete_todo(mut self, id: &str) -> Self {
        self.todos.retain(|t| t.id != id);
        self
    }

    pub fn todos_by_status(&self, status: TodoStatus) -> Vec<&Todo> {
        self.todos.iter().filter(|t| t.status == status).collect()
    }

    pub fn put_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn delete_metadata(mut self, key: &str) -> Self {
        self.metadata.remove(key);
        self
    }

    /// Clears messages, todos, middleware_state, and interrupt_data;
    /// preserves metadata and files_index (spec.md §4.1).
    pub fn reset(mut self) -> Self {
        self.messages.clear();
        self.todos.clear();
        self.middleware_state.clear();
        self.interrupt_data = None;
        self
    }

    /// Merge `other` into `self` per spec.md §3: messages concatenate; todos
    /// right-wins if non-empty; files_index right-wins per key; metadata
    /// deep-merges; middleware_state shallow-merges.
    pub fn merge(mut self, other: State) -> Self {
        self.messages.extend(other.messages);

        if !other.todos.is_empty() {
            self.todos = other.todos;
        }

        for (path, entry) in other.files_index {
            self.files_index.insert(path, entry);
        }

        deep_merge_object(&mut self.metadata, other.metadata);

        for (id, value) in other.middleware_state {
            self.middleware_state.insert(id, value);
        }

        if other.interrupt_data.is_some() {
            self.interrupt_data = other.interrupt_data;
        }

        self
    }

    /// Versioned envelope per spec.md §6: only messages/todos/metadata/
    /// middleware_state round-trip through this format. `files_index` and
    /// `interrupt_data` are intentionally excluded — the VFS restores file
    /// metadata separately via `register_files`, and a parked interrupt does
    /// not meaningfully transfer to a new agent id.
    pub fn serialize(&self) -> Value {
        let state = serde_json::json!({
            "messages": self.messages,
            "todos": self.todos,
            "metadata": Value::Object(self.metadata.clone()),
            "middleware_state": self.middleware_state,
        });
        serde_json::json!({
            "version": CURRENT_VERSION,
            "state": state,
            "serialized_at": Utc::now().to_rfc3339(),
        })
    }

    pub fn deserialize(value: &Value) -> Result<State, SerializationError> {
        let version = value
            .get("version")
            .ok_or(SerializationError::MissingVersion)?
            .as_u64()
            .ok_or_else(|| SerializationError::MalformedField("version", "not an integer".into()))?
            as u32;

        if version != CURRENT_VERSION {
            return Err(SerializationError::UnsupportedVersion(version));
        }

        let inner = value
            .get("state")
            .ok_or_else(|| SerializationError::MalformedField("state", "missing".into()))?;

        let messages: Vec<Message> = serde_json::from_value(
            inner.get("messages").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|e| SerializationError::MalformedField("messages", e.to_string()))?;

        let todos: Vec<Todo> = serde_json::from_value(
            inner.get("todos").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|e| SerializationError::MalformedField("todos", e.to_string()))?;

        let metadata = match inner.get("metadata").cloned().unwrap_or(Value::Object(Map::new())) {
            Value::Object(map) => map,
            other => {
                return Err(SerializationError::MalformedField(
                    "metadata",
                    format!("expected object, got {other}"),
                ))
            }
        };

        let middleware_state: HashMap<String, Value> = serde_json::from_value(
            inner
                .get("middleware_state")
                .cloned()
                .unwrap_or(Value::Object(Map::new())),
        )
        .map_err(|e| SerializationError::MalformedField("middleware_state", e.to_string()))?;

        Ok(State {
            messages,
            todos,
            files_index: HashMap::new(),
            metadata,
            middleware_state,
            interrupt_data: None,
        })
    }
}

fn deep_merge_object(base: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, incoming_value) in incoming {
        match (base.get_mut(&key), incoming_value) {
            (Some(Value::Object(base_map)), Value::Object(incoming_map)) => {
                deep_merge_object(base_map, incoming_map);
            }
            (_, incoming_value) => {
                base.insert(key, incoming_value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::Message;

    #[test]
    fn reset_preserves_metadata_and_files_index() {
        let state = State::new()
            .add_message(Message::user("hi").unwrap())
            .put_metadata("k", Value::String("v".into()));
        let reset = state.reset();
        assert!(reset.messages.is_empty());
        assert_eq!(reset.get_metadata("k").unwrap(), "v");
    }

    #[test]
    fn merge_concatenates_messages_and_right_wins_todos() {
        let a = State::new()
            .add_message(Message::user("a").unwrap())
            .set_todos(vec![Todo::new("1", "old").unwrap()]);
        let b = State::new()
            .add_message(Message::assistant("b"))
            .set_todos(vec![Todo::new("2", "new").unwrap()]);
        let merged = a.merge(b);
        assert_eq!(merged.messages.len(), 2);
        assert_eq!(merged.todos.len(), 1);
        assert_eq!(merged.todos[0].id, "2");
    }

    #[test]
    fn merge_empty_todos_does_not_clobber() {
        let a = State::new().set_todos(vec![Todo::new("1", "keep me").unwrap()]);
        let b = State::new();
        let merged = a.merge(b);
        assert_eq!(merged.todos.len(), 1);
    }

    #[test]
    fn metadata_deep_merges() {
        let a = State::new().put_metadata(
            "nested",
            serde_json::json!({"a": 1, "b": 1}),
        );
        let b = State::new().put_metadata("nested", serde_json::json!({"b": 2, "c": 3}));
        let merged = a.merge(b);
        let nested = merged.get_metadata("nested").unwrap();
        assert_eq!(nested, &serde_json::json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn serialize_round_trip_preserves_listed_fields() {
        let state = State::new()
            .add_message(Message::user("hi").unwrap())
            .set_todos(vec![Todo::new("1", "x").unwrap()])
            .put_metadata("k", Value::String("v".into()));
        let json = state.serialize();
        let restored = State::deserialize(&json).unwrap();
        assert_eq!(restored.messages.len(), state.messages.len());
        assert_eq!(restored.todos, state.todos);
        assert_eq!(restored.metadata, state.metadata);
    }

    #[test]
    fn deserialize_rejects_missing_version() {
        let bad = serde_json::json!({"state": {}});
        assert!(matches!(
            State::deserialize(&bad),
            Err(SerializationError::MissingVersion)
        ));
    }

    #[test]
    fn deserialize_rejects_unsupported_version() {
        let bad = serde_json::json!({"version": 99, "state": {}});
        assert!(matches!(
            State::deserialize(&bad),
            Err(SerializationError::UnsupportedVersion(99))
        ));
    }
}
