//! TodoList middleware — spec.md §2 default stack, §4.4 step 3.
//!
//! Contributes the `write_todos` tool, grounded in the teacher's
//! `deep_agent::tools::write_todos::WriteTodosTool` (store-namespace todo
//! list), rewired to replace `state.todos` wholesale through a tool-produced
//! `State` fragment (spec.md §4.5 step 4) instead of the teacher's
//! `ToolStore::put` side channel, since this runtime threads todos through
//! `State` rather than a separate store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::Middleware;
use crate::schemas::{Todo, TodoStatus};
use crate::state::State;
use crate::tool::{FunctionParam, ParamType, ToolError, ToolOutcome, ToolSpec};

pub struct TodoListMiddleware;

impl TodoListMiddleware {
    pub const ID: &'static str = "todo_list";

    pub fn new() -> Self {
        Self
    }
}

impl Default for TodoListMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for TodoListMiddleware {
    fn id(&self) -> &str {
        Self::ID
    }

    fn system_prompt(&self, _config: &Map<String, Value>) -> Vec<String> {
        vec![
            "Use the `write_todos` tool to break multi-step work into a \
             tracked to-do list, and keep it updated as steps complete."
                .to_string(),
        ]
    }

    fn tools(&self, _config: &Map<String, Value>) -> Vec<ToolSpec> {
        vec![write_todos_tool()]
    }
}

fn write_todos_tool() -> ToolSpec {
    let item_params = vec![
        FunctionParam::new("id", ParamType::String).with_description("Stable id; generated if omitted"),
        FunctionParam::new("content", ParamType::String)
            .required()
            .with_description("1..1000 chars describing the step"),
        FunctionParam::new("status", ParamType::String)
            .with_description("pending | in_progress | completed | cancelled"),
    ];
    let params = vec![FunctionParam {
        item_type: Some(Box::new(FunctionParam {
            object_properties: Some(item_params),
            ..FunctionParam::new("todo", ParamType::Object)
        })),
        ..FunctionParam::new("todos", ParamType::Array)
            .required()
            .with_description("The full to-do list, replacing any previous list")
    }];

    ToolSpec::new(
        "write_todos",
        "Replace the current to-do list with the given items. Pass the \
         entire list every time; this call overwrites, it does not append.",
        params,
        Arc::new(|args, ctx| {
            Box::pin(async move {
                let items = args
                    .get("todos")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let mut todos = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let id = item
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("todo-{i}"));
                    let content = item.get("content").and_then(Value::as_str).unwrap_or("");
                    let status = parse_status(item.get("status").and_then(Value::as_str));

                    let todo = Todo::new(id, content)
                        .map_err(|e| ToolError::ExecutionFailed {
                            name: "write_todos".into(),
                            reason: e.to_string(),
                        })?
                        .with_status(status);
                    todos.push(todo);
                }

                let count = todos.len();
                let fragment = State::new().set_todos(todos);
                let result = crate::schemas::ToolResult::ok(
                    ctx.call_id.clone(),
                    format!("Updated to-do list ({count} items)."),
                );
                Ok(ToolOutcome::with_state_fragment(result, fragment))
            })
        }),
    )
}

fn parse_status(raw: Option<&str>) -> TodoStatus {
    match raw {
        Some("in_progress") => TodoStatus::InProgress,
        Some("completed") => TodoStatus::Completed,
        Some("cancelled") => TodoStatus::Cancelled,
        _ => TodoStatus::Pending,
    }
}
