//! Tool specification and execution contract — spec.md §6.
//!
//! Grounded in the teacher's `tools::tool::Tool` trait (`name`/`description`/
//! `parameters`/`run`/`run_with_runtime`) and `ToolResult::WithCommand`
//! pattern, but reshaped to match spec.md's literal field list
//! (`{name, description, parameters, function(args, ctx), async, options}`)
//! and its tool-produced-state-fragment merge rule (§4.5 step 4): a tool
//! invocation yields both a `ToolResult` (what the LLM sees) and an optional
//! `State` fragment (what gets merged into the running state), mirroring the
//! teacher's `Command::UpdateState` but using `State::merge` directly instead
//! of a command enum.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::hitl::InterruptData;
use crate::pubsub::Topic;
use crate::schemas::event::DebugEvent;
use crate::schemas::ToolResult;
use crate::state::State;
use crate::vfs::VfsHandle;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool '{name}' failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("tool '{name}' returned a value that does not match its declared schema")]
    UnexpectedReturn { name: String },

    #[error("unknown tool requested: {0}")]
    UnknownTool(String),
}

/// JSON-schema primitive types a `FunctionParam` may declare (spec.md §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn as_json_schema_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// One parameter of a tool's schema (spec.md §6 `FunctionParam`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionParam {
    pub name: String,
    pub param_type: ParamType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    /// Element type for `param_type == Array`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<Box<FunctionParam>>,
    /// Nested fields for `param_type == Object`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_properties: Option<Vec<FunctionParam>>,
    #[serde(default)]
    pub required: bool,
}

impl FunctionParam {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            enum_values: None,
            item_type: None,
            object_properties: None,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn to_schema(&self) -> Value {
        let mut schema = serde_json::json!({ "type": self.param_type.as_json_schema_str() });
        let obj = schema.as_object_mut().unwrap();
        if let Some(description) = &self.description {
            obj.insert("description".into(), Value::String(description.clone()));
        }
        if let Some(enum_values) = &self.enum_values {
            obj.insert("enum".into(), Value::Array(enum_values.iter().cloned().map(Value::String).collect()));
        }
        if let Some(item_type) = &self.item_type {
            obj.insert("items".into(), item_type.to_schema());
        }
        if let Some(properties) = &self.object_properties {
            let (props, required) = properties_schema(properties);
            obj.insert("properties".into(), Value::Object(props));
            if !required.is_empty() {
                obj.insert("required".into(), Value::Array(required.into_iter().map(Value::String).collect()));
            }
        }
        schema
    }
}

fn properties_schema(params: &[FunctionParam]) -> (Map<String, Value>, Vec<String>) {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in params {
        properties.insert(param.name.clone(), param.to_schema());
        if param.required {
            required.push(param.name.clone());
        }
    }
    (properties, required)
}

/// Emits a standard JSON Schema object with `type=object`, `properties`, and
/// `required` (spec.md §6 `to_parameters_schema`).
pub fn to_parameters_schema(params: &[FunctionParam]) -> Value {
    let (properties, required) = properties_schema(params);
    let mut schema = serde_json::json!({
        "type": "object",
        "properties": properties,
    });
    if !required.is_empty() {
        schema
            .as_object_mut()
            .unwrap()
            .insert("required".into(), Value::Array(required.into_iter().map(Value::String).collect()));
    }
    schema
}

/// Either a structured parameter list or a pass-through raw JSON schema
/// (spec.md §6: "parameters (FunctionParam list OR raw JSON schema)").
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolParameters {
    Params(Vec<FunctionParam>),
    RawSchema(Value),
}

impl ToolParameters {
    pub fn to_schema(&self) -> Value {
        match self {
            ToolParameters::Params(params) => to_parameters_schema(params),
            ToolParameters::RawSchema(schema) => schema.clone(),
        }
    }
}

/// Everything a tool execution needs beyond its arguments: the VFS handle
/// (FileSystem-backed tools use it directly) and a read-only snapshot of the
/// current state (tools that need to inspect todos/metadata before acting).
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub call_id: String,
    pub vfs: VfsHandle,
    pub state: Arc<State>,
    /// The owning agent's debug topic, so a tool that spawns a sub-process
    /// of its own (the `task` tool's `SubAgent`) can mirror its progress
    /// onto it (spec.md §6 `DebugEvent::Subagent`).
    pub debug_events: Topic<DebugEvent>,
}

/// The result of one tool invocation: what the LLM sees (`result`) plus an
/// optional `State` fragment to merge into the running state (spec.md §4.5
/// step 4: "each tool that returns processed_content of type State is merged
/// in"), or an `interrupt` when the tool's own execution discovered a nested
/// human-review gate (spec.md §4.6 "interrupt propagation") instead of
/// completing. `result` is still populated when `interrupt` is set — a
/// placeholder never shown to the LLM, since the chain parks the whole turn
/// instead of appending a tool-result message for this call.
pub struct ToolOutcome {
    pub result: ToolResult,
    pub state_fragment: Option<State>,
    pub interrupt: Option<InterruptData>,
}

impl ToolOutcome {
    pub fn result_only(result: ToolResult) -> Self {
        Self {
            result,
            state_fragment: None,
            interrupt: None,
        }
    }

    pub fn with_state_fragment(result: ToolResult, fragment: State) -> Self {
        Self {
            result,
            state_fragment: Some(fragment),
            interrupt: None,
        }
    }

    pub fn interrupted(placeholder: ToolResult, data: InterruptData) -> Self {
        Self {
            result: placeholder,
            state_fragment: None,
            interrupt: Some(data),
        }
    }
}

pub type ToolFuture = BoxFuture<'static, Result<ToolOutcome, ToolError>>;
pub type ToolFn = Arc<dyn Fn(Map<String, Value>, ToolContext) -> ToolFuture + Send + Sync>;

/// A callable exposed to the LLM (spec.md §6 "Tool specification").
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: ToolParameters,
    pub function: ToolFn,
    pub is_async: bool,
    pub options: HashMap<String, Value>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<FunctionParam>,
        function: ToolFn,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ToolParameters::Params(parameters),
            function,
            is_async: true,
            options: HashMap::new(),
        }
    }

    pub async fn invoke(
        &self,
        tool_call_id: impl Into<String>,
        arguments: Map<String, Value>,
        ctx: ToolContext,
    ) -> ToolResult {
        let tool_call_id = tool_call_id.into();
        match (self.function)(arguments, ctx).await {
            Ok(outcome) => outcome.result,
            Err(err) => {
                log::warn!("tool '{}' execution failed: {err}", self.name);
                ToolResult::error(tool_call_id, err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_object_schema_with_required_list() {
        let params = vec![
            FunctionParam::new("path", ParamType::String).required(),
            FunctionParam::new("content", ParamType::String),
        ];
        let schema = to_parameters_schema(&params);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], serde_json::json!(["path"]));
        assert_eq!(schema["properties"]["content"]["type"], "string");
    }

    #[test]
    fn nested_object_and_array_schema() {
        let inner = vec![FunctionParam::new("name", ParamType::String).required()];
        let params = vec![
            FunctionParam {
                object_properties: Some(inner),
                ..FunctionParam::new("owner", ParamType::Object)
            },
            FunctionParam {
                item_type: Some(Box::new(FunctionParam::new("item", ParamType::String))),
                ..FunctionParam::new("tags", ParamType::Array)
            },
        ];
        let schema = to_parameters_schema(&params);
        assert_eq!(schema["properties"]["owner"]["properties"]["name"]["type"], "string");
        assert_eq!(schema["properties"]["tags"]["items"]["type"], "string");
    }
}
