//! PatchToolCalls middleware — spec.md §2 default stack, §4.4 step 3.
//!
//! Grounded in the teacher's `agent::message_repair::repair_dangling_tool_calls`
//! (which patches a message history so every tool-calling assistant turn has
//! a matching tool-result message). This crate's equivalent gap is different:
//! spec.md §3 says "a call is only *complete* once its JSON parses
//! successfully", so the thing that needs repairing here is a `ToolCall`
//! whose streamed `arguments` JSON never finished parsing. This middleware's
//! `after_model` hook attempts a last-chance repair (trailing-comma /
//! unbalanced-brace / single-quote fixups) on any such call before the next
//! turn treats it as permanently unparseable.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{AfterModelOutcome, Middleware, MiddlewareError};
use crate::schemas::ToolCallStatus;
use crate::state::State;

pub struct PatchToolCallsMiddleware;

impl PatchToolCallsMiddleware {
    pub const ID: &'static str = "patch_tool_calls";

    pub fn new() -> Self {
        Self
    }
}

impl Default for PatchToolCallsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for PatchToolCallsMiddleware {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn after_model(
        &self,
        mut state: State,
        _config: &Map<String, Value>,
    ) -> Result<AfterModelOutcome, MiddlewareError> {
        for message in state.messages.iter_mut() {
            let Some(tool_calls) = message.tool_calls.as_mut() else {
                continue;
            };
            for call in tool_calls.iter_mut() {
                if call.status == ToolCallStatus::Complete {
                    continue;
                }
                if let Some(repaired) = attempt_repair(call.raw_arguments()) {
                    call.arguments = repaired;
                    call.status = ToolCallStatus::Complete;
                    log::warn!(
                        "patch_tool_calls repaired malformed arguments for call '{}'",
                        call.call_id
                    );
                } else {
                    call.status = ToolCallStatus::Failed;
                    log::warn!(
                        "patch_tool_calls could not repair call '{}'; arguments left unparsed",
                        call.call_id
                    );
                }
            }
        }
        Ok(AfterModelOutcome::Continue(state))
    }
}

/// Best-effort fixups for common streaming truncation artifacts: a trailing
/// comma before the closing brace, a missing closing brace, or single quotes
/// used in place of double quotes.
fn attempt_repair(raw: &str) -> Option<Map<String, Value>> {
    let candidates = [
        raw.to_string(),
        format!("{raw}}}"),
        trim_trailing_comma(raw),
        format!("{}}}", trim_trailing_comma(raw)),
        raw.replace('\'', "\""),
    ];

    for candidate in candidates {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&candidate) {
            return Some(map);
        }
    }
    None
}

fn trim_trailing_comma(raw: &str) -> String {
    raw.trim_end().trim_end_matches(',').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::{Message, ToolCall};

    #[tokio::test]
    async fn repairs_truncated_object_missing_closing_brace() {
        let middleware = PatchToolCallsMiddleware::new();
        let mut call = ToolCall::new("c1", "write_file", 0);
        call.append_argument_delta("{\"path\":\"/a.txt\"");
        assert!(!call.is_complete());
        let message = Message::assistant_with_tool_calls("", vec![call]);
        let state = State::new().add_message(message);

        let outcome = middleware.after_model(state, &Map::new()).await.unwrap();
        let AfterModelOutcome::Continue(state) = outcome else { panic!("expected continue") };
        let repaired_call = &state.messages[0].tool_calls.as_ref().unwrap()[0];
        assert_eq!(repaired_call.status, ToolCallStatus::Complete);
        assert_eq!(repaired_call.arguments.get("path").unwrap(), "/a.txt");
    }

    #[tokio::test]
    async fn leaves_genuinely_unparseable_calls_failed() {
        let middleware = PatchToolCallsMiddleware::new();
        let mut call = ToolCall::new("c1", "write_file", 0);
        call.append_argument_delta("not json at all");
        let message = Message::assistant_with_tool_calls("", vec![call]);
        let state = State::new().add_message(message);

        let outcome = middleware.after_model(state, &Map::new()).await.unwrap();
        let AfterModelOutcome::Continue(state) = outcome else { panic!("expected continue") };
        let call = &state.messages[0].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.status, ToolCallStatus::Failed);
    }
}
