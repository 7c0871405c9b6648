//! FileSystem middleware — spec.md §2 default stack, §4.2, §4.4 step 3.
//!
//! Contributes `ls`, `read_file`, `write_file`, `edit_file`, `glob`, `grep`,
//! backed directly by the VFS (`crate::vfs::VfsHandle`) rather than the
//! teacher's disk/`WorkspaceBackend`/store-`StoreBackend` pair
//! (`deep_agent::tools::fs::{ls,read_file,write_file,edit_file,glob,grep}`):
//! this crate's FileSystem middleware is VFS-native, so every tool here calls
//! straight through to `VfsHandle` instead of resolving a workspace root on
//! disk. `glob` pattern matching reuses the teacher's dependency on the
//! `glob` crate (`Pattern::matches`) against the VFS's in-memory path list
//! instead of walking a directory tree. `grep` is plain substring search,
//! matching the teacher's own `GrepTool` (which never reaches for `regex`
//! despite the crate being a dependency elsewhere in the teacher).

use std::sync::Arc;

use async_trait::async_trait;
use glob::Pattern;
use serde_json::{Map, Value};

use super::Middleware;
use crate::tool::{FunctionParam, ParamType, ToolError, ToolOutcome, ToolSpec};
use crate::vfs::VfsError;

pub struct FileSystemMiddleware;

impl FileSystemMiddleware {
    pub const ID: &'static str = "filesystem";

    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for FileSystemMiddleware {
    fn id(&self) -> &str {
        Self::ID
    }

    fn system_prompt(&self, _config: &Map<String, Value>) -> Vec<String> {
        vec![
            "You have a private virtual filesystem. Use `ls`, `read_file`, \
             `write_file`, `edit_file`, `glob`, and `grep` to persist notes \
             and intermediate work across turns."
                .to_string(),
        ]
    }

    fn tools(&self, _config: &Map<String, Value>) -> Vec<ToolSpec> {
        vec![ls_tool(), read_file_tool(), write_file_tool(), edit_file_tool(), glob_tool(), grep_tool()]
    }
}

fn exec_failed(name: &str, reason: impl ToString) -> ToolError {
    ToolError::ExecutionFailed {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn ls_tool() -> ToolSpec {
    let params = vec![FunctionParam::new("prefix", ParamType::String)
        .with_description("Only list paths starting with this prefix; default lists everything")];
    ToolSpec::new(
        "ls",
        "List known file paths, optionally filtered by a path prefix.",
        params,
        Arc::new(|args, ctx| {
            Box::pin(async move {
                let prefix = args.get("prefix").and_then(Value::as_str).unwrap_or("");
                let mut paths = ctx.vfs.list().await.map_err(|e| exec_failed("ls", e))?;
                paths.retain(|p| p.starts_with(prefix));
                paths.sort();
                let result = crate::schemas::ToolResult::ok(ctx.call_id.clone(), paths.join("\n"));
                Ok(ToolOutcome::result_only(result))
            })
        }),
    )
}

fn read_file_tool() -> ToolSpec {
    let params = vec![FunctionParam::new("path", ParamType::String).required()];
    ToolSpec::new(
        "read_file",
        "Read the content of a file from the virtual filesystem.",
        params,
        Arc::new(|args, ctx| {
            Box::pin(async move {
                let path = args
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| exec_failed("read_file", "missing path"))?;
                match ctx.vfs.read(path).await {
                    Ok(content) => Ok(ToolOutcome::result_only(crate::schemas::ToolResult::ok(
                        ctx.call_id.clone(),
                        content,
                    ))),
                    Err(VfsError::NotFound(_)) => Ok(ToolOutcome::result_only(crate::schemas::ToolResult::error(
                        ctx.call_id.clone(),
                        format!("file not found: {path}"),
                    ))),
                    Err(e) => Err(exec_failed("read_file", e)),
                }
            })
        }),
    )
}

fn write_file_tool() -> ToolSpec {
    let params = vec![
        FunctionParam::new("path", ParamType::String).required(),
        FunctionParam::new("content", ParamType::String).required(),
    ];
    ToolSpec::new(
        "write_file",
        "Write (creating or overwriting) a file in the virtual filesystem.",
        params,
        Arc::new(|args, ctx| {
            Box::pin(async move {
                let path = args
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| exec_failed("write_file", "missing path"))?;
                let content = args.get("content").and_then(Value::as_str).unwrap_or("");
                ctx.vfs
                    .write(path, content)
                    .await
                    .map_err(|e| exec_failed("write_file", e))?;
                let result =
                    crate::schemas::ToolResult::ok(ctx.call_id.clone(), format!("wrote {path}"));
                Ok(ToolOutcome::result_only(result))
            })
        }),
    )
}

fn edit_file_tool() -> ToolSpec {
    let replacement_params = vec![
        FunctionParam::new("old_string", ParamType::String).required(),
        FunctionParam::new("new_string", ParamType::String).required(),
    ];
    let params = vec![
        FunctionParam::new("path", ParamType::String).required(),
        FunctionParam {
            item_type: Some(Box::new(FunctionParam {
                object_properties: Some(replacement_params),
                ..FunctionParam::new("replacement", ParamType::Object)
            })),
            ..FunctionParam::new("replacements", ParamType::Array)
                .required()
                .with_description("Exact old_string -> new_string replacements, applied in order")
        },
    ];
    ToolSpec::new(
        "edit_file",
        "Edit a file by one or more exact string replacements.",
        params,
        Arc::new(|args, ctx| {
            Box::pin(async move {
                let path = args
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| exec_failed("edit_file", "missing path"))?;
                let replacements = args
                    .get("replacements")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let mut content = match ctx.vfs.read(path).await {
                    Ok(content) => content,
                    Err(VfsError::NotFound(_)) => {
                        return Ok(ToolOutcome::result_only(crate::schemas::ToolResult::error(
                            ctx.call_id.clone(),
                            format!("file not found: {path}"),
                        )))
                    }
                    Err(e) => return Err(exec_failed("edit_file", e)),
                };

                let mut applied = 0u32;
                for r in &replacements {
                    let old_s = r.get("old_string").and_then(Value::as_str).unwrap_or("");
                    let new_s = r.get("new_string").and_then(Value::as_str).unwrap_or("");
                    if !old_s.is_empty() && content.contains(old_s) {
                        content = content.replace(old_s, new_s);
                        applied += 1;
                    }
                }

                ctx.vfs
                    .write(path, content)
                    .await
                    .map_err(|e| exec_failed("edit_file", e))?;

                let result = crate::schemas::ToolResult::ok(
                    ctx.call_id.clone(),
                    format!("applied {applied} replacement(s) to {path}"),
                );
                Ok(ToolOutcome::result_only(result))
            })
        }),
    )
}

fn glob_tool() -> ToolSpec {
    let params = vec![FunctionParam::new("pattern", ParamType::String).required()];
    ToolSpec::new(
        "glob",
        "List file paths matching a glob pattern (e.g. '/notes/*.md').",
        params,
        Arc::new(|args, ctx| {
            Box::pin(async move {
                let pattern_str = args
                    .get("pattern")
                    .and_then(Value::as_str)
                    .ok_or_else(|| exec_failed("glob", "missing pattern"))?;
                let pattern = Pattern::new(pattern_str).map_err(|e| exec_failed("glob", e))?;
                let mut paths = ctx.vfs.list().await.map_err(|e| exec_failed("glob", e))?;
                paths.retain(|p| pattern.matches(p));
                paths.sort();
                let result = crate::schemas::ToolResult::ok(ctx.call_id.clone(), paths.join("\n"));
                Ok(ToolOutcome::result_only(result))
            })
        }),
    )
}

fn grep_tool() -> ToolSpec {
    let params = vec![
        FunctionParam::new("query", ParamType::String)
            .required()
            .with_description("Plain-text substring to search for"),
        FunctionParam::new("mode", ParamType::String)
            .with_description("files | content | count; default content"),
    ];
    ToolSpec::new(
        "grep",
        "Search file contents for a plain-text substring across the virtual filesystem.",
        params,
        Arc::new(|args, ctx| {
            Box::pin(async move {
                let query = args
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| exec_failed("grep", "missing query"))?;
                let mode = args.get("mode").and_then(Value::as_str).unwrap_or("content");

                let paths = ctx.vfs.list().await.map_err(|e| exec_failed("grep", e))?;
                let mut matching_files = Vec::new();
                let mut content_lines = Vec::new();
                let mut counts = Vec::new();

                for path in paths {
                    let Ok(content) = ctx.vfs.read(&path).await else { continue };
                    let mut file_count = 0u32;
                    for (lineno, line) in content.lines().enumerate() {
                        if line.contains(query) {
                            file_count += 1;
                            content_lines.push(format!("{path}:{}: {line}", lineno + 1));
                        }
                    }
                    if file_count > 0 {
                        matching_files.push(path.clone());
                        counts.push(format!("{path}: {file_count}"));
                    }
                }

                let text = match mode {
                    "files" | "file" => matching_files.join("\n"),
                    "count" | "counts" => counts.join("\n"),
                    _ => content_lines.join("\n"),
                };
                let result = crate::schemas::ToolResult::ok(ctx.call_id.clone(), text);
                Ok(ToolOutcome::result_only(result))
            })
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use crate::vfs;

    async fn ctx_for(vfs: vfs::VfsHandle, call_id: &str) -> crate::tool::ToolContext {
        crate::tool::ToolContext {
            agent_id: "agent-1".into(),
            call_id: call_id.into(),
            vfs,
            state: Arc::new(State::new()),
            debug_events: crate::pubsub::debug_topic("agent-1"),
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (vfs, _join) = vfs::spawn("agent-1");
        let write = write_file_tool();
        let args = serde_json::json!({"path": "/a.txt", "content": "hi"})
            .as_object()
            .unwrap()
            .clone();
        (write.function)(args, ctx_for(vfs.clone(), "c1").await).await.unwrap();

        let read = read_file_tool();
        let args = serde_json::json!({"path": "/a.txt"}).as_object().unwrap().clone();
        let outcome = (read.function)(args, ctx_for(vfs, "c2").await).await.unwrap();
        assert_eq!(outcome.result.content.as_text(), "hi");
    }

    #[tokio::test]
    async fn glob_matches_registered_paths() {
        let (vfs, _join) = vfs::spawn("agent-1");
        vfs.write("/notes/a.md", "x").await.unwrap();
        vfs.write("/notes/b.txt", "y").await.unwrap();

        let tool = glob_tool();
        let args = serde_json::json!({"pattern": "/notes/*.md"}).as_object().unwrap().clone();
        let outcome = (tool.function)(args, ctx_for(vfs, "c1").await).await.unwrap();
        assert_eq!(outcome.result.content.as_text(), "/notes/a.md");
    }

    #[tokio::test]
    async fn grep_finds_substring_across_files() {
        let (vfs, _join) = vfs::spawn("agent-1");
        vfs.write("/a.txt", "hello world").await.unwrap();
        vfs.write("/b.txt", "goodbye").await.unwrap();

        let tool = grep_tool();
        let args = serde_json::json!({"query": "hello", "mode": "files"}).as_object().unwrap().clone();
        let outcome = (tool.function)(args, ctx_for(vfs, "c1").await).await.unwrap();
        assert_eq!(outcome.result.content.as_text(), "/a.txt");
    }
}
