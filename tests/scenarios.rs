//! End-to-end coverage of the testable scenarios S1-S8.
//!
//! Each test drives a real `AgentServer` (and, where relevant, a real
//! `VfsHandle` or `SubAgent`) through the public API exactly as an external
//! caller would, using `MockLlm` to script the model's replies. Several of
//! these scenarios already have focused unit coverage next to the code they
//! exercise (`server.rs`, `vfs/mod.rs`, `subagent.rs`); this file gives each
//! one its own named, cross-module test so the full S1-S8 list is visible
//! in one place.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use deepagent_rt::agent::{Agent, AgentConfig};
use deepagent_rt::hitl::{Decision, InterruptOn, InterruptOnMap};
use deepagent_rt::llm::{LlmCallbacks, LlmRequest, LlmResponse, LlmTransport, MockLlm, ModelHandle};
use deepagent_rt::schemas::event::{AgentStatus, Event};
use deepagent_rt::schemas::{Message, ToolCall};
use deepagent_rt::server::{self, AgentServerConfig};
use deepagent_rt::state::State;
use deepagent_rt::subagent::SubAgentDefinition;
use deepagent_rt::tool::{FunctionParam, ParamType, ToolContext, ToolOutcome, ToolSpec};
use deepagent_rt::vfs::{self, PersistContext, PersistenceBackend, PersistenceRegistration};

fn echo_tool(name: &'static str) -> ToolSpec {
    ToolSpec::new(
        name,
        "Echoes its 'subject' argument back as the result text.",
        vec![FunctionParam::new("subject", ParamType::String).with_description("payload").required()],
        Arc::new(move |args: Map<String, Value>, ctx: ToolContext| {
            Box::pin(async move {
                let subject = args.get("subject").and_then(Value::as_str).unwrap_or("").to_string();
                Ok(ToolOutcome::result_only(deepagent_rt::schemas::ToolResult::ok(
                    ctx.call_id.clone(),
                    format!("sent: {subject}"),
                )))
            })
        }),
    )
}

/// S1: a plain turn with no tool calls runs straight to `Idle` with the
/// assistant's reply appended to state.
#[tokio::test]
async fn s1_simple_turn_completes_with_the_assistant_reply() {
    let model = MockLlm::handle("mock", vec![Message::assistant("Hello there")]);
    let agent = Agent::new(AgentConfig::new(model)).unwrap();
    let (vfs, _vfs_join) = vfs::spawn(agent.id.clone());
    let (server, _join) = server::spawn(agent, vfs, State::new(), AgentServerConfig::default(), None);

    server.execute(Some("hi".into())).await.unwrap();

    let mut events = server.subscribe();
    let mut reached_idle = false;
    for _ in 0..8 {
        if let Ok(Event::StatusChanged { status: AgentStatus::Idle, .. }) = events.try_recv() {
            reached_idle = true;
            break;
        }
    }
    // status may have already settled before we subscribed; fall back to a direct check.
    let status = server.get_status().await.unwrap();
    assert!(reached_idle || status == AgentStatus::Idle);

    let state = server.get_state().await.unwrap();
    assert_eq!(state.messages.last().unwrap().content.as_text(), "Hello there");
}

/// S2: a tool call against a non-gated tool auto-executes without pausing
/// for review, and the turn completes with both the tool result and the
/// follow-up assistant reply recorded.
#[tokio::test]
async fn s2_non_gated_tool_call_auto_executes_to_completion() {
    let gated_call = Message::assistant_with_tool_calls(
        "",
        vec![ToolCall::complete("call-1", "lookup", {
            let mut m = Map::new();
            m.insert("subject".into(), Value::String("weather".into()));
            m
        }, 0)],
    );
    let model = MockLlm::handle("mock", vec![gated_call, Message::assistant("Here's what I found")]);
    let agent = Agent::new(AgentConfig::new(model).with_tools(vec![echo_tool("lookup")])).unwrap();
    let (vfs, _vfs_join) = vfs::spawn(agent.id.clone());
    let (server, _join) = server::spawn(agent, vfs, State::new(), AgentServerConfig::default(), None);

    server.execute(Some("what's the weather?".into())).await.unwrap();
    assert_eq!(server.get_status().await.unwrap(), AgentStatus::Idle);

    let state = server.get_state().await.unwrap();
    let tool_message = state
        .messages
        .iter()
        .find(|m| m.tool_results.is_some())
        .expect("a tool-result message should be present");
    assert_eq!(tool_message.tool_results.as_ref().unwrap()[0].content.as_text(), "sent: weather");
    assert_eq!(state.messages.last().unwrap().content.as_text(), "Here's what I found");
}

/// S3: a gated tool call parks the turn on `Interrupted`; resuming with an
/// `Edit` decision executes the tool with the edited arguments, not the
/// model's originals.
#[tokio::test]
async fn s3_hitl_edit_decision_executes_with_the_edited_arguments() {
    let gated_call = Message::assistant_with_tool_calls(
        "",
        vec![ToolCall::complete("call-1", "send_email", {
            let mut m = Map::new();
            m.insert("subject".into(), Value::String("original subject".into()));
            m
        }, 0)],
    );
    let model = MockLlm::handle("mock", vec![gated_call, Message::assistant("Done")]);

    let mut interrupt_on = InterruptOnMap::new();
    interrupt_on.insert("send_email".into(), InterruptOn::Flag(true));

    let agent = Agent::new(
        AgentConfig::new(model)
            .with_tools(vec![echo_tool("send_email")])
            .with_interrupt_on(interrupt_on),
    )
    .unwrap();
    let (vfs, _vfs_join) = vfs::spawn(agent.id.clone());
    let (server, _join) = server::spawn(agent, vfs, State::new(), AgentServerConfig::default(), None);

    server.execute(Some("email the team".into())).await.unwrap();
    assert_eq!(server.get_status().await.unwrap(), AgentStatus::Interrupted);

    let parked = server.get_state().await.unwrap();
    let interrupt_data = parked.interrupt_data.clone().expect("interrupt data should be attached");
    assert_eq!(interrupt_data.action_requests.len(), 1);
    assert_eq!(interrupt_data.action_requests[0].tool_name, "send_email");

    let mut edited = Map::new();
    edited.insert("subject".into(), Value::String("edited subject".into()));
    server.resume(vec![Decision::Edit { arguments: edited }]).await.unwrap();

    assert_eq!(server.get_status().await.unwrap(), AgentStatus::Idle);
    let state = server.get_state().await.unwrap();
    let tool_message = state
        .messages
        .iter()
        .find(|m| m.tool_results.is_some())
        .expect("a tool-result message should be present");
    assert_eq!(tool_message.tool_results.as_ref().unwrap()[0].content.as_text(), "sent: edited subject");
}

/// S4: resuming a gated tool call with `Reject` produces the synthetic
/// "rejected by human reviewer" tool result rather than executing the tool,
/// and the turn still runs to completion.
#[tokio::test]
async fn s4_hitl_reject_decision_short_circuits_the_tool_call() {
    let gated_call = Message::assistant_with_tool_calls(
        "",
        vec![ToolCall::complete("call-1", "send_email", Map::new(), 0)],
    );
    let model = MockLlm::handle("mock", vec![gated_call, Message::assistant("Understood, not sending.")]);

    let mut interrupt_on = InterruptOnMap::new();
    interrupt_on.insert("send_email".into(), InterruptOn::Flag(true));

    let agent = Agent::new(
        AgentConfig::new(model)
            .with_tools(vec![echo_tool("send_email")])
            .with_interrupt_on(interrupt_on),
    )
    .unwrap();
    let (vfs, _vfs_join) = vfs::spawn(agent.id.clone());
    let (server, _join) = server::spawn(agent, vfs, State::new(), AgentServerConfig::default(), None);

    server.execute(Some("email the team".into())).await.unwrap();
    assert_eq!(server.get_status().await.unwrap(), AgentStatus::Interrupted);

    server.resume(vec![Decision::Reject]).await.unwrap();

    assert_eq!(server.get_status().await.unwrap(), AgentStatus::Idle);
    let state = server.get_state().await.unwrap();
    let tool_message = state
        .messages
        .iter()
        .find(|m| m.tool_results.is_some())
        .expect("a tool-result message should be present");
    let result = &tool_message.tool_results.as_ref().unwrap()[0];
    assert!(result.is_error);
    assert_eq!(result.content.as_text(), "Tool execution rejected by human reviewer");
}

/// S5: cancelling a turn mid-flight moves the server to `Cancelled`
/// promptly, and a subsequent `add_message` returns it to `Idle`.
#[tokio::test]
async fn s5_cancel_mid_turn_moves_to_cancelled_then_recovers_on_add_message() {
    struct HangingLlm;

    #[async_trait]
    impl LlmTransport for HangingLlm {
        async fn call(&self, _request: LlmRequest, _callbacks: &LlmCallbacks) -> Result<LlmResponse, deepagent_rt::error::LlmError> {
            std::future::pending::<()>().await;
            unreachable!("cancelled before this resolves")
        }
    }

    let model = ModelHandle::new("slow", Arc::new(HangingLlm));
    let agent = Agent::new(AgentConfig::new(model)).unwrap();
    let (vfs, _vfs_join) = vfs::spawn(agent.id.clone());
    let (server, _join) = server::spawn(agent, vfs, State::new(), AgentServerConfig::default(), None);

    server.execute(Some("hang please".into())).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    server.cancel().await.unwrap();
    assert_eq!(server.get_status().await.unwrap(), AgentStatus::Cancelled);

    server.add_message(Message::user("still there?").unwrap()).await.unwrap();
    assert_eq!(server.get_status().await.unwrap(), AgentStatus::Idle);
}

/// S6: rapid writes to the same path within the debounce window collapse
/// into exactly one backend write, carrying the last content written.
#[tokio::test]
async fn s6_rapid_writes_to_one_path_debounce_into_a_single_backend_write() {
    struct CountingBackend {
        writes: Arc<AtomicUsize>,
        last_content: Arc<std::sync::Mutex<String>>,
    }

    #[async_trait]
    impl PersistenceBackend for CountingBackend {
        async fn on_write(&self, _path: &str, content: &str, _ctx: &PersistContext) -> Result<(), String> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            *self.last_content.lock().unwrap() = content.to_string();
            Ok(())
        }

        async fn on_read(&self, _path: &str, _ctx: &PersistContext) -> Result<Option<String>, String> {
            Ok(None)
        }

        async fn on_delete(&self, _path: &str, _ctx: &PersistContext) -> Result<(), String> {
            Ok(())
        }
    }

    let writes = Arc::new(AtomicUsize::new(0));
    let last_content = Arc::new(std::sync::Mutex::new(String::new()));
    let backend = Arc::new(CountingBackend {
        writes: writes.clone(),
        last_content: last_content.clone(),
    });

    let (vfs, _join) = vfs::spawn("agent-debounce");
    vfs.register_persistence(PersistenceRegistration {
        base_directory: "/mem".into(),
        debounce_ms: 30,
        backend,
    })
    .await
    .unwrap();

    vfs.write("/mem/a.txt", "a").await.unwrap();
    vfs.write("/mem/a.txt", "ab").await.unwrap();
    vfs.write("/mem/a.txt", "abc").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert_eq!(*last_content.lock().unwrap(), "abc");
}

/// S7: a completed sub-agent run propagates only file/metadata state back
/// to the parent; its own messages and todos never leak.
#[tokio::test]
async fn s7_subagent_completion_propagates_only_files_and_metadata() {
    let model = MockLlm::handle("mock", vec![Message::assistant("research complete: 42")]);
    let definition = SubAgentDefinition::new("researcher", "You research things.", model)
        .with_description("Looks things up in isolation");

    let counter = deepagent_rt::subagent::SubAgentCounter::new();
    let mut sub = deepagent_rt::subagent::SubAgent::new(&counter, "parent-agent", "what is the answer?", &definition);

    let (vfs, _vfs_join) = vfs::spawn("parent-agent");
    let mut parent_metadata = Map::new();
    parent_metadata.insert("tenant".to_string(), Value::String("acme".into()));

    let cancel = tokio_util::sync::CancellationToken::new();
    let outcome = sub.run(vfs, parent_metadata, &cancel).await.unwrap();

    match outcome {
        deepagent_rt::subagent::SubAgentOutcome::Completed { text, propagated_state } => {
            assert_eq!(text, "research complete: 42");
            assert!(propagated_state.messages.is_empty());
            assert!(propagated_state.todos.is_empty());
        }
        _ => panic!("expected the sub-agent to complete"),
    }
}

/// S8: exporting a running server's state and restoring it into a fresh
/// server reproduces the same messages (resume-completeness across
/// process boundaries).
#[tokio::test]
async fn s8_export_then_restore_reproduces_messages_on_a_fresh_server() {
    let model = MockLlm::handle("mock", vec![]);
    let agent = Agent::new(AgentConfig::new(model)).unwrap();
    let (vfs, _vfs_join) = vfs::spawn(agent.id.clone());
    let (server, _join) = server::spawn(agent, vfs, State::new(), AgentServerConfig::default(), None);

    server.add_message(Message::user("remember this fact").unwrap()).await.unwrap();
    server.add_message(Message::assistant("noted.")).await.unwrap();
    let exported = server.export_state().await.unwrap();

    let model2 = MockLlm::handle("mock", vec![]);
    let agent2 = Agent::new(AgentConfig::new(model2)).unwrap();
    let (vfs2, _vfs2_join) = vfs::spawn(agent2.id.clone());
    let (server2, _join2) = server::spawn(agent2, vfs2, State::new(), AgentServerConfig::default(), None);

    server2.restore_state(exported).await.unwrap();
    let restored = server2.get_state().await.unwrap();

    assert_eq!(restored.messages.len(), 2);
    assert_eq!(restored.messages[0].content.as_text(), "remember this fact");
    assert_eq!(restored.messages[1].content.as_text(), "noted.");
}
