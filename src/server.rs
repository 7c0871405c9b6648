//! AgentServer process — spec.md §4.7.
//!
//! The long-lived per-agent process: same tokio-task-plus-mailbox actor
//! shape as `crate::vfs` (spec.md §9: "model each as a goroutine/task plus a
//! message-channel mailbox"), but the mailbox here exposes the full
//! operation table of §4.7 rather than a handful of file operations, and one
//! operation (`execute`/`resume`) spawns a *child* worker task so the actor
//! keeps draining `cancel`/`get_*`/`subscribe` while a turn is in flight
//! (spec.md §5: "LLM calls and tool executions happen on a child worker task
//! of that process so the parent can accept `cancel`, `get_*`, and
//! `subscribe` messages during a turn"). Grounded in the pack's
//! `the-snesler-spacebot` `Channel` actor (`mpsc` inbound mailbox, `broadcast`
//! outbound events, a `self_tx` for re-triggering itself after background
//! work finishes) for the overall actor wiring.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::engine::ExecuteOutcome;
use crate::hitl::{Decision, InterruptData};
use crate::llm::LlmCallbacks;
use crate::pubsub::{self, Topic};
use crate::schemas::event::{AgentStatus, DisplayMessage, Event};
use crate::schemas::Message;
use crate::state::{SerializationError, State};
use crate::vfs::VfsHandle;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("operation '{operation}' requires status {expected:?}, but the agent is {actual:?}")]
    InvalidPrecondition {
        operation: &'static str,
        expected: AgentStatus,
        actual: AgentStatus,
    },

    #[error("resume requested but the agent has no parked interrupt")]
    NoActiveInterrupt,

    #[error("AgentServer process is no longer running")]
    ProcessGone,
}

/// `ms | nil | infinity` from spec.md §6 `inactivity_timeout`, collapsed to
/// "disabled or armed for N ms" since `nil` and `infinity` behave
/// identically (spec.md §4.7: "A timeout of nil or infinity disables the
/// behaviour").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InactivityTimeout {
    Disabled,
    Ms(u64),
}

/// The return value of `save_new_message_fn` on failure, per spec.md §4.7:
/// a string reason is enough, the engine only logs it.
pub type SaveNewMessageFn =
    Arc<dyn Fn(String, Message) -> BoxFuture<'static, Result<Vec<DisplayMessage>, String>> + Send + Sync>;

/// `presence_tracking: {enabled, presence_module, topic}` from spec.md §6.
/// The presence module itself is an external collaborator (a UI-facing
/// subscriber tracker, e.g. a Phoenix Presence-style service) — out of
/// scope per spec.md §1 ("outer CLI/application layer"). The server only
/// carries the config through and exposes the live subscriber count its
/// own `events` topic already knows, so an application can wire whatever
/// presence service `presence_module` names without the engine depending
/// on it.
#[derive(Clone, Debug, Default)]
pub struct PresenceConfig {
    pub enabled: bool,
    pub presence_module: Option<String>,
    pub topic: Option<String>,
}

/// Construction-time configuration for an `AgentServer` (spec.md §6
/// "Configuration" fields that are the server's, not the agent's:
/// `inactivity_timeout`, `shutdown_delay`, `conversation_id`,
/// `save_new_message_fn`, `presence_tracking`).
#[derive(Clone, Default)]
pub struct AgentServerConfig {
    pub inactivity_timeout: Option<InactivityTimeout>,
    pub shutdown_delay_ms: u64,
    pub conversation_id: Option<String>,
    pub save_new_message_fn: Option<SaveNewMessageFn>,
    pub presence_config: Option<PresenceConfig>,
}

impl AgentServerConfig {
    pub fn with_inactivity_timeout(mut self, timeout: InactivityTimeout) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_delay_ms(mut self, ms: u64) -> Self {
        self.shutdown_delay_ms = ms;
        self
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn with_save_new_message_fn(mut self, f: SaveNewMessageFn) -> Self {
        self.save_new_message_fn = Some(f);
        self
    }

    pub fn with_presence_config(mut self, presence: PresenceConfig) -> Self {
        self.presence_config = Some(presence);
        self
    }
}

/// Read-only snapshot returned by `get_info` (spec.md §4.7, §7
/// "introspection via get_info exposes the reason and the last state").
#[derive(Clone, Debug)]
pub struct AgentInfo {
    pub agent_id: String,
    pub status: AgentStatus,
    pub error: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: usize,
    pub todo_count: usize,
    pub tool_names: Vec<String>,
    pub middleware_ids: Vec<String>,
    /// Live count of active `events` topic subscribers — the figure a
    /// `presence_tracking` integration (spec.md §6) would republish under
    /// `presence_config.topic` rather than anything the engine tracks
    /// itself.
    pub subscriber_count: usize,
}

#[derive(Clone, Debug)]
pub struct InactivityStatus {
    pub enabled: bool,
    pub timeout_ms: Option<u64>,
    pub last_activity_at: DateTime<Utc>,
}

/// A signal the `AgentServer` sends up to its owning `AgentSupervisor`
/// (spec.md §4.7 "asks its owning supervisor to stop the whole agent
/// subtree"). Kept as a tiny channel rather than a direct supervisor handle
/// so the server has no compile-time dependency on `crate::supervisor`.
#[derive(Debug)]
pub enum SupervisorSignal {
    StopSubtree { agent_id: String, reason: String },
}

enum Command {
    Execute {
        user_input: Option<String>,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    Resume {
        decisions: Vec<Decision>,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    AddMessage {
        message: Message,
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    SetTodos {
        todos: Vec<crate::schemas::Todo>,
        reply: oneshot::Sender<()>,
    },
    SetMessages {
        messages: Vec<Message>,
        reply: oneshot::Sender<()>,
    },
    ExportState {
        reply: oneshot::Sender<Value>,
    },
    RestoreState {
        serialized: Value,
        reply: oneshot::Sender<Result<(), SerializationError>>,
    },
    UpdateAgentAndState {
        agent: Agent,
        state: State,
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        reply: oneshot::Sender<broadcast::Receiver<Event>>,
    },
    SubscribeDebug {
        reply: oneshot::Sender<broadcast::Receiver<crate::schemas::event::DebugEvent>>,
    },
    GetState {
        reply: oneshot::Sender<State>,
    },
    GetStatus {
        reply: oneshot::Sender<AgentStatus>,
    },
    GetInfo {
        reply: oneshot::Sender<AgentInfo>,
    },
    GetInactivityStatus {
        reply: oneshot::Sender<InactivityStatus>,
    },
    TurnFinished {
        generation: u64,
        outcome: Result<ExecuteOutcome, crate::error::RuntimeError>,
    },
    DisplayMessagesSaved {
        messages: Vec<DisplayMessage>,
    },
    InactivityFired {
        epoch: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheaply-cloneable handle to a running `AgentServer` task.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<Command>,
    pub agent_id: String,
    pub events: Topic<Event>,
    pub debug_events: Topic<crate::schemas::event::DebugEvent>,
}

impl ServerHandle {
    pub async fn execute(&self, user_input: Option<String>) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Execute { user_input, reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)?
    }

    pub async fn cancel(&self) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)?
    }

    pub async fn resume(&self, decisions: Vec<Decision>) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Resume { decisions, reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)?
    }

    pub async fn add_message(&self, message: Message) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AddMessage { message, reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    pub async fn reset(&self) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    pub async fn set_todos(&self, todos: Vec<crate::schemas::Todo>) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetTodos { todos, reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    pub async fn set_messages(&self, messages: Vec<Message>) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetMessages { messages, reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    pub async fn export_state(&self) -> Result<Value, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ExportState { reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    /// Errs with `ServerError::ProcessGone` if the actor is gone; a
    /// malformed payload is reported back as a `SerializationError` wrapped
    /// the same way the caller sees any other `RuntimeError`, so this
    /// returns the raw `SerializationError` rather than inventing a
    /// `ServerError` variant for it.
    pub async fn restore_state(&self, serialized: Value) -> Result<(), SerializationError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RestoreState { serialized, reply })
            .await
            .map_err(|_| SerializationError::MalformedField("state", "AgentServer process is gone".into()))?;
        rx.await
            .map_err(|_| SerializationError::MalformedField("state", "AgentServer process is gone".into()))?
    }

    pub async fn update_agent_and_state(&self, agent: Agent, state: State) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UpdateAgentAndState { agent, state, reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn subscribe_debug(&self) -> broadcast::Receiver<crate::schemas::event::DebugEvent> {
        self.debug_events.subscribe()
    }

    pub async fn get_state(&self) -> Result<State, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetState { reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    pub async fn get_status(&self) -> Result<AgentStatus, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetStatus { reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    pub async fn get_info(&self) -> Result<AgentInfo, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetInfo { reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    pub async fn get_inactivity_status(&self) -> Result<InactivityStatus, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetInactivityStatus { reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    /// Stops the actor task cleanly. Not part of spec.md §4.7's public
    /// operation table; used by `AgentSupervisor` when tearing down a
    /// subtree (e.g. after an inactivity shutdown).
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| ServerError::ProcessGone)
    }

    async fn send(&self, cmd: Command) -> Result<(), ServerError> {
        self.tx.send(cmd).await.map_err(|_| ServerError::ProcessGone)
    }
}

struct RunningTask {
    cancel: CancellationToken,
    generation: u64,
}

struct Inner {
    agent_id: String,
    agent: Agent,
    state: State,
    status: AgentStatus,
    vfs: VfsHandle,
    events: Topic<Event>,
    debug_events: Topic<crate::schemas::event::DebugEvent>,
    error: Option<String>,
    config: AgentServerConfig,
    last_activity_at: DateTime<Utc>,
    inactivity_epoch: u64,
    inactivity_timer: Option<JoinHandle<()>>,
    current_task: Option<RunningTask>,
    generation_counter: u64,
    supervisor_signal: Option<mpsc::Sender<SupervisorSignal>>,
}

/// Spawns the `AgentServer` task and returns a handle plus its
/// `JoinHandle` (spec.md §4.8: the supervisor owns this handle to detect
/// and restart a crashed server).
pub fn spawn(
    agent: Agent,
    vfs: VfsHandle,
    state: State,
    config: AgentServerConfig,
    supervisor_signal: Option<mpsc::Sender<SupervisorSignal>>,
) -> (ServerHandle, JoinHandle<()>) {
    let agent_id = agent.id.clone();
    let events = pubsub::event_topic(&agent_id);
    let debug_events = pubsub::debug_topic(&agent_id);

    let (tx, rx) = mpsc::channel(256);
    let handle = ServerHandle {
        tx: tx.clone(),
        agent_id: agent_id.clone(),
        events: events.clone(),
        debug_events: debug_events.clone(),
    };

    let inner = Inner {
        agent_id,
        agent,
        state,
        status: AgentStatus::Idle,
        vfs,
        events,
        debug_events,
        error: None,
        config,
        last_activity_at: Utc::now(),
        inactivity_epoch: 0,
        inactivity_timer: None,
        current_task: None,
        generation_counter: 0,
        supervisor_signal,
    };

    let join = tokio::spawn(run(inner, rx, tx));
    (handle, join)
}

async fn run(mut inner: Inner, mut rx: mpsc::Receiver<Command>, self_tx: mpsc::Sender<Command>) {
    run_on_server_start(&mut inner).await;
    rearm_inactivity(&mut inner, &self_tx);

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Execute { user_input, reply } => {
                let result = start_execute(&mut inner, &self_tx, user_input);
                rearm_inactivity(&mut inner, &self_tx);
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                let _ = reply.send(handle_cancel(&mut inner));
                rearm_inactivity(&mut inner, &self_tx);
            }
            Command::Resume { decisions, reply } => {
                let result = start_resume(&mut inner, &self_tx, decisions);
                rearm_inactivity(&mut inner, &self_tx);
                let _ = reply.send(result);
            }
            Command::AddMessage { message, reply } => {
                inner.state = inner.state.clone().add_message(message);
                if matches!(inner.status, AgentStatus::Error | AgentStatus::Cancelled) {
                    inner.status = AgentStatus::Idle;
                    inner.error = None;
                }
                inner.events.publish(Event::status_changed(inner.status));
                publish_debug_state(&inner);
                rearm_inactivity(&mut inner, &self_tx);
                let _ = reply.send(());
            }
            Command::Reset { reply } => {
                let _ = inner.vfs.reset().await;
                inner.state = inner.state.clone().reset();
                if matches!(
                    inner.status,
                    AgentStatus::Error | AgentStatus::Cancelled | AgentStatus::Interrupted
                ) {
                    inner.status = AgentStatus::Idle;
                    inner.error = None;
                }
                inner.events.publish(Event::status_changed(inner.status));
                rearm_inactivity(&mut inner, &self_tx);
                let _ = reply.send(());
            }
            Command::SetTodos { todos, reply } => {
                inner.state = inner.state.clone().set_todos(todos.clone());
                inner.events.publish(Event::TodosUpdated { todos });
                rearm_inactivity(&mut inner, &self_tx);
                let _ = reply.send(());
            }
            Command::SetMessages { messages, reply } => {
                let mut state = inner.state.clone();
                state.messages = messages;
                inner.state = state;
                rearm_inactivity(&mut inner, &self_tx);
                let _ = reply.send(());
            }
            Command::ExportState { reply } => {
                let _ = reply.send(inner.state.serialize());
            }
            Command::RestoreState { serialized, reply } => {
                let result = State::deserialize(&serialized);
                if let Ok(state) = &result {
                    inner.state = state.clone();
                    inner.events.publish(Event::StateRestored { state: inner.state.serialize() });
                }
                let _ = reply.send(result.map(|_| ()));
            }
            Command::UpdateAgentAndState { agent, state, reply } => {
                inner.agent = agent;
                inner.state = state;
                rearm_inactivity(&mut inner, &self_tx);
                let _ = reply.send(());
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(inner.events.subscribe());
            }
            Command::SubscribeDebug { reply } => {
                let _ = reply.send(inner.debug_events.subscribe());
            }
            Command::GetState { reply } => {
                let _ = reply.send(inner.state.clone());
            }
            Command::GetStatus { reply } => {
                let _ = reply.send(inner.status);
            }
            Command::GetInfo { reply } => {
                let _ = reply.send(build_info(&inner));
            }
            Command::GetInactivityStatus { reply } => {
                let _ = reply.send(InactivityStatus {
                    enabled: matches!(inner.config.inactivity_timeout, Some(InactivityTimeout::Ms(_))),
                    timeout_ms: match inner.config.inactivity_timeout {
                        Some(InactivityTimeout::Ms(ms)) => Some(ms),
                        _ => None,
                    },
                    last_activity_at: inner.last_activity_at,
                });
            }
            Command::TurnFinished { generation, outcome } => {
                handle_turn_finished(&mut inner, generation, outcome);
                rearm_inactivity(&mut inner, &self_tx);
            }
            Command::DisplayMessagesSaved { messages } => {
                for display_message in messages {
                    inner.events.publish(Event::DisplayMessageSaved { display_message });
                }
            }
            Command::InactivityFired { epoch } => {
                if epoch != inner.inactivity_epoch {
                    continue;
                }
                fire_inactivity_shutdown(&inner).await;
            }
            Command::Shutdown { reply } => {
                if let Some(timer) = inner.inactivity_timer.take() {
                    timer.abort();
                }
                let _ = reply.send(());
                break;
            }
        }
    }
}

async fn run_on_server_start(inner: &mut Inner) {
    match crate::middleware::run_on_server_start(&inner.agent.middleware, inner.state.clone()).await {
        Ok(state) => {
            inner.state = state;
            inner.events.publish(Event::TodosUpdated { todos: inner.state.todos.clone() });
        }
        Err(e) => log::warn!("agent '{}' on_server_start hook failed: {e}", inner.agent_id),
    }
}

fn start_execute(
    inner: &mut Inner,
    self_tx: &mpsc::Sender<Command>,
    user_input: Option<String>,
) -> Result<(), ServerError> {
    if inner.status != AgentStatus::Idle {
        return Err(ServerError::InvalidPrecondition {
            operation: "execute",
            expected: AgentStatus::Idle,
            actual: inner.status,
        });
    }

    inner.status = AgentStatus::Running;
    inner.error = None;
    inner.events.publish(Event::status_changed(AgentStatus::Running));

    inner.generation_counter += 1;
    let generation = inner.generation_counter;
    let cancel = CancellationToken::new();
    inner.current_task = Some(RunningTask { cancel: cancel.clone(), generation });

    let agent = inner.agent.clone();
    let vfs = inner.vfs.clone();
    let state = inner.state.clone();
    let events = inner.events.clone();
    let debug_events = inner.debug_events.clone();
    let self_tx = self_tx.clone();

    tokio::spawn(async move {
        let callbacks = streaming_callbacks(&events);
        let outcome = agent.execute(vfs, state, user_input, &callbacks, &debug_events, &cancel).await;
        let _ = self_tx.send(Command::TurnFinished { generation, outcome }).await;
    });

    Ok(())
}

fn start_resume(
    inner: &mut Inner,
    self_tx: &mpsc::Sender<Command>,
    decisions: Vec<Decision>,
) -> Result<(), ServerError> {
    if inner.status != AgentStatus::Interrupted {
        return Err(ServerError::InvalidPrecondition {
            operation: "resume",
            expected: AgentStatus::Interrupted,
            actual: inner.status,
        });
    }
    let Some(interrupt_data) = inner.state.interrupt_data.clone() else {
        return Err(ServerError::NoActiveInterrupt);
    };

    inner.status = AgentStatus::Running;
    inner.events.publish(Event::status_changed(AgentStatus::Running));

    inner.generation_counter += 1;
    let generation = inner.generation_counter;
    let cancel = CancellationToken::new();
    inner.current_task = Some(RunningTask { cancel: cancel.clone(), generation });

    let agent = inner.agent.clone();
    let vfs = inner.vfs.clone();
    let state = inner.state.clone();
    let events = inner.events.clone();
    let debug_events = inner.debug_events.clone();
    let self_tx = self_tx.clone();

    tokio::spawn(async move {
        let callbacks = streaming_callbacks(&events);
        let outcome = agent
            .resume(vfs, state, &interrupt_data, decisions, &callbacks, &debug_events, &cancel)
            .await;
        let _ = self_tx.send(Command::TurnFinished { generation, outcome }).await;
    });

    Ok(())
}

fn streaming_callbacks(events: &Topic<Event>) -> LlmCallbacks {
    let deltas_topic = events.clone();
    let message_topic = events.clone();
    let usage_topic = events.clone();
    LlmCallbacks {
        on_llm_new_delta: Some(Arc::new(move |deltas: &[crate::schemas::ContentPart]| {
            deltas_topic.publish(Event::LlmDeltas { deltas: deltas.to_vec() });
        })),
        on_message_processed: Some(Arc::new(move |message: &Message| {
            message_topic.publish(Event::LlmMessage { message: message.clone() });
        })),
        on_llm_token_usage: Some(Arc::new(move |usage: &crate::schemas::event::TokenUsage| {
            usage_topic.publish(Event::LlmTokenUsage { usage: usage.clone() });
        })),
    }
}

fn handle_cancel(inner: &mut Inner) -> Result<(), ServerError> {
    if inner.status != AgentStatus::Running {
        return Err(ServerError::InvalidPrecondition {
            operation: "cancel",
            expected: AgentStatus::Running,
            actual: inner.status,
        });
    }
    if let Some(task) = inner.current_task.take() {
        task.cancel.cancel();
    }
    inner.status = AgentStatus::Cancelled;
    // Deliberately NOT broadcast (spec.md §4.7: "state may be inconsistent,
    // so is NOT broadcast").
    Ok(())
}

fn handle_turn_finished(
    inner: &mut Inner,
    generation: u64,
    outcome: Result<ExecuteOutcome, crate::error::RuntimeError>,
) {
    let is_current = matches!(&inner.current_task, Some(task) if task.generation == generation);
    if !is_current {
        log::debug!(
            "agent '{}' dropping a stale turn completion (generation {generation})",
            inner.agent_id
        );
        return;
    }
    inner.current_task = None;

    if inner.status == AgentStatus::Cancelled {
        // spec.md §5: "subsequent task completion messages are ignored".
        return;
    }

    match outcome {
        Ok(ExecuteOutcome::Completed(state)) => {
            persist_new_messages(inner, &state);
            let previous_middleware_state = inner.state.middleware_state.clone();
            inner.state = state;
            inner.status = AgentStatus::Idle;
            if let Some(last) = inner.state.messages.last() {
                inner.events.publish(Event::ToolResponse { message: last.clone() });
            }
            inner.events.publish(Event::TodosUpdated { todos: inner.state.todos.clone() });
            inner.events.publish(Event::status_changed(AgentStatus::Idle));
            publish_middleware_state_updates(inner, &previous_middleware_state);
            publish_debug_state(inner);
        }
        Ok(ExecuteOutcome::Interrupted(state, data)) => {
            persist_new_messages(inner, &state);
            let previous_middleware_state = inner.state.middleware_state.clone();
            let mut state = state;
            state.interrupt_data = Some(data.clone());
            inner.state = state;
            inner.status = AgentStatus::Interrupted;
            inner.events.publish(Event::status_changed_with_payload(
                AgentStatus::Interrupted,
                serde_json::to_value(&data).unwrap_or(Value::Null),
            ));
            publish_middleware_state_updates(inner, &previous_middleware_state);
            publish_debug_state(inner);
        }
        Ok(ExecuteOutcome::Cancelled(state)) => {
            inner.state = state;
            inner.status = AgentStatus::Cancelled;
        }
        Err(err) => {
            inner.error = Some(err.to_string());
            inner.status = AgentStatus::Error;
            inner.events.publish(Event::status_changed_with_payload(
                AgentStatus::Error,
                Value::String(err.to_string()),
            ));
        }
    }
}

/// Passes every message produced this turn to `save_new_message_fn` and
/// forwards its returned display messages through the actor's own mailbox
/// so they broadcast from inside the single-threaded loop (spec.md §4.7
/// "Persistence hook").
fn persist_new_messages(inner: &Inner, new_state: &State) {
    let Some(save_fn) = inner.config.save_new_message_fn.clone() else {
        return;
    };
    let Some(conversation_id) = inner.config.conversation_id.clone() else {
        return;
    };
    let already = inner.state.messages.len();
    let fresh = new_state.messages.iter().skip(already).cloned().collect::<Vec<_>>();
    if fresh.is_empty() {
        return;
    }

    for message in fresh {
        let save_fn = save_fn.clone();
        let conversation_id = conversation_id.clone();
        let self_tx_events = inner.events.clone();
        tokio::spawn(async move {
            match save_fn(conversation_id, message).await {
                Ok(display_messages) => {
                    for display_message in display_messages {
                        self_tx_events.publish(Event::DisplayMessageSaved { display_message });
                    }
                }
                Err(reason) => {
                    log::warn!("save_new_message_fn failed: {reason}; suppressing display broadcast for this message");
                }
            }
        });
    }
}

/// Publishes one `DebugEvent::MiddlewareStateUpdate` per middleware id whose
/// `State::middleware_state` entry is new or changed since `previous`
/// (spec.md §6 `DebugEvent::MiddlewareStateUpdate`). No middleware hook is
/// required to notify explicitly; a turn's net effect on the shared state map
/// is enough to tell which ids moved.
fn publish_middleware_state_updates(inner: &Inner, previous: &HashMap<String, Value>) {
    for (middleware_id, value) in &inner.state.middleware_state {
        if previous.get(middleware_id) != Some(value) {
            inner.debug_events.publish(crate::schemas::event::DebugEvent::MiddlewareStateUpdate {
                middleware_id: middleware_id.clone(),
                state: value.clone(),
            });
        }
    }
}

fn publish_debug_state(inner: &Inner) {
    inner.debug_events.publish(crate::schemas::event::DebugEvent::AgentStateUpdate {
        state: inner.state.serialize(),
    });
}

fn build_info(inner: &Inner) -> AgentInfo {
    AgentInfo {
        agent_id: inner.agent_id.clone(),
        status: inner.status,
        error: inner.error.clone(),
        last_activity_at: inner.last_activity_at,
        message_count: inner.state.messages.len(),
        todo_count: inner.state.todos.len(),
        tool_names: inner.agent.tools.iter().map(|t| t.name.clone()).collect(),
        middleware_ids: inner.agent.middleware.iter().map(|m| m.id.clone()).collect(),
        subscriber_count: inner.events.subscriber_count(),
    }
}

/// (Re)arms the inactivity timer (spec.md §4.7 "a timer is (re)armed on
/// every status-changing or user-visible operation").
fn rearm_inactivity(inner: &mut Inner, self_tx: &mpsc::Sender<Command>) {
    inner.last_activity_at = Utc::now();
    if let Some(timer) = inner.inactivity_timer.take() {
        timer.abort();
    }
    let Some(InactivityTimeout::Ms(ms)) = inner.config.inactivity_timeout else {
        return;
    };
    inner.inactivity_epoch += 1;
    let epoch = inner.inactivity_epoch;
    let self_tx = self_tx.clone();
    inner.inactivity_timer = Some(tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        let _ = self_tx.send(Command::InactivityFired { epoch }).await;
    }));
}

async fn fire_inactivity_shutdown(inner: &Inner) {
    let mut details = HashMap::new();
    details.insert("agent_id".to_string(), Value::String(inner.agent_id.clone()));
    inner.events.publish(Event::AgentShutdown {
        reason: "inactivity".to_string(),
        details,
    });

    let Some(signal) = inner.supervisor_signal.clone() else {
        return;
    };
    let agent_id = inner.agent_id.clone();
    let shutdown_delay_ms = inner.config.shutdown_delay_ms;
    tokio::spawn(async move {
        if shutdown_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(shutdown_delay_ms)).await;
        }
        let _ = signal
            .send(SupervisorSignal::StopSubtree {
                agent_id,
                reason: "inactivity".to_string(),
            })
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::agent::{Agent, AgentConfig};
    use crate::llm::{LlmRequest, LlmResponse, LlmTransport, ModelHandle, MockLlm};
    use crate::schemas::Message;
    use crate::vfs;

    struct NeverRespondingLlm;

    #[async_trait]
    impl LlmTransport for NeverRespondingLlm {
        async fn call(&self, _request: LlmRequest, _callbacks: &LlmCallbacks) -> Result<LlmResponse, crate::error::LlmError> {
            std::future::pending::<()>().await;
            unreachable!("cancelled before this resolves")
        }
    }

    fn spawn_test_agent(responses: Vec<Message>) -> (ServerHandle, JoinHandle<()>) {
        let model = MockLlm::handle("mock", responses);
        let agent = Agent::new(AgentConfig::new(model)).unwrap();
        let (vfs, _vfs_join) = vfs::spawn(agent.id.clone());
        spawn(agent, vfs, State::new(), AgentServerConfig::default(), None)
    }

    #[tokio::test]
    async fn s1_simple_turn_reaches_idle_with_the_assistant_reply() {
        let (server, _join) = spawn_test_agent(vec![Message::assistant("Hi")]);
        let mut events = server.subscribe();

        server.execute(Some("Hello".into())).await.unwrap();

        let mut saw_running = false;
        let mut saw_idle = false;
        for _ in 0..6 {
            match events.recv().await.unwrap() {
                Event::StatusChanged { status: AgentStatus::Running, .. } => saw_running = true,
                Event::StatusChanged { status: AgentStatus::Idle, .. } => {
                    saw_idle = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_running && saw_idle);

        let state = server.get_state().await.unwrap();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].content.as_text(), "Hello");
        assert_eq!(state.messages[1].content.as_text(), "Hi");
        assert_eq!(server.get_status().await.unwrap(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn execute_rejects_when_not_idle() {
        let (server, _join) = spawn_test_agent(vec![Message::assistant("ok")]);
        server.execute(None).await.unwrap();
        let err = server.execute(None).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidPrecondition { operation: "execute", .. }));
    }

    #[tokio::test]
    async fn s5_cancel_mid_turn_moves_to_cancelled_then_add_message_returns_to_idle() {
        let model = ModelHandle::new("slow", Arc::new(NeverRespondingLlm));
        let agent = Agent::new(AgentConfig::new(model)).unwrap();
        let (vfs, _vfs_join) = vfs::spawn(agent.id.clone());
        let (server, _join) = spawn(agent, vfs, State::new(), AgentServerConfig::default(), None);

        server.execute(Some("hello".into())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        server.cancel().await.unwrap();
        assert_eq!(server.get_status().await.unwrap(), AgentStatus::Cancelled);

        server.add_message(Message::user("next").unwrap()).await.unwrap();
        assert_eq!(server.get_status().await.unwrap(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn reset_clears_messages_and_todos_but_not_metadata() {
        let (server, _join) = spawn_test_agent(vec![]);
        server.add_message(Message::user("hi").unwrap()).await.unwrap();
        server.reset().await.unwrap();
        let state = server.get_state().await.unwrap();
        assert!(state.messages.is_empty());
    }

    #[tokio::test]
    async fn export_then_restore_round_trips_messages() {
        let (server, _join) = spawn_test_agent(vec![]);
        server.add_message(Message::user("remember me").unwrap()).await.unwrap();
        let exported = server.export_state().await.unwrap();

        let (server2, _join2) = spawn_test_agent(vec![]);
        server2.restore_state(exported).await.unwrap();
        let state = server2.get_state().await.unwrap();
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].content.as_text(), "remember me");
    }
}
