//! Per-agent event broadcast — spec.md §6 "Event topics".
//!
//! Two named topics exist per agent (`agent_server:<agent_id>` and
//! `agent_server:debug:<agent_id>`); spec.md §5 requires "events on a given
//! agent's topic are delivered in the order emitted by that agent's
//! process", which `tokio::sync::broadcast` gives for free since every
//! publish happens from inside the single `AgentServer` task. Grounded in
//! the `event_rx: broadcast::Receiver<ProcessEvent>` / `deps.event_tx` wiring
//! of the pack's `spacebot` channel actor (`other_examples` —
//! `the-snesler-spacebot/src/agent/channel.rs`), adapted from one shared bus
//! to one broadcast channel per agent per topic so a crashed/restarted agent
//! gets a fresh topic rather than replaying a stale one.

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::schemas::event::{DebugEvent, Event};

const TOPIC_CAPACITY: usize = 256;

/// A single named broadcast topic. Cloning shares the same underlying
/// channel; each `subscribe()` call joins independently, and dropping the
/// returned receiver is how a subscriber leaves (spec.md §4.7
/// `unsubscribe`: there is no separate revoke call on a broadcast channel,
/// only "stop receiving").
#[derive(Clone)]
pub struct Topic<E: Clone> {
    name: String,
    tx: broadcast::Sender<E>,
}

impl<E: Clone> Topic<E> {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _rx) = broadcast::channel(TOPIC_CAPACITY);
        Self { name: name.into(), tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// A `futures::Stream` view of the same subscription, for callers that
    /// want to `.next().await`/combinator-chain events rather than polling
    /// `broadcast::Receiver::recv` directly (e.g. an outer web layer
    /// forwarding the topic straight into an SSE/websocket response body).
    pub fn stream(&self) -> BroadcastStream<E>
    where
        E: Clone + Send + 'static,
    {
        BroadcastStream::new(self.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publishes to every current subscriber. A send with zero subscribers
    /// is not an error (spec.md never requires a live listener); lagging
    /// subscribers are the caller's problem, same as the teacher's own
    /// broadcast usage.
    pub fn publish(&self, event: E) {
        let _ = self.tx.send(event);
    }
}

pub fn event_topic(agent_id: &str) -> Topic<Event> {
    Topic::new(format!("agent_server:{agent_id}"))
}

pub fn debug_topic(agent_id: &str) -> Topic<DebugEvent> {
    Topic::new(format!("agent_server:debug:{agent_id}"))
}
