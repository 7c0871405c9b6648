//! AgentSupervisor — spec.md §4.8.
//!
//! A per-agent supervisor that starts three children in order (leaves
//! first: VFS → AgentServer → SubAgentsDynamicSupervisor) and restarts them
//! with a `rest_for_one` strategy: crashing child N restarts N and all
//! subsequent children, but not earlier ones. Grounded in spec.md §9's
//! re-architecture guidance ("implement the rest_for_one policy explicitly
//! with a small supervisor value that owns its children's cancellation
//! handles and restarts them in order") — there is no supervision-tree
//! primitive in the teacher crate to borrow from, so this module is
//! authored directly against that guidance, reusing the same
//! tokio-task-plus-`JoinHandle` shape as `crate::vfs`/`crate::server`.
//!
//! Consequence (spec.md §4.8): if the `AgentServer` crashes, the VFS (and
//! all its in-memory + pending-persist state) survives — only the server
//! and the sub-agent supervisor restart. If the VFS crashes, the whole
//! subtree restarts, because the server and sub-agent supervisor are
//! "later" in the start order and depend on a live VFS handle.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::middleware::subagent::{ParkedSubAgents, SubAgentMiddleware};
use crate::registry::AgentRegistry;
use crate::server::{self, AgentServerConfig, ServerHandle, SupervisorSignal};
use crate::state::State;
use crate::vfs::{self, VfsHandle};

/// Looks up the active `SubAgentMiddleware`'s parked-sub-agent registry, if
/// one is configured, by downcasting the `dyn Middleware` trait object
/// (spec.md §4.6/§4.8: the dynamic supervisor child inspects this registry
/// without owning the sub-agent processes themselves).
fn subagent_registry(agent: &Agent) -> Option<ParkedSubAgents> {
    agent
        .middleware
        .iter()
        .find_map(|entry| entry.implementation.as_any().downcast_ref::<SubAgentMiddleware>())
        .map(|m| m.parked())
}

/// Handle to the third supervised child: a lightweight periodic task over
/// the parked-sub-agent registry (spec.md §4.8 start order VFS →
/// AgentServer → SubAgentsDynamicSupervisor).
struct SubAgentSupervisorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

fn spawn_subagent_supervisor(agent_id: String, parked: Option<ParkedSubAgents>) -> SubAgentSupervisorHandle {
    let cancel = CancellationToken::new();
    let join = tokio::spawn(crate::subagent::run_dynamic_supervisor(agent_id, parked, cancel.clone()));
    SubAgentSupervisorHandle { cancel, join }
}

/// A fresh `Agent`/`State` pair to rebuild the subtree with after a crash.
/// The application layer supplies this — the supervisor itself has no
/// opinion on where a restarted agent's initial state comes from (spec.md
/// §4.8: "the AgentServer restarts with a fresh State unless state
/// restoration is wired in by the application layer").
pub trait AgentFactory: Send + Sync {
    fn build(&self) -> (Agent, State);
}

impl<F> AgentFactory for F
where
    F: Fn() -> (Agent, State) + Send + Sync,
{
    fn build(&self) -> (Agent, State) {
        self()
    }
}

struct Children {
    vfs: VfsHandle,
    vfs_join: JoinHandle<()>,
    server: ServerHandle,
    server_join: JoinHandle<()>,
    subagent_supervisor: SubAgentSupervisorHandle,
}

/// Owns one agent's full process tree and restarts it on crash.
pub struct AgentSupervisor {
    agent_id: String,
    factory: Arc<dyn AgentFactory>,
    server_config: AgentServerConfig,
    registry: Option<AgentRegistry>,
    children: Mutex<Children>,
    signal_rx: Mutex<mpsc::Receiver<SupervisorSignal>>,
}

impl AgentSupervisor {
    /// Starts the subtree in dependency order: VFS, then AgentServer (wired
    /// with a channel back to this supervisor for inactivity shutdown
    /// signals), then the (currently call-scoped) sub-agent supervisor slot.
    pub async fn start(
        factory: Arc<dyn AgentFactory>,
        server_config: AgentServerConfig,
        registry: Option<AgentRegistry>,
    ) -> Arc<Self> {
        let (agent, state) = factory.build();
        let agent_id = agent.id.clone();
        let parked = subagent_registry(&agent);
        let (signal_tx, signal_rx) = mpsc::channel(8);

        let (vfs, vfs_join) = vfs::spawn(agent_id.clone());
        let (server, server_join) = server::spawn(agent, vfs.clone(), state, server_config.clone(), Some(signal_tx));
        let subagent_supervisor = spawn_subagent_supervisor(agent_id.clone(), parked);

        if let Some(registry) = &registry {
            registry.register(server.clone());
        }

        let supervisor = Arc::new(Self {
            agent_id,
            factory,
            server_config,
            registry,
            children: Mutex::new(Children {
                vfs,
                vfs_join,
                server,
                server_join,
                subagent_supervisor,
            }),
            signal_rx: Mutex::new(signal_rx),
        });

        let watcher = supervisor.clone();
        tokio::spawn(async move { watcher.watch().await });

        supervisor
    }

    pub async fn server_handle(&self) -> ServerHandle {
        self.children.lock().await.server.clone()
    }

    pub async fn vfs_handle(&self) -> VfsHandle {
        self.children.lock().await.vfs.clone()
    }

    /// Watches for a crashed `AgentServer`/`VFS` task or an inactivity
    /// `SupervisorSignal::StopSubtree` request, and restarts the affected
    /// child plus everything after it in the start order (rest_for_one).
    async fn watch(self: Arc<Self>) {
        loop {
            let outcome = {
                let mut children = self.children.lock().await;
                let mut signal_rx = self.signal_rx.lock().await;
                tokio::select! {
                    biased;
                    signal = signal_rx.recv() => Outcome::Signal(signal),
                    _ = &mut children.vfs_join => Outcome::VfsCrashed,
                    _ = &mut children.server_join => Outcome::ServerCrashed,
                }
            };

            match outcome {
                Outcome::Signal(Some(SupervisorSignal::StopSubtree { agent_id, reason })) => {
                    log::info!("agent '{agent_id}' subtree stopping ({reason})");
                    self.teardown().await;
                    return;
                }
                Outcome::Signal(None) => {
                    // server task is gone without ever sending a signal; treat like a crash.
                    self.restart_from_server().await;
                }
                Outcome::VfsCrashed => {
                    log::warn!("agent '{}' VFS process crashed; restarting the whole subtree", self.agent_id);
                    self.restart_from_vfs().await;
                }
                Outcome::ServerCrashed => {
                    log::warn!("agent '{}' AgentServer crashed; restarting it (VFS survives)", self.agent_id);
                    self.restart_from_server().await;
                }
            }
        }
    }

    /// rest_for_one from the VFS down: VFS, AgentServer, and the sub-agent
    /// supervisor slot all restart, since both later children depend on a
    /// live VFS handle.
    async fn restart_from_vfs(&self) {
        let (agent, state) = self.factory.build();
        let agent_id = agent.id.clone();
        let parked = subagent_registry(&agent);
        let (vfs, vfs_join) = vfs::spawn(agent_id.clone());
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (server, server_join) = server::spawn(agent, vfs.clone(), state, self.server_config.clone(), Some(signal_tx));
        let subagent_supervisor = spawn_subagent_supervisor(agent_id.clone(), parked);

        if let Some(registry) = &self.registry {
            registry.deregister(&self.agent_id);
            registry.register(server.clone());
        }

        let mut children = self.children.lock().await;
        children.subagent_supervisor.cancel.cancel();
        *children = Children {
            vfs,
            vfs_join,
            server,
            server_join,
            subagent_supervisor,
        };
        *self.signal_rx.lock().await = signal_rx;
    }

    /// rest_for_one from the AgentServer down: the VFS (earlier in the
    /// start order) is left untouched, so its in-memory and pending-persist
    /// state survives the crash (spec.md §4.8).
    async fn restart_from_server(&self) {
        let mut children = self.children.lock().await;
        let (agent, state) = self.factory.build();
        let parked = subagent_registry(&agent);
        let vfs = children.vfs.clone();
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (server, server_join) = server::spawn(agent, vfs, state, self.server_config.clone(), Some(signal_tx));
        let subagent_supervisor = spawn_subagent_supervisor(self.agent_id.clone(), parked);

        if let Some(registry) = &self.registry {
            registry.deregister(&self.agent_id);
            registry.register(server.clone());
        }

        children.subagent_supervisor.cancel.cancel();
        children.server = server;
        children.server_join = server_join;
        children.subagent_supervisor = subagent_supervisor;
        drop(children);
        *self.signal_rx.lock().await = signal_rx;
    }

    async fn teardown(&self) {
        let children = self.children.lock().await;
        children.subagent_supervisor.cancel.cancel();
        let _ = children.server.shutdown().await;
        let _ = children.vfs.terminate().await;
        if let Some(registry) = &self.registry {
            registry.deregister(&self.agent_id);
        }
    }
}

enum Outcome {
    Signal(Option<SupervisorSignal>),
    VfsCrashed,
    ServerCrashed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::llm::MockLlm;
    use crate::schemas::Message;

    fn test_factory() -> Arc<dyn AgentFactory> {
        Arc::new(|| {
            let model = MockLlm::handle("mock", vec![Message::assistant("hi")]);
            let agent = Agent::new(AgentConfig::new(model)).unwrap();
            (agent, State::new())
        })
    }

    #[tokio::test]
    async fn starts_vfs_then_server_and_registers_the_handle() {
        let registry = AgentRegistry::new();
        let supervisor = AgentSupervisor::start(test_factory(), AgentServerConfig::default(), Some(registry.clone())).await;

        let server = supervisor.server_handle().await;
        assert_eq!(registry.agent_count(), 1);
        assert!(registry.get(&server.agent_id).is_some());
    }

    #[tokio::test]
    async fn server_handle_survives_a_forced_restart_and_vfs_state_is_preserved() {
        let registry = AgentRegistry::new();
        let supervisor = AgentSupervisor::start(test_factory(), AgentServerConfig::default(), Some(registry.clone())).await;

        let vfs = supervisor.vfs_handle().await;
        vfs.write("/scratch.txt", "still here").await.unwrap();

        supervisor.restart_from_server().await;

        let vfs_after = supervisor.vfs_handle().await;
        assert_eq!(vfs_after.read("/scratch.txt").await.unwrap(), "still here");

        let new_server = supervisor.server_handle().await;
        assert_eq!(registry.agent_count(), 1);
        assert!(registry.get(&new_server.agent_id).is_some());
    }

    #[tokio::test]
    async fn restart_from_vfs_rebuilds_the_entire_subtree() {
        let registry = AgentRegistry::new();
        let supervisor = AgentSupervisor::start(test_factory(), AgentServerConfig::default(), Some(registry.clone())).await;

        let vfs = supervisor.vfs_handle().await;
        vfs.write("/scratch.txt", "will be lost").await.unwrap();

        supervisor.restart_from_vfs().await;

        let vfs_after = supervisor.vfs_handle().await;
        assert!(vfs_after.read("/scratch.txt").await.is_err());
    }
}
