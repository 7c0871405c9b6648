//! AgentRegistry — spec.md §4.8's directory of running agents.
//!
//! A concurrent id→handle map so any caller can look up, enumerate, or
//! glob-match running `AgentServer`s without going through the supervisor.
//! Grounded in the teacher's registry-less design (the teacher keeps a
//! single in-process `UnifiedAgent` and never indexes many of them), so the
//! shape is instead borrowed from the pack's use of `dashmap::DashMap` for a
//! concurrent id-keyed table and `glob::Pattern` for shell-style matching
//! (already used by `middleware::filesystem`'s `glob` tool), both already
//! dependencies of this crate.

use dashmap::DashMap;
use glob::Pattern;

use crate::server::{AgentInfo, ServerHandle};

/// Registered on `AgentServer` spawn, removed on terminal teardown
/// (spec.md §4.8 "the supervisor registers/deregisters each child server
/// with the registry as it starts and stops").
#[derive(Clone)]
pub struct AgentRegistry {
    agents: DashMap<String, ServerHandle>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self { agents: DashMap::new() }
    }

    pub fn register(&self, handle: ServerHandle) {
        self.agents.insert(handle.agent_id.clone(), handle);
    }

    pub fn deregister(&self, agent_id: &str) -> Option<ServerHandle> {
        self.agents.remove(agent_id).map(|(_, handle)| handle)
    }

    pub fn get(&self, agent_id: &str) -> Option<ServerHandle> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn list_running_agents(&self) -> Vec<String> {
        self.agents.iter().map(|entry| entry.key().clone()).collect()
    }

    /// `None` if the agent is not registered; otherwise the live snapshot
    /// from its own `AgentServer` (spec.md §4.7 `get_info`).
    pub async fn agent_info(&self, agent_id: &str) -> Option<AgentInfo> {
        let handle = self.get(agent_id)?;
        handle.get_info().await.ok()
    }

    /// Shell-glob match over registered ids (e.g. `customer-*`), grounded in
    /// the same `glob::Pattern` the filesystem middleware's `glob` tool uses.
    pub fn list_agents_matching(&self, pattern: &str) -> Result<Vec<String>, glob::PatternError> {
        let compiled = Pattern::new(pattern)?;
        Ok(self
            .agents
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| compiled.matches(id))
            .collect())
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentConfig};
    use crate::llm::MockLlm;
    use crate::server::{self, AgentServerConfig};
    use crate::state::State;
    use crate::vfs;

    async fn register_test_agent(registry: &AgentRegistry, id_suffix: &str) -> String {
        let model = MockLlm::handle("mock", vec![]);
        let mut agent = Agent::new(AgentConfig::new(model)).unwrap();
        agent.id = format!("agent_{id_suffix}");
        let (vfs, _vfs_join) = vfs::spawn(agent.id.clone());
        let agent_id = agent.id.clone();
        let (handle, _join) = server::spawn(agent, vfs, State::new(), AgentServerConfig::default(), None);
        registry.register(handle);
        agent_id
    }

    #[tokio::test]
    async fn register_then_get_round_trips_the_handle() {
        let registry = AgentRegistry::new();
        let id = register_test_agent(&registry, "alpha").await;
        assert!(registry.get(&id).is_some());
        assert_eq!(registry.agent_count(), 1);
    }

    #[tokio::test]
    async fn deregister_removes_the_entry() {
        let registry = AgentRegistry::new();
        let id = register_test_agent(&registry, "bravo").await;
        assert!(registry.deregister(&id).is_some());
        assert!(registry.get(&id).is_none());
        assert_eq!(registry.agent_count(), 0);
    }

    #[tokio::test]
    async fn list_agents_matching_applies_glob_semantics() {
        let registry = AgentRegistry::new();
        register_test_agent(&registry, "customer-1").await;
        register_test_agent(&registry, "customer-2").await;
        register_test_agent(&registry, "internal-1").await;

        let mut matched = registry.list_agents_matching("agent_customer-*").unwrap();
        matched.sort();
        assert_eq!(matched, vec!["agent_customer-1".to_string(), "agent_customer-2".to_string()]);
    }

    #[tokio::test]
    async fn agent_info_reflects_live_state() {
        let registry = AgentRegistry::new();
        let id = register_test_agent(&registry, "charlie").await;
        let info = registry.agent_info(&id).await.unwrap();
        assert_eq!(info.agent_id, id);
        assert_eq!(info.message_count, 0);
    }
}
