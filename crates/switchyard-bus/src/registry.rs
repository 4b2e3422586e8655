use crate::agent::Agent;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use switchyard_core::{SwitchyardError, SwitchyardResult};

/// Subscribing to this message type receives every message.
pub const ALL_TYPES: &str = "*";

/// Registered agents and their message-type subscriptions.
///
/// Agents and subscriptions are guarded by separate locks.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    subscriptions: RwLock<HashMap<String, Vec<String>>>,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Add an agent. Duplicate or empty ids are rejected.
    pub fn register(&self, agent: Arc<dyn Agent>) -> SwitchyardResult<()> {
        let id = agent.id().to_string();
        if id.is_empty() {
            return Err(SwitchyardError::Registration(
                "agent id must not be empty".into(),
            ));
        }
        let mut agents = self.agents.write();
        if agents.contains_key(&id) {
            return Err(SwitchyardError::Registration(format!(
                "agent '{id}' is already registered"
            )));
        }
        agents.insert(id, agent);
        Ok(())
    }

    /// Remove an agent and its subscription list.
    pub fn unregister(&self, agent_id: &str) -> SwitchyardResult<Arc<dyn Agent>> {
        let removed = self.agents.write().remove(agent_id).ok_or_else(|| {
            SwitchyardError::Registration(format!("agent '{agent_id}' is not registered"))
        })?;
        self.subscriptions.write().remove(agent_id);
        Ok(removed)
    }

    /// Look up an agent.
    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(agent_id).cloned()
    }

    /// Whether `agent_id` is registered.
    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every registered agent, ordered by id.
    pub fn agents(&self) -> Vec<Arc<dyn Agent>> {
        let agents = self.agents.read();
        let mut all: Vec<Arc<dyn Agent>> = agents.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Replace the subscription list of `agent_id`. An empty list means the
    /// agent receives every broadcast.
    pub fn subscribe(&self, agent_id: &str, message_types: Vec<String>) -> SwitchyardResult<()> {
        if !self.contains(agent_id) {
            return Err(SwitchyardError::Registration(format!(
                "agent '{agent_id}' is not registered"
            )));
        }
        self.subscriptions
            .write()
            .insert(agent_id.to_string(), message_types);
        Ok(())
    }

    /// Whether a broadcast of `message_type` should reach `agent_id`.
    pub fn accepts(&self, agent_id: &str, message_type: &str) -> bool {
        match self.subscriptions.read().get(agent_id) {
            None => true,
            Some(types) if types.is_empty() => true,
            Some(types) => types.iter().any(|t| t == ALL_TYPES || t == message_type),
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::message::Message;
    use async_trait::async_trait;
    use switchyard_events::AgentStatus;

    struct Stub(&'static str);

    #[async_trait]
    impl Agent for Stub {
        fn id(&self) -> &str {
            self.0
        }
        fn kind(&self) -> &str {
            "stub"
        }
        async fn handle_message(&self, _message: &Message) -> SwitchyardResult<()> {
            Ok(())
        }
        fn state(&self) -> AgentStatus {
            AgentStatus::Idle
        }
        fn set_state(&self, _status: AgentStatus) {}
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(Stub("a"))).unwrap();
        let err = registry.register(Arc::new(Stub("a"))).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_empty_id() {
        let registry = AgentRegistry::new();
        assert!(registry.register(Arc::new(Stub(""))).is_err());
    }

    #[test]
    fn test_subscription_matching() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(Stub("a"))).unwrap();
        registry.register(Arc::new(Stub("b"))).unwrap();
        registry.register(Arc::new(Stub("c"))).unwrap();

        registry.subscribe("a", vec!["task".into()]).unwrap();
        registry.subscribe("b", vec![ALL_TYPES.into()]).unwrap();
        registry.subscribe("c", vec![]).unwrap();

        assert!(registry.accepts("a", "task"));
        assert!(!registry.accepts("a", "notice"));
        assert!(registry.accepts("b", "notice"));
        assert!(registry.accepts("c", "notice"));
    }

    #[test]
    fn test_subscribe_unknown_agent() {
        let registry = AgentRegistry::new();
        assert!(matches!(
            registry.subscribe("ghost", vec![]),
            Err(SwitchyardError::Registration(_))
        ));
    }

    #[test]
    fn test_unregister_clears_subscriptions() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(Stub("a"))).unwrap();
        registry.subscribe("a", vec!["task".into()]).unwrap();
        registry.unregister("a").unwrap();
        assert!(!registry.contains("a"));
        assert!(registry.unregister("a").is_err());
        registry.register(Arc::new(Stub("a"))).unwrap();
        assert!(registry.accepts("a", "notice"));
    }

    #[test]
    fn test_ids_sorted() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(Stub("z"))).unwrap();
        registry.register(Arc::new(Stub("m"))).unwrap();
        assert_eq!(registry.ids(), vec!["m".to_string(), "z".to_string()]);
    }
}
