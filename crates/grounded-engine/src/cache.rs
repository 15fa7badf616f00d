use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use grounded_core::agent::{AgentDefinition, AgentHandle, AgentService};
use grounded_core::errors::GatewayError;

struct Entry {
    handle: AgentHandle,
    created: Instant,
}

/// Created agents keyed by their definition's stable key.
///
/// Owned by whoever builds the orchestrator and shared across exchanges.
/// Eviction only costs latency: a missing entry means the agent is created
/// again.
pub struct AgentCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    capacity: usize,
}

impl AgentCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<AgentHandle> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.created.elapsed() < self.ttl => {
                return Some(entry.handle.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
            debug!(key, "cached agent expired");
        }
        None
    }

    pub fn insert(&self, handle: AgentHandle) {
        if !self.entries.contains_key(&handle.key) {
            self.make_room();
        }
        self.entries.insert(
            handle.key.clone(),
            Entry {
                handle,
                created: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached handle for `definition`, creating the agent on a miss.
    pub async fn get_or_create(
        &self,
        definition: &AgentDefinition,
        service: &dyn AgentService,
    ) -> Result<AgentHandle, GatewayError> {
        if let Some(handle) = self.get(&definition.key) {
            return Ok(handle);
        }
        let handle = service.create_agent(definition).await?;
        debug!(key = %definition.key, agent_id = %handle.id, "created agent");
        self.insert(handle.clone());
        Ok(handle)
    }

    /// Drop expired entries, then the oldest ones until one slot is free.
    fn make_room(&self) {
        self.entries.retain(|_, e| e.created.elapsed() < self.ttl);
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.created)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grounded_core::ids::AgentId;
    use grounded_llm::MockAgentService;

    fn handle(key: &str) -> AgentHandle {
        AgentHandle {
            id: AgentId::from_raw(format!("asst_{key}")),
            key: key.into(),
        }
    }

    fn definition(key: &str) -> AgentDefinition {
        AgentDefinition {
            key: key.into(),
            name: "rag".into(),
            model: "gpt-4o".into(),
            instructions: "cite sources".into(),
            tools: vec![],
            hosted_tools: vec![],
        }
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        tokio::time::pause();
        let cache = AgentCache::new(Duration::from_secs(60), 8);
        cache.insert(handle("a"));
        assert!(cache.get("a").is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        tokio::time::pause();
        let cache = AgentCache::new(Duration::from_secs(600), 2);
        cache.insert(handle("a"));
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert(handle("b"));
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert(handle("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test]
    async fn get_or_create_reuses_agents() {
        let cache = AgentCache::new(Duration::from_secs(600), 4);
        let service = MockAgentService::new(vec![]);
        let first = cache.get_or_create(&definition("rag"), &service).await.unwrap();
        let second = cache.get_or_create(&definition("rag"), &service).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.agents_created(), 1);

        assert!(cache.invalidate("rag"));
        cache.get_or_create(&definition("rag"), &service).await.unwrap();
        assert_eq!(service.agents_created(), 2);
    }
}
