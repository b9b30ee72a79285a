//! Worker pool: at most one live worker per agent, keyed by agent id.
//!
//! The pool is a pure registry. It builds workers from the shared
//! subsystems, hands out `Arc` handles, and cancels workers on stop. It
//! never calls back into the agent manager, and nothing here holds the
//! pool lock across an await.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use loom_core::beads::BeadManager;
use loom_core::git::GitGateway;
use loom_core::persist::Persistence;
use loom_core::shutdown::ShutdownSignal;
use loom_core::types::Agent;
use loom_providers::registry::{ProviderRegistry, RegisteredProvider};

use crate::worker::Worker;

pub struct WorkerPool {
    workers: RwLock<HashMap<String, Arc<Worker>>>,
    registry: Arc<ProviderRegistry>,
    beads: Arc<BeadManager>,
    git: Arc<GitGateway>,
    store: Arc<dyn Persistence>,
    shutdown: ShutdownSignal,
    default_context_window: usize,
}

impl WorkerPool {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        beads: Arc<BeadManager>,
        git: Arc<GitGateway>,
        store: Arc<dyn Persistence>,
        shutdown: ShutdownSignal,
        default_context_window: usize,
    ) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            registry,
            beads,
            git,
            store,
            shutdown,
            default_context_window,
        }
    }

    /// Build a free-standing worker that is not tracked by the pool. The
    /// executor uses these for its ephemeral per-bead workers.
    pub fn build_ephemeral(&self, agent: Agent, provider: Arc<RegisteredProvider>) -> Worker {
        Worker::new(
            agent,
            provider,
            Arc::clone(&self.registry),
            Arc::clone(&self.beads),
            Arc::clone(&self.git),
            Arc::clone(&self.store),
            self.shutdown.clone(),
            self.default_context_window,
        )
    }

    /// Get-or-create the worker for an agent. An existing worker is reused;
    /// at most one worker per agent ever exists.
    pub fn spawn_worker(&self, agent: &Agent, provider: Arc<RegisteredProvider>) -> Arc<Worker> {
        {
            let workers = self.workers.read().expect("pool lock poisoned");
            if let Some(existing) = workers.get(&agent.id) {
                debug!(agent_id = %agent.id, "reusing pooled worker");
                return Arc::clone(existing);
            }
        }

        let worker = Arc::new(self.build_ephemeral(agent.clone(), provider));
        let mut workers = self.workers.write().expect("pool lock poisoned");
        // A racing spawn may have beaten us; keep the first one.
        let entry = workers
            .entry(agent.id.clone())
            .or_insert_with(|| Arc::clone(&worker));
        info!(agent_id = %agent.id, "worker spawned");
        Arc::clone(entry)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<Worker>> {
        self.workers
            .read()
            .expect("pool lock poisoned")
            .get(agent_id)
            .cloned()
    }

    /// Remove and cancel an agent's worker. Returns `false` when there was
    /// none.
    pub fn stop(&self, agent_id: &str) -> bool {
        let removed = self
            .workers
            .write()
            .expect("pool lock poisoned")
            .remove(agent_id);
        match removed {
            Some(worker) => {
                info!(agent_id = %agent_id, "stopping worker");
                worker.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every pooled worker. In-flight loops unwind as canceled.
    pub fn stop_all(&self) {
        let drained: Vec<Arc<Worker>> = {
            let mut workers = self.workers.write().expect("pool lock poisoned");
            workers.drain().map(|(_, w)| w).collect()
        };
        info!(count = drained.len(), "stopping all workers");
        for worker in drained {
            worker.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.workers.read().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::config::GitConfig;
    use loom_core::persist::MemoryStore;
    use loom_providers::protocol::{MockProtocol, Protocol};
    use loom_providers::registry::{ProviderConfig, ProviderType};
    use std::time::Duration;

    async fn pool_fixture() -> (WorkerPool, Arc<RegisteredProvider>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let registry = Arc::new(ProviderRegistry::new(Duration::from_secs(1)));
        let provider = registry
            .register_with_client(
                ProviderConfig::new("p1", ProviderType::Mock, "http://localhost:0", "m"),
                Arc::new(MockProtocol::new()) as Arc<dyn Protocol>,
            )
            .await
            .expect("register");
        let pool = WorkerPool::new(
            registry,
            Arc::new(BeadManager::new(dir.path())),
            Arc::new(
                GitGateway::new(dir.path(), GitConfig::default())
                    .with_state_base(dir.path().join("state")),
            ),
            Arc::new(MemoryStore::new()),
            ShutdownSignal::new(),
            32768,
        );
        (pool, provider, dir)
    }

    #[tokio::test]
    async fn spawn_is_idempotent_per_agent() {
        let (pool, provider, _dir) = pool_fixture().await;
        let agent = Agent::new("w1", "qa-lead", "proj");

        let first = pool.spawn_worker(&agent, Arc::clone(&provider));
        let second = pool.spawn_worker(&agent, provider);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn stop_cancels_and_removes() {
        let (pool, provider, _dir) = pool_fixture().await;
        let agent = Agent::new("w1", "qa-lead", "proj");
        let worker = pool.spawn_worker(&agent, provider);

        assert!(pool.stop(&agent.id));
        assert!(worker.is_canceled());
        assert!(pool.get(&agent.id).is_none());
        assert!(!pool.stop(&agent.id));
    }

    #[tokio::test]
    async fn stop_all_drains_pool() {
        let (pool, provider, _dir) = pool_fixture().await;
        for i in 0..3 {
            let agent = Agent::new(format!("w{i}"), "engineer", "proj");
            pool.spawn_worker(&agent, Arc::clone(&provider));
        }
        assert_eq!(pool.len(), 3);
        pool.stop_all();
        assert!(pool.is_empty());
    }
}
