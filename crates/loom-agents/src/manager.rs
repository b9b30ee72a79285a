//! Agent manager: the metadata map for persona-bound agent identities.
//!
//! The manager owns the agent map and nothing else. It deliberately drops
//! its lock before calling into the worker pool so the two subsystems never
//! hold locks simultaneously.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};
use tracing::{info, warn};

use loom_core::persist::Persistence;
use loom_core::types::{Agent, AgentStatus};
use loom_providers::registry::RegisteredProvider;

use crate::pool::WorkerPool;
use crate::worker::Worker;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// AgentManager
// ---------------------------------------------------------------------------

pub struct AgentManager {
    agents: RwLock<HashMap<String, Agent>>,
    pool: Arc<WorkerPool>,
    store: Arc<dyn Persistence>,
}

impl AgentManager {
    pub fn new(pool: Arc<WorkerPool>, store: Arc<dyn Persistence>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            pool,
            store,
        }
    }

    /// Create an agent. Without a provider it starts paused.
    pub async fn register(
        &self,
        name: impl Into<String>,
        persona: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Agent {
        let agent = Agent::new(name, persona, project_id);
        self.agents
            .write()
            .expect("agent lock poisoned")
            .insert(agent.id.clone(), agent.clone());
        info!(agent_id = %agent.id, role = ?agent.role, "agent registered");
        self.persist(&agent).await;
        agent
    }

    pub fn get(&self, agent_id: &str) -> Result<Agent> {
        self.agents
            .read()
            .expect("agent lock poisoned")
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))
    }

    pub fn list(&self, project_id: Option<&str>) -> Vec<Agent> {
        let agents = self.agents.read().expect("agent lock poisoned");
        let mut out: Vec<Agent> = agents
            .values()
            .filter(|a| project_id.is_none_or(|p| a.project_id == p))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Attach a provider: the agent becomes idle and gets a pooled worker.
    /// The agent lock is released before the pool is touched.
    pub async fn attach_provider(
        &self,
        agent_id: &str,
        provider: Arc<RegisteredProvider>,
    ) -> Result<Arc<Worker>> {
        let agent = {
            let mut agents = self.agents.write().expect("agent lock poisoned");
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?;
            agent.provider_id = Some(provider.id());
            agent.status = AgentStatus::Idle;
            agent.touch();
            agent.clone()
        };

        let worker = self.pool.spawn_worker(&agent, provider);
        self.persist(&agent).await;
        Ok(worker)
    }

    /// Revoke the provider: the worker is stopped and the agent pauses.
    pub async fn detach_provider(&self, agent_id: &str) -> Result<()> {
        let agent = {
            let mut agents = self.agents.write().expect("agent lock poisoned");
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?;
            agent.provider_id = None;
            agent.status = AgentStatus::Paused;
            agent.current_bead = None;
            agent.touch();
            agent.clone()
        };

        self.pool.stop(agent_id);
        self.persist(&agent).await;
        Ok(())
    }

    pub async fn mark_working(&self, agent_id: &str, bead_id: &str) -> Result<()> {
        self.transition(agent_id, AgentStatus::Working, Some(bead_id.to_string()))
            .await
    }

    pub async fn mark_idle(&self, agent_id: &str) -> Result<()> {
        self.transition(agent_id, AgentStatus::Idle, None).await
    }

    pub async fn mark_error(&self, agent_id: &str) -> Result<()> {
        self.transition(agent_id, AgentStatus::Error, None).await
    }

    async fn transition(
        &self,
        agent_id: &str,
        status: AgentStatus,
        current_bead: Option<String>,
    ) -> Result<()> {
        let agent = {
            let mut agents = self.agents.write().expect("agent lock poisoned");
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?;
            agent.status = status;
            agent.current_bead = current_bead;
            agent.touch();
            agent.clone()
        };
        self.persist(&agent).await;
        Ok(())
    }

    /// Stamp `last_active` (heartbeat).
    pub fn touch(&self, agent_id: &str) -> Result<()> {
        let mut agents = self.agents.write().expect("agent lock poisoned");
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?;
        agent.touch();
        Ok(())
    }

    /// Force agents stuck in `working` back to idle. Returns the ids reset.
    pub fn reset_stuck(&self, max_working: Duration) -> Vec<String> {
        let cutoff = Utc::now() - max_working;
        let mut reset = Vec::new();
        let mut agents = self.agents.write().expect("agent lock poisoned");
        for agent in agents.values_mut() {
            if agent.status == AgentStatus::Working && agent.last_active < cutoff {
                warn!(
                    agent_id = %agent.id,
                    last_active = %agent.last_active,
                    "resetting stuck agent to idle"
                );
                agent.status = AgentStatus::Idle;
                agent.current_bead = None;
                agent.touch();
                reset.push(agent.id.clone());
            }
        }
        reset
    }

    async fn persist(&self, agent: &Agent) {
        if let Err(e) = self.store.upsert_agent(agent).await {
            warn!(agent_id = %agent.id, error = %e, "agent upsert failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
