//! Ralph, the maintenance loop: a periodic reconciliation sweep that keeps
//! long-running work moving without a human.
//!
//! Every beat Ralph resets agents stuck in `working` and blocks beads whose
//! runs tripped the loop detector, handing them to a triage agent. Every
//! Nth beat it re-opens beads that were blocked for transient provider
//! trouble once they have cooled off. Budget and hard-limit blocks are
//! never auto-recovered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use loom_agents::manager::AgentManager;
use loom_core::beads::{context_keys, BeadManager, BeadUpdate, ListFilter};
use loom_core::config::RalphConfig;
use loom_core::shutdown::ShutdownSignal;
use loom_core::types::{AgentRole, BeadStatus};

/// The blocked-reason prefix Ralph writes for loop-detected beads. Matches
/// the transient patterns so a cooled-off loop bead is eventually retried.
const LOOP_BLOCK_REASON: &str = "Identical error repeated: agent action loop detected";

const TRANSIENT_PATTERNS: &[&str] = &[
    "provider error",
    "provider unavailable",
    "context canceled",
    "rate limit",
    "identical error repeated",
    "overloaded",
    "timed out",
    "connection refused",
];

const AUTH_PATTERNS: &[&str] = &["auth", "unauthorized", "api key", "401", "403"];

const NEVER_RECOVER_PATTERNS: &[&str] = &["budget", "hard limit"];

// ---------------------------------------------------------------------------
// RalphLoop
// ---------------------------------------------------------------------------

pub struct RalphLoop {
    beads: Arc<BeadManager>,
    agents: Arc<AgentManager>,
    config: RalphConfig,
    shutdown: ShutdownSignal,
    beat_count: AtomicU64,
}

impl RalphLoop {
    pub fn new(
        beads: Arc<BeadManager>,
        agents: Arc<AgentManager>,
        config: RalphConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            beads,
            agents,
            config,
            shutdown,
            beat_count: AtomicU64::new(0),
        }
    }

    /// Run until shutdown, one beat per tick.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.tick_secs));
        tick.tick().await;
        info!(tick_secs = self.config.tick_secs, "ralph loop running");
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = tick.tick() => self.beat().await,
            }
        }
        info!("ralph loop stopped");
    }

    /// One maintenance sweep.
    pub async fn beat(&self) {
        let beat = self.beat_count.fetch_add(1, Ordering::SeqCst) + 1;

        let reset = self
            .agents
            .reset_stuck(chrono::Duration::minutes(self.config.max_working_mins));
        if !reset.is_empty() {
            info!(count = reset.len(), "reset stuck agents");
        }

        self.block_looping_beads();

        if beat % self.config.recovery_scan_beats == 0 {
            self.recover_transient_blocked();
        }
    }

    // -----------------------------------------------------------------------
    // Loop-detected beads
    // -----------------------------------------------------------------------

    /// Block any open/in-progress bead flagged by the loop detector and hand
    /// it to a triage agent.
    fn block_looping_beads(&self) {
        let candidates = self.beads.list(&ListFilter::default());
        for bead in candidates {
            if bead.status != BeadStatus::Open && bead.status != BeadStatus::InProgress {
                continue;
            }
            if bead.context.get(context_keys::LOOP_DETECTED).map(String::as_str) != Some("true") {
                continue;
            }

            let triage = self.pick_triage_agent(&bead.project_id);
            let mut context = BTreeMap::new();
            context.insert(
                context_keys::RALPH_BLOCKED_AT.to_string(),
                Utc::now().to_rfc3339(),
            );
            context.insert(
                context_keys::RALPH_BLOCKED_REASON.to_string(),
                LOOP_BLOCK_REASON.to_string(),
            );

            warn!(
                bead_id = %bead.id,
                triage = %triage,
                "blocking bead after loop detection"
            );
            if let Err(e) = self.beads.update(
                &bead.id,
                BeadUpdate {
                    status: Some(BeadStatus::Blocked),
                    assigned_to: Some(triage),
                    context: Some(context),
                    ..Default::default()
                },
            ) {
                warn!(bead_id = %bead.id, error = %e, "loop block failed");
            }
        }
    }

    /// Prefer a CTO, then an engineering manager, then anyone on the
    /// project. Empty when the project has no agents at all.
    fn pick_triage_agent(&self, project_id: &str) -> String {
        let agents = self.agents.list(Some(project_id));
        for wanted in [AgentRole::Cto, AgentRole::EngineeringManager] {
            if let Some(agent) = agents.iter().find(|a| a.role == wanted) {
                return agent.id.clone();
            }
        }
        agents.first().map(|a| a.id.clone()).unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Transient-block recovery
    // -----------------------------------------------------------------------

    /// Re-open blocked beads whose block reason looks transient once the
    /// cool-off has elapsed (longer for auth trouble). Clears the failure
    /// bookkeeping so the bead dispatches with a clean slate.
    pub fn recover_transient_blocked(&self) {
        let blocked = self.beads.list(&ListFilter {
            status: Some(BeadStatus::Blocked),
            ..Default::default()
        });
        let now = Utc::now();

        for bead in blocked {
            let Some(reason) = bead.context.get(context_keys::RALPH_BLOCKED_REASON) else {
                continue;
            };
            let reason_lower = reason.to_lowercase();
            if NEVER_RECOVER_PATTERNS.iter().any(|p| reason_lower.contains(p)) {
                debug!(bead_id = %bead.id, "block is not auto-recoverable");
                continue;
            }
            if !TRANSIENT_PATTERNS.iter().any(|p| reason_lower.contains(p)) {
                continue;
            }

            let Some(blocked_at) = bead
                .context
                .get(context_keys::RALPH_BLOCKED_AT)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|d| d.with_timezone(&Utc))
            else {
                continue;
            };

            let wait_mins = if AUTH_PATTERNS.iter().any(|p| reason_lower.contains(p)) {
                self.config.auth_block_mins
            } else {
                self.config.transient_block_mins
            };
            if now - blocked_at < chrono::Duration::minutes(wait_mins) {
                continue;
            }

            info!(
                bead_id = %bead.id,
                reason = %reason,
                blocked_mins = (now - blocked_at).num_minutes(),
                "auto-recovering transient-blocked bead"
            );
            let mut context = BTreeMap::new();
            context.insert(context_keys::DISPATCH_COUNT.to_string(), "0".to_string());
            context.insert(context_keys::ERROR_HISTORY.to_string(), "[]".to_string());
            context.insert(context_keys::LOOP_DETECTED.to_string(), "false".to_string());
            context.insert(
                context_keys::REDISPATCH_REQUESTED.to_string(),
                "true".to_string(),
            );
            if let Err(e) = self.beads.update(
                &bead.id,
                BeadUpdate {
                    status: Some(BeadStatus::Open),
                    assigned_to: Some(String::new()),
                    context: Some(context),
                    ..Default::default()
                },
            ) {
                warn!(bead_id = %bead.id, error = %e, "auto-recovery failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::config::GitConfig;
    use loom_core::git::GitGateway;
    use loom_core::persist::{MemoryStore, Persistence};
    use loom_core::types::{BeadType, Priority};
    use loom_agents::pool::WorkerPool;
    use loom_providers::registry::ProviderRegistry;

    struct Fixture {
        ralph: RalphLoop,
        beads: Arc<BeadManager>,
        agents: Arc<AgentManager>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("create temp dir");
        let beads = Arc::new(BeadManager::new(dir.path()));
        let store: Arc<dyn Persistence> = Arc::new(MemoryStore::new());
        let pool = Arc::new(WorkerPool::new(
            Arc::new(ProviderRegistry::new(Duration::from_secs(1))),
            Arc::clone(&beads),
            Arc::new(
                GitGateway::new(dir.path(), GitConfig::default())
                    .with_state_base(dir.path().join("state")),
            ),
            Arc::clone(&store),
            ShutdownSignal::new(),
            32768,
        ));
        let agents = Arc::new(AgentManager::new(pool, store));
        let ralph = RalphLoop::new(
            Arc::clone(&beads),
            Arc::clone(&agents),
            RalphConfig::default(),
            ShutdownSignal::new(),
        );
        Fixture {
            ralph,
            beads,
            agents,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn loop_detected_bead_is_blocked_and_assigned_to_triage() {
        let f = fixture();
        let cto = f.agents.register("boss", "cto", "proj").await;
        f.agents.register("dev", "engineer", "proj").await;

        let bead = f
            .beads
            .create("Loopy", "", Priority::P1, BeadType::Task, "proj");
        f.beads
            .note_failure(&bead.id, "inner_loop: read_tree repeated", true)
            .unwrap();

        f.ralph.beat().await;

        let blocked = f.beads.get(&bead.id).unwrap();
        assert_eq!(blocked.status, BeadStatus::Blocked);
        assert_eq!(blocked.assigned_to, cto.id);
        assert!(blocked
            .context
            .get(context_keys::RALPH_BLOCKED_REASON)
            .unwrap()
            .contains("Identical error repeated"));
        assert!(blocked.context.contains_key(context_keys::RALPH_BLOCKED_AT));
    }

    #[tokio::test]
    async fn triage_falls_back_to_manager_then_anyone() {
        let f = fixture();
        let em = f.agents.register("em", "engineering-manager", "proj").await;
        assert_eq!(f.ralph.pick_triage_agent("proj"), em.id);

        let empty = f.ralph.pick_triage_agent("ghost-project");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn transient_block_recovers_after_cooloff() {
        let f = fixture();
        let bead = f
            .beads
            .create("Flaky", "", Priority::P1, BeadType::Task, "proj");

        let mut context = BTreeMap::new();
        context.insert(
            context_keys::RALPH_BLOCKED_REASON.to_string(),
            "provider error: 503 overloaded".to_string(),
        );
        context.insert(
            context_keys::RALPH_BLOCKED_AT.to_string(),
            (Utc::now() - chrono::Duration::minutes(31)).to_rfc3339(),
        );
        context.insert(context_keys::DISPATCH_COUNT.to_string(), "7".to_string());
        f.beads
            .update(
                &bead.id,
                BeadUpdate {
                    status: Some(BeadStatus::Blocked),
                    context: Some(context),
                    ..Default::default()
                },
            )
            .unwrap();

        f.ralph.recover_transient_blocked();

        let recovered = f.beads.get(&bead.id).unwrap();
        assert_eq!(recovered.status, BeadStatus::Open);
        assert!(recovered.assigned_to.is_empty());
        assert_eq!(
            recovered.context.get(context_keys::DISPATCH_COUNT).unwrap(),
            "0"
        );
        assert_eq!(
            recovered
                .context
                .get(context_keys::REDISPATCH_REQUESTED)
                .unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn recent_transient_block_waits() {
        let f = fixture();
        let bead = f
            .beads
            .create("Too soon", "", Priority::P1, BeadType::Task, "proj");
        let mut context = BTreeMap::new();
        context.insert(
            context_keys::RALPH_BLOCKED_REASON.to_string(),
            "rate limit".to_string(),
        );
        context.insert(
            context_keys::RALPH_BLOCKED_AT.to_string(),
            (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339(),
        );
        f.beads
            .update(
                &bead.id,
                BeadUpdate {
                    status: Some(BeadStatus::Blocked),
                    context: Some(context),
                    ..Default::default()
                },
            )
            .unwrap();

        f.ralph.recover_transient_blocked();
        assert_eq!(f.beads.get(&bead.id).unwrap().status, BeadStatus::Blocked);
    }

    #[tokio::test]
    async fn auth_blocks_wait_longer() {
        let f = fixture();
        let bead = f
            .beads
            .create("Bad key", "", Priority::P1, BeadType::Task, "proj");
        let mut context = BTreeMap::new();
        context.insert(
            context_keys::RALPH_BLOCKED_REASON.to_string(),
            "provider error: 401 unauthorized".to_string(),
        );
        context.insert(
            context_keys::RALPH_BLOCKED_AT.to_string(),
            (Utc::now() - chrono::Duration::minutes(90)).to_rfc3339(),
        );
        f.beads
            .update(
                &bead.id,
                BeadUpdate {
                    status: Some(BeadStatus::Blocked),
                    context: Some(context),
                    ..Default::default()
                },
            )
            .unwrap();

        // 90 minutes is past the transient window but inside the auth one.
        f.ralph.recover_transient_blocked();
        assert_eq!(f.beads.get(&bead.id).unwrap().status, BeadStatus::Blocked);
    }

    #[tokio::test]
    async fn budget_blocks_never_recover() {
        let f = fixture();
        let bead = f
            .beads
            .create("Expensive", "", Priority::P1, BeadType::Task, "proj");
        let mut context = BTreeMap::new();
        context.insert(
            context_keys::RALPH_BLOCKED_REASON.to_string(),
            "budget exhausted for provider error retries".to_string(),
        );
        context.insert(
            context_keys::RALPH_BLOCKED_AT.to_string(),
            (Utc::now() - chrono::Duration::hours(48)).to_rfc3339(),
        );
        f.beads
            .update(
                &bead.id,
                BeadUpdate {
                    status: Some(BeadStatus::Blocked),
                    context: Some(context),
                    ..Default::default()
                },
            )
            .unwrap();

        f.ralph.recover_transient_blocked();
        assert_eq!(f.beads.get(&bead.id).unwrap().status, BeadStatus::Blocked);
    }
}
