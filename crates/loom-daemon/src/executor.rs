//! Per-project task execution: the watcher/worker task fabric that drains
//! the ready-set.
//!
//! Each project gets exactly one watcher task (idempotent start) plus up to
//! `num_workers` worker tasks. Workers claim beads, run the action loop on
//! an ephemeral worker bound to the first healthy provider, and disposition
//! the bead from the loop's terminal reason. Stale `in_progress` claims
//! left behind by dead executors are reclaimed on the way.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use loom_core::beads::{BeadManager, ListFilter};
use loom_core::config::Config;
use loom_core::git::GitGateway;
use loom_core::persist::Persistence;
use loom_core::shutdown::ShutdownSignal;
use loom_core::types::{Agent, Bead, BeadStatus, BeadType, Task};
use loom_agents::worker::{LoopConfig, LoopResult, TerminalReason, Worker};
use loom_providers::registry::ProviderRegistry;

// ---------------------------------------------------------------------------
// ProjectState
// ---------------------------------------------------------------------------

struct ProjectState {
    active_workers: AtomicUsize,
    watcher_running: AtomicBool,
    /// Single-slot wake mailbox; sends coalesce while the watcher is busy.
    wake_tx: mpsc::Sender<()>,
    wake_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl ProjectState {
    fn new() -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            active_workers: AtomicUsize::new(0),
            watcher_running: AtomicBool::new(false),
            wake_tx,
            wake_rx: std::sync::Mutex::new(Some(wake_rx)),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

pub struct TaskExecutor {
    beads: Arc<BeadManager>,
    registry: Arc<ProviderRegistry>,
    git: Arc<GitGateway>,
    store: Arc<dyn Persistence>,
    shutdown: ShutdownSignal,
    config: Config,
    projects: DashMap<String, Arc<ProjectState>>,
    worker_seq: AtomicU64,
}

impl TaskExecutor {
    pub fn new(
        beads: Arc<BeadManager>,
        registry: Arc<ProviderRegistry>,
        git: Arc<GitGateway>,
        store: Arc<dyn Persistence>,
        shutdown: ShutdownSignal,
        config: Config,
    ) -> Self {
        Self {
            beads,
            registry,
            git,
            store,
            shutdown,
            config,
            projects: DashMap::new(),
            worker_seq: AtomicU64::new(0),
        }
    }

    /// Idempotently ensure the project's watcher is running and the worker
    /// deficit is filled. Safe to call repeatedly.
    pub fn start(self: &Arc<Self>, project_id: &str) {
        let state = self
            .projects
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(ProjectState::new()))
            .clone();

        if !state.watcher_running.swap(true, Ordering::SeqCst) {
            let rx = state
                .wake_rx
                .lock()
                .expect("wake lock poisoned")
                .take()
                .expect("watcher receiver already taken");
            let this = Arc::clone(self);
            let project = project_id.to_string();
            let watcher_state = Arc::clone(&state);
            tokio::spawn(async move {
                this.watcher_loop(project, watcher_state, rx).await;
            });
            info!(project_id = %project_id, "watcher started");
        }

        self.ensure_workers(project_id, &state);
    }

    /// Non-blocking wake; multiple wakes coalesce into one.
    pub fn wake_project(&self, project_id: &str) {
        if let Some(state) = self.projects.get(project_id) {
            let _ = state.wake_tx.try_send(());
        }
    }

    pub fn active_workers(&self, project_id: &str) -> usize {
        self.projects
            .get(project_id)
            .map(|s| s.active_workers.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Watcher
    // -----------------------------------------------------------------------

    async fn watcher_loop(
        self: Arc<Self>,
        project_id: String,
        state: Arc<ProjectState>,
        mut wake_rx: mpsc::Receiver<()>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.executor.watcher_tick_secs));
        let mut git_tick =
            tokio::time::interval(Duration::from_secs(self.config.executor.git_fetch_secs));
        // The first interval tick fires immediately; consume both.
        tick.tick().await;
        git_tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = wake_rx.recv() => {
                    self.ensure_workers(&project_id, &state);
                }
                _ = tick.tick() => {
                    self.ensure_workers(&project_id, &state);
                }
                _ = git_tick.tick() => {
                    match self.git.sync_beads_worktree(&project_id).await {
                        Ok(true) => {
                            info!(project_id = %project_id, "remote bead corpus changed, reloading");
                            if let Err(e) = self.beads.load_project(&project_id) {
                                warn!(project_id = %project_id, error = %e, "bead reload failed");
                            }
                            self.ensure_workers(&project_id, &state);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            debug!(project_id = %project_id, error = %e, "beads worktree sync skipped");
                        }
                    }
                }
            }
        }
        state.watcher_running.store(false, Ordering::SeqCst);
        info!(project_id = %project_id, "watcher stopped");
    }

    /// Spawn worker tasks up to the configured ceiling when there is ready
    /// work.
    fn ensure_workers(self: &Arc<Self>, project_id: &str, state: &Arc<ProjectState>) {
        if self.shutdown.is_shutting_down() {
            return;
        }
        let ready = self.beads.ready(project_id).len();
        if ready == 0 {
            return;
        }
        loop {
            let active = state.active_workers.load(Ordering::SeqCst);
            if active >= self.config.executor.num_workers {
                break;
            }
            if state
                .active_workers
                .compare_exchange(active, active + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            let seq = self.worker_seq.fetch_add(1, Ordering::SeqCst);
            let worker_id = format!("exec-{project_id}-{seq}");
            let this = Arc::clone(self);
            let project = project_id.to_string();
            let state = Arc::clone(state);
            debug!(project_id = %project, worker_id = %worker_id, "spawning worker task");
            tokio::spawn(async move {
                this.worker_loop(project, state, worker_id).await;
            });
        }
    }

    // -----------------------------------------------------------------------
    // Worker loop
    // -----------------------------------------------------------------------

    async fn worker_loop(self: Arc<Self>, project_id: String, state: Arc<ProjectState>, worker_id: String) {
        // Held for the task's lifetime; dropping it is what lets the
        // daemon's drain wait complete.
        let _guard = self.shutdown.guard();
        let mut idle_rounds = 0u32;
        loop {
            if self.shutdown.is_shutting_down() {
                break;
            }
            match self.claim_next_bead(&project_id, &worker_id) {
                Some(bead) => {
                    idle_rounds = 0;
                    let needs_backoff = self.execute_bead(bead, &worker_id).await;
                    if needs_backoff {
                        tokio::time::sleep(Duration::from_secs(
                            self.config.executor.provider_error_backoff_secs,
                        ))
                        .await;
                    }
                }
                None => {
                    idle_rounds += 1;
                    if idle_rounds >= self.config.executor.idle_rounds_before_exit {
                        debug!(worker_id = %worker_id, "idle too long, exiting");
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(self.config.executor.idle_sleep_secs))
                        .await;
                }
            }
        }
        state.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Claim the next workable bead. Zombie claims (an `exec-*` assignment
    /// whose bead has not been touched within the threshold) are reset to
    /// open first so they become claimable again. Decision beads are
    /// human-gated and never picked up.
    fn claim_next_bead(&self, project_id: &str, worker_id: &str) -> Option<Bead> {
        let threshold =
            chrono::Duration::minutes(self.config.executor.zombie_bead_threshold_mins);
        let cutoff = chrono::Utc::now() - threshold;

        let in_progress = self.beads.list(&ListFilter {
            project_id: Some(project_id.to_string()),
            status: Some(BeadStatus::InProgress),
            ..Default::default()
        });
        for bead in in_progress {
            if bead.assigned_to.starts_with("exec-") && bead.updated_at < cutoff {
                warn!(
                    bead_id = %bead.id,
                    assigned_to = %bead.assigned_to,
                    "reclaiming zombie bead"
                );
                if let Err(e) = self.beads.release(&bead.id) {
                    warn!(bead_id = %bead.id, error = %e, "zombie release failed");
                }
            }
        }

        for bead in self.beads.ready(project_id) {
            if bead.bead_type == BeadType::Decision {
                continue;
            }
            match self.beads.claim(&bead.id, worker_id) {
                Ok(claimed) => return Some(claimed),
                Err(e) => {
                    debug!(bead_id = %bead.id, error = %e, "claim lost, trying next");
                }
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Bead execution
    // -----------------------------------------------------------------------

    /// Run one bead to a terminal state. Returns whether the caller should
    /// back off before the next claim.
    async fn execute_bead(self: &Arc<Self>, bead: Bead, worker_id: &str) -> bool {
        let Some(provider) = self.registry.first_healthy() else {
            warn!(bead_id = %bead.id, "no healthy provider, releasing");
            let _ = self.beads.release(&bead.id);
            return true;
        };

        let mut agent = Agent::new(worker_id, persona_for_tags(&bead.tags), &bead.project_id);
        agent.id = worker_id.to_string();

        let worker = Worker::new(
            agent,
            Arc::clone(&provider),
            Arc::clone(&self.registry),
            Arc::clone(&self.beads),
            Arc::clone(&self.git),
            Arc::clone(&self.store),
            self.shutdown.clone(),
            self.config.providers.default_context_window,
        );

        let task = self.build_task(&bead);
        let beads_for_progress = Arc::clone(&self.beads);
        let bead_id_for_progress = bead.id.clone();
        let loop_config = LoopConfig {
            max_iterations: self.config.executor.max_iterations,
            text_mode: !is_frontier_model(&provider.config().model),
            on_progress: Some(Arc::new(move |_iteration| {
                let _ = beads_for_progress.touch(&bead_id_for_progress);
            })),
        };

        info!(
            bead_id = %bead.id,
            worker_id = %worker_id,
            provider_id = %provider.id(),
            text_mode = loop_config.text_mode,
            "executing bead"
        );

        let handle = tokio::spawn(async move {
            worker.execute_task_with_loop(&task, &loop_config).await
        });

        match handle.await {
            Ok(result) => self.disposition(&bead, result),
            Err(join_err) => {
                // A panic inside the loop must not leak the claim.
                warn!(bead_id = %bead.id, error = %join_err, "worker task died, resetting bead");
                let _ = self.beads.release(&bead.id);
                false
            }
        }
    }

    /// Map a loop result onto the bead's next state.
    fn disposition(&self, bead: &Bead, result: LoopResult) -> bool {
        match result.terminal_reason {
            TerminalReason::Completed => {
                if let Err(e) = self.beads.close(&bead.id) {
                    warn!(bead_id = %bead.id, error = %e, "close after completion failed");
                }
                info!(bead_id = %bead.id, iterations = result.iterations, "bead completed");
                false
            }
            TerminalReason::ContextCanceled => {
                // Cancellation is silent: reset without a history entry.
                let _ = self.beads.release(&bead.id);
                true
            }
            reason => {
                let detail = format!("{}: {}", reason, result.detail);
                let loop_detected = reason == TerminalReason::InnerLoop;
                if let Err(e) = self.beads.note_failure(&bead.id, &detail, loop_detected) {
                    warn!(bead_id = %bead.id, error = %e, "failure bookkeeping failed");
                }
                info!(
                    bead_id = %bead.id,
                    iterations = result.iterations,
                    reason = %reason,
                    "bead reset to open"
                );
                reason == TerminalReason::Error
            }
        }
    }

    /// Assemble the dispatch unit: project preamble, bead context, and the
    /// fixed workflow instructions.
    fn build_task(&self, bead: &Bead) -> Task {
        let mut context = String::new();
        context.push_str(&format!(
            "Project: {}\nWorktree layout: repository root is your working directory.\n",
            bead.project_id
        ));
        context.push_str(&format!(
            "\nBead: {} [{:?}, priority {:?}]\n",
            bead.id, bead.bead_type, bead.priority
        ));
        if !bead.tags.is_empty() {
            context.push_str(&format!("Tags: {}\n", bead.tags.join(", ")));
        }
        for (key, value) in &bead.context {
            context.push_str(&format!("{key}: {value}\n"));
        }
        context.push_str(&format!(
            "\nWorkflow: understand the bead, make the change, build and test, \
commit, then finish with done or close_bead. You have {} iterations.\n",
            self.config.executor.max_iterations
        ));

        let description = if bead.description.is_empty() {
            bead.title.clone()
        } else {
            format!("{}\n\n{}", bead.title, bead.description)
        };
        Task::new(&bead.id, &bead.project_id, description, context)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Persona selection from bead tags.
fn persona_for_tags(tags: &[String]) -> &'static str {
    for tag in tags {
        let tag = tag.to_lowercase();
        match tag.as_str() {
            "devops" | "infra" => return "devops",
            "review" | "pr" => return "review",
            "qa" | "test" => return "qa",
            "docs" => return "docs",
            _ => {}
        }
    }
    "engineering-manager"
}

/// Frontier models get the full multi-action envelope; everything else runs
/// in simple text mode.
fn is_frontier_model(model: &str) -> bool {
    let m = model.to_lowercase();
    ["gpt-4", "gpt-5", "o1", "o3", "claude", "gemini"]
        .iter()
        .any(|marker| m.contains(marker))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
