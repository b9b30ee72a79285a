//! Daemon assembly: builds the subsystems, loads the bead corpus, starts
//! the per-project executors and the Ralph loop, and coordinates shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use loom_agents::manager::AgentManager;
use loom_agents::pool::WorkerPool;
use loom_core::beads::BeadManager;
use loom_core::config::{expand_tilde, Config};
use loom_core::git::GitGateway;
use loom_core::lockfile::DaemonLockfile;
use loom_core::persist::{Persistence, SqliteStore};
use loom_core::shutdown::ShutdownSignal;
use loom_providers::registry::ProviderRegistry;

use crate::executor::TaskExecutor;
use crate::ralph::RalphLoop;

const STATUS_LOG_SECS: u64 = 60;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Daemon {
    config: Config,
    beads: Arc<BeadManager>,
    registry: Arc<ProviderRegistry>,
    pool: Arc<WorkerPool>,
    pub agents: Arc<AgentManager>,
    executor: Arc<TaskExecutor>,
    ralph: Arc<RalphLoop>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let workspace = expand_tilde(&config.general.workspace_dir);
        let shutdown = ShutdownSignal::new();

        let beads = Arc::new(BeadManager::new(&workspace));
        let git = Arc::new(GitGateway::new(&workspace, config.git.clone()));
        let registry = Arc::new(ProviderRegistry::new(Duration::from_secs(
            config.providers.health_check_timeout_secs,
        )));

        let db_path = expand_tilde(&config.persistence.path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store: Arc<dyn Persistence> = Arc::new(
            SqliteStore::new(&db_path)
                .await
                .with_context(|| format!("opening {}", db_path.display()))?,
        );

        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&registry),
            Arc::clone(&beads),
            Arc::clone(&git),
            Arc::clone(&store),
            shutdown.clone(),
            config.providers.default_context_window,
        ));
        let agents = Arc::new(AgentManager::new(Arc::clone(&pool), Arc::clone(&store)));

        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&beads),
            Arc::clone(&registry),
            Arc::clone(&git),
            Arc::clone(&store),
            shutdown.clone(),
            config.clone(),
        ));
        let ralph = Arc::new(RalphLoop::new(
            Arc::clone(&beads),
            Arc::clone(&agents),
            config.ralph.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            beads,
            registry,
            pool,
            agents,
            executor,
            ralph,
            shutdown,
        })
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&self) -> anyhow::Result<()> {
        let lock_path = DaemonLockfile::default_path();
        let lock = DaemonLockfile::new(self.config.general.workspace_dir.clone());
        lock.acquire_or_fail(&lock_path)
            .map_err(|e| anyhow::anyhow!(e))?;

        let projects = self.beads.load_all().context("loading bead corpus")?;
        info!(projects = projects.len(), "daemon starting");
        for project in &projects {
            self.executor.start(project);
        }

        tokio::spawn(Arc::clone(&self.ralph).run());

        let mut status_tick = tokio::time::interval(Duration::from_secs(STATUS_LOG_SECS));
        status_tick.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = status_tick.tick() => {
                    for project in &projects {
                        let stats = self.beads.stats(project);
                        info!(
                            project_id = %project,
                            open = stats.open,
                            in_progress = stats.in_progress,
                            blocked = stats.blocked,
                            closed = stats.closed,
                            ready = stats.ready,
                            workers = self.executor.active_workers(project),
                            "status"
                        );
                    }
                }
            }
        }

        info!(active = self.shutdown.active_workers(), "draining workers");
        self.pool.stop_all();
        if !self.shutdown.wait_idle(DRAIN_TIMEOUT).await {
            warn!(
                remaining = self.shutdown.active_workers(),
                "drain timed out, exiting anyway"
            );
        }
        DaemonLockfile::remove_at(&lock_path);
        info!("daemon stopped");
        Ok(())
    }
}
