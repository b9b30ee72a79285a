use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::types::{Bead, BeadStats, BeadStatus, BeadType, Priority};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BeadError {
    #[error("bead not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad argument: {0}")]
    BadArg(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BeadError>;

// ---------------------------------------------------------------------------
// Context keys
// ---------------------------------------------------------------------------

/// Well-known keys in `Bead::context`. The map is otherwise opaque.
pub mod context_keys {
    pub const DISPATCH_COUNT: &str = "dispatch_count";
    pub const ERROR_HISTORY: &str = "error_history";
    pub const LAST_RUN_ERROR: &str = "last_run_error";
    pub const LOOP_DETECTED: &str = "loop_detected";
    pub const RALPH_BLOCKED_AT: &str = "ralph_blocked_at";
    pub const RALPH_BLOCKED_REASON: &str = "ralph_blocked_reason";
    pub const REDISPATCH_REQUESTED: &str = "redispatch_requested";
    pub const ESCALATION_REASON: &str = "escalation_reason";
}

/// Capacity of the rolling `error_history` context entry.
pub const ERROR_HISTORY_CAP: usize = 20;

// ---------------------------------------------------------------------------
// DependencyKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Blocks,
    Parent,
    Related,
}

impl std::str::FromStr for DependencyKind {
    type Err = BeadError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blocks" => Ok(DependencyKind::Blocks),
            "parent" => Ok(DependencyKind::Parent),
            "related" => Ok(DependencyKind::Related),
            other => Err(BeadError::BadArg(format!(
                "unknown dependency kind: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Filters / updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub project_id: Option<String>,
    pub status: Option<BeadStatus>,
    pub bead_type: Option<BeadType>,
}

/// Field patch for `BeadManager::update`. Only the recognized fields are
/// touched; `context` entries are merged into the existing map.
#[derive(Debug, Clone, Default)]
pub struct BeadUpdate {
    pub status: Option<BeadStatus>,
    pub assigned_to: Option<String>,
    pub description: Option<String>,
    pub context: Option<BTreeMap<String, String>>,
}

// ---------------------------------------------------------------------------
// BeadManager
// ---------------------------------------------------------------------------

struct Inner {
    beads: HashMap<String, Bead>,
    /// Per-project monotonic id counters, seeded from the loaded corpus.
    counters: HashMap<String, u64>,
}

/// The content-addressed, dependency-aware work queue.
///
/// The in-memory map is the live truth; the per-project YAML corpus under
/// `<workspace>/<project>/.beads/beads/` is the cold-start mirror. Mirror
/// writes are best-effort: a filesystem failure is logged and never aborts
/// the in-memory mutation.
pub struct BeadManager {
    inner: RwLock<Inner>,
    workspace_dir: PathBuf,
}

impl BeadManager {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                beads: HashMap::new(),
                counters: HashMap::new(),
            }),
            workspace_dir: workspace_dir.into(),
        }
    }

    fn beads_dir(&self, project_id: &str) -> PathBuf {
        self.workspace_dir
            .join(project_id)
            .join(".beads")
            .join("beads")
    }

    fn bead_path(&self, bead: &Bead) -> PathBuf {
        self.beads_dir(&bead.project_id)
            .join(format!("{}-{}.yaml", bead.id, slugify(&bead.title)))
    }

    /// Best-effort mirror write. Called with the write lock held; the write
    /// itself is small and local.
    fn persist(&self, bead: &Bead) {
        let path = self.bead_path(bead);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(bead_id = %bead.id, error = %e, "failed to create beads dir");
                return;
            }
        }
        match serde_yaml::to_string(bead) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&path, text) {
                    warn!(bead_id = %bead.id, path = %path.display(), error = %e,
                        "failed to persist bead, keeping in-memory state");
                }
            }
            Err(e) => warn!(bead_id = %bead.id, error = %e, "failed to serialize bead"),
        }
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    pub fn create(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: Priority,
        bead_type: BeadType,
        project_id: impl Into<String>,
    ) -> Bead {
        let project_id = project_id.into();
        let mut inner = self.inner.write().expect("bead lock poisoned");
        let counter = inner.counters.entry(project_id.clone()).or_insert(0);
        *counter += 1;
        let id = format!("bd-{:03}", *counter);
        let bead = Bead::new(id, title, description, priority, bead_type, &project_id);
        info!(bead_id = %bead.id, project_id = %project_id, "bead created");
        inner.beads.insert(bead.id.clone(), bead.clone());
        self.persist(&bead);
        bead
    }

    pub fn get(&self, id: &str) -> Result<Bead> {
        let inner = self.inner.read().expect("bead lock poisoned");
        inner
            .beads
            .get(id)
            .cloned()
            .ok_or_else(|| BeadError::NotFound(id.to_string()))
    }

    pub fn list(&self, filter: &ListFilter) -> Vec<Bead> {
        let inner = self.inner.read().expect("bead lock poisoned");
        let mut out: Vec<Bead> = inner
            .beads
            .values()
            .filter(|b| {
                filter
                    .project_id
                    .as_ref()
                    .is_none_or(|p| &b.project_id == p)
                    && filter.status.is_none_or(|s| b.status == s)
                    && filter.bead_type.is_none_or(|t| b.bead_type == t)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
        out
    }

    pub fn update(&self, id: &str, patch: BeadUpdate) -> Result<Bead> {
        let mut inner = self.inner.write().expect("bead lock poisoned");
        let bead = inner
            .beads
            .get_mut(id)
            .ok_or_else(|| BeadError::NotFound(id.to_string()))?;

        if let Some(status) = patch.status {
            if status == BeadStatus::Closed && bead.status != BeadStatus::Closed {
                bead.closed_at = Some(Utc::now());
            }
            bead.status = status;
        }
        if let Some(assigned_to) = patch.assigned_to {
            bead.assigned_to = assigned_to;
        }
        if let Some(description) = patch.description {
            bead.description = description;
        }
        if let Some(context) = patch.context {
            for (k, v) in context {
                bead.context.insert(k, v);
            }
        }
        bead.updated_at = Utc::now();
        let bead = bead.clone();
        self.persist(&bead);
        Ok(bead)
    }

    // -----------------------------------------------------------------------
    // Claim / release / close
    // -----------------------------------------------------------------------

    /// Atomically claim a bead for an agent. Idempotent for the same agent;
    /// a claim held by a different agent is a conflict.
    pub fn claim(&self, bead_id: &str, agent_id: &str) -> Result<Bead> {
        let mut inner = self.inner.write().expect("bead lock poisoned");
        let bead = inner
            .beads
            .get_mut(bead_id)
            .ok_or_else(|| BeadError::NotFound(bead_id.to_string()))?;

        match bead.status {
            BeadStatus::InProgress if bead.assigned_to == agent_id => {
                return Ok(bead.clone());
            }
            BeadStatus::InProgress => {
                return Err(BeadError::Conflict(format!(
                    "bead {bead_id} already claimed by {}",
                    bead.assigned_to
                )));
            }
            BeadStatus::Blocked | BeadStatus::Closed => {
                return Err(BeadError::Conflict(format!(
                    "bead {bead_id} is {} and cannot be claimed",
                    bead.status
                )));
            }
            BeadStatus::Open => {}
        }

        bead.status = BeadStatus::InProgress;
        bead.assigned_to = agent_id.to_string();
        bead.updated_at = Utc::now();
        debug!(bead_id = %bead_id, agent_id = %agent_id, "bead claimed");
        let bead = bead.clone();
        self.persist(&bead);
        Ok(bead)
    }

    /// Return a bead to the open pool, clearing the assignment.
    pub fn release(&self, bead_id: &str) -> Result<Bead> {
        self.update(
            bead_id,
            BeadUpdate {
                status: Some(BeadStatus::Open),
                assigned_to: Some(String::new()),
                ..Default::default()
            },
        )
    }

    /// Close a bead, clearing the assignment and stamping `closed_at`.
    pub fn close(&self, bead_id: &str) -> Result<Bead> {
        self.update(
            bead_id,
            BeadUpdate {
                status: Some(BeadStatus::Closed),
                assigned_to: Some(String::new()),
                ..Default::default()
            },
        )
    }

    /// Touch `updated_at` without changing anything else. Used by the loop's
    /// progress callback to keep a live bead out of the zombie sweep.
    pub fn touch(&self, bead_id: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("bead lock poisoned");
        let bead = inner
            .beads
            .get_mut(bead_id)
            .ok_or_else(|| BeadError::NotFound(bead_id.to_string()))?;
        bead.updated_at = Utc::now();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    /// Add a dependency edge, updating both sides. A new `blocks` edge may
    /// push an in-progress child back to `blocked`.
    pub fn add_dependency(&self, child: &str, parent: &str, kind: DependencyKind) -> Result<()> {
        if child == parent {
            return Err(BeadError::BadArg(format!(
                "bead {child} cannot depend on itself"
            )));
        }
        let mut inner = self.inner.write().expect("bead lock poisoned");
        if !inner.beads.contains_key(child) {
            return Err(BeadError::NotFound(child.to_string()));
        }
        if !inner.beads.contains_key(parent) {
            return Err(BeadError::NotFound(parent.to_string()));
        }

        let now = Utc::now();
        match kind {
            DependencyKind::Blocks => {
                let child_bead = inner.beads.get_mut(child).expect("checked above");
                if !child_bead.blocked_by.contains(&parent.to_string()) {
                    child_bead.blocked_by.push(parent.to_string());
                }
                if child_bead.status == BeadStatus::InProgress {
                    child_bead.status = BeadStatus::Blocked;
                }
                child_bead.updated_at = now;
                let child_bead = child_bead.clone();

                let parent_bead = inner.beads.get_mut(parent).expect("checked above");
                if !parent_bead.blocks.contains(&child.to_string()) {
                    parent_bead.blocks.push(child.to_string());
                }
                parent_bead.updated_at = now;
                let parent_bead = parent_bead.clone();

                self.persist(&child_bead);
                self.persist(&parent_bead);
            }
            DependencyKind::Parent => {
                let child_bead = inner.beads.get_mut(child).expect("checked above");
                child_bead.parent = Some(parent.to_string());
                child_bead.updated_at = now;
                let child_bead = child_bead.clone();

                let parent_bead = inner.beads.get_mut(parent).expect("checked above");
                if !parent_bead.children.contains(&child.to_string()) {
                    parent_bead.children.push(child.to_string());
                }
                parent_bead.updated_at = now;
                let parent_bead = parent_bead.clone();

                self.persist(&child_bead);
                self.persist(&parent_bead);
            }
            DependencyKind::Related => {
                let child_bead = inner.beads.get_mut(child).expect("checked above");
                if !child_bead.related_to.contains(&parent.to_string()) {
                    child_bead.related_to.push(parent.to_string());
                }
                child_bead.updated_at = now;
                let child_bead = child_bead.clone();

                let parent_bead = inner.beads.get_mut(parent).expect("checked above");
                if !parent_bead.related_to.contains(&child.to_string()) {
                    parent_bead.related_to.push(child.to_string());
                }
                parent_bead.updated_at = now;
                let parent_bead = parent_bead.clone();

                self.persist(&child_bead);
                self.persist(&parent_bead);
            }
        }
        Ok(())
    }

    /// Remove one blocker. When the last blocker goes away and the bead is
    /// `blocked`, it reopens.
    pub fn unblock(&self, bead_id: &str, blocker_id: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("bead lock poisoned");
        if !inner.beads.contains_key(bead_id) {
            return Err(BeadError::NotFound(bead_id.to_string()));
        }

        if let Some(blocker) = inner.beads.get_mut(blocker_id) {
            blocker.blocks.retain(|id| id != bead_id);
            let blocker = blocker.clone();
            self.persist(&blocker);
        }

        let bead = inner.beads.get_mut(bead_id).expect("checked above");
        bead.blocked_by.retain(|id| id != blocker_id);
        if bead.blocked_by.is_empty() && bead.status == BeadStatus::Blocked {
            bead.status = BeadStatus::Open;
        }
        bead.updated_at = Utc::now();
        let bead = bead.clone();
        self.persist(&bead);
        Ok(())
    }

    /// All bead ids that transitively block `id`. Used by callers to detect
    /// dependency cycles before they wedge the ready-set.
    pub fn transitive_blockers(&self, id: &str) -> HashSet<String> {
        let inner = self.inner.read().expect("bead lock poisoned");
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = inner
            .beads
            .get(id)
            .map(|b| b.blocked_by.clone())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                if let Some(bead) = inner.beads.get(&next) {
                    stack.extend(bead.blocked_by.iter().cloned());
                }
            }
        }
        seen
    }

    // -----------------------------------------------------------------------
    // Ready set
    // -----------------------------------------------------------------------

    /// All open beads of a project whose every blocker is closed. A blocker
    /// id that does not resolve counts as open.
    pub fn ready(&self, project_id: &str) -> Vec<Bead> {
        let inner = self.inner.read().expect("bead lock poisoned");
        let mut out: Vec<Bead> = inner
            .beads
            .values()
            .filter(|b| {
                b.project_id == project_id
                    && b.status == BeadStatus::Open
                    && b.blocked_by.iter().all(|dep| {
                        inner
                            .beads
                            .get(dep)
                            .map(|d| d.status == BeadStatus::Closed)
                            .unwrap_or(false)
                    })
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
        out
    }

    // -----------------------------------------------------------------------
    // Run-failure bookkeeping
    // -----------------------------------------------------------------------

    /// Record a failed run: reset to open, append to the capped error
    /// history, bump the dispatch counter, and optionally flag loop
    /// detection for Ralph.
    pub fn note_failure(&self, bead_id: &str, error: &str, loop_detected: bool) -> Result<()> {
        let mut inner = self.inner.write().expect("bead lock poisoned");
        let bead = inner
            .beads
            .get_mut(bead_id)
            .ok_or_else(|| BeadError::NotFound(bead_id.to_string()))?;

        bead.status = BeadStatus::Open;
        bead.assigned_to.clear();

        let mut history: Vec<String> = bead
            .context
            .get(context_keys::ERROR_HISTORY)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        history.push(format!("{} {}", Utc::now().to_rfc3339(), error));
        if history.len() > ERROR_HISTORY_CAP {
            let excess = history.len() - ERROR_HISTORY_CAP;
            history.drain(..excess);
        }
        bead.context.insert(
            context_keys::ERROR_HISTORY.into(),
            serde_json::to_string(&history).unwrap_or_default(),
        );
        bead.context
            .insert(context_keys::LAST_RUN_ERROR.into(), error.to_string());

        let count: u64 = bead
            .context
            .get(context_keys::DISPATCH_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        bead.context
            .insert(context_keys::DISPATCH_COUNT.into(), (count + 1).to_string());

        if loop_detected {
            bead.context
                .insert(context_keys::LOOP_DETECTED.into(), "true".into());
        }
        bead.updated_at = Utc::now();
        let bead = bead.clone();
        self.persist(&bead);
        Ok(())
    }

    pub fn stats(&self, project_id: &str) -> BeadStats {
        let ready = self.ready(project_id).len() as u64;
        let inner = self.inner.read().expect("bead lock poisoned");
        let mut stats = BeadStats {
            ready,
            ..Default::default()
        };
        for bead in inner.beads.values().filter(|b| b.project_id == project_id) {
            stats.total += 1;
            match bead.status {
                BeadStatus::Open => stats.open += 1,
                BeadStatus::InProgress => stats.in_progress += 1,
                BeadStatus::Blocked => stats.blocked += 1,
                BeadStatus::Closed => stats.closed += 1,
            }
        }
        stats
    }

    // -----------------------------------------------------------------------
    // Corpus loading
    // -----------------------------------------------------------------------

    /// Load one project's YAML corpus into the map. Idempotent: on-disk
    /// state replaces in-memory state for the ids it contains. Files that
    /// fail to parse are skipped with a warning.
    pub fn load_project(&self, project_id: &str) -> Result<usize> {
        let dir = self.beads_dir(project_id);
        if !dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        let mut max_id: u64 = 0;
        let mut inner = self.inner.write().expect("bead lock poisoned");
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable bead file");
                    continue;
                }
            };
            match serde_yaml::from_str::<Bead>(&text) {
                Ok(bead) => {
                    if let Some(n) = parse_bead_number(&bead.id) {
                        max_id = max_id.max(n);
                    }
                    inner.beads.insert(bead.id.clone(), bead);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed bead file");
                }
            }
        }
        let counter = inner.counters.entry(project_id.to_string()).or_insert(0);
        *counter = (*counter).max(max_id);
        info!(project_id = %project_id, loaded, "bead corpus loaded");
        Ok(loaded)
    }

    /// Scan the workspace for project directories that carry a bead corpus
    /// and load each of them.
    pub fn load_all(&self) -> Result<Vec<String>> {
        let mut projects = Vec::new();
        if !self.workspace_dir.exists() {
            return Ok(projects);
        }
        for entry in std::fs::read_dir(&self.workspace_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().join(".beads").is_dir() {
                self.load_project(&name)?;
                projects.push(name);
            }
        }
        Ok(projects)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `lower(title)` filtered to `[a-z0-9-]`, runs collapsed, max 50 chars.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for ch in title.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 50 {
            break;
        }
    }
    slug.trim_matches('-').to_string()
}

fn parse_bead_number(id: &str) -> Option<u64> {
    id.strip_prefix("bd-")?.parse().ok()
}

/// Path of a project's beads directory relative to a workspace root.
pub fn project_beads_dir(workspace: &Path, project_id: &str) -> PathBuf {
    workspace.join(project_id).join(".beads").join("beads")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
