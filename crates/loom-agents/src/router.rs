//! Dispatches decoded actions to their capability handlers: filesystem,
//! shell, git (through the gateway), and bead management. Every action
//! produces an `ActionResult`; handler errors become `Error` results that
//! flow back to the model as feedback, never panics.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use loom_core::beads::{BeadManager, BeadUpdate, DependencyKind, ListFilter};
use loom_core::git::GitGateway;
use loom_core::types::{BeadStatus, BeadType, Priority};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::actions::{Action, ActionEnvelope};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Executed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_type: String,
    pub status: ActionStatus,
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ActionResult {
    fn ok(action: &Action, message: impl Into<String>) -> Self {
        Self {
            action_type: action.type_name().to_string(),
            status: ActionStatus::Executed,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    fn err(action: &Action, message: impl Into<String>) -> Self {
        Self {
            action_type: action.type_name().to_string(),
            status: ActionStatus::Error,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == ActionStatus::Executed
    }
}

// ---------------------------------------------------------------------------
// ActionContext
// ---------------------------------------------------------------------------

/// Per-invocation identity and workspace placement.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub project_id: String,
    pub bead_id: String,
    pub agent_id: String,
    /// The project worktree all relative paths resolve under.
    pub workdir: PathBuf,
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

const FILE_READ_CAP: usize = 16 * 1024;
const SEARCH_RESULT_CAP: usize = 50;
const OUTPUT_TAIL_CAP: usize = 4 * 1024;
const SHELL_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// ActionRouter
// ---------------------------------------------------------------------------

pub struct ActionRouter {
    beads: Arc<BeadManager>,
    git: Arc<GitGateway>,
}

impl ActionRouter {
    pub fn new(beads: Arc<BeadManager>, git: Arc<GitGateway>) -> Self {
        Self { beads, git }
    }

    /// Execute every action in envelope order, collecting results in order.
    pub async fn execute(&self, env: &ActionEnvelope, ctx: &ActionContext) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(env.actions.len());
        for action in &env.actions {
            let result = self.execute_one(action, ctx).await;
            debug!(
                action = action.type_name(),
                status = ?result.status,
                bead_id = %ctx.bead_id,
                "action executed"
            );
            results.push(result);
        }
        results
    }

    async fn execute_one(&self, action: &Action, ctx: &ActionContext) -> ActionResult {
        match action {
            Action::ReadFile { path } | Action::ReadCode { path } => {
                self.read_file(action, ctx, path).await
            }
            Action::WriteFile { path, content } => self.write_file(action, ctx, path, content).await,
            Action::EditCode {
                path,
                old_string,
                new_string,
            } => self.edit_code(action, ctx, path, old_string, new_string).await,
            Action::ApplyPatch { path, patch } => self.apply_patch(action, ctx, path, patch).await,
            Action::DeleteFile { path } => self.delete_file(action, ctx, path).await,
            Action::ReadTree { path } => self.read_tree(action, ctx, path).await,
            Action::SearchText { query, path } => {
                self.search_text(action, ctx, query, path.as_deref()).await
            }
            Action::RunCommand { command } => self.run_shell(action, ctx, command).await,
            Action::Build { command } => {
                let command = command
                    .clone()
                    .or_else(|| default_build_command(&ctx.workdir));
                match command {
                    Some(cmd) => self.run_shell(action, ctx, &cmd).await,
                    None => ActionResult::err(action, "no build command configured or detectable"),
                }
            }
            Action::Test { command } => {
                let command = command
                    .clone()
                    .or_else(|| default_test_command(&ctx.workdir));
                match command {
                    Some(cmd) => self.run_shell(action, ctx, &cmd).await,
                    None => ActionResult::err(action, "no test command configured or detectable"),
                }
            }
            Action::Commit { message } => {
                match self
                    .git
                    .commit(&ctx.project_id, &ctx.bead_id, &ctx.agent_id, message)
                    .await
                {
                    Ok(()) => ActionResult::ok(action, "changes committed"),
                    Err(e) => ActionResult::err(action, e.to_string()),
                }
            }
            Action::Push { branch } => {
                let branch = match branch {
                    Some(b) => b.clone(),
                    None => match self.git.current_branch(&ctx.project_id).await {
                        Ok(b) => b,
                        Err(e) => return ActionResult::err(action, e.to_string()),
                    },
                };
                match self
                    .git
                    .push(&ctx.project_id, &ctx.bead_id, &branch, false)
                    .await
                {
                    Ok(()) => {
                        ActionResult::ok(action, format!("pushed {branch}")).with_meta("branch", branch)
                    }
                    Err(e) => ActionResult::err(action, e.to_string()),
                }
            }
            Action::CreateBranch { name } => {
                match self.git.create_branch(&ctx.project_id, &ctx.bead_id, name).await {
                    Ok(()) => ActionResult::ok(action, format!("created branch {name}")),
                    Err(e) => ActionResult::err(action, e.to_string()),
                }
            }
            Action::Checkout { ref_name } => {
                match self.git.checkout(&ctx.project_id, &ctx.bead_id, ref_name).await {
                    Ok(()) => ActionResult::ok(action, format!("checked out {ref_name}")),
                    Err(e) => ActionResult::err(action, e.to_string()),
                }
            }
            Action::GitLog { limit } => {
                match self.git.log(&ctx.project_id, limit.unwrap_or(20)).await {
                    Ok(log) => ActionResult::ok(action, log),
                    Err(e) => ActionResult::err(action, e.to_string()),
                }
            }
            Action::DiffBranches { base, head } => {
                match self.git.diff_branches(&ctx.project_id, base, head).await {
                    Ok(diff) => ActionResult::ok(action, diff),
                    Err(e) => ActionResult::err(action, e.to_string()),
                }
            }
            Action::CreatePr { branch } => {
                let branch = match branch {
                    Some(b) => b.clone(),
                    None => match self.git.current_branch(&ctx.project_id).await {
                        Ok(b) => b,
                        Err(e) => return ActionResult::err(action, e.to_string()),
                    },
                };
                match self.git.create_pr(&ctx.project_id, &ctx.bead_id, &branch).await {
                    Ok(url) => ActionResult::ok(action, url),
                    Err(e) => ActionResult::err(action, e.to_string()),
                }
            }
            Action::CreateBead {
                title,
                description,
                priority,
            } => {
                let priority = parse_priority(priority.as_deref());
                let bead = self.beads.create(
                    title,
                    description,
                    priority,
                    BeadType::Task,
                    &ctx.project_id,
                );
                ActionResult::ok(action, format!("created bead {}", bead.id))
                    .with_meta("bead_id", bead.id)
            }
            Action::CloseBead { bead_id } => {
                let id = bead_id.as_deref().unwrap_or(&ctx.bead_id);
                match self.beads.close(id) {
                    Ok(_) => ActionResult::ok(action, format!("closed bead {id}"))
                        .with_meta("bead_id", id),
                    Err(e) => ActionResult::err(action, e.to_string()),
                }
            }
            Action::UpdateBead {
                bead_id,
                status,
                description,
            } => {
                let id = bead_id.as_deref().unwrap_or(&ctx.bead_id);
                let status = match status.as_deref().map(parse_status).transpose() {
                    Ok(s) => s,
                    Err(e) => return ActionResult::err(action, e),
                };
                let patch = BeadUpdate {
                    status,
                    description: description.clone(),
                    ..Default::default()
                };
                match self.beads.update(id, patch) {
                    Ok(_) => ActionResult::ok(action, format!("updated bead {id}")),
                    Err(e) => ActionResult::err(action, e.to_string()),
                }
            }
            Action::AddDependency {
                child,
                parent,
                kind,
            } => {
                let kind: DependencyKind = match kind.parse() {
                    Ok(k) => k,
                    Err(e) => return ActionResult::err(action, e.to_string()),
                };
                match self.beads.add_dependency(child, parent, kind) {
                    Ok(()) => {
                        ActionResult::ok(action, format!("{child} now depends on {parent}"))
                    }
                    Err(e) => ActionResult::err(action, e.to_string()),
                }
            }
            Action::ListBeads {} => {
                let beads = self.beads.list(&ListFilter {
                    project_id: Some(ctx.project_id.clone()),
                    ..Default::default()
                });
                let listing: Vec<String> = beads
                    .iter()
                    .map(|b| format!("{} [{}] {}", b.id, b.status, b.title))
                    .collect();
                ActionResult::ok(action, listing.join("\n"))
            }
            Action::Scope { notes } => ActionResult::ok(action, format!("scope noted: {notes}")),
            Action::Done { reason } => ActionResult::ok(
                action,
                if reason.is_empty() { "done" } else { reason.as_str() },
            ),
            Action::EscalateCeo { reason } => {
                let mut context = BTreeMap::new();
                context.insert(
                    loom_core::beads::context_keys::ESCALATION_REASON.to_string(),
                    reason.clone(),
                );
                let _ = self.beads.update(
                    &ctx.bead_id,
                    BeadUpdate {
                        context: Some(context),
                        ..Default::default()
                    },
                );
                ActionResult::ok(action, format!("escalated: {reason}"))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Filesystem handlers
    // -----------------------------------------------------------------------

    async fn read_file(&self, action: &Action, ctx: &ActionContext, path: &str) -> ActionResult {
        let full = match resolve_path(&ctx.workdir, path) {
            Ok(p) => p,
            Err(e) => return ActionResult::err(action, e),
        };
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => {
                let truncated = if content.len() > FILE_READ_CAP {
                    format!(
                        "{}\n… [truncated, {} bytes total]",
                        &content[..FILE_READ_CAP],
                        content.len()
                    )
                } else {
                    content
                };
                ActionResult::ok(action, truncated).with_meta("path", path)
            }
            Err(e) => ActionResult::err(action, format!("cannot read {path}: {e}")),
        }
    }

    async fn write_file(
        &self,
        action: &Action,
        ctx: &ActionContext,
        path: &str,
        content: &str,
    ) -> ActionResult {
        let full = match resolve_path(&ctx.workdir, path) {
            Ok(p) => p,
            Err(e) => return ActionResult::err(action, e),
        };
        if let Some(parent) = full.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ActionResult::err(action, format!("cannot create {path}: {e}"));
            }
        }
        match tokio::fs::write(&full, content).await {
            Ok(()) => ActionResult::ok(action, format!("wrote {} bytes to {path}", content.len()))
                .with_meta("path", path),
            Err(e) => ActionResult::err(action, format!("cannot write {path}: {e}")),
        }
    }

    async fn edit_code(
        &self,
        action: &Action,
        ctx: &ActionContext,
        path: &str,
        old_string: &str,
        new_string: &str,
    ) -> ActionResult {
        let full = match resolve_path(&ctx.workdir, path) {
            Ok(p) => p,
            Err(e) => return ActionResult::err(action, e),
        };
        let content = match tokio::fs::read_to_string(&full).await {
            Ok(c) => c,
            Err(e) => return ActionResult::err(action, format!("cannot read {path}: {e}")),
        };
        if !content.contains(old_string) {
            return ActionResult::err(action, format!("old_string not found in {path}"));
        }
        let updated = content.replacen(old_string, new_string, 1);
        match tokio::fs::write(&full, updated).await {
            Ok(()) => ActionResult::ok(action, format!("edited {path}")).with_meta("path", path),
            Err(e) => ActionResult::err(action, format!("cannot write {path}: {e}")),
        }
    }

    async fn apply_patch(
        &self,
        action: &Action,
        ctx: &ActionContext,
        path: &str,
        patch: &str,
    ) -> ActionResult {
        let patch_file = ctx.workdir.join(".loom-patch.tmp");
        if let Err(e) = tokio::fs::write(&patch_file, patch).await {
            return ActionResult::err(action, format!("cannot stage patch: {e}"));
        }
        let output = tokio::process::Command::new("git")
            .args(["apply", "--whitespace=nowarn", ".loom-patch.tmp"])
            .current_dir(&ctx.workdir)
            .output()
            .await;
        let _ = tokio::fs::remove_file(&patch_file).await;
        match output {
            Ok(out) if out.status.success() => {
                ActionResult::ok(action, format!("patch applied to {path}")).with_meta("path", path)
            }
            Ok(out) => ActionResult::err(
                action,
                format!("patch failed: {}", String::from_utf8_lossy(&out.stderr).trim()),
            ),
            Err(e) => ActionResult::err(action, format!("patch failed: {e}")),
        }
    }

    async fn delete_file(&self, action: &Action, ctx: &ActionContext, path: &str) -> ActionResult {
        let full = match resolve_path(&ctx.workdir, path) {
            Ok(p) => p,
            Err(e) => return ActionResult::err(action, e),
        };
        match tokio::fs::remove_file(&full).await {
            Ok(()) => ActionResult::ok(action, format!("deleted {path}")),
            Err(e) => ActionResult::err(action, format!("cannot delete {path}: {e}")),
        }
    }

    async fn read_tree(&self, action: &Action, ctx: &ActionContext, path: &str) -> ActionResult {
        let full = match resolve_path(&ctx.workdir, path) {
            Ok(p) => p,
            Err(e) => return ActionResult::err(action, e),
        };
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&full).await {
            Ok(d) => d,
            Err(e) => return ActionResult::err(action, format!("cannot list {path}: {e}")),
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.path().is_dir();
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        ActionResult::ok(action, entries.join("\n")).with_meta("path", path)
    }

    async fn search_text(
        &self,
        action: &Action,
        ctx: &ActionContext,
        query: &str,
        path: Option<&str>,
    ) -> ActionResult {
        let root = match resolve_path(&ctx.workdir, path.unwrap_or(".")) {
            Ok(p) => p,
            Err(e) => return ActionResult::err(action, e),
        };
        let mut hits = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(read) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in read.flatten() {
                let entry_path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if entry_path.is_dir() {
                    if !matches!(name.as_str(), ".git" | "target" | "node_modules" | ".beads") {
                        stack.push(entry_path);
                    }
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&entry_path) else {
                    continue;
                };
                for (lineno, line) in content.lines().enumerate() {
                    if line.contains(query) {
                        let rel = entry_path
                            .strip_prefix(&ctx.workdir)
                            .unwrap_or(&entry_path)
                            .display();
                        hits.push(format!("{}:{}: {}", rel, lineno + 1, line.trim()));
                        if hits.len() >= SEARCH_RESULT_CAP {
                            break;
                        }
                    }
                }
                if hits.len() >= SEARCH_RESULT_CAP {
                    break;
                }
            }
            if hits.len() >= SEARCH_RESULT_CAP {
                break;
            }
        }
        let message = if hits.is_empty() {
            format!("no matches for `{query}`")
        } else {
            hits.join("\n")
        };
        ActionResult::ok(action, message).with_meta("matches", hits.len().to_string())
    }

    // -----------------------------------------------------------------------
    // Shell handler
    // -----------------------------------------------------------------------

    async fn run_shell(&self, action: &Action, ctx: &ActionContext, command: &str) -> ActionResult {
        let output = tokio::time::timeout(
            SHELL_TIMEOUT,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&ctx.workdir)
                .output(),
        )
        .await;

        match output {
            Ok(Ok(out)) => {
                let stdout = tail(&String::from_utf8_lossy(&out.stdout), OUTPUT_TAIL_CAP);
                let stderr = tail(&String::from_utf8_lossy(&out.stderr), OUTPUT_TAIL_CAP);
                let code = out.status.code().unwrap_or(-1);
                let message = format!("exit {code}\nstdout:\n{stdout}\nstderr:\n{stderr}");
                let result = if out.status.success() {
                    ActionResult::ok(action, message)
                } else {
                    ActionResult::err(action, message)
                };
                result
                    .with_meta("exit_code", code.to_string())
                    .with_meta("command", command)
            }
            Ok(Err(e)) => ActionResult::err(action, format!("cannot run `{command}`: {e}")),
            Err(_) => ActionResult::err(
                action,
                format!("`{command}` timed out after {}s", SHELL_TIMEOUT.as_secs()),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve a model-supplied path under the worktree. Absolute paths and
/// parent traversal are rejected.
fn resolve_path(workdir: &Path, path: &str) -> Result<PathBuf, String> {
    let rel = Path::new(path);
    if rel.is_absolute() {
        return Err(format!("absolute paths are not allowed: {path}"));
    }
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("parent traversal is not allowed: {path}"));
    }
    Ok(workdir.join(rel))
}

fn default_build_command(workdir: &Path) -> Option<String> {
    if workdir.join("go.mod").exists() {
        Some("go build ./...".into())
    } else if workdir.join("package.json").exists() {
        Some("npm run build --if-present".into())
    } else if workdir.join("Makefile").exists() {
        Some("make".into())
    } else if workdir.join("Cargo.toml").exists() {
        Some("cargo build".into())
    } else {
        None
    }
}

fn default_test_command(workdir: &Path) -> Option<String> {
    if workdir.join("go.mod").exists() {
        Some("go test ./...".into())
    } else if workdir.join("package.json").exists() {
        Some("npm test".into())
    } else if workdir.join("Makefile").exists() {
        Some("make test".into())
    } else if workdir.join("Cargo.toml").exists() {
        Some("cargo test".into())
    } else {
        None
    }
}

fn parse_priority(raw: Option<&str>) -> Priority {
    match raw {
        Some("P0") | Some("p0") => Priority::P0,
        Some("P1") | Some("p1") => Priority::P1,
        Some("P3") | Some("p3") => Priority::P3,
        _ => Priority::P2,
    }
}

fn parse_status(raw: &str) -> Result<BeadStatus, String> {
    match raw {
        "open" => Ok(BeadStatus::Open),
        "in_progress" => Ok(BeadStatus::InProgress),
        "blocked" => Ok(BeadStatus::Blocked),
        "closed" => Ok(BeadStatus::Closed),
        other => Err(format!("unknown status: {other}")),
    }
}

fn tail(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        text.to_string()
    } else {
        format!("…{}", &text[text.len() - cap..])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::config::GitConfig;

    fn router_fixture() -> (ActionRouter, ActionContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let workdir = dir.path().join("proj");
        std::fs::create_dir_all(&workdir).unwrap();
        let beads = Arc::new(BeadManager::new(dir.path()));
        let git = Arc::new(
            GitGateway::new(dir.path(), GitConfig::default()).with_state_base(dir.path().join("s")),
        );
        let ctx = ActionContext {
            project_id: "proj".into(),
            bead_id: "bd-001".into(),
            agent_id: "exec-1".into(),
            workdir,
        };
        (ActionRouter::new(beads, git), ctx, dir)
    }

    #[tokio::test]
    async fn write_then_read_then_edit() {
        let (router, ctx, _dir) = router_fixture();

        let env = ActionEnvelope {
            actions: vec![Action::WriteFile {
                path: "src/lib.rs".into(),
                content: "pub fn answer() -> u32 { 41 }\n".into(),
            }],
        };
        let results = router.execute(&env, &ctx).await;
        assert!(results[0].succeeded());

        let env = ActionEnvelope {
            actions: vec![
                Action::ReadFile {
                    path: "src/lib.rs".into(),
                },
                Action::EditCode {
                    path: "src/lib.rs".into(),
                    old_string: "41".into(),
                    new_string: "42".into(),
                },
            ],
        };
        let results = router.execute(&env, &ctx).await;
        assert!(results[0].message.contains("answer"));
        assert!(results[1].succeeded());

        let content = std::fs::read_to_string(ctx.workdir.join("src/lib.rs")).unwrap();
        assert!(content.contains("42"));
    }

    #[tokio::test]
    async fn edit_missing_anchor_reports_error() {
        let (router, ctx, _dir) = router_fixture();
        std::fs::write(ctx.workdir.join("a.txt"), "hello").unwrap();
        let env = ActionEnvelope {
            actions: vec![Action::EditCode {
                path: "a.txt".into(),
                old_string: "nope".into(),
                new_string: "x".into(),
            }],
        };
        let results = router.execute(&env, &ctx).await;
        assert_eq!(results[0].status, ActionStatus::Error);
        assert!(results[0].message.contains("old_string not found"));
    }

    #[tokio::test]
    async fn path_escape_rejected() {
        let (router, ctx, _dir) = router_fixture();
        for path in ["../outside.txt", "/etc/passwd"] {
            let env = ActionEnvelope {
                actions: vec![Action::ReadFile { path: path.into() }],
            };
            let results = router.execute(&env, &ctx).await;
            assert_eq!(results[0].status, ActionStatus::Error, "path {path}");
        }
    }

    #[tokio::test]
    async fn read_tree_lists_entries() {
        let (router, ctx, _dir) = router_fixture();
        std::fs::create_dir_all(ctx.workdir.join("src")).unwrap();
        std::fs::write(ctx.workdir.join("README.md"), "x").unwrap();
        let env = ActionEnvelope {
            actions: vec![Action::ReadTree { path: ".".into() }],
        };
        let results = router.execute(&env, &ctx).await;
        assert!(results[0].succeeded());
        assert!(results[0].message.contains("README.md"));
        assert!(results[0].message.contains("src/"));
    }

    #[tokio::test]
    async fn search_finds_lines_and_skips_git_dirs() {
        let (router, ctx, _dir) = router_fixture();
        std::fs::create_dir_all(ctx.workdir.join(".git")).unwrap();
        std::fs::write(ctx.workdir.join(".git/needle.txt"), "needle here").unwrap();
        std::fs::write(ctx.workdir.join("code.rs"), "let needle = 1;\nlet hay = 2;").unwrap();

        let env = ActionEnvelope {
            actions: vec![Action::SearchText {
                query: "needle".into(),
                path: None,
            }],
        };
        let results = router.execute(&env, &ctx).await;
        assert!(results[0].message.contains("code.rs:1"));
        assert!(!results[0].message.contains(".git"));
    }

    #[tokio::test]
    async fn run_command_captures_exit_code() {
        let (router, ctx, _dir) = router_fixture();
        let env = ActionEnvelope {
            actions: vec![
                Action::RunCommand {
                    command: "echo out-marker".into(),
                },
                Action::RunCommand {
                    command: "exit 3".into(),
                },
            ],
        };
        let results = router.execute(&env, &ctx).await;
        assert!(results[0].succeeded());
        assert!(results[0].message.contains("out-marker"));
        assert_eq!(results[1].status, ActionStatus::Error);
        assert_eq!(results[1].metadata.get("exit_code").unwrap(), "3");
    }

    #[tokio::test]
    async fn bead_actions_flow_through_manager() {
        let (router, ctx, _dir) = router_fixture();
        let env = ActionEnvelope {
            actions: vec![Action::CreateBead {
                title: "Follow-up".into(),
                description: "found while working".into(),
                priority: Some("P1".into()),
            }],
        };
        let results = router.execute(&env, &ctx).await;
        assert!(results[0].succeeded());
        let new_id = results[0].metadata.get("bead_id").unwrap().clone();

        let env = ActionEnvelope {
            actions: vec![
                Action::AddDependency {
                    child: new_id.clone(),
                    parent: new_id.clone(),
                    kind: "blocks".into(),
                },
                Action::CloseBead {
                    bead_id: Some(new_id.clone()),
                },
                Action::ListBeads {},
            ],
        };
        let results = router.execute(&env, &ctx).await;
        // Self-dependency is a bad argument, surfaced as an error result.
        assert_eq!(results[0].status, ActionStatus::Error);
        assert!(results[1].succeeded());
        assert!(results[2].message.contains(&new_id));
    }

    #[tokio::test]
    async fn unknown_dependency_kind_is_error_result() {
        let (router, ctx, _dir) = router_fixture();
        let env = ActionEnvelope {
            actions: vec![Action::AddDependency {
                child: "bd-001".into(),
                parent: "bd-002".into(),
                kind: "rhymes_with".into(),
            }],
        };
        let results = router.execute(&env, &ctx).await;
        assert_eq!(results[0].status, ActionStatus::Error);
        assert!(results[0].message.contains("unknown dependency kind"));
    }

    #[test]
    fn default_commands_by_indicator() {
        let dir = tempfile::tempdir().unwrap();
        assert!(default_build_command(dir.path()).is_none());

        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(default_build_command(dir.path()).unwrap(), "cargo build");
        assert_eq!(default_test_command(dir.path()).unwrap(), "cargo test");

        // A Makefile outranks Cargo.toml when both exist.
        std::fs::write(dir.path().join("Makefile"), "test:\n").unwrap();
        assert_eq!(default_build_command(dir.path()).unwrap(), "make");
        assert_eq!(default_test_command(dir.path()).unwrap(), "make test");

        std::fs::write(dir.path().join("go.mod"), "module x\n").unwrap();
        assert_eq!(default_test_command(dir.path()).unwrap(), "go test ./...");
    }
}
