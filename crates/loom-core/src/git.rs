use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::beads::slugify;
use crate::config::GitConfig;
use crate::secrets::{SecretFinding, SecretScanner};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    Command(String),

    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("invalid branch name: {0}")]
    InvalidBranch(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("secrets detected in staged files: {0:?}")]
    SecretsDetected(Vec<SecretFinding>),

    #[error("pre-push checks failed: {0}")]
    PrePushFailed(String),

    #[error("git operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GitError>;

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// One JSON line per git operation, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitAuditEntry {
    pub timestamp: String,
    pub operation: String,
    pub bead_id: String,
    pub project_id: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Command output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(60);
const BRANCH_NAME_MAX: usize = 72;

// ---------------------------------------------------------------------------
// GitGateway
// ---------------------------------------------------------------------------

/// Safety-gated git operations for agent-driven repositories.
///
/// All writes shell out to `git` with per-call timeouts; every operation is
/// appended to the per-project audit log. The gateway enforces branch
/// naming, protected-branch policy, the pre-push test gate, and the staged
/// secret scan. Force pushes are refused unconditionally.
pub struct GitGateway {
    workspace_dir: PathBuf,
    /// Base for per-project audit logs (`<base>/<project>/git_audit.log`).
    audit_base: PathBuf,
    /// Base for per-project SSH identities (`<base>/<project>/ssh/id_ed25519`).
    key_base: PathBuf,
    config: GitConfig,
    scanner: SecretScanner,
}

impl GitGateway {
    pub fn new(workspace_dir: impl Into<PathBuf>, config: GitConfig) -> Self {
        let home = crate::config::Config::home_dir();
        Self {
            workspace_dir: workspace_dir.into(),
            audit_base: home.join("projects"),
            key_base: home.join("projects"),
            config,
            scanner: SecretScanner::new(),
        }
    }

    /// Override the audit/key base directory (useful for tests).
    pub fn with_state_base(mut self, base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        self.audit_base = base.clone();
        self.key_base = base;
        self
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.workspace_dir.join(project_id)
    }

    fn beads_worktree(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(".beads")
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Environment for git subprocesses: the per-project SSH identity when
    /// one is provisioned; otherwise the ambient credentials (including
    /// GITHUB_TOKEN / GITLAB_TOKEN helpers) flow through untouched.
    fn auth_env(&self, project_id: &str) -> Vec<(String, String)> {
        let key = self
            .key_base
            .join(project_id)
            .join("ssh")
            .join("id_ed25519");
        if key.exists() {
            vec![(
                "GIT_SSH_COMMAND".to_string(),
                format!("ssh -i {} -o IdentitiesOnly=yes", key.display()),
            )]
        } else {
            Vec::new()
        }
    }

    async fn run_git_in(
        &self,
        project_id: &str,
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput> {
        let start = std::time::Instant::now();
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(args).current_dir(dir);
        for (k, v) in self.auth_env(project_id) {
            cmd.env(k, v);
        }

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| GitError::Timeout(timeout))??;

        let result = GitOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(args = ?args, exit = ?result.exit_code, dir = %dir.display(), "git");
        Ok(result)
    }

    async fn run_git(
        &self,
        project_id: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput> {
        let dir = self.project_dir(project_id);
        self.run_git_in(project_id, &dir, args, timeout).await
    }

    fn audit(
        &self,
        project_id: &str,
        operation: &str,
        bead_id: &str,
        ref_name: &str,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
    ) {
        let entry = GitAuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            operation: operation.to_string(),
            bead_id: bead_id.to_string(),
            project_id: project_id.to_string(),
            ref_name: ref_name.to_string(),
            success,
            duration_ms,
            error,
        };
        let dir = self.audit_base.join(project_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(error = %e, "cannot create audit dir");
            return;
        }
        let path = dir.join("git_audit.log");
        let line = match serde_json::to_string(&entry) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "cannot serialize audit entry");
                return;
            }
        };
        use std::io::Write;
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = appended {
            warn!(path = %path.display(), error = %e, "cannot append audit entry");
        }
    }

    // -----------------------------------------------------------------------
    // Branch policy
    // -----------------------------------------------------------------------

    /// Agent branches are `<prefix><beadID>/<slug>`: the prefix must match,
    /// no whitespace, at most 72 chars.
    pub fn validate_branch_name(&self, name: &str) -> Result<()> {
        if name.len() > BRANCH_NAME_MAX {
            return Err(GitError::InvalidBranch(format!(
                "branch name exceeds {BRANCH_NAME_MAX} chars: {name}"
            )));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(GitError::InvalidBranch(format!(
                "branch name contains whitespace: {name}"
            )));
        }
        let rest = name
            .strip_prefix(&self.config.branch_prefix)
            .ok_or_else(|| {
                GitError::InvalidBranch(format!(
                    "branch must start with `{}`: {name}",
                    self.config.branch_prefix
                ))
            })?;
        if !rest.contains('/') {
            return Err(GitError::InvalidBranch(format!(
                "branch must be <prefix><bead>/<slug>: {name}"
            )));
        }
        Ok(())
    }

    /// Canonical branch name for a bead.
    pub fn branch_name_for(&self, bead_id: &str, title: &str) -> String {
        let mut name = format!("{}{}/{}", self.config.branch_prefix, bead_id, slugify(title));
        name.truncate(BRANCH_NAME_MAX);
        name
    }

    pub fn is_protected(&self, branch: &str) -> bool {
        self.config.protected_branches.iter().any(|p| {
            if let Some(prefix) = p.strip_suffix("/*") {
                branch.starts_with(prefix) && branch[prefix.len()..].starts_with('/')
            } else {
                branch == p
            }
        })
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub async fn create_branch(&self, project_id: &str, bead_id: &str, name: &str) -> Result<()> {
        self.validate_branch_name(name)?;
        let out = self
            .run_git(project_id, &["checkout", "-b", name], DEFAULT_GIT_TIMEOUT)
            .await;
        self.finish(project_id, "create_branch", bead_id, name, out)
    }

    pub async fn checkout(&self, project_id: &str, bead_id: &str, ref_name: &str) -> Result<()> {
        let out = self
            .run_git(project_id, &["checkout", ref_name], DEFAULT_GIT_TIMEOUT)
            .await;
        self.finish(project_id, "checkout", bead_id, ref_name, out)
    }

    /// Stage everything, scan, then commit with `Bead:`/`Agent:` trailers.
    /// The message's first line is truncated to 72 chars.
    pub async fn commit(
        &self,
        project_id: &str,
        bead_id: &str,
        agent_id: &str,
        message: &str,
    ) -> Result<()> {
        let start = std::time::Instant::now();

        let add = self
            .run_git(project_id, &["add", "-A"], DEFAULT_GIT_TIMEOUT)
            .await?;
        if !add.success() {
            let err = GitError::Command(add.stderr.trim().to_string());
            self.audit(
                project_id,
                "commit",
                bead_id,
                "",
                false,
                start.elapsed().as_millis() as u64,
                Some(err.to_string()),
            );
            return Err(err);
        }

        let staged = self
            .run_git(
                project_id,
                &["diff", "--cached", "--name-only"],
                DEFAULT_GIT_TIMEOUT,
            )
            .await?;
        let mut findings = Vec::new();
        let project_dir = self.project_dir(project_id);
        for file in staged.stdout.lines().filter(|l| !l.is_empty()) {
            let content =
                std::fs::read_to_string(project_dir.join(file)).unwrap_or_default();
            findings.extend(self.scanner.scan_content(file, &content));
        }
        if !findings.is_empty() {
            // Unstage so the tree is not left half-prepared.
            let _ = self
                .run_git(project_id, &["reset"], DEFAULT_GIT_TIMEOUT)
                .await;
            let err = GitError::SecretsDetected(findings);
            self.audit(
                project_id,
                "commit",
                bead_id,
                "",
                false,
                start.elapsed().as_millis() as u64,
                Some(err.to_string()),
            );
            return Err(err);
        }

        let message = format_commit_message(message, bead_id, agent_id);
        let out = self
            .run_git(
                project_id,
                &["commit", "-m", &message],
                DEFAULT_GIT_TIMEOUT,
            )
            .await;
        self.finish(project_id, "commit", bead_id, "", out)
    }

    /// Push the given branch. Refuses force pushes and protected branches,
    /// and runs the project's test gate first.
    pub async fn push(
        &self,
        project_id: &str,
        bead_id: &str,
        branch: &str,
        force: bool,
    ) -> Result<()> {
        let start = std::time::Instant::now();
        if force {
            let err = GitError::PolicyViolation("force push is not allowed".into());
            self.audit(
                project_id,
                "push",
                bead_id,
                branch,
                false,
                0,
                Some(err.to_string()),
            );
            return Err(err);
        }
        if self.is_protected(branch) {
            let err =
                GitError::PolicyViolation(format!("branch {branch} is protected"));
            self.audit(
                project_id,
                "push",
                bead_id,
                branch,
                false,
                0,
                Some(err.to_string()),
            );
            return Err(err);
        }

        if let Err(gate) = self.run_pre_push_gate(project_id).await {
            self.audit(
                project_id,
                "push",
                bead_id,
                branch,
                false,
                start.elapsed().as_millis() as u64,
                Some(gate.to_string()),
            );
            return Err(gate);
        }

        let out = self
            .run_git(
                project_id,
                &["push", "origin", branch],
                Duration::from_secs(120),
            )
            .await;
        self.finish(project_id, "push", bead_id, branch, out)
    }

    pub async fn merge(&self, project_id: &str, bead_id: &str, branch: &str) -> Result<()> {
        let current = self.current_branch(project_id).await?;
        if self.is_protected(&current) {
            let err = GitError::PolicyViolation(format!(
                "cannot merge into protected branch {current}"
            ));
            self.audit(
                project_id,
                "merge",
                bead_id,
                branch,
                false,
                0,
                Some(err.to_string()),
            );
            return Err(err);
        }
        let out = self
            .run_git(
                project_id,
                &["merge", "--no-ff", branch],
                DEFAULT_GIT_TIMEOUT,
            )
            .await;
        self.finish(project_id, "merge", bead_id, branch, out)
    }

    pub async fn revert(&self, project_id: &str, bead_id: &str, commit: &str) -> Result<()> {
        let out = self
            .run_git(
                project_id,
                &["revert", "--no-edit", commit],
                DEFAULT_GIT_TIMEOUT,
            )
            .await;
        self.finish(project_id, "revert", bead_id, commit, out)
    }

    pub async fn delete_branch(&self, project_id: &str, bead_id: &str, branch: &str) -> Result<()> {
        if self.is_protected(branch) {
            let err =
                GitError::PolicyViolation(format!("branch {branch} is protected"));
            self.audit(
                project_id,
                "delete_branch",
                bead_id,
                branch,
                false,
                0,
                Some(err.to_string()),
            );
            return Err(err);
        }
        let out = self
            .run_git(project_id, &["branch", "-D", branch], DEFAULT_GIT_TIMEOUT)
            .await;
        self.finish(project_id, "delete_branch", bead_id, branch, out)
    }

    pub async fn log(&self, project_id: &str, limit: usize) -> Result<String> {
        let n = format!("-{limit}");
        let out = self
            .run_git(
                project_id,
                &["log", "--oneline", &n],
                DEFAULT_GIT_TIMEOUT,
            )
            .await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(GitError::Command(out.stderr.trim().to_string()))
        }
    }

    pub async fn fetch(&self, project_id: &str, bead_id: &str) -> Result<()> {
        let timeout = Duration::from_secs(self.config.fetch_timeout_secs);
        let out = self
            .run_git(project_id, &["fetch", "origin"], timeout)
            .await;
        self.finish(project_id, "fetch", bead_id, "origin", out)
    }

    pub async fn list_branches(&self, project_id: &str) -> Result<Vec<String>> {
        #[cfg(feature = "libgit2")]
        {
            if let Ok(branches) =
                crate::git2_ops::Git2ReadOps::list_branches(&self.project_dir(project_id))
            {
                return Ok(branches);
            }
        }
        let out = self
            .run_git(
                project_id,
                &["branch", "--format=%(refname:short)"],
                DEFAULT_GIT_TIMEOUT,
            )
            .await?;
        if out.success() {
            Ok(out.stdout.lines().map(|l| l.trim().to_string()).collect())
        } else {
            Err(GitError::Command(out.stderr.trim().to_string()))
        }
    }

    pub async fn diff_branches(
        &self,
        project_id: &str,
        base: &str,
        head: &str,
    ) -> Result<String> {
        let range = format!("{base}...{head}");
        let out = self
            .run_git(
                project_id,
                &["diff", "--stat", &range],
                DEFAULT_GIT_TIMEOUT,
            )
            .await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(GitError::Command(out.stderr.trim().to_string()))
        }
    }

    pub async fn stash(&self, project_id: &str, bead_id: &str) -> Result<()> {
        let out = self
            .run_git(project_id, &["stash", "push", "-u"], DEFAULT_GIT_TIMEOUT)
            .await;
        self.finish(project_id, "stash", bead_id, "", out)
    }

    /// There is no API client in this layer: the PR "creation" resolves the
    /// compare URL for the pushed branch so the caller can surface it.
    pub async fn create_pr(
        &self,
        project_id: &str,
        bead_id: &str,
        branch: &str,
    ) -> Result<String> {
        let out = self
            .run_git(
                project_id,
                &["remote", "get-url", "origin"],
                DEFAULT_GIT_TIMEOUT,
            )
            .await?;
        if !out.success() {
            let err = GitError::Command(out.stderr.trim().to_string());
            self.audit(
                project_id,
                "create_pr",
                bead_id,
                branch,
                false,
                out.duration_ms,
                Some(err.to_string()),
            );
            return Err(err);
        }
        let url = compare_url(out.stdout.trim(), branch);
        self.audit(
            project_id,
            "create_pr",
            bead_id,
            branch,
            true,
            out.duration_ms,
            None,
        );
        Ok(url)
    }

    pub async fn current_branch(&self, project_id: &str) -> Result<String> {
        #[cfg(feature = "libgit2")]
        {
            if let Ok(branch) =
                crate::git2_ops::Git2ReadOps::current_branch(&self.project_dir(project_id))
            {
                return Ok(branch);
            }
        }
        let out = self
            .run_git(
                project_id,
                &["rev-parse", "--abbrev-ref", "HEAD"],
                DEFAULT_GIT_TIMEOUT,
            )
            .await?;
        if out.success() {
            Ok(out.stdout.trim().to_string())
        } else {
            Err(GitError::NotARepo(project_id.to_string()))
        }
    }

    /// Fetch the beads worktree and hard-reset to FETCH_HEAD when the remote
    /// moved. Returns `true` when local state changed and the bead corpus
    /// should be reloaded.
    pub async fn sync_beads_worktree(&self, project_id: &str) -> Result<bool> {
        let dir = self.beads_worktree(project_id);
        if !dir.join(".git").exists() {
            return Ok(false);
        }
        let timeout = Duration::from_secs(self.config.fetch_timeout_secs);
        let fetch = self
            .run_git_in(project_id, &dir, &["fetch", "origin"], timeout)
            .await?;
        if !fetch.success() {
            return Err(GitError::Command(fetch.stderr.trim().to_string()));
        }

        let local = self
            .run_git_in(project_id, &dir, &["rev-parse", "HEAD"], timeout)
            .await?;
        let remote = self
            .run_git_in(project_id, &dir, &["rev-parse", "FETCH_HEAD"], timeout)
            .await?;
        if !local.success() || !remote.success() {
            return Err(GitError::Command("rev-parse failed".into()));
        }
        if local.stdout.trim() == remote.stdout.trim() {
            return Ok(false);
        }

        info!(project_id = %project_id, "beads worktree diverged, resetting to FETCH_HEAD");
        let reset = self
            .run_git_in(
                project_id,
                &dir,
                &["reset", "--hard", "FETCH_HEAD"],
                timeout,
            )
            .await?;
        if !reset.success() {
            return Err(GitError::Command(reset.stderr.trim().to_string()));
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Pre-push gate
    // -----------------------------------------------------------------------

    /// Run the project's build/test command, chosen by indicator file. A
    /// missing indicator means no gate. Non-zero exit aborts the push.
    async fn run_pre_push_gate(&self, project_id: &str) -> Result<()> {
        let dir = self.project_dir(project_id);
        let Some(command) = pre_push_command(&dir) else {
            return Ok(());
        };
        info!(project_id = %project_id, command = %command, "running pre-push gate");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&dir)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(10)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            Err(GitError::PrePushFailed(format!("`{command}`: {tail}")))
        }
    }

    fn finish(
        &self,
        project_id: &str,
        operation: &str,
        bead_id: &str,
        ref_name: &str,
        out: Result<GitOutput>,
    ) -> Result<()> {
        match out {
            Ok(out) if out.success() => {
                self.audit(
                    project_id,
                    operation,
                    bead_id,
                    ref_name,
                    true,
                    out.duration_ms,
                    None,
                );
                Ok(())
            }
            Ok(out) => {
                let err = GitError::Command(out.stderr.trim().to_string());
                self.audit(
                    project_id,
                    operation,
                    bead_id,
                    ref_name,
                    false,
                    out.duration_ms,
                    Some(err.to_string()),
                );
                Err(err)
            }
            Err(err) => {
                self.audit(
                    project_id,
                    operation,
                    bead_id,
                    ref_name,
                    false,
                    0,
                    Some(err.to_string()),
                );
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pick the test gate from whichever indicator file the project carries.
fn pre_push_command(dir: &Path) -> Option<String> {
    if dir.join("go.mod").exists() {
        Some("go build ./... && go test ./...".into())
    } else if dir.join("package.json").exists() {
        Some("npm test".into())
    } else if dir.join("Makefile").exists() {
        Some("make test".into())
    } else if dir.join("Cargo.toml").exists() {
        Some("cargo test".into())
    } else {
        None
    }
}

/// First line capped at 72 chars; `Bead:` / `Agent:` trailers appended when
/// not already present.
fn format_commit_message(message: &str, bead_id: &str, agent_id: &str) -> String {
    let mut lines: Vec<String> = message.lines().map(str::to_string).collect();
    if lines.is_empty() {
        lines.push(format!("Update for {bead_id}"));
    }
    if lines[0].len() > 72 {
        lines[0].truncate(72);
    }
    let mut out = lines.join("\n");
    if !out.contains("Bead:") {
        out.push_str(&format!("\n\nBead: {bead_id}"));
    }
    if !out.contains("Agent:") {
        out.push_str(&format!("\nAgent: {agent_id}"));
    }
    out
}

/// Derive a branch-compare URL from the origin remote.
fn compare_url(remote: &str, branch: &str) -> String {
    let https = if let Some(rest) = remote.strip_prefix("git@") {
        // git@host:org/repo.git -> https://host/org/repo
        format!("https://{}", rest.replacen(':', "/", 1))
    } else {
        remote.to_string()
    };
    let base = https.trim_end_matches(".git");
    format!("{base}/compare/{branch}?expand=1")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> (GitGateway, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let gw = GitGateway::new(dir.path(), GitConfig::default())
            .with_state_base(dir.path().join("state"));
        (gw, dir)
    }

    #[test]
    fn branch_names_validated() {
        let (gw, _dir) = gateway();
        assert!(gw.validate_branch_name("agent/bd-042/fix-the-bug").is_ok());
        assert!(gw.validate_branch_name("feature/bd-042/fix").is_err());
        assert!(gw.validate_branch_name("agent/bd-042 fix").is_err());
        assert!(gw.validate_branch_name("agent/bd-042").is_err());
        let long = format!("agent/bd-042/{}", "x".repeat(80));
        assert!(gw.validate_branch_name(&long).is_err());
    }

    #[test]
    fn branch_name_for_is_always_valid() {
        let (gw, _dir) = gateway();
        let name = gw.branch_name_for("bd-042", "Fix the thing that is broken in a very long way indeed!!");
        assert!(name.len() <= BRANCH_NAME_MAX);
        assert!(gw.validate_branch_name(&name).is_ok());
    }

    #[test]
    fn protected_branches_cover_globs() {
        let (gw, _dir) = gateway();
        assert!(gw.is_protected("main"));
        assert!(gw.is_protected("master"));
        assert!(gw.is_protected("production"));
        assert!(gw.is_protected("release/1.2"));
        assert!(gw.is_protected("hotfix/urgent"));
        assert!(!gw.is_protected("agent/bd-001/fix"));
        assert!(!gw.is_protected("releases"));
    }

    #[tokio::test]
    async fn force_push_refused_and_audited() {
        let (gw, dir) = gateway();
        let err = gw
            .push("proj", "bd-001", "agent/bd-001/x", true)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::PolicyViolation(_)));

        let log = std::fs::read_to_string(
            dir.path().join("state").join("proj").join("git_audit.log"),
        )
        .expect("audit written");
        let entry: GitAuditEntry =
            serde_json::from_str(log.lines().next().unwrap()).expect("json line");
        assert_eq!(entry.operation, "push");
        assert!(!entry.success);
        assert!(entry.error.unwrap().contains("force push"));
    }

    #[tokio::test]
    async fn push_to_protected_branch_refused() {
        let (gw, _dir) = gateway();
        let err = gw.push("proj", "bd-001", "main", false).await.unwrap_err();
        assert!(matches!(err, GitError::PolicyViolation(_)));
    }

    #[test]
    fn commit_message_trailers_and_cap() {
        let long_subject = "x".repeat(100);
        let msg = format_commit_message(&long_subject, "bd-007", "exec-p-1");
        let first = msg.lines().next().unwrap();
        assert_eq!(first.len(), 72);
        assert!(msg.contains("Bead: bd-007"));
        assert!(msg.contains("Agent: exec-p-1"));

        // Existing trailers are not duplicated.
        let msg = format_commit_message("fix\n\nBead: bd-007\nAgent: exec-p-1", "bd-007", "exec-p-1");
        assert_eq!(msg.matches("Bead:").count(), 1);
    }

    #[test]
    fn pre_push_command_selection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pre_push_command(dir.path()).is_none());

        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(pre_push_command(dir.path()).unwrap(), "cargo test");

        // A Makefile outranks Cargo.toml when both exist.
        std::fs::write(dir.path().join("Makefile"), "test:\n").unwrap();
        assert_eq!(pre_push_command(dir.path()).unwrap(), "make test");

        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(pre_push_command(dir.path()).unwrap(), "npm test");

        std::fs::write(dir.path().join("go.mod"), "module x\n").unwrap();
        assert!(pre_push_command(dir.path()).unwrap().starts_with("go build"));
    }

    #[test]
    fn compare_url_from_ssh_remote() {
        assert_eq!(
            compare_url("git@github.com:acme/widgets.git", "agent/bd-1/x"),
            "https://github.com/acme/widgets/compare/agent/bd-1/x?expand=1"
        );
        assert_eq!(
            compare_url("https://github.com/acme/widgets.git", "b"),
            "https://github.com/acme/widgets/compare/b?expand=1"
        );
    }

    #[tokio::test]
    async fn sync_beads_worktree_without_repo_is_noop() {
        let (gw, _dir) = gateway();
        assert!(!gw.sync_beads_worktree("proj").await.unwrap());
    }
}
