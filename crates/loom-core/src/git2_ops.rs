//! Native git read operations via libgit2 (git2 crate).
//!
//! Read-only queries on the hot path (current branch, dirty check, branch
//! enumeration) avoid a process spawn. Write operations stay as shell-outs
//! through the gateway. Only compiled with the default-on `libgit2`
//! feature; callers fall back to shell-out when a query fails.

use std::path::Path;

use crate::git::GitError;

impl From<git2::Error> for GitError {
    fn from(e: git2::Error) -> Self {
        GitError::Command(e.message().to_string())
    }
}

/// Stateless read operations; opens the repo fresh for each call.
pub struct Git2ReadOps;

impl Git2ReadOps {
    fn open(workdir: &Path) -> Result<git2::Repository, GitError> {
        git2::Repository::discover(workdir).map_err(GitError::from)
    }

    /// Current branch name (replaces `git rev-parse --abbrev-ref HEAD`).
    pub fn current_branch(workdir: &Path) -> Result<String, GitError> {
        let repo = Self::open(workdir)?;
        let head = repo.head().map_err(GitError::from)?;
        if head.is_branch() {
            Ok(head.shorthand().unwrap_or("HEAD").to_string())
        } else {
            let oid = head
                .target()
                .ok_or_else(|| GitError::Command("HEAD has no target".to_string()))?;
            Ok(format!("{:.7}", oid))
        }
    }

    /// Local branch names (replaces `git branch --format=%(refname:short)`).
    pub fn list_branches(workdir: &Path) -> Result<Vec<String>, GitError> {
        let repo = Self::open(workdir)?;
        let mut out = Vec::new();
        for entry in repo.branches(Some(git2::BranchType::Local))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }

    /// Whether the working tree has uncommitted or untracked changes.
    pub fn is_dirty(workdir: &Path) -> Result<bool, GitError> {
        let repo = Self::open(workdir)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_outside_repo_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Git2ReadOps::current_branch(dir.path()).is_err());
    }
}
