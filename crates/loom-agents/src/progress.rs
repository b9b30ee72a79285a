//! Per-iteration progress accounting and the loop/stagnation heuristics.
//!
//! The tracker watches what a worker actually accomplishes (files touched,
//! builds passing, commits landing) and calls the loop stagnant when the
//! action stream stops converting into progress. A separate hash over each
//! iteration's action set catches byte-identical inner loops.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::actions::Action;
use crate::router::ActionResult;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Repeats of the identical action set before the loop is declared inner.
pub const INNER_LOOP_THRESHOLD: u32 = 10;
/// Repeats of a `read_tree` on one path before it alone means stagnation.
const TREE_REPEAT_STAGNANT: u32 = 5;
/// Repeats of a `read_tree` on one path before the feedback carries a warning.
const TREE_REPEAT_WARN: u32 = 3;
/// Iterations under which stagnation (other than tree repeats) never fires.
const GRACE_ITERATIONS: usize = 15;
/// Action types whose raw repetition alone indicates a rut.
const REPETITION_TYPES: &[&str] = &["search_text", "read_file", "read_code", "run_command"];
const REPETITION_LIMIT: u32 = 15;

// ---------------------------------------------------------------------------
// ProgressTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ProgressTracker {
    files_read: HashSet<String>,
    files_written: HashSet<String>,
    read_actions: u32,
    /// `Some(true)` once a build passed, `Some(false)` while the latest
    /// build fails.
    build_status: Option<bool>,
    build_attempts: u32,
    test_failures: u32,
    commits: u32,
    pushes: u32,
    errors: u32,
    beads_created: u32,
    beads_closed: u32,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one iteration's results into the tally.
    pub fn update(&mut self, results: &[ActionResult]) {
        for result in results {
            let ok = result.succeeded();
            if !ok {
                self.errors += 1;
            }
            let path = result.metadata.get("path").cloned().unwrap_or_default();
            match result.action_type.as_str() {
                "read_file" | "read_code" => {
                    self.read_actions += 1;
                    if ok && !path.is_empty() {
                        self.files_read.insert(path);
                    }
                }
                "write_file" | "edit_code" | "apply_patch" => {
                    if ok && !path.is_empty() {
                        self.files_written.insert(path);
                    }
                }
                "build" => {
                    self.build_attempts += 1;
                    self.build_status = Some(ok);
                }
                "test" => {
                    if !ok {
                        self.test_failures += 1;
                    }
                }
                "commit" => {
                    if ok {
                        self.commits += 1;
                    }
                }
                "push" => {
                    if ok {
                        self.pushes += 1;
                    }
                }
                "create_bead" => {
                    if ok {
                        self.beads_created += 1;
                    }
                }
                "close_bead" => {
                    if ok {
                        self.beads_closed += 1;
                    }
                }
                _ => {}
            }
        }
    }

    /// Judge whether the loop has stopped making progress. Returns the
    /// reason when it has.
    pub fn stagnation_reason(
        &self,
        iteration: usize,
        action_type_count: &HashMap<String, u32>,
        tree_paths: &HashMap<String, u32>,
    ) -> Option<String> {
        // Directory listings don't change; re-reading one is pure spin.
        if let Some((path, count)) = tree_paths.iter().find(|(_, &c)| c > TREE_REPEAT_STAGNANT) {
            return Some(format!("read_tree on `{path}` repeated {count} times"));
        }

        if iteration < GRACE_ITERATIONS {
            return None;
        }

        if iteration > 35 && self.files_written.is_empty() {
            return Some(format!("{iteration} iterations with no files written"));
        }

        if iteration > 25 && self.build_status == Some(false) && self.build_attempts > 5 {
            return Some(format!(
                "build still failing after {} attempts",
                self.build_attempts
            ));
        }

        if self.read_actions > 15 && self.files_written.is_empty() {
            return Some(format!(
                "analysis paralysis: {} reads, nothing written",
                self.read_actions
            ));
        }

        if self.test_failures > 5 && self.files_written.len() < 2 {
            return Some(format!(
                "{} test failures with only {} file(s) changed",
                self.test_failures,
                self.files_written.len()
            ));
        }

        for ty in REPETITION_TYPES {
            if let Some(&count) = action_type_count.get(*ty) {
                if count > REPETITION_LIMIT {
                    return Some(format!("{ty} repeated {count} times"));
                }
            }
        }

        None
    }

    /// Feedback line warning about repeated tree listings, before the hard
    /// stagnation threshold trips.
    pub fn tree_warning(tree_paths: &HashMap<String, u32>) -> Option<String> {
        tree_paths
            .iter()
            .find(|(_, &c)| c >= TREE_REPEAT_WARN)
            .map(|(path, count)| {
                format!(
                    "WARNING: you have listed `{path}` {count} times; its contents have not changed. Move on."
                )
            })
    }

    /// One-line progress summary prepended to each iteration's feedback.
    pub fn summary(&self, iteration: usize) -> String {
        let build = match self.build_status {
            Some(true) => "pass",
            Some(false) => "FAIL",
            None => "none",
        };
        format!(
            "[progress] iteration {iteration}: read {} file(s), wrote {} file(s), build {}, {} commit(s), {} push(es), {} error(s)",
            self.files_read.len(),
            self.files_written.len(),
            build,
            self.commits,
            self.pushes,
            self.errors,
        )
    }

    pub fn files_written(&self) -> usize {
        self.files_written.len()
    }
}

// ---------------------------------------------------------------------------
// Inner-loop hash
// ---------------------------------------------------------------------------

/// Truncated SHA-256 over the iteration's `type|path|command` triples.
pub fn hash_actions(actions: &[Action]) -> String {
    let mut hasher = Sha256::new();
    for action in actions {
        hasher.update(action.hash_key());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ActionStatus;
    use std::collections::BTreeMap;

    fn result(action_type: &str, ok: bool, path: Option<&str>) -> ActionResult {
        let mut metadata = BTreeMap::new();
        if let Some(p) = path {
            metadata.insert("path".to_string(), p.to_string());
        }
        ActionResult {
            action_type: action_type.to_string(),
            status: if ok {
                ActionStatus::Executed
            } else {
                ActionStatus::Error
            },
            message: String::new(),
            metadata,
        }
    }

    #[test]
    fn tree_repeats_trigger_before_grace_period() {
        let tracker = ProgressTracker::new();
        let mut trees = HashMap::new();
        trees.insert(".".to_string(), 6u32);
        let reason = tracker.stagnation_reason(3, &HashMap::new(), &trees);
        assert!(reason.unwrap().contains("read_tree"));
    }

    #[test]
    fn no_stagnation_inside_grace_period() {
        let mut tracker = ProgressTracker::new();
        for _ in 0..20 {
            tracker.update(&[result("read_file", true, Some("a.rs"))]);
        }
        let mut counts = HashMap::new();
        counts.insert("read_file".to_string(), 20u32);
        assert!(tracker
            .stagnation_reason(10, &counts, &HashMap::new())
            .is_none());
    }

    #[test]
    fn analysis_paralysis_detected() {
        let mut tracker = ProgressTracker::new();
        for i in 0..16 {
            tracker.update(&[result("read_file", true, Some(&format!("f{i}.rs")))]);
        }
        let reason = tracker.stagnation_reason(16, &HashMap::new(), &HashMap::new());
        assert!(reason.unwrap().contains("analysis paralysis"));
    }

    #[test]
    fn writes_clear_paralysis() {
        let mut tracker = ProgressTracker::new();
        for i in 0..16 {
            tracker.update(&[result("read_file", true, Some(&format!("f{i}.rs")))]);
        }
        tracker.update(&[result("write_file", true, Some("out.rs"))]);
        assert!(tracker
            .stagnation_reason(18, &HashMap::new(), &HashMap::new())
            .is_none());
    }

    #[test]
    fn failing_builds_stagnate_after_enough_attempts() {
        let mut tracker = ProgressTracker::new();
        tracker.update(&[result("write_file", true, Some("a.rs"))]);
        for _ in 0..6 {
            tracker.update(&[result("build", false, None)]);
        }
        let reason = tracker.stagnation_reason(26, &HashMap::new(), &HashMap::new());
        assert!(reason.unwrap().contains("build still failing"));

        // A passing build clears it.
        tracker.update(&[result("build", true, None)]);
        assert!(tracker
            .stagnation_reason(27, &HashMap::new(), &HashMap::new())
            .is_none());
    }

    #[test]
    fn test_failures_without_fixes_stagnate() {
        let mut tracker = ProgressTracker::new();
        tracker.update(&[result("write_file", true, Some("one.rs"))]);
        for _ in 0..6 {
            tracker.update(&[result("test", false, None)]);
        }
        let reason = tracker.stagnation_reason(20, &HashMap::new(), &HashMap::new());
        assert!(reason.unwrap().contains("test failures"));
    }

    #[test]
    fn repetition_of_single_type_stagnates() {
        let mut tracker = ProgressTracker::new();
        tracker.update(&[result("write_file", true, Some("a.rs"))]);
        let mut counts = HashMap::new();
        counts.insert("run_command".to_string(), 16u32);
        let reason = tracker.stagnation_reason(20, &counts, &HashMap::new());
        assert!(reason.unwrap().contains("run_command"));
    }

    #[test]
    fn identical_action_sets_hash_identically() {
        let a = vec![Action::ReadTree { path: ".".into() }];
        let b = vec![Action::ReadTree { path: ".".into() }];
        let c = vec![Action::ReadTree { path: "src".into() }];
        assert_eq!(hash_actions(&a), hash_actions(&b));
        assert_ne!(hash_actions(&a), hash_actions(&c));
        assert_eq!(hash_actions(&a).len(), 16);
    }

    #[test]
    fn content_changes_do_not_change_hash() {
        // The hash keys on type|path|command, so a rewrite of the same file
        // with different content still counts toward the inner loop.
        let a = vec![Action::WriteFile {
            path: "x.rs".into(),
            content: "one".into(),
        }];
        let b = vec![Action::WriteFile {
            path: "x.rs".into(),
            content: "two".into(),
        }];
        assert_eq!(hash_actions(&a), hash_actions(&b));
    }

    #[test]
    fn summary_mentions_build_state() {
        let mut tracker = ProgressTracker::new();
        tracker.update(&[result("build", false, None)]);
        assert!(tracker.summary(4).contains("build FAIL"));
    }

    #[test]
    fn tree_warning_fires_below_stagnation() {
        let mut trees = HashMap::new();
        trees.insert("src".to_string(), 3u32);
        assert!(ProgressTracker::tree_warning(&trees)
            .unwrap()
            .contains("src"));
        trees.insert("src".to_string(), 1u32);
        assert!(ProgressTracker::tree_warning(&trees).is_none());
    }
}
