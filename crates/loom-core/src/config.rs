use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.loom/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub ralph: RalphConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Load config from `~/.loom/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// The loom home directory (`~/.loom`), also the audit-log base.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".loom")
    }

    fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Root directory holding one worktree per project.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            log_level: default_log_level(),
        }
    }
}

fn default_workspace_dir() -> String {
    "~/loom-workspace".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Consecutive empty claim rounds before a worker task exits.
    #[serde(default = "default_idle_rounds")]
    pub idle_rounds_before_exit: u32,
    #[serde(default = "default_idle_sleep_secs")]
    pub idle_sleep_secs: u64,
    #[serde(default = "default_provider_backoff_secs")]
    pub provider_error_backoff_secs: u64,
    #[serde(default = "default_zombie_mins")]
    pub zombie_bead_threshold_mins: i64,
    #[serde(default = "default_watcher_tick_secs")]
    pub watcher_tick_secs: u64,
    #[serde(default = "default_git_fetch_secs")]
    pub git_fetch_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            max_iterations: default_max_iterations(),
            idle_rounds_before_exit: default_idle_rounds(),
            idle_sleep_secs: default_idle_sleep_secs(),
            provider_error_backoff_secs: default_provider_backoff_secs(),
            zombie_bead_threshold_mins: default_zombie_mins(),
            watcher_tick_secs: default_watcher_tick_secs(),
            git_fetch_secs: default_git_fetch_secs(),
        }
    }
}

fn default_num_workers() -> usize {
    3
}
fn default_max_iterations() -> usize {
    100
}
fn default_idle_rounds() -> u32 {
    36
}
fn default_idle_sleep_secs() -> u64 {
    5
}
fn default_provider_backoff_secs() -> u64 {
    3
}
fn default_zombie_mins() -> i64 {
    30
}
fn default_watcher_tick_secs() -> u64 {
    30
}
fn default_git_fetch_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphConfig {
    #[serde(default = "default_ralph_tick_secs")]
    pub tick_secs: u64,
    /// Agents stuck in `working` longer than this are reset to idle.
    #[serde(default = "default_max_working_mins")]
    pub max_working_mins: i64,
    /// Every Nth beat, scan blocked beads for auto-recovery.
    #[serde(default = "default_recovery_scan_beats")]
    pub recovery_scan_beats: u64,
    #[serde(default = "default_transient_block_mins")]
    pub transient_block_mins: i64,
    #[serde(default = "default_auth_block_mins")]
    pub auth_block_mins: i64,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_ralph_tick_secs(),
            max_working_mins: default_max_working_mins(),
            recovery_scan_beats: default_recovery_scan_beats(),
            transient_block_mins: default_transient_block_mins(),
            auth_block_mins: default_auth_block_mins(),
        }
    }
}

fn default_ralph_tick_secs() -> u64 {
    10
}
fn default_max_working_mins() -> i64 {
    5
}
fn default_recovery_scan_beats() -> u64 {
    10
}
fn default_transient_block_mins() -> i64 {
    30
}
fn default_auth_block_mins() -> i64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            protected_branches: default_protected_branches(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_branch_prefix() -> String {
    "agent/".into()
}
fn default_protected_branches() -> Vec<String> {
    vec![
        "main".into(),
        "master".into(),
        "production".into(),
        "release/*".into(),
        "hotfix/*".into(),
    ]
}
fn default_fetch_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_context_window")]
    pub default_context_window: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_context_window: default_context_window(),
            request_timeout_secs: default_request_timeout_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
        }
    }
}

fn default_context_window() -> usize {
    32768
}
fn default_request_timeout_secs() -> u64 {
    300
}
fn default_health_check_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.loom/loom.db".into()
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.executor.num_workers, 3);
        assert_eq!(cfg.executor.max_iterations, 100);
        assert_eq!(cfg.executor.zombie_bead_threshold_mins, 30);
        assert_eq!(cfg.ralph.tick_secs, 10);
        assert_eq!(cfg.providers.default_context_window, 32768);
        assert!(cfg.git.protected_branches.contains(&"main".to_string()));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
[executor]
num_workers = 5
"#,
        )
        .expect("parse");
        assert_eq!(cfg.executor.num_workers, 5);
        assert_eq!(cfg.executor.max_iterations, 100);
        assert_eq!(cfg.git.branch_prefix, "agent/");
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = Config::default();
        let text = cfg.to_toml().expect("serialize");
        let back: Config = toml::from_str(&text).expect("parse back");
        assert_eq!(back.executor.idle_rounds_before_exit, 36);
    }
}
