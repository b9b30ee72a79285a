use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BeadStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl BeadStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &BeadStatus) -> bool {
        matches!(
            (self, target),
            (BeadStatus::Open, BeadStatus::InProgress)
                | (BeadStatus::Open, BeadStatus::Blocked)
                | (BeadStatus::Open, BeadStatus::Closed)
                | (BeadStatus::InProgress, BeadStatus::Open)
                | (BeadStatus::InProgress, BeadStatus::Blocked)
                | (BeadStatus::InProgress, BeadStatus::Closed)
                | (BeadStatus::Blocked, BeadStatus::Open)
                | (BeadStatus::Blocked, BeadStatus::Closed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BeadStatus::Closed)
    }
}

impl std::fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BeadStatus::Open => write!(f, "open"),
            BeadStatus::InProgress => write!(f, "in_progress"),
            BeadStatus::Blocked => write!(f, "blocked"),
            BeadStatus::Closed => write!(f, "closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// BeadType / Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadType {
    Task,
    Epic,
    Decision,
    Bug,
    Chore,
}

/// P0 is highest; ordering follows urgency, not the numeric suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

// ---------------------------------------------------------------------------
// Bead
// ---------------------------------------------------------------------------

/// A unit of work in the queue: an issue/ticket with dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub bead_type: BeadType,
    pub priority: Priority,
    pub status: BeadStatus,
    pub project_id: String,
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Opaque metadata: dispatch counters, error history, loop-detection
    /// flags. Merged on update, never replaced wholesale.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub related_to: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Bead {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: Priority,
        bead_type: BeadType,
        project_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            bead_type,
            priority,
            status: BeadStatus::Open,
            project_id: project_id.into(),
            assigned_to: String::new(),
            tags: Vec::new(),
            context: BTreeMap::new(),
            blocks: Vec::new(),
            blocked_by: Vec::new(),
            parent: None,
            children: Vec::new(),
            related_to: Vec::new(),
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    /// Whether this bead is claimable right now, assuming every id in
    /// `blocked_by` resolves to a closed bead (the manager checks that part).
    pub fn is_open(&self) -> bool {
        self.status == BeadStatus::Open
    }
}

// ---------------------------------------------------------------------------
// AgentRole
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Qa,
    Ceo,
    Cto,
    EngineeringManager,
    Engineer,
    Designer,
    Devops,
    Docs,
    Review,
    Developer,
}

impl AgentRole {
    /// Derive a role from a persona path/name via a fixed keyword map.
    /// Falls back to `Developer` when nothing matches.
    pub fn from_persona(persona: &str) -> Self {
        let p = persona.to_lowercase();
        let base = p
            .rsplit('/')
            .next()
            .unwrap_or(&p)
            .trim_end_matches(".md");
        if base.starts_with("qa") {
            AgentRole::Qa
        } else if base.contains("cto") {
            AgentRole::Cto
        } else if base.contains("ceo") {
            AgentRole::Ceo
        } else if base.contains("engineering-manager") || base.contains("engineering_manager") {
            AgentRole::EngineeringManager
        } else if base.contains("engineer") {
            AgentRole::Engineer
        } else if base.contains("designer") {
            AgentRole::Designer
        } else if base.contains("devops") || base.contains("infra") {
            AgentRole::Devops
        } else if base.contains("docs") {
            AgentRole::Docs
        } else if base.contains("review") {
            AgentRole::Review
        } else {
            AgentRole::Developer
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AgentRole::Qa => "QA",
            AgentRole::Ceo => "CEO",
            AgentRole::Cto => "CTO",
            AgentRole::EngineeringManager => "Engineering Manager",
            AgentRole::Engineer => "Engineer",
            AgentRole::Designer => "Designer",
            AgentRole::Devops => "DevOps",
            AgentRole::Docs => "Docs",
            AgentRole::Review => "Review",
            AgentRole::Developer => "Developer",
        }
    }
}

// ---------------------------------------------------------------------------
// AgentStatus / Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Paused,
    Idle,
    Working,
    Error,
}

/// A persona-bound worker identity. `provider_id = None` means paused: the
/// agent exists but cannot execute until a provider is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    pub persona_name: String,
    pub project_id: String,
    #[serde(default)]
    pub provider_id: Option<String>,
    pub status: AgentStatus,
    #[serde(default)]
    pub current_bead: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        persona_name: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let persona_name = persona_name.into();
        Self {
            id: format!("agent-{}", Uuid::new_v4()),
            name: name.into(),
            role: AgentRole::from_persona(&persona_name),
            persona_name,
            project_id: project_id.into(),
            provider_id: None,
            status: AgentStatus::Paused,
            current_bead: None,
            started_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// An in-memory dispatch unit handed to a worker: the bead plus the assembled
/// project/instruction context blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub bead_id: String,
    pub project_id: String,
    pub description: String,
    pub context: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Task {
    pub fn new(
        bead_id: impl Into<String>,
        project_id: impl Into<String>,
        description: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("task-{}", Uuid::new_v4()),
            bead_id: bead_id.into(),
            project_id: project_id.into(),
            description: description.into(),
            context: context.into(),
            session_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub approx_tokens: usize,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        let approx_tokens = estimate_tokens(&content);
        Self {
            role,
            content,
            approx_tokens,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(content: &str) -> usize {
    content.len() / 4
}

pub const SESSION_TTL_HOURS: i64 = 24;

/// Persistent per-bead chat history. Append-only while live; expiry starts a
/// fresh session on the next task rather than resuming this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub bead_id: String,
    pub project_id: String,
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(bead_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            session_id: format!("sess-{}", Uuid::new_v4()),
            bead_id: bead_id.into(),
            project_id: project_id.into(),
            messages: Vec::new(),
            metadata: BTreeMap::new(),
            expires_at: Utc::now() + Duration::hours(SESSION_TTL_HOURS),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.messages.push(turn);
    }
}

// ---------------------------------------------------------------------------
// Lesson
// ---------------------------------------------------------------------------

/// A recorded observation from a run (build failures, loop patterns) that
/// future prompts can draw on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub category: String,
    pub bead_id: String,
    pub agent_id: String,
    pub project_id: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

impl Lesson {
    pub fn new(
        category: impl Into<String>,
        bead_id: impl Into<String>,
        agent_id: impl Into<String>,
        project_id: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            bead_id: bead_id.into(),
            agent_id: agent_id.into(),
            project_id: project_id.into(),
            summary: summary.into(),
            created_at: Utc::now(),
        }
    }
}

pub const LESSON_CATEGORY_LOOP_PATTERN: &str = "loop_pattern";
pub const LESSON_CATEGORY_BUILD: &str = "build";

// ---------------------------------------------------------------------------
// BeadStats
// ---------------------------------------------------------------------------

/// Per-status bead counts for the daemon's periodic status line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeadStats {
    pub total: u64,
    pub open: u64,
    pub in_progress: u64,
    pub blocked: u64,
    pub closed: u64,
    pub ready: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bead_status_transitions() {
        assert!(BeadStatus::Open.can_transition_to(&BeadStatus::InProgress));
        assert!(BeadStatus::InProgress.can_transition_to(&BeadStatus::Open));
        assert!(BeadStatus::Blocked.can_transition_to(&BeadStatus::Open));
        assert!(!BeadStatus::Closed.can_transition_to(&BeadStatus::Open));
        assert!(!BeadStatus::Open.can_transition_to(&BeadStatus::Open));
    }

    #[test]
    fn priority_orders_by_urgency() {
        assert!(Priority::P0 < Priority::P1);
        assert!(Priority::P1 < Priority::P3);
    }

    #[test]
    fn role_derivation_keyword_map() {
        assert_eq!(AgentRole::from_persona("qa-lead"), AgentRole::Qa);
        assert_eq!(AgentRole::from_persona("personas/cto.md"), AgentRole::Cto);
        assert_eq!(AgentRole::from_persona("ceo"), AgentRole::Ceo);
        assert_eq!(
            AgentRole::from_persona("engineering-manager"),
            AgentRole::EngineeringManager
        );
        assert_eq!(
            AgentRole::from_persona("backend-engineer"),
            AgentRole::Engineer
        );
        assert_eq!(AgentRole::from_persona("ui-designer"), AgentRole::Designer);
        assert_eq!(AgentRole::from_persona("something-else"), AgentRole::Developer);
    }

    #[test]
    fn agent_starts_paused_without_provider() {
        let agent = Agent::new("worker-1", "engineering-manager", "proj");
        assert_eq!(agent.status, AgentStatus::Paused);
        assert!(agent.provider_id.is_none());
        assert_eq!(agent.role, AgentRole::EngineeringManager);
    }

    #[test]
    fn session_expiry_window() {
        let mut session = ConversationSession::new("bd-001", "proj");
        assert!(!session.is_expired());
        session.expires_at = Utc::now() - Duration::minutes(1);
        assert!(session.is_expired());
    }

    #[test]
    fn chat_turn_estimates_tokens() {
        let turn = ChatTurn::user("x".repeat(400));
        assert_eq!(turn.approx_tokens, 100);
    }

    #[test]
    fn bead_yaml_roundtrip_ignores_unknown_fields() {
        let yaml = r#"
id: bd-007
title: Fix the flaky test
type: bug
priority: P1
status: open
project_id: demo
created_at: 2026-01-01T00:00:00Z
updated_at: 2026-01-01T00:00:00Z
some_future_field: ignored
"#;
        let bead: Bead = serde_yaml::from_str(yaml).expect("lenient load");
        assert_eq!(bead.id, "bd-007");
        assert_eq!(bead.bead_type, BeadType::Bug);
        assert!(bead.blocked_by.is_empty());
    }
}
