use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;

use crate::types::{Agent, ConversationSession, Lesson};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PersistError>;

// ---------------------------------------------------------------------------
// Persistence port
// ---------------------------------------------------------------------------

/// The storage port the engine writes through. The engine never assumes a
/// schema beyond these operations; swapping the backing store must not touch
/// callers.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn upsert_agent(&self, agent: &Agent) -> Result<()>;

    /// Latest stored session for a bead, expired or not. Callers decide
    /// whether an expired session warrants a fresh one.
    async fn load_conversation(&self, bead_id: &str) -> Result<Option<ConversationSession>>;

    async fn save_conversation(&self, session: &ConversationSession) -> Result<()>;

    async fn record_lesson(&self, lesson: &Lesson) -> Result<()>;

    async fn lessons_for_bead(&self, bead_id: &str) -> Result<Vec<Lesson>>;
}

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// Async SQLite-backed implementation of the persistence port.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS agents (
                        id           TEXT PRIMARY KEY,
                        name         TEXT NOT NULL,
                        role         TEXT NOT NULL,
                        persona_name TEXT NOT NULL,
                        project_id   TEXT NOT NULL,
                        provider_id  TEXT,
                        status       TEXT NOT NULL,
                        current_bead TEXT,
                        started_at   TEXT NOT NULL,
                        last_active  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_agents_project ON agents(project_id);

                    CREATE TABLE IF NOT EXISTS conversations (
                        session_id TEXT PRIMARY KEY,
                        bead_id    TEXT NOT NULL,
                        project_id TEXT NOT NULL,
                        messages   TEXT NOT NULL,
                        metadata   TEXT NOT NULL,
                        expires_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_conversations_bead ON conversations(bead_id);

                    CREATE TABLE IF NOT EXISTS lessons (
                        category   TEXT NOT NULL,
                        bead_id    TEXT NOT NULL,
                        agent_id   TEXT NOT NULL,
                        project_id TEXT NOT NULL,
                        summary    TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_lessons_bead ON lessons(bead_id);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let id = agent.id.clone();
        let name = agent.name.clone();
        let role = enum_to_sql(&agent.role);
        let persona_name = agent.persona_name.clone();
        let project_id = agent.project_id.clone();
        let provider_id = agent.provider_id.clone();
        let status = enum_to_sql(&agent.status);
        let current_bead = agent.current_bead.clone();
        let started_at = agent.started_at.to_rfc3339();
        let last_active = agent.last_active.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, role, persona_name, project_id,
                        provider_id, status, current_bead, started_at, last_active)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, role=excluded.role,
                        persona_name=excluded.persona_name, project_id=excluded.project_id,
                        provider_id=excluded.provider_id, status=excluded.status,
                        current_bead=excluded.current_bead, last_active=excluded.last_active",
                    rusqlite::params![
                        id,
                        name,
                        role,
                        persona_name,
                        project_id,
                        provider_id,
                        status,
                        current_bead,
                        started_at,
                        last_active,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn load_conversation(&self, bead_id: &str) -> Result<Option<ConversationSession>> {
        let bead_id = bead_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, bead_id, project_id, messages, metadata, expires_at
                     FROM conversations WHERE bead_id = ?1
                     ORDER BY expires_at DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![bead_id])?;
                match rows.next()? {
                    Some(row) => {
                        let session_id: String = row.get(0)?;
                        let bead_id: String = row.get(1)?;
                        let project_id: String = row.get(2)?;
                        let messages: String = row.get(3)?;
                        let metadata: String = row.get(4)?;
                        let expires_at: String = row.get(5)?;
                        Ok(Some((
                            session_id, bead_id, project_id, messages, metadata, expires_at,
                        )))
                    }
                    None => Ok(None),
                }
            })
            .await?;

        match row {
            Some((session_id, bead_id, project_id, messages, metadata, expires_at)) => {
                Ok(Some(ConversationSession {
                    session_id,
                    bead_id,
                    project_id,
                    messages: serde_json::from_str(&messages)?,
                    metadata: serde_json::from_str(&metadata)?,
                    expires_at: chrono::DateTime::parse_from_rfc3339(&expires_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_conversation(&self, session: &ConversationSession) -> Result<()> {
        let session_id = session.session_id.clone();
        let bead_id = session.bead_id.clone();
        let project_id = session.project_id.clone();
        let messages = serde_json::to_string(&session.messages)?;
        let metadata = serde_json::to_string(&session.metadata)?;
        let expires_at = session.expires_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO conversations (session_id, bead_id, project_id,
                        messages, metadata, expires_at)
                     VALUES (?1,?2,?3,?4,?5,?6)
                     ON CONFLICT(session_id) DO UPDATE SET
                        messages=excluded.messages, metadata=excluded.metadata,
                        expires_at=excluded.expires_at",
                    rusqlite::params![
                        session_id, bead_id, project_id, messages, metadata, expires_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn record_lesson(&self, lesson: &Lesson) -> Result<()> {
        let category = lesson.category.clone();
        let bead_id = lesson.bead_id.clone();
        let agent_id = lesson.agent_id.clone();
        let project_id = lesson.project_id.clone();
        let summary = lesson.summary.clone();
        let created_at = lesson.created_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO lessons (category, bead_id, agent_id, project_id,
                        summary, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![category, bead_id, agent_id, project_id, summary, created_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn lessons_for_bead(&self, bead_id: &str) -> Result<Vec<Lesson>> {
        let bead_id = bead_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT category, bead_id, agent_id, project_id, summary, created_at
                     FROM lessons WHERE bead_id = ?1 ORDER BY created_at",
                )?;
                let mut rows = stmt.query(rusqlite::params![bead_id])?;
                let mut out: Vec<(String, String, String, String, String, String)> = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ));
                }
                Ok(out)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(category, bead_id, agent_id, project_id, summary, created_at)| Lesson {
                    category,
                    bead_id,
                    agent_id,
                    project_id,
                    summary,
                    created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                },
            )
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// HashMap-backed persistence for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    agents: Mutex<HashMap<String, Agent>>,
    conversations: Mutex<HashMap<String, ConversationSession>>,
    lessons: Mutex<Vec<Lesson>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lesson_count(&self) -> usize {
        self.lessons.lock().await.len()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        self.agents
            .lock()
            .await
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn load_conversation(&self, bead_id: &str) -> Result<Option<ConversationSession>> {
        Ok(self.conversations.lock().await.get(bead_id).cloned())
    }

    async fn save_conversation(&self, session: &ConversationSession) -> Result<()> {
        self.conversations
            .lock()
            .await
            .insert(session.bead_id.clone(), session.clone());
        Ok(())
    }

    async fn record_lesson(&self, lesson: &Lesson) -> Result<()> {
        self.lessons.lock().await.push(lesson.clone());
        Ok(())
    }

    async fn lessons_for_bead(&self, bead_id: &str) -> Result<Vec<Lesson>> {
        Ok(self
            .lessons
            .lock()
            .await
            .iter()
            .filter(|l| l.bead_id == bead_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatTurn;

    #[tokio::test]
    async fn agent_upsert_roundtrip() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let mut agent = Agent::new("w1", "qa-lead", "proj");
        store.upsert_agent(&agent).await.unwrap();

        agent.provider_id = Some("prov-1".into());
        store.upsert_agent(&agent).await.unwrap();
    }

    #[tokio::test]
    async fn conversation_save_and_load() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let mut session = ConversationSession::new("bd-001", "proj");
        session.push(ChatTurn::system("You are an autonomous engineer."));
        session.push(ChatTurn::user("Fix the bug."));

        store.save_conversation(&session).await.unwrap();
        let loaded = store.load_conversation("bd-001").await.unwrap().unwrap();
        assert_eq!(loaded.session_id, session.session_id);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].content, "Fix the bug.");
    }

    #[tokio::test]
    async fn load_missing_conversation_is_none() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        assert!(store.load_conversation("bd-404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lessons_accumulate_per_bead() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let lesson = Lesson::new("loop_pattern", "bd-001", "agent-1", "proj", "read_tree loop");
        store.record_lesson(&lesson).await.unwrap();
        store
            .record_lesson(&Lesson::new("build", "bd-002", "agent-1", "proj", "other"))
            .await
            .unwrap();

        let lessons = store.lessons_for_bead("bd-001").await.unwrap();
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].category, "loop_pattern");
    }

    #[tokio::test]
    async fn memory_store_behaves_like_port() {
        let store = MemoryStore::new();
        let session = ConversationSession::new("bd-001", "proj");
        store.save_conversation(&session).await.unwrap();
        assert!(store.load_conversation("bd-001").await.unwrap().is_some());
        assert_eq!(store.lesson_count().await, 0);
    }
}
