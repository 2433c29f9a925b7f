//! SQLite-backed persistence for sessions, messages and memories.
//!
//! Embeddings are stored as little-endian f32 BLOBs; vector distance is a
//! brute-force cosine scan over one user's rows (see `memory.rs`).

mod memory;
mod session;

pub use memory::{MemoryWrite, ScoredMemory, WriteCounts};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::MaisonError;

pub(crate) type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = MaisonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(MaisonError::Validation(format!("invalid role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: i64,
    pub user_id: String,
    pub title: Option<String>,
    pub metadata: Metadata,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub session_id: i64,
    pub role: Role,
    pub content: String,
    pub metadata: Metadata,
    pub extracted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Memory {
    pub id: i64,
    pub user_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub metadata: Metadata,
    pub created_at: i64,
    pub updated_at: i64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    title TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions(created_at);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK (role IN ('system','user','assistant','tool')),
    content TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    extracted_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id);
"#;

/// SQLite-backed store.
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    embedding_dim: usize,
}

impl Store {
    pub(crate) fn conn(&self) -> Result<PooledConn, MaisonError> {
        self.pool
            .get()
            .map_err(|e| MaisonError::Internal(format!("db pool: {e}")))
    }

    /// Open (or create) a database at the given path.
    /// Pool size defaults to 8 (1 writer + 7 readers in WAL mode).
    pub fn open(path: &str, embedding_dim: usize) -> Result<Self, MaisonError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each test gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        // foreign_keys is per-connection in SQLite; every pooled connection
        // needs it for message cascade deletes to fire.
        let manager = manager.with_init(|c| {
            c.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        });
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| MaisonError::Internal(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| MaisonError::Internal(e.to_string()))?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        Ok(Self { pool, embedding_dim })
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Liveness check for /db/health.
    pub fn ping(&self) -> bool {
        self.conn()
            .and_then(|c| {
                c.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
                    .map_err(MaisonError::from)
            })
            .is_ok()
    }

    pub(crate) fn check_dim(&self, embedding: &[f32]) -> Result<(), MaisonError> {
        if embedding.len() != self.embedding_dim {
            return Err(MaisonError::EmbeddingDim {
                expected: self.embedding_dim,
                got: embedding.len(),
            });
        }
        Ok(())
    }
}

pub(crate) fn metadata_to_json(m: &Metadata) -> String {
    serde_json::to_string(m).unwrap_or_else(|_| "{}".into())
}

pub(crate) fn metadata_from_json(s: &str) -> Metadata {
    serde_json::from_str(s).unwrap_or_default()
}

#[cfg(test)]
pub(crate) fn test_store() -> Store {
    Store::open(":memory:", 4).expect("in-memory store")
}
