//! Memory persistence and the brute-force cosine scan that backs nearby
//! retrieval. Suitable for per-user collections up to ~10k memories; larger
//! deployments would move to an external vector index.

use rusqlite::params;
use serde::Serialize;

use super::{metadata_from_json, now_ms, Memory, Store};
use crate::error::MaisonError;
use crate::llm::{bytes_to_embedding, cosine_similarity, embedding_to_bytes};

/// A memory paired with its distance to a query embedding.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub distance: f64,
    pub similarity: f64,
}

/// One mutation applied inside a single extraction transaction.
#[derive(Debug)]
pub enum MemoryWrite {
    Insert { content: String, embedding: Vec<f32> },
    Update { id: i64, content: String, embedding: Vec<f32>, updated_at: i64 },
    Delete { id: i64 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteCounts {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let metadata: String = row.get("metadata")?;
    let blob: Option<Vec<u8>> = row.get("embedding")?;
    Ok(Memory {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        content: row.get("content")?,
        embedding: blob.map(|b| bytes_to_embedding(&b)),
        metadata: metadata_from_json(&metadata),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn insert_memory(
        &self,
        user_id: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<Memory, MaisonError> {
        self.check_dim(embedding)?;
        let now = now_ms();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO memories (user_id, content, embedding, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, '{}', ?4, ?4)",
            params![user_id, content, embedding_to_bytes(embedding), now],
        )?;
        Ok(Memory {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            embedding: Some(embedding.to_vec()),
            metadata: super::Metadata::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_memory(
        &self,
        id: i64,
        content: &str,
        embedding: &[f32],
        updated_at: i64,
    ) -> Result<(), MaisonError> {
        self.check_dim(embedding)?;
        self.conn()?.execute(
            "UPDATE memories SET content = ?1, embedding = ?2, updated_at = ?3 WHERE id = ?4",
            params![content, embedding_to_bytes(embedding), updated_at, id],
        )?;
        Ok(())
    }

    pub fn delete_memory(&self, id: i64) -> Result<bool, MaisonError> {
        let n = self
            .conn()?
            .execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Most recently updated first, ties broken by id.
    pub fn list_recent_memories(&self, user_id: &str, limit: usize) -> Result<Vec<Memory>, MaisonError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM memories WHERE user_id = ?1 \
             ORDER BY updated_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_memory)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Memories within cosine distance `d_max` of `query`, ascending by
    /// distance, at most `top_k`. Only the owner's rows are scanned.
    pub fn find_nearby_memories(
        &self,
        user_id: &str,
        query: &[f32],
        d_max: f64,
        top_k: usize,
    ) -> Result<Vec<ScoredMemory>, MaisonError> {
        self.check_dim(query)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM memories WHERE user_id = ?1 AND embedding IS NOT NULL",
        )?;
        let mut scored: Vec<ScoredMemory> = stmt
            .query_map(params![user_id], row_to_memory)?
            .filter_map(|r| r.ok())
            .filter_map(|m| {
                let emb = m.embedding.as_deref()?;
                let sim = cosine_similarity(query, emb);
                let distance = 1.0 - sim;
                (distance <= d_max).then_some(ScoredMemory {
                    memory: m,
                    distance,
                    similarity: sim,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Apply one extraction run's memory mutations in a single transaction.
    /// Either every write lands or none do.
    pub fn apply_memory_writes(
        &self,
        user_id: &str,
        writes: &[MemoryWrite],
    ) -> Result<WriteCounts, MaisonError> {
        for w in writes {
            match w {
                MemoryWrite::Insert { embedding, .. } | MemoryWrite::Update { embedding, .. } => {
                    self.check_dim(embedding)?
                }
                MemoryWrite::Delete { .. } => {}
            }
        }

        let conn = self.conn()?;
        conn.execute_batch("BEGIN")?;
        let mut counts = WriteCounts::default();
        let result = (|| -> Result<(), MaisonError> {
            for w in writes {
                match w {
                    MemoryWrite::Insert { content, embedding } => {
                        let now = now_ms();
                        conn.execute(
                            "INSERT INTO memories \
                             (user_id, content, embedding, metadata, created_at, updated_at) \
                             VALUES (?1, ?2, ?3, '{}', ?4, ?4)",
                            params![user_id, content, embedding_to_bytes(embedding), now],
                        )?;
                        counts.added += 1;
                    }
                    MemoryWrite::Update { id, content, embedding, updated_at } => {
                        let n = conn.execute(
                            "UPDATE memories SET content = ?1, embedding = ?2, updated_at = ?3 \
                             WHERE id = ?4 AND user_id = ?5",
                            params![content, embedding_to_bytes(embedding), updated_at, id, user_id],
                        )?;
                        counts.updated += n;
                    }
                    MemoryWrite::Delete { id } => {
                        let n = conn.execute(
                            "DELETE FROM memories WHERE id = ?1 AND user_id = ?2",
                            params![id, user_id],
                        )?;
                        counts.deleted += n;
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                Ok(counts)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}
