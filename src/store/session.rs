//! Session and message persistence. Every query carries an ownership
//! predicate: `user_id` for sessions, the session join for messages.

use rusqlite::params;

use super::{metadata_from_json, metadata_to_json, now_ms, Message, Metadata, Role, Session, Store};
use crate::error::MaisonError;

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let metadata: String = row.get("metadata")?;
    Ok(Session {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        metadata: metadata_from_json(&metadata),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let role: String = row.get("role")?;
    let metadata: String = row.get("metadata")?;
    Ok(Message {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        role: role.parse().unwrap_or(Role::User),
        content: row.get("content")?,
        metadata: metadata_from_json(&metadata),
        extracted_at: row.get("extracted_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn insert_session(&self, user_id: &str) -> Result<Session, MaisonError> {
        let now = now_ms();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (user_id, metadata, created_at, updated_at) \
             VALUES (?1, '{}', ?2, ?2)",
            params![user_id, now],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Session {
            id,
            user_id: user_id.to_string(),
            title: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn find_session(&self, session_id: i64, user_id: &str) -> Result<Option<Session>, MaisonError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM sessions WHERE id = ?1 AND user_id = ?2")?;
        let mut rows = stmt.query(params![session_id, user_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    /// Explicit deletion cascades to the session's messages.
    pub fn delete_session(&self, session_id: i64, user_id: &str) -> Result<bool, MaisonError> {
        let n = self.conn()?.execute(
            "DELETE FROM sessions WHERE id = ?1 AND user_id = ?2",
            params![session_id, user_id],
        )?;
        Ok(n > 0)
    }

    pub fn append_message(
        &self,
        session_id: i64,
        role: Role,
        content: &str,
        metadata: Option<Metadata>,
    ) -> Result<Message, MaisonError> {
        let now = now_ms();
        let metadata = metadata.unwrap_or_default();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (session_id, role, content, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![session_id, role.as_str(), content, metadata_to_json(&metadata), now],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![now, session_id],
        )?;
        Ok(Message {
            id,
            session_id,
            role,
            content: content.to_string(),
            metadata,
            extracted_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Newest first, ties broken by id so the order is total and stable.
    pub fn list_messages_by_session(
        &self,
        session_id: i64,
        limit: usize,
    ) -> Result<Vec<Message>, MaisonError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE session_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![session_id, limit as i64], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn list_messages_across_user_sessions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, MaisonError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.* FROM messages m JOIN sessions s ON m.session_id = s.id \
             WHERE s.user_id = ?1 ORDER BY m.created_at DESC, m.id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Messages still awaiting memory extraction, oldest first.
    pub fn list_pending_messages(&self, user_id: &str) -> Result<Vec<Message>, MaisonError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.* FROM messages m JOIN sessions s ON m.session_id = s.id \
             WHERE s.user_id = ?1 AND m.extracted_at IS NULL \
             ORDER BY m.created_at ASC, m.id ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn mark_messages_extracted(&self, ids: &[i64], ts: i64) -> Result<usize, MaisonError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "UPDATE messages SET extracted_at = ?1, updated_at = ?1 \
             WHERE extracted_at IS NULL AND id IN ({placeholders})"
        );
        let mut values: Vec<&dyn rusqlite::types::ToSql> = vec![&ts];
        for id in ids {
            values.push(id);
        }
        let n = conn.execute(&sql, values.as_slice())?;
        Ok(n)
    }
}
