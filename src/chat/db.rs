use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_rusqlite::params;

use super::models::Turn;
use crate::core::db::{async_db, initialize_db};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("History store at {} failed: {source}", .path.display())]
    Store {
        path: PathBuf,
        source: tokio_rusqlite::Error,
    },
}

/// Durable, append-only log of conversation turns backed by a
/// `history` table in SQLite.
///
/// There is no connection held between calls. Every operation opens
/// the database, runs a single `call`, and closes the connection again
/// whether or not the call succeeded.
#[derive(Clone, Debug)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn err(&self, source: tokio_rusqlite::Error) -> PersistenceError {
        PersistenceError::Store {
            path: self.path.clone(),
            source,
        }
    }

    async fn with_connection<F, R>(&self, function: F) -> Result<R, PersistenceError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, tokio_rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let db = async_db(&self.path.to_string_lossy())
            .await
            .map_err(|e| self.err(e))?;
        let result = db.call(function).await;
        if let Err(e) = db.close().await {
            tracing::warn!("Failed to close history store {}: {}", self.path.display(), e);
        }
        result.map_err(|e| self.err(e))
    }

    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        self.with_connection(|conn| {
            initialize_db(conn)?;
            Ok(())
        })
        .await
    }

    /// Inserts the turn and returns the sequence number assigned to it
    pub async fn append(&self, turn: &Turn) -> Result<i64, PersistenceError> {
        let turn = turn.clone();
        tracing::debug!(
            "Storing turn model={} max_tokens={} role={}",
            turn.model,
            turn.max_tokens,
            turn.role
        );
        self.with_connection(move |conn| {
            initialize_db(conn)?;
            conn.execute(
                "INSERT INTO history (model, max_tokens, role, content) VALUES (?1, ?2, ?3, ?4)",
                params![turn.model, turn.max_tokens, turn.role, turn.content],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// All stored turns in the order they were inserted
    pub async fn load_all(&self) -> Result<Vec<Turn>, PersistenceError> {
        self.with_connection(|conn| {
            initialize_db(conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, model, max_tokens, role, content FROM history ORDER BY id ASC",
            )?;
            let turns = stmt
                .query_map([], |row| {
                    Ok(Turn {
                        sequence: Some(row.get(0)?),
                        model: row.get(1)?,
                        max_tokens: row.get(2)?,
                        role: row.get(3)?,
                        content: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<Turn>, rusqlite::Error>>()?;
            Ok(turns)
        })
        .await
    }

    /// Deletes a single turn. Returns whether a row was removed.
    pub async fn remove(&self, sequence: i64) -> Result<bool, PersistenceError> {
        self.with_connection(move |conn| {
            initialize_db(conn)?;
            let deleted = conn.execute("DELETE FROM history WHERE id = ?1", [sequence])?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), PersistenceError> {
        self.with_connection(|conn| {
            initialize_db(conn)?;
            conn.execute("DELETE FROM history", [])?;
            Ok(())
        })
        .await
    }
}
