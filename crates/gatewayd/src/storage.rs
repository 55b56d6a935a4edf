//! Shared SQLite access helper.
//!
//! Each database gets one connection behind an async mutex. Statements that
//! fail because the database is busy or locked are retried once after a
//! jittered backoff.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tokio_retry::strategy::jitter;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    /// Run `operation` against the connection, retrying once when SQLite
    /// reports the database as busy or locked.
    pub async fn with<R>(
        &self,
        operation: impl Fn(&Connection) -> rusqlite::Result<R>,
    ) -> Result<R, StorageError> {
        let conn = self.conn.lock().await;
        match operation(&conn) {
            Ok(result) => Ok(result),
            Err(error) if is_transient(&error) => {
                let backoff = std::time::Duration::from_millis(100)
                    + jitter(std::time::Duration::from_millis(1900));
                warn!("sqlite busy, retrying in {backoff:?}: {error}");
                tokio::time::sleep(backoff).await;
                Ok(operation(&conn)?)
            }
            Err(error) => Err(error.into()),
        }
    }
}

fn is_transient(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(info, _)
            if matches!(
                info.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_rows() {
        let db = Database::open_in_memory().unwrap();
        db.with(|conn| {
            conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);")
        })
        .await
        .unwrap();

        db.with(|conn| conn.execute("INSERT INTO t (name) VALUES (?1);", ["kitchen"]))
            .await
            .unwrap();

        let name: String = db
            .with(|conn| conn.query_row("SELECT name FROM t WHERE id = 1;", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(name, "kitchen");
    }

    #[tokio::test]
    async fn opens_on_disk_databases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::open(&path).unwrap();
        db.with(|conn| conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);"))
            .await
            .unwrap();
        assert!(path.exists());
    }
}
