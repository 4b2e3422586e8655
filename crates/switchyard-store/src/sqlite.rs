use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use switchyard_core::{Persistence, SwitchyardError, SwitchyardResult};

fn db_err(e: rusqlite::Error) -> SwitchyardError {
    SwitchyardError::Persistence(format!("SQLite error: {e}"))
}

/// Records in a single SQLite table keyed by `(collection, key)`.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> SwitchyardResult<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn in_memory() -> SwitchyardResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> SwitchyardResult<Self> {
        let store = Self {
            db: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> SwitchyardResult<()> {
        self.db
            .lock()
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS records (
                    collection TEXT NOT NULL,
                    key TEXT NOT NULL,
                    body TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (collection, key)
                );

                CREATE INDEX IF NOT EXISTS idx_records_seq ON records(collection, seq);
                ",
            )
            .map_err(db_err)
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        record: serde_json::Value,
    ) -> SwitchyardResult<()> {
        let body = serde_json::to_string(&record)?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO records (collection, key, body, seq, updated_at)
             VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(seq), 0) + 1 FROM records), ?4)
             ON CONFLICT(collection, key) DO UPDATE SET
                body = excluded.body,
                seq = excluded.seq,
                updated_at = excluded.updated_at",
            params![collection, key, body, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn fetch(
        &self,
        collection: &str,
        key: &str,
    ) -> SwitchyardResult<Option<serde_json::Value>> {
        let body: Option<String> = {
            let db = self.db.lock();
            db.query_row(
                "SELECT body FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
        };
        body.map(|b| serde_json::from_str(&b).map_err(SwitchyardError::from))
            .transpose()
    }

    async fn list(&self, collection: &str, limit: usize) -> SwitchyardResult<Vec<serde_json::Value>> {
        let bodies: Vec<String> = {
            let db = self.db.lock();
            let mut stmt = db
                .prepare(
                    "SELECT body FROM records WHERE collection = ?1 ORDER BY seq DESC LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![collection, limit as i64], |row| row.get(0))
                .map_err(db_err)?;
            rows.collect::<Result<Vec<String>, _>>().map_err(db_err)?
        };
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(SwitchyardError::from))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_upsert_and_list() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert("messages", "a", json!({"n": 1})).await.unwrap();
        store.upsert("messages", "b", json!({"n": 2})).await.unwrap();
        store.upsert("messages", "a", json!({"n": 3})).await.unwrap();
        store.upsert("events", "x", json!({"n": 9})).await.unwrap();

        assert_eq!(
            store.fetch("messages", "a").await.unwrap(),
            Some(json!({"n": 3}))
        );
        let listed = store.list("messages", 10).await.unwrap();
        assert_eq!(listed, vec![json!({"n": 3}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_sqlite_file_persists_across_opens() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("switchyard.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert("batch_results", "job1", json!({"status": "completed"})).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.fetch("batch_results", "job1").await.unwrap().is_some());
    }
}
