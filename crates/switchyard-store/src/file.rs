use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use switchyard_core::{Persistence, SwitchyardError, SwitchyardResult};

#[derive(Serialize, Deserialize)]
struct Envelope {
    written_at: DateTime<Utc>,
    record: serde_json::Value,
}

/// JSON files on disk, one directory per collection and one file per key.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating it if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> SwitchyardResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.dir.join(file_safe(collection))
    }

    fn record_path(&self, collection: &str, key: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.json", file_safe(key)))
    }

    async fn read_envelope(path: &Path) -> SwitchyardResult<Envelope> {
        let data = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&data).map_err(|e| {
            SwitchyardError::Persistence(format!(
                "Failed to parse record '{}': {e}",
                path.display()
            ))
        })
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

#[async_trait]
impl Persistence for FileStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        record: serde_json::Value,
    ) -> SwitchyardResult<()> {
        tokio::fs::create_dir_all(self.collection_dir(collection)).await?;
        let envelope = Envelope {
            written_at: Utc::now(),
            record,
        };
        let json = serde_json::to_string_pretty(&envelope)?;
        tokio::fs::write(self.record_path(collection, key), json).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        collection: &str,
        key: &str,
    ) -> SwitchyardResult<Option<serde_json::Value>> {
        let path = self.record_path(collection, key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_envelope(&path).await?.record))
    }

    async fn list(&self, collection: &str, limit: usize) -> SwitchyardResult<Vec<serde_json::Value>> {
        let dir = self.collection_dir(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut envelopes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_envelope(&path).await {
                Ok(env) => envelopes.push(env),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        envelopes.sort_by(|a, b| b.written_at.cmp(&a.written_at));
        Ok(envelopes
            .into_iter()
            .take(limit)
            .map(|e| e.record)
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path().join("records")).await.unwrap();
        store
            .upsert("batch_jobs", "job/1", json!({"status": "queued"}))
            .await
            .unwrap();
        assert_eq!(
            store.fetch("batch_jobs", "job/1").await.unwrap(),
            Some(json!({"status": "queued"}))
        );
        assert!(store.fetch("batch_jobs", "job/2").await.unwrap().is_none());
        assert!(tmp.path().join("records/batch_jobs/job_1.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).await.unwrap();
        std::fs::create_dir_all(tmp.path().join("events")).unwrap();
        std::fs::write(tmp.path().join("events/bad.json"), "{oops").unwrap();

        let err = store.fetch("events", "bad").await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Persistence(_)));
        assert!(store.list("events", 10).await.unwrap().is_empty());
    }
}
