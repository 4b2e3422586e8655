#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use std::sync::Arc;
use switchyard_core::persistence::{BATCH_RESULTS, MESSAGES};
use switchyard_core::Persistence;
use switchyard_store::{FileStore, MemoryStore};

async fn exercise(store: Arc<dyn Persistence>) {
    store
        .upsert(MESSAGES, "msg_1", json!({"id": "msg_1", "status": "queued"}))
        .await
        .unwrap();
    store
        .upsert(MESSAGES, "msg_1", json!({"id": "msg_1", "status": "delivered"}))
        .await
        .unwrap();
    store
        .upsert(BATCH_RESULTS, "job_1", json!({"status": "completed"}))
        .await
        .unwrap();

    let msg = store.fetch(MESSAGES, "msg_1").await.unwrap().unwrap();
    assert_eq!(msg["status"], "delivered");
    assert_eq!(store.list(MESSAGES, 10).await.unwrap().len(), 1);
    assert!(store.fetch(MESSAGES, "msg_2").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// 1. Every store honors the same contract through a trait object
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memory_store_contract() {
    exercise(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn file_store_contract() {
    let tmp = tempfile::tempdir().unwrap();
    exercise(Arc::new(FileStore::new(tmp.path()).await.unwrap())).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_store_contract() {
    exercise(Arc::new(switchyard_store::SqliteStore::in_memory().unwrap())).await;
}

// ---------------------------------------------------------------------------
// 2. List limits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_respects_limit() {
    let store = MemoryStore::new();
    for i in 0..20 {
        store
            .upsert("events", &format!("evt_{i}"), json!({ "n": i }))
            .await
            .unwrap();
    }
    let recent = store.list("events", 5).await.unwrap();
    assert_eq!(recent.len(), 5);
    assert_eq!(recent[0]["n"], 19);
    assert!(store.list("events", 0).await.unwrap().is_empty());
}
