#![allow(clippy::unwrap_used, clippy::expect_used)]

use switchyard_core::*;

// ---------------------------------------------------------------------------
// 1. Identifier helpers
// ---------------------------------------------------------------------------

#[test]
fn ensure_id_fills_only_empty_ids() {
    let mut empty = String::new();
    ensure_id(&mut empty, "msg");
    assert!(empty.starts_with("msg_"));
    assert!(empty.len() > 4);

    let mut given = "custom-1".to_string();
    ensure_id(&mut given, "msg");
    assert_eq!(given, "custom-1");

    assert_ne!(new_id("evt"), new_id("evt"));
}

// ---------------------------------------------------------------------------
// 2. Priority serialization matches config/wire names
// ---------------------------------------------------------------------------

#[test]
fn priority_serializes_lowercase() {
    let json = serde_json::to_string(&Priority::Critical).unwrap();
    assert_eq!(json, "\"critical\"");
    let parsed: Priority = serde_json::from_str("\"low\"").unwrap();
    assert_eq!(parsed, Priority::Low);
}

// ---------------------------------------------------------------------------
// 3. Error conversions
// ---------------------------------------------------------------------------

#[test]
fn json_errors_convert() {
    fn parse(raw: &str) -> SwitchyardResult<serde_json::Value> {
        Ok(serde_json::from_str(raw)?)
    }
    let err = parse("{not json").unwrap_err();
    assert!(matches!(err, SwitchyardError::Json(_)));
    assert!(err.to_string().starts_with("JSON error"));
}

#[test]
fn io_errors_convert() {
    fn open() -> SwitchyardResult<String> {
        Ok(std::fs::read_to_string("/nonexistent/switchyard")?)
    }
    assert!(matches!(open().unwrap_err(), SwitchyardError::Io(_)));
}

// ---------------------------------------------------------------------------
// 4. Full config document
// ---------------------------------------------------------------------------

#[test]
fn full_config_document_parses() {
    let raw = r#"
        [bus]
        workers = 4
        queue_capacity = 50
        default_max_retries = 1
        history_limit = 10
        health_check_interval_secs = 5
        shutdown_grace_ms = 100

        [events]
        log_capacity = 20
        notifier_workers = 2
        dispatch_queue = 16

        [state]
        snapshot_limit = 5
        snapshot_interval_secs = 2

        [batch]
        workers = 2
        max_concurrent_jobs = 1
        default_batch_size = 10
        queue_capacity = 10
        dispatch_tick_ms = 10
        poll_interval_ms = 5
        sync_timeout_secs = 1

        [scheduler]
        tick_secs = 1
    "#;
    let config = SwitchyardConfig::from_toml_str(raw).unwrap();
    assert_eq!(config.bus.history_limit, 10);
    assert_eq!(config.events.dispatch_queue, 16);
    assert_eq!(config.state.snapshot_limit, 5);
    assert_eq!(config.batch.sync_timeout().as_secs(), 1);
    assert_eq!(config.scheduler.tick_secs, 1);
}
