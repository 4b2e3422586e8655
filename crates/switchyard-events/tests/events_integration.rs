#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{EventConfig, StateConfig};
use switchyard_events::*;

fn stack() -> (Arc<EventBus>, StateStore) {
    let events = Arc::new(EventBus::new(&EventConfig::default()));
    let store = StateStore::new(&StateConfig::default(), events.clone());
    (events, store)
}

// ---------------------------------------------------------------------------
// 1. State reads return what was written
// ---------------------------------------------------------------------------

#[tokio::test]
async fn state_read_after_write_matches_except_updated_at() {
    let (_events, store) = stack();
    let mut state = AgentState::new("verifier")
        .with_status(AgentStatus::Maintenance)
        .with_task("verify-42")
        .with_capabilities(vec!["verify".into()]);
    state.progress = 0.25;
    state
        .config
        .insert("strict".into(), serde_json::Value::Bool(true));

    store.update_agent_state("verifier", state.clone()).unwrap();
    let mut read = store.agent_state("verifier").unwrap();
    assert!(read.updated_at >= state.updated_at);
    read.updated_at = state.updated_at;
    assert_eq!(read, state);
}

#[tokio::test]
async fn unknown_agent_state_is_not_found() {
    let (_events, store) = stack();
    let err = store.agent_state("ghost").unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

// ---------------------------------------------------------------------------
// 2. Bounded rings with FIFO eviction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn event_log_and_snapshots_are_bounded() {
    let (events, store) = stack();
    store.insert_initial("a", vec![]);

    for i in 0..1200 {
        events.publish(Event::new("tick", "clock").with_data("n", i));
    }
    let mut snapshot_ids = Vec::new();
    for _ in 0..130 {
        snapshot_ids.push(store.create_snapshot().id);
    }

    assert_eq!(events.len(), 1000);
    assert_eq!(events.history(0)[0].data["n"], 200);

    let history = store.state_history(0);
    assert_eq!(history.len(), 100);
    assert_eq!(history[0].id, snapshot_ids[30]);
    assert_eq!(history[99].id, snapshot_ids[129]);
    assert_eq!(store.state_history(5).len(), 5);
}

// ---------------------------------------------------------------------------
// 3. State changes reach event subscribers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn state_change_subscribers_are_notified() {
    let (events, store) = stack();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    events.subscribe(
        [types::STATE_CHANGED],
        Arc::new(handler_fn(move |e: &Event| {
            assert_eq!(e.data_str("agent_id"), Some("impl"));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })),
    );

    store
        .update_agent_state("impl", AgentState::new("impl"))
        .unwrap();
    store
        .update_agent_state("impl", AgentState::new("impl").with_task("t1"))
        .unwrap();
    store
        .update_agent_state("impl", AgentState::new("impl").with_task("t1"))
        .unwrap();

    for _ in 0..200 {
        if seen.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn multi_type_subscription() {
    let (events, _store) = stack();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    events.subscribe(
        [types::TASK_COMPLETED, types::TASK_FAILED],
        Arc::new(handler_fn(move |_e: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })),
    );
    assert_eq!(events.subscriber_count(types::TASK_FAILED), 1);

    events.publish(Event::new(types::TASK_COMPLETED, "a"));
    events.publish(Event::new(types::TASK_FAILED, "a"));
    events.publish(Event::new(types::AGENT_STARTED, "a"));

    for _ in 0..200 {
        if seen.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(events.published(), 3);
}
