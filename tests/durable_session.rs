// SPDX-License-Identifier: MIT OR Apache-2.0

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{setup, RecordingListener};
use cqflux::core::config::EngineConfig;
use cqflux::core::dataset::InMemoryDataset;
use cqflux::core::engine::SubscriptionEngine;
use cqflux::core::session::{CloseDisposition, SessionState};
use cqflux::core::{AttributeValue, CacheError, Operation};

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn durable_interest_survives_keep_alive_disconnect() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    engine
        .connect("durable-1", true, Some(Duration::from_secs(60)))
        .unwrap();
    engine.register_keys("durable-1", &["K"], true).unwrap();

    dataset.put("K", 1i32);
    assert_eq!(engine.queue_depth("durable-1"), Some(1));

    assert_eq!(
        engine.close("durable-1", true).unwrap(),
        CloseDisposition::Retained
    );
    assert_eq!(
        engine.session_state("durable-1"),
        Some(SessionState::DisconnectedDurable)
    );
    dataset.put("K", 2i32);
    assert_eq!(engine.queue_depth("durable-1"), Some(2));

    engine.reconnect("durable-1").unwrap();
    let listener = RecordingListener::new();
    engine.add_listener("durable-1", listener.clone()).unwrap();
    engine.mark_ready("durable-1").unwrap();
    let report = engine.dispatch("durable-1").unwrap();

    assert_eq!(report.delivered, 2);
    assert!(report.went_live);
    let events = listener.events();
    assert_eq!(
        listener.operations(),
        vec![
            ("K".to_string(), Operation::Create),
            ("K".to_string(), Operation::Update)
        ]
    );
    assert_eq!(events[0].new_value, Some(AttributeValue::Int(1)));
    assert_eq!(events[1].old_value, Some(AttributeValue::Int(1)));
    assert_eq!(events[1].new_value, Some(AttributeValue::Int(2)));
    assert_eq!(listener.live_count(), 1);
}

#[test]
fn reconnect_resumes_after_last_acknowledged_event() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    let listener = RecordingListener::new();
    engine.connect("d", true, None).unwrap();
    engine.add_listener("d", listener.clone()).unwrap();
    engine.register_all_keys("d", true).unwrap();
    engine.mark_ready("d").unwrap();

    for i in 0..3i32 {
        dataset.put(format!("k{i}"), i);
    }
    engine.dispatch("d").unwrap();
    assert_eq!(listener.sequences(), vec![1, 2, 3]);

    dataset.put("k3", 3i32);
    dataset.put("k4", 4i32);
    engine.close("d", true).unwrap();
    dataset.put("k5", 5i32);

    engine.reconnect("d").unwrap();
    // Not ready yet: nothing moves
    assert!(!engine.dispatch("d").unwrap().ready);
    assert_eq!(listener.sequences(), vec![1, 2, 3]);

    engine.mark_ready("d").unwrap();
    engine.dispatch("d").unwrap();
    assert_eq!(listener.sequences(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(engine.queue_depth("d"), Some(0));
}

#[test]
fn reconnect_after_timeout_fails_and_state_is_gone() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    engine
        .connect("d", true, Some(Duration::from_millis(30)))
        .unwrap();
    engine.register_keys("d", &["K"], true).unwrap();
    dataset.put("K", 1i32);
    engine.close("d", true).unwrap();

    thread::sleep(Duration::from_millis(60));
    assert!(matches!(
        engine.reconnect("d"),
        Err(CacheError::ExpiredSession { .. })
    ));
    assert_eq!(engine.session_state("d"), None);

    // A fresh connect starts with nothing retained
    engine.connect("d", true, None).unwrap();
    assert_eq!(engine.queue_depth("d"), Some(0));
    assert!(engine.interests_for("d").is_empty());
    dataset.put("K", 2i32);
    assert_eq!(engine.queue_depth("d"), Some(0));
}

#[test]
fn background_reaper_expires_retained_sessions() {
    common::init_test_logging();
    let config = EngineConfig {
        expiry_sweep_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let dataset = Arc::new(InMemoryDataset::new());
    let engine = SubscriptionEngine::new(config, dataset.clone()).unwrap();
    dataset.set_mutation_listener(&engine);

    engine
        .connect("d", true, Some(Duration::from_millis(20)))
        .unwrap();
    engine.close("d", true).unwrap();

    assert!(wait_until(Duration::from_secs(2), || engine
        .session_state("d")
        .is_none()));
    assert!(matches!(
        engine.reconnect("d"),
        Err(CacheError::ExpiredSession { .. })
    ));
    engine.shutdown();
}

#[test]
fn connect_rejects_active_identities() {
    let (_dataset, engine, _faults) = setup(EngineConfig::default());
    assert!(matches!(
        engine.connect("", false, None),
        Err(CacheError::Auth { .. })
    ));

    engine.connect("c", true, None).unwrap();
    assert!(matches!(
        engine.connect("c", false, None),
        Err(CacheError::Auth { .. })
    ));

    engine.close("c", true).unwrap();
    assert!(matches!(
        engine.connect("c", true, None),
        Err(CacheError::Auth { .. })
    ));
}

#[test]
fn reconnect_of_unknown_identity_is_not_found() {
    let (_dataset, engine, _faults) = setup(EngineConfig::default());
    assert!(matches!(
        engine.reconnect("nobody"),
        Err(CacheError::SessionNotFound { .. })
    ));
}

#[test]
fn keep_alive_on_non_durable_session_destroys_it() {
    let (_dataset, engine, _faults) = setup(EngineConfig::default());
    engine.connect("c", false, None).unwrap();
    assert_eq!(engine.close("c", true).unwrap(), CloseDisposition::Destroyed);
    assert_eq!(engine.session_state("c"), None);
    assert!(matches!(
        engine.reconnect("c"),
        Err(CacheError::SessionNotFound { .. })
    ));
}

#[test]
fn unregister_keeps_already_queued_events() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    engine.connect("c", false, None).unwrap();
    engine.register_keys("c", &["K"], false).unwrap();
    dataset.put("K", 1i32);
    engine.unregister_keys("c", &["K"]).unwrap();
    engine.unregister_keys("c", &["K"]).unwrap();
    dataset.put("K", 2i32);

    let listener = RecordingListener::new();
    engine.add_listener("c", listener.clone()).unwrap();
    engine.dispatch("c").unwrap();
    assert_eq!(listener.keys(), vec!["K"]);
    assert_eq!(
        listener.events()[0].new_value,
        Some(AttributeValue::Int(1))
    );
}

#[test]
fn registration_is_not_retroactive() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    engine.connect("c", false, None).unwrap();
    dataset.put("K", 1i32);
    engine.register_keys("c", &["K"], false).unwrap();
    assert_eq!(engine.queue_depth("c"), Some(0));
    dataset.put("K", 2i32);
    assert_eq!(engine.queue_depth("c"), Some(1));
}

#[test]
fn regex_interest_matches_whole_key() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    engine.connect("c", false, None).unwrap();
    engine.register_regex("c", "Key-[0-9]+", false).unwrap();
    assert!(matches!(
        engine.register_regex("c", "Key-(", false),
        Err(CacheError::InvalidParameter { .. })
    ));

    dataset.put("Key-1", 1i32);
    dataset.put("Key-x", 1i32);
    dataset.put("MyKey-2", 1i32);

    let listener = RecordingListener::new();
    engine.add_listener("c", listener.clone()).unwrap();
    engine.dispatch("c").unwrap();
    assert_eq!(listener.keys(), vec!["Key-1"]);
}

#[test]
fn auto_dispatch_worker_delivers_in_background() {
    let config = EngineConfig {
        auto_dispatch: true,
        dispatch_wait: Duration::from_millis(10),
        ..Default::default()
    };
    let (dataset, engine, _faults) = setup(config);
    let listener = RecordingListener::new();
    engine.connect("d", true, None).unwrap();
    engine.add_listener("d", listener.clone()).unwrap();
    engine.register_keys("d", &["K"], true).unwrap();
    dataset.put("K", 1i32);

    engine.mark_ready("d").unwrap();
    assert!(wait_until(Duration::from_secs(2), || listener.events().len() == 1));

    dataset.put("K", 2i32);
    assert!(wait_until(Duration::from_secs(2), || listener.events().len() == 2));
    assert_eq!(listener.sequences(), vec![1, 2]);

    engine.close("d", false).unwrap();
    engine.shutdown();
}

#[test]
fn unbounded_timeout_retains_session_until_reconnect() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    engine
        .connect("d", true, Some(Duration::MAX))
        .unwrap();
    engine.register_keys("d", &["K"], true).unwrap();
    assert_eq!(
        engine.close("d", true).unwrap(),
        CloseDisposition::Retained
    );

    dataset.put("K", 1i32);
    assert!(engine.expire_overdue().is_empty());
    assert_eq!(
        engine.session_state("d"),
        Some(SessionState::DisconnectedDurable)
    );

    engine.reconnect("d").unwrap();
    engine.mark_ready("d").unwrap();
    let listener = RecordingListener::new();
    engine.add_listener("d", listener.clone()).unwrap();
    engine.dispatch("d").unwrap();
    assert_eq!(listener.keys(), vec!["K"]);

    // The session table is still usable by other identities
    engine.connect("other", false, None).unwrap();
    assert_eq!(engine.session_ids().len(), 2);
}
