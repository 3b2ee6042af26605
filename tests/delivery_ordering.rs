// SPDX-License-Identifier: MIT OR Apache-2.0

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{setup, RecordingListener};
use cqflux::core::config::EngineConfig;
use cqflux::core::error::FaultKind;
use cqflux::core::listener::listener_fn;
use cqflux::core::query::Condition;
use cqflux::core::transport::ChannelTransport;
use cqflux::core::{CacheError, CacheEvent, EventSource};

#[test]
fn interest_and_query_events_share_one_sequence() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    let interests = RecordingListener::new();
    let query = RecordingListener::new();
    engine.connect("c", false, None).unwrap();
    engine.add_listener("c", interests.clone()).unwrap();
    engine.register_keys("c", &["A"], false).unwrap();
    engine
        .new_cq("c", "big", Arc::new(Condition::gt("", 10i32)), false)
        .unwrap();
    engine.add_cq_listener("c", "big", query.clone()).unwrap();
    engine.execute_cq("c", "big").unwrap();

    dataset.put("A", 50i32);
    dataset.put("B", 50i32);
    dataset.put("A", 1i32);

    let report = engine.dispatch("c").unwrap();
    assert_eq!(report.delivered, 5);
    assert_eq!(report.last_sequence, Some(5));
    // One mutation fans out interest first, then query deltas
    assert_eq!(interests.sequences(), vec![1, 4]);
    assert_eq!(query.sequences(), vec![2, 3, 5]);
    assert!(query
        .events()
        .iter()
        .all(|e| e.source == EventSource::Query("big".into())));
}

#[test]
fn listener_faults_do_not_halt_dispatch() {
    let (dataset, engine, faults) = setup(EngineConfig::default());
    let seen = RecordingListener::new();
    engine.connect("c", false, None).unwrap();
    engine
        .add_listener(
            "c",
            listener_fn(|event| match event.key.as_str() {
                "bad" => Err("listener rejected event".into()),
                "boom" => panic!("listener blew up"),
                _ => Ok(()),
            }),
        )
        .unwrap();
    engine.add_listener("c", seen.clone()).unwrap();
    engine.register_all_keys("c", false).unwrap();

    dataset.put("ok-1", 1i32);
    dataset.put("bad", 1i32);
    dataset.put("boom", 1i32);
    dataset.put("ok-2", 1i32);

    let report = engine.dispatch("c").unwrap();
    assert_eq!(report.listener_faults, 2);
    assert_eq!(seen.keys(), vec!["ok-1", "bad", "boom", "ok-2"]);
    assert_eq!(faults.count_of(FaultKind::Listener), 2);
    assert_eq!(engine.queue_depth("c"), Some(0));

    // Everything was acknowledged; nothing is delivered twice
    let again = engine.dispatch("c").unwrap();
    assert_eq!(again.delivered, 0);
}

#[test]
fn full_queue_rejects_without_breaking_order() {
    let config = EngineConfig {
        queue_capacity: Some(3),
        ..Default::default()
    };
    let (dataset, engine, faults) = setup(config);
    let listener = RecordingListener::new();
    engine.connect("c", false, None).unwrap();
    engine.add_listener("c", listener.clone()).unwrap();
    engine.register_all_keys("c", false).unwrap();

    for i in 0..5i32 {
        dataset.put(format!("k{i}"), i);
    }
    assert_eq!(faults.count_of(FaultKind::Producer), 2);
    assert_eq!(engine.statistics().events_rejected, 2);

    engine.dispatch("c").unwrap();
    dataset.put("k5", 5i32);
    engine.dispatch("c").unwrap();

    assert_eq!(listener.keys(), vec!["k0", "k1", "k2", "k5"]);
    assert_eq!(listener.sequences(), vec![1, 2, 3, 4]);
}

#[test]
fn events_of_a_closed_query_are_not_delivered() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    let listener = RecordingListener::new();
    engine.connect("c", false, None).unwrap();
    engine
        .new_cq("c", "q", Arc::new(Condition::True), false)
        .unwrap();
    engine.add_cq_listener("c", "q", listener.clone()).unwrap();
    engine.execute_cq("c", "q").unwrap();
    dataset.put("A", 1i32);
    engine.close_cq("c", "q").unwrap();

    let report = engine.dispatch("c").unwrap();
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.delivered, 0);
    assert!(listener.events().is_empty());
    assert_eq!(engine.queue_depth("c"), Some(0));
}

#[test]
fn concurrent_producers_get_unique_increasing_sequences() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    engine.connect("c", false, None).unwrap();
    engine.register_all_keys("c", false).unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let dataset = Arc::clone(&dataset);
            thread::spawn(move || {
                for i in 0..250i32 {
                    dataset.put(format!("p{p}-{i}"), i);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let events: Vec<CacheEvent> = engine.drain("c").unwrap().collect();
    assert_eq!(events.len(), 1000);
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=1000).collect::<Vec<u64>>());
}

#[test]
fn drain_is_bounded_by_what_was_queued_when_it_started() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    engine.connect("c", false, None).unwrap();
    engine.register_all_keys("c", false).unwrap();
    dataset.put("A", 1i32);
    dataset.put("B", 1i32);

    let drain = engine.drain("c").unwrap();
    dataset.put("C", 1i32);
    assert!(matches!(
        engine.drain("c"),
        Err(CacheError::InvalidState { .. })
    ));
    let first: Vec<String> = drain.map(|e| e.key).collect();
    assert_eq!(first, vec!["A", "B"]);

    engine.acknowledge("c", 2).unwrap();
    let second: Vec<String> = engine.drain("c").unwrap().map(|e| e.key).collect();
    assert_eq!(second, vec!["C"]);
}

#[test]
fn unacknowledged_drain_restarts_from_last_acknowledged() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    engine.connect("c", false, None).unwrap();
    engine.register_all_keys("c", false).unwrap();
    for key in ["A", "B", "C"] {
        dataset.put(key, 1i32);
    }

    let partial: Vec<u64> = engine.drain("c").unwrap().take(2).map(|e| e.sequence).collect();
    assert_eq!(partial, vec![1, 2]);
    engine.acknowledge("c", 1).unwrap();

    let resumed: Vec<u64> = engine.drain("c").unwrap().map(|e| e.sequence).collect();
    assert_eq!(resumed, vec![2, 3]);
}

#[test]
fn channel_transport_carries_encoded_events() {
    let (dataset, engine, _faults) = setup(EngineConfig::default());
    let (transport, mut receiver) = ChannelTransport::new(None);
    engine.connect("c", false, None).unwrap();
    engine.add_listener("c", Arc::new(transport)).unwrap();
    engine.register_keys("c", &["K"], false).unwrap();

    dataset.put("K", 1i32);
    dataset.put("K", 2i32);
    engine.dispatch("c").unwrap();

    let first = receiver
        .recv_timeout(Duration::from_secs(1))
        .unwrap()
        .unwrap();
    let rest = receiver.drain().unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!(rest.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2]);
}
