// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cqflux::core::config::EngineConfig;
use cqflux::core::dataset::InMemoryDataset;
use cqflux::core::engine::SubscriptionEngine;
use cqflux::core::error::FaultCollector;
use cqflux::core::listener::{EventListener, ListenerResult, QueryFault};
use cqflux::core::{CacheEvent, Operation};

pub use cqflux::core::util::init_test_logging;

/// Engine without a background reaper, attached to a fresh dataset
pub fn setup(config: EngineConfig) -> (Arc<InMemoryDataset>, Arc<SubscriptionEngine>, Arc<FaultCollector>) {
    init_test_logging();
    let dataset = Arc::new(InMemoryDataset::new());
    let faults = Arc::new(FaultCollector::new(64));
    let engine = SubscriptionEngine::builder(config, dataset.clone())
        .fault_reporter(faults.clone())
        .without_reaper()
        .build()
        .expect("engine should build");
    dataset.set_mutation_listener(&engine);
    (dataset, engine, faults)
}

/// Records everything it is handed.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<CacheEvent>>,
    errors: Mutex<Vec<QueryFault>>,
    closed: AtomicUsize,
    live: AtomicUsize,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.key).collect()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.events().into_iter().map(|e| e.sequence).collect()
    }

    pub fn operations(&self) -> Vec<(String, Operation)> {
        self.events()
            .into_iter()
            .map(|e| (e.key, e.operation))
            .collect()
    }

    pub fn errors(&self) -> Vec<QueryFault> {
        self.errors.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &CacheEvent) -> ListenerResult {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn on_error(&self, fault: &QueryFault) {
        self.errors.lock().unwrap().push(fault.clone());
    }

    fn on_close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn after_live(&self, _session: &str) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }
}
