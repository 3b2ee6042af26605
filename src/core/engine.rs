// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subscription engine
//!
//! [`SubscriptionEngine`] owns the session table, interest registry, query
//! service, event queues and dispatcher, and is the dataset's mutation
//! listener. Applications attach it to a dataset once:
//!
//! ```rust,ignore
//! let dataset = Arc::new(InMemoryDataset::new());
//! let engine = SubscriptionEngine::new(EngineConfig::default(), dataset.clone())?;
//! dataset.set_mutation_listener(&engine);
//! ```
//!
//! Lock order: dataset, then session table, then session mutex, then the
//! registry, query map and queue locks. Session teardown runs under the table
//! lock; continuous query `on_close` callbacks and delivery worker joins are
//! deferred until it is released. Query evaluation faults reach `on_error`
//! listeners from `after_mutate`, once the dataset lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::core::config::EngineConfig;
use crate::core::dataset::{Dataset, MutationListener};
use crate::core::dispatch::{DeliveryDispatcher, DeliveryWorker, DispatchReport};
use crate::core::error::{CacheError, CacheResult, Fault, FaultKind, FaultReporter, LoggingFaultReporter};
use crate::core::event::{CacheEvent, EventSource, Mutation};
use crate::core::interest::{Interest, InterestRegistry};
use crate::core::listener::{EventListener, QueryFault};
use crate::core::persistence::{DurableQueryRecord, DurableSessionRecord, SessionStore};
use crate::core::query::{
    ContinuousQuery, CqResults, Evaluation, Predicate, QueryEvaluation, QueryService,
    QueryServiceStatistics,
};
use crate::core::queue::{Drain, EnqueueOutcome, EventQueueStore, SubscriptionLookup};
use crate::core::session::{
    ClientSession, CloseDisposition, ExpiryReaper, ExpirySweep, SessionManager, SessionState,
};
use crate::core::util::health::{HealthCheck, HealthChecker, HealthStatus};
use crate::core::util::shutdown::ShutdownCoordinator;

const COMPONENT: &str = "subscription-engine";

/// Routes the queue store's subscription check to the registry and the
/// query service.
struct RegistryLookup {
    interests: Arc<InterestRegistry>,
    queries: Arc<QueryService>,
}

impl SubscriptionLookup for RegistryLookup {
    fn accepts(&self, session: &str, event: &CacheEvent) -> bool {
        match &event.source {
            EventSource::Interest => self.interests.is_interested(session, &event.key),
            EventSource::Query(name) => self.queries.contains(session, name),
        }
    }
}

/// Work collected under the session table lock and finished after it is
/// released.
#[derive(Default)]
struct Teardown {
    queries: Vec<Arc<ContinuousQuery>>,
    workers: Vec<DeliveryWorker>,
}

impl Teardown {
    fn finish(self, queries: &QueryService) {
        queries.close_queries(self.queries);
        for mut worker in self.workers {
            worker.stop();
        }
    }
}

/// Engine-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub sessions: usize,
    pub connected: usize,
    pub retained: usize,
    /// Undelivered events across all queues
    pub queued_events: usize,
    /// Events dropped because the session held no matching subscription
    pub events_dropped: u64,
    /// Events rejected by a full queue or a closed queue
    pub events_rejected: u64,
    pub queries: QueryServiceStatistics,
}

pub struct EngineBuilder {
    config: EngineConfig,
    dataset: Arc<dyn Dataset>,
    faults: Option<Arc<dyn FaultReporter>>,
    store: Option<Arc<dyn SessionStore>>,
    start_reaper: bool,
}

impl EngineBuilder {
    pub fn fault_reporter(mut self, faults: Arc<dyn FaultReporter>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Persist durable session records to `store`.
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Skip the background expiry reaper; overdue sessions are then only
    /// destroyed by [`SubscriptionEngine::expire_overdue`] or on access.
    pub fn without_reaper(mut self) -> Self {
        self.start_reaper = false;
        self
    }

    pub fn build(self) -> CacheResult<Arc<SubscriptionEngine>> {
        self.config.validate()?;

        let faults = self
            .faults
            .unwrap_or_else(|| Arc::new(LoggingFaultReporter) as Arc<dyn FaultReporter>);
        let sessions = Arc::new(SessionManager::new(self.config.durable_timeout));
        let interests = Arc::new(InterestRegistry::new());
        let queries = Arc::new(QueryService::with_fault_reporter(Arc::clone(&faults)));
        let lookup = Arc::new(RegistryLookup {
            interests: Arc::clone(&interests),
            queries: Arc::clone(&queries),
        });
        let queues = Arc::new(EventQueueStore::new(self.config.queue_capacity, lookup));
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            Arc::clone(&queues),
            Arc::clone(&sessions),
            Arc::clone(&queries),
            Arc::clone(&faults),
        ));

        let engine = Arc::new(SubscriptionEngine {
            config: self.config,
            dataset: self.dataset,
            sessions,
            interests,
            queries,
            queues,
            dispatcher,
            faults,
            store: self.store,
            workers: Mutex::new(HashMap::new()),
            pending_faults: Mutex::new(Vec::new()),
            reaper: Mutex::new(None),
            shutdown: ShutdownCoordinator::new(),
            dropped: CachePadded::new(AtomicU64::new(0)),
            rejected: CachePadded::new(AtomicU64::new(0)),
        });

        if self.start_reaper {
            engine.start_expiry_reaper()?;
        }
        log::info!(
            "subscription engine started (durable timeout {:?}, queue capacity {:?})",
            engine.config.durable_timeout,
            engine.config.queue_capacity
        );
        Ok(engine)
    }
}

pub struct SubscriptionEngine {
    config: EngineConfig,
    dataset: Arc<dyn Dataset>,
    sessions: Arc<SessionManager>,
    interests: Arc<InterestRegistry>,
    queries: Arc<QueryService>,
    queues: Arc<EventQueueStore>,
    dispatcher: Arc<DeliveryDispatcher>,
    faults: Arc<dyn FaultReporter>,
    store: Option<Arc<dyn SessionStore>>,
    workers: Mutex<HashMap<String, DeliveryWorker>>,
    /// Query faults raised under the dataset lock, handed to `on_error`
    /// listeners in `after_mutate`
    pending_faults: Mutex<Vec<(Arc<ContinuousQuery>, QueryFault)>>,
    reaper: Mutex<Option<ExpiryReaper>>,
    shutdown: ShutdownCoordinator,
    dropped: CachePadded<AtomicU64>,
    rejected: CachePadded<AtomicU64>,
}

impl std::fmt::Debug for SubscriptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEngine")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .field("queues", &self.queues.len())
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl SubscriptionEngine {
    pub fn builder(config: EngineConfig, dataset: Arc<dyn Dataset>) -> EngineBuilder {
        EngineBuilder {
            config,
            dataset,
            faults: None,
            store: None,
            start_reaper: true,
        }
    }

    /// Engine with logging fault reporting, no persistence and a running
    /// expiry reaper.
    pub fn new(config: EngineConfig, dataset: Arc<dyn Dataset>) -> CacheResult<Arc<Self>> {
        Self::builder(config, dataset).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- sessions ----

    /// Open a session and its event queue. See [`SessionManager::connect`].
    pub fn connect(
        &self,
        identity: &str,
        durable: bool,
        timeout: Option<Duration>,
    ) -> CacheResult<Arc<ClientSession>> {
        self.ensure_running()?;
        let mut teardown = Teardown::default();
        let connected = self
            .sessions
            .connect(identity, durable, timeout, |stale| {
                self.destroy_state(stale, &mut teardown)
            });
        teardown.finish(&self.queries);
        let session = connected?;

        self.queues.create_queue(identity);
        if self.config.auto_dispatch && session.is_ready() {
            self.start_worker(identity)?;
        }
        Ok(session)
    }

    /// Let delivery begin. With `auto-dispatch` a delivery worker takes over
    /// the session; otherwise the application calls [`dispatch`](Self::dispatch).
    pub fn mark_ready(&self, identity: &str) -> CacheResult<()> {
        self.sessions.mark_ready(identity)?;
        if self.config.auto_dispatch {
            self.start_worker(identity)?;
        }
        Ok(())
    }

    /// Close a connected session, retaining it when `keep_alive` is set and
    /// it is durable.
    ///
    /// A retained session drops its non-durable interests and queries and,
    /// with a session store configured, writes its record.
    pub fn close(&self, identity: &str, keep_alive: bool) -> CacheResult<CloseDisposition> {
        let mut teardown = Teardown::default();
        let closed = self
            .sessions
            .close(identity, keep_alive, |session, disposition| match disposition {
                CloseDisposition::Retained => self.retain_state(session, &mut teardown),
                CloseDisposition::Destroyed => self.destroy_state(session.id(), &mut teardown),
            });
        teardown.finish(&self.queries);
        closed
    }

    /// Resume a retained durable session from its last acknowledged event.
    /// The session is not ready until [`mark_ready`](Self::mark_ready).
    ///
    /// After the retention timeout this fails with `ExpiredSession` and the
    /// retained state is gone; the client must [`connect`](Self::connect)
    /// again for a fresh session.
    pub fn reconnect(&self, identity: &str) -> CacheResult<Arc<ClientSession>> {
        self.ensure_running()?;
        let mut teardown = Teardown::default();
        let resumed = self
            .sessions
            .reconnect(identity, |expired| self.destroy_state(expired, &mut teardown));
        teardown.finish(&self.queries);
        resumed
    }

    /// Destroy every retained session past its deadline.
    pub fn expire_overdue(&self) -> Vec<String> {
        let mut teardown = Teardown::default();
        let expired = self
            .sessions
            .expire_overdue(Instant::now(), |identity| {
                self.destroy_state(identity, &mut teardown)
            });
        teardown.finish(&self.queries);
        expired
    }

    pub fn session(&self, identity: &str) -> Option<Arc<ClientSession>> {
        self.sessions.session(identity)
    }

    pub fn session_state(&self, identity: &str) -> Option<SessionState> {
        self.sessions.session_state(identity)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.session_ids()
    }

    /// Register a listener for the session's interest events.
    pub fn add_listener(&self, identity: &str, listener: Arc<dyn EventListener>) -> CacheResult<()> {
        self.sessions.add_listener(identity, listener)
    }

    // ---- interests ----

    pub fn register_keys<K: AsRef<str>>(
        &self,
        identity: &str,
        keys: &[K],
        durable: bool,
    ) -> CacheResult<()> {
        self.require_connected(identity)?;
        self.interests.register_keys(identity, keys, durable)
    }

    pub fn unregister_keys<K: AsRef<str>>(&self, identity: &str, keys: &[K]) -> CacheResult<()> {
        self.require_session(identity)?;
        self.interests.unregister_keys(identity, keys);
        Ok(())
    }

    pub fn register_regex(&self, identity: &str, pattern: &str, durable: bool) -> CacheResult<()> {
        self.require_connected(identity)?;
        self.interests.register_regex(identity, pattern, durable)
    }

    pub fn unregister_regex(&self, identity: &str, pattern: &str) -> CacheResult<()> {
        self.require_session(identity)?;
        self.interests.unregister_regex(identity, pattern);
        Ok(())
    }

    pub fn register_all_keys(&self, identity: &str, durable: bool) -> CacheResult<()> {
        self.require_connected(identity)?;
        self.interests.register_all_keys(identity, durable);
        Ok(())
    }

    pub fn unregister_all_keys(&self, identity: &str) -> CacheResult<()> {
        self.require_session(identity)?;
        self.interests.unregister_all_keys(identity);
        Ok(())
    }

    pub fn interests_for(&self, identity: &str) -> Vec<Interest> {
        self.interests.interests_for(identity)
    }

    // ---- continuous queries ----

    pub fn new_cq(
        &self,
        identity: &str,
        name: &str,
        predicate: Arc<dyn Predicate>,
        durable: bool,
    ) -> CacheResult<Arc<ContinuousQuery>> {
        let session = self.require_connected(identity)?;
        if durable && !session.is_durable() {
            return Err(CacheError::invalid_parameter_named(
                format!("durable continuous query '{name}' needs a durable session"),
                "durable",
            ));
        }
        self.queries.new_cq(identity, name, predicate, durable)
    }

    pub fn execute_cq(&self, identity: &str, name: &str) -> CacheResult<()> {
        self.require_connected(identity)?;
        self.queries.execute(identity, name, self.dataset.as_ref())
    }

    pub fn execute_cq_with_initial_results(&self, identity: &str, name: &str) -> CacheResult<CqResults> {
        self.require_connected(identity)?;
        self.queries
            .execute_with_initial_results(identity, name, self.dataset.as_ref())
    }

    pub fn stop_cq(&self, identity: &str, name: &str) -> CacheResult<()> {
        self.queries.stop(identity, name)
    }

    pub fn close_cq(&self, identity: &str, name: &str) -> CacheResult<()> {
        self.queries.close(identity, name)
    }

    pub fn get_cq(&self, identity: &str, name: &str) -> CacheResult<Arc<ContinuousQuery>> {
        self.queries.get_cq(identity, name)
    }

    pub fn add_cq_listener(
        &self,
        identity: &str,
        name: &str,
        listener: Arc<dyn EventListener>,
    ) -> CacheResult<()> {
        self.queries.add_listener(identity, name, listener)
    }

    pub fn cq_names(&self, identity: &str) -> Vec<String> {
        self.queries.cq_names(identity)
    }

    pub fn durable_cq_names(&self, identity: &str) -> Vec<String> {
        self.queries.durable_cq_names(identity)
    }

    pub fn cq_statistics(&self) -> QueryServiceStatistics {
        self.queries.statistics()
    }

    // ---- delivery ----

    /// Deliver everything currently queued for `identity`. A session that
    /// is not ready yields a report with `ready == false`.
    pub fn dispatch(&self, identity: &str) -> CacheResult<DispatchReport> {
        self.dispatcher.dispatch(identity)
    }

    /// One dispatch pass over every ready session. Sessions whose queue is
    /// held by another reader are skipped.
    pub fn dispatch_all(&self) -> Vec<(String, DispatchReport)> {
        let mut reports = Vec::new();
        for session in self.sessions.sessions() {
            if !session.is_ready() {
                continue;
            }
            match self.dispatcher.dispatch(session.id()) {
                Ok(report) => reports.push((session.id().to_string(), report)),
                Err(e) => log::debug!("[{}] skipped in dispatch pass: {e}", session.id()),
            }
        }
        reports
    }

    /// Pull a ready session's queued events directly, bypassing listeners.
    /// Delivered events must be acknowledged with [`acknowledge`](Self::acknowledge).
    pub fn drain(&self, identity: &str) -> CacheResult<Drain> {
        let session = self.require_session(identity)?;
        if !session.is_ready() {
            return Err(CacheError::invalid_state(format!(
                "session '{identity}' is not ready for events"
            )));
        }
        self.queues.drain(identity)
    }

    pub fn acknowledge(&self, identity: &str, sequence: u64) -> CacheResult<()> {
        self.queues.acknowledge(identity, sequence)
    }

    pub fn queue_depth(&self, identity: &str) -> Option<usize> {
        self.queues.queue(identity).map(|queue| queue.len())
    }

    // ---- persistence ----

    /// Write the durable session's record to the session store.
    pub fn checkpoint(&self, identity: &str) -> CacheResult<()> {
        let store = self.require_store()?;
        let session = self.require_session(identity)?;
        if !session.is_durable() {
            return Err(CacheError::invalid_parameter(format!(
                "session '{identity}' is not durable and has no record"
            )));
        }
        store.save(&self.session_record(&session)?)
    }

    /// Rebuild every stored durable session as `DisconnectedDurable` with a
    /// fresh retention deadline. Records for identities already active are
    /// left alone. Returns the recovered identities.
    pub fn recover(&self) -> CacheResult<Vec<String>> {
        let store = self.require_store()?;
        let now = Instant::now();
        let mut recovered = Vec::new();

        for record in store.load_all()? {
            let identity = record.session_id.clone();
            if self.sessions.session(&identity).is_some() {
                log::warn!("[{identity}] already active, stored record not recovered");
                continue;
            }
            if let Err(e) = self.install_record(record, now) {
                self.interests.remove_session(&identity);
                self.queries.close_session_queries(&identity);
                self.queues.remove_queue(&identity);
                self.report(
                    Fault::new(FaultKind::Persistence, format!("recovery failed: {e}"))
                        .with_session(&identity),
                );
                continue;
            }
            recovered.push(identity);
        }

        if !recovered.is_empty() {
            log::info!("recovered {} durable session(s)", recovered.len());
        }
        Ok(recovered)
    }

    fn install_record(&self, record: DurableSessionRecord, now: Instant) -> CacheResult<()> {
        let identity = record.session_id.as_str();
        let timeout = record.timeout();
        let pending = record.pending_events();

        self.queues.restore_queue(identity, record.queue)?;
        self.interests.restore(identity, &record.interests)?;
        for query in record.queries {
            self.queries
                .restore(identity, &query.name, query.condition, query.matching_keys);
        }
        self.sessions
            .install_recovered(Arc::new(ClientSession::recovered(identity, timeout, now)))?;
        log::info!("[{identity}] recovered with {pending} undelivered event(s)");
        Ok(())
    }

    fn session_record(&self, session: &ClientSession) -> CacheResult<DurableSessionRecord> {
        let identity = session.id();
        let queue = self
            .queues
            .queue(identity)
            .ok_or_else(|| CacheError::session_not_found(identity))?;
        let queries = self
            .queries
            .durable_queries(identity)
            .into_iter()
            .filter_map(|query| {
                query.condition().cloned().map(|condition| DurableQueryRecord {
                    name: query.name().to_string(),
                    condition,
                    matching_keys: query.matching_keys(),
                })
            })
            .collect();
        Ok(DurableSessionRecord::new(
            identity,
            session.timeout(),
            queue.snapshot(),
            self.interests.durable_interests(identity),
            queries,
        ))
    }

    fn persist(&self, session: &ClientSession) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = self
            .session_record(session)
            .and_then(|record| store.save(&record))
        {
            self.report(
                Fault::new(FaultKind::Persistence, format!("failed to write session record: {e}"))
                    .with_session(session.id()),
            );
        }
    }

    // ---- lifecycle ----

    /// Start the background reaper if it is not already running.
    pub fn start_expiry_reaper(self: &Arc<Self>) -> CacheResult<()> {
        let mut reaper = self.reaper.lock().expect("expiry reaper lock poisoned");
        if reaper.as_ref().is_some_and(|r| r.is_running()) {
            return Ok(());
        }
        *reaper = Some(ExpiryReaper::start(
            Arc::downgrade(self),
            self.config.expiry_sweep_interval,
        )?);
        Ok(())
    }

    /// Stop background threads. Sessions, queues and stored records are left
    /// as they are; later `connect` and `reconnect` calls fail.
    pub fn shutdown(&self) {
        if self.shutdown.is_shutdown() {
            return;
        }
        self.shutdown.shutdown();
        let reaper = self.reaper.lock().expect("expiry reaper lock poisoned").take();
        drop(reaper);
        let workers: Vec<DeliveryWorker> = self.workers().drain().map(|(_, w)| w).collect();
        for mut worker in workers {
            worker.stop();
        }
        log::info!("subscription engine shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    pub fn statistics(&self) -> EngineStatistics {
        let mut stats = EngineStatistics {
            events_dropped: self.dropped.load(Ordering::Relaxed),
            events_rejected: self.rejected.load(Ordering::Relaxed),
            queries: self.queries.statistics(),
            ..Default::default()
        };
        for session in self.sessions.sessions() {
            stats.sessions += 1;
            match session.state() {
                SessionState::Connected => stats.connected += 1,
                SessionState::DisconnectedDurable => stats.retained += 1,
                SessionState::Expired => {}
            }
        }
        stats.queued_events = self.queues.depths().iter().map(|(_, depth)| depth).sum();
        stats
    }

    /// Statistics as pretty-printed JSON, for diagnostics endpoints.
    pub fn statistics_json(&self) -> CacheResult<String> {
        serde_json::to_string_pretty(&self.statistics())
            .map_err(|e| CacheError::other(format!("failed to render statistics: {e}")))
    }

    pub fn health(&self) -> HealthCheck {
        if self.shutdown.is_shutdown() {
            return HealthCheck::new(COMPONENT, HealthStatus::Unhealthy, "engine is shut down");
        }
        let reaper_stopped = self
            .reaper
            .lock()
            .expect("expiry reaper lock poisoned")
            .as_ref()
            .is_some_and(|r| !r.is_running());
        if reaper_stopped {
            return HealthCheck::new(
                COMPONENT,
                HealthStatus::Unhealthy,
                "session expiry reaper is not running",
            );
        }

        let threshold = self.config.lag_warning_threshold;
        let mut lagging: Vec<String> = self
            .queues
            .depths()
            .into_iter()
            .filter(|(_, depth)| *depth as u64 >= threshold)
            .map(|(session, depth)| format!("{session}={depth}"))
            .collect();
        if !lagging.is_empty() {
            lagging.sort();
            return HealthCheck::new(
                COMPONENT,
                HealthStatus::Degraded,
                &format!("lagging sessions (>= {threshold} queued): {}", lagging.join(", ")),
            );
        }
        let stats = self.statistics();
        HealthCheck::new(
            COMPONENT,
            HealthStatus::Healthy,
            &format!(
                "{} session(s), {} queued event(s)",
                stats.sessions, stats.queued_events
            ),
        )
    }

    /// A checker for a [`HealthAggregator`](crate::core::util::health::HealthAggregator).
    pub fn health_checker(self: &Arc<Self>) -> EngineHealthChecker {
        EngineHealthChecker {
            engine: Arc::downgrade(self),
        }
    }

    // ---- internals ----

    fn ensure_running(&self) -> CacheResult<()> {
        if self.shutdown.is_shutdown() {
            return Err(CacheError::invalid_state("subscription engine is shut down"));
        }
        Ok(())
    }

    fn require_session(&self, identity: &str) -> CacheResult<Arc<ClientSession>> {
        self.sessions
            .session(identity)
            .ok_or_else(|| CacheError::session_not_found(identity))
    }

    fn require_connected(&self, identity: &str) -> CacheResult<Arc<ClientSession>> {
        let session = self.require_session(identity)?;
        match session.state() {
            SessionState::Connected => Ok(session),
            state => Err(CacheError::invalid_state(format!(
                "session '{identity}' is {state}"
            ))),
        }
    }

    fn require_store(&self) -> CacheResult<&Arc<dyn SessionStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| CacheError::invalid_state("no session store configured"))
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, DeliveryWorker>> {
        self.workers.lock().expect("delivery worker table poisoned")
    }

    fn start_worker(&self, identity: &str) -> CacheResult<()> {
        let mut workers = self.workers();
        if workers.get(identity).is_some_and(|w| w.is_running()) {
            return Ok(());
        }
        let worker = DeliveryWorker::start(
            Arc::clone(&self.dispatcher),
            identity,
            self.config.dispatch_wait,
        )?;
        // A finished worker joins immediately
        if let Some(mut previous) = workers.insert(identity.to_string(), worker) {
            previous.stop();
        }
        Ok(())
    }

    /// Runs under the session table lock.
    fn retain_state(&self, session: &ClientSession, teardown: &mut Teardown) {
        let identity = session.id();
        self.interests.remove_non_durable(identity);
        teardown
            .queries
            .extend(self.queries.remove_non_durable(identity));
        if let Some(worker) = self.workers().remove(identity) {
            teardown.workers.push(worker);
        }
        self.persist(session);
    }

    /// Runs under the session table lock.
    fn destroy_state(&self, identity: &str, teardown: &mut Teardown) {
        self.queues.remove_queue(identity);
        self.interests.remove_session(identity);
        teardown
            .queries
            .extend(self.queries.remove_session_queries(identity));
        self.dispatcher.forget(identity);
        if let Some(worker) = self.workers().remove(identity) {
            teardown.workers.push(worker);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(identity) {
                self.report(
                    Fault::new(FaultKind::Persistence, format!("failed to delete session record: {e}"))
                        .with_session(identity),
                );
            }
        }
    }

    /// Queue one event, turning producer-side failures into faults.
    /// Returns whether the event was queued.
    fn enqueue(&self, identity: &str, event: CacheEvent) -> bool {
        let key = event.key.clone();
        let operation = event.operation;
        match self.queues.enqueue(identity, event) {
            Ok(EnqueueOutcome::Queued(_)) => true,
            Ok(EnqueueOutcome::Dropped) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.report(
                    Fault::new(
                        FaultKind::Producer,
                        format!("dropped {operation} on key '{key}': {e}"),
                    )
                    .with_session(identity),
                );
                false
            }
        }
    }

    fn report(&self, fault: Fault) {
        self.faults.report(fault);
    }
}

impl MutationListener for SubscriptionEngine {
    fn on_mutate(&self, mutation: &Mutation) {
        let mut touched = Vec::new();

        for identity in self.interests.matching_sessions(&mutation.key) {
            if self.enqueue(&identity, CacheEvent::from_mutation(mutation)) {
                touched.push(identity);
            }
        }

        for QueryEvaluation { query, evaluation } in self.queries.evaluate_mutation(mutation) {
            match evaluation {
                Evaluation::Delta(event) => {
                    if self.enqueue(query.session(), event) {
                        touched.push(query.session().to_string());
                    }
                }
                Evaluation::Fault(fault) => {
                    self.report(
                        Fault::new(FaultKind::Query, fault.to_string())
                            .with_session(&fault.session)
                            .with_query(&fault.query),
                    );
                    self.pending_faults
                        .lock()
                        .expect("pending fault list poisoned")
                        .push((query, fault));
                }
                Evaluation::Inactive | Evaluation::NoChange => {}
            }
        }

        if !self.config.checkpoint_on_enqueue || self.store.is_none() {
            return;
        }
        touched.sort();
        touched.dedup();
        for identity in touched {
            if let Some(session) = self.sessions.session(&identity) {
                if session.state() == SessionState::DisconnectedDurable {
                    self.persist(&session);
                }
            }
        }
    }

    fn after_mutate(&self) {
        let faults = std::mem::take(
            &mut *self
                .pending_faults
                .lock()
                .expect("pending fault list poisoned"),
        );
        if !faults.is_empty() {
            self.queries.notify_faults(faults);
        }
    }
}

impl ExpirySweep for SubscriptionEngine {
    fn sweep_expired(&self) -> usize {
        self.expire_overdue().len()
    }
}

impl Drop for SubscriptionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Health checker holding only a weak reference to the engine.
pub struct EngineHealthChecker {
    engine: Weak<SubscriptionEngine>,
}

impl HealthChecker for EngineHealthChecker {
    fn check(&self) -> HealthCheck {
        match self.engine.upgrade() {
            Some(engine) => engine.health(),
            None => HealthCheck::new(COMPONENT, HealthStatus::Unhealthy, "engine has been dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::InMemoryDataset;
    use crate::core::error::FaultCollector;
    use crate::core::event::{AttributeValue, Operation};
    use crate::core::listener::listener_fn;
    use crate::core::persistence::InMemorySessionStore;
    use crate::core::query::Condition;

    fn engine_with(config: EngineConfig) -> (Arc<InMemoryDataset>, Arc<SubscriptionEngine>) {
        let dataset = Arc::new(InMemoryDataset::new());
        let engine = SubscriptionEngine::builder(config, dataset.clone())
            .without_reaper()
            .build()
            .unwrap();
        dataset.set_mutation_listener(&engine);
        (dataset, engine)
    }

    fn engine() -> (Arc<InMemoryDataset>, Arc<SubscriptionEngine>) {
        engine_with(EngineConfig::default())
    }

    fn collect_keys(engine: &SubscriptionEngine, identity: &str) -> Vec<String> {
        let drain = engine.drain(identity).unwrap();
        let events: Vec<CacheEvent> = drain.collect();
        if let Some(last) = events.last() {
            engine.acknowledge(identity, last.sequence).unwrap();
        }
        events.into_iter().map(|e| e.key).collect()
    }

    #[test]
    fn test_interest_events_are_queued_for_registered_keys() {
        let (dataset, engine) = engine();
        engine.connect("c", false, None).unwrap();
        engine.register_keys("c", &["A"], false).unwrap();

        dataset.put("A", 1i32);
        dataset.put("B", 2i32);
        dataset.put("A", 3i32);

        assert_eq!(collect_keys(&engine, "c"), vec!["A", "A"]);
    }

    #[test]
    fn test_registration_requires_connected_session() {
        let (_dataset, engine) = engine();
        assert!(matches!(
            engine.register_keys("ghost", &["A"], false),
            Err(CacheError::SessionNotFound { .. })
        ));

        engine.connect("d", true, None).unwrap();
        engine.close("d", true).unwrap();
        assert!(matches!(
            engine.register_all_keys("d", true),
            Err(CacheError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_keep_alive_close_keeps_only_durable_subscriptions() {
        let (dataset, engine) = engine();
        engine.connect("d", true, None).unwrap();
        engine.register_keys("d", &["durable"], true).unwrap();
        engine.register_keys("d", &["transient"], false).unwrap();
        engine
            .new_cq("d", "big", Arc::new(Condition::gt("", 10i32)), true)
            .unwrap();
        engine
            .new_cq("d", "small", Arc::new(Condition::lt("", 10i32)), false)
            .unwrap();

        assert_eq!(engine.close("d", true).unwrap(), CloseDisposition::Retained);
        assert_eq!(engine.durable_cq_names("d"), vec!["big"]);
        assert_eq!(engine.cq_names("d"), vec!["big"]);

        dataset.put("durable", 1i32);
        dataset.put("transient", 1i32);
        assert_eq!(engine.queue_depth("d"), Some(1));
    }

    #[test]
    fn test_close_without_keep_alive_destroys_everything() {
        let (dataset, engine) = engine();
        engine.connect("d", true, None).unwrap();
        engine.register_all_keys("d", true).unwrap();
        dataset.put("A", 1i32);

        assert_eq!(engine.close("d", false).unwrap(), CloseDisposition::Destroyed);
        assert_eq!(engine.session_state("d"), None);
        assert_eq!(engine.queue_depth("d"), None);
        assert!(engine.interests_for("d").is_empty());
    }

    #[test]
    fn test_durable_session_delivers_only_after_mark_ready() {
        let (dataset, engine) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.connect("d", true, None).unwrap();
        engine
            .add_listener(
                "d",
                listener_fn(move |event| {
                    sink.lock().unwrap().push(event.sequence);
                    Ok(())
                }),
            )
            .unwrap();
        engine.register_keys("d", &["K"], true).unwrap();
        dataset.put("K", 1i32);

        let report = engine.dispatch("d").unwrap();
        assert!(!report.ready);
        assert!(seen.lock().unwrap().is_empty());

        engine.mark_ready("d").unwrap();
        let report = engine.dispatch("d").unwrap();
        assert_eq!(report.delivered, 1);
        assert!(report.went_live);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_cq_deltas_reach_owner_queue() {
        let (dataset, engine) = engine();
        dataset.put("A", 5i32);
        dataset.put("B", 15i32);
        engine.connect("c", false, None).unwrap();
        engine
            .new_cq("c", "big", Arc::new(Condition::gt("", 10i32)), false)
            .unwrap();
        let initial = engine.execute_cq_with_initial_results("c", "big").unwrap();
        assert_eq!(initial.keys().collect::<Vec<_>>(), vec!["B"]);

        dataset.put("A", 20i32);
        dataset.put("B", 3i32);

        let events: Vec<CacheEvent> = engine.drain("c").unwrap().collect();
        let ops: Vec<(&str, Operation)> = events
            .iter()
            .map(|e| (e.key.as_str(), e.operation))
            .collect();
        assert_eq!(ops, vec![("A", Operation::Create), ("B", Operation::Destroy)]);
    }

    #[test]
    fn test_durable_cq_needs_durable_session() {
        let (_dataset, engine) = engine();
        engine.connect("c", false, None).unwrap();
        let result = engine.new_cq("c", "q", Arc::new(Condition::True), true);
        assert!(matches!(result, Err(CacheError::InvalidParameter { .. })));
    }

    #[test]
    fn test_queue_full_is_reported_as_producer_fault() {
        let dataset = Arc::new(InMemoryDataset::new());
        let faults = Arc::new(FaultCollector::new(16));
        let config = EngineConfig {
            queue_capacity: Some(1),
            ..Default::default()
        };
        let engine = SubscriptionEngine::builder(config, dataset.clone())
            .fault_reporter(faults.clone())
            .without_reaper()
            .build()
            .unwrap();
        dataset.set_mutation_listener(&engine);

        engine.connect("c", false, None).unwrap();
        engine.register_all_keys("c", false).unwrap();
        dataset.put("A", 1i32);
        dataset.put("B", 2i32);

        assert_eq!(faults.count_of(FaultKind::Producer), 1);
        assert_eq!(engine.statistics().events_rejected, 1);
        assert_eq!(collect_keys(&engine, "c"), vec!["A"]);
    }

    #[test]
    fn test_checkpoint_on_enqueue_and_recover() {
        let store = Arc::new(InMemorySessionStore::new());
        let dataset = Arc::new(InMemoryDataset::new());
        let engine = SubscriptionEngine::builder(EngineConfig::default(), dataset.clone())
            .session_store(store.clone())
            .without_reaper()
            .build()
            .unwrap();
        dataset.set_mutation_listener(&engine);

        engine.connect("d", true, None).unwrap();
        engine.register_keys("d", &["K"], true).unwrap();
        engine.close("d", true).unwrap();
        dataset.put("K", 7i32);

        let record = store.load("d").unwrap().unwrap();
        assert_eq!(record.pending_events(), 1);
        drop(engine);

        let restarted = SubscriptionEngine::builder(EngineConfig::default(), dataset.clone())
            .session_store(store)
            .without_reaper()
            .build()
            .unwrap();
        assert_eq!(restarted.recover().unwrap(), vec!["d"]);
        assert_eq!(
            restarted.session_state("d"),
            Some(SessionState::DisconnectedDurable)
        );
        restarted.reconnect("d").unwrap();
        restarted.mark_ready("d").unwrap();
        let events: Vec<CacheEvent> = restarted.drain("d").unwrap().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_value, Some(AttributeValue::Int(7)));
    }

    #[test]
    fn test_expire_overdue_destroys_retained_session() {
        let (_dataset, engine) = engine();
        engine
            .connect("d", true, Some(Duration::from_millis(0)))
            .unwrap();
        engine.register_keys("d", &["K"], true).unwrap();
        engine.close("d", true).unwrap();

        assert_eq!(engine.expire_overdue(), vec!["d"]);
        assert!(matches!(
            engine.reconnect("d"),
            Err(CacheError::ExpiredSession { .. })
        ));
        assert!(engine.interests_for("d").is_empty());
    }

    #[test]
    fn test_health_degrades_on_lagging_queue() {
        let config = EngineConfig {
            lag_warning_threshold: 2,
            ..Default::default()
        };
        let (dataset, engine) = engine_with(config);
        engine.connect("c", false, None).unwrap();
        engine.register_all_keys("c", false).unwrap();
        assert_eq!(engine.health().status, HealthStatus::Healthy);

        dataset.put("A", 1i32);
        dataset.put("B", 1i32);
        let checker = engine.health_checker();
        assert_eq!(checker.check().status, HealthStatus::Degraded);
        assert!(engine.statistics_json().unwrap().contains("\"queued_events\": 2"));
    }

    #[test]
    fn test_shutdown_rejects_new_sessions() {
        let (_dataset, engine) = engine();
        engine.shutdown();
        assert!(engine.is_shutdown());
        assert!(matches!(
            engine.connect("c", false, None),
            Err(CacheError::InvalidState { .. })
        ));
        assert_eq!(engine.health().status, HealthStatus::Unhealthy);
    }
}
