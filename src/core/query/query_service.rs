// SPDX-License-Identifier: MIT OR Apache-2.0

//! Registry of continuous queries, keyed by owning session and query name.
//!
//! Listener callbacks never run under the map lock: queries are cloned out
//! and the map released before a query is closed or evaluated.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use super::condition::{Condition, Predicate};
use super::continuous_query::{ContinuousQuery, CqResults, CqState, Evaluation};
use crate::core::dataset::Dataset;
use crate::core::error::{
    CacheError, CacheResult, Fault, FaultKind, FaultReporter, LoggingFaultReporter,
};
use crate::core::event::Mutation;
use crate::core::listener::{EventListener, QueryFault};

type QueryMap = HashMap<String, BTreeMap<String, Arc<ContinuousQuery>>>;

/// Service-wide query counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryServiceStatistics {
    pub created: u64,
    pub closed: u64,
    pub running: u64,
    pub stopped: u64,
}

/// One query's evaluation of a mutation, tagged with its owner.
#[derive(Debug)]
pub struct QueryEvaluation {
    pub query: Arc<ContinuousQuery>,
    pub evaluation: Evaluation,
}

pub struct QueryService {
    queries: RwLock<QueryMap>,
    faults: Arc<dyn FaultReporter>,
    created: AtomicU64,
    closed: AtomicU64,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("created", &self.created.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for QueryService {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryService {
    pub fn new() -> Self {
        Self::with_fault_reporter(Arc::new(LoggingFaultReporter))
    }

    /// Listener panics in `on_error` and `on_close` go to `faults`.
    pub fn with_fault_reporter(faults: Arc<dyn FaultReporter>) -> Self {
        Self {
            queries: RwLock::new(HashMap::new()),
            faults,
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, QueryMap> {
        self.queries.read().expect("query service lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueryMap> {
        self.queries.write().expect("query service lock poisoned")
    }

    /// Create an IDLE query. Names are unique per session; the name of a
    /// query that was closed through its handle may be reused.
    pub fn new_cq(
        &self,
        session: &str,
        name: &str,
        predicate: Arc<dyn Predicate>,
        durable: bool,
    ) -> CacheResult<Arc<ContinuousQuery>> {
        if name.trim().is_empty() {
            return Err(CacheError::invalid_parameter_named(
                "continuous query name must not be empty",
                "name",
            ));
        }
        if durable && predicate.as_condition().is_none() {
            return Err(CacheError::invalid_parameter_named(
                format!("durable continuous query '{name}' needs a Condition predicate"),
                "predicate",
            ));
        }

        let query = Arc::new(ContinuousQuery::new(session, name, predicate, durable));
        let previous = {
            let mut queries = self.write();
            let owned = queries.entry(session.to_string()).or_default();
            if owned
                .get(name)
                .is_some_and(|existing| existing.state() != CqState::Closed)
            {
                return Err(CacheError::query_exists(session, name));
            }
            owned.insert(name.to_string(), Arc::clone(&query))
        };
        if let Some(previous) = previous {
            self.close_query(&previous);
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        log::debug!("[{session}] created continuous query '{name}' (durable={durable})");
        Ok(query)
    }

    /// Re-install a durable query from a session record.
    pub fn restore(
        &self,
        session: &str,
        name: &str,
        condition: Condition,
        members: Vec<String>,
    ) -> Arc<ContinuousQuery> {
        let query = Arc::new(ContinuousQuery::restored(session, name, condition, members));
        let previous = self
            .write()
            .entry(session.to_string())
            .or_default()
            .insert(name.to_string(), Arc::clone(&query));
        if let Some(previous) = previous {
            self.close_query(&previous);
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        query
    }

    pub fn get_cq(&self, session: &str, name: &str) -> CacheResult<Arc<ContinuousQuery>> {
        self.read()
            .get(session)
            .and_then(|owned| owned.get(name))
            .cloned()
            .ok_or_else(|| CacheError::query_not_found(session, name))
    }

    /// Whether `session` owns a query called `name`. Takes only the map lock.
    pub fn contains(&self, session: &str, name: &str) -> bool {
        self.read()
            .get(session)
            .is_some_and(|owned| owned.contains_key(name))
    }

    pub fn add_listener(
        &self,
        session: &str,
        name: &str,
        listener: Arc<dyn EventListener>,
    ) -> CacheResult<()> {
        self.get_cq(session, name)?.add_listener(listener)
    }

    /// Start incremental evaluation. The membership baseline is computed
    /// under the dataset's mutation lock but not returned.
    pub fn execute(&self, session: &str, name: &str, dataset: &dyn Dataset) -> CacheResult<()> {
        self.execute_with_initial_results(session, name, dataset)
            .map(|_| ())
    }

    /// Snapshot the entries currently matching and start incremental
    /// evaluation, atomically with respect to concurrent mutations.
    pub fn execute_with_initial_results(
        &self,
        session: &str,
        name: &str,
        dataset: &dyn Dataset,
    ) -> CacheResult<CqResults> {
        let query = self.get_cq(session, name)?;
        let mut outcome = None;
        dataset.scan_locked(&mut |entries| outcome = Some(query.start(entries)));
        let results = outcome.unwrap_or_else(|| {
            Err(CacheError::other(format!(
                "dataset did not scan entries for continuous query '{name}'"
            )))
        })?;
        for fault in &results.faults {
            self.notify_fault(&query, fault);
        }
        Ok(results)
    }

    pub fn stop(&self, session: &str, name: &str) -> CacheResult<()> {
        self.get_cq(session, name)?.stop()
    }

    /// Close and forget a query.
    pub fn close(&self, session: &str, name: &str) -> CacheResult<()> {
        let query = {
            let mut queries = self.write();
            let owned = queries
                .get_mut(session)
                .ok_or_else(|| CacheError::query_not_found(session, name))?;
            let query = owned
                .remove(name)
                .ok_or_else(|| CacheError::query_not_found(session, name))?;
            if owned.is_empty() {
                queries.remove(session);
            }
            query
        };
        if self.close_query(&query) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Close every query owned by `session`.
    pub fn close_session_queries(&self, session: &str) -> usize {
        let removed = self.remove_session_queries(session);
        self.close_queries(removed)
    }

    /// Close the non-durable queries of `session`, keeping durable ones.
    pub fn close_non_durable(&self, session: &str) -> usize {
        let removed = self.remove_non_durable(session);
        self.close_queries(removed)
    }

    /// Forget every query of `session` without closing them; the caller
    /// closes them with [`close_queries`](Self::close_queries) once it holds
    /// no locks a listener's `on_close` could need.
    pub fn remove_session_queries(&self, session: &str) -> Vec<Arc<ContinuousQuery>> {
        self.write()
            .remove(session)
            .map(|owned| owned.into_values().collect())
            .unwrap_or_default()
    }

    /// Forget the non-durable queries of `session` without closing them.
    pub fn remove_non_durable(&self, session: &str) -> Vec<Arc<ContinuousQuery>> {
        let mut queries = self.write();
        let Some(owned) = queries.get_mut(session) else {
            return Vec::new();
        };
        let names: Vec<String> = owned
            .iter()
            .filter(|(_, q)| !q.is_durable())
            .map(|(n, _)| n.clone())
            .collect();
        let removed = names.iter().filter_map(|n| owned.remove(n)).collect();
        if owned.is_empty() {
            queries.remove(session);
        }
        removed
    }

    pub fn close_queries(&self, queries: Vec<Arc<ContinuousQuery>>) -> usize {
        let closed = queries.iter().filter(|query| self.close_query(query)).count();
        self.closed.fetch_add(closed as u64, Ordering::Relaxed);
        closed
    }

    fn queries_of(&self, session: &str) -> Vec<Arc<ContinuousQuery>> {
        self.read()
            .get(session)
            .map(|owned| owned.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of `session`'s open queries, sorted.
    pub fn cq_names(&self, session: &str) -> Vec<String> {
        self.queries_of(session)
            .into_iter()
            .filter(|q| q.state() != CqState::Closed)
            .map(|q| q.name().to_string())
            .collect()
    }

    pub fn durable_cq_names(&self, session: &str) -> Vec<String> {
        self.durable_queries(session)
            .into_iter()
            .map(|q| q.name().to_string())
            .collect()
    }

    pub fn durable_queries(&self, session: &str) -> Vec<Arc<ContinuousQuery>> {
        self.queries_of(session)
            .into_iter()
            .filter(|q| q.is_durable() && q.state() != CqState::Closed)
            .collect()
    }

    /// Evaluate a mutation against every running query.
    ///
    /// Faults are returned, not handed to listeners: this runs under the
    /// dataset's mutation lock, and the caller passes them to
    /// [`notify_faults`](Self::notify_faults) once that lock is released.
    pub fn evaluate_mutation(&self, mutation: &Mutation) -> Vec<QueryEvaluation> {
        let queries: Vec<Arc<ContinuousQuery>> = self
            .read()
            .values()
            .flat_map(|owned| owned.values().cloned())
            .collect();

        let mut evaluations = Vec::new();
        for query in queries {
            let evaluation = query.evaluate(mutation);
            match &evaluation {
                Evaluation::Inactive | Evaluation::NoChange => continue,
                Evaluation::Fault(fault) => log::warn!("[{}] {fault}", query.session()),
                Evaluation::Delta(_) => {}
            }
            evaluations.push(QueryEvaluation { query, evaluation });
        }
        evaluations
    }

    /// Hand deferred evaluation faults to each query's `on_error` listeners.
    pub fn notify_faults(&self, faults: Vec<(Arc<ContinuousQuery>, QueryFault)>) {
        for (query, fault) in faults {
            self.notify_fault(&query, &fault);
        }
    }

    fn notify_fault(&self, query: &ContinuousQuery, fault: &QueryFault) {
        let failures = query.notify_fault(fault);
        self.report_panics(query, "on_error", failures);
    }

    fn close_query(&self, query: &ContinuousQuery) -> bool {
        match query.close_collecting() {
            Some(failures) => {
                self.report_panics(query, "on_close", failures);
                true
            }
            None => false,
        }
    }

    fn report_panics(&self, query: &ContinuousQuery, callback: &str, failures: Vec<String>) {
        for failure in failures {
            self.faults.report(
                Fault::new(
                    FaultKind::Listener,
                    format!("{callback} listener panicked: {failure}"),
                )
                .with_session(query.session())
                .with_query(query.name()),
            );
        }
    }

    pub fn statistics(&self) -> QueryServiceStatistics {
        let queries: Vec<Arc<ContinuousQuery>> = self
            .read()
            .values()
            .flat_map(|owned| owned.values().cloned())
            .collect();
        let mut stats = QueryServiceStatistics {
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for query in queries {
            match query.state() {
                CqState::Running => stats.running += 1,
                CqState::Stopped => stats.stopped += 1,
                CqState::Idle | CqState::Closed => {}
            }
        }
        stats
    }
}
