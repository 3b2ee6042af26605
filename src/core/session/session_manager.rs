// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session manager
//!
//! Owns the identity table. Every transition that creates or destroys a
//! session's subscription state runs its caller-supplied cleanup while the
//! table lock is held, so a concurrent `connect` of the same identity can
//! never observe (or be clobbered by) half-destroyed state.
//!
//! Lock order: table, then the session mutex. Nothing acquires the table
//! lock while holding a session mutex.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::client_session::{ClientSession, SessionState};
use crate::core::error::{CacheError, CacheResult};
use crate::core::listener::EventListener;

/// What `close` did with a session, handed to the close hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Durable session closed with keep-alive; the queue stays
    Retained,
    /// Session and queue are gone
    Destroyed,
}

#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    /// Identities destroyed by expiry and not connected since
    expired: Mutex<HashSet<String>>,
    default_timeout: Duration,
}

impl SessionManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            expired: Mutex::new(HashSet::new()),
            default_timeout,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ClientSession>>> {
        self.sessions.read().expect("session table lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<ClientSession>>> {
        self.sessions.write().expect("session table lock poisoned")
    }

    fn tombstone(&self, identity: &str) {
        self.expired
            .lock()
            .expect("expired identity set poisoned")
            .insert(identity.to_string());
    }

    fn clear_tombstone(&self, identity: &str) -> bool {
        self.expired
            .lock()
            .expect("expired identity set poisoned")
            .remove(identity)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Open a new session.
    ///
    /// Fails with `Auth` when the identity is empty, already connected, or
    /// retained as a disconnected durable session that must be resumed with
    /// [`reconnect`](Self::reconnect). A retained session already past its
    /// deadline is destroyed through `on_stale` and replaced.
    pub fn connect(
        &self,
        identity: &str,
        durable: bool,
        timeout: Option<Duration>,
        on_stale: impl FnOnce(&str),
    ) -> CacheResult<Arc<ClientSession>> {
        if identity.trim().is_empty() {
            return Err(CacheError::auth(identity, "client identity must not be empty"));
        }

        let mut sessions = self.write();
        if let Some(existing) = sessions.get(identity).cloned() {
            let mut inner = existing.lock();
            match inner.state {
                SessionState::Connected => {
                    return Err(CacheError::auth(
                        identity,
                        format!("already connected as instance {}", inner.instance_id),
                    ));
                }
                SessionState::DisconnectedDurable
                    if inner.deadline.map_or(true, |d| Instant::now() < d) =>
                {
                    return Err(CacheError::auth(
                        identity,
                        "a durable session is retained for this identity; reconnect to resume it",
                    ));
                }
                _ => {
                    inner.state = SessionState::Expired;
                    drop(inner);
                    sessions.remove(identity);
                    on_stale(identity);
                    log::info!("[{identity}] discarded overdue durable session on connect");
                }
            }
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let session = Arc::new(ClientSession::new(identity, durable, timeout));
        sessions.insert(identity.to_string(), Arc::clone(&session));
        self.clear_tombstone(identity);

        log::info!(
            "[{identity}] connected (durable={durable}, timeout={timeout:?}, instance={})",
            session.instance_id()
        );
        Ok(session)
    }

    /// Allow delivery to start. Returns the session so the caller can kick
    /// off dispatch.
    pub fn mark_ready(&self, identity: &str) -> CacheResult<Arc<ClientSession>> {
        let session = self.require(identity)?;
        {
            let mut inner = session.lock();
            if inner.state != SessionState::Connected {
                return Err(CacheError::invalid_state(format!(
                    "session '{identity}' is {} and cannot become ready",
                    inner.state
                )));
            }
            if !inner.ready {
                inner.ready = true;
                inner.live = false;
                log::info!("[{identity}] ready for events");
            }
        }
        Ok(session)
    }

    /// Close a connected session.
    ///
    /// With `keep_alive` a durable session is retained as
    /// `DisconnectedDurable` until its timeout elapses; otherwise it is
    /// destroyed. `on_close` runs under the table lock with the disposition.
    /// A timeout too long to form a deadline retains the session until it
    /// reconnects.
    pub fn close(
        &self,
        identity: &str,
        keep_alive: bool,
        on_close: impl FnOnce(&ClientSession, CloseDisposition),
    ) -> CacheResult<CloseDisposition> {
        let mut sessions = self.write();
        let session = sessions
            .get(identity)
            .cloned()
            .ok_or_else(|| CacheError::session_not_found(identity))?;

        let mut inner = session.lock();
        if inner.state != SessionState::Connected {
            return Err(CacheError::invalid_state(format!(
                "session '{identity}' is {} and cannot be closed",
                inner.state
            )));
        }

        let disposition = if keep_alive && session.is_durable() {
            inner.state = SessionState::DisconnectedDurable;
            inner.ready = false;
            inner.live = false;
            inner.deadline = Instant::now().checked_add(session.timeout());
            CloseDisposition::Retained
        } else {
            inner.state = SessionState::Expired;
            inner.ready = false;
            sessions.remove(identity);
            CloseDisposition::Destroyed
        };
        drop(inner);

        on_close(&*session, disposition);
        match disposition {
            CloseDisposition::Retained => log::info!(
                "[{identity}] disconnected with keep-alive, retained for {:?}",
                session.timeout()
            ),
            CloseDisposition::Destroyed => log::info!("[{identity}] closed"),
        }
        Ok(disposition)
    }

    /// Resume a retained durable session.
    ///
    /// Past the deadline the session is destroyed through `on_expired` and
    /// the call fails with `ExpiredSession`. No replacement session is
    /// created: the client calls [`connect`](Self::connect) again to start
    /// fresh, and until then the identity keeps reporting `ExpiredSession`.
    /// The resumed session is not ready until [`mark_ready`](Self::mark_ready).
    pub fn reconnect(
        &self,
        identity: &str,
        on_expired: impl FnOnce(&str),
    ) -> CacheResult<Arc<ClientSession>> {
        let mut sessions = self.write();
        let Some(session) = sessions.get(identity).cloned() else {
            let expired = self
                .expired
                .lock()
                .expect("expired identity set poisoned")
                .contains(identity);
            return Err(if expired {
                CacheError::expired_session(identity)
            } else {
                CacheError::session_not_found(identity)
            });
        };

        let mut inner = session.lock();
        match inner.state {
            SessionState::Connected => {
                return Err(CacheError::auth(
                    identity,
                    format!("already connected as instance {}", inner.instance_id),
                ));
            }
            SessionState::Expired => return Err(CacheError::expired_session(identity)),
            SessionState::DisconnectedDurable => {}
        }

        if inner.deadline.is_some_and(|d| Instant::now() >= d) {
            inner.state = SessionState::Expired;
            drop(inner);
            sessions.remove(identity);
            on_expired(identity);
            self.tombstone(identity);
            log::info!("[{identity}] reconnect after retention deadline, session expired");
            return Err(CacheError::expired_session(identity));
        }

        inner.state = SessionState::Connected;
        inner.instance_id = Uuid::new_v4();
        inner.ready = false;
        inner.live = false;
        inner.deadline = None;
        let instance = inner.instance_id;
        drop(inner);

        log::info!("[{identity}] reconnected as instance {instance}");
        Ok(session)
    }

    /// Destroy every retained session whose deadline is at or before `now`.
    /// `on_expired` runs under the table lock for each one.
    pub fn expire_overdue(&self, now: Instant, mut on_expired: impl FnMut(&str)) -> Vec<String> {
        let mut sessions = self.write();
        let mut expired = Vec::new();
        for (identity, session) in sessions.iter() {
            let mut inner = session.lock();
            if inner.state == SessionState::DisconnectedDurable
                && inner.deadline.is_some_and(|d| now >= d)
            {
                inner.state = SessionState::Expired;
                expired.push(identity.clone());
            }
        }
        for identity in &expired {
            sessions.remove(identity);
            on_expired(identity);
            self.tombstone(identity);
            log::info!("[{identity}] durable session expired");
        }
        expired
    }

    /// Register a session that was rebuilt from a persisted record.
    pub(crate) fn install_recovered(&self, session: Arc<ClientSession>) -> CacheResult<()> {
        let mut sessions = self.write();
        if sessions.contains_key(session.id()) {
            return Err(CacheError::invalid_state(format!(
                "session '{}' is already active and cannot be recovered",
                session.id()
            )));
        }
        self.clear_tombstone(session.id());
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn session(&self, identity: &str) -> Option<Arc<ClientSession>> {
        self.read().get(identity).cloned()
    }

    pub fn session_state(&self, identity: &str) -> Option<SessionState> {
        self.session(identity).map(|s| s.state())
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.read().values().cloned().collect()
    }

    pub fn add_listener(&self, identity: &str, listener: Arc<dyn EventListener>) -> CacheResult<()> {
        self.require(identity)?.add_listener(listener);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn require(&self, identity: &str) -> CacheResult<Arc<ClientSession>> {
        self.session(identity)
            .ok_or_else(|| CacheError::session_not_found(identity))
    }
}
