// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::listener::EventListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Connected,
    /// Closed with keep-alive; the queue is retained until the deadline
    DisconnectedDurable,
    /// Terminal. The session's queue and subscriptions are gone.
    Expired,
}

impl SessionState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connected => "CONNECTED",
            SessionState::DisconnectedDurable => "DISCONNECTED_DURABLE",
            SessionState::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    /// Changes on every connect and reconnect
    pub(crate) instance_id: Uuid,
    pub(crate) ready: bool,
    pub(crate) live: bool,
    pub(crate) deadline: Option<Instant>,
    pub(crate) listeners: Vec<Arc<dyn EventListener>>,
}

/// A client identity known to the engine.
///
/// Identity, durability and timeout are fixed for the lifetime of the
/// handle. Everything else sits behind the per-session mutex, which is also
/// what serializes reconnect against expiry.
pub struct ClientSession {
    id: String,
    durable: bool,
    timeout: Duration,
    inner: Mutex<SessionInner>,
}

impl ClientSession {
    pub(crate) fn new(id: impl Into<String>, durable: bool, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            durable,
            timeout,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connected,
                instance_id: Uuid::new_v4(),
                // Non-durable clients have no backlog to gate
                ready: !durable,
                live: false,
                deadline: None,
                listeners: Vec::new(),
            }),
        }
    }

    /// A durable session rebuilt from a persisted record, waiting for its
    /// client to reconnect.
    pub(crate) fn recovered(id: impl Into<String>, timeout: Duration, now: Instant) -> Self {
        let session = Self::new(id, true, timeout);
        {
            let mut inner = session.lock();
            inner.state = SessionState::DisconnectedDurable;
            inner.ready = false;
            inner.deadline = now.checked_add(timeout);
        }
        session
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("client session mutex poisoned")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn instance_id(&self) -> Uuid {
        self.lock().instance_id
    }

    pub fn is_ready(&self) -> bool {
        let inner = self.lock();
        inner.state == SessionState::Connected && inner.ready
    }

    pub fn is_live(&self) -> bool {
        self.lock().live
    }

    /// Time left before a disconnected durable session expires.
    pub fn remaining_retention(&self, now: Instant) -> Option<Duration> {
        self.lock()
            .deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Flag the session live. Returns `true` only for the call that made
    /// the transition, so `after_live` fires once per ready period.
    pub(crate) fn mark_live(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Connected || !inner.ready || inner.live {
            return false;
        }
        inner.live = true;
        true
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.lock().listeners.push(listener);
    }

    pub fn listeners(&self) -> Vec<Arc<dyn EventListener>> {
        self.lock().listeners.clone()
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("durable", &self.durable)
            .field("timeout", &self.timeout)
            .field("state", &inner.state)
            .field("instance_id", &inner.instance_id)
            .field("ready", &inner.ready)
            .field("live", &inner.live)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_readiness() {
        let durable = ClientSession::new("d", true, Duration::from_secs(1));
        let plain = ClientSession::new("p", false, Duration::from_secs(1));
        assert_eq!(durable.state(), SessionState::Connected);
        assert!(!durable.is_ready());
        assert!(plain.is_ready());
    }

    #[test]
    fn test_recovered_session_has_deadline() {
        let now = Instant::now();
        let session = ClientSession::recovered("d", Duration::from_secs(30), now);
        assert_eq!(session.state(), SessionState::DisconnectedDurable);
        assert_eq!(
            session.remaining_retention(now),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_mark_live_once() {
        let session = ClientSession::new("p", false, Duration::from_secs(1));
        assert!(session.mark_live());
        assert!(!session.mark_live());
        assert!(session.is_live());
    }

    #[test]
    fn test_mark_live_requires_ready() {
        let session = ClientSession::new("d", true, Duration::from_secs(1));
        assert!(!session.mark_live());
    }
}
