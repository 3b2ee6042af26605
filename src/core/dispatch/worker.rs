// SPDX-License-Identifier: MIT OR Apache-2.0

//! Background delivery for one ready session.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::dispatcher::DeliveryDispatcher;
use crate::core::error::{CacheError, CacheResult};
use crate::core::util::shutdown::ShutdownCoordinator;

/// Repeatedly performs blocking dispatch passes for a session until
/// stopped, the session stops being ready, or its queue goes away.
pub struct DeliveryWorker {
    session: String,
    shutdown: ShutdownCoordinator,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryWorker {
    pub fn start(
        dispatcher: Arc<DeliveryDispatcher>,
        session: impl Into<String>,
        wait: Duration,
    ) -> CacheResult<Self> {
        let session = session.into();
        let shutdown = ShutdownCoordinator::new();
        let stop = shutdown.handle();
        let id = session.clone();

        let handle = thread::Builder::new()
            .name(format!("delivery-{session}"))
            .spawn(move || {
                log::debug!("[{id}] delivery worker started");
                while !stop.is_shutdown() {
                    match dispatcher.dispatch_wait(&id, wait) {
                        Ok(report) if !report.ready => break,
                        Ok(_) => {}
                        Err(CacheError::SessionNotFound { .. }) => break,
                        Err(CacheError::InvalidState { message }) => {
                            // Another reader holds the queue; back off
                            log::debug!("[{id}] {message}");
                            thread::sleep(wait);
                        }
                        Err(e) => {
                            log::warn!("[{id}] delivery worker error: {e}");
                            thread::sleep(wait);
                        }
                    }
                }
                log::debug!("[{id}] delivery worker stopped");
            })?;

        Ok(Self {
            session,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the worker and wait for it to exit. Called from the worker's
    /// own thread (a listener closing its session), it only signals.
    pub fn stop(&mut self) {
        self.shutdown.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("[{}] delivery worker panicked", self.session);
            }
        }
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorker")
            .field("session", &self.session)
            .field("running", &self.is_running())
            .finish()
    }
}
