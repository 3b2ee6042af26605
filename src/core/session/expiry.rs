// SPDX-License-Identifier: MIT OR Apache-2.0

//! Background reaper for overdue durable sessions.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};

use crate::core::error::CacheResult;

/// Something that can destroy its overdue sessions on demand.
pub trait ExpirySweep: Send + Sync {
    /// Returns the number of sessions destroyed.
    fn sweep_expired(&self) -> usize;
}

/// Periodically calls [`ExpirySweep::sweep_expired`] on a background thread.
///
/// Holds only a weak reference, so the reaper never keeps its target alive;
/// the thread exits once the target is dropped or the reaper is stopped.
pub struct ExpiryReaper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpiryReaper {
    pub fn start<T>(target: Weak<T>, interval: Duration) -> CacheResult<Self>
    where
        T: ExpirySweep + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let handle = thread::Builder::new()
            .name("session-expiry".to_string())
            .spawn(move || loop {
                let keep_running = select! {
                    recv(ticker) -> _ => match target.upgrade() {
                        Some(target) => {
                            let expired = target.sweep_expired();
                            if expired > 0 {
                                log::debug!("expiry sweep destroyed {expired} session(s)");
                            }
                            true
                        }
                        None => false,
                    },
                    recv(stop_rx) -> _ => false,
                };
                if !keep_running {
                    break;
                }
            })?;
        log::debug!("session expiry reaper started, interval {interval:?}");
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel, which also wakes select
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            // Dropped from inside a sweep: the thread exits on its own
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("session expiry reaper panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ExpiryReaper {
    fn drop(&mut self) {
        self.stop();
    }
}
