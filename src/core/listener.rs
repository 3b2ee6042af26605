// SPDX-License-Identifier: MIT OR Apache-2.0

//! Listener capability set shared by session (interest) listeners and
//! continuous query listeners.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::core::event::CacheEvent;

/// Result returned by [`EventListener::on_event`]. An error is a listener
/// fault: it is reported and dispatch continues with the next event.
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Evaluation fault of one continuous query, handed to `on_error`
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFault {
    pub session: String,
    pub query: String,
    pub key: String,
    pub message: String,
}

impl fmt::Display for QueryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "query '{}' failed on key '{}': {}",
            self.query, self.key, self.message
        )
    }
}

/// Receives delivered events.
///
/// Only `on_event` is required. `on_error` fires for continuous query
/// evaluation faults, `on_close` exactly once when the owning query closes,
/// and `after_live` once a ready durable session's retained backlog has been
/// delivered.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &CacheEvent) -> ListenerResult;

    fn on_error(&self, _fault: &QueryFault) {}

    fn on_close(&self) {}

    fn after_live(&self, _session: &str) {}
}

/// Adapts a closure into an [`EventListener`].
pub struct FnListener<F>
where
    F: Fn(&CacheEvent) -> ListenerResult + Send + Sync,
{
    callback: F,
}

impl<F> FnListener<F>
where
    F: Fn(&CacheEvent) -> ListenerResult + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> EventListener for FnListener<F>
where
    F: Fn(&CacheEvent) -> ListenerResult + Send + Sync,
{
    fn on_event(&self, event: &CacheEvent) -> ListenerResult {
        (self.callback)(event)
    }
}

/// Shorthand for `Arc::new(FnListener::new(f))`.
pub fn listener_fn<F>(callback: F) -> Arc<dyn EventListener>
where
    F: Fn(&CacheEvent) -> ListenerResult + Send + Sync + 'static,
{
    Arc::new(FnListener::new(callback))
}

/// Run one listener callback, turning a panic into its message.
pub(crate) fn guarded<R>(callback: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(callback)).map_err(|panic| panic_message(panic.as_ref()))
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{EventSource, Operation};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fn_listener_invokes_closure() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener = listener_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let event = CacheEvent::new("K", None, None, Operation::Destroy, EventSource::Interest);
        listener.on_event(&event).unwrap();
        listener.on_close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fn_listener_propagates_error() {
        let listener = listener_fn(|_| Err("rejected".into()));
        let event = CacheEvent::new("K", None, None, Operation::Create, EventSource::Interest);
        let err = listener.on_event(&event).unwrap_err();
        assert_eq!(err.to_string(), "rejected");
    }

    #[test]
    fn test_guarded_catches_panic_message() {
        assert_eq!(guarded(|| 7), Ok(7));
        let err = guarded::<()>(|| panic!("on_close blew up")).unwrap_err();
        assert_eq!(err, "on_close blew up");
    }
}
