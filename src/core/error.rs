// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core Error Types
//!
//! Errors surfaced synchronously to the application by session, interest,
//! query and queue operations. Faults that must not propagate (listener
//! errors, producer-side drops) are reported through [`fault::FaultReporter`]
//! instead.

pub mod fault;

pub use fault::{Fault, FaultCollector, FaultKind, FaultReporter, LoggingFaultReporter};

use thiserror::Error;

/// Result type for engine operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Broad classification used for logging and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Session,
    Subscription,
    Query,
    Delivery,
    Configuration,
    Persistence,
    Internal,
}

/// Engine error types
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Authentication failed for '{identity}': {message}")]
    Auth { identity: String, message: String },

    #[error("Durable session '{identity}' expired before reconnect")]
    ExpiredSession { identity: String },

    #[error("Session '{identity}' not found")]
    SessionNotFound { identity: String },

    #[error("Event queue for session '{session}' is full (capacity {capacity})")]
    QueueFull { session: String, capacity: usize },

    #[error("Continuous query '{query}' fault: {message}")]
    QueryFault { query: String, message: String },

    #[error("Listener fault: {message}")]
    ListenerFault { message: String },

    #[error("Continuous query '{name}' already exists for session '{session}'")]
    QueryExists { session: String, name: String },

    #[error("Continuous query '{name}' not found for session '{session}'")]
    QueryNotFound { session: String, name: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Invalid parameter '{parameter:?}': {message}")]
    InvalidParameter {
        message: String,
        parameter: Option<String>,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        config_key: Option<String>,
    },

    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

// Custom error creation helpers
impl CacheError {
    /// Create an authentication error
    pub fn auth(identity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            identity: identity.into(),
            message: message.into(),
        }
    }

    /// Create an expired session error
    pub fn expired_session(identity: impl Into<String>) -> Self {
        Self::ExpiredSession {
            identity: identity.into(),
        }
    }

    /// Create a session not found error
    pub fn session_not_found(identity: impl Into<String>) -> Self {
        Self::SessionNotFound {
            identity: identity.into(),
        }
    }

    /// Create a queue full error
    pub fn queue_full(session: impl Into<String>, capacity: usize) -> Self {
        Self::QueueFull {
            session: session.into(),
            capacity,
        }
    }

    /// Create a query fault
    pub fn query_fault(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueryFault {
            query: query.into(),
            message: message.into(),
        }
    }

    /// Create a listener fault
    pub fn listener_fault(message: impl Into<String>) -> Self {
        Self::ListenerFault {
            message: message.into(),
        }
    }

    pub fn query_exists(session: impl Into<String>, name: impl Into<String>) -> Self {
        Self::QueryExists {
            session: session.into(),
            name: name.into(),
        }
    }

    pub fn query_not_found(session: impl Into<String>, name: impl Into<String>) -> Self {
        Self::QueryNotFound {
            session: session.into(),
            name: name.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
            parameter: None,
        }
    }

    /// Create an invalid parameter error naming the parameter
    pub fn invalid_parameter_named(message: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
            parameter: Some(parameter.into()),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            config_key: None,
        }
    }

    /// Create a configuration error with a specific key
    pub fn configuration_with_key(message: impl Into<String>, config_key: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            config_key: Some(config_key.into()),
        }
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    /// Create a persistence error with source
    pub fn persistence_with_source(
        message: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Persistence {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a generic error from a string
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CacheError::Auth { .. }
            | CacheError::ExpiredSession { .. }
            | CacheError::SessionNotFound { .. } => ErrorCategory::Session,
            CacheError::QueueFull { .. } | CacheError::ListenerFault { .. } => {
                ErrorCategory::Delivery
            }
            CacheError::QueryFault { .. }
            | CacheError::QueryExists { .. }
            | CacheError::QueryNotFound { .. } => ErrorCategory::Query,
            CacheError::InvalidState { .. } | CacheError::InvalidParameter { .. } => {
                ErrorCategory::Subscription
            }
            CacheError::Configuration { .. } => ErrorCategory::Configuration,
            CacheError::Persistence { .. } | CacheError::IoError(_) => ErrorCategory::Persistence,
            CacheError::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Whether retrying the same call may succeed without caller changes.
    ///
    /// A full queue drains as the consumer acknowledges; storage errors may be
    /// transient. Everything else reflects caller or session state.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CacheError::QueueFull { .. } | CacheError::Persistence { .. } | CacheError::IoError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error() {
        let error = CacheError::auth("client-1", "already connected");
        assert!(matches!(error, CacheError::Auth { .. }));
        assert_eq!(error.category(), ErrorCategory::Session);
        assert!(!error.is_retriable());
    }

    #[test]
    fn test_queue_full_is_retriable() {
        let error = CacheError::queue_full("client-1", 16);
        assert!(error.is_retriable());
        assert_eq!(error.category(), ErrorCategory::Delivery);
        assert_eq!(
            error.to_string(),
            "Event queue for session 'client-1' is full (capacity 16)"
        );
    }

    #[test]
    fn test_query_errors_share_category() {
        assert_eq!(
            CacheError::query_fault("cq", "bad field").category(),
            ErrorCategory::Query
        );
        assert_eq!(
            CacheError::query_exists("s", "cq").category(),
            ErrorCategory::Query
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let error: CacheError = io.into();
        assert!(matches!(error, CacheError::IoError(_)));
        assert!(error.is_retriable());
    }
}
