//! Error types surfaced to callers.
//!
//! Only pool, datastore and transaction failures reach callers. Cache and
//! statistics bookkeeping failures degrade internally (see `cache::CacheError`).

use std::time::Duration;

use thiserror::Error;

use crate::driver::{DriverError, DriverErrorKind, ErrorClass};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection pool exhausted: no connection available within {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Timed out connecting to datastore after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection pool is closed")]
    PoolClosed,

    /// A transient failure that could not be retried (e.g. a write without
    /// `retry_writes`).
    #[error("Transient datastore error: {0}")]
    Transient(#[source] DriverError),

    #[error("Datastore error: {0}")]
    Permanent(#[source] DriverError),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },

    #[error("Transaction aborted at statement {index}: {source}")]
    TransactionAborted {
        index: usize,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Transaction already in progress on this task")]
    NestedTransaction,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Wrap a driver error according to its classification.
    pub fn from_driver(err: DriverError) -> Self {
        match err.class() {
            ErrorClass::Transient => StoreError::Transient(err),
            ErrorClass::Permanent => StoreError::Permanent(err),
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::PoolExhausted { .. } | StoreError::ConnectTimeout(_) | StoreError::Transient(_)
        )
    }

    /// Whether the caller must change its input for the operation to succeed.
    pub fn is_caller_fixable(&self) -> bool {
        match self {
            StoreError::Permanent(_) | StoreError::NestedTransaction | StoreError::Config(_) => true,
            StoreError::TransactionAborted { source, .. } => source.is_caller_fixable(),
            _ => false,
        }
    }

    /// Short machine-readable name, used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::PoolExhausted { .. } => "pool_exhausted",
            StoreError::ConnectTimeout(_) => "connect_timeout",
            StoreError::PoolClosed => "pool_closed",
            StoreError::Transient(e) | StoreError::Permanent(e) => e.kind.as_str(),
            StoreError::RetryExhausted { .. } => "retry_exhausted",
            StoreError::TransactionAborted { .. } => "transaction_aborted",
            StoreError::NestedTransaction => "nested_transaction",
            StoreError::Timeout(_) => "timeout",
            StoreError::Config(_) => "config",
        }
    }

    /// The underlying driver error, if any.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            StoreError::Transient(e) | StoreError::Permanent(e) => Some(e),
            StoreError::RetryExhausted { last, .. } => last.driver_error(),
            StoreError::TransactionAborted { source, .. } => source.driver_error(),
            _ => None,
        }
    }

    /// Message suitable for end users.
    ///
    /// Permanent failures get a specific, actionable message; everything
    /// else reads as a temporary outage.
    pub fn user_message(&self) -> String {
        match self.driver_error() {
            Some(e) if self.is_caller_fixable() => match e.kind {
                DriverErrorKind::ConstraintViolation => constraint_message(e.code.as_deref()).to_string(),
                DriverErrorKind::Authorization => "Permission denied".to_string(),
                DriverErrorKind::TypeMismatch => "Invalid value supplied".to_string(),
                _ => "Invalid request".to_string(),
            },
            _ if self.is_caller_fixable() => "Invalid request".to_string(),
            _ => "Service temporarily unavailable, please try again later".to_string(),
        }
    }
}

/// Map SQLSTATE or SQLite extended result codes for constraint failures.
fn constraint_message(code: Option<&str>) -> &'static str {
    match code {
        Some("23505") | Some("2067") | Some("1555") => "Duplicate entry",
        Some("23503") | Some("787") => "Invalid reference",
        Some("23502") | Some("1299") => "Missing required value",
        Some("23514") | Some("275") => "Value out of allowed range",
        _ => "Constraint violated",
    }
}

impl From<DriverError> for StoreError {
    fn from(err: DriverError) -> Self {
        StoreError::from_driver(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_driver_classifies() {
        let transient = StoreError::from(DriverError::from_sqlstate("40P01", "deadlock detected"));
        assert!(matches!(transient, StoreError::Transient(_)));
        assert!(transient.is_transient());

        let permanent = StoreError::from(DriverError::from_sqlstate("42601", "syntax error"));
        assert!(matches!(permanent, StoreError::Permanent(_)));
        assert!(!permanent.is_transient());
        assert!(permanent.is_caller_fixable());
    }

    #[test]
    fn test_user_messages() {
        let dup = StoreError::from(DriverError::from_sqlstate("23505", "duplicate key"));
        assert_eq!(dup.user_message(), "Duplicate entry");

        let aborted = StoreError::TransactionAborted {
            index: 1,
            source: Box::new(StoreError::from(DriverError::from_sqlstate("23503", "fk"))),
        };
        assert_eq!(aborted.user_message(), "Invalid reference");
        assert_eq!(aborted.kind(), "transaction_aborted");

        let exhausted = StoreError::RetryExhausted {
            attempts: 3,
            last: Box::new(StoreError::Transient(DriverError::closed())),
        };
        assert!(!exhausted.is_caller_fixable());
        assert_eq!(
            exhausted.user_message(),
            "Service temporarily unavailable, please try again later"
        );
        assert_eq!(exhausted.driver_error().map(|e| e.kind), Some(DriverErrorKind::Closed));
    }
}
