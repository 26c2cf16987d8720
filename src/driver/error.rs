//! Driver-level error types and transient/permanent classification.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Whether retrying can fix a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// What went wrong, independent of the driver that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    /// Connection dropped, reset or refused.
    ConnectionReset,
    /// Serialization failure or deadlock detected.
    Conflict,
    /// Database busy or locked by another writer.
    Busy,
    /// Statement cancelled by a server-side timeout.
    StatementTimeout,
    ConstraintViolation,
    Syntax,
    TypeMismatch,
    Authorization,
    /// The handle was already closed locally.
    Closed,
    Other,
}

impl DriverErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverErrorKind::ConnectionReset => "connection_reset",
            DriverErrorKind::Conflict => "conflict",
            DriverErrorKind::Busy => "busy",
            DriverErrorKind::StatementTimeout => "statement_timeout",
            DriverErrorKind::ConstraintViolation => "constraint_violation",
            DriverErrorKind::Syntax => "syntax",
            DriverErrorKind::TypeMismatch => "type_mismatch",
            DriverErrorKind::Authorization => "authorization",
            DriverErrorKind::Closed => "closed",
            DriverErrorKind::Other => "other",
        }
    }

    /// Partition into transient and permanent failures.
    ///
    /// Unknown failures are permanent: retrying something we cannot
    /// identify risks duplicating its side effects.
    pub fn class(&self) -> ErrorClass {
        match self {
            DriverErrorKind::ConnectionReset
            | DriverErrorKind::Conflict
            | DriverErrorKind::Busy
            | DriverErrorKind::StatementTimeout
            | DriverErrorKind::Closed => ErrorClass::Transient,
            DriverErrorKind::ConstraintViolation
            | DriverErrorKind::Syntax
            | DriverErrorKind::TypeMismatch
            | DriverErrorKind::Authorization
            | DriverErrorKind::Other => ErrorClass::Permanent,
        }
    }

    /// Map a SQLSTATE code (PostgreSQL, MySQL and most ANSI drivers) to a kind.
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "40001" | "40P01" => DriverErrorKind::Conflict,
            "57014" => DriverErrorKind::StatementTimeout,
            "55P03" => DriverErrorKind::Busy,
            "57P01" | "57P02" | "57P03" => DriverErrorKind::ConnectionReset,
            "42501" => DriverErrorKind::Authorization,
            "42601" | "42P01" | "42703" | "42883" => DriverErrorKind::Syntax,
            "42804" => DriverErrorKind::TypeMismatch,
            _ => match code.get(..2) {
                Some("08") => DriverErrorKind::ConnectionReset,
                Some("23") => DriverErrorKind::ConstraintViolation,
                Some("22") => DriverErrorKind::TypeMismatch,
                Some("28") => DriverErrorKind::Authorization,
                Some("42") => DriverErrorKind::Syntax,
                _ => DriverErrorKind::Other,
            },
        }
    }
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error reported by a datastore driver.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
    /// Driver-specific code (SQLSTATE, SQLite extended result code, ...)
    pub code: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            source: None,
        }
    }

    /// Build from a SQLSTATE reported by the server.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::from_sqlstate(code), message).with_code(code)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn closed() -> Self {
        Self::new(DriverErrorKind::Closed, "connection is closed")
    }

    #[inline]
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
