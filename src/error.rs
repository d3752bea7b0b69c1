use thiserror::Error;

use crate::verify::Mismatch;

/// Whether a transport failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Network errors, throttling, timeouts.
    Transient,
    /// Authentication rejected, resource not found, bad request.
    Permanent,
}

/// Failure reported by an object store or notification transport.
#[derive(Debug, Clone, Error)]
#[error("{op}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub op: String,
    pub message: String,
}

impl TransportError {
    pub fn transient(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Transient,
            op: op.into(),
            message: message.into(),
        }
    }

    pub fn permanent(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Permanent,
            op: op.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TransportErrorKind::Transient
    }

    /// Classify an I/O error coming from a filesystem-backed transport.
    pub fn from_io(op: impl Into<String>, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused => Self::transient(op, err.to_string()),
            _ => Self::permanent(op, err.to_string()),
        }
    }

    /// Classify a failure of the HTTP client itself (no status received).
    pub fn from_http(op: impl Into<String>, err: ureq::Error) -> Self {
        match err {
            ureq::Error::Timeout(_)
            | ureq::Error::Io(_)
            | ureq::Error::ConnectionFailed
            | ureq::Error::HostNotFound => Self::transient(op, err.to_string()),
            other => Self::permanent(op, other.to_string()),
        }
    }

    /// Throttling and server errors are worth retrying; any other status is not.
    pub fn from_status(op: impl Into<String>, status: u16, detail: &str) -> Self {
        let message = format!("HTTP {status}: {}", detail.trim());
        match status {
            429 | 500..=599 => Self::transient(op, message),
            _ => Self::permanent(op, message),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        last: TransportError,
    },

    #[error("permanent transport failure: {0}")]
    PermanentTransport(TransportError),

    #[error("state store error: {0}")]
    Store(String),

    #[error("unreadable {what} at {location}: {reason}")]
    CorruptState {
        what: &'static str,
        location: String,
        reason: String,
    },

    #[error("verification failed with {} mismatch(es)", .0.len())]
    Verification(Vec<Mismatch>),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
}

impl Error {
    /// Short, stable diagnostic class shown to the operator.
    pub fn class(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration",
            Error::RetriesExhausted { .. } => "transient-retry-exhausted",
            Error::PermanentTransport(_) => "permanent-transport",
            Error::Store(_) => "state-store",
            Error::CorruptState { .. } | Error::Verification(_) | Error::InvalidTransition(_) => {
                "structural-inconsistency"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
