//! Crate-local error taxonomy.
//!
//! Mirrors the status codes the Mixer wire protocol itself uses, plus the
//! purely-local kinds this client needs (`NotFound` as an internal cache-miss
//! sentinel, never surfaced through [`Error`]).

use thiserror::Error;

/// The kind of failure that occurred.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Transport not configured, or malformed attributes passed by the caller.
    InvalidArgument,
    /// One or more named quotas rejected the request.
    ResourceExhausted {
        /// Names of the quotas that rejected the request.
        quotas: Vec<String>,
    },
    /// The transport failed (connection error, stream reset, etc).
    Unavailable,
    /// The caller explicitly cancelled the in-flight request.
    Cancelled,
    /// A status code forwarded unchanged from the Mixer server.
    Server {
        /// The server's status code.
        code: i32,
    },
}

/// A crate-local error: a [`ErrorKind`] plus a human-readable message.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn resource_exhausted(quotas: Vec<String>) -> Self {
        let message = format!("quota exhausted for: {}", quotas.join(","));
        Self::new(ErrorKind::ResourceExhausted { quotas }, message)
    }

    pub fn server(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server { code }, message)
    }
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, Error>;
