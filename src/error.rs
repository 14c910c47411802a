//! Error taxonomy for invocation handling.
//!
//! Distinguishes the "invoke error with explicit status" kind, which is
//! converted to a client-visible `Error` frame verbatim, from generic
//! handler failure, which is always converted to a 500 and always emits an
//! `invokeError` signal (see [`crate::server::ServerEvent::InvokeError`]).

use serde_json::Value;
use thiserror::Error;

/// An error a handler may return carrying an explicit, client-visible
/// status and message.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{status}: {message}")]
pub struct InvokeError {
    /// HTTP-style status code reported to the client.
    pub status: u16,
    /// Human-readable message reported to the client.
    pub message: String,
    /// Optional additional payload reported to the client.
    pub body: Option<Value>,
}

impl InvokeError {
    /// Construct an invoke error with no additional body.
    #[must_use]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), body: None }
    }
}

/// A handler's failure, as returned from a composed middleware chain.
///
/// `Explicit` carries a status the client is meant to see as-is; `Internal`
/// represents an unexpected failure that the default error converter maps
/// to a generic 500 (and always signals `invokeError`).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    /// A handler-raised error with an explicit status, message, and body.
    #[error(transparent)]
    Explicit(#[from] InvokeError),
    /// An unexpected handler failure; text is the human-readable message
    /// preserved for development-mode diagnostics.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error produced when a configured error converter itself fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("error converter failed: {0}")]
pub struct ErrorConverterFailure(pub String);

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn explicit_invoke_error_carries_status() {
        let err = DispatchError::from(InvokeError::new(527, "Custom Error"));
        match err {
            DispatchError::Explicit(inner) => {
                assert_eq!(inner.status, 527);
                assert_eq!(inner.message, "Custom Error");
            }
            DispatchError::Internal(_) => panic!("expected explicit variant"),
        }
    }
}
