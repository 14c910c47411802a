//! Server-level configuration: the error converter hook and protocol
//! version, recognized at server construction.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::{
    codec::PROTOCOL_VERSION,
    error::{DispatchError, ErrorConverterFailure, InvokeError},
};

/// Standard status text for a small set of well-known HTTP-style codes.
#[must_use]
pub const fn standard_status_text(status: u16) -> &'static str {
    match status {
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

/// Converts a dispatch failure into the sanitized payload sent to the
/// client in an `Error` frame.
///
/// Implementations may fail themselves (see [`ErrorConverterFailure`]); a
/// failure here is not propagated to the client, which always receives a
/// generic 500 as a last resort.
pub trait ErrorConverter: Send + Sync {
    /// Convert `error` into a client-visible payload.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorConverterFailure`] if conversion itself fails.
    fn convert(&self, error: &DispatchError) -> Result<Value, ErrorConverterFailure>;
}

/// The default converter: passes explicit invoke errors through verbatim,
/// and maps any other failure to a generic 500, optionally including the
/// message and a synthetic "stack" field when `dev_mode` is set.
pub struct DefaultErrorConverter {
    /// Whether to include diagnostic detail in generic-failure payloads.
    pub dev_mode: bool,
}

impl ErrorConverter for DefaultErrorConverter {
    fn convert(&self, error: &DispatchError) -> Result<Value, ErrorConverterFailure> {
        match error {
            DispatchError::Explicit(InvokeError { status, message, body }) => {
                let mut payload = json!({ "status": status, "message": message });
                if let Some(body) = body {
                    payload["body"] = body.clone();
                }
                Ok(payload)
            }
            DispatchError::Internal(message) => {
                let mut payload = json!({
                    "status": 500,
                    "message": standard_status_text(500),
                });
                if self.dev_mode {
                    payload["message"] = Value::from(message.clone());
                    payload["body"] = json!({ "stack": message });
                }
                Ok(payload)
            }
        }
    }
}

/// Configuration accepted at server construction.
pub struct ServerConfig {
    /// Overrides the default error converter.
    pub error_converter: Arc<dyn ErrorConverter>,
    /// Protocol version advertised in the `Welcome` frame.
    pub protocol_version: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            error_converter: Arc::new(DefaultErrorConverter { dev_mode: true }),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn explicit_error_passes_through_verbatim() {
        let converter = DefaultErrorConverter { dev_mode: false };
        let err = DispatchError::from(InvokeError::new(527, "Custom Error"));

        let payload = converter.convert(&err).unwrap();

        assert_eq!(payload["status"], 527);
        assert_eq!(payload["message"], "Custom Error");
    }

    #[rstest]
    fn internal_error_becomes_generic_500_outside_dev_mode() {
        let converter = DefaultErrorConverter { dev_mode: false };
        let err = DispatchError::Internal("boom".to_owned());

        let payload = converter.convert(&err).unwrap();

        assert_eq!(payload["status"], 500);
        assert_eq!(payload["message"], "Internal Server Error");
        assert!(payload.get("body").is_none());
    }

    #[rstest]
    fn internal_error_includes_diagnostics_in_dev_mode() {
        let converter = DefaultErrorConverter { dev_mode: true };
        let err = DispatchError::Internal("boom".to_owned());

        let payload = converter.convert(&err).unwrap();

        assert_eq!(payload["status"], 500);
        assert_eq!(payload["message"], "boom");
        assert_eq!(payload["body"]["stack"], "boom");
    }
}
