// ── Core error types ──
//
// Domain-level errors from hearth-core. Local HTTP callers and internal
// components see these, never raw transport errors -- the
// `From<hearth_api::Error>` impl translates at the seam.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Request errors ───────────────────────────────────────────────
    #[error("Unsupported HTTP method: {method}")]
    UnsupportedMethod { method: String },

    #[error("Request path has no resource type: {path}")]
    InvalidPath { path: String },

    #[error("{method} requires a resource id")]
    MissingResourceId { method: String },

    #[error("{method} requires a request body")]
    MissingBody { method: String },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    #[error("Device {identifier} has no associated {capability}")]
    CapabilityNotFound {
        identifier: String,
        capability: String,
    },

    #[error("Message has no action")]
    MissingAction,

    // ── Routine errors ───────────────────────────────────────────────
    #[error("Expression error: {0}")]
    Expr(String),

    // ── Remote API (wrapped, not exposed raw) ────────────────────────
    #[error("Remote API error: {message}")]
    Remote {
        message: String,
        /// HTTP status code, if the remote answered at all.
        status: Option<u16>,
    },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    // ── Cache persistence ────────────────────────────────────────────
    #[error("Cache snapshot error: {0}")]
    Snapshot(String),

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<hearth_api::Error> for CoreError {
    fn from(err: hearth_api::Error) -> Self {
        match err {
            hearth_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            hearth_api::Error::MissingToken => CoreError::AuthenticationFailed {
                message: "no auth token available".into(),
            },
            hearth_api::Error::RemoteApi { status, message } => CoreError::Remote {
                message,
                status: Some(status),
            },
            other => CoreError::Remote {
                message: other.to_string(),
                status: None,
            },
        }
    }
}
