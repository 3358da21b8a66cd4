use thiserror::Error;

/// Top-level error type for the `hearth-api` crate.
///
/// Covers every failure mode across the three transports: remote REST,
/// WebSocket hub, and MQTT broker. `hearth-core` maps these into
/// domain-level errors; nothing here is exposed to local HTTP callers raw.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Token exchange failed (wrong credentials, account disabled, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// A call was attempted without a token while one is required.
    #[error("No auth token available")]
    MissingToken,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Remote API ──────────────────────────────────────────────────
    /// Non-2xx status from the remote management API.
    #[error("Remote API error (HTTP {status}): {message}")]
    RemoteApi { status: u16, message: String },

    // ── WebSocket hub ───────────────────────────────────────────────
    /// WebSocket connection to the hub failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// Send on the hub link failed; the connection is torn down so the
    /// reconnect loop can re-establish it.
    #[error("WebSocket send failed: {0}")]
    WebSocketSend(String),

    // ── MQTT broker ─────────────────────────────────────────────────
    /// Request to the MQTT client task failed (publish/subscribe).
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::v5::ClientError),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::WebSocketConnect(_) | Self::WebSocketSend(_) => true,
            Self::Mqtt(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if this error indicates the token is no longer valid
    /// and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::MissingToken | Self::RemoteApi { status: 401, .. }
        )
    }

    /// Returns `true` if this is a "not found" response from the remote API.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RemoteApi { status: 404, .. })
    }
}
