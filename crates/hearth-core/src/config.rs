// ── Runtime bridge configuration ──
//
// Describes *where* everything lives: the remote management API, the MQTT
// broker, and the local server. Built by hearth-config (or by tests) and
// handed in -- core never reads the environment or disk itself.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

/// Configuration for one bridge process.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Remote management API host (e.g. `192.168.1.10`).
    pub remote_host: String,
    /// Remote management API port.
    pub remote_port: u16,
    /// Username for the remote token exchange.
    pub username: String,
    /// Password for the remote token exchange.
    pub password: SecretString,
    /// Path prefix resource endpoints live under (e.g. `/api`).
    pub api_prefix: String,

    /// MQTT broker host.
    pub mqtt_host: String,
    /// MQTT broker port.
    pub mqtt_port: u16,

    /// Identifier this bridge uses on the broker and as `src` in
    /// self-originated messages.
    pub device_id: String,

    /// Port the local HTTP/WebSocket server listens on.
    pub local_port: u16,

    /// Interval between remote health probes.
    pub health_interval: Duration,

    /// Fixed delay between hub reconnect attempts.
    pub reconnect_delay: Duration,

    /// Optional path for the cache JSON snapshot.
    pub cache_snapshot: Option<PathBuf>,
}

impl BridgeConfig {
    /// Base URL of the remote management API.
    pub fn remote_url(&self) -> Url {
        let raw = format!("http://{}:{}", self.remote_host, self.remote_port);
        Url::parse(&raw).expect("remote host/port form a valid URL")
    }

    /// WebSocket endpoint on the hub, without credentials.
    pub fn hub_ws_url(&self) -> Url {
        let raw = format!(
            "ws://{}:{}/ws/controllers",
            self.remote_host, self.remote_port
        );
        Url::parse(&raw).expect("remote host/port form a valid URL")
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            remote_host: "localhost".into(),
            remote_port: 8000,
            username: "controller".into(),
            password: SecretString::from(String::new()),
            api_prefix: "/api".into(),
            mqtt_host: "localhost".into(),
            mqtt_port: 1883,
            device_id: "controller".into(),
            local_port: 8080,
            health_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            cache_snapshot: None,
        }
    }
}
