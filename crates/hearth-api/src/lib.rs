// hearth-api: async transport adapters for the hearth bridge daemon
// (remote management REST API, WebSocket hub link, MQTT broker link).

pub mod error;
pub mod mqtt;
pub mod rest;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub use mqtt::{BrokerClient, BrokerHandle};
pub use rest::RemoteClient;
pub use transport::TransportConfig;
pub use websocket::{HubClient, HubHandle};
