// ── Canonical action dispatch ──
//
// Routes envelopes to typed business handlers that mutate remote resource
// state through the resource layer (set a light's brightness, record a
// plug's reported switch state, ...). The registry is an explicit
// instance: handlers are registered at construction, not on a class-level
// map, so each test can build its own.
//
// Expected message shape:
//
// {
//     "src": string,    // typically the source device id
//     "dest": string,   // for WS<->MQTT, the topic
//     "action": string, // e.g. "plug__set"
//     "body": { ... }   // optional action payload
// }

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::envelope::Envelope;
use crate::error::CoreError;
use crate::resource::ResourceHandler;

pub const ACTION_PLUG_SET: &str = "plug__set";
pub const ACTION_LIGHT_SET: &str = "light__set";
pub const ACTION_PLUG_STATUS: &str = "plug__status";
pub const ACTION_ENVIRONMENTAL_STATUS: &str = "environmental__status";
pub const ACTION_SYSTEM_STATUS: &str = "system__status";
pub const ACTION_DIAL_STATUS: &str = "dial__status";

// ── ActionHandler trait ──────────────────────────────────────────────

/// One typed business handler, bound to a single action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        resources: &ResourceHandler,
        message: &Envelope,
    ) -> Result<(), CoreError>;
}

// ── MessageHandler ───────────────────────────────────────────────────

/// Dispatches canonical messages to their registered action handler.
pub struct MessageHandler {
    resources: Arc<ResourceHandler>,
    handlers: HashMap<String, Box<dyn ActionHandler>>,
}

impl MessageHandler {
    /// An empty registry; register handlers explicitly.
    pub fn new(resources: Arc<ResourceHandler>) -> Self {
        Self {
            resources,
            handlers: HashMap::new(),
        }
    }

    /// The standard set of device handlers.
    pub fn with_default_handlers(resources: Arc<ResourceHandler>) -> Self {
        let mut handler = Self::new(resources);
        handler.register(ACTION_LIGHT_SET, Box::new(LightSet));
        handler.register(ACTION_PLUG_SET, Box::new(PlugSet));
        handler.register(ACTION_PLUG_STATUS, Box::new(PlugStatus));
        handler.register(ACTION_ENVIRONMENTAL_STATUS, Box::new(EnvironmentalStatus));
        handler.register(ACTION_SYSTEM_STATUS, Box::new(SystemStatus));
        handler.register(ACTION_DIAL_STATUS, Box::new(DialStatus));
        handler
    }

    /// Register a handler for an action, replacing any existing one.
    pub fn register(&mut self, action: impl Into<String>, handler: Box<dyn ActionHandler>) {
        self.handlers.insert(action.into(), handler);
    }

    /// Parse a raw frame and dispatch it. Messages without an action, or
    /// that are not JSON at all, are logged and dropped -- never an error.
    pub async fn handle(&self, raw: &str) {
        match Envelope::parse(raw) {
            Ok(envelope) => self.handle_envelope(&envelope).await,
            Err(CoreError::MissingAction) => {
                warn!("received a message without an action, ignoring");
            }
            Err(e) => {
                warn!(error = %e, "received an invalid message, ignoring");
            }
        }
    }

    /// Dispatch an already-validated envelope.
    pub async fn handle_envelope(&self, envelope: &Envelope) {
        let Some(handler) = self.handlers.get(&envelope.action) else {
            warn!(action = envelope.action, "no handler found for action");
            return;
        };

        debug!(action = envelope.action, "dispatching to action handler");
        if let Err(e) = handler.handle(&self.resources, envelope).await {
            error!(action = envelope.action, error = %e, "action handler failed");
        }
    }
}

// ── Shared helpers ───────────────────────────────────────────────────

/// Fetch the device and return the id of one of its capability
/// sub-resources (the value of `field` on the device object).
async fn device_capability(
    resources: &ResourceHandler,
    device_id: &str,
    field: &str,
) -> Result<String, CoreError> {
    let device = resources
        .handle_request("GET", &format!("devices/{device_id}"), None)
        .await?;

    if !device.is_object() {
        return Err(CoreError::DeviceNotFound {
            identifier: device_id.to_owned(),
        });
    }

    match device.get(field) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(CoreError::CapabilityNotFound {
            identifier: device_id.to_owned(),
            capability: field.to_owned(),
        }),
    }
}

/// Build an update payload from the body, copying only the fields that
/// are present. `(source_field, target_field)` pairs allow renames.
fn present_fields(body: &Value, fields: &[(&str, &str)]) -> Value {
    let mut out = Map::new();
    for (source, target) in fields {
        if let Some(value) = body.get(*source) {
            if !value.is_null() {
                out.insert((*target).to_owned(), value.clone());
            }
        }
    }
    Value::Object(out)
}

fn require_body(message: &Envelope) -> Result<&Value, CoreError> {
    message.body.as_ref().ok_or(CoreError::MissingBody {
        method: message.action.clone(),
    })
}

fn body_device_id(body: &Value) -> Result<&str, CoreError> {
    body.get("device_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::Internal("body has no device_id".into()))
}

// ── Typed handlers ───────────────────────────────────────────────────

/// body: { "device_id": uuid, "is_on"?: bool, "brightness"?: number, "color"?: string }
struct LightSet;

#[async_trait]
impl ActionHandler for LightSet {
    async fn handle(
        &self,
        resources: &ResourceHandler,
        message: &Envelope,
    ) -> Result<(), CoreError> {
        let body = require_body(message)?;
        let device_id = body_device_id(body)?;
        let light_id = device_capability(resources, device_id, "light").await?;

        let data = present_fields(
            body,
            &[("brightness", "brightness"), ("is_on", "is_on"), ("color", "color")],
        );
        resources
            .handle_request("PUT", &format!("lights/{light_id}"), Some(data))
            .await?;
        info!(device_id, "set light settings");
        Ok(())
    }
}

/// body: { "device_id": uuid, "is_on": bool }
struct PlugSet;

#[async_trait]
impl ActionHandler for PlugSet {
    async fn handle(
        &self,
        resources: &ResourceHandler,
        message: &Envelope,
    ) -> Result<(), CoreError> {
        let body = require_body(message)?;
        let device_id = body_device_id(body)?;
        let plug_id = device_capability(resources, device_id, "plug").await?;

        let data = present_fields(body, &[("is_on", "is_on")]);
        resources
            .handle_request("PUT", &format!("plugs/{plug_id}"), Some(data))
            .await?;
        info!(device_id, "set plug state");
        Ok(())
    }
}

/// Device-reported switch state; `src` names the reporting device.
struct PlugStatus;

#[async_trait]
impl ActionHandler for PlugStatus {
    async fn handle(
        &self,
        resources: &ResourceHandler,
        message: &Envelope,
    ) -> Result<(), CoreError> {
        let body = require_body(message)?;
        let plug_id = device_capability(resources, &message.src, "plug").await?;

        let data = present_fields(body, &[("is_on", "is_on")]);
        resources
            .handle_request("PUT", &format!("plugs/{plug_id}"), Some(data))
            .await?;
        info!(src = message.src, "updated plug status");
        Ok(())
    }
}

/// Sensor report; `src` names the reporting device.
struct EnvironmentalStatus;

#[async_trait]
impl ActionHandler for EnvironmentalStatus {
    async fn handle(
        &self,
        resources: &ResourceHandler,
        message: &Envelope,
    ) -> Result<(), CoreError> {
        let body = require_body(message)?;
        let environmental_id =
            device_capability(resources, &message.src, "environmental").await?;

        let data = present_fields(
            body,
            &[("temperature_c", "temperature_c"), ("humidity", "humidity")],
        );
        resources
            .handle_request("PUT", &format!("environmentals/{environmental_id}"), Some(data))
            .await?;
        info!(src = message.src, "updated environmental sensor");
        Ok(())
    }
}

/// Host metrics report; `src` names the reporting device.
struct SystemStatus;

#[async_trait]
impl ActionHandler for SystemStatus {
    async fn handle(
        &self,
        resources: &ResourceHandler,
        message: &Envelope,
    ) -> Result<(), CoreError> {
        let body = require_body(message)?;
        let system_id = device_capability(resources, &message.src, "system").await?;

        let data = present_fields(
            body,
            &[
                ("cpu_usage", "cpu_usage"),
                ("cpu_temperature", "cpu_temp"),
                ("memory_usage", "mem_usage"),
                ("disk_usage", "disk_usage"),
                ("network_sent", "network_sent"),
                ("network_received", "network_received"),
            ],
        );
        resources
            .handle_request("PUT", &format!("systems/{system_id}"), Some(data))
            .await?;
        info!(src = message.src, "updated system metrics");
        Ok(())
    }
}

/// Dial device heartbeat; no payload fields yet.
struct DialStatus;

#[async_trait]
impl ActionHandler for DialStatus {
    async fn handle(
        &self,
        resources: &ResourceHandler,
        message: &Envelope,
    ) -> Result<(), CoreError> {
        let dial_id = device_capability(resources, &message.src, "dial").await?;

        resources
            .handle_request("PUT", &format!("devices/{dial_id}"), Some(Value::Object(Map::new())))
            .await?;
        info!(src = message.src, "updated dial status");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::ResourceCache;
    use crate::controller::OnlineFlag;
    use hearth_api::{RemoteClient, TransportConfig};
    use serde_json::json;
    use tokio::sync::watch;
    use url::Url;

    fn offline_resources() -> Arc<ResourceHandler> {
        let remote = RemoteClient::new(
            Url::parse("http://127.0.0.1:1").unwrap(),
            "/api",
            &TransportConfig::default(),
        )
        .unwrap();
        let (token_tx, token_rx) = watch::channel(None);
        drop(token_tx);
        Arc::new(ResourceHandler::new(
            remote,
            Arc::new(ResourceCache::new()),
            token_rx,
            OnlineFlag::new(false),
            "/api",
        ))
    }

    #[tokio::test]
    async fn message_without_action_is_a_noop() {
        let resources = offline_resources();
        let handler = MessageHandler::with_default_handlers(Arc::clone(&resources));

        handler.handle(r#"{"src":"dev1","dest":"x"}"#).await;
        handler.handle("not json").await;

        assert!(resources.pending_writes().is_empty());
    }

    #[tokio::test]
    async fn unknown_action_is_a_noop() {
        let resources = offline_resources();
        let handler = MessageHandler::with_default_handlers(Arc::clone(&resources));

        handler.handle(r#"{"action":"mystery__verb"}"#).await;

        assert!(resources.pending_writes().is_empty());
    }

    #[tokio::test]
    async fn plug_set_updates_the_capability_resource() {
        let resources = offline_resources();
        resources.cache().add("devices", json!({"uuid": "d1", "plug": "p1"}));
        resources.cache().add("plugs", json!({"uuid": "p1", "is_on": false}));

        let handler = MessageHandler::with_default_handlers(Arc::clone(&resources));
        handler
            .handle(r#"{"action":"plug__set","body":{"device_id":"d1","is_on":true}}"#)
            .await;

        assert_eq!(resources.cache().one("plugs", "p1").unwrap()["is_on"], true);
    }

    #[tokio::test]
    async fn light_set_copies_only_present_fields() {
        let resources = offline_resources();
        resources.cache().add("devices", json!({"uuid": "d1", "light": "l1"}));
        resources
            .cache()
            .add("lights", json!({"uuid": "l1", "is_on": false, "brightness": 10, "color": "#fff"}));

        let handler = MessageHandler::with_default_handlers(Arc::clone(&resources));
        handler
            .handle(r#"{"action":"light__set","body":{"device_id":"d1","brightness":80}}"#)
            .await;

        let light = resources.cache().one("lights", "l1").unwrap();
        assert_eq!(light["brightness"], 80);
        assert_eq!(light["is_on"], false); // untouched
        assert_eq!(light["color"], "#fff"); // untouched
    }

    #[tokio::test]
    async fn status_reports_resolve_the_device_from_src() {
        let resources = offline_resources();
        resources.cache().add("devices", json!({"uuid": "d1", "environmental": "e1"}));
        resources
            .cache()
            .add("environmentals", json!({"uuid": "e1", "temperature_c": 0.0}));

        let handler = MessageHandler::with_default_handlers(Arc::clone(&resources));
        handler
            .handle(
                r#"{"src":"d1","action":"environmental__status","body":{"temperature_c":21.5,"humidity":40.0}}"#,
            )
            .await;

        let sensor = resources.cache().one("environmentals", "e1").unwrap();
        assert_eq!(sensor["temperature_c"], 21.5);
        assert_eq!(sensor["humidity"], 40.0);
    }

    #[tokio::test]
    async fn missing_capability_does_not_panic_or_write() {
        let resources = offline_resources();
        resources.cache().add("devices", json!({"uuid": "d1"})); // no plug field

        let handler = MessageHandler::with_default_handlers(Arc::clone(&resources));
        handler
            .handle(r#"{"action":"plug__set","body":{"device_id":"d1","is_on":true}}"#)
            .await;

        assert!(resources.pending_writes().is_empty());
    }

    #[tokio::test]
    async fn system_status_renames_report_fields() {
        let resources = offline_resources();
        resources.cache().add("devices", json!({"uuid": "d1", "system": "s1"}));
        resources.cache().add("systems", json!({"uuid": "s1"}));

        let handler = MessageHandler::with_default_handlers(Arc::clone(&resources));
        handler
            .handle(
                r#"{"src":"d1","action":"system__status","body":{"cpu_usage":12.5,"cpu_temperature":55.0,"memory_usage":40.0}}"#,
            )
            .await;

        let system = resources.cache().one("systems", "s1").unwrap();
        assert_eq!(system["cpu_usage"], 12.5);
        assert_eq!(system["cpu_temp"], 55.0);
        assert_eq!(system["mem_usage"], 40.0);
    }
}
