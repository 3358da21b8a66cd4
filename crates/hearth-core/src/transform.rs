// ── Pattern-indexed message transformation ──
//
// A registry maps regex patterns over a routing key to transformer rules.
// Two instances exist at runtime: one keyed on a canonical envelope's
// `dest` (hub → broker direction), one keyed on the MQTT topic
// (broker → hub direction). Registries are explicit instances built at
// startup and passed by reference -- nothing here is process-global.
//
// A rule may emit zero, one, or many `(message, destination)` pairs.
// With no matching rule the input passes through unchanged; transformer
// failures are contained here and never reach the transports.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::envelope::Envelope;
use crate::error::CoreError;
use crate::resource::ResourceHandler;

/// Routing key used when the raw message cannot be parsed for one.
/// Downstream consumers still receive *something*.
pub const INVALID_TOPIC: &str = "invalid_topic";

// ── Emitter ──────────────────────────────────────────────────────────

/// Collects `(message, destination)` emissions from a rule.
#[derive(Default)]
pub struct Emitter {
    emissions: Vec<(String, String)>,
}

impl Emitter {
    pub fn emit(&mut self, message: impl Into<String>, destination: impl Into<String>) {
        self.emissions.push((message.into(), destination.into()));
    }
}

// ── Transformer trait ────────────────────────────────────────────────

/// One rewrite rule. `raw` is the untransformed message text, `key` the
/// routing key the rule's pattern matched.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn apply(&self, raw: &str, key: &str, emit: &mut Emitter) -> Result<(), CoreError>;
}

// ── TransformerRegistry ──────────────────────────────────────────────

/// Ordered set of pattern → rule associations. First match wins; there
/// is no priority system beyond registration order.
#[derive(Default)]
pub struct TransformerRegistry {
    rules: Vec<(Regex, Box<dyn Transformer>)>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a regex pattern with a rule.
    pub fn register(
        &mut self,
        pattern: &str,
        rule: Box<dyn Transformer>,
    ) -> Result<(), CoreError> {
        let regex = Regex::new(pattern)
            .map_err(|e| CoreError::Internal(format!("invalid transformer pattern: {e}")))?;
        self.rules.push((regex, rule));
        Ok(())
    }

    /// Transform a message, returning every `(message, destination)` pair
    /// the matched rule emitted.
    ///
    /// `key` is the externally supplied routing key (the MQTT topic for
    /// broker-inbound messages); when `None` the key is the `dest` field
    /// of the message itself. This method is total: malformed input and
    /// rule failures degrade to pass-through / partial output, never to
    /// an error.
    pub async fn transform(&self, raw: &str, key: Option<&str>) -> Vec<(String, String)> {
        let key = match key {
            Some(k) => k.to_owned(),
            None => match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(value) => value
                    .get("dest")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_owned(),
                Err(e) => {
                    warn!(error = %e, "message is not JSON, re-emitting unchanged");
                    return vec![(raw.to_owned(), INVALID_TOPIC.to_owned())];
                }
            },
        };

        for (pattern, rule) in &self.rules {
            if pattern.is_match(&key) {
                debug!(pattern = %pattern, key, "applying transformer");
                let mut emitter = Emitter::default();
                if let Err(e) = rule.apply(raw, &key, &mut emitter).await {
                    // Emissions collected before the failure stand.
                    error!(key, error = %e, "transformer failed");
                }
                return emitter.emissions;
            }
        }

        debug!(key, "no transformer matched, passing through");
        vec![(raw.to_owned(), key)]
    }
}

// ── Built-in rules: hub → broker ─────────────────────────────────────

/// `plug__set` command → bare switch payload for the device.
///
/// `{"action":"plug__set","body":{"device_id":"1","is_on":true}}` with
/// dest `plugs/1/command` becomes `("on", "plugs/1/command/switch:0")`.
/// Other plug actions pass through untouched.
struct PlugCommand;

#[async_trait]
impl Transformer for PlugCommand {
    async fn apply(&self, raw: &str, _key: &str, emit: &mut Emitter) -> Result<(), CoreError> {
        let envelope = Envelope::parse(raw)?;

        if envelope.action != "plug__set" {
            warn!(action = envelope.action, "leaving plug message as-is");
            emit.emit(raw, envelope.dest);
            return Ok(());
        }

        let body = envelope.body.as_ref().ok_or(CoreError::MissingBody {
            method: "plug__set".into(),
        })?;
        let device_id = body
            .get("device_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Internal("plug__set body has no device_id".into()))?;
        let is_on = body
            .get("is_on")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| CoreError::Internal("plug__set body has no is_on".into()))?;

        emit.emit(
            if is_on { "on" } else { "off" },
            format!("plugs/{device_id}/command/switch:0"),
        );
        Ok(())
    }
}

/// `light__set` command → per-property device commands.
///
/// One canonical message fans out into up to three wire messages: switch
/// state, brightness, color -- one per field present in the body.
struct LightCommand;

#[async_trait]
impl Transformer for LightCommand {
    async fn apply(&self, raw: &str, _key: &str, emit: &mut Emitter) -> Result<(), CoreError> {
        let envelope = Envelope::parse(raw)?;

        if envelope.action != "light__set" {
            warn!(action = envelope.action, "leaving light message as-is");
            emit.emit(raw, envelope.dest);
            return Ok(());
        }

        let body = envelope.body.as_ref().ok_or(CoreError::MissingBody {
            method: "light__set".into(),
        })?;
        let device_id = body
            .get("device_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Internal("light__set body has no device_id".into()))?;

        if let Some(is_on) = body.get("is_on").and_then(|v| v.as_bool()) {
            emit.emit(
                if is_on { "on" } else { "off" },
                format!("lights/{device_id}/command/switch:0"),
            );
        }
        if let Some(brightness) = body.get("brightness").and_then(|v| v.as_u64()) {
            emit.emit(
                brightness.to_string(),
                format!("lights/{device_id}/command/brightness"),
            );
        }
        if let Some(color) = body.get("color").and_then(|v| v.as_str()) {
            emit.emit(color, format!("lights/{device_id}/command/color"));
        }
        Ok(())
    }
}

// ── Built-in rules: broker → hub ─────────────────────────────────────

/// Device switch status report → canonical `plug__status` envelope.
///
/// Topic `plugs/<uuid>/status/switch:0`, payload `{"output": bool}`.
struct PlugStatus {
    topic: Regex,
}

#[async_trait]
impl Transformer for PlugStatus {
    async fn apply(&self, raw: &str, key: &str, emit: &mut Emitter) -> Result<(), CoreError> {
        let uuid = self
            .topic
            .captures(key)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| CoreError::Internal(format!("no device id in topic {key}")))?;

        let payload: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| CoreError::Internal(format!("invalid status payload: {e}")))?;
        let output = payload
            .get("output")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| CoreError::Internal("status payload has no output".into()))?;

        let envelope = Envelope::new(uuid, "", "plug__status", Some(json!({"is_on": output})));
        emit.emit(envelope.to_json(), key);
        Ok(())
    }
}

/// Environmental sensor report → canonical `environmental__status`
/// envelope. The device is resolved through the resource layer first;
/// reports from unknown devices are dropped.
struct EnvironmentalStatus {
    topic: Regex,
    resources: Arc<ResourceHandler>,
}

#[async_trait]
impl Transformer for EnvironmentalStatus {
    async fn apply(&self, raw: &str, key: &str, emit: &mut Emitter) -> Result<(), CoreError> {
        let uuid = self
            .topic
            .captures(key)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| CoreError::Internal(format!("no device id in topic {key}")))?;

        let payload: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| CoreError::Internal(format!("invalid status payload: {e}")))?;

        let device = self
            .resources
            .handle_request("GET", &format!("devices/{uuid}"), None)
            .await?;
        if device.is_null() {
            error!(uuid, "environmental report from unknown device, dropping");
            return Ok(());
        }

        let envelope = Envelope::new(uuid, "", "environmental__status", Some(payload));
        emit.emit(envelope.to_json(), key);
        Ok(())
    }
}

// ── Registry construction ────────────────────────────────────────────

const PLUG_STATUS_TOPIC: &str = r"^plugs/([0-9a-zA-Z-]+)/status/switch:0$";
const ENVIRONMENTAL_STATUS_TOPIC: &str = r"^environmentals/([0-9a-zA-Z-]+)/status$";

/// Registry for the hub → broker direction, keyed on envelope `dest`.
pub fn hub_registry() -> Result<TransformerRegistry, CoreError> {
    let mut registry = TransformerRegistry::new();
    registry.register(r"^plugs/[0-9a-zA-Z-]+/command$", Box::new(PlugCommand))?;
    registry.register(r"^lights/[0-9a-zA-Z-]+/command$", Box::new(LightCommand))?;
    Ok(registry)
}

/// Registry for the broker → hub direction, keyed on the MQTT topic.
pub fn broker_registry(
    resources: Arc<ResourceHandler>,
) -> Result<TransformerRegistry, CoreError> {
    let compile = |pattern: &str| {
        Regex::new(pattern).map_err(|e| CoreError::Internal(format!("invalid pattern: {e}")))
    };

    let mut registry = TransformerRegistry::new();
    registry.register(
        PLUG_STATUS_TOPIC,
        Box::new(PlugStatus {
            topic: compile(PLUG_STATUS_TOPIC)?,
        }),
    )?;
    registry.register(
        ENVIRONMENTAL_STATUS_TOPIC,
        Box::new(EnvironmentalStatus {
            topic: compile(ENVIRONMENTAL_STATUS_TOPIC)?,
            resources,
        }),
    )?;
    Ok(registry)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::ResourceCache;
    use crate::controller::OnlineFlag;
    use hearth_api::{RemoteClient, TransportConfig};
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
    async fn plug_set_command_is_rewritten() {
        let registry = hub_registry().unwrap();
        let raw = r#"{"src":"dev1","dest":"plugs/1/command","action":"plug__set","body":{"device_id":"1","is_on":true}}"#;

        let out = registry.transform(raw, None).await;

        assert_eq!(
            out,
            vec![("on".to_owned(), "plugs/1/command/switch:0".to_owned())]
        );
    }

    #[tokio::test]
    async fn plug_set_off_is_rewritten() {
        let registry = hub_registry().unwrap();
        let raw = r#"{"dest":"plugs/1/command","action":"plug__set","body":{"device_id":"1","is_on":false}}"#;

        let out = registry.transform(raw, None).await;
        assert_eq!(out[0].0, "off");
    }

    #[tokio::test]
    async fn other_plug_actions_pass_through() {
        let registry = hub_registry().unwrap();
        let raw = r#"{"dest":"plugs/1/command","action":"plug__get"}"#;

        let out = registry.transform(raw, None).await;
        assert_eq!(out, vec![(raw.to_owned(), "plugs/1/command".to_owned())]);
    }

    #[tokio::test]
    async fn light_set_fans_out_per_field() {
        let registry = hub_registry().unwrap();
        let raw = r##"{"dest":"lights/l1/command","action":"light__set","body":{"device_id":"l1","is_on":true,"brightness":80,"color":"#ff8800"}}"##;

        let out = registry.transform(raw, None).await;

        assert_eq!(
            out,
            vec![
                ("on".to_owned(), "lights/l1/command/switch:0".to_owned()),
                ("80".to_owned(), "lights/l1/command/brightness".to_owned()),
                ("#ff8800".to_owned(), "lights/l1/command/color".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn unmatched_dest_passes_through() {
        let registry = hub_registry().unwrap();
        let raw = r#"{"dest":"somewhere/else","action":"noop"}"#;

        let out = registry.transform(raw, None).await;
        assert_eq!(out, vec![(raw.to_owned(), "somewhere/else".to_owned())]);
    }

    #[tokio::test]
    async fn invalid_json_reemits_with_invalid_topic() {
        let registry = hub_registry().unwrap();

        let out = registry.transform("not json at all", None).await;
        assert_eq!(
            out,
            vec![("not json at all".to_owned(), INVALID_TOPIC.to_owned())]
        );
    }

    #[tokio::test]
    async fn plug_status_becomes_canonical_envelope() {
        let registry = broker_registry(offline_resources()).unwrap();
        let topic = "plugs/0b2c4f62-9f5a-4f51-8c1e-0a1b2c3d4e5f/status/switch:0";

        let out = registry.transform(r#"{"output":false}"#, Some(topic)).await;

        assert_eq!(out.len(), 1);
        let envelope = Envelope::parse(&out[0].0).unwrap();
        assert_eq!(envelope.action, "plug__status");
        assert_eq!(envelope.src, "0b2c4f62-9f5a-4f51-8c1e-0a1b2c3d4e5f");
        assert_eq!(envelope.body.unwrap()["is_on"], false);
    }

    #[tokio::test]
    async fn malformed_status_payload_emits_nothing() {
        let registry = broker_registry(offline_resources()).unwrap();
        let topic = "plugs/p1/status/switch:0";

        let out = registry.transform("garbage", Some(topic)).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn environmental_report_requires_known_device() {
        let resources = offline_resources();
        let registry = broker_registry(Arc::clone(&resources)).unwrap();
        let topic = "environmentals/e1/status";
        let payload = r#"{"temperature_c":21.5,"humidity":40.0}"#;

        // Unknown device: dropped.
        let out = registry.transform(payload, Some(topic)).await;
        assert!(out.is_empty());

        // Known device: emitted.
        resources
            .cache()
            .add("devices", serde_json::json!({"uuid": "e1", "environmental": "env1"}));
        let out = registry.transform(payload, Some(topic)).await;
        assert_eq!(out.len(), 1);
        let envelope = Envelope::parse(&out[0].0).unwrap();
        assert_eq!(envelope.action, "environmental__status");
    }

    #[tokio::test]
    async fn first_registered_pattern_wins() {
        struct Tagged(&'static str);

        #[async_trait]
        impl Transformer for Tagged {
            async fn apply(
                &self,
                _raw: &str,
                _key: &str,
                emit: &mut Emitter,
            ) -> Result<(), CoreError> {
                emit.emit(self.0, "out");
                Ok(())
            }
        }

        let mut registry = TransformerRegistry::new();
        registry.register("^a/.*$", Box::new(Tagged("first"))).unwrap();
        registry.register("^a/b$", Box::new(Tagged("second"))).unwrap();

        let out = registry.transform("x", Some("a/b")).await;
        assert_eq!(out[0].0, "first");
    }

    #[tokio::test]
    async fn failing_rule_keeps_prior_emissions() {
        struct EmitThenFail;

        #[async_trait]
        impl Transformer for EmitThenFail {
            async fn apply(
                &self,
                _raw: &str,
                _key: &str,
                emit: &mut Emitter,
            ) -> Result<(), CoreError> {
                emit.emit("partial", "out");
                Err(CoreError::Internal("boom".into()))
            }
        }

        let mut registry = TransformerRegistry::new();
        registry.register("^t$", Box::new(EmitThenFail)).unwrap();

        let out = registry.transform("x", Some("t")).await;
        assert_eq!(out, vec![("partial".to_owned(), "out".to_owned())]);
    }
}
