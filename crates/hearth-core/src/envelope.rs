// ── Canonical message envelope ──
//
// The one wire contract every transport agrees on. Parsed and validated
// once at the ingress boundary; downstream components operate on the
// typed struct instead of re-parsing JSON at each stage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// A canonical message.
///
/// `src` is the originating device/profile identifier, `dest` the routing
/// destination (an MQTT topic or a logical channel), `action` the
/// namespaced verb (`"<domain>__<verb>"`), `body` an action-specific
/// payload that may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub src: String,

    #[serde(default)]
    pub dest: String,

    #[serde(default)]
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Envelope {
    /// Build an envelope for a self-originated message.
    pub fn new(
        src: impl Into<String>,
        dest: impl Into<String>,
        action: impl Into<String>,
        body: Option<Value>,
    ) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            action: action.into(),
            body,
        }
    }

    /// Parse and validate a raw frame.
    ///
    /// An envelope without an `action` cannot be dispatched; callers log
    /// the error and drop the message.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| CoreError::Internal(format!("invalid envelope JSON: {e}")))?;

        if envelope.action.is_empty() {
            return Err(CoreError::MissingAction);
        }

        Ok(envelope)
    }

    /// Serialize back to the wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_full_envelope() {
        let raw = r#"{"src":"dev1","dest":"plugs/1/command","action":"plug__set","body":{"is_on":true}}"#;
        let envelope = Envelope::parse(raw).expect("valid envelope");

        assert_eq!(envelope.src, "dev1");
        assert_eq!(envelope.dest, "plugs/1/command");
        assert_eq!(envelope.action, "plug__set");
        assert_eq!(envelope.body, Some(json!({"is_on": true})));
    }

    #[test]
    fn parse_missing_action_is_an_error() {
        let raw = r#"{"src":"dev1","dest":"somewhere"}"#;
        let result = Envelope::parse(raw);
        assert!(matches!(result, Err(CoreError::MissingAction)));
    }

    #[test]
    fn parse_invalid_json_is_an_error() {
        assert!(Envelope::parse("on").is_err());
        assert!(Envelope::parse("").is_err());
    }

    #[test]
    fn body_is_omitted_when_absent() {
        let envelope = Envelope::new("dev1", "", "plug__get", None);
        let json = envelope.to_json();
        assert!(!json.contains("body"));
    }

    #[test]
    fn round_trip() {
        let envelope = Envelope::new("dev1", "topic/a", "light__set", Some(json!({"brightness": 80})));
        let parsed = Envelope::parse(&envelope.to_json()).expect("round trip");
        assert_eq!(parsed, envelope);
    }
}
