//! Client identities and the message envelope exchanged between the
//! pumps, the registry, and the application handler.

use crate::error::{PlexusError, PlexusResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, application-assigned key identifying a connected peer.
///
/// The registry only compares and hashes identities; uniqueness is up to
/// the application handler that hands them out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty identity is treated as a declined connection.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for ClientId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// A routed message.
///
/// `to == None` addresses every established client. On the wire the
/// `kind` field is spelled `type`; `from` and `to` may be omitted by
/// clients since the server fills in `from` itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ClientId>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Create a broadcast envelope with no sender.
    pub fn new(kind: impl Into<String>, data: impl Into<serde_json::Value>) -> Self {
        Self {
            from: None,
            to: None,
            kind: kind.into(),
            data: data.into(),
        }
    }

    /// Address the envelope to a single client.
    pub fn with_to(mut self, to: impl Into<ClientId>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Stamp the envelope with its sender.
    pub fn with_from(mut self, from: impl Into<ClientId>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Deserialize the payload into a typed value.
    pub fn decode_data<T: DeserializeOwned>(&self) -> PlexusResult<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| PlexusError::Decode(format!("payload of {:?}: {e}", self.kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_id_conversions() {
        assert_eq!(ClientId::from("alice").as_str(), "alice");
        assert_eq!(ClientId::from(42u64).to_string(), "42");
        assert!(ClientId::from("").is_empty());
    }

    #[test]
    fn builder_sets_routing_fields() {
        let env = Envelope::new("ping", "x").with_to("bob").with_from("alice");
        assert_eq!(env.to, Some(ClientId::from("bob")));
        assert_eq!(env.from, Some(ClientId::from("alice")));
        assert!(!env.is_broadcast());
        assert!(Envelope::new("tick", 1).is_broadcast());
    }

    #[test]
    fn wire_shape_uses_type_and_skips_missing_routes() {
        let env = Envelope::new("message", "hi");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({"type": "message", "data": "hi"}));
    }

    #[test]
    fn client_frames_may_omit_everything_but_type() {
        let env: Envelope = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind, "ping");
        assert_eq!(env.from, None);
        assert!(env.data.is_null());
    }

    #[test]
    fn decode_data_typed() {
        let env = Envelope::new("message", json!({"n": 3}));
        #[derive(Deserialize)]
        struct Payload {
            n: u32,
        }
        let p: Payload = env.decode_data().unwrap();
        assert_eq!(p.n, 3);

        let err = env.decode_data::<String>().unwrap_err();
        assert!(err.is_recoverable());
    }
}
