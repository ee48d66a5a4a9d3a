//! Wire codec for envelopes.
//!
//! Two formats are supported: JSON carried in text frames (the default,
//! readable from a browser) and CBOR carried in binary frames.

use crate::error::{PlexusError, PlexusResult};
use crate::message::Envelope;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Default maximum inbound message size (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 16;

/// One transport-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// Reject frames above `max` bytes.
    pub fn check_size(&self, max: usize) -> PlexusResult<()> {
        let size = self.len();
        if size > max {
            return Err(PlexusError::FrameTooLarge { size, max });
        }
        Ok(())
    }
}

/// Envelope encoding used on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Cbor,
}

impl WireFormat {
    pub fn encode(&self, envelope: &Envelope) -> PlexusResult<Frame> {
        match self {
            Self::Json => serde_json::to_string(envelope)
                .map(Frame::Text)
                .map_err(|e| PlexusError::Encode(e.to_string())),
            Self::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(envelope, &mut buf)?;
                Ok(Frame::Binary(buf))
            }
        }
    }

    pub fn decode(&self, frame: &Frame) -> PlexusResult<Envelope> {
        match self {
            Self::Json => Ok(serde_json::from_slice(frame.as_bytes())?),
            Self::Cbor => match frame {
                Frame::Binary(data) => Ok(ciborium::from_reader(Cursor::new(data))?),
                Frame::Text(_) => Err(PlexusError::Decode(
                    "text frame on a CBOR connection".into(),
                )),
            },
        }
    }
}

impl std::str::FromStr for WireFormat {
    type Err = PlexusError;

    fn from_str(s: &str) -> PlexusResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(PlexusError::Config(format!(
                "unknown wire format: {other} (expected json or cbor)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_uses_text_frames() {
        let env = Envelope::new("message", "hello").with_from("alice");
        let frame = WireFormat::Json.encode(&env).unwrap();
        match &frame {
            Frame::Text(s) => assert!(s.contains(r#""type":"message""#)),
            Frame::Binary(_) => panic!("expected text frame"),
        }
        assert_eq!(WireFormat::Json.decode(&frame).unwrap(), env);
    }

    #[test]
    fn json_accepts_binary_frames() {
        let frame = Frame::Binary(br#"{"type":"ping","data":"x"}"#.to_vec());
        let env = WireFormat::Json.decode(&frame).unwrap();
        assert_eq!(env.kind, "ping");
        assert_eq!(env.data, json!("x"));
    }

    #[test]
    fn cbor_preserves_structured_payloads() {
        let env = Envelope::new("state", json!({"x": 1, "tags": ["a", "b"]})).with_to("bob");
        let frame = WireFormat::Cbor.encode(&env).unwrap();
        assert!(matches!(frame, Frame::Binary(_)));
        assert_eq!(WireFormat::Cbor.decode(&frame).unwrap(), env);
    }

    #[test]
    fn cbor_rejects_text() {
        let err = WireFormat::Cbor
            .decode(&Frame::Text("{}".into()))
            .unwrap_err();
        assert!(matches!(err, PlexusError::Decode(_)));
    }

    #[test]
    fn malformed_json_is_recoverable() {
        let err = WireFormat::Json
            .decode(&Frame::Text("{not json".into()))
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn size_limit() {
        let frame = Frame::Binary(vec![0; 10]);
        assert!(frame.check_size(10).is_ok());
        let err = frame.check_size(9).unwrap_err();
        assert!(matches!(err, PlexusError::FrameTooLarge { size: 10, max: 9 }));
    }

    #[test]
    fn parse_wire_format() {
        assert_eq!("JSON".parse::<WireFormat>().unwrap(), WireFormat::Json);
        assert_eq!("cbor".parse::<WireFormat>().unwrap(), WireFormat::Cbor);
        assert!("xml".parse::<WireFormat>().is_err());
    }
}
