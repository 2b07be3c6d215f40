//! Application messages carried over the data channel.
//!
//! Structured messages are JSON `{ "type": ..., "payload": ... }`. Anything
//! that does not parse as such an envelope is plain chat text (greetings and
//! typed messages are sent raw).

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::motion::Vector3;

/// Structured data channel messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DataMessage {
    /// Raw accelerometer sample from the remote device
    #[serde(rename = "remote_move")]
    RemoteMove(Vector3),
}

impl DataMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            DataMessage::RemoteMove(_) => "remote_move",
        }
    }
}

/// Result of decoding one inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Chat(String),
    Data(DataMessage),
    /// Well-formed envelope with a type this build does not know
    Ignored,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

pub fn encode(msg: &DataMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

pub fn decode(text: &str) -> Inbound {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(_) => return Inbound::Chat(text.to_string()),
    };

    match envelope.kind.as_str() {
        "remote_move" => match serde_json::from_value::<Vector3>(envelope.payload) {
            Ok(sample) => Inbound::Data(DataMessage::RemoteMove(sample)),
            Err(e) => {
                warn!("Dropping remote_move with malformed payload: {}", e);
                Inbound::Ignored
            }
        },
        other => {
            debug!("Dropping message of unknown type {:?}", other);
            Inbound::Ignored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_move_round_trip() {
        let msg = DataMessage::RemoteMove(Vector3::new(1.0, 2.0, 3.0));
        let json = encode(&msg).unwrap();
        assert!(json.contains(r#""type":"remote_move""#));
        assert!(json.contains(r#""payload":{"x":1.0,"y":2.0,"z":3.0}"#));

        assert_eq!(decode(&json), Inbound::Data(msg));
    }

    #[test]
    fn test_parse_browser_format() {
        // Integers as the browser's JSON.stringify writes them
        let raw = r#"{"type":"remote_move","payload":{"x":1,"y":2,"z":3}}"#;
        match decode(raw) {
            Inbound::Data(DataMessage::RemoteMove(v)) => {
                assert_eq!(v, Vector3::new(1.0, 2.0, 3.0));
            }
            other => panic!("Expected remote_move, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_text_falls_back_to_chat() {
        assert_eq!(decode("hello"), Inbound::Chat("hello".into()));
        assert_eq!(
            decode("Created by 1234"),
            Inbound::Chat("Created by 1234".into())
        );
    }

    #[test]
    fn test_json_that_is_not_an_envelope_is_chat() {
        assert_eq!(decode("42"), Inbound::Chat("42".into()));
        assert_eq!(decode(r#"{"x":1}"#), Inbound::Chat(r#"{"x":1}"#.into()));
    }

    #[test]
    fn test_unknown_type_dropped() {
        assert_eq!(
            decode(r#"{"type":"remote_click","payload":{}}"#),
            Inbound::Ignored
        );
    }

    #[test]
    fn test_malformed_payload_dropped() {
        assert_eq!(
            decode(r#"{"type":"remote_move","payload":{"x":"left"}}"#),
            Inbound::Ignored
        );
    }

    #[test]
    fn test_msg_type() {
        assert_eq!(
            DataMessage::RemoteMove(Vector3::ORIGIN).msg_type(),
            "remote_move"
        );
    }
}
