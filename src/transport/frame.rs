//! Wire Frame Normalization
//!
//! Both push transports deliver JSON frames of slightly different shapes.
//! Everything is reduced here to a [`Frame`]: a control frame or an
//! [`InboundMessage`] carrying topic, payload and server timestamp.
//!
//! Accepted shapes:
//!
//! ```text
//! {"type": "score-delta", "payload": {...}, "server_timestamp": 1700000000000}
//! {"event": "hero.updated", "channel": "match.7", "data": "{\"hero\":...}"}
//! {"topic": "stat-delta", "payload": {...}, "serverTimestamp": "2024-05-01T12:00:00Z"}
//! ```

use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use tracing::trace;

use crate::model::state::Timestamp;
use crate::model::update::{InboundMessage, Topic};

/// Keys that may carry the server timestamp, in lookup order.
const TIMESTAMP_KEYS: [&str; 3] = ["server_timestamp", "serverTimestamp", "timestamp"];

/// Envelope keys stripped when the payload is the frame itself.
const ENVELOPE_KEYS: [&str; 6] = ["type", "event", "topic", "channel", "socket_id", "match_id"];

/// Normalized inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Server accepted the subscription.
    SubscriptionSucceeded {
        /// Channel named by the server, if any.
        channel: Option<String>,
    },
    /// Server rejected the subscription.
    SubscriptionError {
        /// Reason given by the server.
        reason: String,
    },
    /// Reply to a client ping.
    Pong {
        /// Echoed ping timestamp.
        nonce: Option<u64>,
    },
    /// Unsolicited server keep-alive.
    Heartbeat,
    /// Match update.
    Update(InboundMessage),
    /// Well-formed frame of no interest.
    Ignored {
        /// Event name.
        name: String,
    },
}

/// Frames the client sends over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Join a channel.
    Subscribe {
        /// Channel key.
        channel: String,
    },
    /// Leave a channel.
    Unsubscribe {
        /// Channel key.
        channel: String,
    },
    /// Liveness check.
    Ping {
        /// Client nonce, echoed by the pong.
        timestamp: u64,
    },
}

impl ClientFrame {
    /// Serialize to JSON text.
    pub fn to_json(&self) -> String {
        // Plain tagged enum with string keys; encoding cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Decode a socket frame, multiplexed by its `type`/`event`/`topic` key.
pub fn decode_socket_frame(text: &str) -> Result<Frame, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| format!("invalid JSON: {}", e))?;
    let Value::Object(obj) = value else {
        return Err("frame is not a JSON object".to_string());
    };
    let name = ["topic", "type", "event"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| "frame has no type".to_string())?;
    classify(&name, obj)
}

/// Decode an event-stream event (`event:` field plus joined `data:` lines).
pub fn decode_stream_event(event: Option<&str>, data: &str) -> Result<Frame, String> {
    let name = event.unwrap_or("message");
    let obj = if data.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(data) {
            Ok(Value::Object(obj)) => obj,
            Ok(_) => return Err(format!("{} data is not a JSON object", name)),
            Err(e) => return Err(format!("invalid JSON in {} event: {}", name, e)),
        }
    };
    // Generic `message` events name their topic inside the body.
    let inner = obj.get("topic").or_else(|| obj.get("type")).and_then(Value::as_str);
    match (name, inner) {
        ("message", Some(inner)) => {
            let inner = inner.to_string();
            classify(&inner, obj)
        }
        _ => classify(name, obj),
    }
}

fn classify(name: &str, obj: Map<String, Value>) -> Result<Frame, String> {
    let frame = match name {
        "subscription_succeeded" | "subscribed" | "pusher_internal:subscription_succeeded" => {
            Frame::SubscriptionSucceeded {
                channel: obj.get("channel").and_then(Value::as_str).map(str::to_string),
            }
        }
        "subscription_error" | "pusher:subscription_error" => {
            let reason = payload_of(&obj)?
                .get("error")
                .or_else(|| obj.get("error"))
                .or_else(|| obj.get("message"))
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .unwrap_or_else(|| "subscription rejected".to_string());
            Frame::SubscriptionError { reason }
        }
        "pong" | "pusher:pong" => Frame::Pong { nonce: find_timestamp(&obj, None)? },
        "heartbeat" | "pusher:ping" => Frame::Heartbeat,
        _ => match Topic::from_event_name(name) {
            Some(topic) => {
                let payload = payload_of(&obj)?;
                let server_timestamp = find_timestamp(&obj, Some(&payload))?
                    .ok_or_else(|| format!("{} frame has no server timestamp", topic))?;
                Frame::Update(InboundMessage { topic, payload, server_timestamp })
            }
            None => {
                trace!(name, "ignoring unknown event");
                Frame::Ignored { name: name.to_string() }
            }
        },
    };
    Ok(frame)
}

/// Body of the frame: `payload`, `data` (possibly JSON-encoded) or the frame minus its envelope.
fn payload_of(obj: &Map<String, Value>) -> Result<Value, String> {
    match obj.get("payload").or_else(|| obj.get("data")) {
        Some(Value::String(encoded)) => {
            serde_json::from_str(encoded).map_err(|e| format!("invalid encoded data: {}", e))
        }
        Some(value) => Ok(value.clone()),
        None => {
            let mut body = obj.clone();
            for key in ENVELOPE_KEYS.iter().chain(TIMESTAMP_KEYS.iter()) {
                body.remove(*key);
            }
            Ok(Value::Object(body))
        }
    }
}

/// Server timestamp from the envelope, falling back to the payload.
fn find_timestamp(
    obj: &Map<String, Value>,
    payload: Option<&Value>,
) -> Result<Option<Timestamp>, String> {
    let found = TIMESTAMP_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .or_else(|| {
            let payload = payload?.as_object()?;
            TIMESTAMP_KEYS.iter().find_map(|k| payload.get(*k))
        });
    found.map(parse_timestamp).transpose()
}

/// Milliseconds as a number, a numeric string or an RFC 3339 string.
pub fn parse_timestamp(value: &Value) -> Result<Timestamp, String> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .ok_or_else(|| format!("invalid timestamp {}", n)),
        Value::String(s) => {
            if let Ok(ms) = s.parse::<u64>() {
                return Ok(ms);
            }
            chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| format!("invalid timestamp {:?}: {}", s, e))
                .and_then(|at| {
                    u64::try_from(at.timestamp_millis())
                        .map_err(|_| format!("timestamp {:?} before epoch", s))
                })
        }
        other => Err(format!("invalid timestamp {}", other)),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_socket_update_frame() {
        let frame = decode_socket_frame(
            r#"{"type":"score-delta","payload":{"team1":1,"team2":0},"server_timestamp":100}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            Frame::Update(InboundMessage {
                topic: Topic::ScoreDelta,
                payload: json!({ "team1": 1, "team2": 0 }),
                server_timestamp: 100,
            })
        );
    }

    #[test]
    fn test_pusher_encoded_data() {
        let text = json!({
            "event": "hero.updated",
            "channel": "match.7",
            "data": "{\"team\":\"team1\",\"player_id\":3,\"hero\":\"Loki\",\"timestamp\":\"2024-05-01T12:00:00Z\"}",
        })
        .to_string();
        match decode_socket_frame(&text).unwrap() {
            Frame::Update(msg) => {
                assert_eq!(msg.topic, Topic::HeroChange);
                assert_eq!(msg.server_timestamp, 1_714_564_800_000);
                assert_eq!(msg.payload["hero"], "Loki");
            }
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_control_frames() {
        assert_eq!(
            decode_socket_frame(r#"{"type":"subscription_succeeded","channel":"match.1"}"#).unwrap(),
            Frame::SubscriptionSucceeded { channel: Some("match.1".into()) }
        );
        assert_eq!(
            decode_socket_frame(r#"{"type":"pong","timestamp":9}"#).unwrap(),
            Frame::Pong { nonce: Some(9) }
        );
        assert_eq!(
            decode_socket_frame(r#"{"type":"subscription_error","error":"forbidden"}"#).unwrap(),
            Frame::SubscriptionError { reason: "forbidden".into() }
        );
    }

    #[test]
    fn test_update_without_timestamp_is_malformed() {
        let result = decode_socket_frame(r#"{"type":"stat-delta","payload":{"team":"team1"}}"#);
        assert!(result.is_err());
        assert!(decode_socket_frame("not json").is_err());
        assert!(decode_socket_frame("[1,2]").is_err());
    }

    #[test]
    fn test_unknown_event_ignored() {
        assert_eq!(
            decode_socket_frame(r#"{"event":"chat-message","data":{}}"#).unwrap(),
            Frame::Ignored { name: "chat-message".into() }
        );
    }

    #[test]
    fn test_stream_event_body_as_payload() {
        let frame = decode_stream_event(
            Some("map-started"),
            r#"{"map_number":2,"map_name":"Tokyo 2099","serverTimestamp":55}"#,
        )
        .unwrap();
        match frame {
            Frame::Update(msg) => {
                assert_eq!(msg.topic, Topic::MapTransition);
                assert_eq!(msg.server_timestamp, 55);
                assert_eq!(msg.payload, json!({ "map_number": 2, "map_name": "Tokyo 2099" }));
            }
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_generic_message_event_names_topic() {
        let frame = decode_stream_event(
            None,
            r#"{"topic":"status-change","payload":{"status":"paused"},"serverTimestamp":12}"#,
        )
        .unwrap();
        assert!(matches!(frame, Frame::Update(ref m) if m.topic == Topic::StatusChange));
    }

    #[test]
    fn test_client_frames() {
        let frame = ClientFrame::Subscribe { channel: "match.42".into() };
        assert_eq!(frame.to_json(), r#"{"type":"subscribe","channel":"match.42"}"#);
        let frame = ClientFrame::Ping { timestamp: 3 };
        assert_eq!(frame.to_json(), r#"{"type":"ping","timestamp":3}"#);
    }
}
