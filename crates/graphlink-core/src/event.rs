//! Events exchanged once a connection is running.
//!
//! Wire forms:
//! - message: `{"src": "<device>:<port>", "data": <opaque>?}`
//! - halt: `{"type": "halt", "code": <int>, "message": <string>?}`
//!
//! A missing `"data"` field means the message carries no payload; a present
//! `null` is a payload like any other.

use crate::Endpoint;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One message sent from `src`'s output port, fanned out to every endpoint
/// wired to receive from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MulticastMessage {
    pub src: Endpoint,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
}

impl MulticastMessage {
    /// A message without payload.
    pub fn new(src: Endpoint) -> Self {
        Self { src, data: None }
    }

    /// A message carrying `data`.
    pub fn with_data(src: Endpoint, data: Value) -> Self {
        Self {
            src,
            data: Some(data),
        }
    }
}

/// Terminal notification: nothing follows a halt on the same connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Halt {
    pub code: i64,
    pub message: Option<String>,
}

impl Halt {
    pub fn new(code: i64, message: Option<String>) -> Self {
        Self { code, message }
    }
}

/// An event delivered by `poll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent", into = "RawEvent")]
pub enum Event {
    Message(MulticastMessage),
    Halt(Halt),
}

impl Event {
    pub fn is_halt(&self) -> bool {
        matches!(self, Event::Halt(_))
    }

    pub fn as_message(&self) -> Option<&MulticastMessage> {
        match self {
            Event::Message(msg) => Some(msg),
            Event::Halt(_) => None,
        }
    }

    pub fn as_halt(&self) -> Option<&Halt> {
        match self {
            Event::Halt(halt) => Some(halt),
            Event::Message(_) => None,
        }
    }
}

impl From<MulticastMessage> for Event {
    fn from(msg: MulticastMessage) -> Self {
        Event::Message(msg)
    }
}

impl From<Halt> for Event {
    fn from(halt: Halt) -> Self {
        Event::Halt(halt)
    }
}

/// Whether a batch contains a halt.
pub fn contains_halt(events: &[Event]) -> bool {
    events.iter().any(Event::is_halt)
}

/// Flat wire shape shared by both event variants.
#[derive(Serialize, Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<Endpoint>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl TryFrom<RawEvent> for Event {
    type Error = String;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        match raw.kind.as_deref().unwrap_or("msg") {
            "msg" => {
                let src = raw.src.ok_or("message event is missing `src`")?;
                Ok(Event::Message(MulticastMessage {
                    src,
                    data: raw.data,
                }))
            }
            "halt" => {
                let code = raw.code.ok_or("halt event is missing `code`")?;
                Ok(Event::Halt(Halt::new(code, raw.message)))
            }
            other => Err(format!("unknown event type '{other}'")),
        }
    }
}

impl From<Event> for RawEvent {
    fn from(event: Event) -> Self {
        match event {
            Event::Message(msg) => RawEvent {
                kind: None,
                src: Some(msg.src),
                data: msg.data,
                code: None,
                message: None,
            },
            Event::Halt(halt) => RawEvent {
                kind: Some("halt".to_string()),
                src: None,
                data: None,
                code: Some(halt.code),
                message: halt.message,
            },
        }
    }
}

/// Deserialize a field that is known to be present, so `null` stays `Some`.
pub(crate) fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    #[test]
    fn message_without_data_omits_field() {
        let event = Event::from(MulticastMessage::new(ep("ext0:out")));
        assert_eq!(serde_json::to_value(&event).unwrap(), json!({"src": "ext0:out"}));
    }

    #[test]
    fn message_with_null_data_keeps_it() {
        let parsed: Event = serde_json::from_value(json!({"src": "a:b", "data": null})).unwrap();
        assert_eq!(
            parsed,
            Event::Message(MulticastMessage::with_data(ep("a:b"), Value::Null))
        );
        let parsed: Event = serde_json::from_value(json!({"src": "a:b"})).unwrap();
        assert_eq!(parsed, Event::Message(MulticastMessage::new(ep("a:b"))));
    }

    #[test]
    fn explicit_msg_type_is_accepted() {
        let parsed: Event =
            serde_json::from_value(json!({"type": "msg", "src": "int0:out", "data": [10]}))
                .unwrap();
        let msg = parsed.as_message().unwrap();
        assert_eq!(msg.src.device(), "int0");
        assert_eq!(msg.data, Some(json!([10])));
    }

    #[test]
    fn halt_wire_form() {
        let event = Event::from(Halt::new(3, Some("done".into())));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "halt", "code": 3, "message": "done"})
        );
        let bare = Event::from(Halt::new(0, None));
        assert_eq!(
            serde_json::to_value(&bare).unwrap(),
            json!({"type": "halt", "code": 0})
        );
    }

    #[test]
    fn rejects_malformed_events() {
        assert!(serde_json::from_value::<Event>(json!({"type": "boom"})).is_err());
        assert!(serde_json::from_value::<Event>(json!({"type": "halt"})).is_err());
        assert!(serde_json::from_value::<Event>(json!({"data": 1})).is_err());
        assert!(serde_json::from_value::<Event>(json!({"src": "bad"})).is_err());
    }

    #[test]
    fn halt_detection() {
        let batch = vec![
            Event::from(MulticastMessage::new(ep("a:b"))),
            Event::from(Halt::new(0, None)),
        ];
        assert!(contains_halt(&batch));
        assert!(!contains_halt(&batch[..1]));
        assert_eq!(batch[1].as_halt(), Some(&Halt::new(0, None)));
        assert!(batch[0].as_halt().is_none());
    }
}
