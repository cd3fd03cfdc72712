//! Pure functions mapping application values to and from wire payloads.
//!
//! Outbound values are JSON-encoded unless they already are strings or raw
//! byte buffers, which pass through untouched. Inbound payloads are decoded
//! leniently: anything that fails to parse as JSON is handed to subscribers
//! unchanged, and the text/binary framing envelopes some transports wrap
//! around payloads are unwrapped transparently.

use serde_json::Value;

use crate::transport::Frame;

/// Event names the channel reserves for its own lifecycle. Named-event
/// subscriptions never match these.
pub const RESERVED_EVENTS: [&str; 2] = ["error", "close"];

/// Encode an application value for transmission.
///
/// Strings pass through unchanged so that `serialize` is idempotent on
/// already-encoded payloads; everything else is JSON-encoded. Raw byte
/// buffers never reach this function, they are framed as binary directly.
#[must_use]
pub fn serialize(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decode a raw text payload.
///
/// Attempts a JSON decode and falls back to the raw payload unchanged when
/// decoding fails. Never errors.
#[must_use]
pub fn deserialize(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

/// Unwrap a transport framing envelope, if present.
///
/// Recognized envelopes are `{"type": "utf8", "utf8Data": v}` and
/// `{"type": "binary", "binaryData": v}`; bare values pass through unchanged.
/// A text envelope whose payload is itself a string is decoded one level
/// further, since transports that frame this way carry JSON in that field.
#[must_use]
pub fn normalize(value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };

    match map.get("type").and_then(Value::as_str) {
        Some("utf8") => match map.remove("utf8Data") {
            Some(Value::String(text)) => deserialize(&text),
            Some(inner) => inner,
            None => Value::Object(map),
        },
        Some("binary") => match map.remove("binaryData") {
            Some(inner) => inner,
            None => Value::Object(map),
        },
        _ => Value::Object(map),
    }
}

/// Extract the `data` payload of a named `{event, data}` message.
///
/// Returns `None` for frames that are not such a message, for the reserved
/// [`RESERVED_EVENTS`] names, and for messages whose `data` field is missing
/// or empty.
#[must_use]
pub fn event_data(frame: &Frame, name: &str) -> Option<Value> {
    if RESERVED_EVENTS.contains(&name) {
        return None;
    }

    let Frame::Text(text) = frame else {
        return None;
    };
    let Value::Object(map) = normalize(deserialize(text)) else {
        return None;
    };

    if map.get("event").and_then(Value::as_str) != Some(name) {
        return None;
    }
    map.get("data").filter(|data| has_payload(data)).cloned()
}

/// Extract the raw binary payload of a frame.
///
/// Binary frames yield their bytes directly. Text frames carrying a binary
/// framing envelope are unwrapped; any other text passes through as its raw
/// bytes.
#[must_use]
pub fn bytes(frame: &Frame) -> Vec<u8> {
    let text = match frame {
        Frame::Binary(data) => return data.clone(),
        Frame::Text(text) => text,
    };

    if let Value::Object(map) = deserialize(text)
        && map.get("type").and_then(Value::as_str) == Some("binary")
    {
        match map.get("binaryData") {
            Some(Value::Array(items)) => {
                return items
                    .iter()
                    .filter_map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect();
            }
            Some(Value::String(data)) => return data.clone().into_bytes(),
            _ => {}
        }
    }

    text.clone().into_bytes()
}

fn has_payload(data: &Value) -> bool {
    match data {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
