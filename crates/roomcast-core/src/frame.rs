//! Wire framing.
//!
//! Every message in either direction is one JSON array whose first element is
//! the event name and whose remaining elements are the event arguments:
//!
//! ```text
//! ["chat", {"text": "hi"}, 42]
//! ```
//!
//! Raw JSON payloads sent with `send_json` bypass this envelope entirely.

use serde_json::Value;
use thiserror::Error;

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The text was not valid JSON.
    #[error("invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON, but not an array.
    #[error("frame must be a JSON array, got {0}")]
    NotAnArray(&'static str),
    /// An empty array carries no event name.
    #[error("frame is empty")]
    Empty,
    /// The first element was not a string.
    #[error("frame event name must be a string, got {0}")]
    EventNameNotString(&'static str),
}

/// A decoded `[eventName, ...args]` frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Event name (first array element).
    pub event: String,
    /// Remaining array elements.
    pub args: Vec<Value>,
}

impl Frame {
    /// Build a frame from parts.
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    /// Decode one inbound text message.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Array(items) = value else {
            return Err(FrameError::NotAnArray(kind(&value)));
        };
        let mut items = items.into_iter();
        let Some(first) = items.next() else {
            return Err(FrameError::Empty);
        };
        let Value::String(event) = first else {
            return Err(FrameError::EventNameNotString(kind(&first)));
        };
        Ok(Self {
            event,
            args: items.collect(),
        })
    }

    /// Encode this frame as the JSON text sent on the wire.
    pub fn to_text(&self) -> String {
        encode(&self.event, &self.args)
    }
}

/// Encode `[event, ...args]` without building a [`Frame`] first.
pub fn encode(event: &str, args: &[Value]) -> String {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Value::String(event.to_owned()));
    items.extend(args.iter().cloned());
    Value::Array(items).to_string()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
