//! Wire encoding of events and commands.
//!
//! Commands and events are written by applications as serde enums. On the wire (and inside an
//! [`Event`] payload) a variant is split into its name, which becomes the command name or the event
//! topic, and its content, which becomes the payload. [`encode_variant`] and [`decode_variant`]
//! implement that split for the externally tagged representation serde uses by default.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::command::CommandEnvelope;
use crate::error::Error;
use crate::event::Event;

/// Splits an enum variant into its name and its content.
///
/// Unit variants have a `null` payload.
pub fn encode_variant<T>(value: &T) -> Result<(String, Value), serde_json::Error>
where
    T: Serialize + ?Sized,
{
    match serde_json::to_value(value)? {
        Value::String(name) => Ok((name, Value::Null)),
        Value::Object(map) if map.len() == 1 => map.into_iter().next().ok_or_else(not_a_variant),
        _ => Err(not_a_variant()),
    }
}

/// Rebuilds an enum variant out of its name and content.
pub fn decode_variant<T>(name: &str, payload: &Value) -> Result<T, serde_json::Error>
where
    T: DeserializeOwned,
{
    let tagged: Value = if payload.is_null() {
        Value::String(name.to_owned())
    } else {
        let mut map = Map::with_capacity(1);
        map.insert(name.to_owned(), payload.clone());
        Value::Object(map)
    };

    serde_json::from_value(tagged)
}

fn not_a_variant() -> serde_json::Error {
    <serde_json::Error as serde::ser::Error>::custom("value does not serialize as an externally tagged enum variant")
}

/// Marshals [`Event`]s to and from an opaque byte payload.
pub trait EventCodec: Send + Sync {
    fn encode_event(&self, event: &Event) -> Result<Vec<u8>, Error>;

    fn decode_event(&self, bytes: &[u8]) -> Result<Event, Error>;
}

/// Marshals [`CommandEnvelope`]s to and from an opaque byte payload.
pub trait CommandCodec: Send + Sync {
    fn encode_command(&self, command: &CommandEnvelope) -> Result<Vec<u8>, Error>;

    fn decode_command(&self, bytes: &[u8]) -> Result<CommandEnvelope, Error>;
}

/// JSON implementation of both codecs.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl EventCodec for JsonCodec {
    fn encode_event(&self, event: &Event) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(event)?)
    }

    fn decode_event(&self, bytes: &[u8]) -> Result<Event, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl CommandCodec for JsonCodec {
    fn encode_command(&self, command: &CommandEnvelope) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(command)?)
    }

    fn decode_command(&self, bytes: &[u8]) -> Result<CommandEnvelope, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
