//! Wire encoding and decoding of messages.
//!
//! Inbound payloads are validated field by field so a client gets told
//! exactly which required field it forgot, in a stable order. Outbound
//! encoding is deterministic: id, channel, body, timestamp.

use serde_json::Value;
use skiff_types::{MarshalError, Message};

/// Encodes and decodes a [`Message`] to and from its wire representation.
pub trait Marshaler: Send + Sync {
    /// Decode a wire payload, validating required fields.
    fn unmarshal(&self, payload: &[u8]) -> Result<Message, MarshalError>;

    /// Encode a message into its wire form.
    fn marshal(&self, message: &Message) -> Result<String, MarshalError>;
}

/// JSON marshaler. Required fields are checked in the fixed order
/// id, channel, body, timestamp; the first missing one is reported.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaler;

impl JsonMarshaler {
    fn required<'a>(
        payload: &'a serde_json::Map<String, Value>,
        field: &'static str,
    ) -> Result<&'a Value, MarshalError> {
        payload.get(field).ok_or(MarshalError::MissingField(field))
    }

    fn string_field(
        payload: &serde_json::Map<String, Value>,
        field: &'static str,
    ) -> Result<String, MarshalError> {
        Self::required(payload, field)?
            .as_str()
            .map(str::to_owned)
            .ok_or(MarshalError::InvalidField(field))
    }
}

impl Marshaler for JsonMarshaler {
    fn unmarshal(&self, payload: &[u8]) -> Result<Message, MarshalError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| MarshalError::Malformed(err.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| MarshalError::Malformed("payload is not a JSON object".to_string()))?;

        let id = Self::string_field(object, "id")?;
        let channel = Self::string_field(object, "channel")?;
        let body = Self::string_field(object, "body")?;
        let timestamp = Self::required(object, "timestamp")?
            .as_i64()
            .ok_or(MarshalError::InvalidField("timestamp"))?;

        Ok(Message {
            id,
            channel,
            body,
            timestamp,
        })
    }

    fn marshal(&self, message: &Message) -> Result<String, MarshalError> {
        serde_json::to_string(message).map_err(|err| MarshalError::Encode(err.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
