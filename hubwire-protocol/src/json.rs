//! JSON hub protocol: one JSON object per message, terminated by 0x1E.

use crate::codec::{HubProtocol, TransferFormat};
use crate::error::ProtocolError;
use crate::framing::{split_record, terminate_record};
use crate::message::{
    CompletionMessage, CompletionOutcome, HubMessage, InvocationMessage, MessageType,
};
use crate::value::{Value, ValueMap, WireInteger};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use serde_json::{Map, Number, Value as JsonValue};

/// Protocol name used in the handshake.
pub const PROTOCOL_NAME: &str = "json";

/// Protocol version used in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// The text hub protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        let mut object = Map::new();
        object.insert(
            "type".to_string(),
            JsonValue::from(message.message_type().code()),
        );

        match message {
            HubMessage::Invocation(invocation) => {
                if let Some(id) = invocation.invocation_id.as_deref().filter(|id| !id.is_empty()) {
                    object.insert("invocationId".to_string(), JsonValue::from(id));
                }
                object.insert(
                    "target".to_string(),
                    JsonValue::from(invocation.target.as_str()),
                );
                let arguments = invocation
                    .arguments
                    .iter()
                    .map(to_json)
                    .collect::<Result<Vec<_>, _>>()?;
                object.insert("arguments".to_string(), JsonValue::Array(arguments));
            }
            HubMessage::Completion(completion) => {
                object.insert(
                    "invocationId".to_string(),
                    JsonValue::from(completion.invocation_id.as_str()),
                );
                match &completion.outcome {
                    CompletionOutcome::Error(error) if !error.is_empty() => {
                        object.insert("error".to_string(), JsonValue::from(error.as_str()));
                    }
                    CompletionOutcome::Error(_) | CompletionOutcome::Void => {}
                    CompletionOutcome::Result(result) => {
                        object.insert("result".to_string(), to_json(result)?);
                    }
                }
            }
            HubMessage::Ping => {}
        }

        let payload = serde_json::to_vec(&JsonValue::Object(object))?;
        Ok(terminate_record(payload))
    }

    fn split_frame(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        Ok(split_record(buf))
    }

    fn parse_frame(&self, frame: &[u8]) -> Result<Option<HubMessage>, ProtocolError> {
        let json: JsonValue = serde_json::from_slice(frame)?;
        let object = json.as_object().ok_or(ProtocolError::NotAMap)?;

        let message_type = object
            .get("type")
            .ok_or_else(|| ProtocolError::missing("type"))
            .and_then(|t| type_code(t).ok_or_else(|| ProtocolError::invalid_type("type", "integer")))?;

        match MessageType::from_code(message_type) {
            Some(MessageType::Invocation) => parse_invocation(object).map(Some),
            Some(MessageType::Completion) => parse_completion(object).map(Some),
            Some(MessageType::Ping) => Ok(Some(HubMessage::Ping)),
            // Newer peers may send message types this client does not know.
            _ => Ok(None),
        }
    }
}

fn type_code(value: &JsonValue) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|n| n.fract() == 0.0 && n.abs() < i64::MAX as f64)
            .map(|n| n as i64)
    })
}

fn parse_invocation(object: &Map<String, JsonValue>) -> Result<HubMessage, ProtocolError> {
    let target = object
        .get("target")
        .ok_or_else(|| ProtocolError::missing_for("target", "invocation"))?
        .as_str()
        .ok_or_else(|| ProtocolError::invalid_type("target", "string"))?;

    let arguments = object
        .get("arguments")
        .ok_or_else(|| ProtocolError::missing_for("arguments", "invocation"))?
        .as_array()
        .ok_or_else(|| ProtocolError::invalid_type("arguments", "array"))?;

    let invocation_id = match object.get("invocationId") {
        None => None,
        Some(id) => {
            let id = id
                .as_str()
                .ok_or_else(|| ProtocolError::invalid_type("invocationId", "string"))?;
            Some(id.to_string()).filter(|id| !id.is_empty())
        }
    };

    Ok(HubMessage::Invocation(InvocationMessage {
        invocation_id,
        target: target.to_string(),
        arguments: arguments.iter().map(from_json).collect(),
    }))
}

fn parse_completion(object: &Map<String, JsonValue>) -> Result<HubMessage, ProtocolError> {
    let result = object.get("result").map(from_json);

    let error = match object.get("error") {
        None => "",
        Some(error) => error
            .as_str()
            .ok_or_else(|| ProtocolError::invalid_type("error", "string"))?,
    };

    let invocation_id = object
        .get("invocationId")
        .ok_or_else(|| ProtocolError::missing_for("invocationId", "completion"))?
        .as_str()
        .ok_or_else(|| ProtocolError::invalid_type("invocationId", "string"))?;

    let outcome = match (error.is_empty(), result) {
        (false, Some(_)) => return Err(ProtocolError::ErrorAndResult),
        (false, None) => CompletionOutcome::Error(error.to_string()),
        (true, Some(result)) => CompletionOutcome::Result(result),
        (true, None) => CompletionOutcome::Void,
    };

    Ok(HubMessage::Completion(CompletionMessage {
        invocation_id: invocation_id.to_string(),
        outcome,
    }))
}

/// Converts a value to JSON, collapsing integral numbers to JSON integers.
///
/// Binary values become base64 strings.
pub fn to_json(value: &Value) -> Result<JsonValue, ProtocolError> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Float64(n) => match Value::as_wire_integer(*n) {
            Some(WireInteger::Signed(i)) => JsonValue::from(i),
            Some(WireInteger::Unsigned(u)) => JsonValue::from(u),
            None => Number::from_f64(*n)
                .map(JsonValue::Number)
                .ok_or(ProtocolError::NonFiniteNumber(*n))?,
        },
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Binary(bytes) => JsonValue::String(BASE64.encode(bytes)),
        Value::Array(items) => {
            JsonValue::Array(items.iter().map(to_json).collect::<Result<Vec<_>, _>>()?)
        }
        Value::Map(map) => {
            let mut object = Map::with_capacity(map.len());
            for (key, item) in map {
                object.insert(key.clone(), to_json(item)?);
            }
            JsonValue::Object(object)
        }
    })
}

/// Converts parsed JSON into a value. Every number becomes a `Float64`.
pub fn from_json(json: &JsonValue) -> Value {
    match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => Value::Float64(n.as_f64().unwrap_or(f64::NAN)),
        JsonValue::String(s) => Value::String(s.clone()),
        JsonValue::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        JsonValue::Object(object) => Value::Map(
            object
                .iter()
                .map(|(k, v)| (k.clone(), from_json(v)))
                .collect::<ValueMap>(),
        ),
    }
}

/// Decodes a base64 string produced for a binary value.
pub fn decode_binary(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    Ok(BASE64.decode(value.as_str()?)?)
}
