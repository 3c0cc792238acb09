//! MessagePack hub protocol.
//!
//! Every message is a MessagePack array preceded by a varint length prefix:
//!
//! ```text
//! Invocation: [1, Headers, InvocationId | nil, Target, [Arguments], [StreamIds]]
//! Completion: [3, Headers, InvocationId, ResultKind, Error | Result]
//! Ping:       [6]
//! ```
//!
//! `ResultKind` is 1 for an error, 2 for a void result and 3 for a value.

use crate::codec::{HubProtocol, TransferFormat};
use crate::error::ProtocolError;
use crate::framing::{split_length_prefixed, write_length_prefixed};
use crate::message::{
    CompletionMessage, CompletionOutcome, HubMessage, InvocationMessage, MessageType,
};
use crate::value::{Value, ValueMap, WireInteger};
use crate::DEFAULT_MAX_MESSAGE_SIZE;
use bytes::{Bytes, BytesMut};
use rmpv::Value as MsgValue;

/// Protocol name used in the handshake.
pub const PROTOCOL_NAME: &str = "messagepack";

/// Protocol version used in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

const RESULT_KIND_ERROR: i64 = 1;
const RESULT_KIND_VOID: i64 = 2;
const RESULT_KIND_RESULT: i64 = 3;

/// The binary hub protocol.
#[derive(Debug, Clone, Copy)]
pub struct MessagePackHubProtocol {
    max_message_size: usize,
}

impl MessagePackHubProtocol {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Sets the largest payload accepted for encoding and decoding.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for MessagePackHubProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl HubProtocol for MessagePackHubProtocol {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Binary
    }

    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        let code = MsgValue::from(message.message_type().code());
        let headers = MsgValue::Map(Vec::new());

        let array = match message {
            HubMessage::Invocation(invocation) => {
                let id = match invocation.invocation_id.as_deref() {
                    Some(id) if !id.is_empty() => MsgValue::from(id),
                    _ => MsgValue::Nil,
                };
                let arguments = invocation
                    .arguments
                    .iter()
                    .map(to_msgpack)
                    .collect::<Result<Vec<_>, _>>()?;
                vec![
                    code,
                    headers,
                    id,
                    MsgValue::from(invocation.target.as_str()),
                    MsgValue::Array(arguments),
                    // Stream ids are never sent.
                    MsgValue::Array(Vec::new()),
                ]
            }
            HubMessage::Completion(completion) => {
                let mut fields = vec![
                    code,
                    headers,
                    MsgValue::from(completion.invocation_id.as_str()),
                    MsgValue::from(completion.outcome.result_kind()),
                ];
                match &completion.outcome {
                    CompletionOutcome::Error(error) => fields.push(MsgValue::from(error.as_str())),
                    CompletionOutcome::Void => {}
                    CompletionOutcome::Result(result) => fields.push(to_msgpack(result)?),
                }
                fields
            }
            HubMessage::Ping => vec![code],
        };

        let mut payload = Vec::with_capacity(64);
        rmpv::encode::write_value(&mut payload, &MsgValue::Array(array))
            .map_err(|e| ProtocolError::MessagePack(e.to_string()))?;

        write_length_prefixed(&payload, self.max_message_size)
    }

    fn split_frame(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        split_length_prefixed(buf, self.max_message_size)
    }

    fn parse_frame(&self, frame: &[u8]) -> Result<Option<HubMessage>, ProtocolError> {
        let mut cursor = frame;
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| ProtocolError::MessagePack(format!("messagepack object was incomplete: {}", e)))?;
        if !cursor.is_empty() {
            return Err(ProtocolError::TrailingBytes(cursor.len()));
        }

        let fields = match value {
            MsgValue::Array(fields) => fields,
            _ => return Err(ProtocolError::NotAnArray),
        };
        let code = fields
            .first()
            .ok_or(ProtocolError::EmptyArray)?
            .as_i64()
            .ok_or_else(|| ProtocolError::invalid_type("type", "integer"))?;

        match MessageType::from_code(code) {
            Some(MessageType::Invocation) => parse_invocation(fields).map(Some),
            Some(MessageType::Completion) => parse_completion(fields).map(Some),
            Some(MessageType::Ping) => Ok(Some(HubMessage::Ping)),
            _ => Ok(None),
        }
    }
}

fn parse_invocation(fields: Vec<MsgValue>) -> Result<HubMessage, ProtocolError> {
    if fields.len() < 5 {
        return Err(ProtocolError::TooFewProperties("invocation"));
    }
    // [type, headers, id, target, arguments, (stream ids)]
    let mut fields = fields.into_iter().skip(2);

    let invocation_id = match fields.next() {
        Some(MsgValue::Nil) => None,
        Some(MsgValue::String(id)) => id
            .into_str()
            .ok_or(ProtocolError::InvalidUtf8)
            .map(Some)?
            .filter(|id| !id.is_empty()),
        _ => return Err(ProtocolError::invalid_type("invocationId", "string")),
    };

    let target = match fields.next() {
        Some(MsgValue::String(target)) => target.into_str().ok_or(ProtocolError::InvalidUtf8)?,
        _ => return Err(ProtocolError::invalid_type("target", "string")),
    };

    let arguments = match fields.next() {
        Some(MsgValue::Array(arguments)) => arguments
            .into_iter()
            .map(from_msgpack)
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(ProtocolError::invalid_type("arguments", "array")),
    };

    Ok(HubMessage::Invocation(InvocationMessage {
        invocation_id,
        target,
        arguments,
    }))
}

fn parse_completion(fields: Vec<MsgValue>) -> Result<HubMessage, ProtocolError> {
    if fields.len() < 4 {
        return Err(ProtocolError::TooFewProperties("completion"));
    }
    let has_payload = fields.len() >= 5;
    // [type, headers, id, result kind, (error | result)]
    let mut fields = fields.into_iter().skip(2);

    let invocation_id = match fields.next() {
        Some(MsgValue::String(id)) => id.into_str().ok_or(ProtocolError::InvalidUtf8)?,
        _ => return Err(ProtocolError::invalid_type("invocationId", "string")),
    };

    let result_kind = fields
        .next()
        .and_then(|kind| kind.as_i64())
        .ok_or_else(|| ProtocolError::invalid_type("resultKind", "integer"))?;

    if result_kind != RESULT_KIND_VOID && !has_payload {
        return Err(ProtocolError::TooFewProperties("completion"));
    }

    let outcome = match result_kind {
        RESULT_KIND_ERROR => match fields.next() {
            Some(MsgValue::String(error)) => {
                CompletionOutcome::Error(error.into_str().ok_or(ProtocolError::InvalidUtf8)?)
            }
            _ => return Err(ProtocolError::invalid_type("error", "string")),
        },
        RESULT_KIND_VOID => CompletionOutcome::Void,
        RESULT_KIND_RESULT => match fields.next() {
            Some(result) => CompletionOutcome::Result(from_msgpack(result)?),
            None => return Err(ProtocolError::TooFewProperties("completion")),
        },
        other => return Err(ProtocolError::UnknownResultKind(other)),
    };

    Ok(HubMessage::Completion(CompletionMessage {
        invocation_id,
        outcome,
    }))
}

/// Converts a value to MessagePack, writing integral numbers as integers.
pub fn to_msgpack(value: &Value) -> Result<MsgValue, ProtocolError> {
    Ok(match value {
        Value::Null => MsgValue::Nil,
        Value::Bool(b) => MsgValue::Boolean(*b),
        Value::Float64(n) => match Value::as_wire_integer(*n) {
            Some(WireInteger::Signed(i)) => MsgValue::from(i),
            Some(WireInteger::Unsigned(u)) => MsgValue::from(u),
            None => MsgValue::F64(*n),
        },
        Value::String(s) => MsgValue::from(s.as_str()),
        Value::Binary(bytes) => MsgValue::Binary(bytes.clone()),
        Value::Array(items) => {
            MsgValue::Array(items.iter().map(to_msgpack).collect::<Result<Vec<_>, _>>()?)
        }
        Value::Map(map) => MsgValue::Map(
            map.iter()
                .map(|(k, v)| Ok::<_, ProtocolError>((MsgValue::from(k.as_str()), to_msgpack(v)?)))
                .collect::<Result<Vec<_>, ProtocolError>>()?,
        ),
    })
}

/// Converts a decoded MessagePack value. Integers of any width become `Float64`.
pub fn from_msgpack(value: MsgValue) -> Result<Value, ProtocolError> {
    Ok(match value {
        MsgValue::Nil => Value::Null,
        MsgValue::Boolean(b) => Value::Bool(b),
        MsgValue::Integer(n) => Value::Float64(n.as_f64().unwrap_or(f64::NAN)),
        MsgValue::F32(n) => Value::Float64(f64::from(n)),
        MsgValue::F64(n) => Value::Float64(n),
        MsgValue::String(s) => Value::String(s.into_str().ok_or(ProtocolError::InvalidUtf8)?),
        MsgValue::Binary(bytes) => Value::Binary(bytes),
        MsgValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(from_msgpack)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        MsgValue::Map(entries) => {
            let mut map = ValueMap::with_capacity(entries.len());
            for (key, item) in entries {
                let key = match key {
                    MsgValue::String(key) => key.into_str().ok_or(ProtocolError::InvalidUtf8)?,
                    _ => return Err(ProtocolError::invalid_type("map key", "string")),
                };
                map.insert(key, from_msgpack(item)?);
            }
            Value::Map(map)
        }
        MsgValue::Ext(kind, _) => {
            return Err(ProtocolError::MessagePack(format!(
                "unsupported extension type {}",
                kind
            )))
        }
    })
}
