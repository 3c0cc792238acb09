//! Protocol error types.

use crate::value::ValueKind;
use thiserror::Error;

/// Errors raised while encoding, framing or decoding hub protocol traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack error: {0}")]
    MessagePack(String),

    #[error("message was not a 'map' type")]
    NotAMap,

    #[error("message was not an 'array' type")]
    NotAnArray,

    #[error("message was an empty array")]
    EmptyArray,

    #[error("field '{field}' not found{}", for_message(.message))]
    MissingField {
        field: &'static str,
        message: Option<&'static str>,
    },

    #[error("expected '{field}' to be of type '{expected}'")]
    InvalidFieldType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("the 'error' and 'result' properties are mutually exclusive")]
    ErrorAndResult,

    #[error("{0} message has too few properties")]
    TooFewProperties(&'static str),

    #[error("unknown completion result kind: {0}")]
    UnknownResultKind(i64),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid length prefix: {0}")]
    InvalidLengthPrefix(&'static str),

    #[error("message payload has {0} unread trailing bytes")]
    TrailingBytes(usize),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("number {0} cannot be represented on the wire")]
    NonFiniteNumber(f64),

    #[error("invalid base64 in binary value: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("incomplete handshake message received")]
    IncompleteHandshake,

    #[error("detected a connection attempt to an ASP.NET SignalR server; only ASP.NET Core SignalR servers are supported")]
    IncompatibleServer,

    #[error("object is a '{actual}' expected it to be a '{expected}'")]
    TypeMismatch {
        actual: ValueKind,
        expected: ValueKind,
    },
}

fn for_message(message: &Option<&'static str>) -> String {
    match message {
        Some(kind) => format!(" for '{}' message", kind),
        None => String::new(),
    }
}

impl ProtocolError {
    pub(crate) fn missing(field: &'static str) -> Self {
        ProtocolError::MissingField {
            field,
            message: None,
        }
    }

    pub(crate) fn missing_for(field: &'static str, message: &'static str) -> Self {
        ProtocolError::MissingField {
            field,
            message: Some(message),
        }
    }

    pub(crate) fn invalid_type(field: &'static str, expected: &'static str) -> Self {
        ProtocolError::InvalidFieldType { field, expected }
    }

    /// Returns whether the error came from framing rather than from a single
    /// message, meaning the rest of the buffer can no longer be trusted.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidLengthPrefix(_) | ProtocolError::MessageTooLarge { .. }
        )
    }
}
