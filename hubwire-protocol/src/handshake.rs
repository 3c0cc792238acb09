//! Handshake exchanged once per connection before any hub message.
//!
//! The request and response are always JSON terminated by 0x1E, whatever hub
//! protocol is negotiated.

use crate::codec::HubProtocol;
use crate::error::ProtocolError;
use crate::framing::{terminate_record, RECORD_SEPARATOR};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl HandshakeRequest {
    pub fn for_protocol(protocol: &dyn HubProtocol) -> Self {
        Self {
            protocol: protocol.name().to_string(),
            version: protocol.version(),
        }
    }
}

/// Key only sent by legacy ASP.NET SignalR servers.
const LEGACY_PROTOCOL_VERSION_KEY: &str = "ProtocolVersion";

/// The server's reply. A missing or empty `error` means the handshake
/// succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// Returns the server's error, treating an empty string as success.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }
}

/// Serializes the handshake request for `protocol`.
pub fn write_handshake(protocol: &dyn HubProtocol) -> Result<Bytes, ProtocolError> {
    let request = HandshakeRequest::for_protocol(protocol);
    Ok(terminate_record(serde_json::to_vec(&request)?))
}

/// Parses the handshake response at the front of `data`.
///
/// Returns the response and whatever bytes followed it; those are the start
/// of the hub message stream.
pub fn parse_handshake(data: &[u8]) -> Result<(HandshakeResponse, &[u8]), ProtocolError> {
    let end = data
        .iter()
        .position(|&b| b == RECORD_SEPARATOR)
        .ok_or(ProtocolError::IncompleteHandshake)?;

    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&data[..end])?;
    if object.contains_key(LEGACY_PROTOCOL_VERSION_KEY) {
        return Err(ProtocolError::IncompatibleServer);
    }
    let response: HandshakeResponse = serde_json::from_value(serde_json::Value::Object(object))?;

    Ok((response, &data[end + 1..]))
}
