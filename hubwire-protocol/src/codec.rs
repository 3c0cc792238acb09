//! The hub protocol abstraction and a buffering decoder.

use crate::error::ProtocolError;
use crate::json::JsonHubProtocol;
use crate::message::HubMessage;
use crate::msgpack::MessagePackHubProtocol;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// How a payload travels over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferFormat {
    Text,
    Binary,
}

/// A wire encoding for hub messages.
///
/// Implementations are stateless; buffering of partial input is handled by
/// [`Decoder`].
pub trait HubProtocol: Send + Sync + fmt::Debug {
    /// Protocol name sent in the handshake request.
    fn name(&self) -> &'static str;

    /// Protocol version sent in the handshake request.
    fn version(&self) -> u32;

    /// Frame type the transport must use for this protocol.
    fn transfer_format(&self) -> TransferFormat;

    /// Serializes a message, including its framing.
    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError>;

    /// Splits the next complete framed message off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more input is needed.
    fn split_frame(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError>;

    /// Decodes one unframed message.
    ///
    /// Returns `Ok(None)` for message types this client does not handle.
    fn parse_frame(&self, frame: &[u8]) -> Result<Option<HubMessage>, ProtocolError>;

    /// Decodes every complete message in `buf`, leaving any partial trailing
    /// message in place.
    ///
    /// Fails on the first malformed message; use [`Decoder`] to keep going
    /// past bad messages.
    fn parse_messages(&self, buf: &mut BytesMut) -> Result<Vec<HubMessage>, ProtocolError> {
        let mut messages = Vec::new();
        while let Some(frame) = self.split_frame(buf)? {
            if let Some(message) = self.parse_frame(&frame)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }
}

/// The built-in hub protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    #[default]
    Json,
    #[serde(alias = "msgpack")]
    MessagePack,
}

impl ProtocolKind {
    /// Creates the protocol with its default settings.
    pub fn create(self) -> Arc<dyn HubProtocol> {
        match self {
            ProtocolKind::Json => Arc::new(JsonHubProtocol::new()),
            ProtocolKind::MessagePack => Arc::new(MessagePackHubProtocol::new()),
        }
    }

    /// Creates the protocol with a binary payload limit of `max_message_size`.
    ///
    /// The limit only applies to length-prefixed protocols.
    pub fn create_with_limit(self, max_message_size: usize) -> Arc<dyn HubProtocol> {
        match self {
            ProtocolKind::Json => Arc::new(JsonHubProtocol::new()),
            ProtocolKind::MessagePack => Arc::new(
                MessagePackHubProtocol::new().with_max_message_size(max_message_size),
            ),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::Json => crate::json::PROTOCOL_NAME,
            ProtocolKind::MessagePack => crate::msgpack::PROTOCOL_NAME,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ProtocolKind::Json),
            "messagepack" | "msgpack" => Ok(ProtocolKind::MessagePack),
            other => Err(format!("unknown hub protocol: {}", other)),
        }
    }
}

/// Result of pulling one message from a [`Decoder`].
#[derive(Debug)]
pub enum Decoded {
    /// A message was decoded.
    Message(HubMessage),
    /// A complete frame held a message type this client ignores.
    Skipped,
    /// A complete frame could not be decoded; later frames are unaffected.
    Invalid(ProtocolError),
}

/// Buffers incoming bytes and decodes them into hub messages.
#[derive(Debug)]
pub struct Decoder {
    protocol: Arc<dyn HubProtocol>,
    buffer: BytesMut,
}

impl Decoder {
    pub fn new(protocol: Arc<dyn HubProtocol>) -> Self {
        Self {
            protocol,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub fn protocol(&self) -> &Arc<dyn HubProtocol> {
        &self.protocol
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// `Ok(None)` means no complete frame is buffered. `Err` is a framing
    /// error: the buffer is cleared since its contents can no longer be
    /// delimited.
    pub fn decode_next(&mut self) -> Result<Option<Decoded>, ProtocolError> {
        let frame = match self.protocol.split_frame(&mut self.buffer) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.buffer.clear();
                return Err(e);
            }
        };

        Ok(Some(match self.protocol.parse_frame(&frame) {
            Ok(Some(message)) => Decoded::Message(message),
            Ok(None) => Decoded::Skipped,
            Err(e) => Decoded::Invalid(e),
        }))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
