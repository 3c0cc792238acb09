//! # hubwire-protocol
//!
//! Wire protocol for SignalR-style hubs.
//!
//! This crate provides:
//! - The dynamically typed [`Value`] carried as arguments and results
//! - Invocation, completion and ping message types
//! - JSON (record-separated) and MessagePack (length-prefixed) codecs
//! - The handshake request and response
//! - A buffering [`Decoder`] that skips malformed messages

pub mod codec;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod json;
pub mod message;
pub mod msgpack;
pub mod value;

pub use codec::{Decoded, Decoder, HubProtocol, ProtocolKind, TransferFormat};
pub use error::ProtocolError;
pub use handshake::{parse_handshake, write_handshake, HandshakeRequest, HandshakeResponse};
pub use json::JsonHubProtocol;
pub use message::{
    CompletionMessage, CompletionOutcome, HubMessage, InvocationMessage, MessageType,
};
pub use msgpack::MessagePackHubProtocol;
pub use value::{Value, ValueKind, ValueMap, WireInteger};

/// Default upper bound for a single binary message payload (4 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;
