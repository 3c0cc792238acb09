//! # hubwire-client
//!
//! Client library for hubwire.
//!
//! This crate provides:
//! - A connection state machine with handshake, keepalive and server timeout
//! - A hub API for invoking server methods and handling server calls
//! - A WebSocket transport
//! - YAML and environment based configuration

pub mod callback;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod transport;

pub use callback::CallbackManager;
pub use config::{ClientConfig, ConfigError};
pub use connection::{Connection, ConnectionState};
pub use error::{ClientError, TransportError};
pub use hub::{HubConnection, HubConnectionBuilder};
pub use transport::{Transport, WebSocketTransport};

pub use hubwire_protocol::{ProtocolKind, Value, ValueMap};
pub use tokio_util::sync::CancellationToken;
