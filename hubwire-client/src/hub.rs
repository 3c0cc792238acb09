//! Hub-level API: method subscriptions, invocations and fire-and-forget sends.

use crate::callback::CallbackManager;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState, DisconnectedHandler};
use crate::error::ClientError;
use crate::transport::{Transport, WebSocketTransport};
use bytes::Bytes;
use hubwire_protocol::{
    CompletionOutcome, Decoded, Decoder, HubMessage, HubProtocol, InvocationMessage,
    ProtocolError, ProtocolKind, Value,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Message used to cancel invocations still pending when the connection stops.
pub const STOPPED_MESSAGE: &str = "connection was stopped before invocation result was received";

/// Handler for a server-to-client method, receiving the invocation arguments.
pub type MethodHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// A connection to a hub.
///
/// Dropping a started hub connection stops it in the background.
pub struct HubConnection<T: Transport = WebSocketTransport> {
    connection: Connection<T>,
    dispatcher: Arc<Dispatcher>,
}

/// Decodes incoming traffic and routes it to subscriptions and pending
/// invocations.
struct Dispatcher {
    decoder: Mutex<Decoder>,
    /// Keyed by lower-cased method name.
    subscriptions: RwLock<HashMap<String, MethodHandler>>,
    callbacks: CallbackManager,
    disconnected: RwLock<Option<DisconnectedHandler>>,
}

impl Dispatcher {
    fn new(protocol: Arc<dyn HubProtocol>) -> Self {
        Self {
            decoder: Mutex::new(Decoder::new(protocol)),
            subscriptions: RwLock::new(HashMap::new()),
            callbacks: CallbackManager::new(),
            disconnected: RwLock::new(None),
        }
    }

    /// Dispatches every message decoded before the first failure, then
    /// returns that failure.
    fn handle_message(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut messages = Vec::new();
        let mut failure = None;
        {
            let mut decoder = self.decoder.lock();
            decoder.extend(data);
            loop {
                match decoder.decode_next() {
                    Ok(Some(Decoded::Message(message))) => messages.push(message),
                    Ok(Some(Decoded::Skipped)) => {
                        tracing::debug!("skipping message of unsupported type");
                    }
                    Ok(Some(Decoded::Invalid(e))) => {
                        tracing::warn!(error = %e, "failed to parse message");
                        failure = Some(e);
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "invalid message framing");
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        for message in messages {
            self.dispatch(message);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dispatch(&self, message: HubMessage) {
        match message {
            HubMessage::Invocation(invocation) => {
                let handler = self
                    .subscriptions
                    .read()
                    .get(&invocation.target.to_ascii_lowercase())
                    .cloned();
                match handler {
                    Some(handler) => {
                        let arguments = &invocation.arguments;
                        if panic::catch_unwind(AssertUnwindSafe(|| handler(arguments))).is_err() {
                            tracing::warn!(method = %invocation.target, "handler panicked");
                        }
                    }
                    None => {
                        tracing::debug!(method = %invocation.target, "handler not found");
                    }
                }
            }
            HubMessage::Completion(completion) => {
                let (error, value) = match completion.outcome {
                    CompletionOutcome::Error(error) => (Some(error), Value::Null),
                    CompletionOutcome::Void => (None, Value::Null),
                    CompletionOutcome::Result(value) => (None, value),
                };
                if !self
                    .callbacks
                    .invoke(&completion.invocation_id, error.as_deref(), value, true)
                {
                    tracing::debug!(id = %completion.invocation_id, "no callback found for id");
                }
            }
            HubMessage::Ping => tracing::trace!("received ping"),
        }
    }

    fn on_disconnected(&self, cause: Option<&ClientError>) {
        self.decoder.lock().clear();
        self.callbacks.cancel_all(STOPPED_MESSAGE);

        let handler = self.disconnected.read().clone();
        if let Some(handler) = handler {
            handler(cause);
        }
    }
}

/// Removes an invocation's callback if the caller stops waiting for it.
struct PendingInvocation<'a> {
    callbacks: &'a CallbackManager,
    id: String,
}

impl Drop for PendingInvocation<'_> {
    fn drop(&mut self) {
        self.callbacks.remove(&self.id);
    }
}

impl<T: Transport> HubConnection<T> {
    fn new(config: ClientConfig, transport: T) -> Self {
        let protocol = config.protocol.create_with_limit(config.max_message_size);
        let dispatcher = Arc::new(Dispatcher::new(protocol.clone()));
        let connection = Connection::new(config, protocol, transport);

        let on_message = dispatcher.clone();
        let on_disconnected = dispatcher.clone();
        connection.install_handlers(
            Arc::new(move |data: Bytes| {
                on_message
                    .handle_message(&data)
                    .map_err(ClientError::Protocol)
            }),
            Arc::new(move |cause: Option<&ClientError>| on_disconnected.on_disconnected(cause)),
        );

        Self {
            connection,
            dispatcher,
        }
    }

    /// Registers `handler` for server invocations of `method_name`.
    ///
    /// Names match case-insensitively; each name can be registered once.
    pub fn on<F>(&self, method_name: &str, handler: F) -> Result<(), ClientError>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        if method_name.is_empty() {
            return Err(ClientError::Configuration(
                "event_name cannot be empty".to_string(),
            ));
        }

        let mut subscriptions = self.dispatcher.subscriptions.write();
        let key = method_name.to_ascii_lowercase();
        if subscriptions.contains_key(&key) {
            return Err(ClientError::Configuration(format!(
                "an action for this event has already been registered. event name: {}",
                method_name
            )));
        }
        subscriptions.insert(key, Arc::new(handler));
        Ok(())
    }

    /// Sets a handler run after the connection stops, with the error that
    /// caused it (`None` for a requested stop).
    pub fn on_disconnected<F>(&self, handler: F) -> Result<(), ClientError>
    where
        F: Fn(Option<&ClientError>) + Send + Sync + 'static,
    {
        if self.state() != ConnectionState::Disconnected {
            return Err(ClientError::InvalidState(
                "cannot set the disconnected callback when the connection is not in the disconnected state",
            ));
        }
        *self.dispatcher.disconnected.write() = Some(Arc::new(handler));
        Ok(())
    }

    /// Invokes a hub method and waits for its result.
    ///
    /// A void method yields [`Value::Null`]; a failed method yields
    /// [`ClientError::Hub`] with the server's message.
    pub async fn invoke(&self, method_name: &str, arguments: Vec<Value>) -> Result<Value, ClientError> {
        let (tx, rx) = oneshot::channel();
        let callbacks = &self.dispatcher.callbacks;
        let id = callbacks.register(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        let _pending = PendingInvocation {
            callbacks,
            id: id.clone(),
        };

        let message = InvocationMessage::new(id, method_name, arguments);
        if let Err(e) = self.send_message(message.into()).await {
            tracing::warn!(method = method_name, error = %e, "failed to send invocation");
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Cancelled(STOPPED_MESSAGE.to_string())),
        }
    }

    /// Invokes a hub method without waiting for a result. Resolves once the
    /// message has been handed to the transport.
    pub async fn send(&self, method_name: &str, arguments: Vec<Value>) -> Result<(), ClientError> {
        let message = InvocationMessage::non_blocking(method_name, arguments);
        self.send_message(message.into()).await.map_err(|e| {
            tracing::warn!(method = method_name, error = %e, "failed to send invocation");
            e
        })
    }

    async fn send_message(&self, message: HubMessage) -> Result<(), ClientError> {
        let payload = self.connection.protocol().write_message(&message)?;
        self.connection.send(payload).await
    }

    /// Feeds raw hub traffic to the decoder and dispatches every complete
    /// message.
    ///
    /// Messages decoded ahead of a malformed one are still dispatched; the
    /// decode error is then returned. Traffic arriving from the transport that
    /// fails this way stops the connection with [`ClientError::Protocol`].
    /// A framing error also clears the buffer.
    pub fn handle_message(&self, data: &[u8]) -> Result<(), ProtocolError> {
        self.dispatcher.handle_message(data)
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        self.connection.start().await
    }

    pub async fn start_with_cancellation(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        self.connection.start_with_cancellation(cancel).await
    }

    /// Stops the connection; pending invocations fail with [`STOPPED_MESSAGE`].
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.connection.stop().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.connection.connection_id()
    }

    pub fn protocol(&self) -> &Arc<dyn HubProtocol> {
        self.connection.protocol()
    }

    /// Returns the number of invocations awaiting a completion.
    pub fn pending_invocations(&self) -> usize {
        self.dispatcher.callbacks.len()
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        self.connection.transport()
    }
}

impl<T: Transport> Drop for HubConnection<T> {
    fn drop(&mut self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let connection = self.connection.clone();
            runtime.spawn(async move {
                let _ = connection.stop().await;
            });
        }
    }
}

/// Builds a [`HubConnection`].
#[derive(Debug, Clone)]
pub struct HubConnectionBuilder {
    config: ClientConfig,
}

impl HubConnectionBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::new(url),
        }
    }

    pub fn from_config(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn with_protocol(mut self, protocol: ProtocolKind) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_handshake_timeout(timeout);
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_keep_alive_interval(interval);
        self
    }

    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_server_timeout(timeout);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Builds a connection over WebSocket.
    pub fn build(self) -> Result<HubConnection<WebSocketTransport>, ClientError> {
        self.build_with_transport(WebSocketTransport::new())
    }

    /// Builds a connection over a custom transport.
    pub fn build_with_transport<T: Transport>(self, transport: T) -> Result<HubConnection<T>, ClientError> {
        self.config
            .validate()
            .map_err(|e| ClientError::Configuration(e.to_string()))?;
        Ok(HubConnection::new(self.config, transport))
    }
}
