//! Connection lifecycle: start, handshake, keepalive, receive loop and stop.

use crate::config::ClientConfig;
use crate::error::{ClientError, TransportError};
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use hubwire_protocol::{
    parse_handshake, write_handshake, HubMessage, HubProtocol, ProtocolError, TransferFormat,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const STOPPED_DURING_START: &str = "connection was stopped before the handshake completed";
const START_CANCELLED: &str = "starting the connection was canceled";

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives every chunk of hub traffic, in transport order.
///
/// Returning an error tears the connection down with that error as the cause.
pub type MessageHandler = Arc<dyn Fn(Bytes) -> Result<(), ClientError> + Send + Sync>;

/// Runs once per teardown with the error that caused it, if any.
pub type DisconnectedHandler = Arc<dyn Fn(Option<&ClientError>) + Send + Sync>;

/// How a start attempt failed, which decides the cleanup.
enum StartFailure {
    /// The transport never opened; nothing to stop.
    Transport(TransportError),
    /// Failed after the transport opened; the connection must be stopped.
    Handshake(ClientError),
}

/// A connection to a hub server over a [`Transport`].
///
/// Cheap to clone; clones share the same underlying connection.
pub struct Connection<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<T> {
    config: ClientConfig,
    protocol: Arc<dyn HubProtocol>,
    transport: T,
    state: AtomicU8,
    /// Bumped on every start and teardown; background tasks compare it with
    /// the value they were spawned under.
    generation: AtomicU64,
    /// Serializes state changes made by start with those made by teardown.
    lifecycle: Mutex<()>,
    /// Cancels the start in progress and the background tasks of the current
    /// generation.
    cancel: Mutex<CancellationToken>,
    connection_id: Mutex<Option<String>>,
    stop_waiters: Mutex<Vec<oneshot::Sender<Result<(), TransportError>>>>,
    last_send: Mutex<Instant>,
    message_handler: RwLock<Option<MessageHandler>>,
    disconnected_handler: RwLock<Option<DisconnectedHandler>>,
}

impl<T: Transport> Connection<T> {
    /// Creates a new connection (not yet started).
    pub fn new(config: ClientConfig, protocol: Arc<dyn HubProtocol>, transport: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                protocol,
                transport,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                generation: AtomicU64::new(0),
                lifecycle: Mutex::new(()),
                cancel: Mutex::new(CancellationToken::new()),
                connection_id: Mutex::new(None),
                stop_waiters: Mutex::new(Vec::new()),
                last_send: Mutex::new(Instant::now()),
                message_handler: RwLock::new(None),
                disconnected_handler: RwLock::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns the id assigned by the last successful start.
    pub fn connection_id(&self) -> Option<String> {
        self.shared.connection_id.lock().clone()
    }

    pub fn protocol(&self) -> &Arc<dyn HubProtocol> {
        &self.shared.protocol
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    /// Sets the handler receiving incoming traffic.
    pub fn on_message(&self, handler: MessageHandler) -> Result<(), ClientError> {
        self.ensure_disconnected(
            "cannot set the callback when the connection is not in the disconnected state",
        )?;
        *self.shared.message_handler.write() = Some(handler);
        Ok(())
    }

    /// Sets the handler run after every teardown.
    pub fn on_disconnected(&self, handler: DisconnectedHandler) -> Result<(), ClientError> {
        self.ensure_disconnected(
            "cannot set the disconnected callback when the connection is not in the disconnected state",
        )?;
        *self.shared.disconnected_handler.write() = Some(handler);
        Ok(())
    }

    /// Installs both handlers on a connection that has not started yet.
    pub(crate) fn install_handlers(&self, message: MessageHandler, disconnected: DisconnectedHandler) {
        *self.shared.message_handler.write() = Some(message);
        *self.shared.disconnected_handler.write() = Some(disconnected);
    }

    fn ensure_disconnected(&self, message: &'static str) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(ClientError::InvalidState(message));
        }
        Ok(())
    }

    /// Opens the transport and performs the handshake.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.start_with_cancellation(CancellationToken::new()).await
    }

    /// Like [`start`](Self::start), aborting the attempt if `cancel` fires
    /// before the handshake completes.
    pub async fn start_with_cancellation(
        &self,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        let shared = &self.shared;
        let (generation, stop_token) = shared.begin_start()?;
        tracing::info!(
            url = %shared.config.url,
            protocol = shared.protocol.name(),
            "starting connection"
        );

        let attempt = tokio::select! {
            result = shared.connect() => result,
            _ = stop_token.cancelled() => {
                tracing::debug!("start aborted by stop");
                return Err(ClientError::Cancelled(STOPPED_DURING_START.to_string()));
            }
            _ = cancel.cancelled() => {
                Err(StartFailure::Handshake(ClientError::Cancelled(START_CANCELLED.to_string())))
            }
        };

        let leftover = match attempt {
            Ok(leftover) => leftover,
            Err(StartFailure::Transport(e)) => {
                tracing::error!(error = %e, "transport failed to start");
                let _guard = shared.lifecycle.lock();
                if shared.generation.load(Ordering::SeqCst) == generation {
                    shared.change_state(ConnectionState::Connecting, ConnectionState::Disconnected);
                }
                return Err(ClientError::Transport(e));
            }
            Err(StartFailure::Handshake(e)) => {
                tracing::warn!(error = %e, "start failed, stopping connection");
                let _ = shared.shutdown(None).await;
                return Err(e);
            }
        };

        {
            let _guard = shared.lifecycle.lock();
            if shared.generation.load(Ordering::SeqCst) != generation
                || !shared.change_state(ConnectionState::Connecting, ConnectionState::Connected)
            {
                return Err(ClientError::Cancelled(STOPPED_DURING_START.to_string()));
            }
            *shared.connection_id.lock() = Some(Uuid::new_v4().to_string());
        }
        *shared.last_send.lock() = Instant::now();

        tokio::spawn(
            shared
                .clone()
                .receive_loop(generation, stop_token.clone(), leftover),
        );
        tokio::spawn(shared.clone().keep_alive_loop(generation, stop_token));

        tracing::info!(connection_id = ?self.connection_id(), "connection started");
        Ok(())
    }

    /// Stops the connection.
    ///
    /// Stopping a disconnected connection succeeds immediately. Concurrent
    /// stops share one teardown and all resolve with its outcome.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.shared.shutdown(None).await
    }

    /// Sends an already-encoded hub message.
    pub async fn send(&self, payload: Bytes) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.shared.send(payload).await
    }
}

impl<T: Transport> Shared<T> {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn change_state(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let changed = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if changed {
            tracing::trace!(%from, %to, "connection state changed");
        }
        changed
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn begin_start(&self) -> Result<(u64, CancellationToken), ClientError> {
        let _guard = self.lifecycle.lock();
        if !self.change_state(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return Err(ClientError::InvalidState(
                "cannot start a connection that is not in the disconnected state",
            ));
        }
        *self.connection_id.lock() = None;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        Ok((generation, token))
    }

    /// Opens the transport and completes the handshake, returning any hub
    /// traffic that arrived with the handshake response.
    async fn connect(&self) -> Result<Bytes, StartFailure> {
        self.transport
            .start(&self.config.url)
            .await
            .map_err(StartFailure::Transport)?;

        let request = write_handshake(&*self.protocol)
            .map_err(|e| StartFailure::Handshake(e.into()))?;
        tracing::debug!(bytes = request.len(), "sending handshake");
        self.transport
            .send(request, TransferFormat::Text)
            .await
            .map_err(|e| StartFailure::Handshake(e.into()))?;

        let timeout = self.config.handshake_timeout();
        match tokio::time::timeout(timeout, self.read_handshake()).await {
            Ok(result) => result.map_err(StartFailure::Handshake),
            Err(_) => Err(StartFailure::Handshake(ClientError::HandshakeTimeout)),
        }
    }

    async fn read_handshake(&self) -> Result<Bytes, ClientError> {
        let mut buf = BytesMut::new();
        loop {
            let chunk = self
                .transport
                .receive()
                .await?
                .ok_or(ClientError::ConnectionClosed)?;
            buf.extend_from_slice(&chunk);

            match parse_handshake(&buf) {
                Ok((response, rest)) => {
                    if let Some(error) = response.error() {
                        tracing::warn!(error, "server rejected handshake");
                        return Err(ClientError::Handshake(error.to_string()));
                    }
                    tracing::debug!(leftover = rest.len(), "handshake complete");
                    return Ok(Bytes::copy_from_slice(rest));
                }
                Err(ProtocolError::IncompleteHandshake) => {
                    tracing::debug!(buffered = buf.len(), "partial handshake response");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn send(&self, payload: Bytes) -> Result<(), ClientError> {
        let format = self.protocol.transfer_format();
        tracing::debug!(bytes = payload.len(), ?format, "sending message");
        self.transport.send(payload, format).await.map_err(|e| {
            tracing::error!(error = %e, "error sending data");
            ClientError::Transport(e)
        })?;
        *self.last_send.lock() = Instant::now();
        Ok(())
    }

    fn dispatch(&self, data: Bytes) -> Result<(), ClientError> {
        let handler = self.message_handler.read().clone();
        match handler {
            Some(handler) => match panic::catch_unwind(AssertUnwindSafe(|| handler(data))) {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!("message handler panicked");
                    Ok(())
                }
            },
            None => Ok(()),
        }
    }

    async fn receive_loop(self: Arc<Self>, generation: u64, token: CancellationToken, leftover: Bytes) {
        let leftover_error = if leftover.is_empty() {
            None
        } else {
            self.dispatch(leftover).err()
        };
        let cause = match leftover_error {
            Some(cause) => cause,
            None => match self.read_until_failure(generation, &token).await {
                Some(cause) => cause,
                None => return,
            },
        };

        if !self.is_current(generation) {
            return;
        }
        tracing::warn!(error = %cause, "connection lost");
        let _ = self.shutdown(Some(cause)).await;
    }

    /// Reads and dispatches traffic until something fails. Returns `None`
    /// once this generation has been stopped.
    async fn read_until_failure(&self, generation: u64, token: &CancellationToken) -> Option<ClientError> {
        let server_timeout = self.config.server_timeout();
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => return None,
                received = tokio::time::timeout(server_timeout, self.transport.receive()) => received,
            };

            if !self.is_current(generation) {
                return None;
            }

            match received {
                Ok(Ok(Some(data))) => {
                    tracing::debug!(bytes = data.len(), "received message");
                    if let Err(e) = self.dispatch(data) {
                        return Some(e);
                    }
                }
                Ok(Ok(None)) => return Some(ClientError::ConnectionClosed),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "transport receive failed");
                    return Some(ClientError::Transport(e));
                }
                Err(_) => return Some(ClientError::ServerTimeout),
            }
        }
    }

    async fn keep_alive_loop(self: Arc<Self>, generation: u64, token: CancellationToken) {
        let interval = self.config.keep_alive_interval();
        loop {
            let idle = self.last_send.lock().elapsed();
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval.saturating_sub(idle)) => {}
            }

            if !self.is_current(generation) {
                return;
            }
            if self.last_send.lock().elapsed() < interval {
                continue;
            }

            match self.protocol.write_message(&HubMessage::Ping) {
                Ok(ping) => {
                    tracing::trace!("sending keepalive ping");
                    if let Err(e) = self.send(ping).await {
                        tracing::warn!(error = %e, "failed to send keepalive ping");
                        // Avoid spinning on a broken transport until the receive
                        // loop notices.
                        *self.last_send.lock() = Instant::now();
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode keepalive ping");
                    return;
                }
            }
        }
    }

    /// Stops the connection, coalescing concurrent callers onto one teardown.
    async fn shutdown(&self, cause: Option<ClientError>) -> Result<(), ClientError> {
        if self.state() == ConnectionState::Disconnected {
            tracing::debug!("stop ignored, connection is already disconnected");
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let first = {
            let mut waiters = self.stop_waiters.lock();
            waiters.push(tx);
            waiters.len() == 1
        };

        if first {
            let outcome = self.teardown().await;
            if let Some(outcome) = &outcome {
                // Runs while still Disconnecting so a new start cannot race it.
                self.notify_disconnected(cause.as_ref());
                self.finish_teardown();
                if let Err(e) = outcome {
                    tracing::error!(error = %e, "transport failed to stop cleanly");
                }
            }
            let waiters = std::mem::take(&mut *self.stop_waiters.lock());
            let outcome = outcome.unwrap_or(Ok(()));
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }

        match rx.await {
            Ok(outcome) => outcome.map_err(ClientError::Transport),
            Err(_) => Ok(()),
        }
    }

    /// Tears the connection down, leaving it Disconnecting. Returns `None` if
    /// it was already disconnected.
    async fn teardown(&self) -> Option<Result<(), TransportError>> {
        let token = {
            let _guard = self.lifecycle.lock();
            let previous = ConnectionState::from_u8(
                self.state
                    .swap(ConnectionState::Disconnecting as u8, Ordering::SeqCst),
            );
            if previous == ConnectionState::Disconnected {
                self.state
                    .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
                return None;
            }
            tracing::trace!(from = %previous, to = "disconnecting", "connection state changed");
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.cancel.lock().clone()
        };

        tracing::info!("stopping connection");
        token.cancel();
        let result = self.transport.stop().await;
        Some(result)
    }

    fn finish_teardown(&self) {
        {
            let _guard = self.lifecycle.lock();
            *self.connection_id.lock() = None;
            self.state
                .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
        }
        tracing::trace!(from = "disconnecting", to = "disconnected", "connection state changed");
        tracing::info!("connection stopped");
    }

    fn notify_disconnected(&self, cause: Option<&ClientError>) {
        let handler = self.disconnected_handler.read().clone();
        if let Some(handler) = handler {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(cause))).is_err() {
                tracing::error!("disconnected handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use hubwire_protocol::ProtocolKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn connection(transport: MockTransport) -> Connection<MockTransport> {
        connection_with(ClientConfig::new("ws://test/hub"), ProtocolKind::Json, transport)
    }

    fn connection_with(
        config: ClientConfig,
        kind: ProtocolKind,
        transport: MockTransport,
    ) -> Connection<MockTransport> {
        Connection::new(config, kind.create(), transport)
    }

    async fn wait_for_state(conn: &Connection<MockTransport>, state: ConnectionState) {
        while conn.state() != state {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_sends_handshake() {
        let conn = connection(MockTransport::accepting());
        conn.start().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.connection_id().is_some());

        let (handshake, format) = conn.transport().next_sent().await;
        assert_eq!(handshake.as_ref(), b"{\"protocol\":\"json\",\"version\":1}\x1e");
        assert_eq!(format, TransferFormat::Text);
    }

    #[tokio::test]
    async fn test_handshake_names_binary_protocol() {
        let conn = connection_with(
            ClientConfig::new("ws://test/hub"),
            ProtocolKind::MessagePack,
            MockTransport::accepting(),
        );
        conn.start().await.unwrap();

        let (handshake, format) = conn.transport().next_sent().await;
        assert_eq!(
            handshake.as_ref(),
            b"{\"protocol\":\"messagepack\",\"version\":1}\x1e"
        );
        assert_eq!(format, TransferFormat::Text);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let conn = connection(MockTransport::new());
        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.start().await }
        });
        wait_for_state(&conn, ConnectionState::Connecting).await;

        let err = conn.start().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot start a connection that is not in the disconnected state"
        );
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.transport().push(b"{}\x1e");
        first.await.unwrap().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_handshake_error_fails_start() {
        let conn = connection(MockTransport::new().with_handshake_response(b"{\"error\":\"bad protocol\"}\x1e"));
        let err = conn.start().await.unwrap_err();

        assert!(matches!(err, ClientError::Handshake(ref e) if e == "bad protocol"));
        assert!(err.to_string().contains("bad protocol"));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.transport().stops(), 1);
    }

    #[tokio::test]
    async fn test_legacy_server_rejected() {
        let conn = connection(
            MockTransport::new().with_handshake_response(b"{\"ProtocolVersion\":\"1.5\"}\x1e"),
        );
        let err = conn.start().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::IncompatibleServer)
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_split_across_reads() {
        let conn = connection(MockTransport::new());
        conn.transport().push(b"{");
        conn.transport().push(b"}");
        conn.transport().push(b"\x1e");
        conn.start().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_leftover_handshake_bytes_are_dispatched() {
        let conn = connection(MockTransport::new().with_handshake_response(b"{}\x1e{\"type\":6}\x1e"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on_message(Arc::new(move |data: Bytes| {
            let _ = tx.send(data);
            Ok(())
        }))
        .unwrap();

        conn.start().await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.as_ref(), b"{\"type\":6}\x1e");
    }

    #[tokio::test]
    async fn test_transport_start_failure() {
        let transport = MockTransport::new();
        transport.fail_start(TransportError::Connect("refused".into()));
        let conn = connection(transport);

        let err = conn.start().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Connect(_))));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        // Never opened, so never stopped.
        assert_eq!(conn.transport().stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let config = ClientConfig::new("ws://test/hub").with_handshake_timeout(Duration::from_secs(1));
        let conn = connection_with(config, ProtocolKind::Json, MockTransport::new());

        let err = conn.start().await.unwrap_err();
        assert!(matches!(err, ClientError::HandshakeTimeout));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.transport().stops(), 1);
    }

    #[tokio::test]
    async fn test_external_cancellation() {
        let conn = connection(MockTransport::new());
        let cancel = CancellationToken::new();
        let start = tokio::spawn({
            let conn = conn.clone();
            let cancel = cancel.clone();
            async move { conn.start_with_cancellation(cancel).await }
        });
        wait_for_state(&conn, ConnectionState::Connecting).await;

        cancel.cancel();
        let err = start.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Cancelled(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_during_start() {
        let conn = connection(MockTransport::new());
        let start = tokio::spawn({
            let conn = conn.clone();
            async move { conn.start().await }
        });
        wait_for_state(&conn, ConnectionState::Connecting).await;

        conn.stop().await.unwrap();
        let err = start.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), STOPPED_DURING_START);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_when_disconnected_is_noop() {
        let conn = connection(MockTransport::accepting());
        conn.stop().await.unwrap();
        assert_eq!(conn.transport().stops(), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_stops_tear_down_once() {
        let conn = connection(MockTransport::accepting());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();
        conn.on_disconnected(Arc::new(move |_: Option<&ClientError>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        conn.start().await.unwrap();

        let (a, b, c) = tokio::join!(conn.stop(), conn.stop(), conn.stop());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(conn.transport().stops(), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.connection_id().is_none());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let conn = connection(MockTransport::accepting());
        conn.start().await.unwrap();
        let first_id = conn.connection_id();
        conn.stop().await.unwrap();

        conn.start().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_ne!(conn.connection_id(), first_id);
        assert_eq!(conn.transport().starts(), 2);
    }

    #[tokio::test]
    async fn test_send_requires_connected() {
        let conn = connection(MockTransport::accepting());
        let err = conn.send(Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_send_uses_protocol_format() {
        let conn = connection_with(
            ClientConfig::new("ws://test/hub"),
            ProtocolKind::MessagePack,
            MockTransport::accepting(),
        );
        conn.start().await.unwrap();
        let _handshake = conn.transport().next_sent().await;

        conn.send(Bytes::from_static(&[0x01, 0x91, 0x06])).await.unwrap();
        let (payload, format) = conn.transport().next_sent().await;
        assert_eq!(payload.as_ref(), &[0x01, 0x91, 0x06]);
        assert_eq!(format, TransferFormat::Binary);
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let conn = connection(MockTransport::accepting());
        conn.start().await.unwrap();
        conn.transport().fail_send(TransportError::Send("broken pipe".into()));

        let err = conn.send(Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Send(_))));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_server_close_tears_down() {
        let conn = connection(MockTransport::accepting());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on_disconnected(Arc::new(move |cause: Option<&ClientError>| {
            let _ = tx.send(cause.map(|e| e.to_string()));
        }))
        .unwrap();
        conn.start().await.unwrap();

        conn.transport().close();
        let cause = rx.recv().await.unwrap();
        assert_eq!(cause.as_deref(), Some("connection closed"));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_receive_error_tears_down() {
        let conn = connection(MockTransport::accepting());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on_disconnected(Arc::new(move |cause: Option<&ClientError>| {
            let _ = tx.send(cause.map(|e| e.to_string()));
        }))
        .unwrap();
        conn.start().await.unwrap();

        conn.transport().push_error(TransportError::Receive("reset".into()));
        let cause = rx.recv().await.unwrap().unwrap();
        assert!(cause.contains("reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_timeout() {
        let config = ClientConfig::new("ws://test/hub")
            .with_keep_alive_interval(Duration::from_secs(1))
            .with_server_timeout(Duration::from_secs(5));
        let conn = connection_with(config, ProtocolKind::Json, MockTransport::accepting());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on_disconnected(Arc::new(move |cause: Option<&ClientError>| {
            let _ = tx.send(cause.map(|e| e.to_string()));
        }))
        .unwrap();
        conn.start().await.unwrap();

        let cause = rx.recv().await.unwrap().unwrap();
        assert_eq!(cause, ClientError::ServerTimeout.to_string());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_when_idle() {
        let config = ClientConfig::new("ws://test/hub")
            .with_keep_alive_interval(Duration::from_secs(1))
            .with_server_timeout(Duration::from_secs(60));
        let conn = connection_with(config, ProtocolKind::Json, MockTransport::accepting());
        conn.start().await.unwrap();
        let _handshake = conn.transport().next_sent().await;

        let (ping, _) = conn.transport().next_sent().await;
        assert_eq!(ping.as_ref(), b"{\"type\":6}\x1e");
        conn.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_skipped_while_sending() {
        let config = ClientConfig::new("ws://test/hub")
            .with_keep_alive_interval(Duration::from_secs(2))
            .with_server_timeout(Duration::from_secs(60));
        let conn = connection_with(config, ProtocolKind::Json, MockTransport::accepting());
        conn.start().await.unwrap();
        let _handshake = conn.transport().next_sent().await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            conn.send(Bytes::from_static(b"{\"type\":6}\x1e")).await.unwrap();
        }
        // Only the explicit sends went out.
        for _ in 0..3 {
            conn.transport().next_sent().await;
        }
        assert!(conn.transport().try_next_sent().await.is_none());
        conn.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_handler_panic_is_contained() {
        let conn = connection(MockTransport::accepting());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        conn.on_message(Arc::new(move |data: Bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
            if data.as_ref() == b"boom" {
                panic!("handler failure");
            }
            Ok(())
        }))
        .unwrap();
        conn.start().await.unwrap();

        conn.transport().push(b"boom");
        conn.transport().push(b"fine");
        while seen.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_message_handler_error_tears_down() {
        let conn = connection(MockTransport::accepting());
        conn.on_message(Arc::new(|data: Bytes| {
            if data.as_ref() == b"bad" {
                return Err(ClientError::Protocol(ProtocolError::NotAMap));
            }
            Ok(())
        }))
        .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on_disconnected(Arc::new(move |cause: Option<&ClientError>| {
            let _ = tx.send(cause.map(|e| matches!(e, ClientError::Protocol(ProtocolError::NotAMap))));
        }))
        .unwrap();
        conn.start().await.unwrap();

        conn.transport().push(b"fine");
        conn.transport().push(b"bad");
        assert_eq!(rx.recv().await.unwrap(), Some(true));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.transport().stops(), 1);
    }

    #[tokio::test]
    async fn test_invalid_leftover_handshake_bytes_tear_down() {
        let conn = connection(MockTransport::new().with_handshake_response(b"{}\x1ejunk"));
        conn.on_message(Arc::new(|_: Bytes| Err(ClientError::Protocol(ProtocolError::NotAMap))))
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on_disconnected(Arc::new(move |cause: Option<&ClientError>| {
            let _ = tx.send(cause.is_some());
        }))
        .unwrap();

        conn.start().await.unwrap();
        assert!(rx.recv().await.unwrap());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnected_handler_runs_before_disconnected_state() {
        let conn = connection(MockTransport::accepting());
        let shared = Arc::downgrade(&conn.shared);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on_disconnected(Arc::new(move |_: Option<&ClientError>| {
            let _ = tx.send(shared.upgrade().map(|s| s.state()));
        }))
        .unwrap();
        conn.start().await.unwrap();
        conn.stop().await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Some(ConnectionState::Disconnecting));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.connection_id().is_none());
    }

    #[tokio::test]
    async fn test_handlers_only_set_while_disconnected() {
        let conn = connection(MockTransport::accepting());
        conn.start().await.unwrap();
        assert!(matches!(
            conn.on_message(Arc::new(|_: Bytes| Ok(()))),
            Err(ClientError::InvalidState(_))
        ));
        assert!(conn
            .on_disconnected(Arc::new(|_: Option<&ClientError>| {}))
            .is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::from_u8(2), ConnectionState::Connected);
        assert_eq!(ConnectionState::from_u8(9), ConnectionState::Disconnected);
    }
}
