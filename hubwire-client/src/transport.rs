//! Byte transports carrying hub traffic.

use crate::error::TransportError;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hubwire_protocol::TransferFormat;
use std::future::Future;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// A duplex, message-oriented byte transport.
///
/// A transport is started once per connection attempt and may be restarted
/// after [`stop`](Transport::stop).
pub trait Transport: Send + Sync + 'static {
    /// Opens the transport to `url`.
    fn start(&self, url: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Sends one payload as a text or binary frame.
    fn send(
        &self,
        payload: Bytes,
        format: TransferFormat,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next payload.
    ///
    /// Returns `Ok(None)` once the peer has closed the transport.
    fn receive(&self) -> impl Future<Output = Result<Option<Bytes>, TransportError>> + Send;

    /// Closes the transport.
    fn stop(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket [`Transport`] built on `tokio-tungstenite`.
///
/// The socket is split so a pending receive never blocks a send.
#[derive(Default)]
pub struct WebSocketTransport {
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for WebSocketTransport {
    async fn start(&self, url: &str) -> Result<(), TransportError> {
        tracing::debug!(url, "opening WebSocket");
        let (ws, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(status = %response.status(), "WebSocket connected");

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn send(&self, payload: Bytes, format: TransferFormat) -> Result<(), TransportError> {
        let message = match format {
            TransferFormat::Text => {
                let text = String::from_utf8(payload.to_vec())
                    .map_err(|e| TransportError::Send(e.to_string()))?;
                Message::Text(text.into())
            }
            TransferFormat::Binary => Message::Binary(payload),
        };

        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn receive(&self) -> Result<Option<Bytes>, TransportError> {
        let mut stream = self.stream.lock().await;
        let stream = stream.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_bytes())))
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "WebSocket closed by server");
                    return Ok(None);
                }
                None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/raw frames
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
            }
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let sink = self.sink.lock().await.take();
        let result = match sink {
            Some(mut sink) => sink
                .close()
                .await
                .map_err(|e| TransportError::Close(e.to_string())),
            None => Ok(()),
        };
        self.stream.lock().await.take();
        result
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory transport for driving the connection in tests.

    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    type Incoming = Result<Option<Bytes>, TransportError>;

    pub(crate) struct MockTransport {
        incoming_tx: mpsc::UnboundedSender<Incoming>,
        incoming_rx: Mutex<mpsc::UnboundedReceiver<Incoming>>,
        sent_tx: mpsc::UnboundedSender<(Bytes, TransferFormat)>,
        sent_rx: Mutex<mpsc::UnboundedReceiver<(Bytes, TransferFormat)>>,
        handshake_response: SyncMutex<Option<Bytes>>,
        start_error: SyncMutex<Option<TransportError>>,
        send_error: SyncMutex<Option<TransportError>>,
        started: AtomicBool,
        pub(crate) start_calls: AtomicUsize,
        pub(crate) stop_calls: AtomicUsize,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            Self {
                incoming_tx,
                incoming_rx: Mutex::new(incoming_rx),
                sent_tx,
                sent_rx: Mutex::new(sent_rx),
                handshake_response: SyncMutex::new(None),
                start_error: SyncMutex::new(None),
                send_error: SyncMutex::new(None),
                started: AtomicBool::new(false),
                start_calls: AtomicUsize::new(0),
                stop_calls: AtomicUsize::new(0),
            }
        }

        /// Queues `response` as the server reply on every start.
        pub(crate) fn with_handshake_response(self, response: &[u8]) -> Self {
            *self.handshake_response.lock() = Some(Bytes::copy_from_slice(response));
            self
        }

        /// Replies to every start with a successful handshake.
        pub(crate) fn accepting() -> Self {
            Self::new().with_handshake_response(b"{}\x1e")
        }

        pub(crate) fn fail_start(&self, error: TransportError) {
            *self.start_error.lock() = Some(error);
        }

        pub(crate) fn fail_send(&self, error: TransportError) {
            *self.send_error.lock() = Some(error);
        }

        /// Delivers `data` as if sent by the server.
        pub(crate) fn push(&self, data: impl AsRef<[u8]>) {
            let _ = self
                .incoming_tx
                .send(Ok(Some(Bytes::copy_from_slice(data.as_ref()))));
        }

        /// Simulates the server closing the transport.
        pub(crate) fn close(&self) {
            let _ = self.incoming_tx.send(Ok(None));
        }

        pub(crate) fn push_error(&self, error: TransportError) {
            let _ = self.incoming_tx.send(Err(error));
        }

        /// Waits for the next payload the client sent.
        pub(crate) async fn next_sent(&self) -> (Bytes, TransferFormat) {
            self.sent_rx
                .lock()
                .await
                .recv()
                .await
                .expect("sender lives as long as the mock")
        }

        /// Returns the next sent payload if one is already queued.
        pub(crate) async fn try_next_sent(&self) -> Option<(Bytes, TransferFormat)> {
            self.sent_rx.lock().await.try_recv().ok()
        }

        pub(crate) fn starts(&self) -> usize {
            self.start_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn stops(&self) -> usize {
            self.stop_calls.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        async fn start(&self, _url: &str) -> Result<(), TransportError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.start_error.lock().clone() {
                return Err(error);
            }
            self.started.store(true, Ordering::SeqCst);
            if let Some(response) = self.handshake_response.lock().clone() {
                let _ = self.incoming_tx.send(Ok(Some(response)));
            }
            Ok(())
        }

        async fn send(&self, payload: Bytes, format: TransferFormat) -> Result<(), TransportError> {
            if !self.started.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            if let Some(error) = self.send_error.lock().clone() {
                return Err(error);
            }
            let _ = self.sent_tx.send((payload, format));
            Ok(())
        }

        async fn receive(&self) -> Result<Option<Bytes>, TransportError> {
            match self.incoming_rx.lock().await.recv().await {
                Some(incoming) => incoming,
                None => Ok(None),
            }
        }

        async fn stop(&self) -> Result<(), TransportError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.started.store(false, Ordering::SeqCst);
            // Drop anything the server sent that was never read.
            let mut incoming = self.incoming_rx.lock().await;
            while incoming.try_recv().is_ok() {}
            Ok(())
        }
    }
}
