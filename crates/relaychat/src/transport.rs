use crate::config::ClientConfig;
use crate::error::{TransmitError, TransportError};
use crate::protocol::{SendCommand, UserId};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open push-channel socket carrying JSON text frames.
pub struct Socket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens push-channel sockets for a user.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, user_id: UserId) -> impl Future<Output = Result<Socket, TransportError>> + Send;
}

/// WebSocket dialer: `<endpoint>?user_id=<id>`.
#[derive(Debug, Clone)]
pub struct WsDialer {
    endpoint: String,
}

impl WsDialer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.push_endpoint())
    }
}

impl Dialer for WsDialer {
    fn dial(&self, user_id: UserId) -> impl Future<Output = Result<Socket, TransportError>> + Send {
        let url = format!("{}?user_id={user_id}", self.endpoint);
        async move {
            let (ws, _) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::Dial(e.to_string()))?;
            let (sink, stream) = ws.split();

            let sink = sink
                .sink_map_err(|e| TransportError::Socket(e.to_string()))
                .with(|text: String| async move { Ok::<_, TransportError>(WsMessage::text(text)) });
            // Only text frames carry events; ping/pong/close are handled by tungstenite.
            let stream = stream.filter_map(|frame| async move {
                match frame {
                    Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Socket(e.to_string()))),
                }
            });

            Ok(Socket {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClosedByClient,
    RemoteClosed,
    DialFailed,
    SocketError,
}

/// Lifecycle events of one connection attempt: at most one `Opened`, any
/// number of `Message`s, then exactly one `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Error(TransportError),
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub connection: ConnectionId,
    pub event: TransportEvent,
}

/// Handle to one push-channel connection. Dropping it closes the socket.
pub struct ConnectionHandle {
    id: ConnectionId,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue a send command on the socket. Never buffers across reconnects:
    /// fails with `NotConnected` unless the socket is open right now.
    pub fn send(&self, command: &SendCommand) -> Result<(), TransmitError> {
        if !self.is_connected() {
            return Err(TransmitError::NotConnected);
        }
        let frame = serde_json::to_string(command).map_err(|e| TransmitError::Encode(e.to_string()))?;
        self.outbound.send(frame).map_err(|_| TransmitError::Closed)
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::debug!(connection = %self.id, "closing push channel");
        self.cancel.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Start a new connection attempt. Events for it are tagged with `id` and
/// delivered on `events`.
pub fn connect<D: Dialer>(
    dialer: Arc<D>,
    user_id: UserId,
    id: ConnectionId,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> ConnectionHandle {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    tokio::spawn(run_connection(
        dialer,
        user_id,
        id,
        state_tx,
        outbound_rx,
        cancel.clone(),
        events,
    ));

    ConnectionHandle {
        id,
        state: state_rx,
        outbound: outbound_tx,
        cancel,
    }
}

fn emit(events: &mpsc::UnboundedSender<ConnectionEvent>, connection: ConnectionId, event: TransportEvent) {
    // The runtime may already be gone during shutdown.
    let _ = events.send(ConnectionEvent { connection, event });
}

async fn run_connection<D: Dialer>(
    dialer: Arc<D>,
    user_id: UserId,
    id: ConnectionId,
    state: watch::Sender<ConnectionState>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let dialed = tokio::select! {
        _ = cancel.cancelled() => None,
        result = dialer.dial(user_id) => Some(result),
    };

    let Socket {
        mut sink,
        mut stream,
    } = match dialed {
        Some(Ok(socket)) => socket,
        Some(Err(e)) => {
            tracing::warn!(connection = %id, user_id, err = %e, "push channel dial failed");
            state.send_replace(ConnectionState::Disconnected);
            emit(&events, id, TransportEvent::Error(e));
            emit(&events, id, TransportEvent::Closed(CloseReason::DialFailed));
            return;
        }
        None => {
            state.send_replace(ConnectionState::Disconnected);
            emit(&events, id, TransportEvent::Closed(CloseReason::ClosedByClient));
            return;
        }
    };

    state.send_replace(ConnectionState::Connected);
    tracing::info!(connection = %id, user_id, "push channel connected");
    emit(&events, id, TransportEvent::Opened);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                break CloseReason::ClosedByClient;
            }
            frame = stream.next() => match frame {
                Some(Ok(text)) => emit(&events, id, TransportEvent::Message(text)),
                Some(Err(e)) => {
                    emit(&events, id, TransportEvent::Error(e));
                    break CloseReason::SocketError;
                }
                None => break CloseReason::RemoteClosed,
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        emit(&events, id, TransportEvent::Error(e));
                        break CloseReason::SocketError;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break CloseReason::ClosedByClient;
                }
            },
        }
    };

    state.send_replace(ConnectionState::Disconnected);
    tracing::info!(connection = %id, user_id, ?reason, "push channel closed");
    emit(&events, id, TransportEvent::Closed(reason));
}
