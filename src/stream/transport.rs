//! Transport adapter contract and the websocket implementation.
//!
//! A transport is an ordered, reliable, message-oriented duplex stream. The
//! client only sees it through [`TransportHandle`]: a command queue for
//! outbound text frames and close requests, and an event queue for inbound
//! frames and the closure notification. Whatever drives the underlying socket
//! runs in its own task.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Opens physical connections for the client.
pub trait Connector: Send + Sync + 'static {
    /// Opens a new transport to `endpoint`.
    fn open(&self, endpoint: &str) -> BoxFuture<'static, Result<TransportHandle, TransportError>>;
}

/// Commands accepted by a transport driver.
#[derive(Debug)]
pub enum TransportCommand {
    /// Send one text frame.
    Send(String),
    /// Close the stream; `done` fires once closure has been carried out.
    Close { done: oneshot::Sender<()> },
}

/// Events produced by a transport driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Frame(String),
    /// The stream ended. No further events follow.
    Closed(CloseInfo),
}

/// Details of a stream closure, when the peer supplied any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

/// Client-side ends of one physical connection.
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<TransportCommand>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    /// Builds a handle from a driver's queues.
    pub fn new(
        outbound: mpsc::UnboundedSender<TransportCommand>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Creates a connected in-memory pair.
    ///
    /// The [`TransportPeer`] plays the remote side: it observes everything the
    /// client sends and can inject frames or a closure.
    pub fn in_memory() -> (TransportHandle, TransportPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            TransportHandle::new(outbound_tx, inbound_rx),
            TransportPeer {
                received: outbound_rx,
                events: inbound_tx,
            },
        )
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<TransportCommand>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        (self.outbound, self.inbound)
    }
}

/// Remote side of an in-memory transport.
#[derive(Debug)]
pub struct TransportPeer {
    received: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportPeer {
    /// Waits for the next command issued by the client.
    ///
    /// Returns `None` once the client dropped its end.
    pub async fn recv(&mut self) -> Option<TransportCommand> {
        self.received.recv().await
    }

    /// Waits for the next text frame, acknowledging close requests on the way.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.received.recv().await? {
                TransportCommand::Send(text) => return Some(text),
                TransportCommand::Close { done } => {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Returns a command if one is already queued.
    pub fn try_recv(&mut self) -> Option<TransportCommand> {
        self.received.try_recv().ok()
    }

    /// Delivers a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.events
            .send(TransportEvent::Frame(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Simulates the remote end closing the stream.
    pub fn close(&self, info: CloseInfo) -> Result<(), TransportError> {
        self.events
            .send(TransportEvent::Closed(info))
            .map_err(|_| TransportError::Closed)
    }

    /// Returns whether the client has released its end of the stream.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket handshake or I/O error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The stream is no longer accepting commands.
    #[error("transport is closed")]
    Closed,
}

/// Websocket transport built on tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn open(&self, endpoint: &str) -> BoxFuture<'static, Result<TransportHandle, TransportError>> {
        let endpoint = endpoint.to_string();
        Box::pin(async move {
            let request = endpoint.as_str().into_client_request()?;
            let (socket, _) = connect_async(request).await?;
            debug!(event = "websocket_opened", endpoint = %endpoint);

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(websocket_worker(socket, outbound_rx, inbound_tx));
            Ok(TransportHandle::new(outbound_tx, inbound_rx))
        })
    }
}

async fn websocket_worker(
    mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound_rx: mpsc::UnboundedReceiver<TransportCommand>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        tokio::select! {
            maybe_command = outbound_rx.recv() => {
                match maybe_command {
                    Some(TransportCommand::Send(text)) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            warn!(event = "websocket_send_failed", error = %err);
                            let _ = inbound_tx.send(TransportEvent::Closed(CloseInfo::default()));
                            return;
                        }
                    }
                    Some(TransportCommand::Close { done }) => {
                        let _ = socket.close(None).await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbound_tx.send(TransportEvent::Frame(text));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            let _ = inbound_tx.send(TransportEvent::Frame(text));
                        }
                        Err(err) => warn!(event = "websocket_binary_dropped", error = %err),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            let _ = inbound_tx.send(TransportEvent::Closed(CloseInfo::default()));
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let info = frame
                            .map(|frame| CloseInfo {
                                code: Some(u16::from(frame.code)),
                                reason: Some(frame.reason.into_owned()),
                            })
                            .unwrap_or_default();
                        debug!(event = "websocket_close_received", code = ?info.code, reason = ?info.reason);
                        let _ = inbound_tx.send(TransportEvent::Closed(info));
                        return;
                    }
                    Some(Err(err)) => {
                        debug!(event = "websocket_receive_failed", error = %err);
                        let _ = inbound_tx.send(TransportEvent::Closed(CloseInfo::default()));
                        return;
                    }
                    None => {
                        let _ = inbound_tx.send(TransportEvent::Closed(CloseInfo::default()));
                        return;
                    }
                }
            }
        }
    }
}
