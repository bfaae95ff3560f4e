//! Connection actor.
//!
//! One task owns the transport, the correlation table, the subscription
//! registry and every timer. Public handles reach it through [`Command`]s;
//! transports, deadlines and connect attempts report back through
//! [`Internal`] events. Nothing here is shared, so no state is ever touched
//! concurrently.

mod dispatch;

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, Backoff};
use crate::stream::calls::{CallKind, CallReply, CorrelationTable};
use crate::stream::client::{
    ClientError, ClientOptions, ConnectInfo, ConnectionState, ConnectionStatus,
};
use crate::stream::handlers::{
    ClientEvent, ClientHandlers, ConnectContext, DeliveryQueue, DisconnectContext, ErrorContext,
    SubscriptionHandlers,
};
use crate::stream::keepalive::{KeepaliveScheduler, Timer};
use crate::stream::proto::{
    ChannelParams, ConnectParams, DisconnectDirective, Params, PingParams, PublishParams, Request,
};
use crate::stream::registry::{SubscriptionRegistry, SubscriptionSnapshot};
use crate::stream::transport::{
    CloseInfo, Connector, TransportCommand, TransportError, TransportEvent, TransportHandle,
};

const CLOSED_BY_CLIENT: &str = "client closed";
const CONNECTION_LOST: &str = "connection closed";
const PONG_MISSING: &str = "no ping";

/// Requests from public handles.
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<ConnectInfo, ClientError>>,
    },
    Subscribe {
        channel: String,
        handlers: SubscriptionHandlers,
        reply: oneshot::Sender<(u64, watch::Receiver<SubscriptionSnapshot>)>,
    },
    Resubscribe {
        channel: String,
        key: u64,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        channel: String,
        key: u64,
        reply: oneshot::Sender<()>,
    },
    Publish {
        channel: String,
        key: u64,
        data: Value,
        reply: CallReply,
    },
    Ping {
        reply: CallReply,
    },
    Disconnect {
        reason: String,
        reconnect: bool,
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Channels {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Events produced by tasks the actor spawned.
///
/// Transport events carry the generation of the attempt that produced them;
/// anything from a superseded generation is ignored.
#[derive(Debug)]
pub(crate) enum Internal {
    TransportOpened {
        generation: u64,
        result: Result<TransportHandle, TransportError>,
    },
    Frame {
        generation: u64,
        text: String,
    },
    TransportClosed {
        generation: u64,
        info: CloseInfo,
    },
    CallTimedOut {
        id: u64,
    },
}

#[derive(Debug)]
struct ActiveTransport {
    outbound: mpsc::UnboundedSender<TransportCommand>,
}

/// Starts the actor and returns the handles a [`crate::stream::client::Client`]
/// needs.
pub(crate) fn spawn(
    endpoint: String,
    token: SecretString,
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    handlers: ClientHandlers,
) -> (
    mpsc::UnboundedSender<Command>,
    watch::Receiver<ConnectionState>,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::default());

    let actor = ConnectionActor {
        reconnect_enabled: options.reconnect,
        backoff: Backoff::new(options.backoff.clone()),
        keepalive: KeepaliveScheduler::new(options.ping, options.ping_interval),
        reconnect_timer: Timer::new(),
        calls: CorrelationTable::new(internal_tx.clone()),
        subscriptions: SubscriptionRegistry::new(),
        notifications: DeliveryQueue::spawn("client".to_string()),
        handlers: Arc::new(handlers),
        endpoint,
        token,
        options,
        connector,
        commands: command_rx,
        internal_tx,
        internal_rx,
        state: state_tx,
        status: ConnectionStatus::Disconnected,
        client_id: None,
        generation: 0,
        transport: None,
        connect_waiter: None,
    };
    tokio::spawn(actor.run());

    (command_tx, state_rx)
}

struct ConnectionActor {
    endpoint: String,
    token: SecretString,
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    state: watch::Sender<ConnectionState>,
    status: ConnectionStatus,
    client_id: Option<String>,
    reconnect_enabled: bool,
    backoff: Backoff,
    reconnect_timer: Timer,
    keepalive: KeepaliveScheduler,
    /// Incremented on every connect attempt and every teardown.
    generation: u64,
    transport: Option<ActiveTransport>,
    connect_waiter: Option<oneshot::Sender<Result<ConnectInfo, ClientError>>>,
    calls: CorrelationTable,
    subscriptions: SubscriptionRegistry,
    handlers: Arc<ClientHandlers>,
    notifications: DeliveryQueue<ClientHandlers, ClientEvent>,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            let keepalive_armed = self.keepalive.is_armed();
            let reconnect_armed = self.reconnect_timer.is_armed();

            tokio::select! {
                maybe_command = self.commands.recv() => match maybe_command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
                () = self.keepalive.idle(), if keepalive_armed => self.send_keepalive_ping(),
                () = self.reconnect_timer.fired(), if reconnect_armed => self.reconnect_due(),
            }
        }

        debug!(event = "client_dropped", endpoint = %self.endpoint);
        self.disconnect("client dropped".to_string(), false);
        self.subscriptions.clear();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.handle_connect(reply),
            Command::Subscribe {
                channel,
                handlers,
                reply,
            } => {
                let upsert = self.subscriptions.upsert(&channel, handlers);
                if upsert.needs_request {
                    self.request_subscribe(channel, upsert.key);
                }
                let _ = reply.send((upsert.key, upsert.snapshot));
            }
            Command::Resubscribe {
                channel,
                key,
                reply,
            } => {
                let retried = self.subscriptions.retry(&channel, key);
                if retried {
                    self.request_subscribe(channel, key);
                }
                let _ = reply.send(retried);
            }
            Command::Unsubscribe {
                channel,
                key,
                reply,
            } => {
                if self.subscriptions.remove(&channel, key)
                    && self.status == ConnectionStatus::Connected
                {
                    let params = Params::Unsubscribe(ChannelParams {
                        channel: channel.clone(),
                    });
                    if let Err(err) = self.send_request(params) {
                        debug!(event = "unsubscribe_not_sent", channel = %channel, error = %err);
                    }
                }
                let _ = reply.send(());
            }
            Command::Publish {
                channel,
                key,
                data,
                reply,
            } => self.handle_publish(channel, key, data, reply),
            Command::Ping { reply } => self.handle_ping(reply),
            Command::Disconnect {
                reason,
                reconnect,
                reply,
            } => {
                self.disconnect(reason, reconnect);
                let _ = reply.send(());
            }
            Command::Close { reply } => self.handle_close(reply),
            Command::Channels { reply } => {
                let _ = reply.send(self.subscriptions.channels());
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::TransportOpened { generation, result } => {
                if generation != self.generation {
                    // Superseded attempt: dropping the handle closes it.
                    debug!(event = "stale_transport_dropped", generation);
                    return;
                }
                match result {
                    Ok(handle) => self.transport_opened(generation, handle),
                    Err(err) => self.connect_failed(ClientError::Transport(err)),
                }
            }
            Internal::Frame { generation, text } => {
                if generation == self.generation {
                    self.handle_frame(&text);
                }
            }
            Internal::TransportClosed { generation, info } => {
                if generation != self.generation {
                    return;
                }
                let directive = DisconnectDirective::from_close_reason(info.reason.as_deref());
                info!(
                    event = "transport_closed",
                    code = ?info.code,
                    reason = %directive.reason,
                    reconnect = directive.reconnect
                );
                let reason = if directive.reason.is_empty() {
                    CONNECTION_LOST.to_string()
                } else {
                    directive.reason
                };
                self.disconnect(reason, directive.reconnect);
            }
            Internal::CallTimedOut { id } => self.call_timed_out(id),
        }
    }

    fn handle_connect(&mut self, reply: oneshot::Sender<Result<ConnectInfo, ClientError>>) {
        if self.status != ConnectionStatus::Disconnected {
            let _ = reply.send(Err(ClientError::InvalidState(self.status)));
            return;
        }
        self.reconnect_enabled = self.options.reconnect;
        self.reconnect_timer.disarm();
        self.connect_waiter = Some(reply);
        self.start_connect();
    }

    fn start_connect(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.set_status(ConnectionStatus::Connecting);
        info!(
            event = "connect_started",
            endpoint = %self.endpoint,
            generation,
            attempt = self.backoff.attempt()
        );

        let open = self.connector.open(&self.endpoint);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = open.await;
            let _ = internal.send(Internal::TransportOpened { generation, result });
        });
    }

    fn transport_opened(&mut self, generation: u64, handle: TransportHandle) {
        let (outbound, inbound) = handle.into_parts();
        tokio::spawn(listen(generation, inbound, self.internal_tx.clone()));
        self.transport = Some(ActiveTransport { outbound });

        let params = Params::Connect(ConnectParams {
            token: self.token.expose_secret().clone(),
            data: self.options.connect_data.clone(),
        });
        match self.send_request(params) {
            Ok(id) => {
                self.calls
                    .register(id, CallKind::Connect, None, self.options.connect_timeout);
            }
            Err(err) => self.connect_failed(err),
        }
    }

    fn on_connected(&mut self, client_id: Option<String>) {
        self.client_id = client_id.clone();
        self.set_status(ConnectionStatus::Connected);
        self.backoff.reset();
        self.keepalive.start();
        info!(event = "connected", client_id = ?client_id);

        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Ok(ConnectInfo {
                client_id: client_id.clone(),
            }));
        }
        self.notify(ClientEvent::Connected(ConnectContext { client_id }));

        for (channel, key) in self.subscriptions.pending() {
            self.request_subscribe(channel, key);
        }
    }

    /// Reports a failed connect attempt and tears the attempt down.
    fn connect_failed(&mut self, error: ClientError) {
        warn!(event = "connect_failed", endpoint = %self.endpoint, error = %error);
        let context = ErrorContext {
            message: error.to_string(),
            server_error: match &error {
                ClientError::Call(server_error) => Some(server_error.clone()),
                _ => None,
            },
        };
        let reason = context.message.clone();
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(error));
        }
        self.notify(ClientEvent::Error(context));
        self.disconnect(reason, true);
    }

    /// Tears down the current connection or attempt.
    ///
    /// Returns a receiver that completes once the transport has closed, when
    /// there was one to close.
    fn disconnect(&mut self, reason: String, reconnect: bool) -> Option<oneshot::Receiver<()>> {
        self.keepalive.stop();
        if !reconnect {
            self.reconnect_enabled = false;
            self.reconnect_timer.disarm();
        }
        if self.status == ConnectionStatus::Disconnected {
            return None;
        }

        info!(event = "disconnected", reason = %reason, reconnect);
        self.generation += 1;
        let closing = self.transport.take().and_then(|transport| {
            let (done_tx, done_rx) = oneshot::channel();
            transport
                .outbound
                .send(TransportCommand::Close { done: done_tx })
                .ok()
                .map(|()| done_rx)
        });

        self.client_id = None;
        self.set_status(ConnectionStatus::Disconnected);

        let cancelled = self.calls.cancel_all();
        if !cancelled.is_empty() {
            debug!(event = "calls_cancelled", count = cancelled.len());
        }
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(ClientError::ConnectionClosed));
        }
        let reset = self.subscriptions.reset_confirmations();
        if reset > 0 {
            debug!(event = "subscriptions_reset", count = reset);
        }

        self.notify(ClientEvent::Disconnected(DisconnectContext { reason, reconnect }));
        self.schedule_reconnect();
        closing
    }

    fn schedule_reconnect(&mut self) {
        if !self.reconnect_enabled || self.status != ConnectionStatus::Disconnected {
            return;
        }
        let delay = self.backoff.next_delay();
        self.reconnect_timer.arm(delay);
        info!(
            event = "reconnect_scheduled",
            delay_ms = delay.as_millis() as u64,
            attempt = self.backoff.attempt()
        );
    }

    fn reconnect_due(&mut self) {
        if !self.reconnect_enabled || self.status != ConnectionStatus::Disconnected {
            return;
        }
        self.start_connect();
    }

    fn handle_close(&mut self, reply: oneshot::Sender<()>) {
        let closing = self.disconnect(CLOSED_BY_CLIENT.to_string(), false);
        let timeout = self.options.close_timeout;
        tokio::spawn(async move {
            if let Some(done) = closing {
                if with_timeout(timeout, done).await.is_err() {
                    debug!(event = "close_timed_out", timeout_ms = timeout.as_millis() as u64);
                }
            }
            let _ = reply.send(());
        });
    }

    fn handle_publish(&mut self, channel: String, key: u64, data: Value, reply: CallReply) {
        match self.subscriptions.get_mut(&channel, key) {
            None => {
                let _ = reply.send(Err(ClientError::Unsubscribed(channel)));
                return;
            }
            Some(entry) if !entry.is_confirmed() => {
                let _ = reply.send(Err(ClientError::NotConfirmed(channel)));
                return;
            }
            Some(_) => {}
        }

        let params = Params::Publish(PublishParams {
            channel: channel.clone(),
            data,
        });
        match self.send_request(params) {
            Ok(id) => self.calls.register(
                id,
                CallKind::Publish { channel, key },
                Some(reply),
                self.options.call_timeout,
            ),
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn handle_ping(&mut self, reply: CallReply) {
        if self.status != ConnectionStatus::Connected {
            let _ = reply.send(Err(ClientError::NotConnected));
            return;
        }
        match self.send_request(Params::Ping(PingParams::default())) {
            Ok(id) => self.calls.register(
                id,
                CallKind::Ping { keepalive: false },
                Some(reply),
                Some(self.options.pong_timeout),
            ),
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn send_keepalive_ping(&mut self) {
        if self.status != ConnectionStatus::Connected {
            return;
        }
        match self.send_request(Params::Ping(PingParams::default())) {
            Ok(id) => {
                debug!(event = "keepalive_ping", id, in_flight = self.calls.len());
                self.calls.register(
                    id,
                    CallKind::Ping { keepalive: true },
                    None,
                    Some(self.options.pong_timeout),
                );
            }
            Err(err) => debug!(event = "keepalive_ping_not_sent", error = %err),
        }
    }

    fn call_timed_out(&mut self, id: u64) {
        // Already resolved by its reply or by a disconnect.
        let Some(call) = self.calls.take(id) else {
            return;
        };
        let kind = call.kind.clone();
        match kind {
            CallKind::Connect => {
                drop(call);
                self.connect_failed(ClientError::Timeout);
            }
            CallKind::Ping { keepalive: true } => {
                drop(call);
                warn!(event = "pong_timeout", id);
                self.disconnect(PONG_MISSING.to_string(), true);
            }
            CallKind::Subscribe { channel, .. } => {
                drop(call);
                debug!(event = "subscribe_timed_out", id, channel = %channel);
            }
            CallKind::Publish { .. } | CallKind::Ping { keepalive: false } => {
                debug!(event = "call_timed_out", id);
                call.resolve(Err(ClientError::Timeout));
            }
        }
    }

    fn request_subscribe(&mut self, channel: String, key: u64) {
        // Sent on the next successful connect otherwise.
        if self.status != ConnectionStatus::Connected {
            return;
        }
        let params = Params::Subscribe(ChannelParams {
            channel: channel.clone(),
        });
        match self.send_request(params) {
            Ok(id) => self
                .calls
                .register(id, CallKind::Subscribe { channel, key }, None, None),
            Err(err) => debug!(event = "subscribe_not_sent", channel = %channel, error = %err),
        }
    }

    /// Serializes and sends one request, returning its id.
    fn send_request(&mut self, params: Params) -> Result<u64, ClientError> {
        let Some(transport) = self.transport.as_ref() else {
            return Err(ClientError::NotConnected);
        };
        let id = self.calls.next_id();
        let request = Request::new(id, params);
        let text = request.to_text()?;
        transport
            .outbound
            .send(TransportCommand::Send(text))
            .map_err(|_| ClientError::Transport(TransportError::Closed))?;
        debug!(event = "request_sent", id, method = %request.method);
        Ok(id)
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        self.state.send_replace(ConnectionState {
            status,
            client_id: self.client_id.clone(),
        });
    }

    fn notify(&self, event: ClientEvent) {
        self.notifications.deliver(&self.handlers, event);
    }
}

/// Forwards one transport's events to the actor, tagged with its generation.
async fn listen(
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    internal: mpsc::UnboundedSender<Internal>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            TransportEvent::Frame(text) => {
                if internal.send(Internal::Frame { generation, text }).is_err() {
                    return;
                }
            }
            TransportEvent::Closed(info) => {
                let _ = internal.send(Internal::TransportClosed { generation, info });
                return;
            }
        }
    }
    let _ = internal.send(Internal::TransportClosed {
        generation,
        info: CloseInfo::default(),
    });
}
