//! Public client handle, subscription handles and configuration.
//!
//! [`Client`] is a cheap, cloneable handle. All connection state lives in a
//! background task (see `connection`) that owns the transport; handles talk
//! to it through a command queue and wait on one-shot completions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::retry::BackoffPolicy;
use crate::stream::connection::{self, Command};
use crate::stream::handlers::{
    ClientHandlers, ConnectContext, DisconnectContext, ErrorContext, SubscriptionHandlers,
};
use crate::stream::proto::ServerError;
use crate::stream::registry::{SubscriptionSnapshot, SubscriptionState};
use crate::stream::transport::{Connector, TransportError, WebSocketConnector};

/// Default values for [`ClientOptions`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    pub const RECONNECT: bool = true;
    pub const PING: bool = true;
    pub const PING_INTERVAL: Duration = Duration::from_secs(25);
    pub const PONG_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
    pub const BACKOFF_FACTOR: f64 = 2.0;
    pub const BACKOFF_MAX: Duration = Duration::from_secs(60);
    pub const BACKOFF_JITTER_FRACTION: f64 = 0.5;
}

/// Tunables for connection management.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Reconnect automatically after the connection drops.
    pub reconnect: bool,
    /// Send keepalive pings while the connection is idle.
    pub ping: bool,
    /// Idle time before a keepalive ping is sent.
    pub ping_interval: Duration,
    /// Time to wait for a ping reply before the connection is considered dead.
    pub pong_timeout: Duration,
    /// Deadline for the server's connect reply. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Deadline for publish acknowledgements. `None` relies on disconnect
    /// cleanup only.
    pub call_timeout: Option<Duration>,
    /// Upper bound on how long [`Client::close`] waits for the transport.
    pub close_timeout: Duration,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
    /// Application data sent along with the token in the connect request.
    pub connect_data: Value,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect: ClientDefaults::RECONNECT,
            ping: ClientDefaults::PING,
            ping_interval: ClientDefaults::PING_INTERVAL,
            pong_timeout: ClientDefaults::PONG_TIMEOUT,
            connect_timeout: Some(ClientDefaults::CONNECT_TIMEOUT),
            call_timeout: None,
            close_timeout: ClientDefaults::CLOSE_TIMEOUT,
            backoff: BackoffPolicy {
                base: ClientDefaults::BACKOFF_BASE,
                factor: ClientDefaults::BACKOFF_FACTOR,
                max: ClientDefaults::BACKOFF_MAX,
                jitter_fraction: ClientDefaults::BACKOFF_JITTER_FRACTION,
            },
            connect_data: Value::Object(Default::default()),
        }
    }
}

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        })
    }
}

/// Observable connection state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Server-assigned id; set only while connected.
    pub client_id: Option<String>,
}

/// Outcome of a successful [`Client::connect`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectInfo {
    pub client_id: Option<String>,
}

/// Server rejection of a subscribe or publish on one channel.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("subscription to {channel} rejected: {error}")]
pub struct SubscriptionError {
    pub channel: String,
    pub error: ServerError,
    /// Optional hint from the server on how to proceed.
    pub advice: Option<String>,
}

/// Errors surfaced to callers of client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport could not be opened or written to.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A reply did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected a subscribe or publish.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// The call's deadline elapsed before a reply arrived.
    #[error("request timed out")]
    Timeout,

    /// The server answered with an explicit error.
    #[error("server error: {0}")]
    Call(ServerError),

    /// The connection dropped while the call was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation needs an established connection.
    #[error("client is not connected")]
    NotConnected,

    /// `connect` was called while not disconnected.
    #[error("cannot connect while {0}")]
    InvalidState(ConnectionStatus),

    /// The subscription was removed.
    #[error("subscription to {0} is not active")]
    Unsubscribed(String),

    /// The subscription lost its confirmation before the request went out.
    #[error("subscription to {0} is not confirmed")]
    NotConfirmed(String),

    /// Options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The background connection task is gone.
    #[error("client task has stopped")]
    ClientStopped,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    endpoint: String,
    token: SecretString,
    options: ClientOptions,
    handlers: ClientHandlers,
    connector: Arc<dyn Connector>,
}

impl ClientBuilder {
    /// Replaces all options.
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses a custom transport instead of the websocket connector.
    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Enables or disables automatic reconnection.
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.options.reconnect = reconnect;
        self
    }

    /// Replaces all lifecycle handlers.
    pub fn with_handlers(mut self, handlers: ClientHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn on_connect<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handlers = self.handlers.on_connect(handler);
        self
    }

    pub fn on_disconnect<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(DisconnectContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handlers = self.handlers.on_disconnect(handler);
        self
    }

    pub fn on_error<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ErrorContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handlers = self.handlers.on_error(handler);
        self
    }

    /// Validates the configuration and starts the background connection task.
    ///
    /// Must be called from within a Tokio runtime. The client starts
    /// disconnected; call [`Client::connect`] to open the connection.
    pub fn build(self) -> Result<Client, ClientError> {
        validate_endpoint(&self.endpoint)?;
        validate_options(&self.options)?;

        let (commands, state) = connection::spawn(
            self.endpoint,
            self.token,
            self.options,
            self.connector,
            self.handlers,
        );
        Ok(Client { commands, state })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("endpoint", &self.endpoint)
            .field("options", &self.options)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

/// Handle to one logical pub/sub connection.
#[derive(Clone, Debug)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl Client {
    /// Starts configuring a client for `endpoint`, authenticating with `token`.
    pub fn builder(endpoint: impl Into<String>, token: SecretString) -> ClientBuilder {
        ClientBuilder {
            endpoint: endpoint.into().trim_end().to_string(),
            token,
            options: ClientOptions::default(),
            handlers: ClientHandlers::default(),
            connector: Arc::new(WebSocketConnector),
        }
    }

    /// Opens the connection and waits for the server's connect reply.
    ///
    /// Only valid while disconnected. When the attempt fails and reconnection
    /// is enabled, a reconnect is scheduled in the background before the
    /// error is returned.
    pub async fn connect(&self) -> Result<ConnectInfo, ClientError> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Registers interest in `channel`.
    ///
    /// Subscribing to a channel that is already registered replaces its
    /// handler set and returns a handle to the same subscription. Use
    /// [`Subscription::ready`] to wait for the server's confirmation.
    pub async fn subscribe(
        &self,
        channel: impl Into<String>,
        handlers: SubscriptionHandlers,
    ) -> Result<Subscription, ClientError> {
        let channel = channel.into();
        let (key, snapshot) = self
            .request(|reply| Command::Subscribe {
                channel: channel.clone(),
                handlers,
                reply,
            })
            .await?;
        Ok(Subscription {
            channel,
            key,
            client: self.clone(),
            snapshot,
        })
    }

    /// Removes the subscription locally and notifies the server best-effort.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), ClientError> {
        self.request(|reply| Command::Unsubscribe {
            channel: subscription.channel.clone(),
            key: subscription.key,
            reply,
        })
        .await
    }

    /// Publishes `data` on the subscription's channel.
    ///
    /// Waits for the subscription to be confirmed first, then for the
    /// server's acknowledgement, and returns its result body.
    pub async fn publish<T>(&self, subscription: &Subscription, data: &T) -> Result<Value, ClientError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        loop {
            subscription.ready().await?;
            let outcome = self
                .request(|reply| Command::Publish {
                    channel: subscription.channel.clone(),
                    key: subscription.key,
                    data: data.clone(),
                    reply,
                })
                .await?;
            match outcome {
                Err(ClientError::NotConfirmed(_)) => continue,
                other => return other,
            }
        }
    }

    /// Sends a ping and returns the `data` field of the reply, if any.
    pub async fn ping(&self) -> Result<Option<Value>, ClientError> {
        let result = self.request(|reply| Command::Ping { reply }).await??;
        Ok(result.get("data").filter(|data| !data.is_null()).cloned())
    }

    /// Tears down the current connection.
    ///
    /// With `allow_reconnect` a reconnect is scheduled (if enabled); without
    /// it, reconnection stays disabled until the next [`Client::connect`].
    pub async fn disconnect(
        &self,
        reason: impl Into<String>,
        allow_reconnect: bool,
    ) -> Result<(), ClientError> {
        self.request(|reply| Command::Disconnect {
            reason: reason.into(),
            reconnect: allow_reconnect,
            reply,
        })
        .await
    }

    /// Disconnects without reconnecting and waits for the transport to close.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Channels currently registered, sorted.
    pub async fn channels(&self) -> Result<Vec<String>, ClientError> {
        self.request(|reply| Command::Channels { reply }).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    pub fn client_id(&self) -> Option<String> {
        self.state.borrow().client_id.clone()
    }

    /// Receiver that observes every connection state transition.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the client reaches `status`.
    pub async fn wait_for_status(&self, status: ConnectionStatus) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        state
            .wait_for(|state| state.status == status)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ClientStopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| ClientError::ClientStopped)?;
        reply_rx.await.map_err(|_| ClientError::ClientStopped)
    }
}

/// Handle to one channel subscription.
#[derive(Clone, Debug)]
pub struct Subscription {
    channel: String,
    key: u64,
    client: Client,
    snapshot: watch::Receiver<SubscriptionSnapshot>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> SubscriptionState {
        self.snapshot.borrow().state.clone()
    }

    /// `uid` of the last publication delivered on this channel.
    pub fn last_message_id(&self) -> Option<String> {
        self.snapshot.borrow().last_message_id.clone()
    }

    /// Waits until the server confirms or rejects the subscription.
    pub async fn ready(&self) -> Result<(), ClientError> {
        let mut snapshot = self.snapshot.clone();
        let state = match snapshot
            .wait_for(|snapshot| snapshot.state != SubscriptionState::Pending)
            .await
        {
            Ok(snapshot) => snapshot.state.clone(),
            Err(_) => SubscriptionState::Unsubscribed,
        };

        match state {
            SubscriptionState::Confirmed => Ok(()),
            SubscriptionState::Failed(error) => Err(ClientError::Subscription(error)),
            SubscriptionState::Pending | SubscriptionState::Unsubscribed => {
                Err(ClientError::Unsubscribed(self.channel.clone()))
            }
        }
    }

    /// See [`Client::publish`].
    pub async fn publish<T>(&self, data: &T) -> Result<Value, ClientError>
    where
        T: Serialize + ?Sized,
    {
        self.client.publish(self, data).await
    }

    /// See [`Client::unsubscribe`].
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        self.client.unsubscribe(self).await
    }

    /// Requests the subscription again after the server rejected it.
    ///
    /// Returns `false` when there was nothing to retry.
    pub async fn resubscribe(&self) -> Result<bool, ClientError> {
        self.client
            .request(|reply| Command::Resubscribe {
                channel: self.channel.clone(),
                key: self.key,
                reply,
            })
            .await
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), ClientError> {
    if endpoint.trim().is_empty() {
        return Err(ClientError::InvalidOptions(
            "endpoint must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_options(options: &ClientOptions) -> Result<(), ClientError> {
    if options.ping && options.ping_interval.is_zero() {
        return Err(ClientError::InvalidOptions(
            "ping_interval must be > 0 when ping is enabled".to_string(),
        ));
    }
    if options.ping && options.pong_timeout.is_zero() {
        return Err(ClientError::InvalidOptions(
            "pong_timeout must be > 0 when ping is enabled".to_string(),
        ));
    }
    validate_backoff(&options.backoff)
}

fn validate_backoff(backoff: &BackoffPolicy) -> Result<(), ClientError> {
    if backoff.base.is_zero() {
        return Err(ClientError::InvalidOptions(
            "backoff.base must be > 0".to_string(),
        ));
    }
    if backoff.max < backoff.base {
        return Err(ClientError::InvalidOptions(
            "backoff.max must be >= backoff.base".to_string(),
        ));
    }
    if !backoff.factor.is_finite() || backoff.factor < 1.0 {
        return Err(ClientError::InvalidOptions(
            "backoff.factor must be a finite number >= 1".to_string(),
        ));
    }
    if !backoff.jitter_fraction.is_finite() || backoff.jitter_fraction < 0.0 {
        return Err(ClientError::InvalidOptions(
            "backoff.jitter_fraction must be a finite number >= 0".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;

    use crate::retry::{Backoff, BackoffPolicy};

    use super::{validate_options, Client, ClientDefaults, ClientError, ClientOptions};

    fn token() -> SecretString {
        SecretString::new("test-token".to_string())
    }

    #[test]
    fn default_options_match_documented_defaults() {
        let options = ClientOptions::default();
        assert!(options.reconnect);
        assert!(options.ping);
        assert_eq!(options.ping_interval, ClientDefaults::PING_INTERVAL);
        assert_eq!(options.pong_timeout, ClientDefaults::PONG_TIMEOUT);
        assert_eq!(options.backoff.base, Duration::from_secs(1));
        assert_eq!(options.backoff.factor, 2.0);
        assert_eq!(options.backoff.max, Duration::from_secs(60));
        assert_eq!(options.backoff.jitter_fraction, 0.5);
        assert!(options.call_timeout.is_none());
        assert!(validate_options(&options).is_ok());
    }

    #[test]
    fn validation_rejects_zero_ping_interval_only_when_ping_enabled() {
        let mut options = ClientOptions {
            ping_interval: Duration::ZERO,
            ..ClientOptions::default()
        };
        assert!(validate_options(&options).is_err());
        options.ping = false;
        assert!(validate_options(&options).is_ok());
    }

    #[test]
    fn validation_rejects_inverted_backoff_bounds() {
        let mut options = ClientOptions::default();
        options.backoff.max = Duration::from_millis(10);
        assert!(matches!(
            validate_options(&options),
            Err(ClientError::InvalidOptions(_))
        ));
    }

    #[test]
    fn validation_rejects_negative_jitter() {
        let mut options = ClientOptions::default();
        options.backoff.jitter_fraction = -0.1;
        assert!(validate_options(&options).is_err());
        options.backoff.jitter_fraction = f64::NAN;
        assert!(validate_options(&options).is_err());
    }

    #[test]
    fn validation_rejects_shrinking_or_non_finite_factor() {
        let mut options = ClientOptions::default();
        options.backoff.factor = 0.5;
        assert!(validate_options(&options).is_err());
        options.backoff.factor = f64::INFINITY;
        assert!(validate_options(&options).is_err());
        options.backoff.factor = 1.5;
        assert!(validate_options(&options).is_ok());
    }

    #[test]
    fn accepted_extreme_backoff_never_panics() {
        let options = ClientOptions {
            ping_interval: Duration::MAX,
            pong_timeout: Duration::MAX,
            backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                factor: 2.0,
                max: Duration::MAX,
                jitter_fraction: 1e30,
            },
            ..ClientOptions::default()
        };
        validate_options(&options).expect("extreme but finite options are valid");

        let mut backoff = Backoff::new(options.backoff);
        for _ in 0..100 {
            assert!(backoff.next_delay() >= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn builder_trims_endpoint_and_rejects_empty() {
        assert!(matches!(
            Client::builder("   \n", token()).build(),
            Err(ClientError::InvalidOptions(_))
        ));

        let builder = Client::builder("wss://pubsub.example/connection  \n", token());
        assert_eq!(builder.endpoint, "wss://pubsub.example/connection");
    }

    #[tokio::test]
    async fn new_client_starts_disconnected() {
        let client = Client::builder("ws://127.0.0.1:1/connection", token())
            .build()
            .expect("build");
        assert_eq!(client.status(), super::ConnectionStatus::Disconnected);
        assert_eq!(client.client_id(), None);
        assert!(client.channels().await.expect("channels").is_empty());
    }
}
