//! Client SDK for a realtime publish/subscribe service spoken over a
//! websocket-style JSON RPC protocol.
//!
//! The crate is organized by concern:
//! - `stream`: client handle, connection state machine, protocol and
//!   transports.
//! - `retry`: backoff and timeout utilities.
//!
//! ```no_run
//! use realtime_pubsub_sdk::{Client, SubscriptionHandlers};
//! use secrecy::SecretString;
//!
//! # async fn run() -> Result<(), realtime_pubsub_sdk::ClientError> {
//! let client = Client::builder("wss://pubsub.example/connection", SecretString::new("token".into()))
//!     .build()?;
//! client.connect().await?;
//!
//! let news = client
//!     .subscribe(
//!         "news",
//!         SubscriptionHandlers::new().on_message(|publication| async move {
//!             println!("{}: {}", publication.channel, publication.data);
//!         }),
//!     )
//!     .await?;
//! news.publish(&serde_json::json!({"text": "hello"})).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

/// Retry and timeout helpers.
pub mod retry;
/// Realtime client, protocol types and transports.
pub mod stream;

pub use retry::{Backoff, BackoffPolicy};
pub use stream::client::{
    Client, ClientBuilder, ClientDefaults, ClientError, ClientOptions, ConnectInfo,
    ConnectionState, ConnectionStatus, Subscription, SubscriptionError,
};
pub use stream::handlers::{
    ClientHandlers, ConnectContext, DisconnectContext, ErrorContext, SubscribeContext,
    SubscriptionHandlers, UnsubscribeContext,
};
pub use stream::proto::{Publication, ServerError};
pub use stream::registry::{SubscriptionSnapshot, SubscriptionState};
pub use stream::transport::{
    CloseInfo, Connector, TransportCommand, TransportError, TransportEvent, TransportHandle,
    TransportPeer, WebSocketConnector,
};
