//! Handler capability sets and their delivery tasks.
//!
//! Handlers never run on the dispatcher. Each subscription (and the client
//! itself) owns a [`DeliveryQueue`]: a task that awaits handler futures one at
//! a time, so events for one subscription stay ordered while a slow handler
//! only delays its own subscription.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::stream::client::SubscriptionError;
use crate::stream::proto::{Publication, ServerError};

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, ()>;

type Callback<T> = Arc<dyn Fn(T) -> HandlerFuture + Send + Sync>;

fn callback<T, F, Fut>(handler: F) -> Callback<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |arg| Box::pin(handler(arg)))
}

/// Passed to `on_subscribe` once the server confirmed a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeContext {
    pub channel: String,
}

/// Passed to `on_unsubscribe`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsubscribeContext {
    pub channel: String,
}

/// Passed to `on_connect`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectContext {
    pub client_id: Option<String>,
}

/// Passed to `on_disconnect`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisconnectContext {
    pub reason: String,
    pub reconnect: bool,
}

/// Passed to the client-level `on_error` when a connect attempt fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorContext {
    pub message: String,
    /// Error object sent by the server, when it rejected the connect.
    pub server_error: Option<ServerError>,
}

/// Callbacks attached to one channel subscription. Every callback is optional.
#[derive(Clone, Default)]
pub struct SubscriptionHandlers {
    on_message: Option<Callback<Publication>>,
    on_subscribe: Option<Callback<SubscribeContext>>,
    on_unsubscribe: Option<Callback<UnsubscribeContext>>,
    on_error: Option<Callback<SubscriptionError>>,
}

impl SubscriptionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every publication delivered to the channel.
    pub fn on_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Publication) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_message = Some(callback(handler));
        self
    }

    /// Called when the server confirms the subscription, after every
    /// (re)connect.
    pub fn on_subscribe<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(SubscribeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_subscribe = Some(callback(handler));
        self
    }

    /// Called when the subscription stops being active, either explicitly or
    /// because the connection dropped.
    ///
    /// On a dropped connection it fires only for subscriptions the server had
    /// confirmed. Entries still waiting on (or rejected by) a subscribe reply
    /// were never active, so they go back to pending silently and are
    /// requested again on reconnect. An explicit unsubscribe always fires it.
    pub fn on_unsubscribe<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(UnsubscribeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_unsubscribe = Some(callback(handler));
        self
    }

    /// Called when the server rejects a subscribe or publish on the channel.
    pub fn on_error<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(SubscriptionError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(callback(handler));
        self
    }
}

impl fmt::Debug for SubscriptionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandlers")
            .field("on_message", &self.on_message.is_some())
            .field("on_subscribe", &self.on_subscribe.is_some())
            .field("on_unsubscribe", &self.on_unsubscribe.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Client lifecycle callbacks.
#[derive(Clone, Default)]
pub struct ClientHandlers {
    on_connect: Option<Callback<ConnectContext>>,
    on_disconnect: Option<Callback<DisconnectContext>>,
    on_error: Option<Callback<ErrorContext>>,
}

impl ClientHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connect = Some(callback(handler));
        self
    }

    pub fn on_disconnect<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(DisconnectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_disconnect = Some(callback(handler));
        self
    }

    pub fn on_error<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ErrorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(callback(handler));
        self
    }
}

impl fmt::Debug for ClientHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Events routed to [`SubscriptionHandlers`].
#[derive(Clone, Debug)]
pub(crate) enum SubscriptionEvent {
    Message(Publication),
    Subscribed(SubscribeContext),
    Unsubscribed(UnsubscribeContext),
    Error(SubscriptionError),
}

/// Events routed to [`ClientHandlers`].
#[derive(Clone, Debug)]
pub(crate) enum ClientEvent {
    Connected(ConnectContext),
    Disconnected(DisconnectContext),
    Error(ErrorContext),
}

/// A handler set able to turn an event into a handler invocation.
pub(crate) trait Invoke<E>: Send + Sync + 'static {
    fn invoke(&self, event: E) -> Option<HandlerFuture>;
}

impl Invoke<SubscriptionEvent> for SubscriptionHandlers {
    fn invoke(&self, event: SubscriptionEvent) -> Option<HandlerFuture> {
        match event {
            SubscriptionEvent::Message(publication) => {
                self.on_message.as_ref().map(|handler| handler(publication))
            }
            SubscriptionEvent::Subscribed(ctx) => {
                self.on_subscribe.as_ref().map(|handler| handler(ctx))
            }
            SubscriptionEvent::Unsubscribed(ctx) => {
                self.on_unsubscribe.as_ref().map(|handler| handler(ctx))
            }
            SubscriptionEvent::Error(error) => self.on_error.as_ref().map(|handler| handler(error)),
        }
    }
}

impl Invoke<ClientEvent> for ClientHandlers {
    fn invoke(&self, event: ClientEvent) -> Option<HandlerFuture> {
        match event {
            ClientEvent::Connected(ctx) => self.on_connect.as_ref().map(|handler| handler(ctx)),
            ClientEvent::Disconnected(ctx) => {
                self.on_disconnect.as_ref().map(|handler| handler(ctx))
            }
            ClientEvent::Error(ctx) => self.on_error.as_ref().map(|handler| handler(ctx)),
        }
    }
}

/// Ordered handler execution on a dedicated task.
///
/// Each event is paired with the handler set current at dispatch time, so a
/// replaced handler set takes effect for every later event.
pub(crate) struct DeliveryQueue<H, E> {
    tx: mpsc::UnboundedSender<(Arc<H>, E)>,
}

impl<H, E> DeliveryQueue<H, E>
where
    H: Invoke<E>,
    E: Send + 'static,
{
    /// Spawns the delivery task. It ends once the queue is dropped and drained.
    pub(crate) fn spawn(label: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Arc<H>, E)>();
        tokio::spawn(async move {
            while let Some((handlers, event)) = rx.recv().await {
                let Some(invocation) = handlers.invoke(event) else {
                    continue;
                };
                if AssertUnwindSafe(invocation).catch_unwind().await.is_err() {
                    warn!(event = "handler_panicked", queue = %label);
                }
            }
        });
        Self { tx }
    }

    pub(crate) fn deliver(&self, handlers: &Arc<H>, event: E) {
        let _ = self.tx.send((Arc::clone(handlers), event));
    }
}

impl<H, E> fmt::Debug for DeliveryQueue<H, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn events_reach_matching_callbacks_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handlers = Arc::new(
            SubscriptionHandlers::new()
                .on_subscribe({
                    let tx = tx.clone();
                    move |ctx| {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send(format!("subscribed:{}", ctx.channel));
                        }
                    }
                })
                .on_message({
                    let tx = tx.clone();
                    move |publication| {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send(format!("message:{}", publication.data));
                        }
                    }
                }),
        );

        let queue = DeliveryQueue::spawn("news".to_string());
        queue.deliver(
            &handlers,
            SubscriptionEvent::Subscribed(SubscribeContext {
                channel: "news".to_string(),
            }),
        );
        for n in 0..3 {
            queue.deliver(
                &handlers,
                SubscriptionEvent::Message(Publication {
                    channel: "news".to_string(),
                    data: serde_json::json!(n),
                    ..Publication::default()
                }),
            );
        }
        // No on_unsubscribe handler: skipped without stalling the queue.
        queue.deliver(
            &handlers,
            SubscriptionEvent::Unsubscribed(UnsubscribeContext {
                channel: "news".to_string(),
            }),
        );

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.expect("event"));
        }
        assert_eq!(
            seen,
            vec!["subscribed:news", "message:0", "message:1", "message:2"]
        );
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handlers = Arc::new(ClientHandlers::new().on_disconnect(move |ctx| {
            let tx = tx.clone();
            async move {
                if ctx.reason == "boom" {
                    panic!("handler failure");
                }
                let _ = tx.send(ctx.reason);
            }
        }));

        let queue = DeliveryQueue::spawn("client".to_string());
        for reason in ["boom", "after"] {
            queue.deliver(
                &handlers,
                ClientEvent::Disconnected(DisconnectContext {
                    reason: reason.to_string(),
                    reconnect: true,
                }),
            );
        }

        let reason = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery continues")
            .expect("event");
        assert_eq!(reason, "after");
    }
}
