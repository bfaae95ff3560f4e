//! Inbound frame routing.
//!
//! Replies carrying an id complete the call registered under it; frames
//! without one are server pushes.

use tracing::{debug, info, warn};

use super::ConnectionActor;
use crate::stream::calls::{CallKind, PendingCall};
use crate::stream::client::{ClientError, SubscriptionError};
use crate::stream::proto::{
    decode_frame, ConnectResult, DisconnectDirective, Publication, PushKind, Reply,
    SubscribeResult,
};

impl ConnectionActor {
    pub(super) fn handle_frame(&mut self, text: &str) {
        let replies = match decode_frame(text) {
            Ok(replies) => replies,
            Err(err) => {
                warn!(event = "frame_dropped", error = %err, frame_len = text.len());
                return;
            }
        };
        self.keepalive.touch();

        let generation = self.generation;
        for reply in replies {
            // A disconnect push tears the connection down mid-batch.
            if self.generation != generation {
                debug!(event = "batch_remainder_dropped", generation);
                return;
            }
            self.route(reply);
        }
    }

    fn route(&mut self, reply: Reply) {
        let Some(id) = reply.correlation_id() else {
            self.handle_push(reply);
            return;
        };
        let Some(call) = self.calls.take(id) else {
            debug!(event = "uncorrelated_reply_dropped", id);
            return;
        };

        let kind = call.kind.clone();
        match kind {
            CallKind::Connect => {
                drop(call);
                self.handle_connect_reply(reply);
            }
            CallKind::Subscribe { channel, key } => {
                drop(call);
                self.handle_subscribe_reply(channel, key, reply);
            }
            CallKind::Publish { channel, key } => {
                self.handle_publish_reply(call, channel, key, reply)
            }
            CallKind::Ping { .. } => call.resolve(reply.into_outcome().map_err(ClientError::Call)),
        }
    }

    fn handle_connect_reply(&mut self, reply: Reply) {
        match reply.into_outcome() {
            Ok(result) => match serde_json::from_value::<ConnectResult>(result) {
                Ok(connected) => self.on_connected(connected.client),
                Err(err) => self.connect_failed(ClientError::Protocol(format!(
                    "invalid connect result: {err}"
                ))),
            },
            Err(server_error) => self.connect_failed(ClientError::Call(server_error)),
        }
    }

    fn handle_subscribe_reply(&mut self, channel: String, key: u64, reply: Reply) {
        let advice = reply.advice.clone();
        let outcome = reply.into_outcome();
        let Some(entry) = self.subscriptions.get_mut(&channel, key) else {
            debug!(event = "subscribe_reply_for_removed_entry", channel = %channel);
            return;
        };

        match outcome {
            Ok(result) => {
                let messages = match serde_json::from_value::<SubscribeResult>(result) {
                    Ok(subscribed) => subscribed.messages,
                    Err(err) => {
                        warn!(event = "subscribe_result_malformed", channel = %channel, error = %err);
                        Vec::new()
                    }
                };
                info!(event = "subscribed", channel = %channel, buffered = messages.len());
                entry.confirm(messages);
            }
            Err(error) => {
                warn!(event = "subscribe_rejected", channel = %channel, error = %error);
                entry.fail(SubscriptionError {
                    channel,
                    error,
                    advice,
                });
            }
        }
    }

    fn handle_publish_reply(&mut self, call: PendingCall, channel: String, key: u64, reply: Reply) {
        let advice = reply.advice.clone();
        match reply.into_outcome() {
            Ok(result) => call.resolve(Ok(result)),
            Err(error) => {
                warn!(event = "publish_rejected", channel = %channel, error = %error);
                let rejection = SubscriptionError {
                    channel,
                    error,
                    advice,
                };
                if let Some(entry) = self.subscriptions.get_mut(&rejection.channel, key) {
                    entry.report_error(rejection.clone());
                }
                call.resolve(Err(ClientError::Subscription(rejection)));
            }
        }
    }

    fn handle_push(&mut self, reply: Reply) {
        match reply.push_kind() {
            PushKind::Publication => {
                let Some(body) = reply.result.or(reply.params) else {
                    debug!(event = "empty_push_dropped");
                    return;
                };
                let publication = match serde_json::from_value::<Publication>(body) {
                    Ok(publication) => publication,
                    Err(err) => {
                        warn!(event = "publication_malformed", error = %err);
                        return;
                    }
                };
                match self.subscriptions.by_channel(&publication.channel) {
                    Some(entry) => entry.deliver(publication),
                    None => {
                        debug!(event = "publication_for_unknown_channel", channel = %publication.channel)
                    }
                }
            }
            PushKind::Disconnect => {
                let directive = reply
                    .body()
                    .cloned()
                    .map(serde_json::from_value::<DisconnectDirective>)
                    .transpose()
                    .unwrap_or_else(|err| {
                        warn!(event = "disconnect_push_malformed", error = %err);
                        None
                    })
                    .unwrap_or_default();
                info!(
                    event = "server_disconnect",
                    reason = %directive.reason,
                    reconnect = directive.reconnect
                );
                self.disconnect(directive.reason, directive.reconnect);
            }
            PushKind::Unknown(method) => debug!(event = "unknown_push_dropped", method = %method),
        }
    }
}
