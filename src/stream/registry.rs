//! Subscription registry.
//!
//! The registry is the client-side source of truth for desired channel
//! membership. Entries survive reconnects; only their confirmation resets.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::stream::client::SubscriptionError;
use crate::stream::handlers::{
    DeliveryQueue, SubscribeContext, SubscriptionEvent, SubscriptionHandlers, UnsubscribeContext,
};
use crate::stream::proto::Publication;

/// Confirmation state of a subscription on the current connection.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionState {
    /// Waiting for the server to acknowledge (or for a connection to exist).
    Pending,
    /// Acknowledged by the server on the current connection.
    Confirmed,
    /// Rejected by the server.
    Failed(SubscriptionError),
    /// Removed from the registry.
    Unsubscribed,
}

/// Snapshot shared with subscription handles.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionSnapshot {
    pub state: SubscriptionState,
    /// `uid` of the most recent publication delivered on the channel.
    pub last_message_id: Option<String>,
}

pub(crate) struct SubscriptionEntry {
    key: u64,
    channel: String,
    handlers: Arc<SubscriptionHandlers>,
    delivery: DeliveryQueue<SubscriptionHandlers, SubscriptionEvent>,
    snapshot: watch::Sender<SubscriptionSnapshot>,
}

impl SubscriptionEntry {
    pub(crate) fn state(&self) -> SubscriptionState {
        self.snapshot.borrow().state.clone()
    }

    pub(crate) fn is_confirmed(&self) -> bool {
        matches!(self.snapshot.borrow().state, SubscriptionState::Confirmed)
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SubscriptionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Marks the subscription confirmed, fires `on_subscribe`, then flushes
    /// messages the server attached to its acknowledgement.
    pub(crate) fn confirm(&mut self, messages: Vec<Publication>) {
        self.snapshot
            .send_modify(|snapshot| snapshot.state = SubscriptionState::Confirmed);
        self.delivery.deliver(
            &self.handlers,
            SubscriptionEvent::Subscribed(SubscribeContext {
                channel: self.channel.clone(),
            }),
        );
        for mut publication in messages {
            if publication.channel.is_empty() {
                publication.channel = self.channel.clone();
            }
            self.deliver(publication);
        }
    }

    /// Rejects the pending confirmation and fires `on_error`.
    pub(crate) fn fail(&mut self, error: SubscriptionError) {
        self.snapshot
            .send_modify(|snapshot| snapshot.state = SubscriptionState::Failed(error.clone()));
        self.report_error(error);
    }

    /// Fires `on_error` without touching the confirmation state.
    pub(crate) fn report_error(&self, error: SubscriptionError) {
        self.delivery
            .deliver(&self.handlers, SubscriptionEvent::Error(error));
    }

    /// Routes a publication to `on_message`.
    pub(crate) fn deliver(&mut self, publication: Publication) {
        if let Some(uid) = publication.uid.clone() {
            self.snapshot
                .send_modify(|snapshot| snapshot.last_message_id = Some(uid));
        }
        self.delivery
            .deliver(&self.handlers, SubscriptionEvent::Message(publication));
    }

    /// Resets confirmation after a disconnect; returns whether it had been
    /// confirmed, in which case `on_unsubscribe` fired.
    fn reset(&mut self) -> bool {
        let was_confirmed = self.is_confirmed();
        if matches!(
            self.snapshot.borrow().state,
            SubscriptionState::Confirmed | SubscriptionState::Failed(_)
        ) {
            self.snapshot
                .send_modify(|snapshot| snapshot.state = SubscriptionState::Pending);
        }
        if was_confirmed {
            self.notify_unsubscribed();
        }
        was_confirmed
    }

    fn notify_unsubscribed(&self) {
        self.delivery.deliver(
            &self.handlers,
            SubscriptionEvent::Unsubscribed(UnsubscribeContext {
                channel: self.channel.clone(),
            }),
        );
    }
}

/// Result of [`SubscriptionRegistry::upsert`].
pub(crate) struct Upsert {
    pub(crate) key: u64,
    pub(crate) snapshot: watch::Receiver<SubscriptionSnapshot>,
    /// Whether a subscribe request has to go out for this entry.
    pub(crate) needs_request: bool,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_key: u64,
    entries: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a subscription, or replaces the handler set of an existing one.
    ///
    /// Replacing keeps the entry (and its confirmation) so no duplicate
    /// subscribe request is needed, unless the previous attempt was rejected.
    pub(crate) fn upsert(&mut self, channel: &str, handlers: SubscriptionHandlers) -> Upsert {
        if let Some(entry) = self.entries.get_mut(channel) {
            entry.handlers = Arc::new(handlers);
            let needs_request = matches!(entry.state(), SubscriptionState::Failed(_));
            if needs_request {
                entry
                    .snapshot
                    .send_modify(|snapshot| snapshot.state = SubscriptionState::Pending);
            }
            return Upsert {
                key: entry.key,
                snapshot: entry.watch(),
                needs_request,
            };
        }

        self.next_key += 1;
        let key = self.next_key;
        let (snapshot, receiver) = watch::channel(SubscriptionSnapshot {
            state: SubscriptionState::Pending,
            last_message_id: None,
        });
        self.entries.insert(
            channel.to_string(),
            SubscriptionEntry {
                key,
                channel: channel.to_string(),
                handlers: Arc::new(handlers),
                delivery: DeliveryQueue::spawn(channel.to_string()),
                snapshot,
            },
        );
        Upsert {
            key,
            snapshot: receiver,
            needs_request: true,
        }
    }

    /// Moves a rejected entry back to pending so it can be requested again.
    pub(crate) fn retry(&mut self, channel: &str, key: u64) -> bool {
        match self.get_mut(channel, key) {
            Some(entry) if matches!(entry.state(), SubscriptionState::Failed(_)) => {
                entry
                    .snapshot
                    .send_modify(|snapshot| snapshot.state = SubscriptionState::Pending);
                true
            }
            _ => false,
        }
    }

    /// Looks up the entry for `channel`, provided it is still the entry
    /// identified by `key`.
    pub(crate) fn get_mut(&mut self, channel: &str, key: u64) -> Option<&mut SubscriptionEntry> {
        self.entries
            .get_mut(channel)
            .filter(|entry| entry.key == key)
    }

    pub(crate) fn by_channel(&mut self, channel: &str) -> Option<&mut SubscriptionEntry> {
        self.entries.get_mut(channel)
    }

    /// Removes the entry, fires `on_unsubscribe` and closes its handles.
    pub(crate) fn remove(&mut self, channel: &str, key: u64) -> bool {
        if self.get_mut(channel, key).is_none() {
            return false;
        }
        let Some(entry) = self.entries.remove(channel) else {
            return false;
        };
        entry.notify_unsubscribed();
        entry
            .snapshot
            .send_modify(|snapshot| snapshot.state = SubscriptionState::Unsubscribed);
        true
    }

    /// Resets every confirmation after a disconnect. Returns how many
    /// confirmed subscriptions were reset.
    pub(crate) fn reset_confirmations(&mut self) -> usize {
        self.entries
            .values_mut()
            .map(|entry| entry.reset())
            .filter(|was_confirmed| *was_confirmed)
            .count()
    }

    /// Entries still waiting for a server acknowledgement.
    pub(crate) fn pending(&self) -> Vec<(String, u64)> {
        self.entries
            .values()
            .filter(|entry| matches!(entry.state(), SubscriptionState::Pending))
            .map(|entry| (entry.channel.clone(), entry.key))
            .collect()
    }

    pub(crate) fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.entries.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Marks every entry unsubscribed; used when the client shuts down.
    pub(crate) fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry
                .snapshot
                .send_modify(|snapshot| snapshot.state = SubscriptionState::Unsubscribed);
        }
    }
}
