//! Correlation table for in-flight RPCs.
//!
//! Every outbound request gets a fresh id from [`CorrelationTable::next_id`].
//! Requests that expect a reply are registered together with what they were
//! ([`CallKind`]) so the dispatcher can route the reply without string
//! lookups. An entry leaves the table exactly once: on its reply, on its
//! deadline, or when the connection drops.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::stream::client::ClientError;
use crate::stream::connection::Internal;

/// Completion channel of a caller-issued call.
pub(crate) type CallReply = oneshot::Sender<Result<Value, ClientError>>;

/// What an in-flight request was, recorded when it was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallKind {
    Connect,
    Subscribe { channel: String, key: u64 },
    Publish { channel: String, key: u64 },
    Ping { keepalive: bool },
}

#[derive(Debug)]
pub(crate) struct PendingCall {
    pub(crate) kind: CallKind,
    reply: Option<CallReply>,
    deadline: Option<JoinHandle<()>>,
}

impl PendingCall {
    /// Resolves the caller's completion, if the call has one.
    pub(crate) fn resolve(mut self, outcome: Result<Value, ClientError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}

#[derive(Debug)]
pub(crate) struct CorrelationTable {
    next_id: u64,
    pending: HashMap<u64, PendingCall>,
    timeouts: mpsc::UnboundedSender<Internal>,
}

impl CorrelationTable {
    pub(crate) fn new(timeouts: mpsc::UnboundedSender<Internal>) -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
            timeouts,
        }
    }

    /// Allocates a request id; ids are never reused for the client's lifetime.
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Registers an in-flight call under `id`.
    ///
    /// With a `deadline`, a timer posts [`Internal::CallTimedOut`] when it
    /// elapses.
    pub(crate) fn register(
        &mut self,
        id: u64,
        kind: CallKind,
        reply: Option<CallReply>,
        deadline: Option<Duration>,
    ) {
        let deadline = deadline.map(|after| {
            let timeouts = self.timeouts.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = timeouts.send(Internal::CallTimedOut { id });
            })
        });

        let previous = self.pending.insert(
            id,
            PendingCall {
                kind,
                reply,
                deadline,
            },
        );
        debug_assert!(previous.is_none(), "request id {id} registered twice");
    }

    /// Removes the call registered under `id`, cancelling its deadline.
    pub(crate) fn take(&mut self, id: u64) -> Option<PendingCall> {
        self.pending.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Removes every pending call, rejecting each with a connection-closed
    /// error. Returns the kinds that were cancelled.
    pub(crate) fn cancel_all(&mut self) -> Vec<CallKind> {
        self.pending
            .drain()
            .map(|(_, call)| {
                let kind = call.kind.clone();
                call.resolve(Err(ClientError::ConnectionClosed));
                kind
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};

    use super::{CallKind, CorrelationTable};
    use crate::stream::client::ClientError;
    use crate::stream::connection::Internal;

    #[test]
    fn ids_are_strictly_increasing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut table = CorrelationTable::new(tx);
        let ids: Vec<u64> = (0..5).map(|_| table.next_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn take_resolves_exactly_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut table = CorrelationTable::new(tx);
        let id = table.next_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        table.register(id, CallKind::Ping { keepalive: false }, Some(reply_tx), None);
        assert_eq!(table.len(), 1);

        let call = table.take(id).expect("registered");
        assert_eq!(call.kind, CallKind::Ping { keepalive: false });
        call.resolve(Ok(json!({"data": 1})));
        assert!(table.take(id).is_none());
        assert_eq!(reply_rx.await.expect("resolved").expect("ok"), json!({"data": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_posts_timeout_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut table = CorrelationTable::new(tx);
        let id = table.next_id();
        table.register(id, CallKind::Connect, None, Some(Duration::from_secs(2)));

        match rx.recv().await {
            Some(Internal::CallTimedOut { id: timed_out }) => assert_eq!(timed_out, id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn taking_a_call_cancels_its_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut table = CorrelationTable::new(tx);
        let id = table.next_id();
        table.register(id, CallKind::Connect, None, Some(Duration::from_secs(2)));
        drop(table.take(id));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_all_rejects_every_pending_call() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut table = CorrelationTable::new(tx);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let id = table.next_id();
            let (reply_tx, reply_rx) = oneshot::channel();
            table.register(
                id,
                CallKind::Publish {
                    channel: "news".to_string(),
                    key: 1,
                },
                Some(reply_tx),
                None,
            );
            receivers.push(reply_rx);
        }

        let cancelled = table.cancel_all();
        assert_eq!(cancelled.len(), 3);
        assert_eq!(table.len(), 0);
        for reply_rx in receivers {
            assert!(matches!(
                reply_rx.await.expect("resolved"),
                Err(ClientError::ConnectionClosed)
            ));
        }
    }
}
