//! Subscription relays.
//!
//! A relay owns one upstream [`RawSubscription`], decodes each notification
//! and forwards it to a caller-supplied bounded channel in upstream order.
//! The caller keeps a [`Subscription`] handle to cancel the relay, observe
//! its termination error and await its exit.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chainclient_core::{RawSubscription, TransportError, DEFAULT_QUERY_TIMEOUT};

use crate::types::{Head, Log};

// ─── Handle ───────────────────────────────────────────────────────────────────

/// Handle of a running relay.
///
/// Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    cancel: CancellationToken,
    errors: mpsc::Receiver<TransportError>,
    task: Option<JoinHandle<()>>,
}

/// A relay of new heads.
pub type HeadSubscription = Subscription;

impl Subscription {
    /// Stop the relay. The upstream subscription is cancelled exactly once,
    /// however many times this is called.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// Yields the error that ended the relay, if it ended on its own
    /// (connection dropped, undecodable payload). Closes without a value
    /// after an `unsubscribe`.
    pub fn err(&mut self) -> &mut mpsc::Receiver<TransportError> {
        &mut self.errors
    }

    /// Returns `true` while the relay task is running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wait for the relay to exit, including the upstream unsubscribe, which
    /// is bounded by the forwarder's unsubscribe timeout.
    ///
    /// Without a prior [`unsubscribe`](Self::unsubscribe) this waits until
    /// the upstream ends.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "subscription relay panicked");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─── Forwarders ───────────────────────────────────────────────────────────────

/// Relays `newHeads` notifications, stamping each head with the local chain id.
#[derive(Debug)]
pub struct HeadForwarder {
    chain_id: u64,
    dest: mpsc::Sender<Head>,
    unsubscribe_timeout: Duration,
}

impl HeadForwarder {
    pub fn new(chain_id: u64, dest: mpsc::Sender<Head>) -> Self {
        Self {
            chain_id,
            dest,
            unsubscribe_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Bound on the upstream unsubscribe the relay sends on its way out.
    pub fn with_unsubscribe_timeout(mut self, timeout: Duration) -> Self {
        self.unsubscribe_timeout = timeout;
        self
    }

    /// Spawn the relay. Cancelling `cancel` stops it like
    /// [`Subscription::unsubscribe`].
    pub fn start(self, upstream: RawSubscription, cancel: CancellationToken) -> HeadSubscription {
        let chain_id = self.chain_id;
        spawn_relay(upstream, self.dest, cancel, self.unsubscribe_timeout, move |value| {
            let mut head: Head = serde_json::from_value(value)?;
            head.chain_id = Some(chain_id);
            Ok(head)
        })
    }
}

/// Relays `logs` notifications as-is.
#[derive(Debug)]
pub struct LogForwarder {
    dest: mpsc::Sender<Log>,
    unsubscribe_timeout: Duration,
}

impl LogForwarder {
    pub fn new(dest: mpsc::Sender<Log>) -> Self {
        Self {
            dest,
            unsubscribe_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_unsubscribe_timeout(mut self, timeout: Duration) -> Self {
        self.unsubscribe_timeout = timeout;
        self
    }

    pub fn start(self, upstream: RawSubscription, cancel: CancellationToken) -> Subscription {
        spawn_relay(upstream, self.dest, cancel, self.unsubscribe_timeout, decode::<Log>)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, TransportError> {
    Ok(serde_json::from_value(value)?)
}

fn spawn_relay<T, F>(
    upstream: RawSubscription,
    dest: mpsc::Sender<T>,
    cancel: CancellationToken,
    unsubscribe_timeout: Duration,
    decode: F,
) -> Subscription
where
    T: Send + 'static,
    F: Fn(Value) -> Result<T, TransportError> + Send + 'static,
{
    let cancel = cancel.child_token();
    let (err_tx, errors) = mpsc::channel(1);
    let task = tokio::spawn(relay(
        upstream,
        dest,
        cancel.clone(),
        err_tx,
        unsubscribe_timeout,
        decode,
    ));
    Subscription {
        cancel,
        errors,
        task: Some(task),
    }
}

async fn relay<T, F>(
    mut upstream: RawSubscription,
    dest: mpsc::Sender<T>,
    cancel: CancellationToken,
    errors: mpsc::Sender<TransportError>,
    unsubscribe_timeout: Duration,
    decode: F,
) where
    F: Fn(Value) -> Result<T, TransportError>,
{
    let failure = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            next = upstream.notifications.recv() => next,
        };
        let Some(value) = next else {
            break Some(TransportError::NotConnected {
                url: upstream.url().to_string(),
            });
        };
        let item = match decode(value) {
            Ok(item) => item,
            Err(e) => break Some(e),
        };
        // a full destination blocks the relay; nothing is dropped
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            sent = dest.send(item) => {
                if sent.is_err() {
                    tracing::debug!(id = %upstream.id, "subscriber gone, stopping relay");
                    break None;
                }
            }
        }
    };

    if let Some(err) = failure {
        tracing::warn!(id = %upstream.id, url = %upstream.url(), error = %err, "subscription ended");
        let _ = errors.try_send(err);
    }
    let id = upstream.id.clone();
    match tokio::time::timeout(unsubscribe_timeout, upstream.unsubscribe()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(%id, error = %e, "upstream unsubscribe failed"),
        Err(_) => tracing::warn!(
            %id,
            timeout_ms = unsubscribe_timeout.as_millis() as u64,
            "upstream unsubscribe timed out, abandoning it"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chainclient_core::{JsonRpcRequest, JsonRpcResponse, RpcTransport, SubscriptionId};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Upstream {
        unsubscribes: AtomicUsize,
        // never answer eth_unsubscribe, like a half-open socket
        stalled: bool,
    }

    #[async_trait]
    impl RpcTransport for Upstream {
        async fn send(&self, _req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            Err(TransportError::Other("unused".into()))
        }
        async fn unsubscribe(&self, _id: &SubscriptionId) -> Result<(), TransportError> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            if self.stalled {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
        fn url(&self) -> &str {
            "mock://upstream"
        }
    }

    fn head_json(n: u64) -> Value {
        json!({
            "number": format!("{n:#x}"),
            "hash": format!("0x{:064x}", n),
            "parentHash": format!("0x{:064x}", n.saturating_sub(1)),
            "timestamp": "0x1",
        })
    }

    fn upstream() -> (Arc<Upstream>, mpsc::UnboundedSender<Value>, RawSubscription) {
        upstream_with(Upstream::default())
    }

    fn upstream_with(
        transport: Upstream,
    ) -> (Arc<Upstream>, mpsc::UnboundedSender<Value>, RawSubscription) {
        let transport = Arc::new(transport);
        let (tx, rx) = mpsc::unbounded_channel();
        let raw = RawSubscription::new(
            SubscriptionId("0xsub".into()),
            rx,
            Arc::clone(&transport) as Arc<dyn RpcTransport>,
        );
        (transport, tx, raw)
    }

    #[tokio::test]
    async fn forwards_in_order_with_local_chain_id() {
        let (_t, tx, raw) = upstream();
        let (dest, mut heads) = mpsc::channel(1);
        let _sub = HeadForwarder::new(42, dest).start(raw, CancellationToken::new());

        for n in 1..=5 {
            tx.send(head_json(n)).unwrap();
        }
        for n in 1..=5 {
            let head = heads.recv().await.unwrap();
            assert_eq!(head.number, n);
            assert_eq!(head.chain_id, Some(42));
        }
    }

    #[tokio::test]
    async fn double_unsubscribe_cancels_upstream_once() {
        let (transport, tx, raw) = upstream();
        let (dest, mut heads) = mpsc::channel(4);
        let sub = HeadForwarder::new(1, dest).start(raw, CancellationToken::new());

        tx.send(head_json(1)).unwrap();
        assert_eq!(heads.recv().await.unwrap().number, 1);

        sub.unsubscribe();
        sub.unsubscribe();
        sub.join().await;
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);

        let _ = tx.send(head_json(2));
        assert!(heads.recv().await.is_none());
    }

    #[tokio::test]
    async fn upstream_close_is_reported() {
        let (transport, tx, raw) = upstream();
        let (dest, _heads) = mpsc::channel(4);
        let mut sub = HeadForwarder::new(1, dest).start(raw, CancellationToken::new());

        drop(tx);
        let err = sub.err().recv().await.unwrap();
        assert!(matches!(err, TransportError::NotConnected { .. }));
        sub.join().await;
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_payload_ends_relay() {
        let (_t, tx, raw) = upstream();
        let (dest, _heads) = mpsc::channel(4);
        let mut sub = HeadForwarder::new(1, dest).start(raw, CancellationToken::new());

        tx.send(json!({"number": "nope"})).unwrap();
        let err = sub.err().recv().await.unwrap();
        assert!(matches!(err, TransportError::Deserialization(_)));
    }

    #[tokio::test]
    async fn caller_token_stops_a_blocked_relay() {
        let (transport, tx, raw) = upstream();
        let (dest, mut heads) = mpsc::channel(1);
        let token = CancellationToken::new();
        let mut sub = HeadForwarder::new(1, dest).start(raw, token.clone());

        // the second head blocks on the full destination
        tx.send(head_json(1)).unwrap();
        tx.send(head_json(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sub.is_active());

        token.cancel();
        assert!(sub.err().recv().await.is_none());
        sub.join().await;
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(heads.recv().await.unwrap().number, 1);
        assert!(heads.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_handle_unsubscribes() {
        let (transport, _tx, raw) = upstream();
        let (dest, mut heads) = mpsc::channel(1);
        drop(HeadForwarder::new(1, dest).start(raw, CancellationToken::new()));
        assert!(heads.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_unsubscribe_does_not_hold_the_relay() {
        let (transport, _tx, raw) = upstream_with(Upstream {
            stalled: true,
            ..Default::default()
        });
        let (dest, _heads) = mpsc::channel(1);
        let sub = HeadForwarder::new(1, dest)
            .with_unsubscribe_timeout(Duration::from_millis(50))
            .start(raw, CancellationToken::new());

        sub.unsubscribe();
        tokio::time::timeout(Duration::from_secs(5), sub.join())
            .await
            .expect("relay should exit once the unsubscribe times out");
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn logs_are_relayed() {
        let (_t, tx, raw) = upstream();
        let (dest, mut logs) = mpsc::channel(1);
        let _sub = LogForwarder::new(dest).start(raw, CancellationToken::new());
        tx.send(json!({
            "address": "0x00000000000000000000000000000000000000aa",
            "topics": [],
            "data": "0x01",
            "blockNumber": "0x7"
        }))
        .unwrap();
        let log = logs.recv().await.unwrap();
        assert_eq!(log.block_number, Some(7));
    }
}
