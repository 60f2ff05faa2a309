//! A single remote node: its connection, role and health state machine.
//!
//! ```text
//! Undialed ──dial──▶ Dialing ──chain id ok──▶ Alive ◀──in sync──▶ OutOfSync
//!                      │  ▲                     │                    │
//!           chain id   │  │ redial              └──probe failed──────┤
//!           mismatch   │  │                                          ▼
//!                      ▼  └──────────────────────────────────── Unreachable
//!                   Invalid
//! ```
//! Every non-terminal state may move to `Closed` when the pool shuts down.

use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::TransportError;
use crate::request::{parse_hex_u64, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{RawSubscription, RpcTransport};

/// Health state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    Undialed,
    Dialing,
    Alive,
    OutOfSync,
    Unreachable,
    /// The node serves a different chain. Terminal.
    Invalid,
    /// The pool shut down. Terminal.
    Closed,
}

impl EndpointState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invalid | Self::Closed)
    }

    /// Only `Alive` primaries serve reads.
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::Alive)
    }

    /// Returns `true` if `self → to` is a legal transition.
    pub fn can_transition_to(&self, to: EndpointState) -> bool {
        use EndpointState::*;
        match (*self, to) {
            (Undialed | Unreachable, Dialing) => true,
            (Dialing, Alive | Invalid | Unreachable) => true,
            (Alive, OutOfSync | Unreachable) => true,
            (OutOfSync, Alive | Unreachable) => true,
            (from, Closed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Undialed => "Undialed",
            Self::Dialing => "Dialing",
            Self::Alive => "Alive",
            Self::OutOfSync => "OutOfSync",
            Self::Unreachable => "Unreachable",
            Self::Invalid => "Invalid",
            Self::Closed => "Closed",
        };
        f.write_str(s)
    }
}

/// What an endpoint may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    /// Reads, writes and subscriptions.
    Primary,
    /// Transaction broadcast only.
    SendOnly,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::SendOnly => write!(f, "send-only"),
        }
    }
}

/// Run `fut`, failing with [`TransportError::Timeout`] once `timeout` elapses.
pub(crate) async fn timed<T, F>(timeout: Duration, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TransportError::Timeout {
            ms: timeout.as_millis() as u64,
        })?
}

/// State and connection shared by both endpoint roles.
pub struct EndpointCore {
    name: String,
    role: EndpointRole,
    transport: Arc<dyn RpcTransport>,
    state: Mutex<EndpointState>,
    next_id: AtomicU64,
    latest_block: AtomicU64,
    dial_failures: AtomicU32,
    next_redial: Mutex<Option<Instant>>,
}

impl EndpointCore {
    fn new(name: String, role: EndpointRole, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            name,
            role,
            transport,
            state: Mutex::new(EndpointState::Undialed),
            next_id: AtomicU64::new(1),
            latest_block: AtomicU64::new(0),
            dial_failures: AtomicU32::new(0),
            next_redial: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    pub fn role(&self) -> EndpointRole {
        self.role
    }

    pub fn state(&self) -> EndpointState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Highest block number this endpoint reported to the liveness monitor.
    pub fn latest_block(&self) -> u64 {
        self.latest_block.load(Ordering::Relaxed)
    }

    /// Apply a state transition. Illegal transitions leave the state unchanged.
    pub(crate) fn transition(&self, to: EndpointState) -> bool {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let from = *guard;
        if !from.can_transition_to(to) {
            tracing::debug!(endpoint = %self.name, %from, %to, "rejected endpoint state transition");
            return false;
        }
        *guard = to;
        tracing::debug!(endpoint = %self.name, %from, %to, "endpoint state transition");
        true
    }

    pub(crate) fn set_latest_block(&self, block: u64) {
        self.latest_block.store(block, Ordering::Relaxed);
    }

    /// Count a failed dial or probe, returning the consecutive failure count.
    pub(crate) fn record_failure(&self) -> u32 {
        self.dial_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn schedule_redial(&self, delay: Duration) {
        if let Ok(mut next) = self.next_redial.lock() {
            *next = Some(Instant::now() + delay);
        }
    }

    /// Returns `true` if the endpoint is `Unreachable` and its backoff has elapsed.
    pub(crate) fn redial_due(&self, now: Instant) -> bool {
        if self.state() != EndpointState::Unreachable {
            return false;
        }
        match self.next_redial.lock() {
            Ok(next) => next.map_or(true, |at| now >= at),
            Err(_) => true,
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let req = JsonRpcRequest::new(self.next_request_id(), method, params);
        let resp = timed(timeout, self.transport.send(req)).await?;
        resp.into_result().map_err(TransportError::Rpc)
    }

    /// Connect and verify the remote chain id.
    ///
    /// `Dialing → Alive` on success, `→ Invalid` on chain id mismatch and
    /// `→ Unreachable` on any connection failure.
    pub(crate) async fn dial(&self, chain_id: u64, timeout: Duration) -> Result<(), TransportError> {
        if !self.transition(EndpointState::Dialing) {
            return Err(TransportError::Other(format!(
                "cannot dial endpoint {} in state {}",
                self.name,
                self.state()
            )));
        }
        tracing::debug!(endpoint = %self.name, url = %self.url(), role = %self.role, "dialing endpoint");

        let verified = timed(timeout, async {
            self.transport.dial().await?;
            let raw = self.call("eth_chainId", vec![], timeout).await?;
            parse_quantity(&raw)
        })
        .await;

        match verified {
            Ok(actual) if actual == chain_id => {
                self.dial_failures.store(0, Ordering::Relaxed);
                self.transition(EndpointState::Alive);
                tracing::info!(endpoint = %self.name, url = %self.url(), role = %self.role, "endpoint alive");
                Ok(())
            }
            Ok(actual) => {
                self.transition(EndpointState::Invalid);
                self.transport.close();
                tracing::error!(
                    endpoint = %self.name,
                    url = %self.url(),
                    expected = chain_id,
                    actual,
                    "endpoint reports wrong chain id, marking invalid"
                );
                Err(TransportError::ChainIdMismatch {
                    expected: chain_id,
                    actual,
                })
            }
            Err(e) => {
                self.transition(EndpointState::Unreachable);
                tracing::warn!(endpoint = %self.name, url = %self.url(), error = %e, "dial failed");
                Err(e)
            }
        }
    }

    /// Submit a signed transaction (or any write) to this endpoint.
    pub(crate) async fn broadcast(
        &self,
        req: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let req = req.with_id(self.next_request_id());
        let resp = timed(timeout, self.transport.send(req)).await?;
        resp.into_result().map_err(TransportError::Rpc)
    }

    async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
        timeout: Duration,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        timed(timeout, self.transport.send_batch(reqs)).await
    }

    /// Transition to `Closed` and release the connection.
    pub(crate) fn close(&self) {
        self.transition(EndpointState::Closed);
        self.transport.close();
    }
}

impl std::fmt::Debug for EndpointCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("url", &self.url())
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

/// Decode a `0x`-prefixed quantity.
pub(crate) fn parse_quantity(value: &Value) -> Result<u64, TransportError> {
    value
        .as_str()
        .and_then(parse_hex_u64)
        .ok_or_else(|| TransportError::Other(format!("expected hex quantity, got {value}")))
}

/// An endpoint serving reads, writes and subscriptions.
#[derive(Debug)]
pub struct PrimaryEndpoint {
    core: EndpointCore,
}

impl PrimaryEndpoint {
    pub fn new(name: impl Into<String>, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            core: EndpointCore::new(name.into(), EndpointRole::Primary, transport),
        }
    }

    pub(crate) async fn request(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        self.core.call(method, params, timeout).await
    }

    pub(crate) async fn batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
        timeout: Duration,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        self.core.send_batch(reqs, timeout).await
    }

    pub(crate) async fn subscribe(
        &self,
        kind: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<RawSubscription, TransportError> {
        let (id, notifications) = timed(timeout, self.core.transport.subscribe(kind, params)).await?;
        tracing::debug!(endpoint = %self.core.name, kind, %id, "subscription opened");
        Ok(RawSubscription::new(
            id,
            notifications,
            Arc::clone(&self.core.transport),
        ))
    }

    /// Fetch `eth_blockNumber`.
    pub(crate) async fn block_number(&self, timeout: Duration) -> Result<u64, TransportError> {
        let raw = self.core.call("eth_blockNumber", vec![], timeout).await?;
        parse_quantity(&raw)
    }
}

impl Deref for PrimaryEndpoint {
    type Target = EndpointCore;

    fn deref(&self) -> &EndpointCore {
        &self.core
    }
}

/// An endpoint that only accepts transaction broadcasts.
#[derive(Debug)]
pub struct SendOnlyEndpoint {
    core: EndpointCore,
}

impl SendOnlyEndpoint {
    pub fn new(name: impl Into<String>, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            core: EndpointCore::new(name.into(), EndpointRole::SendOnly, transport),
        }
    }

    /// Batch without the read-routing guarantees of a primary. Only used to
    /// mirror mass retransmissions to every endpoint.
    pub(crate) async fn batch_unchecked(
        &self,
        reqs: Vec<JsonRpcRequest>,
        timeout: Duration,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        self.core.send_batch(reqs, timeout).await
    }
}

impl Deref for SendOnlyEndpoint {
    type Target = EndpointCore;

    fn deref(&self) -> &EndpointCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RpcId;
    use async_trait::async_trait;

    struct ChainIdTransport {
        chain_id: u64,
        reachable: bool,
    }

    #[async_trait]
    impl RpcTransport for ChainIdTransport {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            if !self.reachable {
                return Err(TransportError::Http("connection refused".into()));
            }
            Ok(JsonRpcResponse::success(
                req.id,
                Value::String(format!("{:#x}", self.chain_id)),
            ))
        }
        fn url(&self) -> &str {
            "mock://chain-id"
        }
    }

    fn primary(chain_id: u64, reachable: bool) -> PrimaryEndpoint {
        PrimaryEndpoint::new("node", Arc::new(ChainIdTransport { chain_id, reachable }))
    }

    #[test]
    fn legal_transitions() {
        use EndpointState::*;
        assert!(Undialed.can_transition_to(Dialing));
        assert!(Unreachable.can_transition_to(Dialing));
        assert!(Dialing.can_transition_to(Invalid));
        assert!(Alive.can_transition_to(OutOfSync));
        assert!(OutOfSync.can_transition_to(Alive));
        assert!(Alive.can_transition_to(Closed));
        assert!(!Invalid.can_transition_to(Closed));
        assert!(!Invalid.can_transition_to(Dialing));
        assert!(!Closed.can_transition_to(Dialing));
        assert!(!Undialed.can_transition_to(Alive));
        assert!(!Alive.can_transition_to(Dialing));
    }

    #[test]
    fn illegal_transition_keeps_state() {
        let ep = primary(1, true);
        assert!(!ep.transition(EndpointState::Alive));
        assert_eq!(ep.state(), EndpointState::Undialed);
    }

    #[tokio::test]
    async fn dial_matching_chain_goes_alive() {
        let ep = primary(137, true);
        ep.dial(137, Duration::from_secs(1)).await.unwrap();
        assert_eq!(ep.state(), EndpointState::Alive);
    }

    #[tokio::test]
    async fn dial_wrong_chain_is_invalid() {
        let ep = primary(5, true);
        let err = ep.dial(1, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ChainIdMismatch { expected: 1, actual: 5 }
        ));
        assert_eq!(ep.state(), EndpointState::Invalid);
        // terminal: never dialed again
        assert!(ep.dial(1, Duration::from_secs(1)).await.is_err());
        assert_eq!(ep.state(), EndpointState::Invalid);
    }

    #[tokio::test]
    async fn dial_unreachable_node() {
        let ep = primary(1, false);
        assert!(ep.dial(1, Duration::from_secs(1)).await.is_err());
        assert_eq!(ep.state(), EndpointState::Unreachable);
        assert!(ep.redial_due(Instant::now()));
        ep.schedule_redial(Duration::from_secs(60));
        assert!(!ep.redial_due(Instant::now()));
    }

    #[tokio::test]
    async fn broadcast_reassigns_request_id() {
        let ep = primary(1, true);
        let req = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: "eth_sendRawTransaction".into(),
            params: vec![],
            id: RpcId::Null,
        };
        assert!(ep.broadcast(req, Duration::from_secs(1)).await.is_ok());
    }
}
