//! Multi-endpoint pool with sequential read failover and broadcast fan-out.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{ChainType, ConfigError, PoolConfig};
use crate::endpoint::{
    EndpointCore, EndpointRole, EndpointState, PrimaryEndpoint, SendOnlyEndpoint,
};
use crate::error::{BroadcastError, EndpointFailure, TransportError};
use crate::monitor;
use crate::policy::RetryPolicy;
use crate::request::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{RawSubscription, RpcTransport};

/// A named transport handed to [`Pool::new`].
pub type NamedTransport = (String, Arc<dyn RpcTransport>);

/// Outcome of a broadcast that at least one endpoint accepted.
#[derive(Debug)]
pub struct BroadcastReport {
    /// Endpoints that accepted the request, in pool order.
    pub accepted: Vec<String>,
    /// Endpoints that rejected it, in pool order.
    pub failures: Vec<EndpointFailure>,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) chain_id: u64,
    chain_type: ChainType,
    pub(crate) primaries: Vec<Arc<PrimaryEndpoint>>,
    pub(crate) send_only: Vec<Arc<SendOnlyEndpoint>>,
    active: AtomicUsize,
    pub(crate) redial_policy: RetryPolicy,
    shutdown: CancellationToken,
    dialed: AtomicBool,
    dial_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    /// Every endpoint, primaries first.
    pub(crate) fn cores(&self) -> impl Iterator<Item = &EndpointCore> {
        self.primaries
            .iter()
            .map(|p| &***p)
            .chain(self.send_only.iter().map(|s| &***s))
    }

    /// Dial one endpoint, scheduling a redial if it is left unreachable.
    pub(crate) async fn dial_endpoint(&self, core: &EndpointCore) -> Result<(), TransportError> {
        let result = core.dial(self.chain_id, self.config.query_timeout).await;
        if core.state() == EndpointState::Unreachable {
            self.schedule_redial(core);
        }
        result
    }

    /// Record a failure on `core` and push its next redial out by the backoff.
    pub(crate) fn schedule_redial(&self, core: &EndpointCore) {
        let failures = core.record_failure();
        let delay = self.redial_policy.backoff(failures);
        tracing::debug!(endpoint = %core.name(), failures, delay_ms = delay.as_millis() as u64, "redial scheduled");
        core.schedule_redial(delay);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Owns the endpoints of one chain and routes every call through them.
///
/// Reads go to the active `Alive` primary and fail over in ring order on
/// connectivity errors. Broadcasts go to every eligible endpoint at once.
/// Cloning is cheap and shares the same endpoints.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Build a pool. At least one primary is required.
    pub fn new(
        config: PoolConfig,
        chain_id: u64,
        chain_type: ChainType,
        primaries: Vec<NamedTransport>,
        send_only: Vec<NamedTransport>,
    ) -> Result<Self, ConfigError> {
        if primaries.is_empty() {
            return Err(ConfigError::NoPrimary);
        }
        let mut names = std::collections::HashSet::new();
        for (name, _) in primaries.iter().chain(send_only.iter()) {
            if !names.insert(name.as_str()) {
                return Err(ConfigError::DuplicateName(name.clone()));
            }
        }
        let redial_policy = RetryPolicy::new(config.redial.clone());
        let inner = PoolInner {
            config,
            chain_id,
            chain_type,
            primaries: primaries
                .into_iter()
                .map(|(name, t)| Arc::new(PrimaryEndpoint::new(name, t)))
                .collect(),
            send_only: send_only
                .into_iter()
                .map(|(name, t)| Arc::new(SendOnlyEndpoint::new(name, t)))
                .collect(),
            active: AtomicUsize::new(0),
            redial_policy,
            shutdown: CancellationToken::new(),
            dialed: AtomicBool::new(false),
            dial_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            monitor: Mutex::new(None),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.inner.chain_id
    }

    pub fn chain_type(&self) -> ChainType {
        self.inner.chain_type
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Dial every endpoint concurrently and start the liveness monitor.
    ///
    /// Fails with [`TransportError::NoLivePrimary`] if no primary came up; in
    /// that case the pool may be dialed again. Dialing a dialed pool is a no-op.
    /// Concurrent dials are serialised: a second caller waits for the first
    /// and only then sees the pool as dialed.
    pub async fn dial(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        let _guard = inner.dial_lock.lock().await;
        if inner.is_closed() {
            return Err(TransportError::Closed);
        }
        if inner.dialed.load(Ordering::Acquire) {
            return Ok(());
        }

        let pending = inner.cores().filter(|c| {
            matches!(c.state(), EndpointState::Undialed | EndpointState::Unreachable)
        });
        join_all(pending.map(|c| inner.dial_endpoint(c))).await;

        let alive = inner
            .primaries
            .iter()
            .position(|p| p.state().is_routable());
        let Some(first_alive) = alive else {
            tracing::error!(
                chain_id = inner.chain_id,
                primaries = inner.primaries.len(),
                "no primary endpoint reachable"
            );
            return Err(TransportError::NoLivePrimary);
        };
        inner.active.store(first_alive, Ordering::Release);
        inner.dialed.store(true, Ordering::Release);

        let handle = monitor::spawn(
            Arc::downgrade(inner),
            inner.shutdown.child_token(),
            inner.config.poll_interval,
        );
        if let Ok(mut slot) = inner.monitor.lock() {
            *slot = Some(handle);
        }
        tracing::info!(
            chain_id = inner.chain_id,
            active = %inner.primaries[first_alive].name(),
            "pool dialed"
        );
        Ok(())
    }

    /// Stop the monitor and close every endpoint. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.cancel();
        let handle = inner.monitor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "liveness monitor exited abnormally");
            }
        }
        for core in inner.cores() {
            core.close();
        }
        tracing::info!(chain_id = inner.chain_id, "pool closed");
    }

    /// Run `op` against the active primary, failing over in ring order on
    /// errors `failover` accepts.
    async fn route<T, F, Fut>(
        &self,
        method: &str,
        failover: fn(&TransportError) -> bool,
        op: F,
    ) -> Result<T, TransportError>
    where
        F: Fn(Arc<PrimaryEndpoint>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(TransportError::Closed);
        }
        let n = inner.primaries.len();
        let start = inner.active.load(Ordering::Acquire) % n;
        let mut attempts = 0;
        let mut last: Option<TransportError> = None;

        for offset in 0..n {
            let idx = (start + offset) % n;
            let ep = &inner.primaries[idx];
            if !ep.state().is_routable() {
                continue;
            }
            attempts += 1;
            let span = tracing::info_span!("rpc", endpoint = %ep.name(), method);
            match op(Arc::clone(ep)).instrument(span).await {
                Ok(value) => {
                    if idx != start {
                        inner.active.store(idx, Ordering::Release);
                        tracing::info!(endpoint = %ep.name(), method, "switched active primary");
                    }
                    return Ok(value);
                }
                Err(e) if failover(&e) => {
                    tracing::warn!(endpoint = %ep.name(), method, error = %e, "call failed, trying next primary");
                    last = Some(e.at_endpoint(ep.name()));
                }
                Err(e) => return Err(e.at_endpoint(ep.name())),
            }
        }

        match last {
            Some(last) => Err(TransportError::AllEndpointsFailed {
                attempts,
                last: Box::new(last),
            }),
            None => Err(TransportError::NoLivePrimary),
        }
    }

    /// Send one request to the active primary.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let timeout = self.inner.config.query_timeout;
        self.route(method, TransportError::is_retryable, |ep| {
            let params = params.clone();
            async move { ep.request(method, params, timeout).await }
        })
        .await
    }

    /// Send one request and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a batch to the active primary.
    pub async fn batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        let timeout = self.inner.config.query_timeout;
        self.route("batch", TransportError::is_retryable, |ep| {
            let reqs = reqs.clone();
            async move { ep.batch(reqs, timeout).await }
        })
        .await
    }

    /// Send a batch to every primary and every send-only endpoint, returning
    /// the active primary's responses.
    ///
    /// Only meant for mass retransmission: the batch is executed once per
    /// endpoint.
    pub async fn batch_all(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(TransportError::Closed);
        }
        let timeout = inner.config.query_timeout;
        let n = inner.primaries.len();
        let start = inner.active.load(Ordering::Acquire) % n;
        let main = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&idx| inner.primaries[idx].state().is_routable())
            .ok_or(TransportError::NoLivePrimary)?;

        let others: Vec<_> = inner
            .primaries
            .iter()
            .enumerate()
            .filter(|(idx, p)| *idx != main && is_broadcast_target(p))
            .map(|(_, p)| {
                let reqs = reqs.clone();
                async move { (p.name(), p.batch(reqs, timeout).await.map(|_| ())) }
            })
            .collect();
        let send_only: Vec<_> = inner
            .send_only
            .iter()
            .filter(|s| is_broadcast_target(s))
            .map(|s| {
                let reqs = reqs.clone();
                async move { (s.name(), s.batch_unchecked(reqs, timeout).await.map(|_| ())) }
            })
            .collect();

        let main_ep = &inner.primaries[main];
        let (main_result, other_results, send_only_results) = tokio::join!(
            main_ep.batch(reqs, timeout),
            join_all(others),
            join_all(send_only),
        );
        for (name, result) in other_results.into_iter().chain(send_only_results) {
            if let Err(e) = result {
                tracing::warn!(endpoint = %name, error = %e, "batch to secondary endpoint failed");
            }
        }
        main_result.map_err(|e| e.at_endpoint(main_ep.name()))
    }

    /// Send `req` to every `Alive`/`OutOfSync` primary and every `Alive`
    /// send-only endpoint concurrently.
    pub async fn broadcast(&self, req: JsonRpcRequest) -> Result<BroadcastReport, BroadcastError> {
        let inner = &self.inner;
        let timeout = inner.config.query_timeout;
        let targets: Vec<&EndpointCore> = inner
            .primaries
            .iter()
            .map(|p| &***p)
            .filter(|c| is_broadcast_target(c))
            .chain(
                inner
                    .send_only
                    .iter()
                    .map(|s| &***s)
                    .filter(|c| is_broadcast_target(c)),
            )
            .collect();

        let results = join_all(targets.iter().map(|core| {
            let req = req.clone();
            let span = tracing::info_span!("rpc", endpoint = %core.name(), method = %req.method);
            core.broadcast(req, timeout).instrument(span)
        }))
        .await;

        let mut accepted = Vec::new();
        let mut failures = Vec::new();
        for (core, result) in targets.into_iter().zip(results) {
            match result {
                Ok(_) => accepted.push(core.name().to_string()),
                Err(error) => {
                    tracing::debug!(endpoint = %core.name(), role = %core.role(), error = %error, "broadcast rejected");
                    failures.push(EndpointFailure {
                        endpoint: core.name().to_string(),
                        role: core.role(),
                        error,
                    });
                }
            }
        }

        if accepted.is_empty() {
            Err(BroadcastError { failures })
        } else {
            Ok(BroadcastReport { accepted, failures })
        }
    }

    /// Open a subscription on the active primary, failing over to the next
    /// primary on connectivity errors or transports without subscriptions.
    pub async fn subscribe(
        &self,
        kind: &str,
        params: Vec<Value>,
    ) -> Result<RawSubscription, TransportError> {
        let timeout = self.inner.config.query_timeout;
        self.route("eth_subscribe", subscribe_failover, |ep| {
            let params = params.clone();
            async move { ep.subscribe(kind, params, timeout).await }
        })
        .await
    }

    /// Endpoint name → state, primaries and send-only endpoints alike.
    pub fn node_states(&self) -> BTreeMap<String, String> {
        self.inner
            .cores()
            .map(|c| (c.name().to_string(), c.state().to_string()))
            .collect()
    }

    /// State of the named endpoint.
    pub fn endpoint_state(&self, name: &str) -> Option<EndpointState> {
        self.inner
            .cores()
            .find(|c| c.name() == name)
            .map(|c| c.state())
    }

    /// Name of the primary that currently serves reads, if it is alive.
    pub fn active_primary(&self) -> Option<String> {
        let n = self.inner.primaries.len();
        let ep = &self.inner.primaries[self.inner.active.load(Ordering::Acquire) % n];
        ep.state().is_routable().then(|| ep.name().to_string())
    }

    /// Run one liveness check immediately instead of waiting for the monitor.
    pub async fn check_liveness(&self) {
        monitor::check(&self.inner, Instant::now()).await;
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("chain_id", &self.inner.chain_id)
            .field("primaries", &self.inner.primaries)
            .field("send_only", &self.inner.send_only)
            .finish()
    }
}

fn is_broadcast_target(core: &EndpointCore) -> bool {
    match (core.role(), core.state()) {
        (_, EndpointState::Alive) => true,
        (EndpointRole::Primary, EndpointState::OutOfSync) => true,
        _ => false,
    }
}

fn subscribe_failover(e: &TransportError) -> bool {
    e.is_retryable() || matches!(e.root(), TransportError::SubscriptionsUnsupported { .. })
}
