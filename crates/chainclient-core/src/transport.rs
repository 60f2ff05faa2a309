//! The `RpcTransport` trait: the connection abstraction behind every endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// Connection-level health reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connected and responding.
    Healthy,
    /// Connection dropped or never established.
    Unhealthy,
    /// Health status is unknown (stateless transports).
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A unique subscription ID returned by `eth_subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An open upstream subscription.
///
/// `notifications` closes when the underlying connection drops. The handle is
/// consumed by [`RawSubscription::unsubscribe`], so the remote side is
/// unsubscribed at most once.
pub struct RawSubscription {
    pub id: SubscriptionId,
    pub notifications: mpsc::UnboundedReceiver<Value>,
    transport: Arc<dyn RpcTransport>,
}

impl RawSubscription {
    pub fn new(
        id: SubscriptionId,
        notifications: mpsc::UnboundedReceiver<Value>,
        transport: Arc<dyn RpcTransport>,
    ) -> Self {
        Self {
            id,
            notifications,
            transport,
        }
    }

    /// URL of the transport serving this subscription.
    pub fn url(&self) -> &str {
        self.transport.url()
    }

    /// Cancel the subscription on the remote node.
    pub async fn unsubscribe(self) -> Result<(), TransportError> {
        let Self { id, transport, .. } = self;
        transport.unsubscribe(&id).await
    }
}

impl std::fmt::Debug for RawSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSubscription")
            .field("id", &self.id)
            .field("url", &self.transport.url())
            .finish()
    }
}

/// The central async trait every RPC transport must implement.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and is stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Send a batch of JSON-RPC requests.
    ///
    /// Default implementation sends them sequentially; override for true batching.
    async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        let mut responses = Vec::with_capacity(reqs.len());
        for req in reqs {
            responses.push(self.send(req).await?);
        }
        Ok(responses)
    }

    /// Establish the underlying connection. Stateless transports need not override.
    async fn dial(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the underlying connection. Must be idempotent.
    fn close(&self) {}

    /// Open an `eth_subscribe` stream of the given kind (e.g. `"newHeads"`).
    async fn subscribe(
        &self,
        _kind: &str,
        _params: Vec<Value>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Value>), TransportError> {
        Err(TransportError::SubscriptionsUnsupported {
            url: self.url().to_string(),
        })
    }

    /// Cancel a subscription previously opened by [`RpcTransport::subscribe`].
    async fn unsubscribe(&self, _id: &SubscriptionId) -> Result<(), TransportError> {
        Err(TransportError::SubscriptionsUnsupported {
            url: self.url().to_string(),
        })
    }

    /// Return the current health status of this transport.
    fn health(&self) -> HealthStatus {
        HealthStatus::Unknown
    }

    /// Return the transport's identifier (URL or name).
    fn url(&self) -> &str;
}
