//! Transport-level error types.

use thiserror::Error;

use crate::endpoint::EndpointRole;
use crate::request::JsonRpcError;

/// Errors that can occur during an RPC transport or pool operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, bad status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Rate limit exceeded, the caller should back off.
    #[error("Rate limit exceeded (provider: {provider})")]
    RateLimited { provider: String },

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The requested object (header, block, receipt) does not exist (yet).
    #[error("not found")]
    NotFound,

    /// The remote node reports a different chain than the one configured.
    #[error("chain id mismatch: expected {expected}, remote reports {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },

    /// No primary endpoint is currently alive.
    #[error("no live primary endpoint available")]
    NoLivePrimary,

    /// Every candidate endpoint was tried and failed.
    #[error("all {attempts} candidate endpoints failed, last error: {last}")]
    AllEndpointsFailed {
        attempts: usize,
        last: Box<TransportError>,
    },

    /// An error attributed to the endpoint that produced it.
    #[error("[{endpoint}] {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: Box<TransportError>,
    },

    /// The transport cannot open subscriptions (e.g. plain HTTP).
    #[error("subscriptions are not supported by {url}")]
    SubscriptionsUnsupported { url: String },

    /// The transport has not been dialed or its connection dropped.
    #[error("not connected: {url}")]
    NotConnected { url: String },

    /// The pool or transport has been closed.
    #[error("closed")]
    Closed,

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Attribute this error to an endpoint.
    pub fn at_endpoint(self, endpoint: impl Into<String>) -> Self {
        Self::Endpoint {
            endpoint: endpoint.into(),
            source: Box::new(self),
        }
    }

    /// Strip endpoint attribution and return the underlying error.
    pub fn root(&self) -> &TransportError {
        match self {
            Self::Endpoint { source, .. } => source.root(),
            other => other,
        }
    }

    /// Name of the endpoint this error is attributed to, if any.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::Endpoint { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    /// Returns `true` if this error is transient and another endpoint may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Http(_)
                | Self::WebSocket(_)
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::NotConnected { .. }
        )
    }

    /// Returns `true` if this is a node-side execution error (not retryable).
    pub fn is_execution_error(&self) -> bool {
        matches!(self.root(), Self::Rpc(_))
    }

    /// Returns `true` if the request timed out.
    pub fn is_timeout(&self) -> bool {
        match self.root() {
            Self::Timeout { .. } => true,
            Self::AllEndpointsFailed { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// Returns `true` for the normalized not-found signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound)
    }

    /// The message the remote node returned, or this error's display text.
    pub fn node_message(&self) -> String {
        match self.root() {
            Self::Rpc(err) => err.message.clone(),
            Self::AllEndpointsFailed { last, .. } => last.node_message(),
            other => other.to_string(),
        }
    }
}

/// A single endpoint's rejection during a broadcast.
#[derive(Debug)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub role: EndpointRole,
    pub error: TransportError,
}

/// Every eligible endpoint rejected a broadcast.
///
/// Failures are listed in pool order, primaries first.
#[derive(Debug, Error)]
#[error("broadcast rejected by {} endpoint(s){}", .failures.len(), first_failure(.failures))]
pub struct BroadcastError {
    pub failures: Vec<EndpointFailure>,
}

fn first_failure(failures: &[EndpointFailure]) -> String {
    match failures.first() {
        Some(f) => format!(", first: [{}] {}", f.endpoint, f.error),
        None => " (no eligible endpoints)".to_string(),
    }
}

impl BroadcastError {
    /// The error reported by the first primary, falling back to the first failure.
    pub fn representative(&self) -> Option<&EndpointFailure> {
        self.failures
            .iter()
            .find(|f| f.role == EndpointRole::Primary)
            .or_else(|| self.failures.first())
    }

    /// Returns `true` when there was no endpoint to broadcast to.
    pub fn no_targets(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_sees_through_attribution() {
        let err = TransportError::Timeout { ms: 10 }.at_endpoint("a");
        assert!(err.is_retryable());
        assert!(err.is_timeout());
        assert_eq!(err.endpoint(), Some("a"));
        assert_eq!(err.to_string(), "[a] Request timed out after 10ms");
    }

    #[test]
    fn rpc_error_is_not_retryable() {
        let err = TransportError::Rpc(JsonRpcError {
            code: -32000,
            message: "nonce too low".into(),
            data: None,
        })
        .at_endpoint("a");
        assert!(!err.is_retryable());
        assert!(err.is_execution_error());
        assert_eq!(err.node_message(), "nonce too low");
    }

    #[test]
    fn broadcast_representative_prefers_primary() {
        let err = BroadcastError {
            failures: vec![
                EndpointFailure {
                    endpoint: "s".into(),
                    role: EndpointRole::SendOnly,
                    error: TransportError::Http("boom".into()),
                },
                EndpointFailure {
                    endpoint: "p".into(),
                    role: EndpointRole::Primary,
                    error: TransportError::Other("already known".into()),
                },
            ],
        };
        assert_eq!(err.representative().map(|f| f.endpoint.as_str()), Some("p"));
    }
}
