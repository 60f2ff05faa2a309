//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! Stateless: there is nothing to dial, every call is one HTTP POST. Batches
//! are sent as a single JSON array. Failover and backoff live in the pool.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use chainclient_core::error::TransportError;
use chainclient_core::request::{JsonRpcRequest, JsonRpcResponse, RpcId};
use chainclient_core::transport::RpcTransport;

/// Configuration for `HttpRpcClient`.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP JSON-RPC client.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            request_timeout: config.request_timeout,
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(url, HttpClientConfig::default())
    }

    fn map_reqwest(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            TransportError::Http(e.to_string())
        }
    }

    async fn post<B, R>(&self, body: &B) -> Result<R, TransportError>
    where
        B: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let resp = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited {
                provider: self.url.clone(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!(
                "HTTP {}: {body}",
                status.as_u16()
            )));
        }

        let bytes = resp.bytes().await.map_err(|e| self.map_reqwest(e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        tracing::trace!(url = %self.url, method = %req.method, id = %req.id, "http request");
        self.post(&req).await
    }

    /// True HTTP batch: send all requests as a JSON array in one HTTP call.
    async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        if reqs.is_empty() {
            return Ok(vec![]);
        }
        tracing::trace!(url = %self.url, size = reqs.len(), "http batch");
        let resps: Vec<JsonRpcResponse> = self.post(&reqs).await?;
        order_batch(&reqs, resps)
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Nodes may answer a batch in any order; put responses back in request order.
fn order_batch(
    reqs: &[JsonRpcRequest],
    resps: Vec<JsonRpcResponse>,
) -> Result<Vec<JsonRpcResponse>, TransportError> {
    if resps.len() != reqs.len() {
        return Err(TransportError::Other(format!(
            "batch of {} requests answered with {} responses",
            reqs.len(),
            resps.len()
        )));
    }
    let mut by_id: HashMap<RpcId, JsonRpcResponse> =
        resps.into_iter().map(|r| (r.id.clone(), r)).collect();
    reqs.iter()
        .map(|req| {
            by_id.remove(&req.id).ok_or_else(|| {
                TransportError::Other(format!("batch response missing id {}", req.id))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_responses_reordered() {
        let reqs = vec![
            JsonRpcRequest::new(1, "eth_blockNumber", vec![]),
            JsonRpcRequest::new(2, "eth_chainId", vec![]),
        ];
        let resps = vec![
            JsonRpcResponse::success(RpcId::Number(2), json!("0x1")),
            JsonRpcResponse::success(RpcId::Number(1), json!("0x10")),
        ];
        let ordered = order_batch(&reqs, resps).unwrap();
        assert_eq!(ordered[0].id, RpcId::Number(1));
        assert_eq!(ordered[1].result, Some(json!("0x1")));
    }

    #[test]
    fn batch_with_missing_response_fails() {
        let reqs = vec![
            JsonRpcRequest::new(1, "eth_blockNumber", vec![]),
            JsonRpcRequest::new(2, "eth_chainId", vec![]),
        ];
        let resps = vec![
            JsonRpcResponse::success(RpcId::Number(1), json!("0x10")),
            JsonRpcResponse::success(RpcId::Number(1), json!("0x10")),
        ];
        assert!(order_batch(&reqs, resps).is_err());
    }

    #[tokio::test]
    async fn connection_refused_is_retryable() {
        let client = HttpRpcClient::new(
            "http://127.0.0.1:1",
            HttpClientConfig {
                request_timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(1),
            },
        )
        .unwrap();
        let err = client
            .send(JsonRpcRequest::new(1, "eth_chainId", vec![]))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}
