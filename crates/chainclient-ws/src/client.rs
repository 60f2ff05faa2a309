//! WebSocket JSON-RPC client with subscription support.
//!
//! [`WsRpcClient::dial`] opens the connection and spawns a task that owns it.
//! Requests are multiplexed over the socket under task-assigned wire ids, so
//! callers may reuse ids freely. When the connection drops every pending
//! request fails, every subscription channel closes and the client reports
//! itself unhealthy until it is dialed again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use chainclient_core::error::TransportError;
use chainclient_core::request::{JsonRpcRequest, JsonRpcResponse, RpcId};
use chainclient_core::transport::{HealthStatus, RpcTransport, SubscriptionId};

use crate::subscriptions::SubscriptionManager;

type ResponseTx = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;
type SubscribeTx =
    oneshot::Sender<Result<(SubscriptionId, mpsc::UnboundedReceiver<Value>), TransportError>>;

/// Configuration for the WebSocket client.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Bound on the WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Command sent from callers to the background WS task.
enum WsCommand {
    Send { req: JsonRpcRequest, tx: ResponseTx },
    Subscribe { req: JsonRpcRequest, kind: String, tx: SubscribeTx },
    Close,
}

/// A request awaiting its response, keyed by wire id.
enum Pending {
    Call { id: RpcId, tx: ResponseTx },
    Subscribe { kind: String, tx: SubscribeTx },
}

/// WebSocket JSON-RPC client.
pub struct WsRpcClient {
    url: String,
    config: WsClientConfig,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<WsCommand>>>,
    connected: Arc<AtomicBool>,
    subscriptions: SubscriptionManager,
}

impl WsRpcClient {
    /// Create a client for `url`. Nothing is connected until [`RpcTransport::dial`].
    pub fn new(url: impl Into<String>, config: WsClientConfig) -> Self {
        Self {
            url: url.into(),
            config,
            cmd_tx: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            subscriptions: SubscriptionManager::new(),
        }
    }

    /// Create and dial in one step.
    pub async fn connect(
        url: impl Into<String>,
        config: WsClientConfig,
    ) -> Result<Self, TransportError> {
        let client = Self::new(url, config);
        client.dial().await?;
        Ok(client)
    }

    /// Number of subscriptions open on the current connection.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<WsCommand>, TransportError> {
        let guard = self
            .cmd_tx
            .lock()
            .map_err(|_| TransportError::Other("ws command lock poisoned".into()))?;
        match guard.as_ref() {
            Some(tx) if self.connected.load(Ordering::Acquire) => Ok(tx.clone()),
            _ => Err(TransportError::NotConnected {
                url: self.url.clone(),
            }),
        }
    }

    fn not_connected(&self) -> TransportError {
        TransportError::NotConnected {
            url: self.url.clone(),
        }
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl RpcTransport for WsRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.sender()?
            .send(WsCommand::Send { req, tx })
            .map_err(|_| self.not_connected())?;
        rx.await.map_err(|_| self.not_connected())?
    }

    async fn dial(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        tracing::debug!(url = %self.url, "connecting via WebSocket");
        let (ws_stream, _) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            ms: self.config.connect_timeout.as_millis() as u64,
        })?
        .map_err(|e| TransportError::WebSocket(format!("connect to {} failed: {e}", self.url)))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        {
            let mut slot = self
                .cmd_tx
                .lock()
                .map_err(|_| TransportError::Other("ws command lock poisoned".into()))?;
            *slot = Some(cmd_tx);
        }
        self.connected.store(true, Ordering::Release);
        tokio::spawn(ws_task(
            self.url.clone(),
            ws_stream,
            cmd_rx,
            self.subscriptions.clone(),
            Arc::clone(&self.connected),
        ));
        tracing::info!(url = %self.url, "WebSocket connected");
        Ok(())
    }

    fn close(&self) {
        let tx = match self.cmd_tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(tx) = tx {
            let _ = tx.send(WsCommand::Close);
        }
    }

    async fn subscribe(
        &self,
        kind: &str,
        params: Vec<Value>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Value>), TransportError> {
        let params = std::iter::once(Value::String(kind.to_string()))
            .chain(params)
            .collect();
        let req = JsonRpcRequest::new(0, "eth_subscribe", params);
        let (tx, rx) = oneshot::channel();
        self.sender()?
            .send(WsCommand::Subscribe {
                req,
                kind: kind.to_string(),
                tx,
            })
            .map_err(|_| self.not_connected())?;
        rx.await.map_err(|_| self.not_connected())?
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError> {
        if !self.subscriptions.remove(id) {
            return Ok(());
        }
        let req = JsonRpcRequest::new(0, "eth_unsubscribe", vec![Value::String(id.0.clone())]);
        match self.send(req).await {
            Ok(resp) => {
                if let Err(e) = resp.into_result() {
                    tracing::debug!(url = %self.url, %id, error = %e, "eth_unsubscribe rejected");
                }
                Ok(())
            }
            // the connection is gone and the subscription with it
            Err(TransportError::NotConnected { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn health(&self) -> HealthStatus {
        if self.connected.load(Ordering::Acquire) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Background task that owns one WebSocket connection.
async fn ws_task<S>(
    url: String,
    ws_stream: S,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    subscriptions: SubscriptionManager,
    connected: Arc<AtomicBool>,
) where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws_stream.split();
    let mut pending: HashMap<u64, Pending> = HashMap::new();
    let mut next_wire_id: u64 = 1;
    let mut closed_by_us = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let (mut req, entry) = match cmd {
                    None | Some(WsCommand::Close) => {
                        closed_by_us = true;
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Some(WsCommand::Send { req, tx }) => {
                        let id = req.id.clone();
                        (req, Pending::Call { id, tx })
                    }
                    Some(WsCommand::Subscribe { req, kind, tx }) => (req, Pending::Subscribe { kind, tx }),
                };
                let wire_id = next_wire_id;
                next_wire_id += 1;
                req.id = RpcId::Number(wire_id);
                let msg = match serde_json::to_string(&req) {
                    Ok(msg) => msg,
                    Err(e) => {
                        fail(entry, TransportError::Deserialization(e));
                        continue;
                    }
                };
                pending.insert(wire_id, entry);
                if let Err(e) = sink.send(Message::Text(msg.into())).await {
                    tracing::warn!(url = %url, error = %e, "WS send failed");
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        tracing::warn!(url = %url, error = %e, "WS receive error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_message(text.as_str(), &mut pending, &subscriptions);
                    }
                    Some(Ok(Message::Close(_))) => break,
                    _ => {}
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
    for (_, entry) in pending.drain() {
        fail(entry, TransportError::NotConnected { url: url.clone() });
    }
    let dropped = subscriptions.clear();
    if closed_by_us {
        tracing::debug!(url = %url, "WebSocket closed");
    } else {
        tracing::warn!(url = %url, subscriptions = dropped, "WebSocket disconnected");
    }
}

fn fail(entry: Pending, err: TransportError) {
    match entry {
        Pending::Call { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Pending::Subscribe { tx, .. } => {
            let _ = tx.send(Err(err));
        }
    }
}

fn handle_message(
    text: &str,
    pending: &mut HashMap<u64, Pending>,
    subscriptions: &SubscriptionManager,
) {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("failed to parse WS message as JSON");
        return;
    };

    if val.get("method").and_then(|m| m.as_str()) == Some("eth_subscription") {
        if let Some(params) = val.get("params") {
            if let Some(id) = params["subscription"].as_str() {
                subscriptions.dispatch(&SubscriptionId(id.to_string()), params["result"].clone());
            }
        }
        return;
    }

    let resp = match serde_json::from_value::<JsonRpcResponse>(val) {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(error = %e, "unexpected WS message");
            return;
        }
    };
    let Some(entry) = resp.id.as_number().and_then(|id| pending.remove(&id)) else {
        return;
    };
    match entry {
        Pending::Call { id, tx } => {
            let _ = tx.send(Ok(JsonRpcResponse { id, ..resp }));
        }
        Pending::Subscribe { kind, tx } => {
            let result = match resp.into_result() {
                Ok(Value::String(sub_id)) => {
                    let sub_id = SubscriptionId(sub_id);
                    // registered before the next frame is read, so no notification is lost
                    let rx = subscriptions.register(sub_id.clone(), kind);
                    Ok((sub_id, rx))
                }
                Ok(other) => Err(TransportError::Other(format!(
                    "eth_subscribe returned non-string id: {other}"
                ))),
                Err(e) => Err(TransportError::Rpc(e)),
            };
            let _ = tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_entry() -> (Pending, oneshot::Receiver<Result<JsonRpcResponse, TransportError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Pending::Call {
                id: RpcId::Number(42),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn response_restores_caller_id() {
        let mut pending = HashMap::new();
        let (entry, mut rx) = call_entry();
        pending.insert(7, entry);
        handle_message(
            r#"{"jsonrpc":"2.0","id":7,"result":"0x1"}"#,
            &mut pending,
            &SubscriptionManager::new(),
        );
        let resp = rx.try_recv().unwrap().unwrap();
        assert_eq!(resp.id, RpcId::Number(42));
        assert!(pending.is_empty());
    }

    #[test]
    fn subscribe_response_registers_before_notifications() {
        let subs = SubscriptionManager::new();
        let mut pending = HashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(
            1,
            Pending::Subscribe {
                kind: "newHeads".into(),
                tx,
            },
        );
        handle_message(r#"{"jsonrpc":"2.0","id":1,"result":"0xabc"}"#, &mut pending, &subs);
        handle_message(
            r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xabc","result":{"number":"0x10"}}}"#,
            &mut pending,
            &subs,
        );
        let (id, mut notifications) = rx.try_recv().unwrap().unwrap();
        assert_eq!(id, SubscriptionId("0xabc".into()));
        assert_eq!(notifications.try_recv().unwrap()["number"], "0x10");
    }

    #[test]
    fn subscribe_rejection_is_rpc_error() {
        let subs = SubscriptionManager::new();
        let mut pending = HashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(3, Pending::Subscribe { kind: "newHeads".into(), tx });
        handle_message(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"notifications not supported"}}"#,
            &mut pending,
            &subs,
        );
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(err.is_execution_error());
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn undialed_client_is_not_connected() {
        let client = WsRpcClient::new("ws://127.0.0.1:1", WsClientConfig::default());
        assert_eq!(client.health(), HealthStatus::Unhealthy);
        let err = client
            .send(JsonRpcRequest::new(1, "eth_chainId", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected { .. }));
        assert!(err.is_retryable());
        // nothing to unsubscribe from
        client.unsubscribe(&SubscriptionId("0x1".into())).await.unwrap();
    }
}
