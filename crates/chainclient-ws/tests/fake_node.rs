//! End-to-end tests against an in-process WebSocket JSON-RPC node.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use chainclient_core::request::{JsonRpcRequest, RpcId};
use chainclient_core::transport::{HealthStatus, RpcTransport};
use chainclient_core::TransportError;
use chainclient_ws::{WsClientConfig, WsRpcClient};

async fn send_json(ws: &mut WebSocketStream<tokio::net::TcpStream>, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Serves one connection. `test_disconnect` drops the socket without replying.
async fn fake_node() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(text) = msg else { continue };
            let req: Value = serde_json::from_str(text.as_str()).unwrap();
            let id = req["id"].clone();
            match req["method"].as_str().unwrap() {
                "eth_chainId" => {
                    send_json(&mut ws, json!({"jsonrpc":"2.0","id":id,"result":"0x1"})).await
                }
                "eth_subscribe" => {
                    send_json(&mut ws, json!({"jsonrpc":"2.0","id":id,"result":"0xsub"})).await;
                    for n in 1..=2 {
                        send_json(
                            &mut ws,
                            json!({
                                "jsonrpc": "2.0",
                                "method": "eth_subscription",
                                "params": {"subscription": "0xsub", "result": {"number": format!("{n:#x}")}}
                            }),
                        )
                        .await;
                    }
                }
                "eth_unsubscribe" => {
                    send_json(&mut ws, json!({"jsonrpc":"2.0","id":id,"result":true})).await
                }
                "test_disconnect" => return,
                _ => {
                    send_json(
                        &mut ws,
                        json!({"jsonrpc":"2.0","id":id,"error":{"code":-32601,"message":"method not found"}}),
                    )
                    .await
                }
            }
        }
    });
    addr
}

#[tokio::test]
async fn request_subscribe_and_disconnect() {
    let addr = fake_node().await;
    let client = WsRpcClient::connect(format!("ws://{addr}"), WsClientConfig::default())
        .await
        .unwrap();
    assert_eq!(client.health(), HealthStatus::Healthy);

    let resp = client
        .send(JsonRpcRequest::new(99, "eth_chainId", vec![]))
        .await
        .unwrap();
    assert_eq!(resp.id, RpcId::Number(99));
    assert_eq!(resp.result, Some(json!("0x1")));

    let (id, mut heads) = client.subscribe("newHeads", vec![]).await.unwrap();
    assert_eq!(heads.recv().await.unwrap()["number"], "0x1");
    assert_eq!(heads.recv().await.unwrap()["number"], "0x2");
    client.unsubscribe(&id).await.unwrap();
    assert!(heads.recv().await.is_none());
    assert_eq!(client.subscription_count(), 0);

    let (_, mut heads) = client.subscribe("newHeads", vec![]).await.unwrap();
    let err = client
        .send(JsonRpcRequest::new(1, "test_disconnect", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NotConnected { .. }));

    // buffered notifications drain, then the channel closes
    let mut received = 0;
    while heads.recv().await.is_some() {
        received += 1;
    }
    assert_eq!(received, 2);
    assert_eq!(client.health(), HealthStatus::Unhealthy);
}

#[tokio::test]
async fn unknown_method_is_execution_error() {
    let addr = fake_node().await;
    let client = WsRpcClient::connect(format!("ws://{addr}"), WsClientConfig::default())
        .await
        .unwrap();
    let resp = client
        .send(JsonRpcRequest::new(5, "eth_foo", vec![]))
        .await
        .unwrap();
    assert_eq!(resp.into_result().unwrap_err().code, -32601);
    client.close();
}
