//! chainclient-ws: WebSocket JSON-RPC transport for ChainClient.
//!
//! # Features
//! - Request multiplexing over a single connection
//! - Subscription management (eth_subscribe / eth_unsubscribe)
//! - Explicit dial / close; reconnecting is left to the endpoint pool

pub mod client;
pub mod subscriptions;

pub use client::{WsClientConfig, WsRpcClient};
pub use subscriptions::SubscriptionManager;
