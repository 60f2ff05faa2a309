//! chainclient-http: HTTP JSON-RPC transport for ChainClient.

pub mod client;

pub use client::{HttpClientConfig, HttpRpcClient};
