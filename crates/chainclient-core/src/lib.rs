//! chainclient-core: endpoint pool and transport abstraction for ChainClient.
//!
//! # Overview
//!
//! ChainClient presents one logical EVM chain client on top of a pool of
//! remote JSON-RPC nodes. The core crate defines:
//!
//! - [`RpcTransport`]: the async trait every transport implements
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`]: wire types
//! - [`TransportError`] / [`BroadcastError`]: structured error types
//! - [`endpoint`] module: per-node health state machine with typed roles
//! - [`Pool`]: read failover, broadcast fan-out and the liveness monitor
//! - [`config`] module: serde configuration for pools and endpoints

pub mod config;
pub mod endpoint;
pub mod error;
pub mod monitor;
pub mod policy;
pub mod pool;
pub mod request;
pub mod transport;

pub use config::{
    ChainType, ClientConfig, ConfigError, EndpointConfig, PoolConfig, DEFAULT_QUERY_TIMEOUT,
};
pub use endpoint::{EndpointRole, EndpointState};
pub use error::{BroadcastError, EndpointFailure, TransportError};
pub use pool::{BroadcastReport, NamedTransport, Pool};
pub use request::{parse_hex_u64, JsonRpcRequest, JsonRpcResponse, RpcId, RpcParam};
pub use transport::{HealthStatus, RawSubscription, RpcTransport, SubscriptionId};
