//! Reliability policies.
//!
//! Read failover is handled by the pool itself; the policies here govern the
//! background work the pool does on behalf of its endpoints:
//! ```text
//! Unreachable endpoint → [RetryPolicy backoff] → redial
//! ```

pub mod retry;

pub use retry::{RetryConfig, RetryPolicy};
