//! Pool and endpoint configuration.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::RetryConfig;

/// Default bound on every network round trip.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Chain family, used to decide L2-specific fee error handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    #[default]
    Ethereum,
    Arbitrum,
    Optimism,
    Metis,
    XDai,
    ExChain,
}

impl ChainType {
    /// Chains with L2 fee-market semantics.
    pub fn is_l2(&self) -> bool {
        matches!(self, Self::Arbitrum | Self::Optimism | Self::Metis)
    }
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ethereum => "ethereum",
            Self::Arbitrum => "arbitrum",
            Self::Optimism => "optimism",
            Self::Metis => "metis",
            Self::XDai => "xdai",
            Self::ExChain => "exchain",
        };
        f.write_str(s)
    }
}

/// Configuration for the endpoint pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Timeout for every individual request, dial and probe.
    #[serde(with = "duration_ms", rename = "query_timeout_ms")]
    pub query_timeout: Duration,
    /// Interval between liveness probes of the primaries.
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Blocks a primary may lag behind the best head before it is `OutOfSync`.
    /// Zero disables out-of-sync detection.
    pub sync_threshold: u64,
    /// Backoff between redials of an unreachable endpoint.
    pub redial: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            poll_interval: Duration::from_secs(5),
            sync_threshold: 10,
            redial: RetryConfig::default(),
        }
    }
}

/// One remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    /// `http(s)://` or `ws(s)://` URL.
    pub url: String,
    /// Broadcast-only endpoint.
    #[serde(default)]
    pub send_only: bool,
}

/// Errors raised when validating a [`ClientConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one primary endpoint is required")]
    NoPrimary,

    #[error("duplicate endpoint name: {0}")]
    DuplicateName(String),

    #[error("endpoint '{name}' has unsupported url scheme: {url}")]
    UnsupportedScheme { name: String, url: String },

    #[error("send-only endpoint '{0}' must use http(s)")]
    SendOnlyWebSocket(String),

    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything needed to build a client for one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub chain_type: ChainType,
    #[serde(default)]
    pub pool: PoolConfig,
    pub endpoints: Vec<EndpointConfig>,
}

impl ClientConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.endpoints.iter().any(|e| !e.send_only) {
            return Err(ConfigError::NoPrimary);
        }
        let mut seen = HashSet::new();
        for ep in &self.endpoints {
            if !seen.insert(ep.name.as_str()) {
                return Err(ConfigError::DuplicateName(ep.name.clone()));
            }
            let scheme = ep.url.split("://").next().unwrap_or_default();
            match scheme {
                "http" | "https" => {}
                "ws" | "wss" if ep.send_only => {
                    return Err(ConfigError::SendOnlyWebSocket(ep.name.clone()));
                }
                "ws" | "wss" => {}
                _ => {
                    return Err(ConfigError::UnsupportedScheme {
                        name: ep.name.clone(),
                        url: ep.url.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn primaries(&self) -> impl Iterator<Item = &EndpointConfig> {
        self.endpoints.iter().filter(|e| !e.send_only)
    }

    pub fn send_only(&self) -> impl Iterator<Item = &EndpointConfig> {
        self.endpoints.iter().filter(|e| e.send_only)
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_chain_types() {
        assert!(ChainType::Arbitrum.is_l2());
        assert!(ChainType::Optimism.is_l2());
        assert!(ChainType::Metis.is_l2());
        assert!(!ChainType::Ethereum.is_l2());
        assert!(!ChainType::XDai.is_l2());
    }

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let cfg = ClientConfig::from_json(
            r#"{
                "chain_id": 1,
                "endpoints": [
                    { "name": "primary-0", "url": "wss://node0.example" },
                    { "name": "broadcast-0", "url": "https://node1.example", "send_only": true }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.chain_type, ChainType::Ethereum);
        assert_eq!(cfg.pool.query_timeout, DEFAULT_QUERY_TIMEOUT);
        assert_eq!(cfg.primaries().count(), 1);
        assert_eq!(cfg.send_only().count(), 1);
    }

    #[test]
    fn durations_are_milliseconds() {
        let cfg: PoolConfig =
            serde_json::from_str(r#"{ "query_timeout_ms": 2500, "sync_threshold": 0 }"#).unwrap();
        assert_eq!(cfg.query_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.sync_threshold, 0);
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn rejects_send_only_pool() {
        let err = ClientConfig::from_json(
            r#"{ "chain_id": 1, "endpoints": [
                { "name": "s", "url": "https://a", "send_only": true }
            ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoPrimary));
    }

    #[test]
    fn rejects_duplicate_names_and_bad_schemes() {
        let dup = ClientConfig {
            chain_id: 1,
            chain_type: ChainType::Ethereum,
            pool: PoolConfig::default(),
            endpoints: vec![
                EndpointConfig { name: "a".into(), url: "http://a".into(), send_only: false },
                EndpointConfig { name: "a".into(), url: "http://b".into(), send_only: false },
            ],
        };
        assert!(matches!(dup.validate(), Err(ConfigError::DuplicateName(_))));

        let bad = ClientConfig {
            endpoints: vec![EndpointConfig {
                name: "a".into(),
                url: "ftp://a".into(),
                send_only: false,
            }],
            ..dup
        };
        assert!(matches!(bad.validate(), Err(ConfigError::UnsupportedScheme { .. })));
    }
}
