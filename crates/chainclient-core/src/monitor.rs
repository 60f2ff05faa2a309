//! Background liveness monitor.
//!
//! Every poll interval the monitor probes each serving primary with
//! `eth_blockNumber`, moves primaries between `Alive` and `OutOfSync` based on
//! how far they trail the best observed head, and redials unreachable
//! endpoints once their backoff has elapsed.

use std::sync::Weak;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::endpoint::EndpointState;
use crate::pool::PoolInner;

/// The state a serving primary should be in given its height, the best height
/// in the pool and the lag threshold. A threshold of zero disables the check.
pub fn sync_transition(
    state: EndpointState,
    latest: u64,
    best: u64,
    threshold: u64,
) -> EndpointState {
    let behind = threshold != 0 && best.saturating_sub(latest) > threshold;
    match state {
        EndpointState::Alive if behind => EndpointState::OutOfSync,
        EndpointState::OutOfSync if !behind => EndpointState::Alive,
        other => other,
    }
}

pub(crate) fn spawn(
    pool: Weak<PoolInner>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately and the pool was just dialed
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = pool.upgrade() else { break };
                    if inner.is_closed() {
                        break;
                    }
                    check(&inner, Instant::now()).await;
                }
            }
        }
        tracing::debug!("liveness monitor stopped");
    })
}

/// One monitor pass.
pub(crate) async fn check(pool: &PoolInner, now: Instant) {
    if pool.is_closed() {
        return;
    }
    let timeout = pool.config.query_timeout;

    let serving: Vec<_> = pool
        .primaries
        .iter()
        .filter(|p| {
            matches!(
                p.state(),
                EndpointState::Alive | EndpointState::OutOfSync
            )
        })
        .collect();
    let probes = join_all(serving.iter().map(|p| p.block_number(timeout))).await;

    let mut heights = Vec::with_capacity(serving.len());
    for (ep, probe) in serving.into_iter().zip(probes) {
        match probe {
            Ok(height) => {
                ep.set_latest_block(height);
                heights.push((ep, height));
            }
            Err(e) => {
                if ep.transition(EndpointState::Unreachable) {
                    tracing::warn!(endpoint = %ep.name(), error = %e, "liveness probe failed, endpoint unreachable");
                    pool.schedule_redial(ep);
                }
            }
        }
    }

    if let Some(best) = heights.iter().map(|(_, h)| *h).max() {
        for (ep, height) in heights {
            let from = ep.state();
            let to = sync_transition(from, height, best, pool.config.sync_threshold);
            if to != from && ep.transition(to) {
                match to {
                    EndpointState::OutOfSync => tracing::warn!(
                        endpoint = %ep.name(),
                        height,
                        best,
                        "endpoint out of sync"
                    ),
                    _ => tracing::info!(endpoint = %ep.name(), height, best, "endpoint back in sync"),
                }
            }
        }
    }

    let due: Vec<_> = pool.cores().filter(|c| c.redial_due(now)).collect();
    if !due.is_empty() {
        tracing::debug!(count = due.len(), "redialing unreachable endpoints");
        join_all(due.into_iter().map(|c| pool.dial_endpoint(c))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EndpointState::*;

    #[test]
    fn falls_out_of_sync_beyond_threshold() {
        assert_eq!(sync_transition(Alive, 100, 110, 10), Alive);
        assert_eq!(sync_transition(Alive, 99, 110, 10), OutOfSync);
    }

    #[test]
    fn recovers_within_threshold() {
        assert_eq!(sync_transition(OutOfSync, 105, 110, 10), Alive);
        assert_eq!(sync_transition(OutOfSync, 50, 110, 10), OutOfSync);
    }

    #[test]
    fn zero_threshold_disables_detection() {
        assert_eq!(sync_transition(Alive, 0, 1_000_000, 0), Alive);
        assert_eq!(sync_transition(OutOfSync, 0, 1_000_000, 0), Alive);
    }

    #[test]
    fn other_states_untouched() {
        assert_eq!(sync_transition(Unreachable, 0, 100, 10), Unreachable);
        assert_eq!(sync_transition(Invalid, 100, 100, 10), Invalid);
    }
}
