//! Connection selection strategies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::LoadBalanceStrategy;
use upstream::UpstreamConnection;

/// Composite score used by quality-based selection and failover
/// migration: base quality, a load adjustment, and an error penalty.
pub fn connection_score(connection: &UpstreamConnection) -> i32 {
    let mut score = connection.quality();

    let subs = connection.subscription_count() as f64;
    let cap = connection.config().max_subscriptions as f64;
    if subs < cap * 0.5 {
        score += 20;
    } else if subs > cap * 0.8 {
        score -= 30;
    }

    score -= (connection.error_count() * 5).min(40);

    score.max(0)
}

/// Pick a connection from the available set under the given strategy.
/// Ties break on the set's order, which the pool keeps as insertion
/// order.
pub fn select(
    strategy: LoadBalanceStrategy,
    available: &[Arc<UpstreamConnection>],
    instrument_id: &str,
    round_robin: &AtomicUsize,
) -> Option<Arc<UpstreamConnection>> {
    if available.is_empty() {
        return None;
    }

    match strategy {
        LoadBalanceStrategy::RoundRobin => {
            let index = round_robin.fetch_add(1, Ordering::SeqCst) % available.len();
            Some(Arc::clone(&available[index]))
        }
        LoadBalanceStrategy::LeastConnections => available
            .iter()
            .min_by_key(|c| c.subscription_count())
            .map(Arc::clone),
        LoadBalanceStrategy::ConnectionQuality => select_by_score(available),
        LoadBalanceStrategy::HashBased => {
            let index = (fnv1a(instrument_id) % available.len() as u64) as usize;
            Some(Arc::clone(&available[index]))
        }
    }
}

/// Highest composite score wins; first in the set wins ties.
pub fn select_by_score(
    available: &[Arc<UpstreamConnection>],
) -> Option<Arc<UpstreamConnection>> {
    let mut best: Option<(&Arc<UpstreamConnection>, i32)> = None;
    for connection in available {
        let score = connection_score(connection);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((connection, score)),
        }
    }
    best.map(|(c, _)| Arc::clone(c))
}

/// FNV-1a. Instrument affinity must survive process restarts, so the
/// hash cannot come from `DefaultHasher`.
fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_is_stable_and_spreads() {
        assert_eq!(fnv1a("cu2501"), fnv1a("cu2501"));
        assert_ne!(fnv1a("cu2501"), fnv1a("cu2502"));
        // Known FNV-1a vector.
        assert_eq!(fnv1a(""), 0xcbf2_9ce4_8422_2325);
    }
}
