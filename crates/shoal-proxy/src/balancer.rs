//! Endpoint selection strategies.
//!
//! `RoundRobinBalancer` cycles an atomic counter over the current pool.
//! `InflightCounts` tracks outstanding requests per instance for the
//! least-connections strategy.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::registry::Endpoint;

/// How the service router picks among healthy endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
}

/// A round-robin balancer selecting indices into an endpoint list.
///
/// Lock-free; the counter wraps modulo the pool size at each call, so the
/// pool may grow or shrink between selections.
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Select the next index, wrapping around `count`.
    ///
    /// Returns `None` if count is zero.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(idx % count)
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

/// Outstanding request counts keyed by instance id.
#[derive(Default)]
pub struct InflightCounts {
    counts: Mutex<HashMap<String, usize>>,
}

impl InflightCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the endpoint with the fewest outstanding requests and count
    /// one more against it. Ties go to the first in list order.
    pub fn acquire_least(&self, endpoints: &[Endpoint]) -> Option<usize> {
        let mut counts = self.counts.lock().expect("inflight lock");
        let idx = endpoints
            .iter()
            .enumerate()
            .min_by_key(|(i, e)| (counts.get(&e.instance_id).copied().unwrap_or(0), *i))
            .map(|(i, _)| i)?;
        *counts.entry(endpoints[idx].instance_id.clone()).or_insert(0) += 1;
        Some(idx)
    }

    /// Count one more request against an instance.
    pub fn acquire(&self, instance_id: &str) {
        let mut counts = self.counts.lock().expect("inflight lock");
        *counts.entry(instance_id.to_string()).or_insert(0) += 1;
    }

    /// Release one outstanding request.
    pub fn release(&self, instance_id: &str) {
        let mut counts = self.counts.lock().expect("inflight lock");
        if let Some(n) = counts.get_mut(instance_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counts.remove(instance_id);
            }
        }
    }

    pub fn get(&self, instance_id: &str) -> usize {
        self.counts
            .lock()
            .expect("inflight lock")
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(id: &str) -> Endpoint {
        Endpoint {
            instance_id: id.to_string(),
            workload_id: "default/web".to_string(),
            address: "127.0.0.1:9000".to_string(),
            healthy: true,
        }
    }

    #[test]
    fn round_robin_cycles_through_indices() {
        let lb = RoundRobinBalancer::new();

        assert_eq!(lb.next(3), Some(0));
        assert_eq!(lb.next(3), Some(1));
        assert_eq!(lb.next(3), Some(2));
        assert_eq!(lb.next(3), Some(0)); // wraps
    }

    #[test]
    fn round_robin_zero_count_returns_none() {
        let lb = RoundRobinBalancer::new();
        assert_eq!(lb.next(0), None);
    }

    #[test]
    fn round_robin_adapts_to_changing_pool_size() {
        let lb = RoundRobinBalancer::new();
        assert_eq!(lb.next(2), Some(0));
        assert_eq!(lb.next(2), Some(1));
        assert_eq!(lb.next(4), Some(2));
        assert_eq!(lb.next(1), Some(0));
    }

    #[test]
    fn least_connections_prefers_idle_endpoint() {
        let counts = InflightCounts::new();
        let pool = vec![ep("a"), ep("b"), ep("c")];

        assert_eq!(counts.acquire_least(&pool), Some(0));
        assert_eq!(counts.acquire_least(&pool), Some(1));
        assert_eq!(counts.acquire_least(&pool), Some(2));

        counts.release("b");
        assert_eq!(counts.acquire_least(&pool), Some(1));
        assert_eq!(counts.get("b"), 1);
    }

    #[test]
    fn least_connections_empty_pool() {
        let counts = InflightCounts::new();
        assert_eq!(counts.acquire_least(&[]), None);
    }

    #[test]
    fn release_never_underflows() {
        let counts = InflightCounts::new();
        counts.release("ghost");
        counts.acquire("a");
        counts.release("a");
        counts.release("a");
        assert_eq!(counts.get("a"), 0);
    }
}
