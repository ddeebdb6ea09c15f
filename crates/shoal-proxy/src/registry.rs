//! Endpoint registry: the routable view of a workload's instances.
//!
//! An instance appears here only once it is Ready. Health probes flip the
//! `healthy` flag; the router only ever sees `list_healthy()`.
//!
//! The registry also owns the per-instance in-flight request counts, so
//! the component that removes an instance can wait for its leases to
//! drain after deregistering it.
//!
//! Every mutation builds a fresh map and swaps it in under the write lock
//! (copy-on-write), so readers holding a snapshot see one consistent
//! point-in-time set and never a half-applied update.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use shoal_state::{InstanceId, WorkloadId};

use crate::balancer::InflightCounts;

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// A routable, health-flagged address for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub address: String,
    pub healthy: bool,
}

/// Immutable point-in-time view of the registry.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    version: u64,
    endpoints: BTreeMap<InstanceId, Endpoint>,
}

impl RegistrySnapshot {
    /// Monotonic version, bumped on every effective mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Healthy endpoints of a workload, ordered by instance id.
    pub fn healthy(&self, workload_id: &str) -> Vec<Endpoint> {
        self.endpoints
            .values()
            .filter(|e| e.healthy && e.workload_id == workload_id)
            .cloned()
            .collect()
    }

    /// All endpoints of a workload, healthy or not.
    pub fn for_workload(&self, workload_id: &str) -> Vec<Endpoint> {
        self.endpoints
            .values()
            .filter(|e| e.workload_id == workload_id)
            .cloned()
            .collect()
    }

    pub fn get(&self, instance_id: &str) -> Option<&Endpoint> {
        self.endpoints.get(instance_id)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Shared, concurrently mutated endpoint set.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    current: Arc<RwLock<Arc<RegistrySnapshot>>>,
    inflight: Arc<InflightCounts>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to a copy of the endpoint map and publish it if it changed.
    fn mutate<R>(&self, f: impl FnOnce(&mut BTreeMap<InstanceId, Endpoint>) -> (R, bool)) -> R {
        let mut current = self.current.write().expect("registry lock");
        let mut endpoints = current.endpoints.clone();
        let (result, changed) = f(&mut endpoints);
        if changed {
            *current = Arc::new(RegistrySnapshot {
                version: current.version + 1,
                endpoints,
            });
        }
        result
    }

    /// Register a Ready instance as a healthy endpoint.
    ///
    /// Re-registering an existing instance replaces its address and
    /// resets it to healthy.
    pub fn register(&self, workload_id: &str, instance_id: &str, address: &str) {
        let endpoint = Endpoint {
            instance_id: instance_id.to_string(),
            workload_id: workload_id.to_string(),
            address: address.to_string(),
            healthy: true,
        };
        self.mutate(|map| {
            let changed = map.get(instance_id) != Some(&endpoint);
            map.insert(instance_id.to_string(), endpoint);
            ((), changed)
        });
        debug!(workload = workload_id, instance = instance_id, address, "endpoint registered");
    }

    /// Remove an endpoint. Returns it if it was registered.
    pub fn deregister(&self, instance_id: &str) -> Option<Endpoint> {
        let removed = self.mutate(|map| {
            let removed = map.remove(instance_id);
            let changed = removed.is_some();
            (removed, changed)
        });
        if removed.is_some() {
            debug!(instance = instance_id, "endpoint deregistered");
        }
        removed
    }

    /// Flag an endpoint healthy. Returns true if the flag changed.
    pub fn mark_healthy(&self, instance_id: &str) -> bool {
        self.set_health(instance_id, true)
    }

    /// Flag an endpoint unhealthy. Returns true if the flag changed.
    pub fn mark_unhealthy(&self, instance_id: &str) -> bool {
        self.set_health(instance_id, false)
    }

    fn set_health(&self, instance_id: &str, healthy: bool) -> bool {
        {
            // Fast path: nothing to do, skip the copy.
            let current = self.current.read().expect("registry lock");
            match current.endpoints.get(instance_id) {
                Some(e) if e.healthy != healthy => {}
                _ => return false,
            }
        }
        let changed = self.mutate(|map| match map.get_mut(instance_id) {
            Some(e) if e.healthy != healthy => {
                e.healthy = healthy;
                (true, true)
            }
            _ => (false, false),
        });
        if changed {
            debug!(instance = instance_id, healthy, "endpoint health changed");
        }
        changed
    }

    /// Healthy endpoints of a workload at this instant.
    pub fn list_healthy(&self, workload_id: &str) -> Vec<Endpoint> {
        self.snapshot().healthy(workload_id)
    }

    pub fn get(&self, instance_id: &str) -> Option<Endpoint> {
        self.snapshot().get(instance_id).cloned()
    }

    /// Current snapshot; cheap (one `Arc` clone).
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().expect("registry lock").clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    /// Requests currently leased against an instance.
    pub fn inflight(&self, instance_id: &str) -> usize {
        self.inflight.get(instance_id)
    }

    pub(crate) fn inflight_counts(&self) -> &Arc<InflightCounts> {
        &self.inflight
    }

    /// Wait until no request is leased against `instance_id`.
    ///
    /// Returns false if leases were still outstanding after `timeout`.
    pub async fn drain(&self, instance_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let outstanding = self.inflight(instance_id);
            if outstanding == 0 {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(instance = instance_id, outstanding, "drain timed out");
                return false;
            }
            tokio::time::sleep(DRAIN_POLL.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_list_healthy() {
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-1.default", "127.0.0.1:9001");
        registry.register("default/web", "web-0.default", "127.0.0.1:9000");
        registry.register("default/api", "api-0.default", "127.0.0.1:9100");

        let healthy = registry.list_healthy("default/web");
        assert_eq!(healthy.len(), 2);
        // Ordered by instance id.
        assert_eq!(healthy[0].instance_id, "web-0.default");
        assert_eq!(healthy[1].instance_id, "web-1.default");
    }

    #[test]
    fn unhealthy_endpoints_are_hidden() {
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", "127.0.0.1:9000");

        assert!(registry.mark_unhealthy("web-0.default"));
        assert!(!registry.mark_unhealthy("web-0.default"));
        assert!(registry.list_healthy("default/web").is_empty());
        assert!(registry.get("web-0.default").is_some());

        assert!(registry.mark_healthy("web-0.default"));
        assert_eq!(registry.list_healthy("default/web").len(), 1);
    }

    #[test]
    fn deregister_removes_endpoint() {
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", "127.0.0.1:9000");

        let removed = registry.deregister("web-0.default").unwrap();
        assert_eq!(removed.address, "127.0.0.1:9000");
        assert!(registry.deregister("web-0.default").is_none());
        assert!(registry.list_healthy("default/web").is_empty());
    }

    #[test]
    fn marking_unknown_instance_is_noop() {
        let registry = EndpointRegistry::new();
        assert!(!registry.mark_unhealthy("ghost"));
        assert!(!registry.mark_healthy("ghost"));
        assert_eq!(registry.version(), 0);
    }

    #[test]
    fn snapshots_are_stable_across_mutation() {
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", "127.0.0.1:9000");
        let before = registry.snapshot();

        registry.register("default/web", "web-1.default", "127.0.0.1:9001");
        registry.mark_unhealthy("web-0.default");

        // The old snapshot still shows the old world.
        assert_eq!(before.healthy("default/web").len(), 1);
        assert_eq!(before.version(), 1);
        assert_eq!(registry.snapshot().healthy("default/web").len(), 1);
        assert_eq!(registry.version(), 3);
    }

    #[test]
    fn version_only_moves_on_change() {
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", "127.0.0.1:9000");
        registry.register("default/web", "web-0.default", "127.0.0.1:9000");
        assert_eq!(registry.version(), 1);
    }

    #[tokio::test]
    async fn drain_waits_for_release() {
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", "127.0.0.1:9000");
        registry.inflight_counts().acquire("web-0.default");
        registry.deregister("web-0.default");

        let counts = registry.inflight_counts().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            counts.release("web-0.default");
        });

        let started = tokio::time::Instant::now();
        assert!(registry.drain("web-0.default", Duration::from_secs(5)).await);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(registry.inflight("web-0.default"), 0);
    }

    #[tokio::test]
    async fn drain_gives_up_after_timeout() {
        let registry = EndpointRegistry::new();
        registry.inflight_counts().acquire("web-0.default");

        assert!(!registry.drain("web-0.default", Duration::from_millis(50)).await);
        assert_eq!(registry.inflight("web-0.default"), 1);
        // Nothing leased: returns at once.
        assert!(registry.drain("web-1.default", Duration::ZERO).await);
    }

    #[test]
    fn concurrent_readers_see_whole_sets() {
        use std::thread;

        let registry = EndpointRegistry::new();
        let writer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let id = format!("web-{i}.default");
                    registry.register("default/web", &id, "127.0.0.1:9000");
                }
            })
        };

        let mut last = 0;
        for _ in 0..200 {
            let snap = registry.snapshot();
            // Versions never go backwards and match the set size.
            assert!(snap.version() >= last);
            assert_eq!(snap.len() as u64, snap.version());
            last = snap.version();
        }
        writer.join().unwrap();
        assert_eq!(registry.list_healthy("default/web").len(), 200);
    }
}
