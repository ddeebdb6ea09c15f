//! Service routing: resolves a workload to one healthy endpoint.
//!
//! The router keeps no endpoint state of its own: every call reads the
//! registry's current snapshot, so a deregistered or unhealthy instance
//! is never selected after the registry change is published.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::balancer::{BalanceStrategy, InflightCounts, RoundRobinBalancer};
use crate::error::{RouteError, RouteResult};
use crate::registry::{Endpoint, EndpointRegistry};

/// A selected endpoint. Counts as one outstanding request until dropped.
pub struct Lease {
    endpoint: Endpoint,
    inflight: Arc<InflightCounts>,
}

impl Lease {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inflight.release(&self.endpoint.instance_id);
    }
}

/// Routes requests for a workload to its healthy endpoints.
pub struct ServiceRouter {
    registry: EndpointRegistry,
    strategy: BalanceStrategy,
    cursors: RwLock<HashMap<String, Arc<RoundRobinBalancer>>>,
}

impl ServiceRouter {
    pub fn new(registry: EndpointRegistry, strategy: BalanceStrategy) -> Self {
        Self {
            registry,
            strategy,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    /// Select an endpoint for `workload_id`.
    ///
    /// Fails with `ServiceUnavailable` when the workload has no healthy
    /// endpoint at this instant.
    pub fn route(&self, workload_id: &str) -> RouteResult<Lease> {
        let healthy = self.registry.list_healthy(workload_id);
        let inflight = self.registry.inflight_counts();
        let idx = match self.strategy {
            BalanceStrategy::RoundRobin => {
                let idx = self.cursor(workload_id).next(healthy.len());
                if let Some(i) = idx {
                    inflight.acquire(&healthy[i].instance_id);
                }
                idx
            }
            BalanceStrategy::LeastConnections => inflight.acquire_least(&healthy),
        };
        let Some(idx) = idx else {
            debug!(workload = workload_id, "no healthy endpoints");
            return Err(RouteError::ServiceUnavailable(workload_id.to_string()));
        };
        let endpoint = healthy[idx].clone();
        Ok(Lease {
            endpoint,
            inflight: inflight.clone(),
        })
    }

    /// Drop the round-robin cursor of a deleted workload.
    pub fn forget_workload(&self, workload_id: &str) -> bool {
        let removed = self
            .cursors
            .write()
            .expect("cursors lock")
            .remove(workload_id)
            .is_some();
        if removed {
            debug!(workload = workload_id, "balancer cursor dropped");
        }
        removed
    }

    fn cursor(&self, workload_id: &str) -> Arc<RoundRobinBalancer> {
        if let Some(c) = self.cursors.read().expect("cursors lock").get(workload_id) {
            return c.clone();
        }
        self.cursors
            .write()
            .expect("cursors lock")
            .entry(workload_id.to_string())
            .or_default()
            .clone()
    }
}
