//! Health monitor: periodic probe sweep over all live instances.
//!
//! Each sweep probes every Pending/Ready instance whose backoff has
//! elapsed, concurrently, and records the results in the `HealthBook`.
//! Ready instances carry their probe result into the endpoint registry's
//! health flag. The monitor never changes Instance records; phase
//! transitions belong to the workload controller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

use shoal_proxy::EndpointRegistry;
use shoal_state::{HealthConfig, InstancePhase, StateResult, StateStore};

use crate::book::HealthBook;
use crate::checker::{ProbeResult, Prober};

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub failed: usize,
    pub pruned: usize,
}

pub struct HealthMonitor {
    state: StateStore,
    book: HealthBook,
    registry: EndpointRegistry,
    prober: Arc<dyn Prober>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        state: StateStore,
        book: HealthBook,
        registry: EndpointRegistry,
        prober: Arc<dyn Prober>,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            book,
            registry,
            prober,
            interval,
        }
    }

    /// Run sweeps until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "health monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_at(Instant::now()).await {
                        error!(error = %e, "health sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// One sweep, treating `now` as the current time for backoff.
    pub async fn sweep_at(&self, now: Instant) -> StateResult<SweepReport> {
        let configs: HashMap<String, HealthConfig> = self
            .state
            .list_workloads()?
            .into_iter()
            .map(|w| (w.id(), w.health))
            .collect();

        let instances = self.state.list_instances()?;
        let live: HashSet<String> = instances
            .iter()
            .filter(|i| i.phase.is_live())
            .map(|i| i.id.clone())
            .collect();

        let mut set = JoinSet::new();
        for instance in instances {
            if !instance.phase.is_live() || !self.book.is_due(&instance.id, now) {
                continue;
            }
            let Some(config) = configs.get(&instance.workload_id).cloned() else {
                continue;
            };
            let prober = self.prober.clone();
            set.spawn(async move {
                // Bound every probe even if the prober forgets to.
                let limit = Duration::from_secs(config.timeout_secs.max(1));
                let result = tokio::time::timeout(limit, prober.probe(&instance.address, &config))
                    .await
                    .unwrap_or(ProbeResult::Failed);
                (instance, config, result)
            });
        }

        let mut report = SweepReport::default();
        while let Some(joined) = set.join_next().await {
            let (instance, config, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "probe task failed");
                    continue;
                }
            };
            report.probed += 1;
            if !result.is_healthy() {
                report.failed += 1;
            }

            let view = self.book.record(&instance.id, &config, result, now);
            debug!(
                instance = %instance.id,
                ?result,
                failures = view.consecutive_failures,
                "probe recorded"
            );

            if instance.phase == InstancePhase::Ready {
                if result.is_healthy() {
                    self.registry.mark_healthy(&instance.id);
                } else {
                    self.registry.mark_unhealthy(&instance.id);
                }
            }
        }

        report.pruned = self.book.retain(&live);
        Ok(report)
    }
}
