//! Sliding window over utilization samples.
//!
//! Keeps the latest sample per (instance, resource). Readers only get
//! samples no older than the freshness horizon they pass in; stale ones
//! are dropped on `prune`.

use std::collections::HashMap;

use shoal_state::{InstanceId, ResourceKind};

/// One observed utilization ratio.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub instance_id: InstanceId,
    pub resource_kind: ResourceKind,
    pub utilization: f64,
    /// Epoch seconds.
    pub observed_at: u64,
}

#[derive(Debug, Default)]
pub struct MetricWindow {
    latest: HashMap<(InstanceId, ResourceKind), MetricSample>,
}

impl MetricWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample, replacing an older one for the same key.
    pub fn record(&mut self, sample: MetricSample) {
        let key = (sample.instance_id.clone(), sample.resource_kind);
        match self.latest.get(&key) {
            Some(existing) if existing.observed_at > sample.observed_at => {}
            _ => {
                self.latest.insert(key, sample);
            }
        }
    }

    /// Fresh samples for the given instances, in the order given.
    ///
    /// A sample is fresh when `now - observed_at <= max_age`.
    pub fn fresh<'a>(
        &self,
        instance_ids: impl IntoIterator<Item = &'a str>,
        kind: ResourceKind,
        now: u64,
        max_age: u64,
    ) -> Vec<&MetricSample> {
        instance_ids
            .into_iter()
            .filter_map(|id| self.latest.get(&(id.to_string(), kind)))
            .filter(|s| now.saturating_sub(s.observed_at) <= max_age)
            .collect()
    }

    /// Mean utilization of the fresh samples, or `None` if there are none.
    pub fn mean<'a>(
        &self,
        instance_ids: impl IntoIterator<Item = &'a str>,
        kind: ResourceKind,
        now: u64,
        max_age: u64,
    ) -> Option<f64> {
        let fresh = self.fresh(instance_ids, kind, now, max_age);
        if fresh.is_empty() {
            return None;
        }
        Some(fresh.iter().map(|s| s.utilization).sum::<f64>() / fresh.len() as f64)
    }

    /// Drop samples older than `max_age`. Returns the number dropped.
    pub fn prune(&mut self, now: u64, max_age: u64) -> usize {
        let before = self.latest.len();
        self.latest
            .retain(|_, s| now.saturating_sub(s.observed_at) <= max_age);
        before - self.latest.len()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
