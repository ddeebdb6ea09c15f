//! Shared per-instance probe results.
//!
//! Written by the `HealthMonitor`, read by the workload controller when it
//! decides Pending → Ready and Ready → Failed transitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::time::Instant;

use shoal_state::{HealthConfig, InstanceId};

use crate::checker::{HealthStatus, HealthTracker, ProbeResult};

/// Read-only view of one instance's tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthView {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_result: ProbeResult,
}

impl HealthView {
    /// At least one probe has passed and none failed since.
    pub fn is_passing(&self) -> bool {
        self.last_result.is_healthy()
    }
}

#[derive(Debug)]
struct Entry {
    tracker: HealthTracker,
    last_result: ProbeResult,
    next_due: Instant,
}

#[derive(Clone, Default)]
pub struct HealthBook {
    entries: Arc<RwLock<HashMap<InstanceId, Entry>>>,
}

impl HealthBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a probe result and schedule the next probe after the
    /// tracker's backoff.
    pub fn record(
        &self,
        instance_id: &str,
        config: &HealthConfig,
        result: ProbeResult,
        now: Instant,
    ) -> HealthView {
        let mut entries = self.entries.write().expect("health book lock");
        let entry = entries
            .entry(instance_id.to_string())
            .or_insert_with(|| Entry {
                tracker: HealthTracker::new(config),
                last_result: result,
                next_due: now,
            });
        entry.tracker.record(result);
        entry.last_result = result;
        entry.next_due = now + entry.tracker.next_interval();
        view(entry)
    }

    pub fn view(&self, instance_id: &str) -> Option<HealthView> {
        self.entries
            .read()
            .expect("health book lock")
            .get(instance_id)
            .map(view)
    }

    /// Whether the instance should be probed at `now`. Unknown instances
    /// are always due.
    pub fn is_due(&self, instance_id: &str, now: Instant) -> bool {
        self.entries
            .read()
            .expect("health book lock")
            .get(instance_id)
            .is_none_or(|e| e.next_due <= now)
    }

    pub fn forget(&self, instance_id: &str) {
        self.entries
            .write()
            .expect("health book lock")
            .remove(instance_id);
    }

    /// Drop entries for instances not in `live`. Returns the number dropped.
    pub fn retain(&self, live: &HashSet<InstanceId>) -> usize {
        let mut entries = self.entries.write().expect("health book lock");
        let before = entries.len();
        entries.retain(|id, _| live.contains(id));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("health book lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn view(entry: &Entry) -> HealthView {
    HealthView {
        status: entry.tracker.status(),
        consecutive_failures: entry.tracker.consecutive_failures(),
        consecutive_successes: entry.tracker.consecutive_successes(),
        last_result: entry.last_result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn records_accumulate_per_instance() {
        let book = HealthBook::new();
        let config = HealthConfig::default();
        let now = Instant::now();

        book.record("a", &config, ProbeResult::Healthy, now);
        book.record("a", &config, ProbeResult::Failed, now);
        let view = book.record("a", &config, ProbeResult::Failed, now);

        assert_eq!(view.consecutive_failures, 2);
        assert_eq!(view.status, HealthStatus::Healthy);
        assert!(!view.is_passing());

        let view = book.record("a", &config, ProbeResult::Failed, now);
        assert_eq!(view.status, HealthStatus::Unhealthy);
        assert!(book.view("b").is_none());
    }

    #[test]
    fn due_time_follows_backoff() {
        let book = HealthBook::new();
        let config = HealthConfig {
            interval_secs: 5,
            ..HealthConfig::default()
        };
        let now = Instant::now();
        assert!(book.is_due("a", now));

        book.record("a", &config, ProbeResult::Healthy, now);
        assert!(!book.is_due("a", now + Duration::from_secs(4)));
        assert!(book.is_due("a", now + Duration::from_secs(5)));

        // A failure doubles the wait.
        book.record("a", &config, ProbeResult::Failed, now);
        assert!(!book.is_due("a", now + Duration::from_secs(9)));
        assert!(book.is_due("a", now + Duration::from_secs(10)));
    }

    #[test]
    fn retain_prunes_vanished_instances() {
        let book = HealthBook::new();
        let config = HealthConfig::default();
        let now = Instant::now();
        book.record("a", &config, ProbeResult::Healthy, now);
        book.record("b", &config, ProbeResult::Healthy, now);

        let live: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(book.retain(&live), 1);
        assert_eq!(book.len(), 1);

        book.forget("a");
        assert!(book.is_empty());
    }
}
