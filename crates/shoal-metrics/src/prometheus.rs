//! Prometheus text exposition format.
//!
//! Renders workload status into gauges for scraping by a Prometheus
//! server or compatible agent.

use std::fmt::Write;

use shoal_state::WorkloadStatus;

type Gauge = (&'static str, &'static str, fn(&WorkloadStatus) -> u64);

const GAUGES: [Gauge; 7] = [
    (
        "shoal_desired_replicas",
        "Replica count chosen by the autoscaler.",
        |s| s.desired_replicas as u64,
    ),
    (
        "shoal_current_replicas",
        "Live (pending + ready) instances.",
        |s| s.current_replicas as u64,
    ),
    (
        "shoal_ready_replicas",
        "Ready instances.",
        |s| s.ready_replicas as u64,
    ),
    (
        "shoal_updated_replicas",
        "Ready instances on the current template.",
        |s| s.updated_replicas as u64,
    ),
    (
        "shoal_observed_generation",
        "Last spec generation fully rolled out.",
        |s| s.observed_generation,
    ),
    (
        "shoal_consecutive_create_failures",
        "Instance creations failed in a row.",
        |s| s.consecutive_create_failures as u64,
    ),
    (
        "shoal_degraded",
        "1 if the workload is degraded.",
        |s| s.is_degraded() as u64,
    ),
];

/// Render workload statuses into Prometheus text format.
///
/// Every metric is a GAUGE with a `workload` label.
pub fn render_prometheus(statuses: &[WorkloadStatus]) -> String {
    let mut out = String::new();

    for (name, help, value) in GAUGES {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} gauge");
        for s in statuses {
            let _ = writeln!(
                out,
                "{name}{{workload=\"{}\"}} {}",
                escape_label(&s.workload_id),
                value(s)
            );
        }
    }

    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
