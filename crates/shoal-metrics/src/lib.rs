//! shoal-metrics: utilization observation for autoscaling.
//!
//! Provides the capability interface the autoscaler reads utilization
//! through, an HTTP implementation that scrapes each instance's
//! Prometheus endpoint, a freshness window over collected samples, and
//! Prometheus text exposition of workload status.
//!
//! # Architecture
//!
//! ```text
//! MetricSource (trait)
//!   └── HttpMetricSource ── GET http://{instance}/metrics
//!
//! fetch_all() ── parallel get_utilization() with per-call timeout
//!   └── MetricWindow::record() → fresh() → Autoscaler
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod error;
pub mod prometheus;
pub mod source;
pub mod window;

pub use error::MetricError;
pub use prometheus::render_prometheus;
pub use source::{HttpMetricSource, MetricFuture, MetricSource, fetch_all, parse_gauge};
pub use window::{MetricSample, MetricWindow};
