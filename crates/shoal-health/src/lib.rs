//! shoal-health: health probing for workload instances.
//!
//! Provides the probe capability interface, an HTTP prober, per-instance
//! trackers with thresholds and exponential backoff, and the periodic
//! sweep that keeps the endpoint registry's health flags current.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (one sweep per interval)
//!   ├── Prober::probe() for every due Pending/Ready instance, concurrently
//!   ├── HealthBook::record() → HealthTracker (consecutive failures, backoff)
//!   └── EndpointRegistry::mark_healthy() / mark_unhealthy() for Ready ones
//!
//! WorkloadController
//!   └── HealthBook::view() → Pending → Ready, Ready → Failed
//! ```
//!
//! Exponential backoff (interval → 60s) prevents hammering failing
//! instances. A single successful probe resets the backoff.

pub mod book;
pub mod checker;
pub mod monitor;

pub use book::{HealthBook, HealthView};
pub use checker::{HealthStatus, HealthTracker, HttpProber, ProbeFuture, ProbeResult, Prober, http_probe};
pub use monitor::{HealthMonitor, SweepReport};
