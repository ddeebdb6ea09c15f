//! shoal-autoscale: utilization-driven replica scaling.
//!
//! Samples Ready instances through a `MetricSource`, averages the fresh
//! samples, and writes `desiredReplicas` into the workload status. Rate
//! limits and a scale-down stabilization window prevent thrashing.
//!
//! # Scaling Algorithm
//!
//! ```text
//! average = mean(fresh utilization of Ready instances)   // none → no decision
//! target  = scaling.target_utilization
//!
//! if |average / target - 1| <= tolerance:
//!     recommended = desired
//! else:
//!     recommended = clamp(ceil(current * average / target), min, max)
//!
//! scale up:   min(recommended, ceil(base_up * (1 + scale_up_percent/100)))
//! scale down: only once now - last_scale >= stabilization window;
//!             max(recommendations in window),
//!             floored at floor(base_down * (1 - scale_down_percent/100))
//! ```
//!
//! `base_*` is the replica count at the start of the current rate-limit
//! period, reconstructed from the persisted decision log.

pub mod scaler;

pub use scaler::{Autoscaler, AutoscalerConfig, ScaleCallback, ScaleOutcome, recommend};
