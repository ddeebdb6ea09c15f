//! shoal-controller: drives each workload toward its desired state.
//!
//! Reads `WorkloadSpec` and `WorkloadStatus` from `shoal-state`, starts and
//! stops instances through an `InstanceDriver`, and keeps the endpoint
//! registry in step with instance readiness.
//!
//! # Architecture
//!
//! ```text
//! ControllerRunner
//!   ├── resync ticker ──► WorkQueue (coalescing, one worker per key)
//!   └── workers ──► WorkloadController::reconcile
//!         ├── StateStore       (spec, status, instance records)
//!         ├── HealthBook       (Pending → Ready, Ready → Failed)
//!         ├── EndpointRegistry (register on Ready, deregister first on removal)
//!         └── InstanceDriver   (ProcessDriver: local child processes)
//! ```
//!
//! Rollouts replace instances whose template hash differs from the spec's,
//! keeping Ready ≥ target − maxUnavailable and live ≤ target + maxSurge.
//! Repeated creation failures mark the workload `Degraded` and halt
//! creation until a retry period passes or a new generation is applied.

pub mod controller;
pub mod driver;
pub mod error;
pub mod queue;
pub mod runner;

pub use controller::{ControllerConfig, WorkloadController};
pub use driver::{CreateRequest, DriverError, DriverFuture, InstanceDriver, Launched, ProcessDriver};
pub use error::{ControllerError, ControllerResult};
pub use queue::WorkQueue;
pub use runner::ControllerRunner;
