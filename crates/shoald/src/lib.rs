//! shoald: the Shoal daemon.
//!
//! Assembles all Shoal subsystems in one process:
//! - State store (redb)
//! - Workload controller + work queue + process driver
//! - Health monitor
//! - Autoscaler
//! - Config propagator
//! - Ingress proxy
//! - Operator REST API

pub mod config;
pub mod daemon;

pub use config::{LogFormat, ShoaldConfig};
pub use daemon::{open_store, run};
