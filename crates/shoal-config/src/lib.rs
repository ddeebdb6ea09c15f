//! shoal-config: configuration propagation.
//!
//! A `ConfigVersion` is a named set of key/value settings for one
//! workload. Propagating it embeds the snapshot into the workload's
//! instance template and bumps the spec generation; the workload
//! controller then rolls instances onto the new template hash.
//!
//! # Components
//!
//! - **`propagator`**: `on_config_change`, the periodic `sync` loop, and
//!   `latest_config` for admission

pub mod propagator;

pub use propagator::{
    ConfigError, ConfigPropagator, ConfigResult, PropagateOutcome, ReconcileCallback, latest_config,
};
