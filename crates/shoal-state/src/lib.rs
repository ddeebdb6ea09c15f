//! shoal-state: embedded state store for Shoal.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for workload specs and status, instance records, config versions,
//! ingress routes, and the scaling decision log.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{namespace}/{name}`, `{workload_id}:{child}`) enable
//! prefix scans for related records.
//!
//! Status is changed through [`StateStore::update_status`], a read-modify-write
//! inside one write transaction. redb serializes write transactions, so the
//! controller and the autoscaler never lose each other's fields. Spec updates
//! go through [`StateStore::compare_and_put_workload`], which rejects stale
//! generations with [`StateError::Conflict`].
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod template;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use template::template_hash;
pub use types::*;

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
