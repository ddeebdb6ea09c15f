//! redb table definitions for the Shoal state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Namespaced objects are keyed `{namespace}/{name}`; children are keyed
//! `{workload_id}:{child}` so a prefix range yields all children of a workload.

use redb::TableDefinition;

/// Shape shared by every table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Workload specs keyed by `{namespace}/{name}`.
pub const WORKLOADS: JsonTable = TableDefinition::new("workloads");

/// Workload status keyed by `{namespace}/{name}`.
pub const STATUSES: JsonTable = TableDefinition::new("statuses");

/// Instance records keyed by `{workload_id}:{instance_id}`.
pub const INSTANCES: JsonTable = TableDefinition::new("instances");

/// Config versions keyed by `{namespace}/{name}`.
pub const CONFIGS: JsonTable = TableDefinition::new("configs");

/// Ingress routes keyed by `{namespace}/{name}`.
pub const ROUTES: JsonTable = TableDefinition::new("routes");

/// Scaling decisions keyed by `{workload_id}:{decided_at:020}:{desired:010}`.
pub const DECISIONS: JsonTable = TableDefinition::new("decisions");

pub(crate) const ALL: [JsonTable; 6] = [WORKLOADS, STATUSES, INSTANCES, CONFIGS, ROUTES, DECISIONS];
