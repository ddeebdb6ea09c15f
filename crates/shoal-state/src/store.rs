//! StateStore: redb-backed state persistence for Shoal.
//!
//! Provides typed CRUD operations over workloads, status, instances,
//! config versions, routes, and scaling decisions. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone, Debug)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in ALL {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Delete every key accepted by `pred` within `prefix`. Returns the count.
    fn delete_where(
        &self,
        table: JsonTable,
        prefix: &str,
        pred: impl Fn(&str) -> bool,
    ) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in t.range(prefix..).map_err(map_err!(Read))? {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    let k = key.value();
                    if !k.starts_with(prefix) {
                        break;
                    }
                    if pred(k) {
                        keys.push(k.to_string());
                    }
                }
                keys
            };
            count = keys.len() as u32;
            for key in &keys {
                t.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert or update a workload spec without a generation check.
    pub fn put_workload(&self, spec: &WorkloadSpec) -> StateResult<()> {
        self.put_json(WORKLOADS, &spec.table_key(), spec)?;
        debug!(key = %spec.table_key(), generation = spec.generation, "workload stored");
        Ok(())
    }

    /// Write `spec` only if the stored generation equals `expected`.
    ///
    /// `expected == 0` means the workload must not exist yet. The check and
    /// the write happen in one write transaction.
    pub fn compare_and_put_workload(&self, spec: &WorkloadSpec, expected: u64) -> StateResult<()> {
        let key = spec.table_key();
        let bytes = serde_json::to_vec(spec).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            let actual = match t.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let current: WorkloadSpec =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    current.generation
                }
                None => 0,
            };
            if actual != expected {
                return Err(StateError::Conflict {
                    key,
                    expected,
                    actual,
                });
            }
            t.insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, generation = spec.generation, "workload stored (cas)");
        Ok(())
    }

    /// Get a workload by `{namespace}/{name}` key.
    pub fn get_workload(&self, key: &str) -> StateResult<Option<WorkloadSpec>> {
        self.get_json(WORKLOADS, key)
    }

    /// List all workloads.
    pub fn list_workloads(&self) -> StateResult<Vec<WorkloadSpec>> {
        self.scan_json(WORKLOADS, "")
    }

    /// Delete a workload by key. Returns true if it existed.
    pub fn delete_workload(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete_key(WORKLOADS, key)?;
        debug!(%key, existed, "workload deleted");
        Ok(existed)
    }

    // ── Status ─────────────────────────────────────────────────────

    pub fn put_status(&self, status: &WorkloadStatus) -> StateResult<()> {
        self.put_json(STATUSES, &status.workload_id, status)
    }

    pub fn get_status(&self, key: &str) -> StateResult<Option<WorkloadStatus>> {
        self.get_json(STATUSES, key)
    }

    pub fn list_statuses(&self) -> StateResult<Vec<WorkloadStatus>> {
        self.scan_json(STATUSES, "")
    }

    pub fn delete_status(&self, key: &str) -> StateResult<bool> {
        self.delete_key(STATUSES, key)
    }

    /// Atomically read, modify, and write a status record.
    ///
    /// Returns `NotFound` if no status exists for `key`.
    pub fn update_status<F>(&self, key: &str, f: F) -> StateResult<WorkloadStatus>
    where
        F: FnOnce(&mut WorkloadStatus),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let status;
        {
            let mut t = txn.open_table(STATUSES).map_err(map_err!(Table))?;
            let current: Option<WorkloadStatus> = match t.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let mut next = current.ok_or_else(|| StateError::NotFound(key.to_string()))?;
            f(&mut next);
            let bytes = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
            status = next;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(status)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put_json(INSTANCES, &instance.table_key(), instance)
    }

    /// Get an instance by its composite key.
    pub fn get_instance(&self, key: &str) -> StateResult<Option<Instance>> {
        self.get_json(INSTANCES, key)
    }

    /// List all instances for a given workload ID.
    pub fn list_instances_for_workload(&self, workload_id: &str) -> StateResult<Vec<Instance>> {
        self.scan_json(INSTANCES, &format!("{workload_id}:"))
    }

    /// List every instance record.
    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        self.scan_json(INSTANCES, "")
    }

    /// Delete an instance by key. Returns true if it existed.
    pub fn delete_instance(&self, key: &str) -> StateResult<bool> {
        self.delete_key(INSTANCES, key)
    }

    /// Delete all instances for a workload. Returns number deleted.
    pub fn delete_instances_for_workload(&self, workload_id: &str) -> StateResult<u32> {
        self.delete_where(INSTANCES, &format!("{workload_id}:"), |_| true)
    }

    // ── Config versions ────────────────────────────────────────────

    pub fn put_config(&self, config: &ConfigVersion) -> StateResult<()> {
        self.put_json(CONFIGS, &config.table_key(), config)?;
        debug!(key = %config.table_key(), version = %config.version_id, "config stored");
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> StateResult<Option<ConfigVersion>> {
        self.get_json(CONFIGS, key)
    }

    pub fn list_configs(&self) -> StateResult<Vec<ConfigVersion>> {
        self.scan_json(CONFIGS, "")
    }

    pub fn delete_config(&self, key: &str) -> StateResult<bool> {
        self.delete_key(CONFIGS, key)
    }

    // ── Routes ─────────────────────────────────────────────────────

    pub fn put_route(&self, route: &Route) -> StateResult<()> {
        self.put_json(ROUTES, &route.table_key(), route)
    }

    pub fn get_route(&self, key: &str) -> StateResult<Option<Route>> {
        self.get_json(ROUTES, key)
    }

    pub fn list_routes(&self) -> StateResult<Vec<Route>> {
        self.scan_json(ROUTES, "")
    }

    pub fn delete_route(&self, key: &str) -> StateResult<bool> {
        self.delete_key(ROUTES, key)
    }

    // ── Scaling decisions ──────────────────────────────────────────

    /// Append a decision to the log.
    pub fn append_decision(&self, decision: &ScalingDecision) -> StateResult<()> {
        self.put_json(DECISIONS, &decision.table_key(), decision)
    }

    /// Decisions for a workload made at or after `since`, oldest first.
    pub fn list_decisions(&self, workload_id: &str, since: u64) -> StateResult<Vec<ScalingDecision>> {
        let all: Vec<ScalingDecision> = self.scan_json(DECISIONS, &format!("{workload_id}:"))?;
        Ok(all.into_iter().filter(|d| d.decided_at >= since).collect())
    }

    /// Drop decisions older than `before` across all workloads.
    pub fn prune_decisions(&self, before: u64) -> StateResult<u32> {
        let pruned = self.delete_where(DECISIONS, "", |key| {
            decision_time(key).is_some_and(|t| t < before)
        })?;
        if pruned > 0 {
            debug!(pruned, before, "pruned scaling decisions");
        }
        Ok(pruned)
    }

    pub fn delete_decisions_for_workload(&self, workload_id: &str) -> StateResult<u32> {
        self.delete_where(DECISIONS, &format!("{workload_id}:"), |_| true)
    }
}

/// Extract `decided_at` from a decision key.
fn decision_time(key: &str) -> Option<u64> {
    let mut parts = key.rsplitn(3, ':');
    let _desired = parts.next()?;
    parts.next()?.parse().ok()
}
