//! Operator surface: apply, get, describe, delete, list, watch.
//!
//! Every mutating call validates first, so a rejected object leaves stored
//! state untouched. Workload updates are compare-and-swap on `generation`.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use shoal_config::{ConfigPropagator, PropagateOutcome, latest_config};
use shoal_controller::WorkQueue;
use shoal_proxy::Ingress;
use shoal_state::{ConfigVersion, Route, StateStore, WorkloadSpec, WorkloadStatus, epoch_secs};

use crate::error::{OperatorError, OperatorResult};
use crate::object::{
    ApplyOutcome, ApplyResult, ConfigDescription, Object, ObjectKind, RouteDescription, WatchEvent,
    WorkloadDescription, WorkloadView,
};

/// How often a watch re-reads the object.
const WATCH_POLL: Duration = Duration::from_millis(100);
/// Upper bound on one watch call.
pub const MAX_WATCH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct Operator {
    store: StateStore,
    queue: Arc<WorkQueue>,
    ingress: Arc<Ingress>,
    propagator: Arc<ConfigPropagator>,
}

impl Operator {
    pub fn new(store: StateStore, queue: Arc<WorkQueue>, ingress: Arc<Ingress>) -> Self {
        let enqueue = queue.clone();
        let propagator = ConfigPropagator::new(store.clone())
            .with_reconcile_fn(Box::new(move |id| enqueue.add(id)));
        Self {
            store,
            queue,
            ingress,
            propagator: Arc::new(propagator),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── apply ─────────────────────────────────────────────────────

    pub fn apply(&self, object: Object) -> OperatorResult<ApplyResult> {
        let kind = object.kind();
        let key = object.key();
        let (outcome, generation) = match object {
            Object::Workload(spec) => {
                let (outcome, generation) = self.apply_workload(spec)?;
                (outcome, Some(generation))
            }
            Object::Config(config) => (self.apply_config(config)?, None),
            Object::Route(route) => (self.apply_route(route)?, None),
        };
        info!(%kind, %key, ?outcome, "object applied");
        Ok(ApplyResult {
            kind,
            key,
            outcome,
            generation,
        })
    }

    fn apply_workload(&self, mut spec: WorkloadSpec) -> OperatorResult<(ApplyOutcome, u64)> {
        spec.validate()?;
        let id = spec.id();

        // The config propagator owns the embedded snapshot.
        if spec.template.config.is_none() {
            spec.template.config = latest_config(&self.store, &id)?.map(|c| c.applied());
        }
        spec.refresh_template_hash();

        let expected = spec.generation;
        let now = epoch_secs();
        let outcome = match self.store.get_workload(&id)? {
            None => {
                if expected != 0 {
                    return Err(OperatorError::Conflict(format!(
                        "{id} does not exist; generation {expected} is stale"
                    )));
                }
                spec.generation = 1;
                spec.created_at = now;
                spec.updated_at = now;
                self.store.compare_and_put_workload(&spec, 0)?;
                if self.store.get_status(&id)?.is_none() {
                    self.store.put_status(&WorkloadStatus::initial(&spec))?;
                }
                ApplyOutcome::Created
            }
            Some(current) => {
                if expected != 0 && expected != current.generation {
                    return Err(OperatorError::Conflict(format!(
                        "{id} is at generation {}, not {expected}",
                        current.generation
                    )));
                }
                if current.same_declaration(&spec) {
                    return Ok((ApplyOutcome::Unchanged, current.generation));
                }
                spec.generation = current.generation + 1;
                spec.created_at = current.created_at;
                spec.updated_at = now;
                self.store.compare_and_put_workload(&spec, current.generation)?;
                ApplyOutcome::Updated
            }
        };

        self.queue.add(&id);
        Ok((outcome, spec.generation))
    }

    fn apply_config(&self, mut config: ConfigVersion) -> OperatorResult<ApplyOutcome> {
        config.validate()?;
        let existing = self.store.get_config(&config.table_key())?;
        let outcome = match &existing {
            Some(cur)
                if cur.workload == config.workload
                    && cur.version_id == config.version_id
                    && cur.data == config.data =>
            {
                ApplyOutcome::Unchanged
            }
            Some(_) => ApplyOutcome::Updated,
            None => ApplyOutcome::Created,
        };

        if outcome == ApplyOutcome::Unchanged {
            return Ok(outcome);
        }
        if config.created_at == 0 {
            config.created_at = epoch_secs();
        }
        self.store.put_config(&config)?;

        match self.propagator.on_config_change(&config)? {
            PropagateOutcome::Applied { generation, .. } => {
                debug!(config = %config.table_key(), generation, "config rolled into workload");
            }
            PropagateOutcome::WorkloadMissing => {
                debug!(config = %config.table_key(), "config stored; workload missing");
            }
            PropagateOutcome::Unchanged => {}
        }
        Ok(outcome)
    }

    fn apply_route(&self, route: Route) -> OperatorResult<ApplyOutcome> {
        route.validate()?;
        let outcome = match self.store.get_route(&route.table_key())? {
            Some(cur) if cur == route => ApplyOutcome::Unchanged,
            Some(_) => ApplyOutcome::Updated,
            None => ApplyOutcome::Created,
        };
        if outcome != ApplyOutcome::Unchanged {
            self.store.put_route(&route)?;
            self.reload_routes()?;
        }
        Ok(outcome)
    }

    /// Rebuild the ingress table from stored routes.
    pub fn reload_routes(&self) -> OperatorResult<usize> {
        let routes = self.store.list_routes()?;
        self.ingress.reload(&routes);
        Ok(routes.len())
    }

    // ── read ──────────────────────────────────────────────────────

    pub fn get(&self, kind: ObjectKind, key: &str) -> OperatorResult<serde_json::Value> {
        match kind {
            ObjectKind::Workload => {
                let spec = self.workload(key)?;
                let status = self.store.get_status(key)?;
                to_value(&WorkloadView { spec, status })
            }
            ObjectKind::Config => to_value(&self.config(key)?),
            ObjectKind::Route => to_value(&self.route(key)?),
        }
    }

    pub fn describe(&self, kind: ObjectKind, key: &str) -> OperatorResult<serde_json::Value> {
        match kind {
            ObjectKind::Workload => {
                let spec = self.workload(key)?;
                let status = self.store.get_status(key)?;
                let mut instances = self.store.list_instances_for_workload(key)?;
                instances.sort_by_key(|i| i.ordinal);
                let endpoints = self.ingress.router().registry().snapshot().for_workload(key);
                let mut decisions = self.store.list_decisions(key, 0)?;
                decisions.reverse();
                decisions.truncate(20);
                to_value(&WorkloadDescription {
                    spec,
                    status,
                    instances,
                    endpoints,
                    decisions,
                })
            }
            ObjectKind::Config => {
                let config = self.config(key)?;
                let workload = self.store.get_workload(&config.workload_id())?;
                let applied = workload
                    .as_ref()
                    .and_then(|w| w.template.config.as_ref())
                    .is_some_and(|a| a.name == config.name && a.version_id == config.version_id);
                to_value(&ConfigDescription {
                    applied,
                    workload_generation: workload.map(|w| w.generation),
                    config,
                })
            }
            ObjectKind::Route => {
                let route = self.route(key)?;
                let target = route.target_id();
                to_value(&RouteDescription {
                    target_exists: self.store.get_workload(&target)?.is_some(),
                    healthy_endpoints: self.ingress.router().registry().list_healthy(&target).len(),
                    route,
                })
            }
        }
    }

    pub fn list(&self, kind: ObjectKind) -> OperatorResult<serde_json::Value> {
        match kind {
            ObjectKind::Workload => to_value(&self.store.list_workloads()?),
            ObjectKind::Config => to_value(&self.store.list_configs()?),
            ObjectKind::Route => to_value(&self.store.list_routes()?),
        }
    }

    /// Long-poll until the `get` view's fingerprint differs from `since`
    /// or `timeout` elapses. Without `since` the current view returns at once.
    pub async fn watch(
        &self,
        kind: ObjectKind,
        key: &str,
        since: Option<&str>,
        timeout: Duration,
    ) -> OperatorResult<WatchEvent> {
        let deadline = tokio::time::Instant::now() + timeout.min(MAX_WATCH_TIMEOUT);
        loop {
            let object = self.get(kind, key)?;
            let fingerprint = fingerprint(&object);
            let changed = since != Some(fingerprint.as_str());
            if changed || tokio::time::Instant::now() >= deadline {
                return Ok(WatchEvent {
                    fingerprint,
                    changed,
                    object,
                });
            }
            tokio::time::sleep(WATCH_POLL).await;
        }
    }

    // ── delete ────────────────────────────────────────────────────

    pub fn delete(&self, kind: ObjectKind, key: &str) -> OperatorResult<()> {
        let deleted = match kind {
            ObjectKind::Workload => {
                let deleted = self.store.delete_workload(key)?;
                if deleted {
                    self.store.delete_decisions_for_workload(key)?;
                    self.ingress.router().forget_workload(key);
                    // The controller tears down instances and status.
                    self.queue.add(key);
                }
                deleted
            }
            // The last applied snapshot stays in the workload template.
            ObjectKind::Config => self.store.delete_config(key)?,
            ObjectKind::Route => {
                let deleted = self.store.delete_route(key)?;
                if deleted {
                    self.reload_routes()?;
                }
                deleted
            }
        };
        if !deleted {
            return Err(not_found(kind, key));
        }
        info!(%kind, %key, "object deleted");
        Ok(())
    }

    /// Current statuses, for `/metrics`.
    pub fn statuses(&self) -> OperatorResult<Vec<WorkloadStatus>> {
        Ok(self.store.list_statuses()?)
    }

    fn workload(&self, key: &str) -> OperatorResult<WorkloadSpec> {
        self.store
            .get_workload(key)?
            .ok_or_else(|| not_found(ObjectKind::Workload, key))
    }

    fn config(&self, key: &str) -> OperatorResult<ConfigVersion> {
        self.store
            .get_config(key)?
            .ok_or_else(|| not_found(ObjectKind::Config, key))
    }

    fn route(&self, key: &str) -> OperatorResult<Route> {
        self.store
            .get_route(key)?
            .ok_or_else(|| not_found(ObjectKind::Route, key))
    }
}

fn not_found(kind: ObjectKind, key: &str) -> OperatorError {
    OperatorError::NotFound(format!("{kind} {key}"))
}

fn to_value<T: serde::Serialize>(value: &T) -> OperatorResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| OperatorError::Internal(e.to_string()))
}

/// Short content fingerprint of a JSON view.
pub fn fingerprint(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hex = hex::encode(Sha256::digest(&bytes));
    hex.truncate(16);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_proxy::{BalanceStrategy, EndpointRegistry, ServiceRouter};
    use shoal_state::{HealthConfig, InstanceTemplate};

    fn operator() -> (Operator, Arc<WorkQueue>, EndpointRegistry) {
        let store = StateStore::open_in_memory().unwrap();
        let queue = Arc::new(WorkQueue::new());
        let registry = EndpointRegistry::new();
        let router = Arc::new(ServiceRouter::new(registry.clone(), BalanceStrategy::RoundRobin));
        let ingress = Arc::new(Ingress::new(router));
        (Operator::new(store, queue.clone(), ingress), queue, registry)
    }

    fn workload(min: u32, max: u32) -> WorkloadSpec {
        WorkloadSpec {
            namespace: "default".into(),
            name: "web".into(),
            min_replicas: min,
            max_replicas: max,
            template: InstanceTemplate {
                command: "web-server".into(),
                args: vec![],
                port: 8080,
                resources: Default::default(),
                env: Default::default(),
                config: None,
            },
            instance_template_hash: String::new(),
            rollout: Default::default(),
            scaling: Default::default(),
            health: HealthConfig::default(),
            generation: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn config(version: &str) -> ConfigVersion {
        ConfigVersion {
            namespace: "default".into(),
            name: "web-config".into(),
            workload: "web".into(),
            version_id: version.into(),
            data: [("FEATURE".to_string(), "on".to_string())].into(),
            created_at: 0,
        }
    }

    fn route() -> Route {
        Route {
            namespace: "default".into(),
            name: "web".into(),
            host_pattern: "example.com".into(),
            path_prefix: "/".into(),
            target_workload: "web".into(),
        }
    }

    #[test]
    fn apply_creates_then_noops() {
        let (op, queue, _) = operator();
        let created = op.apply(Object::Workload(workload(1, 3))).unwrap();
        assert_eq!(created.outcome, ApplyOutcome::Created);
        assert_eq!(created.generation, Some(1));
        assert_eq!(queue.len(), 1);

        let status = op.store().get_status("default/web").unwrap().unwrap();
        assert_eq!(status.desired_replicas, 1);

        let again = op.apply(Object::Workload(workload(1, 3))).unwrap();
        assert_eq!(again.outcome, ApplyOutcome::Unchanged);
        assert_eq!(again.generation, Some(1));
    }

    #[test]
    fn invalid_spec_leaves_state_unchanged() {
        let (op, _, _) = operator();
        op.apply(Object::Workload(workload(1, 3))).unwrap();

        let err = op.apply(Object::Workload(workload(5, 2))).unwrap_err();
        assert!(matches!(err, OperatorError::InvalidSpec(_)));
        assert_eq!(err.exit_code(), 5);

        let spec = op.store().get_workload("default/web").unwrap().unwrap();
        assert_eq!(spec.min_replicas, 1);
        assert_eq!(spec.max_replicas, 3);
        assert_eq!(spec.generation, 1);
    }

    #[test]
    fn stale_generation_conflicts() {
        let (op, _, _) = operator();
        op.apply(Object::Workload(workload(1, 3))).unwrap();
        op.apply(Object::Workload(workload(1, 4))).unwrap();

        let mut stale = workload(1, 5);
        stale.generation = 1;
        let err = op.apply(Object::Workload(stale)).unwrap_err();
        assert!(matches!(err, OperatorError::Conflict(_)));
        assert_eq!(err.exit_code(), 4);

        let mut fresh = workload(1, 5);
        fresh.generation = 2;
        let ok = op.apply(Object::Workload(fresh)).unwrap();
        assert_eq!(ok.outcome, ApplyOutcome::Updated);
        assert_eq!(ok.generation, Some(3));
    }

    #[test]
    fn config_apply_rolls_workload_once() {
        let (op, _, _) = operator();
        op.apply(Object::Workload(workload(1, 3))).unwrap();
        let before = op.store().get_workload("default/web").unwrap().unwrap();

        assert_eq!(op.apply(Object::Config(config("v1"))).unwrap().outcome, ApplyOutcome::Created);
        let after = op.store().get_workload("default/web").unwrap().unwrap();
        assert_eq!(after.generation, before.generation + 1);
        assert_ne!(after.instance_template_hash, before.instance_template_hash);

        assert_eq!(op.apply(Object::Config(config("v1"))).unwrap().outcome, ApplyOutcome::Unchanged);
        let again = op.store().get_workload("default/web").unwrap().unwrap();
        assert_eq!(again.generation, after.generation);
    }

    #[test]
    fn reapplying_older_config_does_not_roll() {
        let (op, _, _) = operator();
        op.apply(Object::Workload(workload(1, 3))).unwrap();

        let mut older = config("v1");
        older.name = "a-config".into();
        older.created_at = 100;
        let mut newer = config("v2");
        newer.name = "b-config".into();
        newer.created_at = 200;
        op.apply(Object::Config(older.clone())).unwrap();
        op.apply(Object::Config(newer)).unwrap();
        let before = op.store().get_workload("default/web").unwrap().unwrap();
        assert_eq!(before.generation, 3);

        let result = op.apply(Object::Config(older)).unwrap();
        assert_eq!(result.outcome, ApplyOutcome::Unchanged);
        let after = op.store().get_workload("default/web").unwrap().unwrap();
        assert_eq!(after.generation, 3);
        assert_eq!(after.template.config.as_ref().unwrap().name, "b-config");

        assert!(op.propagator.sync().unwrap().is_empty());
        let synced = op.store().get_workload("default/web").unwrap().unwrap();
        assert_eq!(synced.generation, 3);
    }

    #[test]
    fn workload_reapply_keeps_embedded_config() {
        let (op, _, _) = operator();
        op.apply(Object::Workload(workload(1, 3))).unwrap();
        op.apply(Object::Config(config("v1"))).unwrap();
        let with_config = op.store().get_workload("default/web").unwrap().unwrap();

        // Re-applying the original declaration must not strip the config.
        let result = op.apply(Object::Workload(workload(1, 3))).unwrap();
        assert_eq!(result.outcome, ApplyOutcome::Unchanged);
        let spec = op.store().get_workload("default/web").unwrap().unwrap();
        assert_eq!(spec.instance_template_hash, with_config.instance_template_hash);
    }

    #[test]
    fn describe_config_reports_applied() {
        let (op, _, _) = operator();
        op.apply(Object::Config(config("v1"))).unwrap();
        let d = op.describe(ObjectKind::Config, "default/web-config").unwrap();
        assert_eq!(d["applied"], false);

        op.apply(Object::Workload(workload(1, 3))).unwrap();
        let d = op.describe(ObjectKind::Config, "default/web-config").unwrap();
        assert_eq!(d["applied"], true);
    }

    #[test]
    fn route_apply_and_delete_reload_ingress() {
        let (op, _, registry) = operator();
        op.apply(Object::Route(route())).unwrap();
        assert_eq!(op.ingress.resolve("example.com", "/x").unwrap(), "default/web");

        registry.register("default/web", "web-0.default", "127.0.0.1:9000");
        let d = op.describe(ObjectKind::Route, "default/web").unwrap();
        assert_eq!(d["healthy_endpoints"], 1);
        assert_eq!(d["target_exists"], false);

        op.delete(ObjectKind::Route, "default/web").unwrap();
        assert!(op.ingress.resolve("example.com", "/x").is_err());
    }

    #[test]
    fn delete_missing_is_not_found() {
        let (op, _, _) = operator();
        let err = op.delete(ObjectKind::Workload, "default/nope").unwrap_err();
        assert!(matches!(err, OperatorError::NotFound(_)));
        assert_eq!(err.exit_code(), 3);
        assert!(op.get(ObjectKind::Config, "default/nope").is_err());
    }

    #[test]
    fn delete_workload_enqueues_teardown() {
        let (op, queue, registry) = operator();
        op.apply(Object::Workload(workload(1, 3))).unwrap();
        registry.register("default/web", "web-0.default", "127.0.0.1:9000");
        op.ingress.router().route("default/web").unwrap();

        op.delete(ObjectKind::Workload, "default/web").unwrap();
        // The balancer cursor went with the workload.
        assert!(!op.ingress.router().forget_workload("default/web"));
        assert!(op.store().get_workload("default/web").unwrap().is_none());
        // Status remains until the controller has torn instances down.
        assert!(op.store().get_status("default/web").unwrap().is_some());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn watch_returns_on_change_or_timeout() {
        let (op, _, _) = operator();
        op.apply(Object::Workload(workload(1, 3))).unwrap();

        let first = op
            .watch(ObjectKind::Workload, "default/web", None, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(first.changed);

        let idle = op
            .watch(
                ObjectKind::Workload,
                "default/web",
                Some(&first.fingerprint),
                Duration::from_millis(150),
            )
            .await
            .unwrap();
        assert!(!idle.changed);
        assert_eq!(idle.fingerprint, first.fingerprint);

        let writer = op.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .store()
                .update_status("default/web", |s| s.desired_replicas = 3)
                .unwrap();
        });
        let changed = op
            .watch(
                ObjectKind::Workload,
                "default/web",
                Some(&first.fingerprint),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(changed.changed);
        assert_eq!(changed.object["status"]["desired_replicas"], 3);
    }
}
