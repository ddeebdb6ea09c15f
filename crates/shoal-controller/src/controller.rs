//! Workload controller: converges instances on a workload's desired state.
//!
//! One `reconcile` pass reads the spec, status, and instance records,
//! then:
//!
//! 1. **Observe**: promotes Pending instances that passed a probe,
//!    fails Pending instances past their startup timeout, and fails Ready
//!    instances whose tracker reached the unhealthy threshold
//!    (deregistering them first).
//! 2. **Clean up**: terminates and deletes Failed/Terminating records.
//!    Every instance leaves the registry first and is only terminated once
//!    its in-flight requests drained or `drain_timeout_secs` passed.
//! 3. **Scale / roll out**: removes then creates instances within the
//!    `maxUnavailable` / `maxSurge` bounds.
//! 4. **Report**: writes the controller's status fields atomically.
//!
//! Every pass re-derives its decisions from persisted records, so a pass
//! can be retried or interrupted at any point.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use shoal_health::{HealthBook, HealthStatus};
use shoal_proxy::EndpointRegistry;
use shoal_state::{
    Instance, InstanceId, InstancePhase, StateStore, WorkloadCondition, WorkloadSpec, WorkloadStatus,
    epoch_secs, instance_id,
};

use crate::driver::{CreateRequest, DriverError, InstanceDriver};
use crate::error::ControllerResult;

/// Tunables for the reconcile pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Consecutive creation failures before a workload is `Degraded`.
    pub max_create_failures: u32,
    /// How long a degraded workload waits before retrying one creation.
    pub degraded_retry_secs: u64,
    /// Upper bound on one driver call.
    pub driver_timeout_secs: u64,
    /// How long a deregistered instance may keep serving leased requests.
    pub drain_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_create_failures: 3,
            degraded_retry_secs: 30,
            driver_timeout_secs: 30,
            drain_timeout_secs: 30,
        }
    }
}

pub struct WorkloadController {
    state: StateStore,
    registry: EndpointRegistry,
    health: HealthBook,
    driver: Arc<dyn InstanceDriver>,
    config: ControllerConfig,
}

/// Instances chosen for removal and the number to create in one pass.
#[derive(Debug, Default, PartialEq, Eq)]
struct Plan {
    remove: Vec<InstanceId>,
    create: u32,
}

impl WorkloadController {
    pub fn new(
        state: StateStore,
        registry: EndpointRegistry,
        health: HealthBook,
        driver: Arc<dyn InstanceDriver>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            state,
            registry,
            health,
            driver,
            config,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Re-register every Ready instance after a restart.
    ///
    /// The registry is in-memory; persisted Ready records are the truth.
    pub fn restore_endpoints(&self) -> ControllerResult<usize> {
        let mut restored = 0;
        for inst in self.state.list_instances()? {
            if inst.phase == InstancePhase::Ready && self.registry.get(&inst.id).is_none() {
                self.registry.register(&inst.workload_id, &inst.id, &inst.address);
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "endpoints restored from instance records");
        }
        Ok(restored)
    }

    /// Reconcile one workload now.
    ///
    /// Returns the written status, or `None` if the workload no longer
    /// exists (its instances are then torn down).
    pub async fn reconcile(&self, workload_id: &str) -> ControllerResult<Option<WorkloadStatus>> {
        self.reconcile_at(workload_id, epoch_secs()).await
    }

    /// Reconcile treating `now` (epoch seconds) as the current time.
    pub async fn reconcile_at(
        &self,
        workload_id: &str,
        now: u64,
    ) -> ControllerResult<Option<WorkloadStatus>> {
        let Some(spec) = self.state.get_workload(workload_id)? else {
            self.teardown(workload_id).await?;
            return Ok(None);
        };

        let mut status = match self.state.get_status(workload_id)? {
            Some(s) => s,
            None => {
                let s = WorkloadStatus::initial(&spec);
                self.state.put_status(&s)?;
                s
            }
        };

        let mut instances = self.state.list_instances_for_workload(workload_id)?;
        instances.sort_by_key(Instance::age_key);

        // Ordinals survive a crash between create and status write.
        if let Some(max) = instances.iter().map(|i| i.ordinal).max() {
            status.next_ordinal = status.next_ordinal.max(max + 1);
        }

        self.observe(&spec, &mut status, &mut instances, now)?;
        self.cleanup(&mut instances).await?;
        self.update_degraded(&spec, &mut status, now);

        let target = spec.clamp(status.desired_replicas);
        let allow_create = self.creation_allowed(&mut status, now);
        let plan = plan(&spec, &instances, target, allow_create, status.is_degraded());
        if plan != Plan::default() {
            debug!(
                workload = workload_id,
                target,
                remove = plan.remove.len(),
                create = plan.create,
                "reconcile plan"
            );
        }

        for id in &plan.remove {
            if let Some(pos) = instances.iter().position(|i| &i.id == id) {
                let inst = instances.remove(pos);
                if let Some(kept) = self.remove_instance(inst, now).await? {
                    instances.push(kept);
                }
            }
        }

        for _ in 0..plan.create {
            match self.create_instance(&spec, &mut status, now).await? {
                Some(inst) => instances.push(inst),
                None => {
                    if status.consecutive_create_failures >= self.config.max_create_failures {
                        break;
                    }
                }
            }
        }
        self.update_degraded(&spec, &mut status, now);

        let written = self.write_status(&spec, status, &instances, target)?;
        Ok(Some(written))
    }

    // ── Observe ───────────────────────────────────────────────────────

    fn observe(
        &self,
        spec: &WorkloadSpec,
        status: &mut WorkloadStatus,
        instances: &mut [Instance],
        now: u64,
    ) -> ControllerResult<()> {
        for inst in instances.iter_mut() {
            let view = self.health.view(&inst.id);
            match inst.phase {
                InstancePhase::Pending => {
                    if view.is_some_and(|v| v.is_passing()) {
                        inst.phase = InstancePhase::Ready;
                        inst.updated_at = now;
                        self.state.put_instance(inst)?;
                        self.registry.register(&inst.workload_id, &inst.id, &inst.address);
                        status.consecutive_create_failures = 0;
                        info!(instance = %inst.id, "instance ready");
                    } else if now.saturating_sub(inst.created_at) >= spec.health.startup_timeout_secs {
                        inst.phase = InstancePhase::Failed;
                        inst.updated_at = now;
                        self.state.put_instance(inst)?;
                        status.consecutive_create_failures += 1;
                        warn!(
                            instance = %inst.id,
                            timeout_secs = spec.health.startup_timeout_secs,
                            "instance never became healthy"
                        );
                    }
                }
                InstancePhase::Ready => {
                    let failing = view.is_some_and(|v| {
                        v.status == HealthStatus::Unhealthy
                            && v.consecutive_failures >= spec.health.unhealthy_threshold
                    });
                    if failing {
                        // Traffic stops before the process does.
                        self.registry.deregister(&inst.id);
                        inst.phase = InstancePhase::Failed;
                        inst.updated_at = now;
                        self.state.put_instance(inst)?;
                        warn!(instance = %inst.id, "instance failed health checks");
                    } else if self.registry.get(&inst.id).is_none() {
                        self.registry.register(&inst.workload_id, &inst.id, &inst.address);
                    }
                }
                InstancePhase::Terminating | InstancePhase::Failed => {}
            }
        }
        Ok(())
    }

    // ── Clean up ──────────────────────────────────────────────────────

    /// Terminate and delete Failed/Terminating instances. Records whose
    /// termination fails stay for the next pass.
    async fn cleanup(&self, instances: &mut Vec<Instance>) -> ControllerResult<()> {
        let (dead, live): (Vec<Instance>, Vec<Instance>) = std::mem::take(instances)
            .into_iter()
            .partition(|i| !i.phase.is_live());
        *instances = live;

        for inst in dead {
            self.registry.deregister(&inst.id);
            self.drain(&inst).await;
            match self.terminate(&inst).await {
                Ok(()) => {
                    self.state.delete_instance(&inst.table_key())?;
                    self.health.forget(&inst.id);
                    debug!(instance = %inst.id, "instance record removed");
                }
                Err(e) => {
                    warn!(instance = %inst.id, error = %e, "terminate failed; will retry");
                    instances.push(inst);
                }
            }
        }
        Ok(())
    }

    /// Deregister, mark Terminating, drain, terminate, delete. Returns the
    /// record if termination failed and it must be retried.
    async fn remove_instance(&self, mut inst: Instance, now: u64) -> ControllerResult<Option<Instance>> {
        self.registry.deregister(&inst.id);
        inst.phase = InstancePhase::Terminating;
        inst.updated_at = now;
        self.state.put_instance(&inst)?;
        self.drain(&inst).await;

        match self.terminate(&inst).await {
            Ok(()) => {
                self.state.delete_instance(&inst.table_key())?;
                self.health.forget(&inst.id);
                info!(instance = %inst.id, hash = %inst.template_hash, "instance removed");
                Ok(None)
            }
            Err(e) => {
                warn!(instance = %inst.id, error = %e, "terminate failed; will retry");
                Ok(Some(inst))
            }
        }
    }

    async fn drain(&self, inst: &Instance) {
        let limit = Duration::from_secs(self.config.drain_timeout_secs);
        if !self.registry.drain(&inst.id, limit).await {
            warn!(
                instance = %inst.id,
                outstanding = self.registry.inflight(&inst.id),
                "drain timed out; terminating with requests in flight"
            );
        }
    }

    async fn terminate(&self, inst: &Instance) -> Result<(), DriverError> {
        let limit = Duration::from_secs(self.config.driver_timeout_secs);
        tokio::time::timeout(limit, self.driver.terminate(inst))
            .await
            .unwrap_or(Err(DriverError::Timeout(limit)))
    }

    // ── Create ────────────────────────────────────────────────────────

    /// Start one instance on the current template. `None` on a counted
    /// creation failure.
    async fn create_instance(
        &self,
        spec: &WorkloadSpec,
        status: &mut WorkloadStatus,
        now: u64,
    ) -> ControllerResult<Option<Instance>> {
        let ordinal = status.next_ordinal;
        status.next_ordinal += 1;
        let id = instance_id(&spec.namespace, &spec.name, ordinal);

        let request = CreateRequest {
            instance_id: id.clone(),
            workload_id: spec.id(),
            template: spec.template.clone(),
            env: instance_env(spec, &id),
        };

        let limit = Duration::from_secs(self.config.driver_timeout_secs);
        let launched = tokio::time::timeout(limit, self.driver.create(&request))
            .await
            .unwrap_or(Err(DriverError::Timeout(limit)));

        match launched {
            Ok(launched) => {
                let inst = Instance {
                    id,
                    workload_id: spec.id(),
                    ordinal,
                    template_hash: spec.instance_template_hash.clone(),
                    phase: InstancePhase::Pending,
                    address: launched.address,
                    env: launched.env,
                    created_at: now,
                    updated_at: now,
                };
                self.state.put_instance(&inst)?;
                info!(instance = %inst.id, address = %inst.address, hash = %inst.template_hash, "instance created");
                Ok(Some(inst))
            }
            Err(e) => {
                status.consecutive_create_failures += 1;
                warn!(
                    instance = %id,
                    failures = status.consecutive_create_failures,
                    error = %e,
                    "instance creation failed"
                );
                Ok(None)
            }
        }
    }

    // ── Degraded ──────────────────────────────────────────────────────

    fn update_degraded(&self, spec: &WorkloadSpec, status: &mut WorkloadStatus, now: u64) {
        if let WorkloadCondition::Degraded { generation, .. } = &status.condition {
            if *generation != spec.generation {
                info!(workload = %spec.id(), "new generation clears degraded condition");
                status.condition = WorkloadCondition::Progressing;
                status.degraded_since = None;
                status.consecutive_create_failures = 0;
            } else if status.consecutive_create_failures == 0 {
                info!(workload = %spec.id(), "instance started; degraded condition cleared");
                status.condition = WorkloadCondition::Progressing;
                status.degraded_since = None;
            }
        }

        if !status.is_degraded() && status.consecutive_create_failures >= self.config.max_create_failures {
            warn!(
                workload = %spec.id(),
                failures = status.consecutive_create_failures,
                "workload degraded; halting instance creation"
            );
            status.condition = WorkloadCondition::Degraded {
                reason: format!(
                    "{} consecutive instance creation failures",
                    status.consecutive_create_failures
                ),
                generation: spec.generation,
            };
            status.degraded_since = Some(now);
        }
    }

    /// Whether this pass may create instances. A degraded workload gets
    /// one attempt per retry period.
    fn creation_allowed(&self, status: &mut WorkloadStatus, now: u64) -> bool {
        if !status.is_degraded() {
            return true;
        }
        let since = status.degraded_since.unwrap_or(now);
        if now.saturating_sub(since) >= self.config.degraded_retry_secs {
            status.degraded_since = Some(now);
            return true;
        }
        false
    }

    // ── Status ────────────────────────────────────────────────────────

    fn write_status(
        &self,
        spec: &WorkloadSpec,
        computed: WorkloadStatus,
        instances: &[Instance],
        target: u32,
    ) -> ControllerResult<WorkloadStatus> {
        let hash = &spec.instance_template_hash;
        let live = instances.iter().filter(|i| i.phase.is_live());
        let current = live.clone().count() as u32;
        let ready = live.clone().filter(|i| i.phase == InstancePhase::Ready).count() as u32;
        let updated = live
            .clone()
            .filter(|i| i.phase == InstancePhase::Ready && &i.template_hash == hash)
            .count() as u32;
        let rolled_out = live.clone().all(|i| &i.template_hash == hash);

        let condition = match computed.condition {
            WorkloadCondition::Degraded { .. } => computed.condition.clone(),
            _ if rolled_out && current == target && ready == target => WorkloadCondition::Complete,
            _ => WorkloadCondition::Progressing,
        };

        let written = self.state.update_status(&spec.id(), |s| {
            s.current_replicas = current;
            s.ready_replicas = ready;
            s.updated_replicas = updated;
            if rolled_out {
                s.observed_generation = spec.generation;
            }
            s.condition = condition;
            s.consecutive_create_failures = computed.consecutive_create_failures;
            s.degraded_since = computed.degraded_since;
            s.next_ordinal = s.next_ordinal.max(computed.next_ordinal);
        })?;
        Ok(written)
    }

    // ── Teardown ──────────────────────────────────────────────────────

    /// Remove every instance of a deleted workload, then its status.
    async fn teardown(&self, workload_id: &str) -> ControllerResult<()> {
        let instances = self.state.list_instances_for_workload(workload_id)?;
        let mut remaining = 0;
        for inst in instances {
            if self.remove_instance(inst, epoch_secs()).await?.is_some() {
                remaining += 1;
            }
        }
        if remaining == 0 && self.state.delete_status(workload_id)? {
            info!(workload = workload_id, "workload torn down");
        }
        Ok(())
    }
}

/// Decide removals and creations for one pass.
///
/// Removals are chosen before creations. Ready instances are only removed
/// while the Ready count stays at or above `target - maxUnavailable`
/// (`minReplicas - maxUnavailable` for plain scale-down), and creations
/// never push the live count past `target + maxSurge`.
fn plan(
    spec: &WorkloadSpec,
    instances: &[Instance],
    target: u32,
    allow_create: bool,
    degraded: bool,
) -> Plan {
    let hash = &spec.instance_template_hash;
    let surge = spec.rollout.max_surge;
    let unavailable = spec.rollout.max_unavailable;

    let live: Vec<&Instance> = instances.iter().filter(|i| i.phase.is_live()).collect();
    let (current, old): (Vec<&Instance>, Vec<&Instance>) =
        live.iter().copied().partition(|i| &i.template_hash == hash);
    let mut ready = live.iter().filter(|i| i.phase == InstancePhase::Ready).count() as u32;
    let mut live_count = live.len() as u32;
    let mut plan = Plan::default();

    if old.is_empty() {
        if target > live_count {
            if allow_create {
                let step = surge.max(1);
                plan.create = (target - live_count).min(step);
            }
        } else if target < live_count {
            let mut excess = live_count - target;
            let floor = spec.min_replicas.saturating_sub(unavailable);
            let mut ready_removable = ready.saturating_sub(floor);
            for (id, phase) in by_removal_order(&current) {
                if excess == 0 {
                    break;
                }
                if phase == InstancePhase::Ready {
                    if ready_removable == 0 {
                        continue;
                    }
                    ready_removable -= 1;
                }
                plan.remove.push(id);
                excess -= 1;
            }
        }
        return plan;
    }

    // Rollout: old hash instances present.
    let floor = target.saturating_sub(unavailable);
    for (id, phase) in by_removal_order(&old) {
        match phase {
            InstancePhase::Pending => {}
            _ => {
                if degraded || ready == 0 || ready - 1 < floor {
                    continue;
                }
                ready -= 1;
            }
        }
        plan.remove.push(id);
        live_count -= 1;
    }

    // Shrink the new set if the target dropped below it mid-rollout.
    let mut new_count = current.len() as u32;
    if new_count > target {
        for (id, phase) in by_removal_order(&current) {
            if new_count <= target {
                break;
            }
            if phase == InstancePhase::Ready {
                if ready == 0 || ready - 1 < floor {
                    continue;
                }
                ready -= 1;
            }
            plan.remove.push(id);
            live_count -= 1;
            new_count -= 1;
        }
    }

    if allow_create {
        let room = (target + surge).saturating_sub(live_count);
        let missing = target.saturating_sub(new_count);
        plan.create = room.min(missing);
        if degraded {
            plan.create = plan.create.min(1);
        }
    }
    plan
}

/// Pending first, then oldest first within each phase.
fn by_removal_order(set: &[&Instance]) -> Vec<(InstanceId, InstancePhase)> {
    let mut v: Vec<&Instance> = set.to_vec();
    v.sort_by_key(|i| (i.phase == InstancePhase::Ready, i.age_key()));
    v.into_iter().map(|i| (i.id.clone(), i.phase)).collect()
}

/// Environment for a new instance: template env, then config data, then
/// the reserved `SHOAL_*` entries.
fn instance_env(spec: &WorkloadSpec, instance_id: &str) -> BTreeMap<String, String> {
    let mut env = spec.template.env.clone();
    if let Some(config) = &spec.template.config {
        env.extend(config.data.clone());
        env.insert("SHOAL_CONFIG_VERSION".to_string(), config.version_id.clone());
    }
    env.insert("SHOAL_INSTANCE_ID".to_string(), instance_id.to_string());
    env.insert("SHOAL_WORKLOAD".to_string(), spec.id());
    env
}
