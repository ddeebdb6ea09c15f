//! Domain types for the Shoal state store.
//!
//! These types represent the persisted state of workloads, instances,
//! config versions, routes, and scaling decisions. All types are
//! serializable to/from JSON for storage in redb tables and for the API.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::template::template_hash;

/// Identifier of a workload: `{namespace}/{name}`.
pub type WorkloadId = String;

/// Unique identifier for an instance: `{name}-{ordinal}.{namespace}`.
pub type InstanceId = String;

// ── Workload spec ─────────────────────────────────────────────────

/// Declared desired state for one horizontally scalable workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadSpec {
    pub namespace: String,
    pub name: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// What every instance of this workload runs.
    pub template: InstanceTemplate,
    /// Derived from `template`; any caller-supplied value is overwritten.
    #[serde(default)]
    pub instance_template_hash: String,
    #[serde(default)]
    pub rollout: RolloutPolicy,
    #[serde(default)]
    pub scaling: ScalingPolicy,
    #[serde(default)]
    pub health: HealthConfig,
    /// Incremented on every accepted change. Zero on input means "unset".
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

/// Process template for instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceTemplate {
    /// Executable to launch.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Port the application listens on inside the instance.
    pub port: u16,
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Static environment entries.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Config version snapshot applied by the config propagator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<AppliedConfig>,
}

/// Resource request and limit per instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub request: Resources,
    #[serde(default)]
    pub limit: Resources,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Resources {
    #[serde(default)]
    pub cpu_millis: u32,
    #[serde(default)]
    pub memory_bytes: u64,
}

/// The config version an instance template was built from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedConfig {
    pub name: String,
    pub version_id: String,
    pub data: BTreeMap<String, String>,
}

/// Rollout safety bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RolloutPolicy {
    /// How many Ready instances may be missing below target during a change.
    pub max_unavailable: u32,
    /// How many instances may exist above target during a change.
    pub max_surge: u32,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            max_unavailable: 0,
            max_surge: 1,
        }
    }
}

/// Resource whose utilization drives scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => f.write_str("cpu"),
            ResourceKind::Memory => f.write_str("memory"),
        }
    }
}

/// Metric-driven scaling policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingPolicy {
    pub resource_kind: ResourceKind,
    /// Target mean utilization ratio in (0, 1].
    pub target_utilization: f64,
    /// Ratio deviation from target that is ignored.
    pub tolerance: f64,
    pub scale_up_percent: u32,
    pub scale_up_period_secs: u64,
    pub scale_down_percent: u32,
    pub scale_down_period_secs: u64,
    pub scale_down_stabilization_secs: u64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            resource_kind: ResourceKind::Cpu,
            target_utilization: 0.5,
            tolerance: 0.1,
            scale_up_percent: 100,
            scale_up_period_secs: 15,
            scale_down_percent: 50,
            scale_down_period_secs: 300,
            scale_down_stabilization_secs: 300,
        }
    }
}

/// Health probe parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// HTTP path to probe (e.g., "/healthz").
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Consecutive failures before a Ready instance is replaced.
    pub unhealthy_threshold: u32,
    /// How long a Pending instance may take to pass its first probe.
    pub startup_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval_secs: 5,
            timeout_secs: 2,
            unhealthy_threshold: 3,
            startup_timeout_secs: 120,
        }
    }
}

impl WorkloadSpec {
    /// `{namespace}/{name}`.
    pub fn id(&self) -> WorkloadId {
        workload_key(&self.namespace, &self.name)
    }

    /// Build the composite key for the workloads table.
    pub fn table_key(&self) -> String {
        self.id()
    }

    /// Clamp a replica count into `[min_replicas, max_replicas]`.
    pub fn clamp(&self, replicas: u32) -> u32 {
        replicas.clamp(self.min_replicas, self.max_replicas)
    }

    /// Recompute `instance_template_hash` from the template.
    pub fn refresh_template_hash(&mut self) {
        self.instance_template_hash = template_hash(&self.template);
    }

    /// Admission checks. A rejected spec leaves stored state unchanged.
    pub fn validate(&self) -> StateResult<()> {
        validate_name("namespace", &self.namespace)?;
        validate_name("name", &self.name)?;
        if self.max_replicas == 0 {
            return Err(invalid("max_replicas must be at least 1"));
        }
        if self.min_replicas > self.max_replicas {
            return Err(invalid(format!(
                "min_replicas {} exceeds max_replicas {}",
                self.min_replicas, self.max_replicas
            )));
        }
        if self.rollout.max_unavailable == 0 && self.rollout.max_surge == 0 {
            return Err(invalid("max_unavailable and max_surge cannot both be 0"));
        }
        if self.template.command.trim().is_empty() {
            return Err(invalid("template.command is empty"));
        }
        if self.template.port == 0 {
            return Err(invalid("template.port must be non-zero"));
        }
        let res = &self.template.resources;
        if res.limit.cpu_millis > 0 && res.request.cpu_millis > res.limit.cpu_millis {
            return Err(invalid("cpu request exceeds limit"));
        }
        if res.limit.memory_bytes > 0 && res.request.memory_bytes > res.limit.memory_bytes {
            return Err(invalid("memory request exceeds limit"));
        }
        let s = &self.scaling;
        if !(s.target_utilization > 0.0 && s.target_utilization <= 1.0) {
            return Err(invalid(format!(
                "target_utilization {} outside (0, 1]",
                s.target_utilization
            )));
        }
        if !(0.0..1.0).contains(&s.tolerance) {
            return Err(invalid("tolerance must be in [0, 1)"));
        }
        if s.scale_up_percent == 0 || s.scale_down_percent == 0 || s.scale_down_percent > 100 {
            return Err(invalid(
                "scale_up_percent must be positive and scale_down_percent in 1..=100",
            ));
        }
        if s.scale_up_period_secs == 0 || s.scale_down_period_secs == 0 {
            return Err(invalid("scale_up_period_secs and scale_down_period_secs must be positive"));
        }
        if self.health.unhealthy_threshold == 0 {
            return Err(invalid("health.unhealthy_threshold must be at least 1"));
        }
        if self.health.interval_secs == 0 || self.health.timeout_secs == 0 {
            return Err(invalid("health.interval_secs and health.timeout_secs must be positive"));
        }
        if self.health.startup_timeout_secs == 0 {
            return Err(invalid("health.startup_timeout_secs must be positive"));
        }
        if !self.health.path.starts_with('/') {
            return Err(invalid("health.path must start with '/'"));
        }
        Ok(())
    }

    /// Whether `other` differs from `self` in anything a caller controls.
    pub fn same_declaration(&self, other: &WorkloadSpec) -> bool {
        self.min_replicas == other.min_replicas
            && self.max_replicas == other.max_replicas
            && self.template == other.template
            && self.rollout == other.rollout
            && self.scaling == other.scaling
            && self.health == other.health
    }
}

// ── Workload status ───────────────────────────────────────────────

/// Observed state of a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadStatus {
    pub workload_id: WorkloadId,
    /// Written by the autoscaler.
    pub desired_replicas: u32,
    /// Live (Pending + Ready) instances.
    pub current_replicas: u32,
    pub ready_replicas: u32,
    /// Ready instances on the current template hash.
    pub updated_replicas: u32,
    pub observed_generation: u64,
    pub last_scale_up_time: Option<u64>,
    pub last_scale_down_time: Option<u64>,
    pub condition: WorkloadCondition,
    pub consecutive_create_failures: u32,
    pub degraded_since: Option<u64>,
    /// Next instance ordinal to hand out.
    pub next_ordinal: u64,
}

impl WorkloadStatus {
    /// Fresh status for a newly admitted workload.
    pub fn initial(spec: &WorkloadSpec) -> Self {
        Self {
            workload_id: spec.id(),
            desired_replicas: spec.min_replicas,
            current_replicas: 0,
            ready_replicas: 0,
            updated_replicas: 0,
            observed_generation: 0,
            last_scale_up_time: None,
            last_scale_down_time: None,
            condition: WorkloadCondition::Progressing,
            consecutive_create_failures: 0,
            degraded_since: None,
            next_ordinal: 0,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.condition, WorkloadCondition::Degraded { .. })
    }

    /// Time of the most recent scale event in either direction.
    pub fn last_scale_time(&self) -> Option<u64> {
        match (self.last_scale_up_time, self.last_scale_down_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Rollout condition reported in status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkloadCondition {
    Progressing,
    Complete,
    /// Creation keeps failing; surge is halted and Ready instances kept.
    /// Cleared by a successful start or by a newer spec generation.
    Degraded { reason: String, generation: u64 },
}

// ── Instance ──────────────────────────────────────────────────────

/// One running (or starting, or stopping) copy of a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub workload_id: WorkloadId,
    /// Per-workload creation sequence; tie-break after `created_at`.
    pub ordinal: u64,
    pub template_hash: String,
    pub phase: InstancePhase,
    /// `host:port` the instance serves on.
    pub address: String,
    /// Environment injected at creation time.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle phase of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    Pending,
    Ready,
    Terminating,
    Failed,
}

impl InstancePhase {
    /// Pending or Ready.
    pub fn is_live(self) -> bool {
        matches!(self, InstancePhase::Pending | InstancePhase::Ready)
    }
}

impl Instance {
    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.workload_id, self.id)
    }

    /// Ordering key: oldest first, ordinal breaks ties.
    pub fn age_key(&self) -> (u64, u64) {
        (self.created_at, self.ordinal)
    }
}

/// Instance id for a workload and ordinal.
pub fn instance_id(namespace: &str, name: &str, ordinal: u64) -> InstanceId {
    format!("{name}-{ordinal}.{namespace}")
}

// ── Config versions ───────────────────────────────────────────────

/// A versioned set of key/value configuration for one workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigVersion {
    pub namespace: String,
    pub name: String,
    /// Target workload name in the same namespace.
    pub workload: String,
    pub version_id: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub created_at: u64,
}

impl ConfigVersion {
    pub fn table_key(&self) -> String {
        workload_key(&self.namespace, &self.name)
    }

    pub fn workload_id(&self) -> WorkloadId {
        workload_key(&self.namespace, &self.workload)
    }

    /// Snapshot embedded into an instance template.
    pub fn applied(&self) -> AppliedConfig {
        AppliedConfig {
            name: self.name.clone(),
            version_id: self.version_id.clone(),
            data: self.data.clone(),
        }
    }

    pub fn validate(&self) -> StateResult<()> {
        validate_name("namespace", &self.namespace)?;
        validate_name("name", &self.name)?;
        validate_name("workload", &self.workload)?;
        if self.version_id.trim().is_empty() {
            return Err(invalid("version_id is empty"));
        }
        if let Some(key) = self.data.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(invalid(format!("config key {key:?} is not a valid env name")));
        }
        Ok(())
    }
}

// ── Routes ────────────────────────────────────────────────────────

/// Ingress rule mapping host + path prefix to a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub namespace: String,
    pub name: String,
    pub host_pattern: String,
    pub path_prefix: String,
    /// `{namespace}/{name}` or a bare name in this route's namespace.
    pub target_workload: String,
}

impl Route {
    pub fn table_key(&self) -> String {
        workload_key(&self.namespace, &self.name)
    }

    /// Fully qualified target workload id.
    pub fn target_id(&self) -> WorkloadId {
        if self.target_workload.contains('/') {
            self.target_workload.clone()
        } else {
            workload_key(&self.namespace, &self.target_workload)
        }
    }

    pub fn validate(&self) -> StateResult<()> {
        validate_name("namespace", &self.namespace)?;
        validate_name("name", &self.name)?;
        if self.host_pattern.trim().is_empty() {
            return Err(invalid("host_pattern is empty"));
        }
        if !self.path_prefix.starts_with('/') {
            return Err(invalid("path_prefix must start with '/'"));
        }
        if self.target_workload.trim().is_empty() {
            return Err(invalid("target_workload is empty"));
        }
        Ok(())
    }
}

// ── Scaling decisions ─────────────────────────────────────────────

/// One applied autoscaler decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingDecision {
    pub workload_id: WorkloadId,
    pub previous_replicas: u32,
    pub desired_replicas: u32,
    pub reason: String,
    pub decided_at: u64,
}

impl ScalingDecision {
    pub fn table_key(&self) -> String {
        format!(
            "{}:{:020}:{:010}",
            self.workload_id, self.decided_at, self.desired_replicas
        )
    }

    pub fn is_scale_up(&self) -> bool {
        self.desired_replicas > self.previous_replicas
    }
}

// ── Helpers ───────────────────────────────────────────────────────

/// Build a `{namespace}/{name}` key.
pub fn workload_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn invalid(msg: impl Into<String>) -> StateError {
    StateError::InvalidSpec(msg.into())
}

/// Names are DNS labels: lowercase alphanumerics and '-', at most 63 chars.
fn validate_name(field: &str, value: &str) -> StateResult<()> {
    let ok = !value.is_empty()
        && value.len() <= 63
        && !value.starts_with('-')
        && !value.ends_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(invalid(format!("{field} {value:?} is not a valid name")))
    }
}
