//! Objects accepted by `apply` and the kinds addressable by path.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use shoal_state::{ConfigVersion, Instance, Route, ScalingDecision, WorkloadSpec, WorkloadStatus};
use shoal_proxy::Endpoint;

use crate::error::OperatorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Workload,
    Config,
    Route,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Workload => "workload",
            ObjectKind::Config => "config",
            ObjectKind::Route => "route",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workload" | "workloads" => Ok(ObjectKind::Workload),
            "config" | "configs" => Ok(ObjectKind::Config),
            "route" | "routes" => Ok(ObjectKind::Route),
            other => Err(OperatorError::NotFound(format!("unknown kind {other:?}"))),
        }
    }
}

/// A declared object, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Object {
    Workload(WorkloadSpec),
    Config(ConfigVersion),
    Route(Route),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Workload(_) => ObjectKind::Workload,
            Object::Config(_) => ObjectKind::Config,
            Object::Route(_) => ObjectKind::Route,
        }
    }

    /// `{namespace}/{name}`.
    pub fn key(&self) -> String {
        match self {
            Object::Workload(w) => w.table_key(),
            Object::Config(c) => c.table_key(),
            Object::Route(r) => r.table_key(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub kind: ObjectKind,
    pub key: String,
    pub outcome: ApplyOutcome,
    /// Workload generation after the apply, for workload objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
}

/// `get` view of a workload: declaration plus observed status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadView {
    pub spec: WorkloadSpec,
    pub status: Option<WorkloadStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadDescription {
    pub spec: WorkloadSpec,
    pub status: Option<WorkloadStatus>,
    pub instances: Vec<Instance>,
    pub endpoints: Vec<Endpoint>,
    /// Most recent first.
    pub decisions: Vec<ScalingDecision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDescription {
    pub config: ConfigVersion,
    /// Whether the target workload currently runs this version.
    pub applied: bool,
    pub workload_generation: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDescription {
    pub route: Route,
    pub target_exists: bool,
    pub healthy_endpoints: usize,
}

/// Result of a long-poll watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub fingerprint: String,
    /// False when the timeout elapsed with no change.
    pub changed: bool,
    pub object: serde_json::Value,
}
