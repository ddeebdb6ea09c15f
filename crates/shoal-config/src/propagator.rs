//! Config propagator: turns a new ConfigVersion into a new workload
//! generation.
//!
//! The propagator never touches instances. It embeds the config snapshot
//! into the workload's instance template, which changes the template hash
//! and lets the workload controller's rollout replace instances.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use shoal_state::{ConfigVersion, StateError, StateStore, WorkloadId, epoch_secs};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("gave up on {workload} after {attempts} conflicting writes")]
    RetriesExhausted { workload: WorkloadId, attempts: u32 },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagateOutcome {
    /// The workload spec was rewritten at a new generation.
    Applied { generation: u64, template_hash: String },
    /// The workload already runs this snapshot.
    Unchanged,
    /// The target workload does not exist; the version stays stored.
    WorkloadMissing,
}

/// Called with the workload id after a new generation is written.
pub type ReconcileCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Conflicting spec writes tolerated before a propagation gives up.
const MAX_ATTEMPTS: u32 = 5;

pub struct ConfigPropagator {
    state: StateStore,
    on_change: Option<ReconcileCallback>,
}

impl ConfigPropagator {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            on_change: None,
        }
    }

    pub fn with_reconcile_fn(mut self, f: ReconcileCallback) -> Self {
        self.on_change = Some(f);
        self
    }

    /// Embed `version` into its workload's template.
    ///
    /// Re-applying a version whose snapshot is already embedded is a no-op,
    /// and so is a version that a newer stored config supersedes.
    /// A concurrent spec write is retried against the fresh spec.
    pub fn on_config_change(&self, version: &ConfigVersion) -> ConfigResult<PropagateOutcome> {
        let workload_id = version.workload_id();

        if let Some(latest) = latest_config(&self.state, &workload_id)?
            && order_key(&latest) > order_key(version)
        {
            debug!(
                workload = %workload_id,
                version = %version.version_id,
                latest = %latest.table_key(),
                "config superseded; not propagating"
            );
            return Ok(PropagateOutcome::Unchanged);
        }

        for attempt in 1..=MAX_ATTEMPTS {
            let Some(spec) = self.state.get_workload(&workload_id)? else {
                warn!(
                    config = %version.table_key(),
                    workload = %workload_id,
                    "config targets a missing workload; stored for later"
                );
                return Ok(PropagateOutcome::WorkloadMissing);
            };

            let mut next = spec.clone();
            next.template.config = Some(version.applied());
            next.refresh_template_hash();
            if next.instance_template_hash == spec.instance_template_hash {
                debug!(workload = %workload_id, version = %version.version_id, "config already applied");
                return Ok(PropagateOutcome::Unchanged);
            }
            next.generation = spec.generation + 1;
            next.updated_at = epoch_secs();

            match self.state.compare_and_put_workload(&next, spec.generation) {
                Ok(()) => {
                    info!(
                        workload = %workload_id,
                        version = %version.version_id,
                        generation = next.generation,
                        hash = %next.instance_template_hash,
                        "config propagated"
                    );
                    if let Some(f) = &self.on_change {
                        f(&workload_id);
                    }
                    return Ok(PropagateOutcome::Applied {
                        generation: next.generation,
                        template_hash: next.instance_template_hash,
                    });
                }
                Err(StateError::Conflict { actual, .. }) => {
                    debug!(workload = %workload_id, attempt, actual, "spec changed underneath; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ConfigError::RetriesExhausted {
            workload: workload_id,
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Propagate the newest version for every workload that is not
    /// running it yet.
    pub fn sync(&self) -> ConfigResult<Vec<(WorkloadId, PropagateOutcome)>> {
        let mut newest: BTreeMap<WorkloadId, ConfigVersion> = BTreeMap::new();
        for version in self.state.list_configs()? {
            let id = version.workload_id();
            match newest.get(&id) {
                Some(current) if order_key(current) >= order_key(&version) => {}
                _ => {
                    newest.insert(id, version);
                }
            }
        }

        let mut outcomes = Vec::new();
        for (id, version) in newest {
            let outcome = self.on_config_change(&version)?;
            if outcome != PropagateOutcome::Unchanged {
                outcomes.push((id, outcome));
            }
        }
        Ok(outcomes)
    }

    /// Run `sync` every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?interval, "config propagator started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync() {
                        error!(error = %e, "config sync failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("config propagator shutting down");
                    break;
                }
            }
        }
    }
}

/// The newest config for a workload wins: latest `created_at`, then name.
fn order_key(version: &ConfigVersion) -> (u64, &str) {
    (version.created_at, version.name.as_str())
}

/// The config version currently in force for a workload, if any.
pub fn latest_config(state: &StateStore, workload_id: &str) -> ConfigResult<Option<ConfigVersion>> {
    Ok(state
        .list_configs()?
        .into_iter()
        .filter(|c| c.workload_id() == workload_id)
        .max_by(|a, b| order_key(a).cmp(&order_key(b))))
}
