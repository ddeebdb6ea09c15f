//! Autoscaler: utilization-driven replica count decisions.
//!
//! Samples every Ready instance of each workload through a `MetricSource`,
//! computes a recommendation, gates it through the scaling policy, and
//! writes the result to `WorkloadStatus.desired_replicas`. The workload
//! controller does the actual scaling.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use shoal_metrics::{MetricSample, MetricSource, MetricWindow, fetch_all};
use shoal_state::{
    InstancePhase, ScalingDecision, ScalingPolicy, StateResult, StateStore, WorkloadId,
    WorkloadSpec, WorkloadStatus, epoch_secs,
};

/// Result of evaluating one workload.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleOutcome {
    /// A decision was applied.
    Scaled(ScalingDecision),
    /// Metrics were available but the desired count stays.
    Unchanged { reason: String },
    /// No fresh sample for any Ready instance.
    NoMetrics,
}

/// Called with the workload id after a decision is applied.
pub type ScaleCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    /// Sampling interval; samples older than this are ignored.
    pub interval_secs: u64,
    /// Timeout for one utilization fetch.
    pub metric_timeout_secs: u64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            metric_timeout_secs: 2,
        }
    }
}

/// Raw recommendations seen inside the stabilization window.
type History = VecDeque<(u64, u32)>;

pub struct Autoscaler {
    state: StateStore,
    source: Arc<dyn MetricSource>,
    config: AutoscalerConfig,
    window: Mutex<MetricWindow>,
    recommendations: Mutex<HashMap<WorkloadId, History>>,
    scale_fn: Option<ScaleCallback>,
}

impl Autoscaler {
    pub fn new(state: StateStore, source: Arc<dyn MetricSource>, config: AutoscalerConfig) -> Self {
        Self {
            state,
            source,
            config,
            window: Mutex::new(MetricWindow::new()),
            recommendations: Mutex::new(HashMap::new()),
            scale_fn: None,
        }
    }

    /// Set the callback invoked after each applied decision.
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    /// Run ticks every sampling interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval_secs, "autoscaler started");
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_at(epoch_secs()).await {
                        error!(error = %e, "autoscaler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }

    /// Evaluate every workload, treating `now` as the current time.
    ///
    /// A workload whose evaluation fails is logged and left out of the
    /// result; the others are still evaluated.
    pub async fn tick_at(&self, now: u64) -> StateResult<Vec<(WorkloadId, ScaleOutcome)>> {
        let specs = self.state.list_workloads()?;
        let mut outcomes = Vec::with_capacity(specs.len());
        for spec in &specs {
            match self.evaluate_at(spec, now).await {
                Ok(outcome) => outcomes.push((spec.id(), outcome)),
                Err(e) => error!(workload = %spec.id(), error = %e, "autoscaler evaluation failed"),
            }
        }

        self.window
            .lock()
            .expect("metric window lock")
            .prune(now, self.config.interval_secs);
        {
            let mut history = self.recommendations.lock().expect("recommendation lock");
            history.retain(|id, _| specs.iter().any(|s| &s.id() == id));
        }
        let retention = specs
            .iter()
            .map(|s| retention_secs(&s.scaling))
            .max()
            .unwrap_or(0);
        self.state.prune_decisions(now.saturating_sub(retention))?;
        Ok(outcomes)
    }

    /// Evaluate one workload and apply any resulting decision.
    pub async fn evaluate_at(&self, spec: &WorkloadSpec, now: u64) -> StateResult<ScaleOutcome> {
        let id = spec.id();
        let Some(status) = self.state.get_status(&id)? else {
            return Ok(unchanged("workload not yet reconciled"));
        };

        let ready: Vec<_> = self
            .state
            .list_instances_for_workload(&id)?
            .into_iter()
            .filter(|i| i.phase == InstancePhase::Ready)
            .collect();
        let kind = spec.scaling.resource_kind;
        let interval = Duration::from_secs(self.config.interval_secs);
        let timeout = Duration::from_secs(self.config.metric_timeout_secs.max(1));
        let samples = fetch_all(self.source.clone(), &ready, kind, interval, timeout).await;

        let average = {
            let mut window = self.window.lock().expect("metric window lock");
            for (instance_id, utilization) in samples {
                window.record(MetricSample {
                    instance_id,
                    resource_kind: kind,
                    utilization,
                    observed_at: now,
                });
            }
            window.mean(
                ready.iter().map(|i| i.id.as_str()),
                kind,
                now,
                self.config.interval_secs,
            )
        };

        let Some(average) = average else {
            warn!(
                workload = %id,
                ready = ready.len(),
                resource = %kind,
                desired = status.desired_replicas,
                "no utilization samples; keeping desired replicas"
            );
            return Ok(ScaleOutcome::NoMetrics);
        };

        let recommended = recommend(spec, &status, average);
        debug!(
            workload = %id,
            average,
            target = spec.scaling.target_utilization,
            current = status.current_replicas,
            desired = status.desired_replicas,
            recommended,
            "utilization evaluated"
        );

        let stabilized = self.stabilize(&id, &spec.scaling, now, recommended);
        let decisions = self.state.list_decisions(&id, 0)?;
        match gate(spec, &status, &decisions, recommended, stabilized, now) {
            Ok(desired) => self.apply(spec, &status, desired, average, now),
            Err(reason) => Ok(unchanged(reason)),
        }
    }

    /// Record a recommendation and return the largest one in the
    /// stabilization window.
    fn stabilize(&self, id: &str, policy: &ScalingPolicy, now: u64, recommended: u32) -> u32 {
        let mut all = self.recommendations.lock().expect("recommendation lock");
        let history = all.entry(id.to_string()).or_default();
        history.push_back((now, recommended));
        let horizon = now.saturating_sub(policy.scale_down_stabilization_secs);
        while history.front().is_some_and(|(t, _)| *t < horizon) {
            history.pop_front();
        }
        history.iter().map(|(_, r)| *r).max().unwrap_or(recommended)
    }

    fn apply(
        &self,
        spec: &WorkloadSpec,
        status: &WorkloadStatus,
        desired: u32,
        average: f64,
        now: u64,
    ) -> StateResult<ScaleOutcome> {
        let id = spec.id();
        let decision = ScalingDecision {
            workload_id: id.clone(),
            previous_replicas: status.desired_replicas,
            desired_replicas: desired,
            reason: format!(
                "average {} utilization {:.3} against target {:.3}",
                spec.scaling.resource_kind, average, spec.scaling.target_utilization
            ),
            decided_at: now,
        };
        let scale_up = decision.is_scale_up();

        self.state.append_decision(&decision)?;
        self.state.update_status(&id, |s| {
            s.desired_replicas = desired;
            if scale_up {
                s.last_scale_up_time = Some(now);
            } else {
                s.last_scale_down_time = Some(now);
            }
        })?;

        info!(
            workload = %id,
            from = decision.previous_replicas,
            to = desired,
            average,
            "scaling decision applied"
        );
        if let Some(f) = &self.scale_fn {
            f(&id);
        }
        Ok(ScaleOutcome::Scaled(decision))
    }
}

/// `ceil(current × average / target)` clamped to the workload bounds.
/// Inside the tolerance band the current desired value is kept.
pub fn recommend(spec: &WorkloadSpec, status: &WorkloadStatus, average: f64) -> u32 {
    let policy = &spec.scaling;
    let ratio = average / policy.target_utilization;
    if (ratio - 1.0).abs() <= policy.tolerance {
        return spec.clamp(status.desired_replicas);
    }
    let current = if status.current_replicas > 0 {
        status.current_replicas
    } else {
        status.desired_replicas
    };
    let raw = (current as f64 * ratio).ceil();
    spec.clamp(raw.min(u32::MAX as f64) as u32)
}

/// Apply rate limits and the scale-down stabilization window.
///
/// `recommended` is this tick's recommendation; `stabilized` is the
/// largest recommendation inside the stabilization window. Returns the
/// new desired count, or the reason nothing changes.
fn gate(
    spec: &WorkloadSpec,
    status: &WorkloadStatus,
    decisions: &[ScalingDecision],
    recommended: u32,
    stabilized: u32,
    now: u64,
) -> Result<u32, String> {
    let policy = &spec.scaling;
    let desired = status.desired_replicas;

    if recommended > desired {
        let base = period_base(decisions, now, policy.scale_up_period_secs, true).unwrap_or(desired);
        let limit = ((base as f64) * (1.0 + policy.scale_up_percent as f64 / 100.0)).ceil() as u32;
        let limit = limit.max(base + 1);
        let next = recommended.min(limit);
        if next <= desired {
            return Err(format!(
                "scale-up limited to {limit} replicas per {}s",
                policy.scale_up_period_secs
            ));
        }
        return Ok(next);
    }

    if recommended < desired {
        if let Some(last) = status.last_scale_time() {
            let elapsed = now.saturating_sub(last);
            if elapsed < policy.scale_down_stabilization_secs {
                return Err(format!(
                    "scale-down held for stabilization ({elapsed}s of {}s)",
                    policy.scale_down_stabilization_secs
                ));
            }
        }
        if stabilized >= desired {
            return Err(format!(
                "a recommendation of {stabilized} inside the stabilization window holds the count"
            ));
        }
        let base = period_base(decisions, now, policy.scale_down_period_secs, false).unwrap_or(desired);
        let limit = ((base as f64) * (1.0 - policy.scale_down_percent as f64 / 100.0)).floor();
        let next = spec.clamp(stabilized.max(limit.max(0.0) as u32));
        if next >= desired {
            return Err(format!(
                "scale-down limited to {}% per {}s",
                policy.scale_down_percent, policy.scale_down_period_secs
            ));
        }
        return Ok(next);
    }

    Err("at recommended replica count".to_string())
}

/// Replica count at the start of the current rate-limit period: the
/// previous count of the earliest same-direction decision inside it.
fn period_base(decisions: &[ScalingDecision], now: u64, period: u64, scale_up: bool) -> Option<u32> {
    let since = now.saturating_sub(period);
    decisions
        .iter()
        .filter(|d| d.decided_at > since && d.is_scale_up() == scale_up)
        .min_by_key(|d| d.decided_at)
        .map(|d| d.previous_replicas)
}

fn retention_secs(policy: &ScalingPolicy) -> u64 {
    policy
        .scale_up_period_secs
        .max(policy.scale_down_period_secs)
        .max(policy.scale_down_stabilization_secs)
}

fn unchanged(reason: impl Into<String>) -> ScaleOutcome {
    ScaleOutcome::Unchanged {
        reason: reason.into(),
    }
}
