//! Controller runner: periodic resync plus a pool of reconcile workers.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::controller::WorkloadController;
use crate::error::ControllerResult;
use crate::queue::WorkQueue;

pub struct ControllerRunner {
    controller: Arc<WorkloadController>,
    queue: Arc<WorkQueue>,
    resync: Duration,
    workers: usize,
}

impl ControllerRunner {
    pub fn new(controller: Arc<WorkloadController>, queue: Arc<WorkQueue>, resync: Duration) -> Self {
        Self {
            controller,
            queue,
            resync,
            workers: 4,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Enqueue every workload with a spec or a status. A status without a
    /// spec belongs to a deleted workload still being torn down.
    pub fn enqueue_all(&self) -> ControllerResult<usize> {
        let state = self.controller.state();
        let mut ids: BTreeSet<String> = state.list_workloads()?.iter().map(|w| w.id()).collect();
        ids.extend(state.list_statuses()?.into_iter().map(|s| s.workload_id));
        for id in &ids {
            self.queue.add(id);
        }
        Ok(ids.len())
    }

    /// Run the resync ticker and workers until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.workers, resync = ?self.resync, "workload controller started");

        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let controller = self.controller.clone();
            let queue = self.queue.clone();
            workers.spawn(async move {
                while let Some(id) = queue.get().await {
                    match controller.reconcile(&id).await {
                        Ok(Some(status)) => debug!(
                            worker,
                            workload = %id,
                            ready = status.ready_replicas,
                            current = status.current_replicas,
                            "reconciled"
                        ),
                        Ok(None) => debug!(worker, workload = %id, "workload gone"),
                        Err(e) => error!(worker, workload = %id, error = %e, "reconcile failed"),
                    }
                    queue.done(&id);
                }
            });
        }

        let mut ticker = tokio::time::interval(self.resync);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.enqueue_all() {
                        error!(error = %e, "resync failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("workload controller shutting down");
                    break;
                }
            }
        }

        self.queue.shutdown();
        while workers.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::driver::{CreateRequest, DriverFuture, InstanceDriver, Launched};
    use shoal_health::HealthBook;
    use shoal_proxy::EndpointRegistry;
    use shoal_state::{HealthConfig, Instance, InstanceTemplate, StateStore, WorkloadSpec, WorkloadStatus};

    struct NoopDriver;

    impl InstanceDriver for NoopDriver {
        fn create<'a>(&'a self, request: &'a CreateRequest) -> DriverFuture<'a, Launched> {
            Box::pin(async move {
                Ok(Launched {
                    address: format!("{}:1", request.instance_id),
                    env: request.env.clone(),
                })
            })
        }

        fn terminate<'a>(&'a self, _instance: &'a Instance) -> DriverFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    fn spec(name: &str) -> WorkloadSpec {
        let mut spec = WorkloadSpec {
            namespace: "default".into(),
            name: name.into(),
            min_replicas: 1,
            max_replicas: 1,
            template: InstanceTemplate {
                command: "app".into(),
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
            generation: 1,
            created_at: 0,
            updated_at: 0,
        };
        spec.refresh_template_hash();
        spec
    }

    fn runner() -> (StateStore, ControllerRunner) {
        let state = StateStore::open_in_memory().unwrap();
        let controller = WorkloadController::new(
            state.clone(),
            EndpointRegistry::new(),
            HealthBook::new(),
            Arc::new(NoopDriver),
            ControllerConfig::default(),
        );
        let runner = ControllerRunner::new(
            Arc::new(controller),
            Arc::new(WorkQueue::new()),
            Duration::from_millis(20),
        )
        .with_workers(2);
        (state, runner)
    }

    #[tokio::test]
    async fn enqueue_all_includes_orphaned_statuses() {
        let (state, runner) = runner();
        state.put_workload(&spec("web")).unwrap();
        state.put_status(&WorkloadStatus::initial(&spec("gone"))).unwrap();

        assert_eq!(runner.enqueue_all().unwrap(), 2);
        assert_eq!(runner.queue.len(), 2);
    }

    #[tokio::test]
    async fn runner_reconciles_until_shutdown() {
        let (state, runner) = runner();
        state.put_workload(&spec("web")).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { runner.run(rx).await });

        let mut created = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !state.list_instances_for_workload("default/web").unwrap().is_empty() {
                created = true;
                break;
            }
        }
        assert!(created, "runner never created an instance");

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
