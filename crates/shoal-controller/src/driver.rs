//! Instance driver: starts and stops the processes behind instances.
//!
//! The controller only talks to the `InstanceDriver` trait. `ProcessDriver`
//! runs each instance as a local child process listening on a port taken
//! from a configured range.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use shoal_state::{Instance, InstanceId, InstanceTemplate, WorkloadId};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to start instance {instance}: {reason}")]
    Start { instance: String, reason: String },

    #[error("no free port in {0:?}")]
    PortsExhausted(RangeInclusive<u16>),

    #[error("failed to stop instance {instance}: {reason}")]
    Stop { instance: String, reason: String },

    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),
}

/// Everything needed to start one instance.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub template: InstanceTemplate,
    /// Environment computed by the controller; the driver may add to it.
    pub env: BTreeMap<String, String>,
}

/// A started instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    /// `host:port` the instance serves on.
    pub address: String,
    /// The environment actually injected.
    pub env: BTreeMap<String, String>,
}

pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Starts and stops instances.
///
/// `terminate` must be idempotent: stopping an instance the driver does
/// not know about succeeds.
pub trait InstanceDriver: Send + Sync {
    fn create<'a>(&'a self, request: &'a CreateRequest) -> DriverFuture<'a, Launched>;
    fn terminate<'a>(&'a self, instance: &'a Instance) -> DriverFuture<'a, ()>;
}

/// Runs instances as local child processes.
pub struct ProcessDriver {
    host: String,
    ports: RangeInclusive<u16>,
    stop_grace: Duration,
    inner: Mutex<ProcessTable>,
}

#[derive(Default)]
struct ProcessTable {
    children: HashMap<InstanceId, Child>,
    ports_in_use: BTreeSet<u16>,
}

impl ProcessDriver {
    pub fn new(host: impl Into<String>, ports: RangeInclusive<u16>) -> Self {
        Self {
            host: host.into(),
            ports,
            stop_grace: Duration::from_secs(5),
            inner: Mutex::new(ProcessTable::default()),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Mark the ports of already-recorded instances as taken.
    pub fn reserve_existing(&self, instances: &[Instance]) {
        let mut table = self.inner.lock().expect("process table lock");
        for port in instances.iter().filter_map(|i| port_of(&i.address)) {
            if self.ports.contains(&port) {
                table.ports_in_use.insert(port);
            }
        }
    }

    /// Number of children this driver is tracking.
    pub fn running(&self) -> usize {
        self.inner.lock().expect("process table lock").children.len()
    }

    fn allocate_port(&self, table: &mut ProcessTable) -> Result<u16, DriverError> {
        let port = self
            .ports
            .clone()
            .find(|p| !table.ports_in_use.contains(p))
            .ok_or_else(|| DriverError::PortsExhausted(self.ports.clone()))?;
        table.ports_in_use.insert(port);
        Ok(port)
    }

    fn spawn(&self, request: &CreateRequest) -> Result<Launched, DriverError> {
        let mut table = self.inner.lock().expect("process table lock");
        let port = self.allocate_port(&mut table)?;

        let mut env = request.env.clone();
        env.insert("PORT".to_string(), port.to_string());

        let spawned = Command::new(&request.template.command)
            .args(&request.template.args)
            .envs(&env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => {
                info!(
                    instance = %request.instance_id,
                    pid = ?child.id(),
                    port,
                    "instance process started"
                );
                table.children.insert(request.instance_id.clone(), child);
                Ok(Launched {
                    address: format!("{}:{port}", self.host),
                    env,
                })
            }
            Err(e) => {
                table.ports_in_use.remove(&port);
                Err(DriverError::Start {
                    instance: request.instance_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn stop(&self, instance: &Instance) -> Result<(), DriverError> {
        let child = {
            let mut table = self.inner.lock().expect("process table lock");
            if let Some(port) = port_of(&instance.address) {
                table.ports_in_use.remove(&port);
            }
            table.children.remove(&instance.id)
        };
        let Some(mut child) = child else {
            debug!(instance = %instance.id, "no process to stop");
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            // Already exited.
            debug!(instance = %instance.id, error = %e, "kill failed");
        }
        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(instance = %instance.id, %status, "instance process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(DriverError::Stop {
                instance: instance.id.clone(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(instance = %instance.id, "instance process did not exit in time");
                Err(DriverError::Timeout(self.stop_grace))
            }
        }
    }
}

impl InstanceDriver for ProcessDriver {
    fn create<'a>(&'a self, request: &'a CreateRequest) -> DriverFuture<'a, Launched> {
        Box::pin(async move { self.spawn(request) })
    }

    fn terminate<'a>(&'a self, instance: &'a Instance) -> DriverFuture<'a, ()> {
        Box::pin(self.stop(instance))
    }
}

fn port_of(address: &str) -> Option<u16> {
    address.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
}
