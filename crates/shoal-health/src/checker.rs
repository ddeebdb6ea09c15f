//! Health check probe logic.
//!
//! Performs HTTP health checks against instance endpoints with
//! configurable thresholds and exponential backoff.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use shoal_state::HealthConfig;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Aggregated health of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Never probed successfully or unsuccessfully enough to decide.
    Unknown,
    Healthy,
    /// Reached the consecutive failure threshold.
    Unhealthy,
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeResult> + Send + 'a>>;

/// Probes one instance address.
///
/// Implementations must bound their own runtime; a timeout is reported
/// as `ProbeResult::Failed`, never as a hang.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, address: &'a str, config: &'a HealthConfig) -> ProbeFuture<'a>;
}

/// `GET http://{address}{config.path}` with the configured timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProber;

impl Prober for HttpProber {
    fn probe<'a>(&'a self, address: &'a str, config: &'a HealthConfig) -> ProbeFuture<'a> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        Box::pin(http_probe(address, &config.path, timeout))
    }
}

/// Consecutive probe results for one instance, plus its probe cadence.
///
/// Failures double the probe interval up to `MAX_BACKOFF`; any success
/// restores the workload's configured interval.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    failures: u32,
    successes: u32,
    unhealthy_threshold: u32,
    /// Successes needed to leave `Unhealthy`.
    recovery_threshold: u32,
    interval: Duration,
    backoff: Duration,
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);

impl HealthTracker {
    pub fn new(config: &HealthConfig) -> Self {
        Self::with_thresholds(
            config.unhealthy_threshold,
            1,
            Duration::from_secs(config.interval_secs.max(1)),
        )
    }

    pub fn with_thresholds(unhealthy_threshold: u32, recovery_threshold: u32, interval: Duration) -> Self {
        Self {
            status: HealthStatus::Unknown,
            failures: 0,
            successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            recovery_threshold: recovery_threshold.max(1),
            interval,
            backoff: interval,
        }
    }

    /// Fold one probe result in and return the resulting status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        if result.is_healthy() {
            self.on_success();
        } else {
            self.on_failure();
        }
        self.status
    }

    fn on_success(&mut self) {
        self.failures = 0;
        self.successes = self.successes.saturating_add(1);
        self.backoff = self.interval;
        if self.successes < self.recovery_threshold {
            return;
        }
        if self.status == HealthStatus::Unhealthy {
            debug!(successes = self.successes, "instance recovered");
        }
        self.status = HealthStatus::Healthy;
    }

    fn on_failure(&mut self) {
        self.successes = 0;
        self.failures = self.failures.saturating_add(1);
        self.backoff = self.backoff.saturating_mul(2).min(MAX_BACKOFF);
        if self.failures < self.unhealthy_threshold {
            return;
        }
        if self.status != HealthStatus::Unhealthy {
            warn!(
                failures = self.failures,
                threshold = self.unhealthy_threshold,
                "instance crossed unhealthy threshold"
            );
        }
        self.status = HealthStatus::Unhealthy;
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.successes
    }

    /// Delay before this instance is due for its next probe.
    pub fn next_interval(&self) -> Duration {
        self.backoff
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "shoal-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
