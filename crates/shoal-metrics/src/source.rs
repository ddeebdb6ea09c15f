//! Utilization sources.
//!
//! `MetricSource` is the capability the autoscaler reads through. The
//! HTTP implementation scrapes `http://{address}/metrics` and reads one
//! gauge per resource kind as a utilization ratio.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::debug;

use shoal_state::{Instance, InstanceId, ResourceKind};

use crate::error::MetricError;

pub type MetricFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<f64>, MetricError>> + Send + 'a>>;

/// Reads the utilization ratio of one instance.
///
/// `Ok(None)` means the instance exposes no value for this resource,
/// which callers treat the same as an error: a missing sample.
pub trait MetricSource: Send + Sync {
    fn get_utilization<'a>(
        &'a self,
        instance: &'a Instance,
        kind: ResourceKind,
        window: Duration,
    ) -> MetricFuture<'a>;
}

/// Scrapes each instance's Prometheus endpoint.
pub struct HttpMetricSource {
    path: String,
    gauges: HashMap<ResourceKind, String>,
}

impl HttpMetricSource {
    pub fn new() -> Self {
        let mut gauges = HashMap::new();
        gauges.insert(ResourceKind::Cpu, "shoal_cpu_utilization".to_string());
        gauges.insert(ResourceKind::Memory, "shoal_memory_utilization".to_string());
        Self {
            path: "/metrics".to_string(),
            gauges,
        }
    }

    /// Override the gauge read for a resource kind.
    pub fn with_gauge(mut self, kind: ResourceKind, name: impl Into<String>) -> Self {
        self.gauges.insert(kind, name.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    async fn scrape(&self, address: &str) -> Result<String, MetricError> {
        let uri = format!("http://{address}{}", self.path);
        let transport = |e: &dyn std::fmt::Display| MetricError::Transport(format!("{uri}: {e}"));

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| transport(&e))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| transport(&e))?;

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "shoal-metrics/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| transport(&e))?;

        let resp = sender.send_request(req).await.map_err(|e| transport(&e))?;
        if !resp.status().is_success() {
            return Err(MetricError::Transport(format!("{uri}: status {}", resp.status())));
        }
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| transport(&e))?
            .to_bytes();
        String::from_utf8(body.to_vec()).map_err(|e| MetricError::Parse(e.to_string()))
    }
}

impl Default for HttpMetricSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for HttpMetricSource {
    fn get_utilization<'a>(
        &'a self,
        instance: &'a Instance,
        kind: ResourceKind,
        _window: Duration,
    ) -> MetricFuture<'a> {
        Box::pin(async move {
            let Some(gauge) = self.gauges.get(&kind) else {
                return Ok(None);
            };
            let text = self.scrape(&instance.address).await?;
            let value = parse_gauge(&text, gauge)?;
            debug!(instance = %instance.id, %kind, ?value, "scraped utilization");
            Ok(value)
        })
    }
}

/// Find the first sample of `name` in Prometheus text format.
///
/// Labels are ignored; a value that is not a finite non-negative number
/// is a parse error.
pub fn parse_gauge(text: &str, name: &str) -> Result<Option<f64>, MetricError> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (metric, rest) = match line.find(['{', ' ', '\t']) {
            Some(i) => line.split_at(i),
            None => continue,
        };
        if metric != name {
            continue;
        }
        let rest = match rest.strip_prefix('{') {
            Some(labelled) => match labelled.split_once('}') {
                Some((_, after)) => after,
                None => return Err(MetricError::Parse(format!("unterminated labels: {line}"))),
            },
            None => rest,
        };
        let raw = rest
            .split_whitespace()
            .next()
            .ok_or_else(|| MetricError::Parse(format!("missing value: {line}")))?;
        let value: f64 = raw
            .parse()
            .map_err(|_| MetricError::Parse(format!("bad value {raw:?} for {name}")))?;
        if !value.is_finite() || value < 0.0 {
            return Err(MetricError::Parse(format!("out of range value {value} for {name}")));
        }
        return Ok(Some(value));
    }
    Ok(None)
}

/// Fetch utilization for every instance concurrently.
///
/// Each call is bounded by `timeout`; failures, timeouts, and absent
/// values are left out of the result.
pub async fn fetch_all(
    source: Arc<dyn MetricSource>,
    instances: &[Instance],
    kind: ResourceKind,
    window: Duration,
    timeout: Duration,
) -> Vec<(InstanceId, f64)> {
    let mut set = JoinSet::new();
    for instance in instances.iter().cloned() {
        let source = source.clone();
        set.spawn(async move {
            let result =
                match tokio::time::timeout(timeout, source.get_utilization(&instance, kind, window)).await {
                    Ok(r) => r,
                    Err(_) => Err(MetricError::Timeout(timeout)),
                };
            (instance.id, result)
        });
    }

    let mut samples = Vec::with_capacity(instances.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((id, Ok(Some(value)))) => samples.push((id, value)),
            Ok((id, Ok(None))) => debug!(instance = %id, %kind, "no utilization value exposed"),
            Ok((id, Err(e))) => debug!(instance = %id, %kind, error = %e, "utilization fetch failed"),
            Err(e) => debug!(error = %e, "utilization task failed"),
        }
    }
    samples.sort_by(|a, b| a.0.cmp(&b.0));
    samples
}
