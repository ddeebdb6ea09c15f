//! shoald.toml configuration parser.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use shoal_autoscale::AutoscalerConfig;
use shoal_controller::ControllerConfig;
use shoal_proxy::BalanceStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoaldConfig {
    pub data_dir: PathBuf,
    pub api_listen: SocketAddr,
    pub proxy_listen: SocketAddr,
    pub log_format: LogFormat,
    pub instances: InstancesConfig,
    pub loops: LoopsConfig,
    pub proxy: ProxyConfig,
    pub metrics: MetricsConfig,
    pub controller: ControllerConfig,
    pub autoscaler: AutoscalerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Where and how instance processes are started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstancesConfig {
    pub host: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopsConfig {
    /// Full resync of every workload into the work queue.
    pub resync_secs: u64,
    pub workers: usize,
    pub health_interval_secs: u64,
    pub propagate_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub balance: BalanceStrategy,
    pub upstream_timeout_secs: u64,
}

/// Gauges scraped from each instance's Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub path: String,
    pub cpu_gauge: String,
    pub memory_gauge: String,
}

impl Default for ShoaldConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/shoal"),
            api_listen: SocketAddr::from(([0, 0, 0, 0], 7070)),
            proxy_listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_format: LogFormat::default(),
            instances: InstancesConfig::default(),
            loops: LoopsConfig::default(),
            proxy: ProxyConfig::default(),
            metrics: MetricsConfig::default(),
            controller: ControllerConfig::default(),
            autoscaler: AutoscalerConfig::default(),
        }
    }
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port_range_start: 20000,
            port_range_end: 29999,
            stop_grace_secs: 5,
        }
    }
}

impl Default for LoopsConfig {
    fn default() -> Self {
        Self {
            resync_secs: 30,
            workers: 4,
            health_interval_secs: 1,
            propagate_interval_secs: 10,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            balance: BalanceStrategy::RoundRobin,
            upstream_timeout_secs: 30,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            path: "/metrics".to_string(),
            cpu_gauge: "shoal_cpu_utilization".to_string(),
            memory_gauge: "shoal_memory_utilization".to_string(),
        }
    }
}

impl ShoaldConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: ShoaldConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instances.port_range_start > self.instances.port_range_end {
            bail!(
                "instances.port_range_start ({}) exceeds port_range_end ({})",
                self.instances.port_range_start,
                self.instances.port_range_end
            );
        }
        if self.loops.workers == 0 {
            bail!("loops.workers must be at least 1");
        }
        let intervals = [
            ("loops.resync_secs", self.loops.resync_secs),
            ("loops.health_interval_secs", self.loops.health_interval_secs),
            ("loops.propagate_interval_secs", self.loops.propagate_interval_secs),
            ("autoscaler.interval_secs", self.autoscaler.interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            bail!("{name} must be greater than zero");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("shoal.redb")
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.upstream_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ShoaldConfig::from_toml("").unwrap();
        assert_eq!(config.api_listen.port(), 7070);
        assert_eq!(config.loops.workers, 4);
        assert_eq!(config.controller.max_create_failures, 3);
        assert_eq!(config.autoscaler.interval_secs, 15);
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/shoal/shoal.redb"));
    }

    #[test]
    fn parse_partial_overrides() {
        let toml_str = r#"
data_dir = "/tmp/shoal"
api_listen = "127.0.0.1:9000"
log_format = "json"

[loops]
workers = 8

[proxy]
balance = "least_connections"

[metrics]
cpu_gauge = "app_cpu"

[autoscaler]
metric_timeout_secs = 5
"#;
        let config = ShoaldConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.api_listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.loops.workers, 8);
        assert_eq!(config.loops.resync_secs, 30);
        assert_eq!(config.proxy.balance, BalanceStrategy::LeastConnections);
        assert_eq!(config.metrics.cpu_gauge, "app_cpu");
        assert_eq!(config.metrics.memory_gauge, "shoal_memory_utilization");
        assert_eq!(config.autoscaler.metric_timeout_secs, 5);
        assert_eq!(config.autoscaler.interval_secs, 15);
    }

    #[test]
    fn rejects_inverted_port_range() {
        let toml_str = r#"
[instances]
port_range_start = 3000
port_range_end = 2000
"#;
        let err = ShoaldConfig::from_toml(toml_str).unwrap_err();
        assert!(err.to_string().contains("port_range_start"));
    }

    #[test]
    fn rejects_zero_interval() {
        let err = ShoaldConfig::from_toml("[loops]\nhealth_interval_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("health_interval_secs"));
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let rendered = ShoaldConfig::default().to_toml_string().unwrap();
        let parsed = ShoaldConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.proxy_listen, ShoaldConfig::default().proxy_listen);
    }
}
