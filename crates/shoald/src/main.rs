//! shoald: the Shoal daemon binary.
//!
//! # Usage
//!
//! ```text
//! shoald run --config /etc/shoal/shoald.toml --data-dir /var/lib/shoal
//! shoald print-config
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shoald::{LogFormat, ShoaldConfig};

const DEFAULT_FILTER: &str = "info,shoald=debug,shoal=debug";

#[derive(Parser)]
#[command(name = "shoald", about = "Shoal daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane, proxy, and API in this process.
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the effective configuration as TOML.
    PrintConfig {
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(clap::Args)]
struct Overrides {
    /// Path to shoald.toml.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Port for the operator API.
    #[arg(long)]
    api_port: Option<u16>,

    /// Port for the ingress proxy.
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

impl Overrides {
    fn load(self) -> anyhow::Result<ShoaldConfig> {
        let mut config = match &self.config {
            Some(path) => ShoaldConfig::from_file(path)?,
            None => ShoaldConfig::default(),
        };
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(port) = self.api_port {
            config.api_listen = SocketAddr::new(config.api_listen.ip(), port);
        }
        if let Some(port) = self.proxy_port {
            config.proxy_listen = SocketAddr::new(config.proxy_listen.ip(), port);
        }
        if self.json_logs {
            config.log_format = LogFormat::Json;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { overrides } => {
            let config = overrides.load()?;
            init_tracing(config.log_format);
            info!(data_dir = ?config.data_dir, "configuration loaded");
            shoald::run(config, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to install CTRL+C handler");
                    std::future::pending::<()>().await;
                }
            })
            .await
        }
        Command::PrintConfig { overrides } => {
            let config = overrides.load()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
