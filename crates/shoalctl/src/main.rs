use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

mod client;
mod commands;

use client::ApiClient;

#[derive(Parser)]
#[command(
    name = "shoalctl",
    about = "Shoal: declare workloads, configs, and routes",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Address of the shoald API.
    #[arg(long, global = true, default_value = "127.0.0.1:7070")]
    server: String,

    /// Namespace for bare object names.
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,

    /// Request timeout in seconds.
    #[arg(long, global = true, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update objects from a .json or .toml manifest
    Apply {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Show an object (workloads include status)
    Get {
        /// workload, config, or route
        kind: String,
        /// ns/name or name
        key: String,
    },
    /// Show an object with its instances, endpoints, and decisions
    Describe { kind: String, key: String },
    /// Delete an object
    Delete { kind: String, key: String },
    /// Print an object whenever it changes
    Watch {
        kind: String,
        key: String,
        /// Seconds per server-side long poll.
        #[arg(long, default_value = "30")]
        poll: u64,
        /// Exit after the first change.
        #[arg(long)]
        once: bool,
    },
    /// List objects of a kind
    List {
        kind: String,
        /// Print the full objects as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let client = ApiClient::new(&cli.server, Duration::from_secs(cli.timeout));
    let ns = cli.namespace.as_str();

    match cli.command {
        Commands::Apply { file } => commands::apply::apply(&client, &file).await,
        Commands::Get { kind, key } => commands::get::get(&client, &kind, &key, ns).await,
        Commands::Describe { kind, key } => {
            commands::get::describe(&client, &kind, &key, ns).await
        }
        Commands::Delete { kind, key } => commands::delete::delete(&client, &kind, &key, ns).await,
        Commands::Watch {
            kind,
            key,
            poll,
            once,
        } => commands::watch::watch(&client, &kind, &key, ns, poll, once).await,
        Commands::List { kind, json } => commands::get::list(&client, &kind, json).await,
    }
}
