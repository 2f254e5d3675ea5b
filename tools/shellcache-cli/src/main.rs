//! Command-line driver for the shellcache offline worker.
//!
//! Runs a worker generation against the real network so a deployment's
//! manifest and fetch policies can be checked from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! # Print the resolved configuration and bucket names
//! shellcache show-config --config worker.json
//!
//! # Precache the manifest and write a report
//! shellcache install --config worker.json --report install.json
//!
//! # Install, then route requests through the fetch policy
//! shellcache fetch --config worker.json /api/forecast --navigate /settings
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use shellcache_common::{init_logging, LogConfig, LogFormat};
use shellcache_net::{HttpLoader, LoaderConfig, Request};
use shellcache_sw::{MemoryCacheStore, Registration, WorkerConfig};
use tracing::debug;

#[derive(Parser)]
#[command(name = "shellcache")]
#[command(about = "Drive the shellcache offline worker from the command line")]
struct Cli {
    /// Worker configuration (JSON). Defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Log filter, e.g. "shellcache_sw=debug"
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration
    ShowConfig,

    /// Install a generation and precache its manifest
    Install {
        /// Output JSON report path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Install a generation, then fetch URLs through it
    Fetch {
        /// URLs or origin-relative paths
        urls: Vec<String>,
        /// Treat every URL as a top-level navigation
        #[arg(long)]
        navigate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut logging = LogConfig::default().with_format(cli.log_format);
    if let Some(filter) = cli.log_filter {
        logging = logging.with_filter(filter);
    }
    init_logging(logging)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("static bucket:  {}", config.static_bucket());
            println!("dynamic bucket: {}", config.dynamic_bucket());
        }

        Commands::Install { report } => {
            let registration = registration()?;
            let outcome = registration.install(config).await?;

            println!("Installed {}", outcome.install.version);
            println!("  Cached: {}", outcome.install.cached.len());
            println!("  Failed: {}", outcome.install.failed.len());
            for (url, reason) in &outcome.install.failed {
                println!("    {url}: {reason}");
            }
            if let Some(activation) = &outcome.activation {
                println!("  Activated, {} stale bucket(s) deleted", activation.deleted.len());
            }

            if let Some(report_path) = report {
                let json = serde_json::to_string_pretty(&outcome)?;
                std::fs::write(&report_path, json)?;
                println!("Report written to: {}", report_path.display());
            }
        }

        Commands::Fetch { urls, navigate } => {
            let registration = registration()?;
            let resolved = urls
                .iter()
                .map(|u| config.resolve(u))
                .collect::<Result<Vec<_>, _>>()?;
            registration.install(config).await?;

            for url in resolved {
                let request = if navigate {
                    Request::navigate(url.clone())
                } else {
                    Request::get(url.clone())
                };
                let response = registration
                    .handle_fetch(request)
                    .await
                    .settled()
                    .await
                    .into_response();

                match response {
                    Ok(response) => println!(
                        "{} {} ({:?}, {} bytes)",
                        response.status,
                        url,
                        response.source,
                        response.body.len()
                    ),
                    Err(e) => println!("ERR {url}: {e}"),
                }
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    config.validate()?;
    debug!(version = %config.version, origin = %config.origin, "Configuration loaded");
    Ok(config)
}

fn registration() -> Result<Registration, Box<dyn std::error::Error>> {
    let network = HttpLoader::new(LoaderConfig::default())?;
    let (registration, _events) =
        Registration::new(Arc::new(MemoryCacheStore::new()), Arc::new(network));
    Ok(registration)
}
