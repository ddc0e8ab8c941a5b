//! Command-line host for the Mimesis offline worker.
//!
//! Runs the worker against a live origin over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Install and activate, then print the cache stores
//! sw-host --origin http://localhost:5000/ precache
//!
//! # Route requests through the active worker
//! sw-host fetch --config worker.json /templates/results.html /static/css/styles.css
//!
//! # Simulate page loads
//! sw-host fetch --navigate /templates/profile.html
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mimesis_common::{init_logging, LogConfig, LogFormat};
use mimesis_net::{HttpFetcher, LoaderConfig, Request};
use mimesis_sw::{
    FetchEvent, RegistrationOutcome, RuntimeHandle, ServiceWorkerHost, WorkerConfig,
    WorkerRuntime,
};
use serde_json::json;
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "sw-host")]
#[command(about = "Command-line host for the Mimesis offline worker")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Override the origin from the config
    #[arg(long, global = true)]
    origin: Option<Url>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the worker, then print the cache stores
    Precache {
        /// Worker config (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Fetch paths through the active worker
    Fetch {
        /// Worker config (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Treat each path as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Paths to request, relative to the origin
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut logging = LogConfig::from_verbosity(cli.verbose);
    if cli.json_logs {
        logging = logging.with_format(LogFormat::Json);
    }
    init_logging(logging)?;

    match cli.command {
        Commands::Precache { config } => {
            let config = load_config(config, cli.origin)?;
            let (sw, task) = start(&config)?;

            let outcome = sw.register(config).await?;
            drop(sw);
            let host = task.await?;

            let caches = host.scope().caches.read().await;
            let stores: serde_json::Map<_, _> = caches
                .keys()
                .into_iter()
                .map(|name| {
                    let urls: Vec<_> = caches
                        .get(&name)
                        .map(|c| c.keys().into_iter().map(|k| k.url.clone()).collect())
                        .unwrap_or_default();
                    (name, json!(urls))
                })
                .collect();

            let report = json!({
                "outcome": describe(&outcome),
                "caches": stores,
                "bytes": caches.total_size(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);

            if matches!(outcome, RegistrationOutcome::Rejected { .. }) {
                std::process::exit(1);
            }
        }

        Commands::Fetch {
            config,
            navigate,
            paths,
        } => {
            let config = load_config(config, cli.origin)?;
            let root = config.root()?;
            let (sw, _task) = start(&config)?;

            let outcome = sw.register(config.clone()).await?;
            info!(outcome = %describe(&outcome), "Worker registered");
            let page = sw.open_page(root).await?;

            for path in paths {
                let url = config.resolve(&path)?;
                let request = if navigate {
                    Request::navigate(url)
                } else {
                    Request::get(url)
                };

                let line = match sw.fetch(FetchEvent::from_client(request, page.clone())).await {
                    Ok(fetched) => json!({
                        "path": path,
                        "status": fetched.response.status,
                        "source": format!("{:?}", fetched.source),
                    }),
                    Err(e) => json!({ "path": path, "error": e.to_string() }),
                };
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn load_config(
    path: Option<PathBuf>,
    origin: Option<Url>,
) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(origin) = origin {
        config.origin = origin;
    }
    config.validate()?;
    Ok(config)
}

fn start(
    config: &WorkerConfig,
) -> Result<(RuntimeHandle, tokio::task::JoinHandle<ServiceWorkerHost>), Box<dyn std::error::Error>>
{
    let fetcher = HttpFetcher::new(config.origin.clone(), LoaderConfig::default())?;
    Ok(WorkerRuntime::spawn(ServiceWorkerHost::new(Arc::new(fetcher))))
}

fn describe(outcome: &RegistrationOutcome) -> String {
    match outcome {
        RegistrationOutcome::Unchanged => "unchanged".to_string(),
        RegistrationOutcome::Activated { worker, install, .. } => {
            format!("{worker} activated with {} cached", install.cached)
        }
        RegistrationOutcome::Waiting { worker, .. } => format!("{worker} waiting"),
        RegistrationOutcome::Rejected { worker, reason } => format!("{worker} rejected: {reason}"),
    }
}
