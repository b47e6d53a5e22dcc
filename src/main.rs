// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Harvest main entry point - gather runs and state inspection.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;

use harvest::builtin;
use harvest::collector::{CollectionType, Collector, GatherRequest};
use harvest::config::{self, CliOptions, ResolvedConfig};
use harvest::registry::CONFIG_KEY;
use harvest::shipping::{DisabledShipper, HttpShipper, Shipper};
use harvest::store::{SqliteStore, StaticEntitlement, WatermarkStore};
use harvest::telemetry::{init_telemetry, TelemetryConfig, GLOBAL_METRICS};

/// Harvest version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Harvest - gather, package and ship usage data.
#[derive(Parser)]
#[command(name = "harvest")]
#[command(author, version, about = "Gather, package and ship usage data", long_about = None)]
struct Cli {
    /// Collection type (manual, scheduled, dry-run)
    #[arg(long = "type", global = true, env = "HARVEST_COLLECTION_TYPE")]
    collection_type: Option<CollectionType>,

    /// SQLite file holding watermarks and the gather lock
    #[arg(long, global = true, env = "HARVEST_STATE_DB")]
    state_db: Option<PathBuf>,

    /// Ingestion endpoint
    #[arg(long, global = true, env = "HARVEST_URL")]
    url: Option<String>,

    /// Upload authentication (user-pass, identity, mutual-tls, s3)
    #[arg(long, global = true, env = "HARVEST_AUTH_MODE")]
    auth_mode: Option<String>,

    /// Upload username
    #[arg(long, global = true, env = "HARVEST_USERNAME")]
    username: Option<String>,

    /// Upload password
    #[arg(long, global = true, env = "HARVEST_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Byte budget of one archive
    #[arg(long, global = true, env = "HARVEST_CAPACITY")]
    capacity: Option<u64>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print in-process metrics after the command
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands for harvest.
#[derive(Subcommand)]
enum Commands {
    /// Gather registered metrics into archives
    Gather {
        /// Start of the window (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// End of the window (RFC 3339), defaults to now
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Only gather these metric keys ('config' is always added)
        #[arg(long = "only", value_name = "KEY")]
        only: Vec<String>,

        /// Directory receiving archives
        #[arg(long = "dest", env = "HARVEST_DESTINATION")]
        destination: Option<PathBuf>,
    },

    /// List persisted watermarks and the last gather time
    Watermarks,

    /// List registered metrics
    Metrics,

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Initialize a new configuration file
    Init {
        /// Write the annotated example instead of an empty file
        #[arg(long)]
        example: bool,
    },

    /// Show version information
    Version,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration with secrets masked
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(&TelemetryConfig::from_verbosity(cli.verbose))?;

    let show_metrics = cli.metrics;
    let result = run(cli).await;

    if show_metrics {
        eprintln!("{}", GLOBAL_METRICS.snapshot().format_report());
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cli_options = CliOptions {
        collection_type: cli.collection_type,
        destination: None,
        state_db: cli.state_db,
        package_capacity_bytes: cli.capacity,
        url: cli.url,
        auth_mode: cli.auth_mode,
        username: cli.username,
        password: cli.password,
    };

    let workspace_root = std::env::current_dir()?;
    let workspace_root = config::find_workspace_root(&workspace_root).unwrap_or(workspace_root);

    match cli.command {
        Commands::Gather {
            since,
            until,
            only,
            destination,
        } => {
            let cli_options = CliOptions {
                destination,
                ..cli_options
            };
            let resolved = config::load_config(&workspace_root, cli_options)?;
            handle_gather(&resolved, since, until, only).await
        }
        Commands::Watermarks => {
            let resolved = config::load_config(&workspace_root, cli_options)?;
            handle_watermarks(&resolved)
        }
        Commands::Metrics => {
            for info in builtin::default_registry().catalog() {
                println!(
                    "{} {} {} - {}",
                    info.key.bright_white(),
                    format!("v{}", info.version).dimmed(),
                    info.format,
                    info.description
                );
            }
            Ok(())
        }
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => {
                let resolved = config::load_config(&workspace_root, cli_options)?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&resolved.to_display_config())?
                );
                Ok(())
            }
        },
        Commands::Init { example } => {
            let initial = example.then(config::get_example_config);
            let path = config::init_config(&std::env::current_dir()?, initial)?;
            println!("Created config file: {}", path.display());
            Ok(())
        }
        Commands::Version => {
            println!("harvest {}", VERSION);
            Ok(())
        }
    }
}

fn build_collector(resolved: &ResolvedConfig) -> anyhow::Result<Collector> {
    let store = Arc::new(SqliteStore::open(&resolved.state_db)?);
    let entitlement = StaticEntitlement::new(
        resolved.entitled,
        resolved.shipping.missing().is_none(),
    );
    let shipper: Arc<dyn Shipper> = if resolved.collection_type.is_shipping_enabled() {
        Arc::new(HttpShipper::new(resolved.shipping.clone()))
    } else {
        Arc::new(DisabledShipper)
    };

    Ok(Collector::new(builtin::default_registry())
        .with_collection_type(resolved.collection_type)
        .with_store(store.clone())
        .with_lock(store)
        .with_entitlement(Arc::new(entitlement))
        .with_shipper(shipper)
        .with_capacity(resolved.package_capacity_bytes)
        .with_archive_prefix(resolved.archive_prefix.clone()))
}

async fn handle_gather(
    resolved: &ResolvedConfig,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    only: Vec<String>,
) -> anyhow::Result<()> {
    let collector = build_collector(resolved)?;

    let mut request = GatherRequest::new().destination(resolved.destination.clone());
    if !only.is_empty() {
        request = request.subset(only.into_iter().chain([CONFIG_KEY.to_string()]));
    }
    if let Some(since) = since {
        request = request.since(since);
    }
    if let Some(until) = until {
        request = request.until(until);
    }

    let dry_run = resolved.collection_type.is_dry_run();
    match collector.gather(request).await? {
        Some(paths) => {
            if dry_run {
                for path in &paths {
                    println!("{}", path.display());
                }
            }
            eprintln!("{}", gather_summary(paths.len(), dry_run).bright_green());
        }
        None => {
            eprintln!("{}", "Nothing gathered, see the log for the reason".yellow());
        }
    }
    Ok(())
}

/// One-line result of a gather run. Upload outcomes are per archive and only
/// logged, so a shipping run reports what it attempted.
fn gather_summary(archives: usize, dry_run: bool) -> String {
    if dry_run {
        format!("{} archive(s) written", archives)
    } else {
        format!(
            "{} archive(s) processed, see the log for shipping results",
            archives
        )
    }
}

fn handle_watermarks(resolved: &ResolvedConfig) -> anyhow::Result<()> {
    let store = SqliteStore::open(&resolved.state_db)?;
    let watermarks = store.load()?;

    match store.last_gather()? {
        Some(at) => println!("{} {}", "Last gather:".bright_cyan(), at.to_rfc3339()),
        None => println!("{} never", "Last gather:".bright_cyan()),
    }

    if watermarks.is_empty() {
        println!("{}", "No watermarks recorded".dimmed());
        return Ok(());
    }

    let width = watermarks.keys().map(String::len).max().unwrap_or(0);
    for (key, at) in &watermarks {
        println!("{}  {}", format!("{:width$}", key).bright_white(), at.to_rfc3339());
    }
    Ok(())
}
