//! bucketpub - publish the records of archived JSON exports to a message bus
//!
//! Each run opens one object from a bucket, streams the elements of an array
//! inside its single compressed JSON document, and publishes them in bounded
//! batches with the object's provenance attached.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use bucketpub_core::shutdown_flag;
use config::Config;

#[derive(Parser)]
#[command(name = "bucketpub")]
#[command(about = "Stream records out of archived JSON exports onto a message bus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./bucketpub.toml or ~/.config/bucketpub/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Read timeout in seconds for stall detection
    #[arg(long, global = true)]
    read_timeout: Option<u64>,

    /// Maximum retry attempts for transient failures
    #[arg(long, global = true)]
    max_retries: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Publish the records of one or more objects
    Run(cmd::run::RunArgs),
    /// Count the records of a local archive without publishing
    Inspect(cmd::inspect::InspectArgs),
    /// Show current configuration
    Config,
}

fn setup_signal_handler() {
    // First signal: cancel in-flight runs
    // Second signal: force exit
    // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .expect("Failed to register SIGTERM handler");
        signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .expect("Failed to register SIGINT handler");
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(bucketpub_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug, spinners show activity
    //   non-TTY: info unless --debug
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = if is_tty { !cli.debug } else { false };
    bucketpub_core::init_logging(quiet, cli.debug, multi);

    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };

    // Config file defaults, CLI overrides
    let http_config = bucketpub_remote::HttpConfig {
        read_timeout: Duration::from_secs(cli.read_timeout.unwrap_or(config.http.read_timeout)),
        connect_timeout: Duration::from_secs(config.http.connect_timeout),
        max_retries: cli.max_retries.unwrap_or(config.http.max_retries),
    };
    bucketpub_remote::set_http_config(http_config);

    match cli.command {
        Command::Run(args) => {
            setup_signal_handler();
            cmd::run::run(args, &config, &progress)
        }
        Command::Inspect(args) => cmd::inspect::run(args, &config),
        Command::Config => {
            cmd::print_summary("Setting", &config_rows(&config));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn config_rows(config: &Config) -> Vec<(&'static str, String)> {
    let configured = |token: &Option<String>| match token {
        Some(_) => "configured".to_string(),
        None => "not set".to_string(),
    };

    let mut rows = vec![("Source", format!("{:?}", config.source.kind).to_lowercase())];
    match config.source.kind {
        config::SourceKind::Filesystem => {
            rows.push(("Source root", config.source.root.display().to_string()));
        }
        config::SourceKind::Gcs => rows.push((
            "Storage endpoint",
            config
                .source
                .endpoint
                .clone()
                .unwrap_or_else(|| bucketpub_remote::gcs::DEFAULT_ENDPOINT.to_string()),
        )),
        config::SourceKind::Http => rows.push((
            "Base URL",
            config.source.base_url.clone().unwrap_or_else(|| "(object URLs)".to_string()),
        )),
    }
    rows.push(("Source token", configured(&config.source.token)));
    rows.push(("Metadata", format!("{:?}", config.metadata.kind).to_lowercase()));
    rows.push(("Bus", format!("{:?}", config.bus.kind).to_lowercase()));
    match config.bus.kind {
        config::BusKind::Ndjson => rows.push(("Bus file", config.bus.path.display().to_string())),
        config::BusKind::Http => rows.push((
            "Bus URL",
            config.bus.url.clone().unwrap_or_else(|| "not set".to_string()),
        )),
        config::BusKind::Log => {}
    }
    rows.push(("Array path", config.parser.array_path.clone()));
    rows.push(("Max records / batch", config.batch.max_records.to_string()));
    rows.push(("Max latency", format!("{}ms", config.batch.max_latency_ms)));
    rows.push(("Max in flight", config.batch.max_in_flight.to_string()));
    rows.push(("Workers", config.workers.default.to_string()));
    rows.push(("Read timeout", format!("{}s", config.http.read_timeout)));
    rows.push(("Connect timeout", format!("{}s", config.http.connect_timeout)));
    rows.push(("Max retries", config.http.max_retries.to_string()));
    rows
}
