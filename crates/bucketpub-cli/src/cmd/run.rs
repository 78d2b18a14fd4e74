//! `bucketpub run` - one pipeline run per source event

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Args;
use indicatif::ProgressBar;
use rayon::prelude::*;
use serde_json::Value;

use bucketpub_core::{
    CancelToken, JsonPath, Pipeline, PipelineConfig, PipelineError, RunOutcome, SharedProgress,
    SourceEvent, fmt_num, is_shutdown_requested, retry_with_backoff,
};

use super::{build_bus, build_metadata, build_source, print_summary};
use crate::config::{BusKind, Config, SourceKind};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Bucket holding the objects
    #[arg(short, long, requires = "object")]
    pub bucket: Option<String>,

    /// Object to publish (repeatable)
    #[arg(short, long, requires = "bucket")]
    pub object: Vec<String>,

    /// Event attribute carried into provenance (repeatable)
    #[arg(short = 'a', long = "attr", value_name = "KEY=VALUE", value_parser = parse_attr)]
    pub attrs: Vec<(String, String)>,

    /// JSON file of notification events, one object or an array ("-" for stdin)
    #[arg(short, long, conflicts_with = "bucket")]
    pub event_file: Option<PathBuf>,

    /// Source backend
    #[arg(long, value_enum)]
    pub source: Option<SourceKind>,

    /// Root directory for the filesystem source
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Bus backend
    #[arg(long, value_enum)]
    pub bus: Option<BusKind>,

    /// Output file for the ndjson bus
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Path of the record array inside the document, e.g. "results.*"
    #[arg(long)]
    pub array_path: Option<String>,

    /// Records per batch
    #[arg(long)]
    pub max_records: Option<usize>,

    /// Milliseconds a partial batch may wait before it is sent
    #[arg(long)]
    pub max_latency_ms: Option<u64>,

    /// Batches awaiting acknowledgment at once
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// Number of objects processed in parallel
    #[arg(short, long)]
    pub workers: Option<usize>,
}

fn parse_attr(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

/// Config file values with command-line overrides applied
fn effective_config(args: &RunArgs, config: &Config) -> Config {
    let mut config = config.clone();
    if let Some(kind) = args.source {
        config.source.kind = kind;
    }
    if let Some(root) = &args.root {
        config.source.root = root.clone();
    }
    if let Some(kind) = args.bus {
        config.bus.kind = kind;
    }
    if let Some(out) = &args.out {
        config.bus.path = out.clone();
    }
    if let Some(path) = &args.array_path {
        config.parser.array_path = path.clone();
    }
    if let Some(n) = args.max_records {
        config.batch.max_records = n;
    }
    if let Some(ms) = args.max_latency_ms {
        config.batch.max_latency_ms = ms;
    }
    if let Some(n) = args.max_in_flight {
        config.batch.max_in_flight = n;
    }
    if let Some(n) = args.workers {
        config.workers.default = n;
    }
    config
}

/// Events from `--bucket/--object`, or from `--event-file`
fn collect_events(args: &RunArgs) -> Result<Vec<SourceEvent>> {
    if let Some(path) = &args.event_file {
        let text = read_event_text(path)?;
        let mut events = parse_events(&text)
            .with_context(|| format!("invalid event file {}", path.display()))?;
        for event in &mut events {
            for (key, value) in &args.attrs {
                event.attributes.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        return Ok(events);
    }

    let Some(bucket) = &args.bucket else {
        bail!("nothing to publish: pass --bucket with --object, or --event-file");
    };
    Ok(args
        .object
        .iter()
        .map(|object| {
            args.attrs
                .iter()
                .fold(SourceEvent::new(bucket, object), |event, (k, v)| {
                    event.with_attribute(k, v)
                })
        })
        .collect())
}

fn read_event_text(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("failed to read events from stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// A single notification object or an array of them
fn parse_events(text: &str) -> Result<Vec<SourceEvent>> {
    let payload: Value = serde_json::from_str(text)?;
    let payloads = match payload {
        Value::Array(items) => items,
        other => vec![other],
    };
    payloads
        .into_iter()
        .map(|p| SourceEvent::from_notification(p).map_err(Into::into))
        .collect()
}

/// Run one event, retrying startup failures that published nothing.
fn run_event(
    pipeline: &Pipeline,
    event: &SourceEvent,
    max_retries: u32,
    pb: &ProgressBar,
) -> RunOutcome {
    let label = event.label();
    let cancel = CancelToken::linked_to_shutdown();
    let attempt = retry_with_backoff(&label, max_retries, pb, || {
        match pipeline.execute_with_progress(event, &cancel, pb.clone()) {
            RunOutcome::Failed {
                error,
                published_count: 0,
            } if error.is_retryable() => Err(error),
            outcome => Ok(outcome),
        }
    });
    attempt.unwrap_or_else(|error| match error {
        PipelineError::Cancelled => RunOutcome::Cancelled { published_count: 0 },
        error => RunOutcome::Failed {
            error,
            published_count: 0,
        },
    })
}

/// Report line for stdout: the completion report plus the object it is about
fn report_line(event: &SourceEvent, outcome: &RunOutcome) -> Value {
    let mut report = outcome.report();
    if let Value::Object(fields) = &mut report {
        fields.insert("bucketId".into(), event.bucket_id.clone().into());
        fields.insert("objectId".into(), event.object_id.clone().into());
    }
    report
}

pub fn run(args: RunArgs, config: &Config, progress: &SharedProgress) -> Result<ExitCode> {
    let events = collect_events(&args)?;
    let config = effective_config(&args, config);

    let array_path = JsonPath::parse(&config.parser.array_path)?;
    let pipeline_config = PipelineConfig {
        array_path,
        batch: config.batch.to_batch_config(),
    };
    let mut pipeline = Pipeline::new(build_source(&config)?, build_bus(&config.bus)?, pipeline_config)?;
    if let Some(provider) = build_metadata(&config)? {
        pipeline = pipeline.with_metadata(provider);
    }

    let workers = config.workers.default.clamp(1, events.len().max(1));
    let max_retries = bucketpub_remote::http_config().max_retries;
    log::info!("Publishing {} object(s) with {workers} worker(s)", events.len());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("failed to build thread pool")?;

    let start = Instant::now();
    let published = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let cancelled = AtomicUsize::new(0);

    pool.install(|| {
        events.par_iter().for_each(|event| {
            if is_shutdown_requested() {
                cancelled.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let pb = progress.run_line(&event.label());
            let outcome = run_event(&pipeline, event, max_retries, &pb);
            pb.finish_and_clear();

            published.fetch_add(outcome.published_count(), Ordering::Relaxed);
            match &outcome {
                RunOutcome::Completed(_) => {}
                RunOutcome::Failed { .. } => {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
                RunOutcome::Cancelled { .. } => {
                    cancelled.fetch_add(1, Ordering::Relaxed);
                }
            }

            let line = report_line(event, &outcome);
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = writeln!(stdout, "{line}") {
                log::warn!("failed to write report for {}: {e}", event.label());
            }
        });
    });

    let failed = failed.into_inner();
    let cancelled = cancelled.into_inner();
    let completed = events.len() - failed - cancelled;
    print_summary(
        "Run",
        &[
            ("Objects", fmt_num(events.len())),
            ("Completed", fmt_num(completed)),
            ("Failed", fmt_num(failed)),
            ("Cancelled", fmt_num(cancelled)),
            ("Published", fmt_num(published.into_inner())),
            ("Elapsed", format!("{:.1}s", start.elapsed().as_secs_f64())),
        ],
    );

    Ok(if cancelled > 0 {
        ExitCode::from(130)
    } else if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
