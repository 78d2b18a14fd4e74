//! One pipeline run: source → archive member → array elements → bus.
//!
//! ```text
//! Idle → FetchingMetadata → Streaming → Draining → Completed
//!                │               │          │
//!                └───────────────┴──────────┴──→ Failed | Cancelled
//! ```
//!
//! States only move forward. Every run ends in exactly one terminal state and
//! produces exactly one [`RunOutcome`].

use std::sync::Arc;

use indicatif::ProgressBar;
use serde_json::{Value, json};

use crate::archive;
use crate::enrich::MetadataEnricher;
use crate::error::PipelineError;
use crate::json_stream::{self, JsonPath};
use crate::model::{ProvenanceContext, RunResult, SourceEvent};
use crate::progress::fmt_num;
use crate::provider::{BusClient, MetadataProvider, SourceProvider};
use crate::publisher::{Aborted, BatchConfig, BatchPublisher};
use crate::shutdown::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Idle,
    FetchingMetadata,
    Streaming,
    Draining,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Terminal value of a run, handed to the completion callback.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunResult),
    /// Messages already published stay published
    Failed {
        error: PipelineError,
        published_count: usize,
    },
    Cancelled {
        published_count: usize,
    },
}

impl RunOutcome {
    pub fn state(&self) -> RunState {
        match self {
            Self::Completed(_) => RunState::Completed,
            Self::Failed { .. } => RunState::Failed,
            Self::Cancelled { .. } => RunState::Cancelled,
        }
    }

    pub fn published_count(&self) -> usize {
        match self {
            Self::Completed(result) => result.published_count,
            Self::Failed {
                published_count, ..
            }
            | Self::Cancelled { published_count } => *published_count,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Callback payload: `{"publishedCount"}` (plus `failures` when any record
    /// was rejected) on success, `{"errorKind", "message", "publishedCount"}`
    /// otherwise.
    pub fn report(&self) -> Value {
        match self {
            Self::Completed(result) if result.failures.is_empty() => {
                json!({ "publishedCount": result.published_count })
            }
            Self::Completed(result) => json!({
                "publishedCount": result.published_count,
                "failures": result.failures,
            }),
            Self::Failed {
                error,
                published_count,
            } => json!({
                "errorKind": error.kind(),
                "message": error.to_string(),
                "publishedCount": published_count,
            }),
            Self::Cancelled { published_count } => json!({
                "errorKind": PipelineError::Cancelled.kind(),
                "message": PipelineError::Cancelled.to_string(),
                "publishedCount": published_count,
            }),
        }
    }
}

/// Current state of one run, logged on every transition.
struct RunTracker {
    label: String,
    state: RunState,
}

impl RunTracker {
    fn new(label: String) -> Self {
        Self {
            label,
            state: RunState::Idle,
        }
    }

    fn enter(&mut self, next: RunState) {
        debug_assert!(
            next > self.state && !self.state.is_terminal(),
            "{}: illegal transition {:?} -> {next:?}",
            self.label,
            self.state
        );
        log::debug!("{}: {:?} -> {next:?}", self.label, self.state);
        self.state = next;
    }

    fn finish(mut self, outcome: RunOutcome) -> RunOutcome {
        self.enter(outcome.state());
        match &outcome {
            RunOutcome::Completed(result) => log::info!(
                "{}: published {} records ({} rejected, {} skipped)",
                self.label,
                fmt_num(result.published_count),
                result.failures.len(),
                result.skipped_count
            ),
            RunOutcome::Failed {
                error,
                published_count,
            } => log::error!(
                "{}: {} after {} published: {error}",
                self.label,
                error.kind(),
                fmt_num(*published_count)
            ),
            RunOutcome::Cancelled { published_count } => log::warn!(
                "{}: cancelled after {} published",
                self.label,
                fmt_num(*published_count)
            ),
        }
        outcome
    }

    fn fail(self, error: PipelineError, published_count: usize) -> RunOutcome {
        if matches!(error, PipelineError::Cancelled) {
            return self.finish(RunOutcome::Cancelled { published_count });
        }
        self.finish(RunOutcome::Failed {
            error,
            published_count,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub array_path: JsonPath,
    pub batch: BatchConfig,
}

/// Wiring of collaborators shared by every run in the process.
pub struct Pipeline {
    source: Arc<dyn SourceProvider>,
    bus: Arc<dyn BusClient>,
    enricher: Option<MetadataEnricher>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Fails with [`PipelineError::Input`] on invalid batch bounds.
    pub fn new(
        source: Arc<dyn SourceProvider>,
        bus: Arc<dyn BusClient>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.batch.validate()?;
        Ok(Self {
            source,
            bus,
            enricher: None,
            config,
        })
    }

    /// Enable the metadata step.
    pub fn with_metadata(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.enricher = Some(MetadataEnricher::new(provider));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one run and hand its outcome to `on_complete`.
    pub fn run(&self, event: &SourceEvent, cancel: &CancelToken, on_complete: impl FnOnce(RunOutcome)) {
        on_complete(self.execute(event, cancel));
    }

    pub fn execute(&self, event: &SourceEvent, cancel: &CancelToken) -> RunOutcome {
        self.execute_with_progress(event, cancel, ProgressBar::hidden())
    }

    /// Like [`execute`](Self::execute), advancing `pb` as records are acknowledged.
    pub fn execute_with_progress(
        &self,
        event: &SourceEvent,
        cancel: &CancelToken,
        pb: ProgressBar,
    ) -> RunOutcome {
        let mut tracker = RunTracker::new(event.label());
        if let Err(e) = event.validate() {
            return tracker.fail(e, 0);
        }
        log::info!("{}: run started from {}", tracker.label, self.source.describe());

        tracker.enter(RunState::FetchingMetadata);
        let provenance = match &self.enricher {
            Some(enricher) => match enricher.enrich(event) {
                Ok(ctx) => ctx,
                Err(e) => return tracker.fail(e, 0),
            },
            None => ProvenanceContext::from_event(event),
        };
        if cancel.is_cancelled() {
            return tracker.fail(PipelineError::Cancelled, 0);
        }

        tracker.enter(RunState::Streaming);
        let member = match self
            .source
            .open(&event.bucket_id, &event.object_id)
            .and_then(archive::open)
        {
            Ok(member) => member,
            Err(e) => return tracker.fail(e, 0),
        };
        log::debug!(
            "{}: {:?} member {}",
            tracker.label,
            member.kind(),
            member.name().unwrap_or("<unnamed>")
        );

        let publisher = match BatchPublisher::new(self.bus.clone(), self.config.batch) {
            Ok(p) => p.with_progress(pb),
            Err(e) => return tracker.fail(e, 0),
        };
        let records = json_stream::parse(member, self.config.array_path.clone());
        let published = publisher.publish_with(records, &provenance, cancel, || {
            tracker.enter(RunState::Draining)
        });

        match published {
            Ok(result) => tracker.finish(RunOutcome::Completed(result)),
            Err(Aborted { error, partial }) => tracker.fail(error, partial.published_count),
        }
    }
}
