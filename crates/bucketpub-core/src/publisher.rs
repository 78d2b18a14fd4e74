//! Batching publisher: groups records into windows and hands them to the bus.
//!
//! A run uses three kinds of threads inside one `std::thread::scope`:
//!
//! - a puller drains the record iterator into a rendezvous-sized channel, so the
//!   parser never runs more than one record ahead of the window being filled;
//! - the calling thread fills windows and closes them on count or latency;
//! - one sender thread per closed window calls [`BusClient::send`], holding a
//!   [`Semaphore`] permit so at most `max_in_flight` windows are outstanding.
//!
//! Sender threads take their turn at a [`Turnstile`] keyed by window id, so
//! `send` calls begin in parse order. Completions come back tagged with their
//! window id and are tallied in whatever order they finish.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::Scope;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;

use crate::error::PipelineError;
use crate::model::{
    FrozenProvenance, OutgoingMessage, ProvenanceContext, RecordFailure, RecordValue, RunResult,
};
use crate::provider::{Ack, BusClient, BusUnavailable};
use crate::semaphore::{Semaphore, Turnstile};
use crate::shutdown::CancelToken;

/// Upper bound on how long the window loop goes without checking for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Records reserved up front for a window; larger windows grow on demand
const WINDOW_PREALLOC: usize = 1024;

/// Window bounds and bus concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Close a window once it holds this many records
    pub max_records: usize,
    /// Close a window this long after its first record arrived
    pub max_latency: Duration,
    /// Windows submitted to the bus and not yet answered
    pub max_in_flight: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: 100,
            max_latency: Duration::from_millis(1000),
            max_in_flight: 2,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_records == 0 {
            return Err(PipelineError::Input(
                "batch max_records must be greater than 0".to_string(),
            ));
        }
        if self.max_latency.is_zero() {
            return Err(PipelineError::Input(
                "batch max_latency_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(PipelineError::Input(
                "batch max_in_flight must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A publish that ended early. `partial` tallies every window that was
/// answered before the run stopped; those messages stay published.
#[derive(Debug)]
pub struct Aborted {
    pub error: PipelineError,
    pub partial: RunResult,
}

pub struct BatchPublisher {
    bus: Arc<dyn BusClient>,
    config: BatchConfig,
    progress: ProgressBar,
}

impl BatchPublisher {
    /// Fails with [`PipelineError::Input`] on a zero bound.
    pub fn new(bus: Arc<dyn BusClient>, config: BatchConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            bus,
            config,
            progress: ProgressBar::hidden(),
        })
    }

    /// Advance `pb` by the number of acknowledged records.
    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        self.progress = pb;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn publish<I>(
        &self,
        records: I,
        provenance: &ProvenanceContext,
        cancel: &CancelToken,
    ) -> Result<RunResult, Aborted>
    where
        I: Iterator<Item = Result<RecordValue, PipelineError>> + Send,
    {
        self.publish_with(records, provenance, cancel, || {})
    }

    /// Drain `records` onto the bus.
    ///
    /// `on_exhausted` runs once, when the iterator ends normally and before
    /// the final partial window is flushed. On cancellation or a fatal error
    /// the partial window is dropped unsent; windows already submitted are
    /// awaited and counted.
    pub fn publish_with<I, F>(
        &self,
        records: I,
        provenance: &ProvenanceContext,
        cancel: &CancelToken,
        on_exhausted: F,
    ) -> Result<RunResult, Aborted>
    where
        I: Iterator<Item = Result<RecordValue, PipelineError>> + Send,
        F: FnOnce(),
    {
        let frozen = provenance.freeze().map_err(|e| Aborted {
            error: PipelineError::Input(format!("provenance is not serializable: {e}")),
            partial: RunResult::default(),
        })?;

        let halt = AtomicBool::new(false);
        let in_flight = Semaphore::new(self.config.max_in_flight);
        let turns = Turnstile::new();
        let (done_tx, done_rx) = mpsc::channel();
        let mut tally = Tally::new(&self.progress);

        let stop = std::thread::scope(|s| {
            let (record_tx, record_rx) = mpsc::sync_channel(1);
            let halt_ref = &halt;
            s.spawn(move || pull_records(records, record_tx, cancel, halt_ref));

            let mut dispatch = Dispatch {
                bus: &*self.bus,
                in_flight: &in_flight,
                turns: &turns,
                halt: &halt,
                cancel,
                done_tx,
                next_id: 0,
            };
            let stop = self.fill_windows(
                s,
                &record_rx,
                &done_rx,
                &frozen,
                cancel,
                &mut dispatch,
                &mut tally,
                on_exhausted,
            );

            // Unblock the puller and let the channel close once every sender is done
            drop(record_rx);
            drop(dispatch);
            for done in done_rx.iter() {
                tally.absorb(done);
            }
            stop
        });

        let Tally {
            mut result,
            unavailable,
            ..
        } = tally;
        result.failures.sort_by_key(|f| f.index);

        let error = match stop {
            Stop::Failed(e) => Some(e),
            Stop::BusDown => Some(unavailable.map_or_else(
                || PipelineError::BusUnavailable("bus stopped accepting batches".to_string()),
                PipelineError::from,
            )),
            Stop::Cancelled => Some(unavailable.map_or(PipelineError::Cancelled, PipelineError::from)),
            Stop::Exhausted => unavailable.map(PipelineError::from),
        };
        match error {
            None => Ok(result),
            Some(error) => Err(Aborted {
                error,
                partial: result,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_windows<'scope, 'env: 'scope, 'a: 'scope>(
        &self,
        s: &'scope Scope<'scope, 'env>,
        record_rx: &Receiver<Result<RecordValue, PipelineError>>,
        done_rx: &Receiver<WindowDone>,
        frozen: &FrozenProvenance,
        cancel: &CancelToken,
        dispatch: &mut Dispatch<'a>,
        tally: &mut Tally<'_>,
        on_exhausted: impl FnOnce(),
    ) -> Stop {
        let BatchConfig {
            max_records,
            max_latency,
            ..
        } = self.config;
        let capacity = max_records.min(WINDOW_PREALLOC);
        let mut window: Vec<OutgoingMessage> = Vec::with_capacity(capacity);
        let mut opened: Option<Instant> = None;
        let mut index = 0usize;

        loop {
            while let Ok(done) = done_rx.try_recv() {
                tally.absorb(done);
            }
            if dispatch.halt.load(Ordering::Relaxed) {
                discard(&window, "bus unavailable");
                return Stop::BusDown;
            }
            if cancel.is_cancelled() {
                discard(&window, "run cancelled");
                return Stop::Cancelled;
            }

            let wait = opened.map_or(CANCEL_POLL, |t| {
                max_latency.saturating_sub(t.elapsed()).min(CANCEL_POLL)
            });
            match record_rx.recv_timeout(wait) {
                Ok(Ok(value)) => {
                    let position = index;
                    index += 1;
                    if is_blank(&value) {
                        tally.result.skipped_count += 1;
                    } else {
                        match OutgoingMessage::encode(position, &value, frozen) {
                            Ok(msg) => {
                                opened.get_or_insert_with(Instant::now);
                                window.push(msg);
                            }
                            Err(e) => tally.fail(position, format!("record not serializable: {e}")),
                        }
                    }
                }
                Ok(Err(e)) => {
                    discard(&window, "upstream error");
                    return Stop::Failed(e);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // The puller also stops on cancel or halt; only a clean end flushes
                    if dispatch.halt.load(Ordering::Relaxed) {
                        discard(&window, "bus unavailable");
                        return Stop::BusDown;
                    }
                    if cancel.is_cancelled() {
                        discard(&window, "run cancelled");
                        return Stop::Cancelled;
                    }
                    on_exhausted();
                    if !window.is_empty() {
                        dispatch.submit(s, window);
                    }
                    return Stop::Exhausted;
                }
            }

            let due = window.len() >= max_records
                || opened.is_some_and(|t| t.elapsed() >= max_latency);
            if due && !window.is_empty() {
                opened = None;
                let full = std::mem::replace(&mut window, Vec::with_capacity(capacity));
                dispatch.submit(s, full);
            }
        }
    }
}

/// Why the window loop stopped
enum Stop {
    Exhausted,
    Cancelled,
    Failed(PipelineError),
    BusDown,
}

/// Null, `false`, `0` and `""` carry nothing worth publishing.
pub fn is_blank(value: &RecordValue) -> bool {
    match value {
        RecordValue::Null => true,
        RecordValue::Bool(b) => !b,
        RecordValue::Number(n) => n.as_f64() == Some(0.0),
        RecordValue::String(s) => s.is_empty(),
        RecordValue::Array(_) | RecordValue::Object(_) => false,
    }
}

fn discard(window: &[OutgoingMessage], reason: &str) {
    if !window.is_empty() {
        log::debug!("{reason}: dropping unsent window of {} records", window.len());
    }
}

/// Puller side. Checks for cancellation before every pull and stops after
/// forwarding the first error.
fn pull_records<I>(
    mut records: I,
    tx: SyncSender<Result<RecordValue, PipelineError>>,
    cancel: &CancelToken,
    halt: &AtomicBool,
) where
    I: Iterator<Item = Result<RecordValue, PipelineError>>,
{
    loop {
        if cancel.is_cancelled() || halt.load(Ordering::Relaxed) {
            return;
        }
        let Some(item) = records.next() else {
            return;
        };
        let failed = item.is_err();
        if tx.send(item).is_err() || failed {
            return;
        }
    }
}

struct WindowDone {
    id: usize,
    indices: Vec<usize>,
    outcome: Result<Vec<Ack>, BusUnavailable>,
}

struct Dispatch<'a> {
    bus: &'a dyn BusClient,
    in_flight: &'a Semaphore,
    turns: &'a Turnstile,
    halt: &'a AtomicBool,
    cancel: &'a CancelToken,
    done_tx: Sender<WindowDone>,
    next_id: usize,
}

impl<'a> Dispatch<'a> {
    /// Blocks while `max_in_flight` windows are outstanding. A window whose
    /// turn comes after the bus went down or the run was cancelled is dropped.
    fn submit<'scope, 'env>(&mut self, s: &'scope Scope<'scope, 'env>, batch: Vec<OutgoingMessage>)
    where
        'a: 'scope,
    {
        let permit = self.in_flight.acquire();
        if self.halt.load(Ordering::Relaxed) {
            discard(&batch, "bus unavailable");
            return;
        }
        if self.cancel.is_cancelled() {
            discard(&batch, "run cancelled");
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        log::debug!("window {id}: submitting {} records", batch.len());

        let bus = self.bus;
        let turns = self.turns;
        let halt = self.halt;
        let done_tx = self.done_tx.clone();
        s.spawn(move || {
            turns.wait_turn(id);
            let outcome = deliver(bus, &batch);
            if outcome.is_err() {
                halt.store(true, Ordering::Relaxed);
            }
            drop(permit);
            let indices = batch.iter().map(|m| m.index).collect();
            let _ = done_tx.send(WindowDone {
                id,
                indices,
                outcome,
            });
        });
    }
}

/// `send`, with a panicking bus client treated as an unavailable bus so the
/// run still reaches a terminal outcome.
fn deliver(bus: &dyn BusClient, batch: &[OutgoingMessage]) -> Result<Vec<Ack>, BusUnavailable> {
    panic::catch_unwind(AssertUnwindSafe(|| bus.send(batch))).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(BusUnavailable(format!("bus client panicked: {reason}")))
    })
}

struct Tally<'p> {
    result: RunResult,
    unavailable: Option<BusUnavailable>,
    progress: &'p ProgressBar,
}

impl<'p> Tally<'p> {
    fn new(progress: &'p ProgressBar) -> Self {
        Self {
            result: RunResult::default(),
            unavailable: None,
            progress,
        }
    }

    fn absorb(&mut self, done: WindowDone) {
        let acks = match done.outcome {
            Ok(acks) => acks,
            Err(e) => {
                log::error!("window {}: {e}", done.id);
                self.unavailable.get_or_insert(e);
                return;
            }
        };
        if acks.len() > done.indices.len() {
            log::warn!(
                "window {}: bus returned {} acks for {} messages",
                done.id,
                acks.len(),
                done.indices.len()
            );
        }

        let total = done.indices.len();
        let mut acked = 0usize;
        for (pos, index) in done.indices.into_iter().enumerate() {
            match acks.get(pos) {
                Some(Ok(())) => acked += 1,
                Some(Err(reason)) => self.fail(index, reason.clone()),
                None => self.fail(index, "no acknowledgment from bus".to_string()),
            }
        }
        self.result.published_count += acked;
        self.progress.inc(acked as u64);
        log::debug!("window {}: {acked}/{total} acknowledged", done.id);
    }

    fn fail(&mut self, index: usize, error: String) {
        log::warn!("record {index} not published: {error}");
        self.result.failures.push(RecordFailure { index, error });
    }
}
