//! bucketpub core: stream records out of a compressed JSON archive and
//! publish them to a message bus in bounded batches.
//!
//! The network-facing collaborators live in `bucketpub-remote`; this crate
//! holds the pipeline itself plus local stand-ins for the collaborators.

pub mod archive;
pub mod enrich;
pub mod error;
pub mod json_stream;
pub mod local;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod provider;
pub mod publisher;
pub mod retry;
pub mod semaphore;
pub mod shutdown;

// Re-exports for convenience
pub use archive::{ArchiveMember, ContainerKind};
pub use enrich::MetadataEnricher;
pub use error::{ArchiveError, PipelineError};
pub use json_stream::{ElementStream, JsonPath};
pub use local::{FilesystemSource, LogBus, NdjsonBus, StaticMetadata};
pub use logging::{IndicatifLogger, init_logging};
pub use model::{
    Attributes, OutgoingMessage, ProvenanceContext, RecordFailure, RecordValue, RunResult,
    SourceEvent,
};
pub use pipeline::{Pipeline, PipelineConfig, RunOutcome, RunState};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use provider::{Ack, BusClient, BusUnavailable, ByteStream, MetadataProvider, SourceProvider};
pub use publisher::{Aborted, BatchConfig, BatchPublisher, is_blank};
pub use retry::retry_with_backoff;
pub use shutdown::{CancelToken, is_shutdown_requested, request_shutdown, shutdown_flag};
