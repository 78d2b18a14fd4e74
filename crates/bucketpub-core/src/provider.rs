//! Collaborator seams: where bytes come from, where metadata comes from,
//! where messages go.
//!
//! Implementations are built once per process and shared across runs behind
//! `Arc`, so every trait requires `Send + Sync` and takes `&self`.

use std::io::Read;

use crate::error::PipelineError;
use crate::model::{Attributes, OutgoingMessage};

/// Forward-only byte stream handed from stage to stage.
pub type ByteStream = Box<dyn Read + Send>;

/// Opens the raw bytes of a stored object.
pub trait SourceProvider: Send + Sync {
    /// Fails with [`PipelineError::NotFound`] when the object does not exist.
    fn open(&self, bucket_id: &str, object_id: &str) -> Result<ByteStream, PipelineError>;

    /// Short name for logs
    fn describe(&self) -> String;
}

/// Looks up custom metadata attached to a stored object.
pub trait MetadataProvider: Send + Sync {
    fn get(&self, bucket_id: &str, object_id: &str) -> Result<Attributes, PipelineError>;
}

/// Per-message acknowledgment. `Err` carries the bus's rejection reason.
pub type Ack = Result<(), String>;

/// The bus refused the whole batch and no further batch can succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusUnavailable(pub String);

impl std::fmt::Display for BusUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BusUnavailable {}

impl From<BusUnavailable> for PipelineError {
    fn from(e: BusUnavailable) -> Self {
        Self::BusUnavailable(e.0)
    }
}

/// Transmits one batch of messages.
///
/// Called concurrently from several publisher threads. The returned vector is
/// positional: `acks[i]` belongs to `batch[i]`. A short vector leaves the
/// trailing messages unacknowledged, which the publisher records as failures.
/// Delivery is at-least-once; callers do not dedupe.
pub trait BusClient: Send + Sync {
    fn send(&self, batch: &[OutgoingMessage]) -> Result<Vec<Ack>, BusUnavailable>;
}
