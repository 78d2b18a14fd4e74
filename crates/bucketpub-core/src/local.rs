//! In-process collaborators: local files in, NDJSON file or log out

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::PipelineError;
use crate::model::{Attributes, OutgoingMessage};
use crate::provider::{Ack, BusClient, BusUnavailable, ByteStream, MetadataProvider, SourceProvider};

/// Reads `<root>/<bucket>/<object>` from the local filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemSource {
    root: PathBuf,
}

impl FilesystemSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path for an object. Ids that would escape the root are rejected.
    pub fn resolve(&self, bucket_id: &str, object_id: &str) -> Result<PathBuf, PipelineError> {
        let mut path = self.root.clone();
        for part in [bucket_id, object_id] {
            let rel = Path::new(part);
            if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
                return Err(PipelineError::Input(format!(
                    "{part:?} is not a relative path inside the source root"
                )));
            }
            path.push(rel);
        }
        Ok(path)
    }
}

impl SourceProvider for FilesystemSource {
    fn open(&self, bucket_id: &str, object_id: &str) -> Result<ByteStream, PipelineError> {
        let path = self.resolve(bucket_id, object_id)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(PipelineError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(PipelineError::Io(e)),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

/// Same metadata for every object.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata(pub Attributes);

impl MetadataProvider for StaticMetadata {
    fn get(&self, _bucket_id: &str, _object_id: &str) -> Result<Attributes, PipelineError> {
        Ok(self.0.clone())
    }
}

/// Appends each message as one line to a file.
///
/// Shared by concurrent runs; a whole window is written under one lock so
/// windows never interleave within the file.
pub struct NdjsonBus {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl std::fmt::Debug for NdjsonBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdjsonBus")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl NdjsonBus {
    /// Open `path` for appending, creating parent directories.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_window(&self, batch: &[OutgoingMessage]) -> io::Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| io::Error::other("writer poisoned by an earlier panic"))?;
        for msg in batch {
            out.write_all(&msg.payload)?;
            out.write_all(b"\n")?;
        }
        out.flush()
    }
}

impl BusClient for NdjsonBus {
    fn send(&self, batch: &[OutgoingMessage]) -> Result<Vec<Ack>, BusUnavailable> {
        self.write_window(batch)
            .map_err(|e| BusUnavailable(format!("{}: {e}", self.path.display())))?;
        Ok(vec![Ok(()); batch.len()])
    }
}

/// Dry run: logs each window instead of sending it.
#[derive(Debug, Default)]
pub struct LogBus {
    messages: AtomicUsize,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages seen so far
    pub fn message_count(&self) -> usize {
        self.messages.load(Ordering::Relaxed)
    }
}

impl BusClient for LogBus {
    fn send(&self, batch: &[OutgoingMessage]) -> Result<Vec<Ack>, BusUnavailable> {
        let bytes: usize = batch.iter().map(|m| m.payload.len()).sum();
        let total = self.messages.fetch_add(batch.len(), Ordering::Relaxed) + batch.len();
        log::info!(
            "dry run: window of {} messages ({bytes} bytes), {total} total",
            batch.len()
        );
        if let Some(first) = batch.first() {
            log::trace!("dry run: first message {}", first.as_str());
        }
        Ok(vec![Ok(()); batch.len()])
    }
}
