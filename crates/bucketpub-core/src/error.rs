//! Error taxonomy for a single pipeline run

use std::io;

/// Failure reading the archive container around the record document.
#[derive(Debug)]
pub enum ArchiveError {
    /// Unrecognised header, unsupported compression method, encrypted member,
    /// checksum mismatch
    Format(String),
    /// Container is well-formed but holds no members
    Empty,
    /// Input ended inside the selected member
    Truncated(String),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Format(msg) => write!(f, "invalid archive: {msg}"),
            Self::Empty => write!(f, "archive contains no members"),
            Self::Truncated(msg) => write!(f, "truncated archive: {msg}"),
        }
    }
}

impl std::error::Error for ArchiveError {}

/// Archive errors raised inside a `Read` impl ride inside an `io::Error`
/// and are recovered by [`PipelineError::from`].
impl From<ArchiveError> for io::Error {
    fn from(e: ArchiveError) -> Self {
        let kind = match e {
            ArchiveError::Truncated(_) => io::ErrorKind::UnexpectedEof,
            ArchiveError::Format(_) | ArchiveError::Empty => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}

/// Error that ends a pipeline run.
///
/// Per-record publish rejections are not represented here; they are collected
/// in [`RunResult::failures`](crate::model::RunResult) and never abort a run.
#[derive(Debug)]
pub enum PipelineError {
    /// Triggering event or configuration is unusable (missing bucket/object id,
    /// zero batch bounds, empty array path)
    Input(String),
    /// Source object does not exist
    NotFound(String),
    Archive(ArchiveError),
    /// Record document is not valid JSON; `offset` is the byte position in the
    /// decompressed document
    MalformedJson { offset: u64, message: String },
    MetadataUnavailable(String),
    /// The bus cannot accept any message (as opposed to rejecting one)
    BusUnavailable(String),
    Io(io::Error),
    Cancelled,
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input(msg) => write!(f, "{msg}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::Archive(e) => write!(f, "{e}"),
            Self::MalformedJson { offset, message } => {
                write!(f, "malformed JSON at byte {offset}: {message}")
            }
            Self::MetadataUnavailable(msg) => write!(f, "metadata unavailable: {msg}"),
            Self::BusUnavailable(msg) => write!(f, "bus unavailable: {msg}"),
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Archive(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl PipelineError {
    /// Stable name reported as `errorKind` in the terminal callback.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "InputError",
            Self::NotFound(_) => "NotFoundError",
            Self::Archive(ArchiveError::Format(_)) => "FormatError",
            Self::Archive(ArchiveError::Empty) => "EmptyArchiveError",
            Self::Archive(ArchiveError::Truncated(_)) => "TruncatedInputError",
            Self::MalformedJson { .. } => "MalformedJsonError",
            Self::MetadataUnavailable(_) => "MetadataUnavailableError",
            Self::BusUnavailable(_) => "BusUnavailableError",
            Self::Io(_) => "IoError",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether re-running the same event could succeed.
    ///
    /// Archive, JSON and input errors are properties of the object itself and
    /// will fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MetadataUnavailable(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl From<ArchiveError> for PipelineError {
    fn from(e: ArchiveError) -> Self {
        Self::Archive(e)
    }
}

impl From<io::Error> for PipelineError {
    fn from(e: io::Error) -> Self {
        if !e.get_ref().is_some_and(|inner| inner.is::<ArchiveError>()) {
            return Self::Io(e);
        }
        match e.into_inner().map(|inner| inner.downcast::<ArchiveError>()) {
            Some(Ok(archive)) => Self::Archive(*archive),
            Some(Err(other)) => Self::Io(io::Error::other(other)),
            None => Self::Io(io::Error::other("archive reader failed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_error_survives_io_round_trip() {
        let io_err: io::Error = ArchiveError::Truncated("member cut short".into()).into();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);
        let err = PipelineError::from(io_err);
        assert_eq!(err.kind(), "TruncatedInputError");
    }

    #[test]
    fn plain_io_error_stays_io() {
        let err = PipelineError::from(io::Error::new(io::ErrorKind::TimedOut, "stall"));
        assert_eq!(err.kind(), "IoError");
        assert!(err.is_retryable());
    }

    #[test]
    fn kinds_match_taxonomy() {
        assert_eq!(
            PipelineError::Archive(ArchiveError::Empty).kind(),
            "EmptyArchiveError"
        );
        assert_eq!(
            PipelineError::Archive(ArchiveError::Format("x".into())).kind(),
            "FormatError"
        );
        assert_eq!(
            PipelineError::MalformedJson {
                offset: 3,
                message: "x".into()
            }
            .kind(),
            "MalformedJsonError"
        );
        assert_eq!(PipelineError::Cancelled.kind(), "Cancelled");
    }

    #[test]
    fn metadata_unavailable_retryable() {
        assert!(PipelineError::MetadataUnavailable("down".into()).is_retryable());
    }

    #[test]
    fn object_errors_not_retryable() {
        assert!(!PipelineError::Archive(ArchiveError::Empty).is_retryable());
        assert!(!PipelineError::Input("no bucket".into()).is_retryable());
        assert!(!PipelineError::BusUnavailable("gone".into()).is_retryable());
    }

    #[test]
    fn display_malformed_json_has_offset() {
        let err = PipelineError::MalformedJson {
            offset: 42,
            message: "expected value".into(),
        };
        assert_eq!(format!("{err}"), "malformed JSON at byte 42: expected value");
    }
}
