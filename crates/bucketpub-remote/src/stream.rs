//! Shared HTTP plumbing: process-wide client and runtime, response body as a
//! sync `Read` with stall detection.
//!
//! Requests run on a small shared tokio runtime; callers stay synchronous so
//! the pipeline's threads can pull bytes with plain `Read`.

use std::io::{self, Read};
use std::pin::Pin;
use std::sync::{LazyLock, OnceLock};
use std::task::Context;
use std::time::Duration;

use bucketpub_core::PipelineError;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, ReadBuf};

/// Timeouts and retry budget for every remote collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpConfig {
    /// No data for this long while streaming a body = stall
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    /// Run-level retries for retryable startup failures
    pub max_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

static HTTP_CONFIG: OnceLock<HttpConfig> = OnceLock::new();

/// Install the process-wide config. Only the first call takes effect, and it
/// must happen before the first request builds the shared client.
pub fn set_http_config(config: HttpConfig) {
    if HTTP_CONFIG.set(config).is_err() {
        log::debug!("HTTP config already set, keeping the first one");
    }
}

pub fn http_config() -> &'static HttpConfig {
    HTTP_CONFIG.get_or_init(HttpConfig::default)
}

/// Failure of one HTTP exchange
#[derive(Debug)]
pub enum StreamError {
    /// `status` is `None` when no response arrived (DNS, connect, TLS)
    Http {
        status: Option<u16>,
        message: String,
    },
    Io(io::Error),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Http {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {}

impl StreamError {
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        Self::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => *status,
            Self::Io(_) => None,
        }
    }

    /// Transport failures, throttling and server errors may clear up;
    /// other client errors will not.
    pub fn is_retryable(&self) -> bool {
        match self.status() {
            None => true,
            Some(s) => s == 408 || s == 429 || s >= 500,
        }
    }
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// 404 becomes [`PipelineError::NotFound`]; retryable failures keep a
/// retryable I/O kind so the run can be retried as a whole.
impl From<StreamError> for PipelineError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(io) => Self::Io(io),
            StreamError::Http {
                status: Some(404),
                message,
            } => Self::NotFound(message),
            other if other.is_retryable() => {
                Self::Io(io::Error::new(io::ErrorKind::ConnectionAborted, other))
            }
            other => Self::Io(io::Error::other(other)),
        }
    }
}

/// Shared async HTTP client with connection pooling.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(http_config().connect_timeout)
        .pool_max_idle_per_host(8)
        .build()
        .expect("failed to build HTTP client")
});

pub fn http_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Send `request` and fail on a non-2xx status.
pub fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, StreamError> {
    SHARED_RUNTIME.handle().block_on(async {
        request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| StreamError::from_reqwest(&e))
    })
}

/// Collect a whole (small) response body.
pub fn read_body(response: reqwest::Response) -> Result<Vec<u8>, StreamError> {
    SHARED_RUNTIME.handle().block_on(async {
        let timeout = http_config().read_timeout;
        match tokio::time::timeout(timeout, response.bytes()).await {
            Ok(Ok(bytes)) => Ok(bytes.to_vec()),
            Ok(Err(e)) => Err(StreamError::from_reqwest(&e)),
            Err(_) => Err(StreamError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "response body timed out",
            ))),
        }
    })
}

/// Send `request` and expose the response body as a blocking reader.
pub fn open_body(request: reqwest::RequestBuilder) -> Result<TimeoutReader, StreamError> {
    let response = send(request)?;
    if let Some(len) = response.content_length() {
        log::debug!("{}: {len} bytes", response.url());
    }
    let stream = response.bytes_stream();
    let reader = tokio_util::io::StreamReader::new(stream.map(|r| r.map_err(io::Error::other)));
    Ok(TimeoutReader::new(Box::pin(reader)))
}

/// Async-to-sync bridge with read timeout.
///
/// Each read that sees no data within `read_timeout` fails with `TimedOut`.
pub struct TimeoutReader {
    inner: Pin<Box<dyn AsyncRead + Send + Sync>>,
    timeout: Duration,
}

impl TimeoutReader {
    fn new(inner: Pin<Box<dyn AsyncRead + Send + Sync>>) -> Self {
        Self {
            inner,
            timeout: http_config().read_timeout,
        }
    }
}

impl Read for TimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.timeout;
        SHARED_RUNTIME.handle().block_on(async {
            let read_future = async {
                let mut read_buf = ReadBuf::new(buf);
                std::future::poll_fn(|cx: &mut Context<'_>| {
                    Pin::as_mut(&mut self.inner).poll_read(cx, &mut read_buf)
                })
                .await?;
                Ok::<_, io::Error>(read_buf.filled().len())
            };

            match tokio::time::timeout(timeout, read_future).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("read timeout ({}s with no data)", timeout.as_secs()),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_err(status: u16) -> StreamError {
        StreamError::Http {
            status: Some(status),
            message: "test".to_string(),
        }
    }

    #[test]
    fn client_errors_not_retryable() {
        assert!(!http_err(400).is_retryable());
        assert!(!http_err(403).is_retryable());
        assert!(!http_err(404).is_retryable());
    }

    #[test]
    fn throttling_and_server_errors_retryable() {
        assert!(http_err(429).is_retryable());
        assert!(http_err(408).is_retryable());
        assert!(http_err(503).is_retryable());
    }

    #[test]
    fn no_status_retryable() {
        let err = StreamError::Http {
            status: None,
            message: "connection refused".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_maps_to_not_found() {
        let err = PipelineError::from(http_err(404));
        assert_eq!(err.kind(), "NotFoundError");
    }

    #[test]
    fn retryability_survives_conversion() {
        assert!(PipelineError::from(http_err(503)).is_retryable());
        assert!(!PipelineError::from(http_err(401)).is_retryable());
    }

    #[test]
    fn display_http_with_status() {
        assert_eq!(format!("{}", http_err(404)), "HTTP 404: test");
    }

    #[test]
    fn default_config() {
        let cfg = HttpConfig::default();
        assert_eq!(cfg.read_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_retries, 3);
    }
}
