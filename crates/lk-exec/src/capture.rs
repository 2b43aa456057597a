//! Output sinks and the shared capture buffer

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

/// Default cap on captured bytes
pub const DEFAULT_CAPTURE_LIMIT: usize = 1024 * 1024;

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Byte buffer shared between concurrent stream readers.
///
/// The lock is taken only for the duration of a single append. Bytes past
/// the limit are dropped and the buffer is marked truncated.
#[derive(Clone)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Captured>>,
    limit: usize,
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_CAPTURE_LIMIT)
    }
}

impl CaptureBuffer {
    /// Create an empty buffer holding at most [`DEFAULT_CAPTURE_LIMIT`] bytes
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer holding at most `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Captured::default())),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Captured> {
        // A panicking appender cannot leave the Vec half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a chunk, keeping only what fits under the limit
    pub fn append(&self, chunk: &[u8]) {
        let mut captured = self.lock();
        let room = self.limit.saturating_sub(captured.bytes.len());
        if chunk.len() > room {
            captured.truncated = true;
        }
        let keep = chunk.len().min(room);
        captured.bytes.extend_from_slice(&chunk[..keep]);
    }

    /// Copy of the captured bytes
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    /// Captured bytes as (lossy) UTF-8
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock().bytes).into_owned()
    }

    /// Number of captured bytes
    pub fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    /// Whether nothing was captured
    pub fn is_empty(&self) -> bool {
        self.lock().bytes.is_empty()
    }

    /// Whether output was dropped for exceeding the limit
    pub fn truncated(&self) -> bool {
        self.lock().truncated
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl std::fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureBuffer")
            .field("len", &self.len())
            .field("truncated", &self.truncated())
            .finish()
    }
}

/// Where a child output stream is displayed in real time
#[derive(Clone, Debug, Default)]
pub enum OutputSink {
    /// The daemon's own stdout/stderr
    #[default]
    Inherit,
    /// Dropped
    Discard,
    /// Collected in a buffer
    Buffer(CaptureBuffer),
}

/// Which standard stream a sink stands in for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl OutputSink {
    /// Open an async writer for this sink
    pub(crate) fn writer(&self, stream: StreamKind) -> Box<dyn AsyncWrite + Send + Unpin> {
        match (self, stream) {
            (OutputSink::Inherit, StreamKind::Stdout) => Box::new(tokio::io::stdout()),
            (OutputSink::Inherit, StreamKind::Stderr) => Box::new(tokio::io::stderr()),
            (OutputSink::Discard, _) => Box::new(tokio::io::sink()),
            (OutputSink::Buffer(buffer), _) => Box::new(BufferWriter(buffer.clone())),
        }
    }
}

struct BufferWriter(CaptureBuffer);

impl AsyncWrite for BufferWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.append(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
