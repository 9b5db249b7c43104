//! Per-connection session state and identifiers
//!
//! A `Session` owns one accepted stream (TCP, unix, or an in-memory duplex in
//! tests) split into a buffered reader and writer.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};

/// Upper bound on flushing and shutting down a stream being closed
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Any bidirectional byte stream a session can run over
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn SessionStream>;

/// Unique identifier for a session (nanosecond clock reading, bumped on ties)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates strictly increasing session identifiers.
///
/// Identifiers are taken from the wall clock in nanoseconds. When two calls
/// land on the same tick (or the clock steps backwards) the previous value is
/// bumped by one instead, so every identifier is distinct and larger than the
/// last. Construct once and share by `Arc`.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<u64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let mut last = self.last.lock();
        let id = if now > *last { now } else { *last + 1 };
        *last = id;
        SessionId(id)
    }
}

/// Where a session's stream came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix(Option<PathBuf>),
    /// In-process stream with no socket address
    Local,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "tcp:{}", addr),
            PeerAddr::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddr::Unix(None) => write!(f, "unix:<unnamed>"),
            PeerAddr::Local => write!(f, "local"),
        }
    }
}

/// One accepted connection and its per-connection state
pub struct Session {
    id: SessionId,
    peer: PeerAddr,
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: BufWriter<WriteHalf<BoxedStream>>,
    /// Sanitized request header, once parsed
    subject: Option<String>,
}

impl Session {
    pub fn new(id: SessionId, peer: PeerAddr, stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            id,
            peer,
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            subject: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn set_subject(&mut self, subject: String) {
        self.subject = Some(subject);
    }

    pub fn reader_mut(&mut self) -> &mut BufReader<ReadHalf<BoxedStream>> {
        &mut self.reader
    }

    /// Write `payload` followed by `\n` and flush
    pub async fn write_line(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(payload).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Flush buffered output and shut down the write side
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }

    /// Flush and shut down the stream, then drop it.
    ///
    /// Consumes the session so a stream can only be closed once. Failures
    /// (peer already gone, stalled peer) are logged and otherwise ignored.
    pub async fn close(mut self) {
        let result = tokio::time::timeout(CLOSE_GRACE, self.shutdown()).await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Session {} close: {}", self.id, e),
            Err(_) => tracing::debug!("Session {} close timed out", self.id),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("subject", &self.subject)
            .finish()
    }
}
