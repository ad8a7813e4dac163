//! Stream handles a configuration can redirect a child's standard streams to.
//!
//! Whether a stream is redirected at all is carried by [`PipeTarget`], so the
//! runner never has to compare against a magic "null stream" instance.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

pub type SharedReader = Arc<Mutex<Box<dyn AsyncRead + Send + Unpin>>>;
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Redirection target for one standard stream.
#[derive(Clone, Debug, PartialEq)]
pub enum PipeTarget<S> {
    /// Leave the stream attached to the parent's (inherit).
    NoRedirect,
    Redirect(S),
}

impl<S> PipeTarget<S> {
    pub fn is_redirected(&self) -> bool {
        matches!(self, PipeTarget::Redirect(_))
    }

    pub fn as_redirect(&self) -> Option<&S> {
        match self {
            PipeTarget::Redirect(stream) => Some(stream),
            PipeTarget::NoRedirect => None,
        }
    }
}

impl<S> Default for PipeTarget<S> {
    fn default() -> Self {
        PipeTarget::NoRedirect
    }
}

impl<S> From<S> for PipeTarget<S> {
    fn from(stream: S) -> Self {
        PipeTarget::Redirect(stream)
    }
}

pub type InputPipe = PipeTarget<PipeSource>;
pub type OutputPipe = PipeTarget<PipeSink>;

/// Data fed into a child's standard input.
///
/// Text sources are encoded with the configuration's stdin encoding at the
/// moment they are piped; reader sources are copied byte for byte.
#[derive(Clone)]
pub enum PipeSource {
    Reader(SharedReader),
    Text(Arc<str>),
}

impl PipeSource {
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        PipeSource::Reader(Arc::new(Mutex::new(Box::new(reader))))
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_reader(io::Cursor::new(bytes.into()))
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        PipeSource::Text(Arc::from(text.into()))
    }
}

impl PartialEq for PipeSource {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PipeSource::Reader(a), PipeSource::Reader(b)) => Arc::ptr_eq(a, b),
            (PipeSource::Text(a), PipeSource::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for PipeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeSource::Reader(_) => f.write_str("PipeSource::Reader(..)"),
            PipeSource::Text(text) => write!(f, "PipeSource::Text({} bytes)", text.len()),
        }
    }
}

/// Caller-owned destination for a child's stdout or stderr.
#[derive(Clone)]
pub struct PipeSink(SharedWriter);

impl PipeSink {
    pub fn from_writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        PipeSink(Arc::new(Mutex::new(Box::new(writer))))
    }

    /// A sink backed by memory, together with a handle to read what was written.
    pub fn memory() -> (Self, MemorySink) {
        let memory = MemorySink::new();
        (Self::from_writer(memory.clone()), memory)
    }

    pub fn writer(&self) -> &SharedWriter {
        &self.0
    }
}

impl PartialEq for PipeSink {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PipeSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PipeSink(..)")
    }
}

/// Growable in-memory writer. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    buffer: Arc<StdMutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsyncWrite for MemorySink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
