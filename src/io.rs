//! Per-request I/O handles exposed through the environment.
//!
//! [`RackInput`] is the `rack.input` body stream, [`ErrorSink`] the shared
//! `rack.errors` diagnostic stream, and [`Transport`] the raw connection
//! byte stream handed to the application after a hijack.

use std::fmt;
use std::io::{self, Cursor, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Raw byte stream, as exposed by the underlying connection transport.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RawStream for T {}

/// Handle wrapping the raw connection transport.
///
/// Installed into the environment as `rack.hijack_io` once the hijack
/// callable fired. From that point on the application drives this stream
/// directly and the server layer no longer frames anything on it.
pub struct Transport {
    io: Box<dyn RawStream>,
}

impl Transport {
    pub fn new(io: impl RawStream) -> Self {
        Self { io: Box::new(io) }
    }

    /// Unwrap into the underlying boxed stream.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn RawStream> {
        self.io
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

/// Request body stream, exposed as `rack.input`.
pub struct RackInput {
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl RackInput {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }

    /// Input backed by an already buffered body.
    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self::new(Cursor::new(bytes))
    }

    /// Input for a request without a body.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }
}

impl fmt::Debug for RackInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RackInput").finish_non_exhaustive()
    }
}

impl AsyncRead for RackInput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// Shared diagnostic sink, exposed as `rack.errors`.
///
/// Opened once per server and cloned into every request environment.
/// The underlying writer is never closed by this crate; dropping the
/// last clone only drops the handle.
#[derive(Clone)]
pub struct ErrorSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ErrorSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Sink writing to the process standard error stream.
    #[must_use]
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink").finish_non_exhaustive()
    }
}
