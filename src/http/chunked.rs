//! Response framing.
//!
//! HTTP/1.1 responses (other than to HEAD) are sent with chunked transfer
//! encoding; everything else is written as-is and the end of the body is
//! signalled by closing the connection.
//!
//! ## Layers
//!
//! - [`ChunkEncoder`]: pure framing into a `BytesMut`
//! - [`ResponseWriter`]: owns the socket write half, buffers framed output
//!   and refreshes the connection's idle timer on every write

use std::fmt::{self, Write as _};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::error::Status;
use super::idle::IdleTimer;
use super::request::{Method, Version};

/// Body framing for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Chunked,
    Identity,
}

impl Framing {
    /// Chunked iff the request is on the newest version and is not HEAD.
    pub fn negotiate(version: Version, method: Method) -> Self {
        if version == Version::NEWEST && method != Method::Head {
            Self::Chunked
        } else {
            Self::Identity
        }
    }
}

/// Frames body bytes according to a [`Framing`].
#[derive(Debug)]
pub struct ChunkEncoder {
    framing: Framing,
    /// Reused render buffer for formatted writes
    scratch: String,
}

impl ChunkEncoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            scratch: String::with_capacity(256),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
    }

    /// Frame `data` into `dst`.
    ///
    /// Empty payloads are dropped in chunked mode: a zero-length chunk is the
    /// end-of-body marker.
    pub fn encode(&self, data: &[u8], dst: &mut BytesMut) {
        match self.framing {
            Framing::Identity => dst.extend_from_slice(data),
            Framing::Chunked => {
                if data.is_empty() {
                    return;
                }
                // Writing into BytesMut cannot fail.
                let _ = write!(dst, "{:X}\r\n", data.len());
                dst.extend_from_slice(data);
                dst.extend_from_slice(b"\r\n");
            }
        }
    }

    /// Render `args` once into the scratch buffer, then frame the result.
    pub fn encode_fmt(&mut self, args: fmt::Arguments<'_>, dst: &mut BytesMut) {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let _ = scratch.write_fmt(args);
        self.encode(scratch.as_bytes(), dst);
        self.scratch = scratch;
    }

    /// Emit the end-of-body marker.
    pub fn finish(&self, dst: &mut BytesMut) {
        if self.framing == Framing::Chunked {
            dst.extend_from_slice(b"0\r\n\r\n");
        }
    }
}

/// Buffered response sink for one connection.
///
/// Writes are framed synchronously into an outbound buffer; `flush` pushes
/// the buffer to the socket. A writer outlives individual requests and is
/// re-targeted with [`ResponseWriter::begin`] for each one.
pub struct ResponseWriter {
    sink: Box<dyn AsyncWrite + Send + Unpin>,
    encoder: ChunkEncoder,
    out: BytesMut,
    version: Version,
    keep_alive: bool,
    idle: Arc<IdleTimer>,
    network_timeout: Duration,
}

impl ResponseWriter {
    pub fn new(
        sink: Box<dyn AsyncWrite + Send + Unpin>,
        idle: Arc<IdleTimer>,
        network_timeout: Duration,
    ) -> Self {
        Self {
            sink,
            encoder: ChunkEncoder::new(Framing::Identity),
            out: BytesMut::with_capacity(1024),
            version: Version::Http10,
            keep_alive: false,
            idle,
            network_timeout,
        }
    }

    /// Prepare for a new response to a request with the given version and method.
    pub fn begin(&mut self, version: Version, method: Method, keep_alive: bool) {
        self.encoder.set_framing(Framing::negotiate(version, method));
        self.version = version;
        // Without chunked framing the body ends at connection close.
        self.keep_alive = keep_alive && self.encoder.framing() == Framing::Chunked;
    }

    pub fn framing(&self) -> Framing {
        self.encoder.framing()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Status line plus the connection and transfer-encoding headers.
    ///
    /// The caller adds its own headers and terminates them with [`end_headers`](Self::end_headers).
    pub fn send_header(&mut self, status: Status) {
        let conn = if self.keep_alive { "keep-alive" } else { "close" };
        let _ = write!(
            self.out,
            "{} {}\r\nConnection: {}\r\n",
            self.version, status, conn
        );
        if self.framing() == Framing::Chunked {
            self.out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }

    pub fn header(&mut self, name: &str, value: &str) {
        let _ = write!(self.out, "{}: {}\r\n", name, value);
    }

    pub fn end_headers(&mut self) {
        self.out.extend_from_slice(b"\r\n");
    }

    /// Write a body fragment.
    pub fn write(&mut self, data: &[u8]) {
        self.idle.arm(self.network_timeout);
        self.encoder.encode(data, &mut self.out);
    }

    /// Write a formatted body fragment; usable through `write!`.
    ///
    /// Arguments are rendered exactly once.
    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) {
        self.idle.arm(self.network_timeout);
        self.encoder.encode_fmt(args, &mut self.out);
    }

    /// Complete plain-text response with the given status and message.
    pub fn error_response(&mut self, status: Status, message: &str) {
        self.send_header(status);
        self.header("Content-Type", "text/plain");
        self.end_headers();
        self.write(message.as_bytes());
    }

    /// Redirect to `location` with an empty body.
    pub fn redirect(&mut self, location: &str) {
        self.send_header(Status::FOUND);
        self.header("Content-Length", "0");
        self.header("Location", location);
        self.end_headers();
    }

    /// Terminate the body (no-op for identity framing).
    pub fn finish(&mut self) {
        self.encoder.finish(&mut self.out);
    }

    /// Bytes framed but not yet flushed.
    pub fn pending(&self) -> usize {
        self.out.len()
    }

    /// Write out everything framed so far, then disarm the idle timer.
    pub async fn flush(&mut self) -> io::Result<()> {
        if !self.out.is_empty() {
            let buf = self.out.split();
            self.sink.write_all(&buf).await?;
        }
        self.sink.flush().await?;
        self.idle.cancel();
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.sink.shutdown().await
    }
}
