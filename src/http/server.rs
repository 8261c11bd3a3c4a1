//! HTTP listener and per-connection driver.
//!
//! Each accepted connection runs in its own task. The driver owns the
//! socket and moves bytes between it and the sans-IO [`Connection`] parser,
//! the routed [`Dispatch`] and the [`ResponseWriter`]. Every wait is raced
//! against the connection's idle timer.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::chunked::ResponseWriter;
use super::connection::{Connection, ConnectionConfig, Event};
use super::dispatch::{BodyProgress, Dispatch, Route, Router};
use super::error::ProtocolError;
use super::request::{Method, Version};

/// Counts live connections and applies backpressure at `max_connections`.
#[derive(Debug)]
pub struct ConnectionTracker {
    limit: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionTracker {
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Wait for a free slot. The slot is released when dropped.
    pub async fn admit(&self) -> Option<ConnectionSlot> {
        let permit = self.limit.clone().acquire_owned().await.ok()?;
        Some(ConnectionSlot { _permit: permit })
    }

    pub fn live(&self) -> usize {
        self.max_connections - self.limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// One admitted connection's hold on the tracker.
#[derive(Debug)]
pub struct ConnectionSlot {
    _permit: OwnedSemaphorePermit,
}

pub struct HttpServer {
    router: Arc<Router>,
    config: ConnectionConfig,
    tracker: Arc<ConnectionTracker>,
}

impl HttpServer {
    pub fn new(router: Router, config: ConnectionConfig, max_connections: usize) -> Self {
        Self {
            router: Arc::new(router),
            config,
            tracker: Arc::new(ConnectionTracker::new(max_connections)),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept connections until a shutdown signal is received.
    pub async fn listen(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            max_connections = self.tracker.max_connections(),
            "HTTP server listening"
        );

        loop {
            let slot = tokio::select! {
                slot = self.tracker.admit() => match slot {
                    Some(slot) => slot,
                    None => break,
                },
                _ = shutdown.recv() => {
                    info!("HTTP server shutting down");
                    break;
                }
            };

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let _ = stream.set_nodelay(true);
                            let router = self.router.clone();
                            let config = self.config.clone();
                            let span = info_span!("http", peer = %peer_addr);
                            tokio::spawn(
                                async move {
                                    let _slot = slot;
                                    if let Err(e) = serve_connection(router, config, stream).await {
                                        debug!(error = %e, "Connection error");
                                    }
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("HTTP server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Serve one connection until it closes.
pub async fn serve_connection<S>(
    router: Arc<Router>,
    config: ConnectionConfig,
    stream: S,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn = Connection::new(config);
    let span = info_span!("conn", id = %conn.id());
    drive(router, conn, stream).instrument(span).await
}

/// A routed dispatch that is released exactly once.
///
/// Dropping an unreleased dispatch counts as an early teardown.
struct ActiveDispatch {
    inner: Box<dyn Dispatch>,
    released: bool,
}

impl ActiveDispatch {
    fn new(inner: Box<dyn Dispatch>) -> Self {
        Self {
            inner,
            released: false,
        }
    }

    /// Response completed normally.
    fn free(mut self) {
        self.released = true;
        self.inner.on_free();
    }

    /// Connection torn down mid-request.
    fn abort(mut self) {
        self.released = true;
        self.inner.on_close();
        self.inner.on_free();
    }
}

impl Deref for ActiveDispatch {
    type Target = dyn Dispatch;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl DerefMut for ActiveDispatch {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.inner
    }
}

impl Drop for ActiveDispatch {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.on_close();
            self.inner.on_free();
        }
    }
}

enum Head {
    Ready,
    Eof,
    TimedOut,
    Failed(ProtocolError),
}

enum Outcome {
    Done(io::Result<()>),
    TimedOut,
    PeerGone,
}

async fn drive<S>(router: Arc<Router>, mut conn: Connection, stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let network_timeout = conn.config().network_timeout;
    let mut out = ResponseWriter::new(Box::new(writer), conn.idle().clone(), network_timeout);
    let mut buf = BytesMut::with_capacity(conn.config().max_request_size);

    debug!("Connection opened");

    let result = loop {
        match read_head(&mut conn, &mut reader, &mut buf).await {
            Ok(Head::Ready) => {}
            Ok(Head::Eof) => break Ok(()),
            Ok(Head::TimedOut) => {
                debug!("Idle timeout");
                break Ok(());
            }
            Ok(Head::Failed(e)) => {
                warn!(error = %e, "Protocol error");
                break send_protocol_error(&conn, &mut out, e).await;
            }
            Err(e) => break Err(e),
        }

        match serve_request(&router, &mut conn, &mut reader, &mut buf, &mut out).await {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    conn.close();
    let _ = out.shutdown().await;
    debug!("Connection closed");
    result
}

/// Read until the request head is complete.
async fn read_head<R>(conn: &mut Connection, reader: &mut R, buf: &mut BytesMut) -> io::Result<Head>
where
    R: AsyncRead + Unpin,
{
    let idle = conn.idle().clone();
    let network_timeout = conn.config().network_timeout;
    loop {
        match conn.advance(buf) {
            Ok(Event::HeadersComplete) => return Ok(Head::Ready),
            Ok(Event::RequestLine) => {
                if let Some(req) = conn.request() {
                    debug!(method = %req.method, url = %req.url, version = %req.version, "Request");
                }
                continue;
            }
            Ok(Event::Header) => continue,
            Ok(Event::NeedMore) => {}
            Err(e) => return Ok(Head::Failed(e)),
        }

        tokio::select! {
            _ = idle.fired() => return Ok(Head::TimedOut),
            n = reader.read_buf(buf) => {
                if n? == 0 {
                    return Ok(Head::Eof);
                }
                idle.arm(network_timeout);
            }
        }
    }
}

async fn send_protocol_error(
    conn: &Connection,
    out: &mut ResponseWriter,
    err: ProtocolError,
) -> io::Result<()> {
    let (version, method) = match conn.request() {
        Some(req) => (req.version, req.method),
        None => (Version::Http10, Method::Get),
    };
    let status = err.status();
    out.begin(version, method, false);
    out.error_response(status, status.reason);
    out.finish();
    out.flush().await
}

/// Route and serve one request whose head has been parsed.
///
/// Returns whether the connection stays open for another request.
async fn serve_request<R>(
    router: &Router,
    conn: &mut Connection,
    reader: &mut R,
    buf: &mut BytesMut,
    out: &mut ResponseWriter,
) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let (version, method) = match conn.request() {
        Some(req) => (req.version, req.method),
        None => return Ok(false),
    };

    // `None` means the length is unknown and the dispatch decides.
    let body_len = match conn.headers().content_length() {
        Ok(Some(n)) => Some(n),
        Ok(None) if method == Method::Post => None,
        Ok(None) => Some(0),
        Err(e) => {
            warn!(error = %e, "Protocol error");
            conn.close();
            send_protocol_error(conn, out, e).await?;
            return Ok(false);
        }
    };

    out.begin(version, method, conn.keep_alive_allowed());

    let id = conn.id();
    let route = match conn.request_parts() {
        Some((request, headers)) => router.route(id, request, headers),
        None => return Ok(false),
    };

    let mut dispatch = match route {
        Route::Dispatch(dispatch) => ActiveDispatch::new(dispatch),
        Route::Reject(rejection) => {
            debug!(status = rejection.status.code, message = %rejection.message, "Request rejected");
            if body_len != Some(0) {
                out.begin(version, method, false);
            }
            out.error_response(rejection.status, &rejection.message);
            return complete(conn, out).await;
        }
        Route::Redirect(location) => {
            debug!(%location, "Redirecting");
            if body_len != Some(0) {
                out.begin(version, method, false);
            }
            out.redirect(&location);
            return complete(conn, out).await;
        }
    };

    let idle = conn.idle().clone();
    let network_timeout = conn.config().network_timeout;
    let mut remaining = body_len;
    let mut finished_early = false;

    while remaining != Some(0) {
        if buf.is_empty() {
            idle.arm(network_timeout);
            let read = tokio::select! {
                _ = idle.fired() => None,
                n = reader.read_buf(buf) => Some(n),
            };
            match read {
                None => {
                    debug!("Idle timeout while reading request body");
                    dispatch.abort();
                    return Ok(false);
                }
                Some(Ok(0)) => {
                    debug!("Peer closed connection during request body");
                    dispatch.abort();
                    return Ok(false);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    dispatch.abort();
                    return Err(e);
                }
            }
        }

        let take = match remaining {
            Some(n) => buf.len().min(usize::try_from(n).unwrap_or(usize::MAX)),
            None => buf.len(),
        };
        let chunk = buf.split_to(take);
        if let Some(n) = remaining.as_mut() {
            *n -= take as u64;
        }
        if dispatch.on_body_chunk(&chunk) == BodyProgress::Complete {
            // A declared-length body stopped early was refused by the dispatch.
            finished_early = remaining.is_some();
            break;
        }
    }
    idle.cancel();

    if remaining != Some(0) || finished_early {
        debug!("Request body not fully consumed, closing after response");
        out.begin(version, method, false);
    }

    let max_buffered = conn.config().max_request_size;
    let outcome = {
        let mut response = dispatch.on_body_complete(out);
        loop {
            tokio::select! {
                res = &mut response => break Outcome::Done(res),
                _ = idle.fired() => break Outcome::TimedOut,
                n = reader.read_buf(buf), if buf.len() < max_buffered => {
                    match n {
                        Ok(0) | Err(_) => break Outcome::PeerGone,
                        Ok(_) => {}
                    }
                }
            }
        }
    };

    match outcome {
        Outcome::Done(Ok(())) => {
            dispatch.free();
            complete(conn, out).await
        }
        Outcome::Done(Err(e)) => {
            dispatch.abort();
            Err(e)
        }
        Outcome::TimedOut => {
            debug!("Idle timeout while writing response");
            dispatch.abort();
            Ok(false)
        }
        Outcome::PeerGone => {
            debug!("Peer closed connection during response");
            dispatch.abort();
            Ok(false)
        }
    }
}

/// Terminate the body, flush and recycle or close.
async fn complete(conn: &mut Connection, out: &mut ResponseWriter) -> io::Result<bool> {
    out.finish();
    let network_timeout = conn.config().network_timeout;
    match tokio::time::timeout(network_timeout, out.flush()).await {
        Ok(res) => res?,
        Err(_) => {
            debug!("Idle timeout while flushing response");
            return Ok(false);
        }
    }
    conn.complete();
    Ok(conn.finish_request(out.keep_alive()))
}
