//! Connection state machine.
//!
//! ```text
//! Init ──request line──▶ Header ──blank line──▶ Body ──response done──▶ Done
//!  ▲                                                                    │
//!  └──────────────────────── keep-alive ◀───────────────────────────────┘
//!                                   otherwise ──▶ Close (also on any error)
//! ```
//!
//! The parser is sans-IO: the driver in [`super::server`] owns the socket,
//! appends reads to a `BytesMut` and calls [`Connection::advance`] until it
//! asks for more input. Body bytes are never interpreted here.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Buf, BytesMut};

use super::error::ProtocolError;
use super::idle::IdleTimer;
use super::request::{Headers, Method, Request, Version};

/// Global counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Parse state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for a request line.
    Init,
    /// Reading header lines.
    Header,
    /// Headers complete; the body belongs to the dispatch.
    Body,
    /// Response finished, not yet recycled.
    Done,
    /// Terminal.
    Close,
}

/// What a call to [`Connection::advance`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// No complete line buffered, or the state does not parse lines.
    NeedMore,
    RequestLine,
    Header,
    /// Blank line seen; state is now [`State::Body`].
    HeadersComplete,
}

/// Per-connection limits and timeouts.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Read buffer size; a head line that does not fit is rejected with 413.
    pub max_request_size: usize,
    /// Idle limit while a request is being read or a response written.
    pub network_timeout: Duration,
    /// Idle limit between keep-alive requests. Zero disables keep-alive.
    pub http_keepalive: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_request_size: 4096,
            network_timeout: Duration::from_secs(30),
            http_keepalive: Duration::from_secs(20),
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    state: State,
    request: Option<Request>,
    headers: Headers,
    idle: Arc<IdleTimer>,
    config: ConnectionConfig,
}

impl Connection {
    /// A freshly accepted connection; arms the idle timer.
    pub fn new(config: ConnectionConfig) -> Self {
        let idle = Arc::new(IdleTimer::new());
        idle.arm(config.network_timeout);
        Self {
            id: ConnectionId::next(),
            state: State::Init,
            request: None,
            headers: Headers::new(),
            idle,
            config,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable request alongside its headers, for routing.
    pub fn request_parts(&mut self) -> Option<(&mut Request, &Headers)> {
        let headers = &self.headers;
        self.request.as_mut().map(|r| (r, headers))
    }

    pub fn idle(&self) -> &Arc<IdleTimer> {
        &self.idle
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether the response to the current request may keep the connection open.
    pub fn keep_alive_allowed(&self) -> bool {
        !self.config.http_keepalive.is_zero()
            && self
                .request
                .as_ref()
                .is_some_and(|r| r.version == Version::NEWEST)
    }

    /// Consume at most one line from `buf`.
    ///
    /// On error the state is `Close`; the caller owes the peer an error response.
    pub fn advance(&mut self, buf: &mut BytesMut) -> Result<Event, ProtocolError> {
        let result = match self.state {
            State::Init => match self.take_line(buf) {
                Ok(Some(line)) => self.parse_request_line(&line),
                Ok(None) => Ok(Event::NeedMore),
                Err(e) => Err(e),
            },
            State::Header => match self.take_line(buf) {
                Ok(Some(line)) => self.parse_header(&line),
                Ok(None) => Ok(Event::NeedMore),
                Err(e) => Err(e),
            },
            State::Body | State::Done | State::Close => Ok(Event::NeedMore),
        };

        if result.is_err() {
            self.state = State::Close;
        }
        result
    }

    fn take_line(&self, buf: &mut BytesMut) -> Result<Option<BytesMut>, ProtocolError> {
        let max = self.config.max_request_size;
        match buf.windows(2).position(|w| w == b"\r\n") {
            Some(pos) if pos + 2 > max => Err(ProtocolError::TooLarge),
            Some(pos) => {
                let line = buf.split_to(pos);
                buf.advance(2);
                Ok(Some(line))
            }
            None if buf.len() >= max => Err(ProtocolError::TooLarge),
            None => Ok(None),
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<Event, ProtocolError> {
        let line = std::str::from_utf8(line).map_err(|_| ProtocolError::MalformedRequestLine)?;

        let mut parts = line.split(' ');
        let (Some(method), Some(url), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::MalformedRequestLine);
        };
        if url.is_empty() {
            return Err(ProtocolError::MalformedRequestLine);
        }

        let method = Method::parse(method).ok_or(ProtocolError::UnsupportedMethod)?;
        let version = Version::parse(version).ok_or(ProtocolError::UnsupportedVersion)?;

        self.headers.clear();
        self.request = Some(Request {
            method,
            url: url.to_string(),
            version,
        });
        self.state = State::Header;
        Ok(Event::RequestLine)
    }

    fn parse_header(&mut self, line: &[u8]) -> Result<Event, ProtocolError> {
        if line.is_empty() {
            self.idle.cancel();
            self.state = State::Body;
            return Ok(Event::HeadersComplete);
        }

        let line = std::str::from_utf8(line).map_err(|_| ProtocolError::MalformedHeader)?;
        let (name, value) = line.split_once(':').ok_or(ProtocolError::MalformedHeader)?;
        if name.is_empty() {
            return Err(ProtocolError::MalformedHeader);
        }

        self.headers.insert(name, value.trim_start());
        Ok(Event::Header)
    }

    /// The response for the current request has been written.
    pub fn complete(&mut self) {
        if self.state != State::Close {
            self.state = State::Done;
        }
    }

    /// Recycle for the next request, or close.
    ///
    /// Returns `true` if the connection stays open.
    pub fn finish_request(&mut self, keep_alive: bool) -> bool {
        if !keep_alive || self.state == State::Close {
            self.state = State::Close;
            return false;
        }

        self.state = State::Init;
        self.request = None;
        self.headers.clear();
        self.idle.arm(self.config.http_keepalive);
        true
    }

    /// Force the terminal state.
    pub fn close(&mut self) {
        self.state = State::Close;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("request", &self.request)
            .finish()
    }
}
