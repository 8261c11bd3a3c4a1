//! Protocol errors and the status codes they map to.

use std::fmt;

use thiserror::Error;

/// Response status: numeric code plus reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason: &'static str,
}

impl Status {
    pub const OK: Status = Status::new(200, "OK");
    pub const FOUND: Status = Status::new(302, "Found");
    pub const BAD_REQUEST: Status = Status::new(400, "Bad Request");
    pub const NOT_FOUND: Status = Status::new(404, "Not Found");
    pub const ENTITY_TOO_LARGE: Status = Status::new(413, "Request Entity Too Large");

    pub const fn new(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03} {}", self.code, self.reason)
    }
}

/// A request the connection cannot parse. Always fatal to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("unsupported method")]
    UnsupportedMethod,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("malformed header line")]
    MalformedHeader,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("request head exceeds buffer")]
    TooLarge,
}

impl ProtocolError {
    pub fn status(&self) -> Status {
        match self {
            Self::TooLarge => Status::ENTITY_TOO_LARGE,
            _ => Status::BAD_REQUEST,
        }
    }
}
