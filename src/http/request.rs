//! Parsed request line and header map.

use std::collections::HashMap;
use std::fmt;

use super::error::ProtocolError;

/// Request methods the server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
}

impl Method {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "HEAD" => Some(Self::Head),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported protocol versions, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    Http09,
    Http10,
    Http11,
}

impl Version {
    /// The newest version; the only one that gets chunked responses and keep-alive.
    pub const NEWEST: Version = Version::Http11;

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "HTTP/0.9" => Some(Self::Http09),
            "HTTP/1.0" => Some(Self::Http10),
            "HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http09 => "HTTP/0.9",
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request line of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub version: Version,
}

/// Request headers keyed by lowercased name.
///
/// A repeated header replaces the earlier value.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.inner
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match self.inner.get(name) {
            Some(value) => Some(value.as_str()),
            None => self
                .inner
                .get(&name.to_ascii_lowercase())
                .map(String::as_str),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Declared body length, if the request carries one.
    pub fn content_length(&self) -> Result<Option<u64>, ProtocolError> {
        match self.get("content-length") {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ProtocolError::InvalidContentLength),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_and_version_labels() {
        for m in [Method::Get, Method::Post, Method::Head] {
            assert_eq!(Method::parse(m.as_str()), Some(m));
        }
        for v in [Version::Http09, Version::Http10, Version::Http11] {
            assert_eq!(Version::parse(v.as_str()), Some(v));
        }
        assert_eq!(Method::parse("get"), None);
        assert_eq!(Method::parse("PUT"), None);
        assert_eq!(Version::parse("HTTP/2.0"), None);
        assert_eq!(Version::parse("http/1.1"), None);
    }

    #[test]
    fn test_headers_case_folded_last_wins() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        headers.insert("X-Thing", "one");
        headers.insert("x-thing", "two");

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(headers.get("x-thing"), Some("two"));
    }

    #[test]
    fn test_content_length() {
        let mut headers = Headers::new();
        assert_eq!(headers.content_length(), Ok(None));

        headers.insert("content-length", "42");
        assert_eq!(headers.content_length(), Ok(Some(42)));

        headers.insert("content-length", "-1");
        assert_eq!(
            headers.content_length(),
            Err(ProtocolError::InvalidContentLength)
        );
    }
}
