//! Incremental JSON body parser.
//!
//! Bytes are accumulated as they arrive and reparsed until one complete
//! top-level value is available. The total number of bytes fed is capped.

use serde_json::{Deserializer, Value};
use thiserror::Error;

/// Default cap on a request body.
pub const MAX_POST_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JsonStreamError {
    #[error("body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("body ended before a complete value")]
    Incomplete,
}

#[derive(Debug)]
pub struct JsonStream {
    buf: Vec<u8>,
    fed: usize,
    limit: usize,
    value: Option<Value>,
    failed: Option<JsonStreamError>,
}

impl Default for JsonStream {
    fn default() -> Self {
        Self::new(MAX_POST_SIZE)
    }
}

impl JsonStream {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            fed: 0,
            limit,
            value: None,
            failed: None,
        }
    }

    /// Append body bytes. Once an error is reported, every later call
    /// reports it again.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), JsonStreamError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        self.fed += data.len();
        if self.fed > self.limit {
            return Err(self.fail(JsonStreamError::TooLarge(self.limit)));
        }

        self.buf.extend_from_slice(data);
        match self.reparse() {
            Ok(value) => {
                self.value = value;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, err: JsonStreamError) -> JsonStreamError {
        self.buf = Vec::new();
        self.value = None;
        self.failed = Some(err.clone());
        err
    }

    fn reparse(&self) -> Result<Option<Value>, JsonStreamError> {
        let mut values = Deserializer::from_slice(&self.buf).into_iter::<Value>();
        match values.next() {
            None => Ok(None),
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(JsonStreamError::Syntax(e.to_string())),
            Some(Ok(value)) => {
                let rest = &self.buf[values.byte_offset()..];
                if rest.iter().all(u8::is_ascii_whitespace) {
                    Ok(Some(value))
                } else {
                    Err(JsonStreamError::Syntax(
                        "trailing characters after value".to_string(),
                    ))
                }
            }
        }
    }

    /// A complete value has been parsed (more whitespace may still follow).
    pub fn is_complete(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    pub fn bytes_fed(&self) -> usize {
        self.fed
    }

    /// End of body: the parsed value, or why there is none.
    pub fn finish(&mut self) -> Result<Value, JsonStreamError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        self.buf = Vec::new();
        self.value.take().ok_or(JsonStreamError::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_split_across_feeds() {
        let body = br#"{"jsonrpc":"2.0","method":"call","params":["a","b",{}]}"#;
        let mut stream = JsonStream::default();

        for part in body.chunks(7) {
            assert!(!stream.is_complete());
            stream.feed(part).unwrap();
        }
        assert!(stream.is_complete());
        assert_eq!(
            stream.finish().unwrap(),
            json!({"jsonrpc":"2.0","method":"call","params":["a","b",{}]})
        );
    }

    #[test]
    fn test_trailing_whitespace_allowed() {
        let mut stream = JsonStream::default();
        stream.feed(b"[1, 2]").unwrap();
        stream.feed(b" \r\n").unwrap();
        assert_eq!(stream.finish().unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut stream = JsonStream::default();
        let err = stream.feed(b"{} x").unwrap_err();
        assert!(matches!(err, JsonStreamError::Syntax(_)));
        assert!(stream.is_failed());
        assert_eq!(stream.feed(b" ").unwrap_err(), err);
        assert_eq!(stream.finish().unwrap_err(), err);
    }

    #[test]
    fn test_syntax_error() {
        let mut stream = JsonStream::default();
        assert!(matches!(stream.feed(b"{\"a\" 1}"), Err(JsonStreamError::Syntax(_))));
    }

    #[test]
    fn test_size_cap() {
        let mut stream = JsonStream::new(16);
        stream.feed(b"[1,2,3,4,5,").unwrap();
        stream.feed(b"6,7]").unwrap();
        assert_eq!(stream.bytes_fed(), 15);

        let mut stream = JsonStream::new(16);
        stream.feed(b"[1,2,3,4,5,6,7").unwrap();
        assert_eq!(stream.feed(b",8]"), Err(JsonStreamError::TooLarge(16)));
    }

    #[test]
    fn test_default_cap_is_exact() {
        let mut padded = b"[0]".to_vec();
        padded.resize(MAX_POST_SIZE, b' ');
        let mut stream = JsonStream::default();
        stream.feed(&padded).unwrap();
        assert_eq!(stream.finish().unwrap(), json!([0]));

        padded.push(b' ');
        let mut stream = JsonStream::default();
        assert!(stream.feed(&padded).is_err());
    }

    #[test]
    fn test_incomplete_body() {
        let mut stream = JsonStream::default();
        stream.feed(b"{\"a\":").unwrap();
        assert_eq!(stream.finish(), Err(JsonStreamError::Incomplete));

        let mut stream = JsonStream::default();
        assert_eq!(stream.finish(), Err(JsonStreamError::Incomplete));
    }
}
