#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uhttpd_gw::http::{ConnectionConfig, Router, serve_connection};

pub const SID: &str = "0123456789abcdef0123456789abcdef";

/// Client end of an in-memory connection served by [`serve_connection`].
pub struct TestClient<S> {
    stream: BufReader<S>,
}

pub fn connect(
    router: Router,
    config: ConnectionConfig,
) -> (TestClient<tokio::io::DuplexStream>, JoinHandle<std::io::Result<()>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(serve_connection(Arc::new(router), config, server));
    (TestClient::new(client), task)
}

#[derive(Debug)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub chunks: usize,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.body.clone()).expect("body is not UTF-8")
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("body is not JSON")
    }

    pub fn keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive")
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn send(&mut self, raw: &[u8]) {
        self.stream.get_mut().write_all(raw).await.unwrap();
    }

    pub async fn post(&mut self, url: &str, body: &str) {
        let request = format!(
            "POST {} HTTP/1.1\r\nHost: router.lan\r\nContent-Length: {}\r\n\r\n{}",
            url,
            body.len(),
            body
        );
        self.send(request.as_bytes()).await;
    }

    pub async fn get(&mut self, url: &str) {
        let request = format!("GET {} HTTP/1.1\r\nHost: router.lan\r\n\r\n", url);
        self.send(request.as_bytes()).await;
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.stream.read_line(&mut line))
            .await
            .expect("timeout waiting for response")
            .unwrap();
        assert!(n > 0, "connection closed mid-response");
        line.trim_end_matches("\r\n").to_string()
    }

    /// Read one complete response.
    pub async fn response(&mut self) -> HttpResponse {
        let status_line = self.line().await;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default().to_string();
        let status = parts
            .next()
            .and_then(|s| s.parse().ok())
            .expect("malformed status line");

        let mut headers = Vec::new();
        loop {
            let line = self.line().await;
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').expect("malformed header");
            headers.push((name.to_string(), value.trim().to_string()));
        }

        let mut response = HttpResponse {
            version,
            status,
            headers,
            body: Vec::new(),
            chunks: 0,
        };

        if response.header("Transfer-Encoding") == Some("chunked") {
            loop {
                let size = usize::from_str_radix(&self.line().await, 16).expect("bad chunk size");
                if size == 0 {
                    assert_eq!(self.line().await, "");
                    break;
                }
                let mut chunk = vec![0u8; size + 2];
                self.read_exact(&mut chunk).await;
                assert_eq!(&chunk[size..], b"\r\n");
                response.body.extend_from_slice(&chunk[..size]);
                response.chunks += 1;
            }
        } else if let Some(len) = response.header("Content-Length") {
            let mut body = vec![0u8; len.parse().expect("bad Content-Length")];
            self.read_exact(&mut body).await;
            response.body = body;
        } else {
            timeout(Duration::from_secs(5), self.stream.read_to_end(&mut response.body))
                .await
                .expect("timeout waiting for close")
                .unwrap();
        }

        response
    }

    async fn read_exact(&mut self, buf: &mut [u8]) {
        timeout(Duration::from_secs(5), self.stream.read_exact(buf))
            .await
            .expect("timeout reading body")
            .unwrap();
    }

    /// Wait for the server to close the connection, returning anything
    /// it sent first.
    pub async fn closed(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), self.stream.read_to_end(&mut rest))
            .await
            .expect("server did not close the connection")
            .unwrap();
        rest
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

pub fn call(id: Value, object: &str, function: &str, args: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "call",
        "params": [object, function, args],
    })
}
