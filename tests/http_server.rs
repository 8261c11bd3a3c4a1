mod common;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{TestClient, connect};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use uhttpd_gw::http::{
    Alias, BodyProgress, Captive, ConnectionConfig, ConnectionId, Dispatch, Handler, Headers,
    HttpServer, Rejection, Request, ResponseWriter, Router, Status, path_match,
};

/// Answers `<method> <url> <body length>` for everything under `/echo`.
struct EchoHandler;

struct EchoDispatch {
    line: String,
    received: usize,
}

#[async_trait]
impl Dispatch for EchoDispatch {
    fn on_body_chunk(&mut self, data: &[u8]) -> BodyProgress {
        self.received += data.len();
        BodyProgress::More
    }

    async fn on_body_complete(&mut self, out: &mut ResponseWriter) -> io::Result<()> {
        out.send_header(Status::OK);
        out.header("Content-Type", "text/plain");
        out.end_headers();
        write!(out, "{} {}", self.line, self.received);
        Ok(())
    }
}

impl Handler for EchoHandler {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn check_url(&self, url: &str) -> bool {
        path_match("/echo", url)
    }

    fn handle_request(
        &self,
        _conn: ConnectionId,
        request: &Request,
        _headers: &Headers,
    ) -> Result<Box<dyn Dispatch>, Rejection> {
        if request.url.ends_with("/forbidden") {
            return Err(Rejection::new(Status::new(403, "Forbidden"), "go away"));
        }
        Ok(Box::new(EchoDispatch {
            line: format!("{} {}", request.method, request.url),
            received: 0,
        }))
    }
}

fn router() -> Router {
    Router::new().with_handler(Arc::new(EchoHandler))
}

fn config() -> ConnectionConfig {
    ConnectionConfig::default()
}

#[tokio::test]
async fn test_keep_alive_serves_consecutive_requests() {
    let (mut client, _task) = connect(router(), config());

    client.get("/echo/one").await;
    let first = client.response().await;
    assert_eq!(first.status, 200);
    assert_eq!(first.version, "HTTP/1.1");
    assert!(first.keep_alive());
    assert_eq!(first.header("Transfer-Encoding"), Some("chunked"));
    assert_eq!(first.text(), "GET /echo/one 0");

    client.post("/echo/two", "hello").await;
    let second = client.response().await;
    assert!(second.keep_alive());
    assert_eq!(second.text(), "POST /echo/two 5");
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let (mut client, _task) = connect(router(), config());

    client
        .send(b"GET /echo/a HTTP/1.1\r\n\r\nPOST /echo/b HTTP/1.1\r\nContent-Length: 3\r\n\r\nxyzGET /echo/c HTTP/1.1\r\n\r\n")
        .await;

    assert_eq!(client.response().await.text(), "GET /echo/a 0");
    assert_eq!(client.response().await.text(), "POST /echo/b 3");
    assert_eq!(client.response().await.text(), "GET /echo/c 0");
}

#[tokio::test]
async fn test_http10_closes_after_response() {
    let (mut client, task) = connect(router(), config());

    client.send(b"GET /echo HTTP/1.0\r\n\r\n").await;
    let response = client.response().await;

    assert_eq!(response.version, "HTTP/1.0");
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(response.header("Transfer-Encoding").is_none());
    assert_eq!(response.text(), "GET /echo 0");

    timeout(Duration::from_secs(2), task)
        .await
        .expect("connection should close")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_keep_alive_disabled() {
    let config = ConnectionConfig {
        http_keepalive: Duration::ZERO,
        ..config()
    };
    let (mut client, _task) = connect(router(), config);

    client.get("/echo").await;
    let response = client.response().await;
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(client.closed().await.is_empty());
}

#[tokio::test]
async fn test_unknown_url_is_not_found() {
    let (mut client, _task) = connect(router(), config());

    client.get("/missing").await;
    let response = client.response().await;

    assert_eq!(response.status, 404);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(
        response.text(),
        "The requested URL /missing was not found on this server."
    );
    assert!(response.keep_alive());

    client.get("/echo").await;
    assert_eq!(client.response().await.status, 200);
}

#[tokio::test]
async fn test_handler_rejection() {
    let (mut client, _task) = connect(router(), config());

    client.get("/echo/forbidden").await;
    let response = client.response().await;
    assert_eq!(response.status, 403);
    assert_eq!(response.text(), "go away");
}

#[tokio::test]
async fn test_rejection_with_pending_body_closes() {
    let (mut client, _task) = connect(router(), config());

    client.post("/missing", "unread body").await;
    let response = client.response().await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("Connection"), Some("close"));
    client.closed().await;
}

#[tokio::test]
async fn test_malformed_request_is_bad_request() {
    let (mut client, _task) = connect(router(), config());

    client.send(b"GET /echo HTTP/1.1\r\nno colon here\r\n\r\n").await;
    let response = client.response().await;

    assert_eq!(response.status, 400);
    assert_eq!(response.header("Connection"), Some("close"));
    assert_eq!(response.text(), "Bad Request");
    client.closed().await;
}

#[tokio::test]
async fn test_oversized_header_line() {
    let config = ConnectionConfig {
        max_request_size: 128,
        ..config()
    };
    let (mut client, _task) = connect(router(), config);

    let request = format!("GET /echo HTTP/1.1\r\nX-Padding: {}\r\n\r\n", "a".repeat(300));
    client.send(request.as_bytes()).await;
    let response = client.response().await;

    assert_eq!(response.status, 413);
    assert_eq!(response.text(), "Request Entity Too Large");
    client.closed().await;
}

#[tokio::test]
async fn test_alias_rewrites_before_routing() {
    let router = router().with_alias(Alias::new("/legacy", "/echo{}"));
    let (mut client, _task) = connect(router, config());

    client.get("/legacy/status").await;
    assert_eq!(client.response().await.text(), "GET /echo/status 0");
}

#[tokio::test]
async fn test_captive_redirect() {
    let router = router().with_captive(Captive {
        host: "portal.lan".into(),
        url: "http://portal.lan/".into(),
    });
    let (mut client, _task) = connect(router, config());

    client.get("/echo").await;
    let response = client.response().await;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("Location"), Some("http://portal.lan/"));
    assert!(response.body.is_empty());

    client
        .send(b"GET /echo HTTP/1.1\r\nHost: portal.lan\r\n\r\n")
        .await;
    assert_eq!(client.response().await.status, 200);
}

#[tokio::test]
async fn test_idle_keep_alive_connection_closes() {
    let config = ConnectionConfig {
        http_keepalive: Duration::from_millis(50),
        ..config()
    };
    let (mut client, task) = connect(router(), config);

    client.get("/echo").await;
    assert_eq!(client.response().await.status, 200);

    assert!(client.closed().await.is_empty());
    timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_stalled_request_head_times_out() {
    let config = ConnectionConfig {
        network_timeout: Duration::from_millis(50),
        ..config()
    };
    let (mut client, _task) = connect(router(), config);

    client.send(b"GET /echo HTTP/1.1\r\nHost: ").await;
    assert!(client.closed().await.is_empty());
}

#[tokio::test]
async fn test_listener_serves_tcp_until_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(router(), config(), 4);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let serving = tokio::spawn(async move { server.listen(listener, shutdown_rx).await });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = TestClient::new(stream);
    client.get("/echo/tcp").await;
    let response = client.response().await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "GET /echo/tcp 0");

    shutdown_tx.send(()).unwrap();
    timeout(Duration::from_secs(2), serving)
        .await
        .expect("listener should stop")
        .unwrap()
        .unwrap();
}
