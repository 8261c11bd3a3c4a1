//! Request routing and the per-request handler interface.
//!
//! A [`Handler`] claims URLs and creates one [`Dispatch`] per request. The
//! dispatch receives the body, produces the response and is released by the
//! connection exactly once, whether the response completed or the
//! connection was torn down early.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::chunked::ResponseWriter;
use super::connection::ConnectionId;
use super::error::Status;
use super::request::{Headers, Request};

/// Whether a dispatch wants more body bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyProgress {
    More,
    Complete,
}

/// Handler-owned state for one request/response cycle.
#[async_trait]
pub trait Dispatch: Send {
    /// Feed request body bytes as they arrive.
    fn on_body_chunk(&mut self, data: &[u8]) -> BodyProgress;

    /// The body is complete: write the response.
    ///
    /// Returning ends the request; the connection appends the end-of-body
    /// marker. The returned future may be dropped if the connection goes
    /// away first, in which case [`on_close`](Self::on_close) follows.
    async fn on_body_complete(&mut self, out: &mut ResponseWriter) -> io::Result<()>;

    /// The connection was torn down before the response completed.
    fn on_close(&mut self) {}

    /// Release per-request resources.
    fn on_free(&mut self) {}
}

/// Transport-level refusal, answered with a plain-text error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: Status,
    pub message: String,
}

impl Rejection {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BAD_REQUEST, message)
    }

    pub fn not_found(url: &str) -> Self {
        Self::new(
            Status::NOT_FOUND,
            format!("The requested URL {} was not found on this server.", url),
        )
    }
}

/// A request handler plugged into the router.
pub trait Handler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn check_url(&self, url: &str) -> bool;

    fn handle_request(
        &self,
        conn: ConnectionId,
        request: &Request,
        headers: &Headers,
    ) -> Result<Box<dyn Dispatch>, Rejection>;
}

/// Outcome of routing one request.
pub enum Route {
    Dispatch(Box<dyn Dispatch>),
    Reject(Rejection),
    Redirect(String),
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Dispatch(_) => f.write_str("Dispatch"),
            Route::Reject(r) => f.debug_tuple("Reject").field(r).finish(),
            Route::Redirect(loc) => f.debug_tuple("Redirect").field(loc).finish(),
        }
    }
}

/// `url` is `prefix` or lies beneath it.
pub fn path_match(prefix: &str, url: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match url.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

/// URL prefix rewrite.
///
/// `to` may contain one `{}` which receives the part of the URL after
/// `from`; without it the remainder is appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub from: String,
    pub to: String,
}

impl Alias {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn rewrite(&self, url: &str) -> Option<String> {
        let rest = url.strip_prefix(self.from.as_str())?;
        Some(match self.to.split_once("{}") {
            Some((head, tail)) => format!("{}{}{}", head, rest, tail),
            None => format!("{}{}", self.to, rest),
        })
    }
}

/// Captive portal: requests for any other host are redirected to `url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captive {
    pub host: String,
    pub url: String,
}

impl Captive {
    pub fn should_redirect(&self, host: Option<&str>) -> bool {
        host != Some(self.host.as_str())
    }
}

#[derive(Default)]
pub struct Router {
    handlers: Vec<Arc<dyn Handler>>,
    aliases: Vec<Alias>,
    captive: Option<Captive>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_alias(mut self, alias: Alias) -> Self {
        self.aliases.push(alias);
        self
    }

    pub fn with_captive(mut self, captive: Captive) -> Self {
        self.captive = Some(captive);
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Select the handler for a request whose headers are complete.
    ///
    /// Alias rewriting is applied to `request.url` in place.
    pub fn route(&self, conn: ConnectionId, request: &mut Request, headers: &Headers) -> Route {
        if let Some(captive) = &self.captive {
            if captive.should_redirect(headers.get("host")) {
                return Route::Redirect(captive.url.clone());
            }
        }

        if let Some(url) = self.aliases.iter().find_map(|a| a.rewrite(&request.url)) {
            debug!(%conn, from = %request.url, to = %url, "URL alias applied");
            request.url = url;
        }

        for handler in &self.handlers {
            if !handler.check_url(&request.url) {
                continue;
            }
            debug!(%conn, handler = handler.name(), url = %request.url, "Handler selected");
            return match handler.handle_request(conn, request, headers) {
                Ok(dispatch) => Route::Dispatch(dispatch),
                Err(rejection) => Route::Reject(rejection),
            };
        }

        Route::Reject(Rejection::not_found(&request.url))
    }
}
