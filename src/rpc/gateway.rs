//! JSON-RPC gateway to the bus backend.
//!
//! Claims every URL under the configured prefix. A POST body holds either
//! one call object or a batch array; each call is checked, authorised
//! against the session object and forwarded to the backend. Calls in a
//! batch run strictly one after another.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::json_stream::{JsonStream, JsonStreamError, MAX_POST_SIZE};
use super::protocol::{CallRequest, ErrorKind, Response, call_id};
use crate::backend::{Backend, CallGuard, collect};
use crate::http::{
    BodyProgress, ConnectionId, Dispatch, Handler, Headers, Method, Rejection, Request,
    ResponseWriter, Status, path_match,
};

/// Session id used when authentication is disabled.
pub const DEFAULT_SESSION_ID: &str = "00000000000000000000000000000000";

pub const SESSION_ID_LEN: usize = 32;

/// Bound on the per-call access check.
pub const ACCESS_TIMEOUT: Duration = Duration::from_millis(250);

/// Pause before each batch element so other connections get a turn.
pub const BATCH_STEP: Duration = Duration::from_millis(1);

const SESSION_OBJECT: &str = "session";
const ACCESS_METHOD: &str = "access";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub prefix: String,
    pub noauth: bool,
    /// Limit on each backend call
    pub script_timeout: Duration,
    pub max_post_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            prefix: "/ubus".to_string(),
            noauth: false,
            script_timeout: Duration::from_secs(60),
            max_post_size: MAX_POST_SIZE,
        }
    }
}

pub struct UbusGateway {
    backend: Arc<dyn Backend>,
    config: Arc<GatewayConfig>,
}

impl UbusGateway {
    pub fn new(backend: Arc<dyn Backend>, config: GatewayConfig) -> Self {
        Self {
            backend,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Session id from the URL: the segment after the prefix.
    fn session_id<'a>(&self, url: &'a str) -> &'a str {
        if self.config.noauth {
            return DEFAULT_SESSION_ID;
        }
        let rest = url.strip_prefix(self.config.prefix.as_str()).unwrap_or("");
        let rest = rest.trim_start_matches('/');
        match rest.split_once('/') {
            Some((sid, _)) => sid,
            None => rest,
        }
    }
}

impl Handler for UbusGateway {
    fn name(&self) -> &'static str {
        "ubus"
    }

    fn check_url(&self, url: &str) -> bool {
        path_match(&self.config.prefix, url)
    }

    fn handle_request(
        &self,
        conn: ConnectionId,
        request: &Request,
        headers: &Headers,
    ) -> Result<Box<dyn Dispatch>, Rejection> {
        let sid = self.session_id(&request.url);
        if sid.len() != SESSION_ID_LEN || request.method != Method::Post {
            debug!(%conn, method = %request.method, sid_len = sid.len(), "Gateway request refused");
            return Err(Rejection::bad_request("Invalid Request"));
        }

        let length_known = matches!(headers.content_length(), Ok(Some(_)));
        Ok(Box::new(UbusDispatch {
            backend: self.backend.clone(),
            config: self.config.clone(),
            conn,
            sid: sid.to_string(),
            stream: Some(JsonStream::new(self.config.max_post_size)),
            length_known,
            in_flight: None,
        }))
    }
}

/// Gateway state for one request.
pub struct UbusDispatch {
    backend: Arc<dyn Backend>,
    config: Arc<GatewayConfig>,
    conn: ConnectionId,
    sid: String,
    /// Released once the body has been parsed
    stream: Option<JsonStream>,
    /// With a declared length the connection decides when the body ends.
    length_known: bool,
    /// Backend call currently awaited
    in_flight: Option<CallGuard>,
}

impl UbusDispatch {
    async fn handle_call(&mut self, value: &Value) -> Response {
        let id = call_id(value);
        match self.execute(value).await {
            Ok((status, data)) => Response::call_result(id, status, data),
            Err(kind) => {
                debug!(conn = %self.conn, code = kind.code(), error = %kind, "Call failed");
                Response::error(id, kind)
            }
        }
    }

    /// Run one call object through validation, authorisation and the backend.
    async fn execute(&mut self, value: &Value) -> Result<(i32, Vec<Map<String, Value>>), ErrorKind> {
        let call = CallRequest::parse(value)?;

        let lookup = self.backend.lookup(&call.object);
        let object = match tokio::time::timeout(self.config.script_timeout, lookup).await {
            Ok(Ok(object)) => object,
            Ok(Err(e)) => {
                debug!(conn = %self.conn, object = %call.object, error = %e, "Lookup failed");
                return Err(ErrorKind::ObjectNotFound);
            }
            Err(_) => {
                warn!(conn = %self.conn, object = %call.object, "Lookup timed out");
                return Err(ErrorKind::ObjectNotFound);
            }
        };

        if !self.config.noauth {
            self.check_access(&call).await?;
        }

        debug!(
            conn = %self.conn,
            object = %call.object,
            function = %call.function,
            "Backend call"
        );

        let pending = match self.backend.invoke(object, &call.function, call.args).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(conn = %self.conn, error = %e, "Failed to start backend call");
                return Err(ErrorKind::InternalError);
            }
        };

        self.in_flight = Some(CallGuard::new(self.backend.clone(), pending.id));
        let mut events = pending.events;
        let mut data = Vec::new();
        let outcome =
            tokio::time::timeout(self.config.script_timeout, collect(&mut events, &mut data)).await;

        let Some(mut guard) = self.in_flight.take() else {
            return Err(ErrorKind::InternalError);
        };
        match outcome {
            Ok(Some(status)) => {
                guard.disarm();
                Ok((status, data))
            }
            Ok(None) => {
                guard.disarm();
                warn!(conn = %self.conn, "Backend dropped the call");
                Err(ErrorKind::InternalError)
            }
            Err(_) => {
                guard.abort();
                warn!(
                    conn = %self.conn,
                    object = %call.object,
                    function = %call.function,
                    "Backend call timed out"
                );
                Err(ErrorKind::Timeout)
            }
        }
    }

    /// Ask the session object whether this session may make the call.
    async fn check_access(&self, call: &CallRequest) -> Result<(), ErrorKind> {
        let lookup = self.backend.lookup(SESSION_OBJECT);
        let session = match tokio::time::timeout(ACCESS_TIMEOUT, lookup).await {
            Ok(Ok(session)) => session,
            Ok(Err(_)) | Err(_) => return Err(ErrorKind::SessionNotFound),
        };

        let mut args = Map::new();
        args.insert("sid".into(), Value::from(self.sid.as_str()));
        args.insert("object".into(), Value::from(call.object.as_str()));
        args.insert("function".into(), Value::from(call.function.as_str()));

        let granted = match self
            .backend
            .invoke_sync(session, ACCESS_METHOD, args, ACCESS_TIMEOUT)
            .await
        {
            Ok(reply) => reply
                .data
                .last()
                .and_then(|data| data.get("access"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Err(e) => {
                debug!(conn = %self.conn, error = %e, "Access check failed");
                false
            }
        };

        if granted {
            Ok(())
        } else {
            Err(ErrorKind::AccessDenied)
        }
    }
}

fn write_envelope(out: &mut ResponseWriter, response: &Response) -> io::Result<()> {
    let json = serde_json::to_vec(response).map_err(io::Error::other)?;
    out.write(&json);
    Ok(())
}

#[async_trait]
impl Dispatch for UbusDispatch {
    fn on_body_chunk(&mut self, data: &[u8]) -> BodyProgress {
        let Some(stream) = self.stream.as_mut() else {
            return BodyProgress::Complete;
        };
        if let Err(e) = stream.feed(data) {
            debug!(conn = %self.conn, error = %e, "Request body rejected");
            return BodyProgress::Complete;
        }
        if !self.length_known && stream.is_complete() {
            return BodyProgress::Complete;
        }
        BodyProgress::More
    }

    async fn on_body_complete(&mut self, out: &mut ResponseWriter) -> io::Result<()> {
        let parsed = match self.stream.take() {
            Some(mut stream) => stream.finish(),
            None => Err(JsonStreamError::Incomplete),
        };

        out.send_header(Status::OK);
        out.header("Content-Type", "application/json");
        out.end_headers();

        match parsed {
            Ok(Value::Array(calls)) => {
                out.write(b"[");
                out.flush().await?;
                for (i, call) in calls.iter().enumerate() {
                    tokio::time::sleep(BATCH_STEP).await;
                    let response = self.handle_call(call).await;
                    if i > 0 {
                        out.write(b", ");
                    }
                    write_envelope(out, &response)?;
                    out.flush().await?;
                }
                out.write(b"]\n");
            }
            Ok(call @ Value::Object(_)) => {
                let response = self.handle_call(&call).await;
                write_envelope(out, &response)?;
                out.write(b"\n");
            }
            Ok(_) => {
                write_envelope(out, &Response::parse_error())?;
                out.write(b"\n");
            }
            Err(e) => {
                debug!(conn = %self.conn, error = %e, "Unparseable request body");
                write_envelope(out, &Response::parse_error())?;
                out.write(b"\n");
            }
        }
        Ok(())
    }

    fn on_close(&mut self) {
        if let Some(mut guard) = self.in_flight.take() {
            debug!(conn = %self.conn, "Connection closed with a call outstanding");
            guard.abort();
        }
    }

    fn on_free(&mut self) {
        self.stream = None;
        self.in_flight = None;
    }
}
