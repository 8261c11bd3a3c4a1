//! JSON-RPC 2.0 envelopes for the bus gateway.
//!
//! Only one method exists, `call`, with positional params
//! `[object, function, args]`. See: https://www.jsonrpc.org/specification

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// The only method the gateway serves.
pub const CALL_METHOD: &str = "call";

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Gateway-specific codes (server error range)
pub const OBJECT_NOT_FOUND: i32 = -32000;
pub const SESSION_NOT_FOUND: i32 = -32001;
pub const ACCESS_DENIED: i32 = -32002;
pub const TIMEOUT: i32 = -32003;

/// Failure of a single call, as reported in its envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("Parse error")]
    ParseError,
    #[error("Invalid request")]
    InvalidRequest,
    #[error("Method not found")]
    MethodNotFound,
    #[error("Invalid parameters")]
    InvalidParams,
    #[error("Internal error")]
    InternalError,
    #[error("Object not found")]
    ObjectNotFound,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Access denied")]
    AccessDenied,
    #[error("ubus request timed out")]
    Timeout,
}

impl ErrorKind {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => PARSE_ERROR,
            Self::InvalidRequest => INVALID_REQUEST,
            Self::MethodNotFound => METHOD_NOT_FOUND,
            Self::InvalidParams => INVALID_PARAMS,
            Self::InternalError => INTERNAL_ERROR,
            Self::ObjectNotFound => OBJECT_NOT_FOUND,
            Self::SessionNotFound => SESSION_NOT_FOUND,
            Self::AccessDenied => ACCESS_DENIED,
            Self::Timeout => TIMEOUT,
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// JSON-RPC 2.0 response object.
///
/// Field order is the wire order: `jsonrpc`, `id`, then `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Echoed from the call, `null` when it had none
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, kind: ErrorKind) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code: kind.code(),
                message: kind.message(),
            }),
        }
    }

    /// Parse error for a body that never produced a call (id unknown).
    pub fn parse_error() -> Self {
        Self::error(Value::Null, ErrorKind::ParseError)
    }

    /// `[status, data...]`: the bus status code followed by every data
    /// object the call returned, in arrival order.
    pub fn call_result(id: Value, status: i32, data: Vec<Map<String, Value>>) -> Self {
        let mut result = Vec::with_capacity(data.len() + 1);
        result.push(Value::from(status));
        result.extend(data.into_iter().map(Value::Object));
        Self::success(id, Value::Array(result))
    }
}

/// Loosely typed call object; field types are checked in [`CallRequest::parse`].
#[derive(Debug, Default, Deserialize)]
struct RawCall {
    #[serde(default)]
    jsonrpc: Option<Value>,
    #[serde(default)]
    method: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
}

/// A validated `call` request.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub object: String,
    pub function: String,
    pub args: Map<String, Value>,
}

impl CallRequest {
    /// Validate a call object. Checks run in a fixed order and the first
    /// failure wins.
    pub fn parse(value: &Value) -> Result<Self, ErrorKind> {
        if !value.is_object() {
            return Err(ErrorKind::ParseError);
        }
        let raw = RawCall::deserialize(value).map_err(|_| ErrorKind::ParseError)?;

        if raw.jsonrpc.as_ref().and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(ErrorKind::InvalidRequest);
        }
        if raw.method.as_ref().and_then(Value::as_str) != Some(CALL_METHOD) {
            return Err(ErrorKind::MethodNotFound);
        }

        let Some(Value::Array(params)) = raw.params else {
            return Err(ErrorKind::InvalidParams);
        };
        match params.as_slice() {
            [Value::String(object), Value::String(function), Value::Object(args)] => Ok(Self {
                object: object.clone(),
                function: function.clone(),
                args: args.clone(),
            }),
            _ => Err(ErrorKind::InvalidParams),
        }
    }
}

/// The `id` to echo for a call element; `null` if absent.
pub fn call_id(value: &Value) -> Value {
    value.get("id").cloned().unwrap_or(Value::Null)
}
