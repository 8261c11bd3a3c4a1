//! JSON-RPC 2.0 gateway served over HTTP.
//!
//! ## Architecture
//!
//! - `protocol`: response envelopes, error taxonomy and call validation
//! - `json_stream`: incremental parser for the POST body
//! - `gateway`: the HTTP handler and its per-request dispatch

pub mod gateway;
pub mod json_stream;
pub mod protocol;

pub use gateway::{GatewayConfig, UbusGateway};
pub use protocol::{CallRequest, ErrorKind, Response, RpcError};
