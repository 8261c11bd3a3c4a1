//! Minimal HTTP/1.x server.
//!
//! ## Architecture
//!
//! - `connection`: sans-IO request parser and connection state
//! - `chunked`: response framing and the buffered response writer
//! - `dispatch`: handler traits and the router
//! - `server`: listener and per-connection driver
//! - `codec`: percent and base64 helpers

pub mod chunked;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod idle;
pub mod request;
pub mod server;

pub use chunked::{ChunkEncoder, Framing, ResponseWriter};
pub use codec::{CodecError, base64_decode, percent_decode, percent_encode};
pub use connection::{Connection, ConnectionConfig, ConnectionId, State};
pub use dispatch::{
    Alias, BodyProgress, Captive, Dispatch, Handler, Rejection, Route, Router, path_match,
};
pub use error::{ProtocolError, Status};
pub use idle::IdleTimer;
pub use request::{Headers, Method, Request, Version};
pub use server::{ConnectionTracker, HttpServer, serve_connection};
