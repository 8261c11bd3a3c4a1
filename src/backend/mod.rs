//! Bus backend the gateway forwards calls to.
//!
//! A backend resolves object names to ids and runs method calls. A call is
//! asynchronous: [`Backend::invoke`] returns a [`PendingCall`] whose channel
//! yields zero or more data objects followed by a completion status. Calls
//! that are no longer wanted are cancelled with [`Backend::abort`].
//!
//! ## Implementations
//!
//! - [`MemoryBackend`]: in-process object registry (simulation and tests)
//! - [`SocketBackend`]: newline-delimited JSON bus bridge over TCP

mod memory;
mod socket;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub use memory::{MemoryBackend, Method, Reply};
pub use socket::SocketBackend;

/// Numeric id of a resolved bus object.
pub type ObjectId = u32;

/// Bus status codes carried in call completions.
pub mod status {
    pub const OK: i32 = 0;
    pub const INVALID_COMMAND: i32 = 1;
    pub const INVALID_ARGUMENT: i32 = 2;
    pub const METHOD_NOT_FOUND: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const NO_DATA: i32 = 5;
    pub const PERMISSION_DENIED: i32 = 6;
    pub const TIMEOUT: i32 = 7;
    pub const NOT_SUPPORTED: i32 = 8;
    pub const UNKNOWN_ERROR: i32 = 9;
    pub const CONNECTION_FAILED: i32 = 10;
}

/// Identifies one outstanding call for [`Backend::abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Data(Map<String, Value>),
    Complete(i32),
}

/// An invoked call awaiting its results.
#[derive(Debug)]
pub struct PendingCall {
    pub id: RequestId,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
}

/// All results of a finished call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: i32,
    pub data: Vec<Map<String, Value>>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("unknown object id {0}")]
    UnknownObject(ObjectId),
    #[error("backend call timed out")]
    Timeout,
    #[error("backend disconnected")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn lookup(&self, object: &str) -> Result<ObjectId, BackendError>;

    async fn invoke(
        &self,
        object: ObjectId,
        method: &str,
        args: Map<String, Value>,
    ) -> Result<PendingCall, BackendError>;

    /// Cancel an outstanding call. Unknown or finished ids are ignored.
    fn abort(&self, request: RequestId);

    /// Invoke and wait for completion, aborting the call if `limit` passes
    /// first or the returned future is dropped.
    async fn invoke_sync(
        &self,
        object: ObjectId,
        method: &str,
        args: Map<String, Value>,
        limit: Duration,
    ) -> Result<Completion, BackendError> {
        let PendingCall { id, mut events } = self.invoke(object, method, args).await?;
        let mut call = ScopedCall {
            backend: self,
            request: Some(id),
        };

        let mut data = Vec::new();
        let outcome = tokio::time::timeout(limit, collect(&mut events, &mut data)).await;
        match outcome {
            Ok(Some(status)) => {
                call.request = None;
                Ok(Completion { status, data })
            }
            Ok(None) => {
                call.request = None;
                Err(BackendError::Disconnected)
            }
            Err(_) => {
                call.abort();
                Err(BackendError::Timeout)
            }
        }
    }
}

/// A call awaited in place; aborted if dropped while still outstanding.
struct ScopedCall<'a, B: Backend + ?Sized> {
    backend: &'a B,
    request: Option<RequestId>,
}

impl<B: Backend + ?Sized> ScopedCall<'_, B> {
    fn abort(&mut self) {
        if let Some(request) = self.request.take() {
            debug!(%request, "Aborting backend call");
            self.backend.abort(request);
        }
    }
}

impl<B: Backend + ?Sized> Drop for ScopedCall<'_, B> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Drain a call's events into `data` until it completes.
///
/// Returns `None` if the backend dropped the call without completing it.
pub async fn collect(
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
    data: &mut Vec<Map<String, Value>>,
) -> Option<i32> {
    while let Some(event) = events.recv().await {
        match event {
            CallEvent::Data(object) => data.push(object),
            CallEvent::Complete(status) => return Some(status),
        }
    }
    None
}

/// Owns an outstanding call and aborts it at most once.
///
/// Dropping a guard that is still armed aborts the call.
pub struct CallGuard {
    backend: Arc<dyn Backend>,
    request: Option<RequestId>,
}

impl CallGuard {
    pub fn new(backend: Arc<dyn Backend>, request: RequestId) -> Self {
        Self {
            backend,
            request: Some(request),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.request.is_some()
    }

    pub fn abort(&mut self) {
        if let Some(request) = self.request.take() {
            debug!(%request, "Aborting backend call");
            self.backend.abort(request);
        }
    }

    /// The call finished; forget it.
    pub fn disarm(&mut self) {
        self.request = None;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.abort();
    }
}

impl fmt::Debug for CallGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGuard")
            .field("request", &self.request)
            .finish()
    }
}
