//! Bus bridge client over TCP.
//!
//! One JSON message per line in each direction:
//!
//! ```text
//! -> {"op":"lookup","id":1,"object":"system"}
//! <- {"type":"object","id":1,"object":7}
//! -> {"op":"invoke","id":2,"object":7,"method":"info","args":{}}
//! <- {"type":"data","id":2,"data":{...}}        (zero or more)
//! <- {"type":"status","id":2,"status":0}
//! -> {"op":"abort","id":2}
//! ```
//!
//! A writer task drains an outbound queue into the socket; a reader task
//! routes replies to waiting callers by id. When the connection drops,
//! every waiter is released and sees [`BackendError::Disconnected`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use super::{Backend, BackendError, CallEvent, ObjectId, PendingCall, RequestId};

/// Longest accepted line from the bridge.
const MAX_LINE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Outbound {
    Lookup {
        id: u64,
        object: String,
    },
    Invoke {
        id: u64,
        object: ObjectId,
        method: String,
        args: Map<String, Value>,
    },
    Abort {
        id: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    /// Lookup reply; `object` is absent when the name is unknown.
    Object {
        id: u64,
        #[serde(default)]
        object: Option<ObjectId>,
    },
    Data {
        id: u64,
        data: Map<String, Value>,
    },
    Status {
        id: u64,
        status: i32,
    },
}

enum Waiter {
    Lookup(oneshot::Sender<Option<ObjectId>>),
    Call(mpsc::UnboundedSender<CallEvent>),
}

type Waiters = Arc<Mutex<HashMap<u64, Waiter>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a lookup waiter when the lookup finishes or is dropped.
struct LookupSlot<'a> {
    waiters: &'a Waiters,
    id: u64,
}

impl Drop for LookupSlot<'_> {
    fn drop(&mut self) {
        lock(self.waiters).remove(&self.id);
    }
}

pub struct SocketBackend {
    outbound: mpsc::UnboundedSender<Outbound>,
    waiters: Waiters,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl SocketBackend {
    pub async fn connect(addr: &str) -> Result<Self, BackendError> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        info!(addr, "Connected to bus bridge");
        Ok(Self::from_stream(stream))
    }

    /// Run the protocol over an already established stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
        let (mut sink, mut lines) = framed.split::<String>();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Outbound>();
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                let line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode bus message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    warn!(error = %e, "Bus bridge write failed");
                    break;
                }
            }
        });

        {
            let waiters = waiters.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                while let Some(line) = lines.next().await {
                    match line {
                        Ok(line) => route(&waiters, &line),
                        Err(e) => {
                            warn!(error = %e, "Bus bridge read failed");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::Relaxed);
                let released = {
                    let mut waiters = lock(&waiters);
                    let n = waiters.len();
                    waiters.clear();
                    n
                };
                warn!(pending = released, "Bus bridge disconnected");
            });
        }

        Self {
            outbound,
            waiters,
            next_id: AtomicU64::new(1),
            connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Lookups and calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        lock(&self.waiters).len()
    }

    fn send(&self, message: Outbound) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::Disconnected);
        }
        self.outbound
            .send(message)
            .map_err(|_| BackendError::Disconnected)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Hand one inbound line to whoever waits for its id.
fn route(waiters: &Waiters, line: &str) {
    let message: Inbound = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Malformed bus message");
            return;
        }
    };

    let mut waiters = lock(waiters);
    match message {
        Inbound::Object { id, object } => match waiters.remove(&id) {
            Some(Waiter::Lookup(tx)) => {
                let _ = tx.send(object);
            }
            Some(other) => {
                waiters.insert(id, other);
                warn!(id, "Lookup reply for a call");
            }
            None => debug!(id, "Reply for unknown lookup"),
        },
        Inbound::Data { id, data } => match waiters.get(&id) {
            Some(Waiter::Call(tx)) => {
                let _ = tx.send(CallEvent::Data(data));
            }
            _ => debug!(id, "Data for unknown call"),
        },
        Inbound::Status { id, status } => match waiters.remove(&id) {
            Some(Waiter::Call(tx)) => {
                let _ = tx.send(CallEvent::Complete(status));
            }
            Some(other) => {
                waiters.insert(id, other);
                warn!(id, "Status reply for a lookup");
            }
            None => debug!(id, "Status for unknown call"),
        },
    }
}

#[async_trait]
impl Backend for SocketBackend {
    async fn lookup(&self, object: &str) -> Result<ObjectId, BackendError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(id, Waiter::Lookup(tx));
        let _slot = LookupSlot {
            waiters: &self.waiters,
            id,
        };

        self.send(Outbound::Lookup {
            id,
            object: object.to_string(),
        })?;

        match rx.await {
            Ok(Some(object_id)) => Ok(object_id),
            Ok(None) => Err(BackendError::ObjectNotFound(object.to_string())),
            Err(_) => Err(BackendError::Disconnected),
        }
    }

    async fn invoke(
        &self,
        object: ObjectId,
        method: &str,
        args: Map<String, Value>,
    ) -> Result<PendingCall, BackendError> {
        let id = self.next_id();
        let (tx, events) = mpsc::unbounded_channel();
        lock(&self.waiters).insert(id, Waiter::Call(tx));

        let sent = self.send(Outbound::Invoke {
            id,
            object,
            method: method.to_string(),
            args,
        });
        if let Err(e) = sent {
            lock(&self.waiters).remove(&id);
            return Err(e);
        }

        Ok(PendingCall {
            id: RequestId(id),
            events,
        })
    }

    fn abort(&self, request: RequestId) {
        if lock(&self.waiters).remove(&request.0).is_none() {
            return;
        }
        debug!(%request, "Aborting bus call");
        let _ = self.send(Outbound::Abort { id: request.0 });
    }
}
