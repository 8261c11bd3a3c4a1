//! In-process backend.
//!
//! Objects and their methods are registered as closures returning a
//! [`Reply`]. Invocations and aborts are recorded, up to the last
//! [`RECORD_LIMIT`] of each, so tests can check what the gateway did.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Backend, BackendError, CallEvent, ObjectId, PendingCall, RequestId, status};

/// A registered method.
pub type Method = Arc<dyn Fn(&Map<String, Value>) -> Reply + Send + Sync>;

/// How a method answers.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Complete {
        status: i32,
        data: Vec<Map<String, Value>>,
    },
    /// Answer after a delay.
    Delayed(Duration, Box<Reply>),
    /// Never answer; the call stays outstanding until aborted.
    Never,
}

impl Reply {
    pub fn status(status: i32) -> Self {
        Self::Complete {
            status,
            data: Vec::new(),
        }
    }

    pub fn data(status: i32, data: Vec<Map<String, Value>>) -> Self {
        Self::Complete { status, data }
    }

    pub fn after(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub request: RequestId,
    pub object: String,
    pub method: String,
    pub args: Map<String, Value>,
}

#[derive(Default)]
struct Registry {
    names: HashMap<String, ObjectId>,
    objects: HashMap<ObjectId, (String, HashMap<String, Method>)>,
    next_object: ObjectId,
}

type Tasks = Arc<Mutex<HashMap<RequestId, JoinHandle<()>>>>;

/// Most recent invocations and aborts kept for inspection.
pub const RECORD_LIMIT: usize = 1024;

fn record<T>(log: &Mutex<VecDeque<T>>, entry: T) {
    let mut log = lock(log);
    if log.len() == RECORD_LIMIT {
        log.pop_front();
    }
    log.push_back(entry);
}

#[derive(Default)]
pub struct MemoryBackend {
    registry: Mutex<Registry>,
    next_request: AtomicU64,
    /// Deliveries still running (delayed or never-answering calls)
    tasks: Tasks,
    invocations: Mutex<VecDeque<Invocation>>,
    aborted: Mutex<VecDeque<RequestId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend used by `--simulation`: a session object that grants every
    /// access check, and a small `system` object.
    pub fn simulation() -> Self {
        let backend = Self::new();
        backend.register(
            "session",
            "access",
            Arc::new(|_: &Map<String, Value>| {
                Reply::data(status::OK, vec![object(json!({ "access": true }))])
            }),
        );
        backend.register(
            "system",
            "info",
            Arc::new(|_: &Map<String, Value>| {
                Reply::data(
                    status::OK,
                    vec![object(json!({
                        "hostname": "uhttpd-gw",
                        "release": { "distribution": "simulation" },
                    }))],
                )
            }),
        );
        backend.register(
            "system",
            "echo",
            Arc::new(|args: &Map<String, Value>| Reply::data(status::OK, vec![args.clone()])),
        );
        backend
    }

    /// Add `method` to `object`, creating the object on first use.
    pub fn register(&self, object: &str, method: &str, handler: Method) -> ObjectId {
        let mut registry = lock(&self.registry);
        let id = match registry.names.get(object) {
            Some(id) => *id,
            None => {
                registry.next_object += 1;
                let id = registry.next_object;
                registry.names.insert(object.to_string(), id);
                registry
                    .objects
                    .insert(id, (object.to_string(), HashMap::new()));
                id
            }
        };
        if let Some((_, methods)) = registry.objects.get_mut(&id) {
            methods.insert(method.to_string(), handler);
        }
        id
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).iter().cloned().collect()
    }

    pub fn aborted(&self) -> Vec<RequestId> {
        lock(&self.aborted).iter().copied().collect()
    }

    /// Calls whose answer has not been delivered yet.
    pub fn outstanding(&self) -> usize {
        lock(&self.tasks)
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }
}

fn send_complete(
    tx: &mpsc::UnboundedSender<CallEvent>,
    status: i32,
    data: Vec<Map<String, Value>>,
) {
    for object in data {
        let _ = tx.send(CallEvent::Data(object));
    }
    let _ = tx.send(CallEvent::Complete(status));
}

async fn deliver(mut reply: Reply, tx: mpsc::UnboundedSender<CallEvent>) {
    loop {
        match reply {
            Reply::Complete { status, data } => return send_complete(&tx, status, data),
            Reply::Delayed(delay, next) => {
                tokio::time::sleep(delay).await;
                reply = *next;
            }
            Reply::Never => {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn lookup(&self, object: &str) -> Result<ObjectId, BackendError> {
        lock(&self.registry)
            .names
            .get(object)
            .copied()
            .ok_or_else(|| BackendError::ObjectNotFound(object.to_string()))
    }

    async fn invoke(
        &self,
        object: ObjectId,
        method: &str,
        args: Map<String, Value>,
    ) -> Result<PendingCall, BackendError> {
        let (name, handler) = {
            let registry = lock(&self.registry);
            let (name, methods) = registry
                .objects
                .get(&object)
                .ok_or(BackendError::UnknownObject(object))?;
            (name.clone(), methods.get(method).cloned())
        };

        let request = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(%request, object = %name, method, "Memory backend call");

        let reply = match &handler {
            Some(handler) => handler(&args),
            None => Reply::status(status::METHOD_NOT_FOUND),
        };
        record(
            &self.invocations,
            Invocation {
                request,
                object: name,
                method: method.to_string(),
                args,
            },
        );

        let (tx, events) = mpsc::unbounded_channel();
        match reply {
            Reply::Complete { status, data } => send_complete(&tx, status, data),
            pending => {
                let tasks = self.tasks.clone();
                let task = tokio::spawn(async move {
                    deliver(pending, tx).await;
                    lock(&tasks).remove(&request);
                });
                lock(&self.tasks).insert(request, task);
            }
        }

        Ok(PendingCall {
            id: request,
            events,
        })
    }

    fn abort(&self, request: RequestId) {
        debug!(%request, "Memory backend abort");
        record(&self.aborted, request);
        if let Some(task) = lock(&self.tasks).remove(&request) {
            task.abort();
        }
    }
}
