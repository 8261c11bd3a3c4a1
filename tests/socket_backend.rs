mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{call, connect};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};
use uhttpd_gw::backend::{Backend, BackendError, SocketBackend, collect, status};
use uhttpd_gw::http::{ConnectionConfig, Router};
use uhttpd_gw::rpc::{GatewayConfig, UbusGateway};

const SYSTEM: u32 = 7;

/// A bus bridge on loopback serving one client.
///
/// `system.info` answers with two data objects, `system.hang` never
/// answers and neither does a lookup of `silent`. Aborts are reported on
/// the returned channel. Sending on the `oneshot` drops the client
/// connection.
async fn fake_bridge() -> (String, mpsc::UnboundedReceiver<u64>, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (aborts_tx, aborts) = mpsc::unbounded_channel();
    let (hangup, mut hangup_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, LinesCodec::new());
        loop {
            let line = tokio::select! {
                line = framed.next() => match line {
                    Some(Ok(line)) => line,
                    _ => return,
                },
                _ = &mut hangup_rx => return,
            };
            let msg: Value = serde_json::from_str(&line).unwrap();
            let id = msg["id"].as_u64().unwrap();
            let replies = match msg["op"].as_str().unwrap() {
                "lookup" if msg["object"] == "system" => {
                    vec![json!({"type": "object", "id": id, "object": SYSTEM})]
                }
                "lookup" if msg["object"] == "silent" => vec![],
                "lookup" => vec![json!({"type": "object", "id": id})],
                "invoke" if msg["method"] == "info" => vec![
                    json!({"type": "data", "id": id, "data": {"hostname": "bridge"}}),
                    json!({"type": "data", "id": id, "data": {"args": msg["args"]}}),
                    json!({"type": "status", "id": id, "status": 0}),
                ],
                "invoke" if msg["method"] == "hang" => vec![],
                "invoke" => vec![json!({"type": "status", "id": id, "status": status::METHOD_NOT_FOUND})],
                "abort" => {
                    aborts_tx.send(id).unwrap();
                    vec![]
                }
                op => panic!("unexpected op {}", op),
            };
            for reply in replies {
                framed.send(reply.to_string()).await.unwrap();
            }
        }
    });

    (addr, aborts, hangup)
}

#[tokio::test]
async fn test_lookup_and_call() {
    let (addr, _aborts, _hangup) = fake_bridge().await;
    let backend = SocketBackend::connect(&addr).await.unwrap();

    let system = backend.lookup("system").await.unwrap();
    assert_eq!(system, SYSTEM);

    let mut args = Map::new();
    args.insert("verbose".into(), json!(true));
    let done = backend
        .invoke_sync(system, "info", args, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(done.status, status::OK);
    assert_eq!(done.data.len(), 2);
    assert_eq!(done.data[0]["hostname"], json!("bridge"));
    assert_eq!(done.data[1]["args"], json!({"verbose": true}));

    let done = backend
        .invoke_sync(system, "reboot", Map::new(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(done.status, status::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_object() {
    let (addr, _aborts, _hangup) = fake_bridge().await;
    let backend = SocketBackend::connect(&addr).await.unwrap();

    assert!(matches!(
        backend.lookup("network").await,
        Err(BackendError::ObjectNotFound(name)) if name == "network"
    ));
}

#[tokio::test]
async fn test_abandoned_lookup_releases_waiter() {
    let (addr, _aborts, _hangup) = fake_bridge().await;
    let backend = SocketBackend::connect(&addr).await.unwrap();

    let res = timeout(Duration::from_millis(50), backend.lookup("silent")).await;
    assert!(res.is_err());
    assert_eq!(backend.pending(), 0);

    assert_eq!(backend.lookup("system").await.unwrap(), SYSTEM);
    assert_eq!(backend.pending(), 0);
}

#[tokio::test]
async fn test_timeout_sends_abort() {
    let (addr, mut aborts, _hangup) = fake_bridge().await;
    let backend = SocketBackend::connect(&addr).await.unwrap();

    let res = backend
        .invoke_sync(SYSTEM, "hang", Map::new(), Duration::from_millis(30))
        .await;
    assert!(matches!(res, Err(BackendError::Timeout)));

    let aborted = timeout(Duration::from_secs(1), aborts.recv())
        .await
        .expect("abort not sent")
        .unwrap();
    assert!(aborted > 0);

    // A second abort for the same call is not forwarded.
    backend.abort(uhttpd_gw::backend::RequestId(aborted));
    assert!(timeout(Duration::from_millis(50), aborts.recv()).await.is_err());
}

#[tokio::test]
async fn test_disconnect_releases_pending_calls() {
    let (addr, _aborts, hangup) = fake_bridge().await;
    let backend = SocketBackend::connect(&addr).await.unwrap();

    let mut pending = backend.invoke(SYSTEM, "hang", Map::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    hangup.send(()).unwrap();

    let mut data = Vec::new();
    let outcome = timeout(Duration::from_secs(1), collect(&mut pending.events, &mut data))
        .await
        .expect("pending call not released");
    assert_eq!(outcome, None);

    assert!(!backend.is_connected());
    assert!(matches!(
        backend.lookup("system").await,
        Err(BackendError::Disconnected)
    ));
}

#[tokio::test]
async fn test_gateway_over_bridge() {
    let (addr, _aborts, _hangup) = fake_bridge().await;
    let backend = Arc::new(SocketBackend::connect(&addr).await.unwrap());
    let config = GatewayConfig {
        noauth: true,
        ..Default::default()
    };
    let router = Router::new().with_handler(Arc::new(UbusGateway::new(backend, config)));
    let (mut client, _task) = connect(router, ConnectionConfig::default());

    client
        .post("/ubus", &call(json!(1), "system", "info", json!({})).to_string())
        .await;
    assert_eq!(
        client.response().await.json()["result"],
        json!([0, {"hostname": "bridge"}, {"args": {}}])
    );
}
