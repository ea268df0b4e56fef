use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use slotbook::engine::{EngineConfig, ReservationEngine};
use slotbook::gateway::{BookingGateway, GatewayConfig};
use slotbook::limits::MAX_REQUEST_LINE_LEN;
use slotbook::model::{Slot, Span};
use slotbook::notify::NotifyHub;
use slotbook::server;
use slotbook::store::{SlotStore, WalStore};

// ── Test infrastructure ──────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    slot_id: Ulid,
    store: Arc<WalStore>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

async fn start_test_server(capacity: u32, max_connections: usize) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(WalStore::open(&dir.join("slotbook.wal")).unwrap());

    let slot = Slot::new(
        Ulid::new(),
        Span::new(1_700_000_000_000, 1_700_003_600_000),
        capacity,
        Some("Tekken 8".into()),
    );
    store.create_slot(&slot).await.unwrap();

    let engine = Arc::new(ReservationEngine::new(
        store.clone(),
        Arc::new(NotifyHub::new()),
        EngineConfig::default(),
    ));
    let gateway = Arc::new(BookingGateway::new(engine, GatewayConfig::default()));
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server::serve(listener, gateway, semaphore, async {
            let _ = rx.await;
        })
        .await;
    });

    TestServer {
        addr,
        slot_id: slot.id,
        store,
        shutdown: Some(tx),
        handle,
    }
}

type Client = Framed<TcpStream, LinesCodec>;

async fn connect(addr: SocketAddr) -> Client {
    let socket = TcpStream::connect(addr).await.unwrap();
    Framed::new(socket, LinesCodec::new())
}

async fn recv(client: &mut Client) -> Option<Value> {
    let line = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .ok()??
        .ok()?;
    Some(serde_json::from_str(&line).unwrap())
}

async fn call(client: &mut Client, request: Value) -> Value {
    client.send(request.to_string()).await.unwrap();
    recv(client).await.expect("no response")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_cancel_and_read_over_tcp() {
    let srv = start_test_server(2, 16).await;
    let mut client = connect(srv.addr).await;

    let pong = call(&mut client, json!({"op": "ping"})).await;
    assert_eq!(pong["result"]["type"], "pong");

    let booked = call(
        &mut client,
        json!({"op": "book", "slot_id": srv.slot_id, "user_id": "alice"}),
    )
    .await;
    assert_eq!(booked["status"], "ok");
    assert_eq!(booked["result"]["data"]["status"], "active");

    let occ = call(&mut client, json!({"op": "occupancy", "slot_id": srv.slot_id})).await;
    assert_eq!(occ["result"]["data"]["booked_count"], 1);
    assert_eq!(occ["result"]["data"]["capacity"], 2);

    let dup = call(
        &mut client,
        json!({"op": "book", "slot_id": srv.slot_id, "user_id": "alice"}),
    )
    .await;
    assert_eq!(dup["status"], "error");
    assert_eq!(dup["code"], "DUPLICATE_BOOKING");
    assert_eq!(dup["retryable"], false);

    let cancelled = call(
        &mut client,
        json!({"op": "cancel_reservation", "reservation_id": booked["result"]["data"]["id"]}),
    )
    .await;
    assert_eq!(cancelled["result"]["data"]["status"], "cancelled");

    // Durable: the store reflects the accepted mutations.
    let slot = srv.store.get_slot(srv.slot_id).await.unwrap().unwrap();
    assert_eq!((slot.booked, slot.version), (0, 2));
}

#[tokio::test]
async fn responses_stay_in_request_order() {
    let srv = start_test_server(1, 16).await;
    let mut client = connect(srv.addr).await;

    for user in ["a", "b", "c"] {
        client
            .send(json!({"op": "book", "slot_id": srv.slot_id, "user_id": user}).to_string())
            .await
            .unwrap();
    }
    client.send(json!({"op": "ping"}).to_string()).await.unwrap();

    assert_eq!(recv(&mut client).await.unwrap()["status"], "ok");
    assert_eq!(recv(&mut client).await.unwrap()["code"], "SLOT_FULL");
    assert_eq!(recv(&mut client).await.unwrap()["code"], "SLOT_FULL");
    assert_eq!(recv(&mut client).await.unwrap()["result"]["type"], "pong");
}

#[tokio::test]
async fn watchers_receive_changes_from_other_connections() {
    let srv = start_test_server(2, 16).await;
    let mut watcher = connect(srv.addr).await;
    let mut booker = connect(srv.addr).await;

    let ack = call(&mut watcher, json!({"op": "watch", "slot_id": srv.slot_id})).await;
    assert_eq!(ack["result"]["type"], "watching");

    let missing = call(&mut watcher, json!({"op": "watch", "slot_id": Ulid::new()})).await;
    assert_eq!(missing["code"], "SLOT_NOT_FOUND");

    call(
        &mut booker,
        json!({"op": "book", "slot_id": srv.slot_id, "user_id": "bob"}),
    )
    .await;
    let event = recv(&mut watcher).await.unwrap();
    assert_eq!(event["status"], "event");
    assert_eq!(event["event"]["kind"], "booked");
    assert_eq!(event["event"]["user_id"], "bob");
    assert_eq!(event["event"]["booked_count"], 1);

    call(
        &mut booker,
        json!({"op": "cancel", "slot_id": srv.slot_id, "user_id": "bob"}),
    )
    .await;
    let event = recv(&mut watcher).await.unwrap();
    assert_eq!(event["event"]["kind"], "cancelled");
    assert_eq!(event["event"]["version"], 2);

    let ack = call(&mut watcher, json!({"op": "unwatch", "slot_id": srv.slot_id})).await;
    assert_eq!(ack["result"]["type"], "unwatched");
    call(
        &mut booker,
        json!({"op": "book", "slot_id": srv.slot_id, "user_id": "carol"}),
    )
    .await;
    let pong = call(&mut watcher, json!({"op": "ping"})).await;
    assert_eq!(pong["result"]["type"], "pong");
}

#[tokio::test]
async fn concurrent_connections_never_overbook() {
    let srv = start_test_server(2, 64).await;

    let mut handles = Vec::new();
    for i in 0..12 {
        let addr = srv.addr;
        let slot_id = srv.slot_id;
        handles.push(tokio::spawn(async move {
            let mut client = connect(addr).await;
            call(
                &mut client,
                json!({"op": "book", "slot_id": slot_id, "user_id": format!("player{i}")}),
            )
            .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        let v = h.await.unwrap();
        if v["status"] == "ok" {
            ok += 1;
        } else {
            assert_eq!(v["code"], "SLOT_FULL");
        }
    }
    assert_eq!(ok, 2);
    let slot = srv.store.get_slot(srv.slot_id).await.unwrap().unwrap();
    assert_eq!(slot.booked, 2);
}

#[tokio::test]
async fn bad_lines_do_not_kill_the_connection() {
    let srv = start_test_server(1, 16).await;
    let mut client = connect(srv.addr).await;

    client.send("{not json".to_string()).await.unwrap();
    assert_eq!(recv(&mut client).await.unwrap()["code"], "INVALID_REQUEST");

    client
        .send("x".repeat(MAX_REQUEST_LINE_LEN + 10))
        .await
        .unwrap();
    let too_long = recv(&mut client).await.unwrap();
    assert_eq!(too_long["code"], "INVALID_REQUEST");

    let pong = call(&mut client, json!({"op": "ping"})).await;
    assert_eq!(pong["result"]["type"], "pong");
}

#[tokio::test]
async fn connections_over_the_limit_are_dropped() {
    let srv = start_test_server(1, 1).await;
    let mut first = connect(srv.addr).await;
    assert_eq!(call(&mut first, json!({"op": "ping"})).await["result"]["type"], "pong");

    let mut second = connect(srv.addr).await;
    let _ = second.send(json!({"op": "ping"}).to_string()).await;
    assert!(recv(&mut second).await.is_none());

    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut third = connect(srv.addr).await;
    assert_eq!(call(&mut third, json!({"op": "ping"})).await["result"]["type"], "pong");
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let mut srv = start_test_server(1, 4).await;
    if let Some(tx) = srv.shutdown.take() {
        tx.send(()).unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), &mut srv.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(TcpStream::connect(srv.addr).await.is_err());
}
