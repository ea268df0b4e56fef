use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::info;
use ulid::Ulid;

use crate::gateway::{BookingGateway, Payload, Request, Response};
use crate::limits::MAX_REQUEST_LINE_LEN;
use crate::notify::Notification;
use crate::observability;
use crate::store::SlotStore;

/// Buffered notifications per connection before forwarders wait on the writer.
const EVENT_BUFFER: usize = 64;

/// Accept connections until `shutdown` resolves. Each connection holds one
/// semaphore permit for its lifetime; connections over the limit are dropped.
pub async fn serve<S: SlotStore>(
    listener: TcpListener,
    gateway: Arc<BookingGateway<S>>,
    semaphore: Arc<Semaphore>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let gw = gateway.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = process_connection(socket, gw).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }
}

/// Wait until every permit is back or `timeout` passes.
pub async fn drain(semaphore: &Semaphore, max_connections: usize, timeout: Duration) {
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(timeout);
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

/// Serve one connection: one response line per request line, in order,
/// interleaved with event lines for watched slots.
pub async fn process_connection<S: SlotStore>(
    socket: TcpStream,
    gateway: Arc<BookingGateway<S>>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_LEN));
    let mut watcher = Watcher::new();
    // After a decode error the framed stream yields one `None` before it
    // resumes reading.
    let mut resuming = false;

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                if matches!(line, Some(Ok(_))) {
                    resuming = false;
                }
                let response = match line {
                    None if resuming => {
                        resuming = false;
                        continue;
                    }
                    None => break Ok(()),
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => match BookingGateway::<S>::parse(&line) {
                        Ok(Request::Watch { slot_id }) => watcher.watch(&gateway, slot_id).await,
                        Ok(Request::Unwatch { slot_id }) => watcher.unwatch(slot_id),
                        Ok(request) => gateway.handle(request).await,
                        Err(response) => response,
                    },
                    // The codec skips the rest of the oversized line.
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        resuming = true;
                        Response::invalid("request line too long")
                    }
                    Some(Err(e)) => break Err(e),
                };
                if let Err(e) = framed.send(response.to_line()).await {
                    break Err(e);
                }
            }
            Some(event) = watcher.events.recv() => {
                if let Err(e) = framed.send(Response::event(event).to_line()).await {
                    break Err(e);
                }
            }
        }
    };

    watcher.stop_all();
    result
}

/// Per-connection slot subscriptions. Each watched slot has a forwarding task
/// that moves notifications from the slot's broadcast channel into one mpsc
/// queue drained by the connection loop.
struct Watcher {
    tx: mpsc::Sender<Notification>,
    events: mpsc::Receiver<Notification>,
    forwarders: HashMap<Ulid, JoinHandle<()>>,
}

impl Watcher {
    fn new() -> Self {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        Self {
            tx,
            events,
            forwarders: HashMap::new(),
        }
    }

    async fn watch<S: SlotStore>(&mut self, gateway: &BookingGateway<S>, slot_id: Ulid) -> Response {
        if let Err(e) = gateway.engine().get_slot(slot_id).await {
            return e.into();
        }
        if !self.forwarders.contains_key(&slot_id) {
            let rx = gateway.engine().notify.subscribe(slot_id);
            let handle = tokio::spawn(forward(rx, self.tx.clone()));
            self.forwarders.insert(slot_id, handle);
        }
        Response::ok(Payload::Watching { slot_id })
    }

    fn unwatch(&mut self, slot_id: Ulid) -> Response {
        if let Some(handle) = self.forwarders.remove(&slot_id) {
            handle.abort();
        }
        Response::ok(Payload::Unwatched { slot_id })
    }

    fn stop_all(&mut self) {
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
    }
}

async fn forward(mut rx: broadcast::Receiver<Notification>, tx: mpsc::Sender<Notification>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("watcher lagged, {n} notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
