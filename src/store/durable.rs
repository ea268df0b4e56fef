use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::{InMemoryStore, SlotStore, StoreError};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append that is already queued (the batch window).
/// 3. One flush + fsync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(ref e) = result {
            tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            wal.discard_pending();
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Index plus writer channel, shared with in-flight commit tasks.
struct Log {
    index: InMemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Log {
    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

/// Durable store: an [`InMemoryStore`] index in front of a write-ahead log.
///
/// Every write is verified, made durable, then applied to the index while the
/// slot's commit lock is held. Writers of different slots share only the
/// group-commit channel.
pub struct WalStore {
    log: Arc<Log>,
    commit_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Writers hold it shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss a concurrent append.
    compaction_gate: Arc<RwLock<()>>,
}

impl WalStore {
    /// Replay the log at `path` and start the writer task. Must be called
    /// from within a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::open(path)?;
        let index = InMemoryStore::new();
        for event in &events {
            index.apply(event);
        }
        tracing::info!(
            "WAL {} replayed: {} events, {} slots",
            path.display(),
            events.len(),
            index.slot_count()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            log: Arc::new(Log { index, wal_tx }),
            commit_locks: DashMap::new(),
            compaction_gate: Arc::new(RwLock::new(())),
        })
    }

    fn commit_lock(&self, slot_id: Ulid) -> Arc<Mutex<()>> {
        self.commit_locks.entry(slot_id).or_default().clone()
    }

    /// Check, persist and apply one event under the slot's commit lock.
    ///
    /// Once both locks are held the rest runs in its own task: a caller that
    /// stops waiting cannot leave an event in the log that the index never
    /// saw. The next writer of the slot queues behind it on the commit lock.
    async fn commit(
        &self,
        slot_id: Ulid,
        check: impl FnOnce(&InMemoryStore) -> Result<(), StoreError> + Send + 'static,
        event: Event,
    ) -> Result<(), StoreError> {
        let gate = self.compaction_gate.clone().read_owned().await;
        let guard = self.commit_lock(slot_id).lock_owned().await;
        let log = self.log.clone();
        let task = tokio::spawn(async move {
            let _gate = gate;
            let _guard = guard;
            check(&log.index)?;
            log.append(&event).await?;
            log.index.apply(&event);
            Ok::<(), StoreError>(())
        });
        task.await
            .map_err(|e| StoreError::Unavailable(format!("commit task failed: {e}")))?
    }

    /// Rewrite the log with only the events needed to recreate current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;
        let events = self.log.index.snapshot_events();
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.log
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .log
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl SlotStore for WalStore {
    async fn get_slot(&self, id: Ulid) -> Result<Option<Slot>, StoreError> {
        Ok(self.log.index.slot(&id))
    }

    async fn save_slot(&self, slot: &Slot, expected_version: u64) -> Result<(), StoreError> {
        let event = Event::SlotUpdated {
            id: slot.id,
            booked: slot.booked,
            version: slot.version,
        };
        let id = slot.id;
        self.commit(
            id,
            move |index| index.check_version(&id, expected_version),
            event,
        )
        .await
    }

    async fn list_reservations(&self, slot_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.log.index.reservations_of_slot(&slot_id))
    }

    async fn save_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let event = Event::reservation_saved(reservation);
        let reservation = reservation.clone();
        self.commit(
            reservation.slot_id,
            move |index| index.check_reservation(&reservation),
            event,
        )
        .await
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.log.index.reservation(&id))
    }

    async fn list_slots(&self) -> Result<Vec<Slot>, StoreError> {
        Ok(self.log.index.slots())
    }

    async fn reservations_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.log.index.reservations_of_user(user_id))
    }

    async fn create_slot(&self, slot: &Slot) -> Result<(), StoreError> {
        let event = Event::SlotCreated {
            id: slot.id,
            span: slot.span,
            capacity: slot.capacity,
            label: slot.label.clone(),
        };
        let slot = slot.clone();
        self.commit(slot.id, move |index| index.check_new_slot(&slot), event)
            .await
    }
}
