mod error;
mod mutations;
mod queries;

pub use error::{EngineError, ErrorClass};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::{SlotStore, StoreError};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound for reads that carry no caller deadline, and for compensation.
    pub store_timeout: Duration,
    /// Version conflicts tolerated before giving up with `Contention`.
    pub max_cas_attempts: u32,
    /// Backoff after the n-th conflict is `n * cas_backoff`.
    pub cas_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            max_cas_attempts: 8,
            cas_backoff: Duration::from_millis(2),
        }
    }
}

/// Sole authority for slot occupancy. Every booking and cancellation is
/// decided here, under the slot's lock, and written with a version check.
pub struct ReservationEngine<S: SlotStore> {
    store: Arc<S>,
    pub notify: Arc<NotifyHub>,
    config: EngineConfig,
    /// Per-slot critical section for the read-modify-write. Entries are only
    /// created for slots that exist.
    slot_locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl<S: SlotStore> ReservationEngine<S> {
    pub fn new(store: Arc<S>, notify: Arc<NotifyHub>, config: EngineConfig) -> Self {
        Self {
            store,
            notify,
            config,
            slot_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one store call, bounded by `deadline`. The outer error is the
    /// timeout; the inner one is whatever the store said.
    pub(super) async fn bounded<T>(
        &self,
        deadline: Instant,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<Result<T, StoreError>, EngineError> {
        tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| EngineError::Timeout)
    }

    /// Read a slot or fail with `SlotNotFound`.
    pub(super) async fn require_slot(
        &self,
        slot_id: Ulid,
        deadline: Instant,
    ) -> Result<Slot, EngineError> {
        self.bounded(deadline, self.store.get_slot(slot_id))
            .await??
            .ok_or(EngineError::SlotNotFound(slot_id))
    }

    pub(super) async fn lock_slot(
        &self,
        slot_id: Ulid,
        deadline: Instant,
    ) -> Result<OwnedMutexGuard<()>, EngineError> {
        let lock = self.slot_locks.entry(slot_id).or_default().clone();
        tokio::time::timeout_at(deadline, lock.lock_owned())
            .await
            .map_err(|_| EngineError::Timeout)
    }

    /// Called after the n-th version conflict on a slot write. Backs off, or
    /// gives up once the attempt budget is spent.
    pub(super) async fn after_conflict(
        &self,
        slot_id: Ulid,
        attempt: u32,
        deadline: Instant,
    ) -> Result<(), EngineError> {
        metrics::counter!(crate::observability::CAS_CONFLICTS_TOTAL).increment(1);
        if attempt >= self.config.max_cas_attempts {
            return Err(EngineError::Contention {
                slot_id,
                attempts: attempt,
            });
        }
        let wake = deadline_after(self.config.cas_backoff.saturating_mul(attempt)).min(deadline);
        tokio::time::sleep_until(wake).await;
        Ok(())
    }

    /// Undo a capacity claim that may have landed: restore `booked` with one
    /// more version bump, then put the reservation back the way it was before
    /// the operation if the failed write may have landed.
    ///
    /// The rollback is itself version-checked against the claim, so a claim
    /// that never reached the store is left alone.
    pub(super) async fn compensate(
        &self,
        claimed: &Slot,
        restore_booked: u32,
        restore_reservation: Option<Restore<'_>>,
    ) {
        metrics::counter!(crate::observability::COMPENSATIONS_TOTAL).increment(1);
        let deadline = deadline_after(self.config.store_timeout);
        let restored = Slot {
            booked: restore_booked,
            version: claimed.version + 1,
            ..claimed.clone()
        };
        match self
            .bounded(deadline, self.store.save_slot(&restored, claimed.version))
            .await
        {
            Ok(Ok(())) => tracing::warn!(
                "rolled back claim on slot {} to booked={restore_booked}",
                claimed.id
            ),
            Ok(Err(StoreError::VersionConflict { .. })) => {
                tracing::debug!("claim on slot {} never landed, nothing to roll back", claimed.id)
            }
            Ok(Err(e)) => tracing::error!("rollback of slot {} failed: {e}", claimed.id),
            Err(e) => tracing::error!("rollback of slot {} failed: {e}", claimed.id),
        }

        let reservation = match restore_reservation {
            None => None,
            Some(Restore::Previous(r)) => Some(r.clone()),
            Some(Restore::CancelIfStored(id)) => {
                match self.bounded(deadline, self.store.get_reservation(id)).await {
                    Ok(Ok(Some(r))) if r.is_active() => Some(r.cancelled(now_ms())),
                    _ => None,
                }
            }
        };
        if let Some(r) = reservation {
            match self.bounded(deadline, self.store.save_reservation(&r)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("restoring reservation {} failed: {e}", r.id),
                Err(e) => tracing::error!("restoring reservation {} failed: {e}", r.id),
            }
        }
    }
}

/// What the compensation path should do with the reservation record.
pub(super) enum Restore<'a> {
    /// Re-save the record as it was before the operation.
    Previous(&'a Reservation),
    /// The new record may or may not have landed; cancel it if it did.
    CancelIfStored(Ulid),
}

/// `now + timeout`, or a deadline decades away if that overflows.
pub(super) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

pub(super) fn count_active(reservations: &[Reservation]) -> u32 {
    reservations.iter().filter(|r| r.is_active()).count() as u32
}

pub(super) fn log_outcome<T>(
    op: &str,
    slot_id: Ulid,
    user_id: &UserId,
    result: &Result<T, EngineError>,
) {
    match result {
        Ok(_) => tracing::debug!("{op} on slot {slot_id} by {user_id}: accepted"),
        Err(e) => match e.class() {
            ErrorClass::NotFound | ErrorClass::Conflict | ErrorClass::Invalid => {
                tracing::debug!("{op} on slot {slot_id} by {user_id}: {e}")
            }
            ErrorClass::Transient => tracing::warn!("{op} on slot {slot_id} by {user_id}: {e}"),
            ErrorClass::Fatal => tracing::error!("{op} on slot {slot_id} by {user_id}: {e}"),
        },
    }
}
