use std::time::Duration;

use tokio::time::Instant;
use ulid::Ulid;

use crate::limits::MAX_RESERVATIONS_PER_SLOT;
use crate::model::*;
use crate::notify::Notification;
use crate::observability::record_operation;
use crate::store::{SlotStore, StoreError};

use super::{EngineError, ReservationEngine, Restore, count_active, deadline_after, log_outcome};

/// Which reservation a cancellation is aimed at.
enum CancelTarget<'a> {
    /// The caller's active reservation on the slot.
    Holder(&'a UserId),
    /// One specific reservation record.
    Reservation(Ulid),
}

impl CancelTarget<'_> {
    fn select(&self, slot_id: Ulid, reservations: &[Reservation]) -> Result<Reservation, EngineError> {
        match self {
            CancelTarget::Holder(user_id) => {
                let mut latest_cancelled = None;
                for r in reservations.iter().filter(|r| &r.user_id == *user_id) {
                    if r.is_active() {
                        return Ok(r.clone());
                    }
                    latest_cancelled = Some(r.id);
                }
                match latest_cancelled {
                    Some(reservation_id) => Err(EngineError::AlreadyCancelled { reservation_id }),
                    None => Err(EngineError::ReservationNotFound(slot_id)),
                }
            }
            CancelTarget::Reservation(id) => match reservations.iter().find(|r| r.id == *id) {
                Some(r) if r.is_active() => Ok(r.clone()),
                Some(r) => Err(EngineError::AlreadyCancelled { reservation_id: r.id }),
                None => Err(EngineError::ReservationNotFound(*id)),
            },
        }
    }
}

impl<S: SlotStore> ReservationEngine<S> {
    /// Claim one place on a slot for `user_id`.
    ///
    /// Fails with `SlotFull` when every place is taken and with
    /// `DuplicateBooking` when the user already holds an active reservation on
    /// the slot. Store calls and lock acquisition are bounded by `timeout`.
    pub async fn book(
        &self,
        slot_id: Ulid,
        user_id: &UserId,
        timeout: Duration,
    ) -> Result<Reservation, EngineError> {
        let started = std::time::Instant::now();
        let result = self.book_inner(slot_id, user_id, deadline_after(timeout)).await;
        record_operation("book", started, &result);
        log_outcome("book", slot_id, user_id, &result);
        result
    }

    async fn book_inner(
        &self,
        slot_id: Ulid,
        user_id: &UserId,
        deadline: Instant,
    ) -> Result<Reservation, EngineError> {
        if !user_id.is_valid() {
            return Err(EngineError::InvalidUser);
        }
        self.require_slot(slot_id, deadline).await?;
        let _guard = self.lock_slot(slot_id, deadline).await?;

        let mut attempt = 0;
        let (claimed, previously_booked) = loop {
            let slot = self.require_slot(slot_id, deadline).await?;
            let reservations = self
                .bounded(deadline, self.store.list_reservations(slot_id))
                .await??;

            if let Some(existing) = reservations
                .iter()
                .find(|r| r.is_active() && &r.user_id == user_id)
            {
                return Err(EngineError::DuplicateBooking {
                    slot_id,
                    reservation_id: existing.id,
                });
            }
            // Decide from the records, not the counter: they are the source
            // of truth if a rollback ever failed.
            let active = count_active(&reservations);
            if active >= slot.capacity {
                return Err(EngineError::SlotFull {
                    slot_id,
                    capacity: slot.capacity,
                });
            }
            if reservations.len() >= MAX_RESERVATIONS_PER_SLOT {
                return Err(EngineError::LimitExceeded("too many reservations on slot"));
            }

            let next = Slot {
                booked: active + 1,
                version: slot.version + 1,
                ..slot.clone()
            };
            match self
                .bounded(deadline, self.store.save_slot(&next, slot.version))
                .await
            {
                Ok(Ok(())) => break (next, active),
                Ok(Err(StoreError::VersionConflict { .. })) => {
                    attempt += 1;
                    self.after_conflict(slot_id, attempt, deadline).await?;
                }
                Ok(Err(e)) => return Err(e.into()),
                // The claim may still land after the caller gave up.
                Err(timeout) => {
                    self.compensate(&next, active, None).await;
                    return Err(timeout);
                }
            }
        };

        let reservation = Reservation::active(slot_id, user_id.clone(), now_ms());
        let saved = match self
            .bounded(deadline, self.store.save_reservation(&reservation))
            .await
        {
            Ok(inner) => inner.map_err(EngineError::from),
            Err(timeout) => Err(timeout),
        };
        if let Err(e) = saved {
            let restore = Restore::CancelIfStored(reservation.id);
            self.compensate(&claimed, previously_booked, Some(restore)).await;
            return Err(e);
        }

        self.notify.send(Notification::Booked {
            slot_id,
            reservation_id: reservation.id,
            user_id: user_id.clone(),
            booked_count: claimed.booked,
            version: claimed.version,
            at: reservation.created_at,
        });
        Ok(reservation)
    }

    /// Cancel the caller's active reservation on a slot.
    ///
    /// A second cancel returns `AlreadyCancelled` and leaves occupancy alone.
    pub async fn cancel(
        &self,
        slot_id: Ulid,
        user_id: &UserId,
        timeout: Duration,
    ) -> Result<Reservation, EngineError> {
        let started = std::time::Instant::now();
        let result = if user_id.is_valid() {
            self.cancel_inner(slot_id, CancelTarget::Holder(user_id), deadline_after(timeout))
                .await
        } else {
            Err(EngineError::InvalidUser)
        };
        record_operation("cancel", started, &result);
        log_outcome("cancel", slot_id, user_id, &result);
        result
    }

    /// Cancel one reservation by id.
    pub async fn cancel_reservation(
        &self,
        reservation_id: Ulid,
        timeout: Duration,
    ) -> Result<Reservation, EngineError> {
        let started = std::time::Instant::now();
        let deadline = deadline_after(timeout);
        let found = match self
            .bounded(deadline, self.store.get_reservation(reservation_id))
            .await
        {
            Ok(Ok(Some(r))) => Ok(r),
            Ok(Ok(None)) => Err(EngineError::ReservationNotFound(reservation_id)),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e),
        };
        let result = match found {
            Ok(r) => {
                let result = self
                    .cancel_inner(r.slot_id, CancelTarget::Reservation(r.id), deadline)
                    .await;
                log_outcome("cancel_reservation", r.slot_id, &r.user_id, &result);
                result
            }
            Err(e) => {
                tracing::debug!("cancel_reservation {reservation_id}: {e}");
                Err(e)
            }
        };
        record_operation("cancel_reservation", started, &result);
        result
    }

    async fn cancel_inner(
        &self,
        slot_id: Ulid,
        target: CancelTarget<'_>,
        deadline: Instant,
    ) -> Result<Reservation, EngineError> {
        self.require_slot(slot_id, deadline).await?;
        let _guard = self.lock_slot(slot_id, deadline).await?;

        let mut attempt = 0;
        let (claimed, previously_booked, active_reservation) = loop {
            let slot = self.require_slot(slot_id, deadline).await?;
            let reservations = self
                .bounded(deadline, self.store.list_reservations(slot_id))
                .await??;
            let chosen = target.select(slot_id, &reservations)?;

            let active = count_active(&reservations);
            let next = Slot {
                booked: active.saturating_sub(1),
                version: slot.version + 1,
                ..slot.clone()
            };
            match self
                .bounded(deadline, self.store.save_slot(&next, slot.version))
                .await
            {
                Ok(Ok(())) => break (next, active, chosen),
                Ok(Err(StoreError::VersionConflict { .. })) => {
                    attempt += 1;
                    self.after_conflict(slot_id, attempt, deadline).await?;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(timeout) => {
                    self.compensate(&next, active, None).await;
                    return Err(timeout);
                }
            }
        };

        let cancelled = active_reservation.cancelled(now_ms());
        let saved = match self
            .bounded(deadline, self.store.save_reservation(&cancelled))
            .await
        {
            Ok(inner) => inner.map_err(EngineError::from),
            Err(timeout) => Err(timeout),
        };
        if let Err(e) = saved {
            let restore = Restore::Previous(&active_reservation);
            self.compensate(&claimed, previously_booked, Some(restore)).await;
            return Err(e);
        }

        self.notify.send(Notification::Cancelled {
            slot_id,
            reservation_id: cancelled.id,
            user_id: cancelled.user_id.clone(),
            booked_count: claimed.booked,
            version: claimed.version,
            at: cancelled.cancelled_at.unwrap_or_default(),
        });
        Ok(cancelled)
    }
}
