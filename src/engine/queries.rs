use tokio::time::Instant;
use ulid::Ulid;

use crate::model::*;
use crate::observability::record_operation;
use crate::store::SlotStore;

use super::{EngineError, ReservationEngine, deadline_after};

impl<S: SlotStore> ReservationEngine<S> {
    fn read_deadline(&self) -> Instant {
        deadline_after(self.config.store_timeout)
    }

    /// Capacity, booked count and version of a slot. Callers compare the
    /// version across reads to detect staleness.
    pub async fn occupancy(&self, slot_id: Ulid) -> Result<Occupancy, EngineError> {
        let started = std::time::Instant::now();
        let result = self
            .require_slot(slot_id, self.read_deadline())
            .await
            .map(|slot| slot.occupancy());
        record_operation("occupancy", started, &result);
        result
    }

    pub async fn get_slot(&self, slot_id: Ulid) -> Result<Slot, EngineError> {
        self.require_slot(slot_id, self.read_deadline()).await
    }

    pub async fn get_reservation(&self, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        self.bounded(self.read_deadline(), self.store.get_reservation(reservation_id))
            .await??
            .ok_or(EngineError::ReservationNotFound(reservation_id))
    }

    /// All slots ordered by start time.
    pub async fn list_slots(&self, page: Page) -> Result<Vec<Slot>, EngineError> {
        let slots = self
            .bounded(self.read_deadline(), self.store.list_slots())
            .await??;
        Ok(page.apply(slots))
    }

    /// Slots that still have at least one free place.
    pub async fn available_slots(&self, page: Page) -> Result<Vec<Slot>, EngineError> {
        self.search_slots(None, true, page).await
    }

    /// Slots lying entirely inside `window`.
    pub async fn slots_between(&self, window: Span, page: Page) -> Result<Vec<Slot>, EngineError> {
        self.search_slots(Some(window), false, page).await
    }

    /// Slots ordered by start time, optionally restricted to a window and to
    /// slots with a free place. Paging applies after filtering.
    pub async fn search_slots(
        &self,
        window: Option<Span>,
        available_only: bool,
        page: Page,
    ) -> Result<Vec<Slot>, EngineError> {
        let slots = self
            .bounded(self.read_deadline(), self.store.list_slots())
            .await??;
        Ok(page.apply(
            slots
                .into_iter()
                .filter(|s| window.is_none_or(|w| w.contains_span(&s.span)))
                .filter(|s| !available_only || !s.is_full())
                .collect(),
        ))
    }

    pub async fn reservations_for_slot(
        &self,
        slot_id: Ulid,
        status: Option<ReservationStatus>,
        page: Page,
    ) -> Result<Vec<Reservation>, EngineError> {
        let deadline = self.read_deadline();
        self.require_slot(slot_id, deadline).await?;
        let reservations = self
            .bounded(deadline, self.store.list_reservations(slot_id))
            .await??;
        Ok(page.apply(filter_status(reservations, status)))
    }

    pub async fn reservations_for_user(
        &self,
        user_id: &UserId,
        status: Option<ReservationStatus>,
        page: Page,
    ) -> Result<Vec<Reservation>, EngineError> {
        if !user_id.is_valid() {
            return Err(EngineError::InvalidUser);
        }
        let reservations = self
            .bounded(self.read_deadline(), self.store.reservations_for_user(user_id))
            .await??;
        Ok(page.apply(filter_status(reservations, status)))
    }

    /// Reservations across every slot, in slot start order and then
    /// creation order.
    pub async fn all_reservations(
        &self,
        status: Option<ReservationStatus>,
        page: Page,
    ) -> Result<Vec<Reservation>, EngineError> {
        let deadline = self.read_deadline();
        let slots = self.bounded(deadline, self.store.list_slots()).await??;
        let mut all = Vec::new();
        for slot in slots {
            let reservations = self
                .bounded(deadline, self.store.list_reservations(slot.id))
                .await??;
            all.extend(filter_status(reservations, status));
        }
        Ok(page.apply(all))
    }
}

fn filter_status(
    reservations: Vec<Reservation>,
    status: Option<ReservationStatus>,
) -> Vec<Reservation> {
    match status {
        Some(wanted) => reservations.into_iter().filter(|r| r.status == wanted).collect(),
        None => reservations,
    }
}
