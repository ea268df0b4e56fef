use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{SlotStore, StoreError};

/// Reference store. Slot CAS runs under the map's entry lock, so it is
/// atomic with respect to every other writer of the same slot.
pub struct InMemoryStore {
    slots: DashMap<Ulid, Slot>,
    reservations: DashMap<Ulid, Reservation>,
    /// Slot id → reservation ids in creation order.
    by_slot: DashMap<Ulid, Vec<Ulid>>,
    by_user: DashMap<UserId, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            reservations: DashMap::new(),
            by_slot: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, id: &Ulid) -> Option<Slot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slots(&self) -> Vec<Slot> {
        let mut all: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| (s.span.start, s.id));
        all
    }

    /// Reject anything that would fail `insert_slot`, without inserting.
    pub fn check_new_slot(&self, slot: &Slot) -> Result<(), StoreError> {
        slot.validate().map_err(StoreError::Invalid)?;
        if self.slots.contains_key(&slot.id) {
            return Err(StoreError::AlreadyExists(slot.id));
        }
        if self.slots.len() >= MAX_SLOTS {
            return Err(StoreError::Invalid("too many slots"));
        }
        Ok(())
    }

    pub fn insert_slot(&self, slot: &Slot) -> Result<(), StoreError> {
        self.check_new_slot(slot)?;
        match self.slots.entry(slot.id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(slot.id)),
            Entry::Vacant(v) => {
                v.insert(slot.clone());
                Ok(())
            }
        }
    }

    /// Verify `expected_version` against the stored slot without writing.
    pub fn check_version(&self, id: &Ulid, expected_version: u64) -> Result<(), StoreError> {
        let current = self.slots.get(id).ok_or(StoreError::NotFound(*id))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: *id,
                expected: expected_version,
                actual: current.version,
            });
        }
        Ok(())
    }

    pub fn cas_slot(&self, slot: &Slot, expected_version: u64) -> Result<(), StoreError> {
        let mut current = self
            .slots
            .get_mut(&slot.id)
            .ok_or(StoreError::NotFound(slot.id))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: slot.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        // Definition fields are immutable; only occupancy bookkeeping moves.
        current.booked = slot.booked;
        current.version = slot.version;
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    pub fn check_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        if !self.slots.contains_key(&reservation.slot_id) {
            return Err(StoreError::NotFound(reservation.slot_id));
        }
        let is_new = !self.reservations.contains_key(&reservation.id);
        if is_new
            && self
                .by_slot
                .get(&reservation.slot_id)
                .is_some_and(|ids| ids.len() >= MAX_RESERVATIONS_PER_SLOT)
        {
            return Err(StoreError::Invalid("too many reservations on slot"));
        }
        Ok(())
    }

    pub fn put_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.check_reservation(reservation)?;
        self.index_reservation(reservation);
        Ok(())
    }

    fn index_reservation(&self, reservation: &Reservation) {
        let previous = self
            .reservations
            .insert(reservation.id, reservation.clone());
        if previous.is_none() {
            self.by_slot
                .entry(reservation.slot_id)
                .or_default()
                .push(reservation.id);
            self.by_user
                .entry(reservation.user_id.clone())
                .or_default()
                .push(reservation.id);
        }
    }

    fn collect(&self, ids: &[Ulid]) -> Vec<Reservation> {
        ids.iter().filter_map(|id| self.reservation(id)).collect()
    }

    pub fn reservations_of_slot(&self, slot_id: &Ulid) -> Vec<Reservation> {
        let ids = self
            .by_slot
            .get(slot_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        self.collect(&ids)
    }

    pub fn reservations_of_user(&self, user_id: &UserId) -> Vec<Reservation> {
        let ids = self
            .by_user
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        self.collect(&ids)
    }

    // ── Event application ────────────────────────────────────

    /// Apply a replayed or freshly committed WAL event.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::SlotCreated { id, span, capacity, label } => {
                self.slots
                    .insert(*id, Slot::new(*id, *span, *capacity, label.clone()));
            }
            Event::SlotUpdated { id, booked, version } => {
                if let Some(mut slot) = self.slots.get_mut(id) {
                    slot.booked = *booked;
                    slot.version = *version;
                }
            }
            Event::ReservationSaved {
                id,
                slot_id,
                user_id,
                status,
                created_at,
                cancelled_at,
            } => {
                self.index_reservation(&Reservation {
                    id: *id,
                    slot_id: *slot_id,
                    user_id: user_id.clone(),
                    status: *status,
                    created_at: *created_at,
                    cancelled_at: *cancelled_at,
                });
            }
        }
    }

    /// The minimal event sequence that recreates the current state.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for slot in self.slots() {
            events.push(Event::SlotCreated {
                id: slot.id,
                span: slot.span,
                capacity: slot.capacity,
                label: slot.label.clone(),
            });
            if slot.version > 0 {
                events.push(Event::SlotUpdated {
                    id: slot.id,
                    booked: slot.booked,
                    version: slot.version,
                });
            }
            for r in self.reservations_of_slot(&slot.id) {
                events.push(Event::reservation_saved(&r));
            }
        }
        events
    }
}

#[async_trait]
impl SlotStore for InMemoryStore {
    async fn get_slot(&self, id: Ulid) -> Result<Option<Slot>, StoreError> {
        Ok(self.slot(&id))
    }

    async fn save_slot(&self, slot: &Slot, expected_version: u64) -> Result<(), StoreError> {
        self.cas_slot(slot, expected_version)
    }

    async fn list_reservations(&self, slot_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.reservations_of_slot(&slot_id))
    }

    async fn save_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.put_reservation(reservation)
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.reservation(&id))
    }

    async fn list_slots(&self) -> Result<Vec<Slot>, StoreError> {
        Ok(self.slots())
    }

    async fn reservations_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.reservations_of_user(user_id))
    }

    async fn create_slot(&self, slot: &Slot) -> Result<(), StoreError> {
        self.insert_slot(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(capacity: u32) -> Slot {
        Slot::new(Ulid::new(), Span::new(1_000, 2_000), capacity, None)
    }

    #[tokio::test]
    async fn create_and_get_slot() {
        let store = InMemoryStore::new();
        let s = slot(2);
        store.create_slot(&s).await.unwrap();
        assert_eq!(store.get_slot(s.id).await.unwrap(), Some(s.clone()));
        assert_eq!(
            store.create_slot(&s).await,
            Err(StoreError::AlreadyExists(s.id))
        );
        assert_eq!(store.get_slot(Ulid::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_rejects_invalid_slot() {
        let store = InMemoryStore::new();
        let bad = slot(0);
        assert!(matches!(
            store.create_slot(&bad).await,
            Err(StoreError::Invalid(_))
        ));
        assert_eq!(store.slot_count(), 0);
    }

    #[tokio::test]
    async fn save_slot_is_compare_and_swap() {
        let store = InMemoryStore::new();
        let s = slot(2);
        store.create_slot(&s).await.unwrap();

        let mut next = s.clone();
        next.booked = 1;
        next.version = 1;
        store.save_slot(&next, 0).await.unwrap();

        // Stale writer still believes version 0.
        let mut stale = s.clone();
        stale.booked = 1;
        stale.version = 1;
        assert_eq!(
            store.save_slot(&stale, 0).await,
            Err(StoreError::VersionConflict { id: s.id, expected: 0, actual: 1 })
        );

        let stored = store.get_slot(s.id).await.unwrap().unwrap();
        assert_eq!((stored.booked, stored.version), (1, 1));
    }

    #[tokio::test]
    async fn save_slot_ignores_definition_changes() {
        let store = InMemoryStore::new();
        let s = slot(2);
        store.create_slot(&s).await.unwrap();

        let mut next = s.clone();
        next.capacity = 50;
        next.version = 1;
        store.save_slot(&next, 0).await.unwrap();
        assert_eq!(store.get_slot(s.id).await.unwrap().unwrap().capacity, 2);
    }

    #[tokio::test]
    async fn save_slot_unknown_is_not_found() {
        let store = InMemoryStore::new();
        let s = slot(1);
        assert_eq!(store.save_slot(&s, 0).await, Err(StoreError::NotFound(s.id)));
    }

    #[tokio::test]
    async fn reservations_indexed_by_slot_and_user() {
        let store = InMemoryStore::new();
        let a = slot(3);
        let b = slot(3);
        store.create_slot(&a).await.unwrap();
        store.create_slot(&b).await.unwrap();

        let r1 = Reservation::active(a.id, "alice".into(), 1);
        let r2 = Reservation::active(a.id, "bob".into(), 2);
        let r3 = Reservation::active(b.id, "alice".into(), 3);
        for r in [&r1, &r2, &r3] {
            store.save_reservation(r).await.unwrap();
        }

        let on_a = store.list_reservations(a.id).await.unwrap();
        assert_eq!(on_a, vec![r1.clone(), r2.clone()]);

        let alice = store.reservations_for_user(&"alice".into()).await.unwrap();
        assert_eq!(alice, vec![r1.clone(), r3.clone()]);
    }

    #[tokio::test]
    async fn save_reservation_overwrites_by_id() {
        let store = InMemoryStore::new();
        let s = slot(1);
        store.create_slot(&s).await.unwrap();
        let r = Reservation::active(s.id, "alice".into(), 1);
        store.save_reservation(&r).await.unwrap();
        store.save_reservation(&r.cancelled(5)).await.unwrap();

        let listed = store.list_reservations(s.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ReservationStatus::Cancelled);
        assert_eq!(store.get_reservation(r.id).await.unwrap().unwrap().cancelled_at, Some(5));
    }

    #[tokio::test]
    async fn save_reservation_for_unknown_slot_fails() {
        let store = InMemoryStore::new();
        let r = Reservation::active(Ulid::new(), "alice".into(), 1);
        assert_eq!(
            store.save_reservation(&r).await,
            Err(StoreError::NotFound(r.slot_id))
        );
    }

    #[test]
    fn snapshot_then_apply_recreates_state() {
        let store = InMemoryStore::new();
        let s = slot(2);
        store.insert_slot(&s).unwrap();
        let r = Reservation::active(s.id, "alice".into(), 1);
        store.put_reservation(&r).unwrap();
        let mut next = s.clone();
        next.booked = 1;
        next.version = 1;
        store.cas_slot(&next, 0).unwrap();

        let copy = InMemoryStore::new();
        for e in store.snapshot_events() {
            copy.apply(&e);
        }
        assert_eq!(copy.slots(), store.slots());
        assert_eq!(copy.reservations_of_slot(&s.id), vec![r]);
    }

    #[test]
    fn slots_sorted_by_start() {
        let store = InMemoryStore::new();
        let late = Slot::new(Ulid::new(), Span::new(5_000, 6_000), 1, None);
        let early = Slot::new(Ulid::new(), Span::new(1_000, 2_000), 1, None);
        store.insert_slot(&late).unwrap();
        store.insert_slot(&early).unwrap();
        let ids: Vec<Ulid> = store.slots().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }
}
