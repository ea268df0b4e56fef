//! Persistence boundary for slots and reservations.
//!
//! The engine is the only writer. It never assumes the store serializes
//! concurrent writers: every slot write carries the version the writer last
//! read, and the store rejects the write if that version is stale.

mod durable;
mod memory;

pub use durable::WalStore;
pub use memory::InMemoryStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Reservation, Slot, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The slot's stored version differs from the writer's `expected`.
    VersionConflict {
        id: Ulid,
        expected: u64,
        actual: u64,
    },
    Invalid(&'static str),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::VersionConflict { id, expected, actual } => write!(
                f,
                "version conflict on slot {id}: expected {expected}, found {actual}"
            ),
            StoreError::Invalid(msg) => write!(f, "invalid: {msg}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait SlotStore: Send + Sync + 'static {
    async fn get_slot(&self, id: Ulid) -> Result<Option<Slot>, StoreError>;

    /// Compare-and-swap write: succeeds only if the stored version equals
    /// `expected_version`.
    async fn save_slot(&self, slot: &Slot, expected_version: u64) -> Result<(), StoreError>;

    async fn list_reservations(&self, slot_id: Ulid) -> Result<Vec<Reservation>, StoreError>;

    /// Insert or overwrite by reservation id.
    async fn save_reservation(&self, reservation: &Reservation) -> Result<(), StoreError>;

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    async fn list_slots(&self) -> Result<Vec<Slot>, StoreError>;

    async fn reservations_for_user(&self, user_id: &UserId)
    -> Result<Vec<Reservation>, StoreError>;

    /// Administrative seeding. Not reachable through the engine.
    async fn create_slot(&self, slot: &Slot) -> Result<(), StoreError>;
}
