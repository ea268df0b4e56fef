use ulid::Ulid;

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    SlotNotFound(Ulid),
    /// Carries the slot id for `(slot, user)` lookups and the reservation id
    /// for lookups by reservation.
    ReservationNotFound(Ulid),
    SlotFull {
        slot_id: Ulid,
        capacity: u32,
    },
    DuplicateBooking {
        slot_id: Ulid,
        reservation_id: Ulid,
    },
    AlreadyCancelled {
        reservation_id: Ulid,
    },
    Timeout,
    Contention {
        slot_id: Ulid,
        attempts: u32,
    },
    StoreUnavailable(String),
    InvalidUser,
    LimitExceeded(&'static str),
}

/// Coarse grouping that decides logging level and retry advice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Conflict,
    Transient,
    Fatal,
    Invalid,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::SlotNotFound(_) | EngineError::ReservationNotFound(_) => {
                ErrorClass::NotFound
            }
            EngineError::SlotFull { .. }
            | EngineError::DuplicateBooking { .. }
            | EngineError::AlreadyCancelled { .. } => ErrorClass::Conflict,
            EngineError::Timeout | EngineError::Contention { .. } => ErrorClass::Transient,
            EngineError::StoreUnavailable(_) => ErrorClass::Fatal,
            EngineError::InvalidUser | EngineError::LimitExceeded(_) => ErrorClass::Invalid,
        }
    }

    /// Only transient failures may be retried by the caller as-is.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotNotFound(id) => write!(f, "slot not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "no reservation found for {id}"),
            EngineError::SlotFull { slot_id, capacity } => {
                write!(f, "slot {slot_id} is full: capacity {capacity} reached")
            }
            EngineError::DuplicateBooking { slot_id, reservation_id } => write!(
                f,
                "already booked slot {slot_id} with reservation {reservation_id}"
            ),
            EngineError::AlreadyCancelled { reservation_id } => {
                write!(f, "reservation {reservation_id} is already cancelled")
            }
            EngineError::Timeout => write!(f, "operation timed out"),
            EngineError::Contention { slot_id, attempts } => write!(
                f,
                "slot {slot_id} is contended: {attempts} version conflicts"
            ),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
            EngineError::InvalidUser => write!(f, "invalid user id"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::SlotNotFound(id),
            StoreError::VersionConflict { id, .. } => EngineError::Contention {
                slot_id: id,
                attempts: 1,
            },
            StoreError::Invalid(msg) => EngineError::LimitExceeded(msg),
            StoreError::AlreadyExists(id) => {
                EngineError::StoreUnavailable(format!("unexpected duplicate record {id}"))
            }
            StoreError::Unavailable(e) => EngineError::StoreUnavailable(e),
        }
    }
}
