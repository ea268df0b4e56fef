use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;

/// Unix milliseconds.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Opaque caller identity, established by whatever authenticates the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= MAX_USER_ID_LEN
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A bookable time window with fixed capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub span: Span,
    pub capacity: u32,
    /// Number of active reservations as of `version`.
    pub booked: u32,
    /// Bumped by one on every accepted mutation.
    pub version: u64,
    pub label: Option<String>,
}

impl Slot {
    pub fn new(id: Ulid, span: Span, capacity: u32, label: Option<String>) -> Self {
        Self {
            id,
            span,
            capacity,
            booked: 0,
            version: 0,
            label,
        }
    }

    pub fn is_full(&self) -> bool {
        self.booked >= self.capacity
    }

    /// Checks the creation-time invariants. Returns the violated rule.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.span.start >= self.span.end {
            return Err("slot start must be before end");
        }
        if self.span.start < MIN_VALID_TIMESTAMP_MS || self.span.end > MAX_VALID_TIMESTAMP_MS {
            return Err("timestamp out of range");
        }
        if self.span.duration_ms() > MAX_SLOT_DURATION_MS {
            return Err("slot too long");
        }
        if self.capacity == 0 {
            return Err("capacity must be positive");
        }
        if self.capacity > MAX_SLOT_CAPACITY {
            return Err("capacity too large");
        }
        if self.booked != 0 || self.version != 0 {
            return Err("new slot must start empty at version 0");
        }
        if let Some(ref l) = self.label
            && l.len() > MAX_LABEL_LEN
        {
            return Err("label too long");
        }
        Ok(())
    }

    pub fn occupancy(&self) -> Occupancy {
        Occupancy {
            slot_id: self.id,
            capacity: self.capacity,
            booked_count: self.booked,
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

/// One user's claim on one slot. Never deleted; cancellation is a state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub user_id: UserId,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl Reservation {
    pub fn active(slot_id: Ulid, user_id: UserId, now: Ms) -> Self {
        Self {
            id: Ulid::new(),
            slot_id,
            user_id,
            status: ReservationStatus::Active,
            created_at: now,
            cancelled_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// Copy of this reservation transitioned to `Cancelled`.
    pub fn cancelled(&self, now: Ms) -> Self {
        Self {
            status: ReservationStatus::Cancelled,
            cancelled_at: Some(now),
            ..self.clone()
        }
    }
}

/// Read-only view of a slot's fill level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupancy {
    pub slot_id: Ulid,
    pub capacity: u32,
    pub booked_count: u32,
    pub version: u64,
}

/// Offset/limit window over a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.min(MAX_PAGE_LIMIT),
        }
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset)
            .take(self.limit.min(MAX_PAGE_LIMIT))
            .collect()
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: Ulid,
        span: Span,
        capacity: u32,
        label: Option<String>,
    },
    SlotUpdated {
        id: Ulid,
        booked: u32,
        version: u64,
    },
    ReservationSaved {
        id: Ulid,
        slot_id: Ulid,
        user_id: UserId,
        status: ReservationStatus,
        created_at: Ms,
        cancelled_at: Option<Ms>,
    },
}

impl Event {
    pub fn slot_id(&self) -> Ulid {
        match self {
            Event::SlotCreated { id, .. } | Event::SlotUpdated { id, .. } => *id,
            Event::ReservationSaved { slot_id, .. } => *slot_id,
        }
    }

    pub fn reservation_saved(r: &Reservation) -> Self {
        Event::ReservationSaved {
            id: r.id,
            slot_id: r.slot_id,
            user_id: r.user_id.clone(),
            status: r.status,
            created_at: r.created_at,
            cancelled_at: r.cancelled_at,
        }
    }
}
