use std::fmt;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::{SlotStore, StoreError};

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;
const MINUTES_PER_DAY: u32 = 24 * 60;

/// Opening hours cut into fixed-length slots, repeated every UTC day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySchedule {
    /// Minutes after midnight UTC.
    pub open_minute: u32,
    /// Minutes after midnight UTC; at most 24h.
    pub close_minute: u32,
    pub slot_minutes: u32,
    pub capacity: u32,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    ZeroLengthSlot,
    ClosesBeforeOpening { open_minute: u32, close_minute: u32 },
    ClosesAfterMidnight(u32),
    NoCapacity,
    CapacityTooLarge(u32),
    LabelTooLong,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::ZeroLengthSlot => write!(f, "slot length must be positive"),
            ScheduleError::ClosesBeforeOpening {
                open_minute,
                close_minute,
            } => write!(
                f,
                "closing minute {close_minute} is not after opening minute {open_minute}"
            ),
            ScheduleError::ClosesAfterMidnight(m) => {
                write!(f, "closing minute {m} is past the end of the day")
            }
            ScheduleError::NoCapacity => write!(f, "capacity must be at least 1"),
            ScheduleError::CapacityTooLarge(c) => {
                write!(f, "capacity {c} exceeds {MAX_SLOT_CAPACITY}")
            }
            ScheduleError::LabelTooLong => write!(f, "label longer than {MAX_LABEL_LEN} bytes"),
        }
    }
}

impl std::error::Error for ScheduleError {}

impl Default for DailySchedule {
    fn default() -> Self {
        Self {
            open_minute: 10 * 60,
            close_minute: 22 * 60,
            slot_minutes: 60,
            capacity: 2,
            label: None,
        }
    }
}

impl DailySchedule {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.slot_minutes == 0 {
            return Err(ScheduleError::ZeroLengthSlot);
        }
        if self.close_minute > MINUTES_PER_DAY {
            return Err(ScheduleError::ClosesAfterMidnight(self.close_minute));
        }
        if self.open_minute >= self.close_minute {
            return Err(ScheduleError::ClosesBeforeOpening {
                open_minute: self.open_minute,
                close_minute: self.close_minute,
            });
        }
        if self.capacity == 0 {
            return Err(ScheduleError::NoCapacity);
        }
        if self.capacity > MAX_SLOT_CAPACITY {
            return Err(ScheduleError::CapacityTooLarge(self.capacity));
        }
        if self.label.as_ref().is_some_and(|l| l.len() > MAX_LABEL_LEN) {
            return Err(ScheduleError::LabelTooLong);
        }
        Ok(())
    }

    /// Spans of one day. A slot that would run past closing time is left out.
    pub fn spans_for_day(&self, day_start: Ms) -> Vec<Span> {
        if self.validate().is_err() {
            return Vec::new();
        }
        let open = Ms::from(self.open_minute);
        let close = Ms::from(self.close_minute);
        let step = Ms::from(self.slot_minutes);
        let mut spans = Vec::new();
        let mut m = open;
        while m + step <= close {
            spans.push(Span::new(
                day_start + m * MINUTE_MS,
                day_start + (m + step) * MINUTE_MS,
            ));
            m += step;
        }
        spans
    }

    /// Fresh, empty slots for one day.
    pub fn slots_for_day(&self, day_start: Ms) -> Vec<Slot> {
        self.spans_for_day(day_start)
            .into_iter()
            .map(|span| Slot::new(Ulid::new(), span, self.capacity, self.label.clone()))
            .collect()
    }
}

/// Midnight UTC of the day containing `at`.
pub fn day_start(at: Ms) -> Ms {
    at - at.rem_euclid(DAY_MS)
}

/// Create the day's slots unless the store already has a slot starting that
/// day. Returns how many slots were created.
pub async fn seed_day<S: SlotStore>(
    store: &S,
    schedule: &DailySchedule,
    day_start: Ms,
) -> Result<usize, StoreError> {
    let day = day_start..day_start + DAY_MS;
    let existing = store.list_slots().await?;
    if existing.iter().any(|s| day.contains(&s.span.start)) {
        return Ok(0);
    }
    let slots = schedule.slots_for_day(day_start);
    for slot in &slots {
        store.create_slot(slot).await?;
    }
    Ok(slots.len())
}
