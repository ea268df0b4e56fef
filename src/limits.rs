use crate::model::Ms;

pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_SLOTS: usize = 100_000;
pub const MAX_RESERVATIONS_PER_SLOT: usize = 10_000;
pub const MAX_SLOT_CAPACITY: u32 = 10_000;
pub const MAX_PAGE_LIMIT: usize = 1_000;
pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_REQUEST_LINE_LEN: usize = 64 * 1024;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A slot may not be longer than a day.
pub const MAX_SLOT_DURATION_MS: Ms = 86_400_000;
