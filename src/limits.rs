use crate::model::{Ms, DAY_MS};

// Timestamps: year 2000 through year 2200.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single reservation may not occupy a dock for longer than this.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * DAY_MS;
/// Widest window accepted by read-side queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 62 * DAY_MS;

pub const MAX_DOCKS: usize = 10_000;
pub const MAX_RULES_PER_DOCK: usize = 256;
pub const MAX_BOOKINGS_PER_DOCK: usize = 200_000;

pub const MAX_CODE_LEN: usize = 32;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_NOTES_LEN: usize = 4096;

/// ±14h covers every real UTC offset.
pub const MAX_UTC_OFFSET_MIN: i32 = 14 * 60;

pub const MAX_LINE_LEN: usize = 64 * 1024;
