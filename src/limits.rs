/// Longest allowed distance between `series_start` and `series_end`.
pub const MAX_SERIES_DAYS: i64 = 3660;

pub const MAX_TIME_WINDOWS: usize = 16;

pub const MAX_MANUAL_DATES: usize = 1000;

/// Cap on occurrences a single rule may expand into.
pub const MAX_SESSIONS_PER_SERIES: usize = 5000;

pub const MAX_REASON_LEN: usize = 1024;
