//! Hard resource limits. Every client-reachable allocation is bounded.

use crate::model::Ms;

pub const MAX_LESSONS_PER_STUDIO: usize = 100_000;
pub const MAX_BOOKINGS_PER_LESSON: usize = 10_000;
pub const MAX_CAPACITY: u32 = 10_000;
pub const MAX_DEADLINE_HOURS: u32 = 24 * 365;
pub const MAX_TEXT_LEN: usize = 512;
pub const MAX_BATCH_SIZE: usize = 1_000;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single lesson never spans more than a week.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;
/// Schedule queries are clamped to a year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_STUDIOS: usize = 1_000;
pub const MAX_STUDIO_NAME_LEN: usize = 256;
