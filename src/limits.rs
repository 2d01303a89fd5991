//! Hard caps on inputs. Every mutation validates against these before
//! touching the WAL, so a misbehaving client cannot grow state unboundedly.

pub const MAX_TEACHERS: usize = 10_000;
pub const MAX_WEEKLY_RANGES_PER_TEACHER: usize = 64;
pub const MAX_EXCEPTIONS_PER_TEACHER: usize = 1_024;
pub const MAX_LESSONS_PER_TEACHER: usize = 100_000;
pub const MAX_WAITLIST_PER_TEACHER: usize = 1_024;

/// Selections per booking submission (a multi-slot request is all-or-nothing,
/// so the validation cost is quadratic in this).
pub const MAX_SELECTIONS_PER_BOOKING: usize = 32;

/// Widest slot-query window, in days.
pub const MAX_QUERY_DAYS: i64 = 120;

pub const MAX_REASON_LEN: usize = 256;
pub const MAX_LOCATION_LEN: usize = 256;
pub const MAX_MESSAGE_LEN: usize = 2_048;

pub const MIN_LESSON_MINUTES: u32 = 5;
pub const MAX_LESSON_MINUTES: u32 = 24 * 60;

pub const MAX_BUFFER_MINUTES: u32 = 24 * 60;
pub const MAX_NOTICE_HOURS: u32 = 24 * 365;
pub const MAX_HORIZON_DAYS: u32 = 2 * 365;

/// How long a reserved group may sit awaiting payment capture before the
/// reaper releases it.
pub const PAYMENT_CAPTURE_WINDOW_MINUTES: i64 = 30;
