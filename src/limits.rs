use crate::model::{DAY_MS, Ms};

/// 1970-01-01T00:00:00 local.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00 local.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not span more than a school year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 2048;
pub const MAX_SUBJECTS_PER_BOOKING: usize = 256;
pub const MAX_INTERVALS_PER_SUBJECT: usize = 100_000;
pub const MAX_ASSIGNMENT_MEMBERS: usize = 256;

pub const MAX_IMPORT_ROWS: usize = 5_000;
pub const MAX_MANAGED_CLASSES: usize = 32;
pub const MAX_UPLOAD_BYTES: usize = 8 * 1024 * 1024;

/// Upper bound for one JSON line on the wire (a full import batch fits).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 1_024;
