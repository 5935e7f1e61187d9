use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single booking or block may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;

pub const MAX_COURTS_PER_TENANT: usize = 10_000;
/// Bookings + blocks + waitlist entries retained on one court.
pub const MAX_ENTITIES_PER_COURT: usize = 200_000;
/// Two years of weekly occurrences.
pub const MAX_SERIES_OCCURRENCES: usize = 104;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_ACTOR_LEN: usize = 256;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Length of an issued reservation token.
pub const RESERVATION_TOKEN_LEN: usize = 43;
