use crate::model::Ms;

pub const MAX_HOSTS: usize = 100_000;
pub const MAX_SCHEDULES_PER_HOST: usize = 32;
pub const MAX_EVENT_TYPES_PER_HOST: usize = 256;
pub const MAX_RULES_PER_SCHEDULE: usize = 256;
pub const MAX_OVERRIDES_PER_SCHEDULE: usize = 4096;
pub const MAX_BOOKINGS_PER_HOST: usize = 100_000;
pub const MAX_LINKS_PER_HOST: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_LOCATION_LEN: usize = 2048;

/// Longest bookable event, in minutes.
pub const MAX_EVENT_DURATION_MIN: u32 = 24 * 60;
pub const MAX_BUFFER_MIN: u32 = 24 * 60;
pub const MAX_NOTICE_MIN: u32 = 365 * 24 * 60;

/// Widest picker range accepted by `available_days`.
pub const MAX_QUERY_DAYS: u32 = 366;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
