//! Platform-wide scheduling policy and input bounds.

/// First bookable slot, minutes after midnight (08:00).
pub const FIRST_SLOT_MINUTES: u16 = 8 * 60;

/// Last bookable slot, minutes after midnight (17:00, inclusive).
pub const LAST_SLOT_MINUTES: u16 = 17 * 60;

/// Slot granularity in minutes.
pub const SLOT_STEP_MINUTES: u16 = 30;

/// Number of slots between the first and last slot, inclusive.
pub const SLOTS_PER_DAY: usize =
    ((LAST_SLOT_MINUTES - FIRST_SLOT_MINUTES) / SLOT_STEP_MINUTES) as usize + 1;

/// Max active bookings per vendor per calendar day, across all their properties.
pub const VENDOR_DAILY_CAPACITY: usize = 3;

/// Max active bookings platform-wide per calendar day.
pub const PLATFORM_DAILY_CAPACITY: usize = 10;

pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_ID_LEN: usize = 128;

/// Key count above which the rate limiter sweeps stale keys.
pub const DEFAULT_RATE_LIMIT_MAX_KEYS: usize = 10_000;

/// Max notifications retained per user in the in-process inbox.
pub const MAX_INBOX_LEN: usize = 200;
