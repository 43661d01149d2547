pub const MAX_ROOMS_PER_PROPERTY: usize = 10_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;
pub const MAX_UNITS_PER_ROOM: u32 = 10_000;
pub const MAX_STAY_NIGHTS: i64 = 365;
pub const MAX_HORIZON_NIGHTS: i64 = 731;
pub const DEFAULT_HORIZON_NIGHTS: u64 = 365;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_IDENTITY_LEN: usize = 256;
pub const MAX_PROPERTIES: usize = 1_000;
pub const MAX_PROPERTY_NAME_LEN: usize = 128;
pub const MAX_GUESTS_PER_BOOKING: u32 = 1_000;

/// Earliest accepted calendar year.
pub const MIN_VALID_YEAR: i32 = 2000;
/// Latest accepted calendar year.
pub const MAX_VALID_YEAR: i32 = 2200;
pub const MAX_SQL_LEN: usize = 16_384;
pub const MAX_USERS: usize = 1_000;
