/// Longest accepted command line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Dates accepted by one bulk query.
pub const MAX_BULK_DATES: usize = 366;

/// Longest preload window.
pub const MAX_LOOKAHEAD_DAYS: u32 = 90;

/// Registered invalidators per bus.
pub const MAX_INVALIDATORS: usize = 4096;

/// Smallest slot granularity the generator accepts.
pub const MIN_GRANULARITY_MINUTES: u32 = 5;
