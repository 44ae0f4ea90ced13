//! Hard caps applied at the admission boundary.

/// Total bookings a single store will hold.
pub const MAX_BOOKINGS: usize = 1_000_000;

/// Longest weekday/time/kind literal accepted before parsing.
pub const MAX_LITERAL_LEN: usize = 32;

/// Attempts to lock a booking whose resources keep moving under concurrent updates.
pub const MAX_LOCK_ATTEMPTS: usize = 3;

/// Idle lock slots are pruned once the table grows past this size.
pub const LOCK_TABLE_PRUNE_THRESHOLD: usize = 4096;

/// Longest SQL statement accepted on the wire.
pub const MAX_SQL_LEN: usize = 16 * 1024;
