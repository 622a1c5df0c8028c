//! Unique-id bit layout helpers.
//!
//! A unique id is a 64-bit value combining a wall-clock millisecond
//! timestamp in the high bits with a rollover counter and the originating
//! partition in the low bits. It orders like time, seeds the per-call
//! deterministic RNG, and doubles as the transaction-time source exposed
//! to procedure code.

/// Bits of millisecond timestamp in the high end of the id.
pub const TIMESTAMP_BITS: u32 = 40;
/// Bits of intra-millisecond rollover counter.
pub const COUNTER_BITS: u32 = 9;
/// Bits of originating partition id.
pub const PARTITION_BITS: u32 = 14;
/// Shift that recovers the timestamp field.
pub const TIMESTAMP_SHIFT: u32 = COUNTER_BITS + PARTITION_BITS;

/// Epoch the timestamp field counts from: 2008-01-01T00:00:00Z.
pub const EPOCH_MS: i64 = 1_199_145_600_000;

pub fn make_unique_id(timestamp_ms: i64, counter: u16, partition: u16) -> i64 {
    debug_assert!(timestamp_ms >= EPOCH_MS);
    debug_assert!(u32::from(counter) < (1 << COUNTER_BITS));
    debug_assert!(u32::from(partition) < (1 << PARTITION_BITS));
    ((timestamp_ms - EPOCH_MS) << TIMESTAMP_SHIFT)
        | (i64::from(counter) << PARTITION_BITS)
        | i64::from(partition)
}

/// UNIX milliseconds encoded in `unique_id`'s timestamp field.
pub fn timestamp_ms_from_unique_id(unique_id: i64) -> i64 {
    (unique_id >> TIMESTAMP_SHIFT) + EPOCH_MS
}

pub fn partition_from_unique_id(unique_id: i64) -> u16 {
    (unique_id & ((1 << PARTITION_BITS) - 1)) as u16
}

pub fn counter_from_unique_id(unique_id: i64) -> u16 {
    ((unique_id >> PARTITION_BITS) & ((1 << COUNTER_BITS) - 1)) as u16
}
