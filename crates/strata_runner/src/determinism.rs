//! Determinism hash over the invocation's write statements.
//!
//! Replicas replaying the same logical work must queue the same writes
//! with the same parameters; the CRC32C accumulated here is attached to
//! the response so the agreement layer can detect divergence. Reads never
//! contribute: a replicated read runs on a single chosen replica, so its
//! bytes are not common input.

use strata_core::CodecError;

use crate::statement::QueuedStatement;

/// Running CRC32C over `(sql_crc, serialized_params)` of queued writes.
#[derive(Debug, Default)]
pub struct DeterminismHash {
    crc: u32,
}

impl DeterminismHash {
    pub fn new() -> Self {
        Self { crc: 0 }
    }

    pub fn reset(&mut self) {
        self.crc = 0;
    }

    pub fn value(&self) -> u32 {
        self.crc
    }

    /// Fold a queued statement into the hash.
    ///
    /// Read-only statements are skipped. For writes, the canonical
    /// parameter bytes are computed once here and memoized on the queued
    /// statement so dispatch can reuse them. A serialization failure fails
    /// the invocation: swallowing it would let a replica whose
    /// serialization failed one-sidedly diverge silently.
    pub fn accumulate(&mut self, queued: &mut QueuedStatement) -> Result<(), CodecError> {
        if queued.stmt().is_read_only() {
            return Ok(());
        }
        let bytes = queued.params().to_bytes()?;
        self.crc = crc32c::crc32c_append(self.crc, &queued.stmt().sql_crc().to_le_bytes());
        self.crc = crc32c::crc32c_append(self.crc, &bytes);
        queued.set_serialization(bytes);
        Ok(())
    }
}
