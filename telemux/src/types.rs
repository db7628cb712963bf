//! Shared identifier types.
//!
//! Sensor ids are 48-bit values carried big-endian on the wire. Sequence
//! numbers are plain `u64` where 0 means "nothing accepted yet".

use std::fmt;

use serde::{Deserialize, Serialize};

/// Microseconds of wall-clock or device-relative time.
pub type Micros = i64;

/// 48-bit hardware sensor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId(u64);

impl SensorId {
    /// Mask for the 48 significant bits.
    pub const MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

    /// Creates an id, discarding bits above 48.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw & Self::MASK)
    }

    /// Reads an id from 6 big-endian bytes.
    #[inline]
    #[must_use]
    pub const fn from_be_bytes(b: [u8; 6]) -> Self {
        Self(
            (b[0] as u64) << 40
                | (b[1] as u64) << 32
                | (b[2] as u64) << 24
                | (b[3] as u64) << 16
                | (b[4] as u64) << 8
                | b[5] as u64,
        )
    }

    /// Returns the 6 big-endian wire bytes.
    #[inline]
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; 6] {
        let b = self.0.to_be_bytes();
        [b[2], b[3], b[4], b[5], b[6], b[7]]
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Index of the lane (or shard) owning this sensor for a power-of-two
    /// `mask + 1` partitions.
    #[inline]
    #[must_use]
    pub const fn shard(self, mask: u64) -> usize {
        (self.0 & mask) as usize
    }
}

impl From<u64> for SensorId {
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012X}", self.0)
    }
}
