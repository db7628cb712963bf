//! Sensor wire format.
//!
//! # Frame layout
//!
//! All multi-byte fields are big-endian unless noted.
//!
//! ```text
//! ┌──────────┬─────┬──────────┬──────────┬────────┬────────┬───────────┬───────┬──────────┬───────┐
//! │ FCFCFCFC │ ver │ size(4)  │ seq(8)   │ hw/fw  │ id(6)  │ model/rsv │ flags │ segments │ csum  │ FD
//! │ 0..4     │ 4   │ 5..9     │ 9..17    │ 17..23 │ 23..29 │ 29..37    │ 37    │ 38..     │ (2)   │
//! └──────────┴─────┴──────────┴──────────┴────────┴────────┴───────────┴───────┴──────────┴───────┘
//! ```
//!
//! `size` counts the bytes from offset 9 up to and including the checksum; the
//! whole frame is `9 + size + 1` bytes. The checksum is the wrapping 16-bit sum
//! of every byte from offset 9 to the byte before the checksum.
//!
//! The segment group starts with a count byte followed by
//! `type(1) len(4) body[len]` entries.
//!
//! # Server replies
//!
//! - Acknowledgement: the accepted sequence as 8 big-endian bytes.
//! - Resend request: see [`control::resend_request`].

pub mod codec;
pub mod control;
pub mod frame;
pub mod header;

use thiserror::Error;

pub use codec::FrameCodec;
pub use frame::{ArcSpan, Frame, FrameBuilder, Segment, SegmentType};
pub use header::{Flags, RawHeader};

/// Frame start marker.
pub const MAGIC: [u8; 4] = [0xFC, 0xFC, 0xFC, 0xFC];
/// The only supported protocol version.
pub const VERSION: u8 = 1;
/// Frame end marker.
pub const TRAILER: u8 = 0xFD;

/// Magic + version + size.
pub const PREFIX_LEN: usize = 9;
pub const SEQ_OFFSET: usize = 9;
pub const HW_VERSION_OFFSET: usize = 17;
pub const FW_VERSION_OFFSET: usize = 20;
pub const SENSOR_ID_OFFSET: usize = 23;
pub const MODEL_OFFSET: usize = 29;
pub const FLAGS_OFFSET: usize = 37;
/// Offset of the segment group; also the fixed header length.
pub const HEADER_LEN: usize = 38;
pub const CHECKSUM_LEN: usize = 2;

/// Smallest legal `size` field: fixed header, an empty segment group, checksum.
pub const MIN_PAYLOAD: usize = HEADER_LEN - PREFIX_LEN + 1 + CHECKSUM_LEN;
/// Largest accepted `size` field.
pub const MAX_PAYLOAD: usize = 1 << 20;

/// Total frame length for a given `size` field.
#[inline]
#[must_use]
pub const fn frame_len(size: usize) -> usize {
    PREFIX_LEN + size + 1
}

/// Wrapping 16-bit additive checksum.
#[inline]
#[must_use]
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// Errors from frame validation and decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("payload size {0} out of range")]
    BadSize(usize),
    #[error("missing trailer, found 0x{0:02x}")]
    BadTrailer(u8),
    #[error("checksum mismatch: frame says 0x{expected:04x}, computed 0x{actual:04x}")]
    Checksum { expected: u16, actual: u16 },
    #[error("truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("segment {index} overruns the frame")]
    SegmentOverrun { index: usize },
    #[error("missing {0:?} segment")]
    MissingSegment(SegmentType),
    #[error("zero sample rate")]
    ZeroSampleRate,
}
