//! Zero-copy access to the fixed frame header.
//!
//! Used on the receive path, which needs the sensor id, sequence and flags
//! of every frame but never the segment group.

use crate::types::SensorId;

use super::{FLAGS_OFFSET, FrameError, HEADER_LEN, MODEL_OFFSET, SENSOR_ID_OFFSET, SEQ_OFFSET};

/// Flag byte at offset 37.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl Flags {
    /// Sensor accepts replies (acks and resend requests).
    pub const RESPONSE: u8 = 0x20;
    /// Last packet of a recording.
    pub const END_OF_STREAM: u8 = 0x40;

    #[inline]
    #[must_use]
    pub const fn response(self) -> bool {
        self.0 & Self::RESPONSE != 0
    }

    #[inline]
    #[must_use]
    pub const fn end_of_stream(self) -> bool {
        self.0 & Self::END_OF_STREAM != 0
    }
}

/// Borrowed view over a frame's fixed header.
#[derive(Debug, Clone, Copy)]
pub struct RawHeader<'a> {
    bytes: &'a [u8],
}

impl<'a> RawHeader<'a> {
    /// Wraps `bytes`, checking only that the fixed header is present.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Truncated`] if fewer than 38 bytes are given.
    pub fn new(bytes: &'a [u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                need: HEADER_LEN,
                have: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    #[inline]
    #[must_use]
    pub fn sequence(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.bytes[SEQ_OFFSET..SEQ_OFFSET + 8]);
        u64::from_be_bytes(b)
    }

    #[inline]
    #[must_use]
    pub fn sensor_id(&self) -> SensorId {
        let mut b = [0u8; 6];
        b.copy_from_slice(&self.bytes[SENSOR_ID_OFFSET..SENSOR_ID_OFFSET + 6]);
        SensorId::from_be_bytes(b)
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> Flags {
        Flags(self.bytes[FLAGS_OFFSET])
    }

    /// Model/probe flag bytes (offsets 29..32).
    #[inline]
    #[must_use]
    pub fn model(&self) -> [u8; 3] {
        let mut b = [0u8; 3];
        b.copy_from_slice(&self.bytes[MODEL_OFFSET..MODEL_OFFSET + 3]);
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameBuilder;

    #[test]
    fn reads_fields_without_decoding() {
        let raw = FrameBuilder::new(SensorId::new(0xA1B2_C3D4_E5F6))
            .sequence(0x0102_0304_0506_0708)
            .flags(Flags::RESPONSE | Flags::END_OF_STREAM)
            .build();
        let header = RawHeader::new(&raw).unwrap();

        assert_eq!(header.sequence(), 0x0102_0304_0506_0708);
        assert_eq!(header.sensor_id(), SensorId::new(0xA1B2_C3D4_E5F6));
        assert!(header.flags().response());
        assert!(header.flags().end_of_stream());
    }

    #[test]
    fn plain_flags() {
        assert!(!Flags(0).response());
        assert!(!Flags(0x20).end_of_stream());
        assert!(Flags(0x60).end_of_stream());
    }

    #[test]
    fn short_input_is_truncated() {
        assert_eq!(
            RawHeader::new(&[0u8; 20]).unwrap_err(),
            FrameError::Truncated { need: 38, have: 20 }
        );
    }
}
