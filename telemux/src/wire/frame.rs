//! Full frame decoding and encoding.

use crate::types::{Micros, SensorId};

use super::header::{Flags, RawHeader};
use super::{
    CHECKSUM_LEN, FW_VERSION_OFFSET, FrameError, HEADER_LEN, HW_VERSION_OFFSET, MAGIC,
    MAX_PAYLOAD, MIN_PAYLOAD, PREFIX_LEN, TRAILER, VERSION, checksum, frame_len,
};

/// Data segment type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentType {
    /// Acoustic samples: `rate u32 BE` then i16 LE PCM.
    Arc,
    /// Vibration: `rate code u8` then i16 LE xyz triples.
    Vibration,
    /// Temperature: i16 BE centi-degrees.
    Temperature,
    Unknown(u8),
}

impl SegmentType {
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        match b {
            0x01 => Self::Arc,
            0x02 => Self::Vibration,
            0x03 => Self::Temperature,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Arc => 0x01,
            Self::Vibration => 0x02,
            Self::Temperature => 0x03,
            Self::Unknown(b) => b,
        }
    }
}

/// One entry of the segment group, borrowing its body from the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub kind: SegmentType,
    pub body: &'a [u8],
}

/// Duration metadata derived from an arc segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArcSpan {
    pub sample_rate: u32,
    pub samples: u64,
    /// Whole microseconds covered by the samples.
    pub duration: Micros,
    /// The sample count does not divide into whole microseconds.
    pub fill: bool,
}

impl ArcSpan {
    /// Computes the span from an arc segment body.
    ///
    /// # Errors
    ///
    /// Fails if the body is shorter than the rate field or the rate is zero.
    pub fn from_body(body: &[u8]) -> Result<Self, FrameError> {
        let Some((rate, pcm)) = body.split_first_chunk::<4>() else {
            return Err(FrameError::Truncated {
                need: 4,
                have: body.len(),
            });
        };
        let sample_rate = u32::from_be_bytes(*rate);
        if sample_rate == 0 {
            return Err(FrameError::ZeroSampleRate);
        }
        let samples = (pcm.len() / 2) as u64;
        let scaled = samples * 1_000_000;
        Ok(Self {
            sample_rate,
            samples,
            duration: (scaled / u64::from(sample_rate)) as Micros,
            fill: scaled % u64::from(sample_rate) != 0,
        })
    }
}

/// A decoded frame borrowing from the raw bytes.
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    pub sequence: u64,
    pub sensor_id: SensorId,
    pub hw_version: [u8; 3],
    pub fw_version: [u8; 3],
    pub model: [u8; 3],
    pub flags: Flags,
    pub segments: Vec<Segment<'a>>,
    raw: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Decodes a complete frame.
    ///
    /// Checks the envelope (magic, version, size, trailer) and walks the
    /// segment group. The checksum is left to [`FrameCodec`](super::FrameCodec).
    ///
    /// # Errors
    ///
    /// Returns the first envelope or segment error found.
    pub fn decode(raw: &'a [u8]) -> Result<Self, FrameError> {
        let size = check_envelope(raw)?;
        let header = RawHeader::new(raw)?;

        // Segment group runs up to the checksum.
        let group_end = PREFIX_LEN + size - CHECKSUM_LEN;
        let count = raw[HEADER_LEN] as usize;
        let mut pos = HEADER_LEN + 1;
        let mut segments = Vec::with_capacity(count);
        for index in 0..count {
            if pos + 5 > group_end {
                return Err(FrameError::SegmentOverrun { index });
            }
            let kind = SegmentType::from_byte(raw[pos]);
            let len = u32::from_be_bytes([raw[pos + 1], raw[pos + 2], raw[pos + 3], raw[pos + 4]])
                as usize;
            pos += 5;
            if len > group_end - pos {
                return Err(FrameError::SegmentOverrun { index });
            }
            segments.push(Segment {
                kind,
                body: &raw[pos..pos + len],
            });
            pos += len;
        }

        Ok(Self {
            sequence: header.sequence(),
            sensor_id: header.sensor_id(),
            hw_version: three(raw, HW_VERSION_OFFSET),
            fw_version: three(raw, FW_VERSION_OFFSET),
            model: header.model(),
            flags: header.flags(),
            segments,
            raw: &raw[..frame_len(size)],
        })
    }

    /// The exact bytes this frame was decoded from.
    #[must_use]
    pub const fn raw(&self) -> &'a [u8] {
        self.raw
    }

    /// First segment of the given type.
    #[must_use]
    pub fn segment(&self, kind: SegmentType) -> Option<Segment<'a>> {
        self.segments.iter().copied().find(|s| s.kind == kind)
    }

    /// The arc segment's duration metadata.
    ///
    /// # Errors
    ///
    /// [`FrameError::MissingSegment`] if the frame carries no arc data.
    pub fn arc_span(&self) -> Result<ArcSpan, FrameError> {
        let arc = self
            .segment(SegmentType::Arc)
            .ok_or(FrameError::MissingSegment(SegmentType::Arc))?;
        ArcSpan::from_body(arc.body)
    }

    /// PCM bytes (i16 LE) of the arc segment, without the rate field.
    #[must_use]
    pub fn arc_pcm(&self) -> Option<&'a [u8]> {
        self.segment(SegmentType::Arc)
            .and_then(|s| s.body.get(4..))
    }
}

fn three(raw: &[u8], at: usize) -> [u8; 3] {
    [raw[at], raw[at + 1], raw[at + 2]]
}

/// Validates magic, version, size bounds, length and trailer.
///
/// Returns the `size` field.
pub(crate) fn check_envelope(raw: &[u8]) -> Result<usize, FrameError> {
    if raw.len() < PREFIX_LEN {
        return Err(FrameError::Truncated {
            need: PREFIX_LEN,
            have: raw.len(),
        });
    }
    if raw[..4] != MAGIC {
        return Err(FrameError::BadMagic);
    }
    if raw[4] != VERSION {
        return Err(FrameError::BadVersion(raw[4]));
    }
    let size = u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]) as usize;
    if !(MIN_PAYLOAD..=MAX_PAYLOAD).contains(&size) {
        return Err(FrameError::BadSize(size));
    }
    let total = frame_len(size);
    if raw.len() < total {
        return Err(FrameError::Truncated {
            need: total,
            have: raw.len(),
        });
    }
    if raw[total - 1] != TRAILER {
        return Err(FrameError::BadTrailer(raw[total - 1]));
    }
    Ok(size)
}

/// Verifies the additive checksum of an envelope-checked frame.
pub(crate) fn verify_checksum(raw: &[u8], size: usize) -> Result<(), FrameError> {
    let csum_at = PREFIX_LEN + size - CHECKSUM_LEN;
    let expected = u16::from_be_bytes([raw[csum_at], raw[csum_at + 1]]);
    let actual = checksum(&raw[PREFIX_LEN..csum_at]);
    if expected == actual {
        Ok(())
    } else {
        Err(FrameError::Checksum { expected, actual })
    }
}

/// Encodes complete sensor frames.
///
/// # Example
///
/// ```
/// use telemux::SensorId;
/// use telemux::wire::{Frame, FrameBuilder};
///
/// let raw = FrameBuilder::new(SensorId::new(7))
///     .sequence(3)
///     .arc(16_000, &[0i16; 160])
///     .build();
/// let frame = Frame::decode(&raw).unwrap();
/// assert_eq!(frame.arc_span().unwrap().duration, 10_000);
/// ```
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    sensor_id: SensorId,
    sequence: u64,
    flags: u8,
    hw_version: [u8; 3],
    fw_version: [u8; 3],
    model: [u8; 3],
    segments: Vec<(u8, Vec<u8>)>,
}

impl FrameBuilder {
    #[must_use]
    pub fn new(sensor_id: SensorId) -> Self {
        Self {
            sensor_id,
            sequence: 0,
            flags: 0,
            hw_version: [1, 0, 0],
            fw_version: [1, 0, 0],
            model: [0; 3],
            segments: Vec::new(),
        }
    }

    #[must_use]
    pub const fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    #[must_use]
    pub const fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn model(mut self, model: [u8; 3]) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub const fn versions(mut self, hw: [u8; 3], fw: [u8; 3]) -> Self {
        self.hw_version = hw;
        self.fw_version = fw;
        self
    }

    /// Appends an arc segment.
    #[must_use]
    pub fn arc(self, sample_rate: u32, pcm: &[i16]) -> Self {
        let mut body = Vec::with_capacity(4 + pcm.len() * 2);
        body.extend_from_slice(&sample_rate.to_be_bytes());
        for s in pcm {
            body.extend_from_slice(&s.to_le_bytes());
        }
        self.segment(SegmentType::Arc, body)
    }

    /// Appends a temperature segment in centi-degrees.
    #[must_use]
    pub fn temperature(self, centi_degrees: i16) -> Self {
        self.segment(SegmentType::Temperature, centi_degrees.to_be_bytes().to_vec())
    }

    #[must_use]
    pub fn segment(mut self, kind: SegmentType, body: Vec<u8>) -> Self {
        self.segments.push((kind.as_byte(), body));
        self
    }

    /// Produces the wire bytes, including size, checksum and trailer.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let body_len: usize = self.segments.iter().map(|(_, b)| 5 + b.len()).sum();
        let mut buf = Vec::with_capacity(HEADER_LEN + 1 + body_len + CHECKSUM_LEN + 1);

        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&[0; 4]); // size, patched below
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.hw_version);
        buf.extend_from_slice(&self.fw_version);
        buf.extend_from_slice(&self.sensor_id.to_be_bytes());
        buf.extend_from_slice(&self.model);
        buf.extend_from_slice(&[0; 5]);
        buf.push(self.flags);
        debug_assert_eq!(buf.len(), HEADER_LEN);

        buf.push(self.segments.len() as u8);
        for (kind, body) in &self.segments {
            buf.push(*kind);
            buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
            buf.extend_from_slice(body);
        }

        let size = buf.len() - PREFIX_LEN + CHECKSUM_LEN;
        buf[5..9].copy_from_slice(&(size as u32).to_be_bytes());
        let csum = checksum(&buf[PREFIX_LEN..]);
        buf.extend_from_slice(&csum.to_be_bytes());
        buf.push(TRAILER);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Vec<u8> {
        FrameBuilder::new(SensorId::new(0x00AB_CDEF_0123))
            .sequence(42)
            .flags(Flags::RESPONSE)
            .versions([2, 1, 0], [3, 4, 5])
            .model([0x07, 0, 1])
            .arc(16_000, &[1, -1, 2, -2])
            .temperature(2_515)
            .build()
    }

    #[test]
    fn decodes_built_frame() {
        let raw = sample_frame();
        let frame = Frame::decode(&raw).unwrap();

        assert_eq!(frame.sequence, 42);
        assert_eq!(frame.sensor_id, SensorId::new(0x00AB_CDEF_0123));
        assert_eq!(frame.hw_version, [2, 1, 0]);
        assert_eq!(frame.fw_version, [3, 4, 5]);
        assert_eq!(frame.model, [0x07, 0, 1]);
        assert!(frame.flags.response());
        assert_eq!(frame.segments.len(), 2);
        assert_eq!(frame.raw(), &raw[..]);

        let temp = frame.segment(SegmentType::Temperature).unwrap();
        assert_eq!(i16::from_be_bytes([temp.body[0], temp.body[1]]), 2_515);
        assert_eq!(frame.arc_pcm().unwrap(), &[1, 0, 0xFF, 0xFF, 2, 0, 0xFE, 0xFF]);
    }

    #[test]
    fn built_checksum_verifies() {
        let raw = sample_frame();
        let size = check_envelope(&raw).unwrap();
        assert_eq!(raw.len(), frame_len(size));
        assert!(verify_checksum(&raw, size).is_ok());
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let mut raw = sample_frame();
        raw[HEADER_LEN + 3] ^= 0x10;
        let size = check_envelope(&raw).unwrap();
        assert!(matches!(
            verify_checksum(&raw, size),
            Err(FrameError::Checksum { .. })
        ));
    }

    fn arc_body(rate: u32, samples: usize) -> Vec<u8> {
        let mut body = rate.to_be_bytes().to_vec();
        body.resize(4 + samples * 2, 0);
        body
    }

    #[test]
    fn arc_span_exact_and_fill() {
        // 16 samples at 16 kHz = 1000 us exactly.
        let exact = ArcSpan::from_body(&arc_body(16_000, 16)).unwrap();
        assert_eq!(exact.duration, 1_000);
        assert!(!exact.fill);

        // 10 samples at 48 kHz = 208.33 us.
        let frac = ArcSpan::from_body(&arc_body(48_000, 10)).unwrap();
        assert_eq!(frac.samples, 10);
        assert_eq!(frac.duration, 208);
        assert!(frac.fill);
    }

    #[test]
    fn arc_span_rejects_zero_rate() {
        assert_eq!(
            ArcSpan::from_body(&[0, 0, 0, 0, 1, 2]),
            Err(FrameError::ZeroSampleRate)
        );
    }

    #[test]
    fn missing_arc_segment() {
        let raw = FrameBuilder::new(SensorId::new(1))
            .sequence(5)
            .temperature(100)
            .build();
        let frame = Frame::decode(&raw).unwrap();
        assert_eq!(
            frame.arc_span(),
            Err(FrameError::MissingSegment(SegmentType::Arc))
        );
    }

    #[test]
    fn unknown_segments_are_kept_opaque() {
        let raw = FrameBuilder::new(SensorId::new(1))
            .segment(SegmentType::Unknown(0x7E), vec![9, 9, 9])
            .arc(8_000, &[0; 8])
            .build();
        let frame = Frame::decode(&raw).unwrap();
        assert_eq!(frame.segments[0].kind, SegmentType::Unknown(0x7E));
        assert_eq!(frame.arc_span().unwrap().duration, 1_000);
    }

    #[test]
    fn envelope_errors() {
        let raw = sample_frame();

        let mut bad = raw.clone();
        bad[0] = 0;
        assert_eq!(Frame::decode(&bad).unwrap_err(), FrameError::BadMagic);

        let mut bad = raw.clone();
        bad[4] = 2;
        assert_eq!(Frame::decode(&bad).unwrap_err(), FrameError::BadVersion(2));

        let mut bad = raw.clone();
        *bad.last_mut().unwrap() = 0;
        assert_eq!(Frame::decode(&bad).unwrap_err(), FrameError::BadTrailer(0));

        let mut bad = raw.clone();
        bad[5..9].copy_from_slice(&3u32.to_be_bytes());
        assert_eq!(Frame::decode(&bad).unwrap_err(), FrameError::BadSize(3));

        assert!(matches!(
            Frame::decode(&raw[..raw.len() - 1]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn segment_length_overrun() {
        let mut raw = FrameBuilder::new(SensorId::new(1)).arc(8_000, &[0; 4]).build();
        // Inflate the arc body length past the group end.
        raw[HEADER_LEN + 2..HEADER_LEN + 6].copy_from_slice(&1_000u32.to_be_bytes());
        assert_eq!(
            Frame::decode(&raw).unwrap_err(),
            FrameError::SegmentOverrun { index: 0 }
        );
    }
}
