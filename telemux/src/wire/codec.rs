//! Stream framing for TCP connections.
//!
//! TCP delivers an unframed byte stream; [`FrameCodec`] buffers it and cuts
//! complete frames out of it. Malformed input is reported once and skipped up
//! to the next plausible magic, so one corrupt frame never closes the
//! connection.

use super::frame::{check_envelope, verify_checksum};
use super::{FrameError, MAGIC, MAX_PAYLOAD, PREFIX_LEN, frame_len};

/// Consumed prefix size that triggers compaction of the input buffer.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Per-connection frame reassembler.
#[derive(Debug)]
pub struct FrameCodec {
    buf: Vec<u8>,
    /// Start of unconsumed input in `buf`.
    start: usize,
    verify_checksum: bool,
}

impl FrameCodec {
    #[must_use]
    pub fn new(verify_checksum: bool) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            start: 0,
            verify_checksum,
        }
    }

    /// Appends bytes read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start >= COMPACT_THRESHOLD {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as frames.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Cuts the next frame out of the buffer.
    ///
    /// Returns `None` when more input is needed. A `Some(Err(_))` means the
    /// offending bytes were already skipped; keep calling.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, FrameError>> {
        let avail = &self.buf[self.start..];
        if avail.len() < PREFIX_LEN {
            // A short non-magic prefix can be rejected early.
            let n = avail.len().min(MAGIC.len());
            if avail[..n] != MAGIC[..n] {
                self.start += resync_offset(avail);
                return Some(Err(FrameError::BadMagic));
            }
            return None;
        }

        // Only bound the size before the whole frame is here.
        let size = u32::from_be_bytes([avail[5], avail[6], avail[7], avail[8]]) as usize;
        let need = if size <= MAX_PAYLOAD { frame_len(size) } else { PREFIX_LEN };
        let probe = &avail[..need.min(avail.len())];

        match check_envelope(probe) {
            Ok(size) => {
                let total = frame_len(size);
                if self.verify_checksum
                    && let Err(e) = verify_checksum(&avail[..total], size)
                {
                    self.start += total;
                    return Some(Err(e));
                }
                let frame = avail[..total].to_vec();
                self.start += total;
                Some(Ok(frame))
            }
            Err(FrameError::Truncated { .. }) => None,
            Err(e) => {
                self.start += resync_offset(avail);
                Some(Err(e))
            }
        }
    }
}

/// Distance to the next position that could start a frame.
///
/// A trailing partial magic is kept so the rest can arrive later.
fn resync_offset(avail: &[u8]) -> usize {
    (1..avail.len())
        .find(|&p| {
            let rest = &avail[p..];
            let n = rest.len().min(MAGIC.len());
            rest[..n] == MAGIC[..n]
        })
        .unwrap_or(avail.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensorId;
    use crate::wire::FrameBuilder;

    fn frame(seq: u64) -> Vec<u8> {
        FrameBuilder::new(SensorId::new(9))
            .sequence(seq)
            .arc(16_000, &[0; 16])
            .build()
    }

    fn drain(codec: &mut FrameCodec) -> (Vec<Vec<u8>>, Vec<FrameError>) {
        let mut frames = Vec::new();
        let mut errors = Vec::new();
        while let Some(next) = codec.next_frame() {
            match next {
                Ok(f) => frames.push(f),
                Err(e) => errors.push(e),
            }
        }
        (frames, errors)
    }

    #[test]
    fn splits_back_to_back_frames() {
        let mut codec = FrameCodec::new(true);
        let mut stream = frame(1);
        stream.extend(frame(2));
        stream.extend(frame(3));
        codec.feed(&stream);

        let (frames, errors) = drain(&mut codec);
        assert!(errors.is_empty());
        assert_eq!(frames, vec![frame(1), frame(2), frame(3)]);
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn reassembles_across_reads() {
        let mut codec = FrameCodec::new(true);
        let mut stream = frame(1);
        stream.extend(frame(2));

        let mut frames = Vec::new();
        for chunk in stream.chunks(7) {
            codec.feed(chunk);
            let (mut got, errors) = drain(&mut codec);
            assert!(errors.is_empty());
            frames.append(&mut got);
        }
        assert_eq!(frames, vec![frame(1), frame(2)]);
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut codec = FrameCodec::new(true);
        let mut stream = vec![0x00, 0x11, 0xFC, 0x22];
        stream.extend(frame(5));
        codec.feed(&stream);

        let (frames, errors) = drain(&mut codec);
        // One report for the whole run of garbage.
        assert_eq!(frames, vec![frame(5)]);
        assert_eq!(errors, vec![FrameError::BadMagic]);
    }

    #[test]
    fn checksum_mismatch_skips_frame_when_enabled() {
        let mut bad = frame(1);
        let n = bad.len();
        bad[n - 3] ^= 0xFF;

        let mut stream = bad.clone();
        stream.extend(frame(2));

        let mut codec = FrameCodec::new(true);
        codec.feed(&stream);
        let (frames, errors) = drain(&mut codec);
        assert_eq!(frames, vec![frame(2)]);
        assert!(matches!(errors[..], [FrameError::Checksum { .. }]));

        let mut codec = FrameCodec::new(false);
        codec.feed(&stream);
        let (frames, errors) = drain(&mut codec);
        assert_eq!(frames, vec![bad, frame(2)]);
        assert!(errors.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected_without_waiting() {
        let mut stream = frame(1);
        stream[5..9].copy_from_slice(&(MAX_PAYLOAD as u32 + 1).to_be_bytes());
        stream.extend(frame(2));

        let mut codec = FrameCodec::new(true);
        codec.feed(&stream);
        let (frames, errors) = drain(&mut codec);
        assert_eq!(frames, vec![frame(2)]);
        assert!(matches!(errors[..], [FrameError::BadSize(_)]));
    }

    #[test]
    fn bad_trailer_resyncs_to_next_frame() {
        let mut bad = frame(1);
        let n = bad.len();
        bad[n - 1] = 0x00;
        bad.extend(frame(2));

        let mut codec = FrameCodec::new(true);
        codec.feed(&bad);
        let (frames, errors) = drain(&mut codec);
        assert_eq!(frames, vec![frame(2)]);
        assert_eq!(errors, vec![FrameError::BadTrailer(0)]);
    }

    #[test]
    fn partial_magic_waits_for_more() {
        let mut codec = FrameCodec::new(true);
        codec.feed(&[0xFC, 0xFC]);
        assert!(codec.next_frame().is_none());
        assert_eq!(codec.buffered(), 2);
    }
}
