//! Frames the server writes back to sensors.

use crate::types::SensorId;

use super::checksum;

/// Leading bytes of a resend request.
pub const RESEND_PREFIX: [u8; 3] = [0xFC, 0x01, 0x0E];
pub const RESEND_LEN: usize = 19;
pub const ACK_LEN: usize = 8;

/// Builds a resend request asking `sensor` to retransmit `sequence`.
///
/// ```text
/// FC 01 0E | sensor id (6) | sequence (8) | checksum of bytes 3..17 (2)
/// ```
#[must_use]
pub fn resend_request(sensor: SensorId, sequence: u64) -> [u8; RESEND_LEN] {
    let mut buf = [0u8; RESEND_LEN];
    buf[..3].copy_from_slice(&RESEND_PREFIX);
    buf[3..9].copy_from_slice(&sensor.to_be_bytes());
    buf[9..17].copy_from_slice(&sequence.to_be_bytes());
    let csum = checksum(&buf[3..17]);
    buf[17..].copy_from_slice(&csum.to_be_bytes());
    buf
}

/// Acknowledges `sequence`.
#[inline]
#[must_use]
pub const fn ack(sequence: u64) -> [u8; ACK_LEN] {
    sequence.to_be_bytes()
}

/// A reply queued for a sensor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    Ack([u8; ACK_LEN]),
    Resend([u8; RESEND_LEN]),
}

impl Outbound {
    #[must_use]
    pub const fn ack(sequence: u64) -> Self {
        Self::Ack(ack(sequence))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Ack(b) => b,
            Self::Resend(b) => b,
        }
    }
}

/// A server reply as seen by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack(u64),
    Resend { sensor: SensorId, sequence: u64 },
}

/// Splits the first reply off a sensor-side receive buffer.
///
/// Returns the reply and the bytes it used, or `None` if more input is
/// needed.
#[must_use]
pub fn split_reply(buf: &[u8]) -> Option<(Reply, usize)> {
    if buf.len() < ACK_LEN {
        return None;
    }
    if buf[..3] == RESEND_PREFIX {
        if buf.len() < RESEND_LEN {
            return None;
        }
        let mut id = [0u8; 6];
        id.copy_from_slice(&buf[3..9]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buf[9..17]);
        return Some((
            Reply::Resend {
                sensor: SensorId::from_be_bytes(id),
                sequence: u64::from_be_bytes(seq),
            },
            RESEND_LEN,
        ));
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&buf[..ACK_LEN]);
    Some((Reply::Ack(u64::from_be_bytes(seq)), ACK_LEN))
}
