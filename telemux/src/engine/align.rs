//! Packet time alignment.
//!
//! Arrival times jitter with the network; sample counts do not. The aligner
//! keeps a synthetic device clock (`aligntime`) that advances by exactly the
//! declared data duration of each in-sequence packet, and only snaps back to
//! the arrival clock when the two drift further apart than the threshold.
//!
//! ```text
//!            align = aligntime + duration       real = now - duration
//!
//!   first packet / seq regressed ............ Reset   (aligntime = real)
//!   seq jumped forward ...................... Broken  (aligntime = real)
//!   threshold <= 0 .......................... Align   (aligntime += duration)
//!   align < real - threshold ................ Corr    (aligntime = real)
//!   align > real + threshold ................ Drop    (aligntime unchanged)
//!   otherwise ............................... Align   (aligntime += duration)
//! ```

use serde::Serialize;

use crate::types::Micros;

/// Fill packets between each 1 µs compensation step.
const FILL_PERIOD: u32 = 3;

/// Outcome category of one alignment step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum AlignKind {
    Align = 0,
    Broken = 1,
    Drop = 2,
    Corr = 3,
    Reset = 4,
}

impl AlignKind {
    pub const COUNT: usize = 5;

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Align => "align",
            Self::Broken => "broken",
            Self::Drop => "drop",
            Self::Corr => "corr",
            Self::Reset => "reset",
        }
    }
}

/// Per-sensor alignment state. Owned by the sensor's lane worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeAligner {
    last_sequence: i64,
    aligntime: Micros,
    realtime: Micros,
    fill_count: u32,
    threshold: Micros,
}

impl TimeAligner {
    /// `threshold` in microseconds; `<= 0` disables deviation checks.
    #[must_use]
    pub const fn new(threshold: Micros) -> Self {
        Self {
            last_sequence: 0,
            aligntime: 0,
            realtime: 0,
            fill_count: 0,
            threshold,
        }
    }

    /// Advances the state for one packet and returns its aligned timestamp.
    ///
    /// `now` is the packet's arrival time, `duration` the time its samples
    /// cover and `fill` whether that duration was rounded down.
    pub fn next(
        &mut self,
        sequence: i64,
        fill: bool,
        now: Micros,
        duration: Micros,
    ) -> (Micros, AlignKind) {
        let real = now - duration;

        if self.aligntime == 0 {
            self.reset(sequence, real);
            return (self.aligntime, AlignKind::Reset);
        }

        if sequence != self.last_sequence + 1 {
            let kind = if sequence <= self.last_sequence {
                AlignKind::Reset
            } else {
                AlignKind::Broken
            };
            self.reset(sequence, real);
            return (self.aligntime, kind);
        }

        if self.threshold <= 0 {
            self.advance(duration, real, fill);
            return (self.aligntime, AlignKind::Align);
        }

        let align = self.aligntime + duration;
        if align < real - self.threshold {
            self.reset(sequence, real);
            (self.aligntime, AlignKind::Corr)
        } else if align > real + self.threshold {
            self.last_sequence += 1;
            (self.aligntime, AlignKind::Drop)
        } else {
            self.advance(duration, real, fill);
            (self.aligntime, AlignKind::Align)
        }
    }

    fn reset(&mut self, sequence: i64, real: Micros) {
        self.last_sequence = sequence;
        self.aligntime = real;
        self.realtime = real;
        self.fill_count = 0;
    }

    fn advance(&mut self, duration: Micros, real: Micros, fill: bool) {
        self.last_sequence += 1;
        self.aligntime += duration;
        self.realtime = real;
        if fill {
            self.fill_count += 1;
            if self.fill_count >= FILL_PERIOD {
                self.fill_count = 0;
                self.aligntime += 1;
            }
        } else {
            self.fill_count = 0;
        }
    }

    /// Sequence the aligned clock corresponds to.
    #[must_use]
    pub const fn last_sequence(&self) -> i64 {
        self.last_sequence
    }

    /// Arrival clock minus duration, as of the last Align, Corr or reset.
    #[must_use]
    pub const fn realtime(&self) -> Micros {
        self.realtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: Micros = 1_700_000_000_000_000;
    const D: Micros = 1_000;

    #[test]
    fn first_packet_resets_to_arrival_minus_duration() {
        let mut a = TimeAligner::new(1_000_000);
        assert_eq!(a.next(7, false, T0, D), (T0 - D, AlignKind::Reset));
        assert_eq!(a.last_sequence(), 7);
        assert_eq!(a.realtime(), T0 - D);
    }

    #[test]
    fn sequential_packets_advance_by_duration_only() {
        // Arrival jitter within the threshold does not leak into aligntime.
        let mut a = TimeAligner::new(1_000_000);
        let (start, _) = a.next(1, false, T0, D);
        let jitter = [300, -250, 900, 0, -700, 50, 10, -10, 400];
        for (i, j) in jitter.iter().enumerate() {
            let seq = i as i64 + 2;
            let now = T0 + (seq - 1) * D + j;
            let (t, kind) = a.next(seq, false, now, D);
            assert_eq!(kind, AlignKind::Align);
            assert_eq!(t, start + (seq - 1) * D);
        }
        assert_eq!(a.last_sequence(), 10);
    }

    #[test]
    fn five_packets_cover_five_durations_with_threshold_disabled() {
        let mut a = TimeAligner::new(0);
        let (first, kind) = a.next(1, false, T0, D);
        assert_eq!(kind, AlignKind::Reset);

        let mut last = first;
        for seq in 2..=5 {
            // Arrival times are irrelevant with the threshold off.
            let (t, kind) = a.next(seq, false, T0 + seq * 37, D);
            assert_eq!(kind, AlignKind::Align);
            last = t;
        }
        // Start of packet 1 to end of packet 5.
        assert_eq!(last + D - first, 5 * D);
    }

    #[test]
    fn fill_adds_one_micro_every_third_packet() {
        let mut a = TimeAligner::new(0);
        let (start, _) = a.next(1, true, T0, D);
        let n = 9;
        let mut t = start;
        for seq in 2..=n + 1 {
            t = a.next(seq, true, T0, D).0;
        }
        assert_eq!(t, start + n * D + n / 3);
    }

    #[test]
    fn non_fill_packet_restarts_fill_count() {
        let mut a = TimeAligner::new(0);
        let (start, _) = a.next(1, false, T0, D);
        a.next(2, true, T0, D);
        a.next(3, true, T0, D);
        a.next(4, false, T0, D);
        let (t, _) = a.next(5, true, T0, D);
        assert_eq!(t, start + 4 * D);
    }

    #[test]
    fn forward_gap_is_broken() {
        let mut a = TimeAligner::new(1_000_000);
        a.next(1, false, T0, D);
        let now = T0 + 50 * D;
        assert_eq!(a.next(5, false, now, D), (now - D, AlignKind::Broken));
        assert_eq!(a.last_sequence(), 5);
    }

    #[test]
    fn regression_is_reset() {
        let mut a = TimeAligner::new(1_000_000);
        a.next(10, false, T0, D);
        a.next(11, false, T0 + D, D);
        let (_, kind) = a.next(3, false, T0 + 2 * D, D);
        assert_eq!(kind, AlignKind::Reset);
        assert_eq!(a.last_sequence(), 3);
    }

    #[test]
    fn lagging_alignment_is_corrected() {
        let thr = 5_000;
        let mut a = TimeAligner::new(thr);
        a.next(1, false, T0, D);
        // Packet 2 arrives 20 ms late: align is far behind real.
        let now = T0 + D + 20_000;
        assert_eq!(a.next(2, false, now, D), (now - D, AlignKind::Corr));
        assert_eq!(a.last_sequence(), 2);
    }

    #[test]
    fn leading_alignment_drops_and_holds() {
        let thr = 5_000;
        let mut a = TimeAligner::new(thr);
        let (start, _) = a.next(1, false, T0, D);
        // Device clock ahead of the receiver: packets arrive in a burst.
        let mut t = start;
        let mut drops = 0;
        for seq in 2..=20 {
            let (next, kind) = a.next(seq, false, T0, D);
            if kind == AlignKind::Drop {
                assert_eq!(next, t);
                drops += 1;
            }
            t = next;
            assert_eq!(a.last_sequence(), seq);
        }
        assert!(drops > 0);
        assert!(t <= T0 - D + thr);
    }

    #[test]
    fn last_sequence_moves_by_one_between_resets() {
        let mut a = TimeAligner::new(2_000);
        a.next(1, false, T0, D);
        let mut prev = a.last_sequence();
        for seq in 2..200 {
            let now = T0 + seq * D + (seq % 7) * 600;
            let (_, kind) = a.next(seq, false, now, D);
            match kind {
                AlignKind::Align | AlignKind::Drop => assert_eq!(a.last_sequence(), prev + 1),
                AlignKind::Corr | AlignKind::Reset | AlignKind::Broken => {
                    assert_eq!(a.last_sequence(), seq);
                }
            }
            prev = a.last_sequence();
        }
    }
}
