//! Process-wide ingestion counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::engine::AlignKind;

/// Lock-free counters shared by the reactor, acceptor and lane workers.
#[derive(Debug, Default)]
pub struct Stats {
    pub connections: AtomicI64,
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    /// Packets dropped by the startup-noise filter.
    pub startup_drops: AtomicU64,
    /// Duplicate retransmissions and stale buffered packets.
    pub duplicates: AtomicU64,
    pub malformed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub missing_segments: AtomicU64,
    pub resend_requests: AtomicU64,
    /// First request of each gap.
    pub resend_total: AtomicU64,
    pub resend_success: AtomicU64,
    pub forced_drains: AtomicU64,
    pub dispatched: AtomicU64,
    /// Packets sitting in lane queues.
    pub queued: AtomicI64,
    pub sink_errors: AtomicU64,
    align: [AtomicU64; AlignKind::COUNT],
}

impl Stats {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_align(&self, kind: AlignKind) {
        self.align[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn align_count(&self, kind: AlignKind) -> u64 {
        self.align[kind as usize].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            packets: get(&self.packets),
            bytes: get(&self.bytes),
            startup_drops: get(&self.startup_drops),
            duplicates: get(&self.duplicates),
            malformed: get(&self.malformed),
            decode_errors: get(&self.decode_errors),
            missing_segments: get(&self.missing_segments),
            resend_requests: get(&self.resend_requests),
            resend_total: get(&self.resend_total),
            resend_success: get(&self.resend_success),
            forced_drains: get(&self.forced_drains),
            dispatched: get(&self.dispatched),
            queued: self.queued.load(Ordering::Relaxed),
            sink_errors: get(&self.sink_errors),
            align: AlignCounts {
                align: self.align_count(AlignKind::Align),
                broken: self.align_count(AlignKind::Broken),
                drop: self.align_count(AlignKind::Drop),
                corr: self.align_count(AlignKind::Corr),
                reset: self.align_count(AlignKind::Reset),
            },
        }
    }
}

/// Alignment outcomes by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlignCounts {
    pub align: u64,
    pub broken: u64,
    pub drop: u64,
    pub corr: u64,
    pub reset: u64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections: i64,
    pub packets: u64,
    pub bytes: u64,
    pub startup_drops: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub decode_errors: u64,
    pub missing_segments: u64,
    pub resend_requests: u64,
    pub resend_total: u64,
    pub resend_success: u64,
    pub forced_drains: u64,
    pub dispatched: u64,
    pub queued: i64,
    pub sink_errors: u64,
    pub align: AlignCounts,
}
