//! Per-sensor session state.

use std::sync::Arc;

use serde::Serialize;

use crate::dispatch::{Dispatch, Package, SensorTag};
use crate::net::Endpoint;
use crate::stats::Stats;
use crate::types::{Micros, SensorId};

use super::reorder::{MAX_ENTRIES, ReorderBuffer};

/// Packets between statistics samples.
pub const SAMPLE_INTERVAL: u32 = 1_000;
/// A sequence at or below this, arriving after a higher one, means the
/// sensor restarted its counter.
pub const RESTART_SEQUENCE: u64 = 2;
/// A regression deeper than this is a counter restart rather than a late
/// retransmission.
pub const RESTART_WINDOW: u64 = MAX_ENTRIES as u64;

/// Sequencing state for one sensor.
///
/// Lives behind a mutex in the [`SensorRegistry`](super::SensorRegistry);
/// only the connection currently delivering the sensor's packets locks it.
#[derive(Debug)]
pub struct SensorSession {
    pub(crate) tag: Arc<SensorTag>,
    /// Connection that most recently delivered a packet.
    pub(crate) address: Endpoint,
    /// Survives disconnects once the sensor has used the reply channel.
    pub(crate) holding: bool,
    /// Highest sequence handed to dispatch since the last counter restart;
    /// 0 before the first.
    pub(crate) last_sequence: u64,
    pub(crate) last_arrival: Micros,
    sample_counter: u32,
    /// Present only when resend is enabled.
    pub(crate) reorder: Option<ReorderBuffer>,
    pub(crate) redo: u32,
    /// Outstanding resend request; 0 when none.
    pub(crate) req_sequence: u64,
    pub(crate) req_time: Micros,
}

impl SensorSession {
    #[must_use]
    pub fn new(id: SensorId, address: Endpoint, resend_enable: bool) -> Self {
        Self {
            tag: Arc::new(SensorTag::new(id)),
            address,
            holding: false,
            last_sequence: 0,
            last_arrival: 0,
            sample_counter: 0,
            reorder: resend_enable.then(ReorderBuffer::default),
            redo: 0,
            req_sequence: 0,
            req_time: 0,
        }
    }

    /// Sensor this session belongs to.
    #[must_use]
    pub fn id(&self) -> SensorId {
        self.tag.id
    }

    /// Connection that most recently delivered a packet.
    #[must_use]
    pub const fn address(&self) -> Endpoint {
        self.address
    }

    /// Whether the session outlives its connection.
    #[must_use]
    pub const fn holding(&self) -> bool {
        self.holding
    }

    /// Highest sequence handed to dispatch since the last counter restart.
    #[must_use]
    pub const fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Records an arrival and returns whether this packet is sampled.
    pub(crate) fn touch(&mut self, address: Endpoint, now: Micros) -> bool {
        self.address = address;
        self.last_arrival = now;
        self.sample_counter += 1;
        if self.sample_counter > SAMPLE_INTERVAL {
            self.sample_counter = 0;
            true
        } else {
            false
        }
    }

    /// Whether `seq` restarts the sensor's counter instead of repeating an
    /// already delivered packet.
    #[must_use]
    pub fn is_restart(&self, seq: u64) -> bool {
        seq < self.last_sequence
            && (seq <= RESTART_SEQUENCE || self.last_sequence - seq > RESTART_WINDOW)
    }

    /// Queues the packet and advances the high-water mark.
    ///
    /// `last_sequence` only moves down on a counter restart.
    pub(crate) fn hand_off<D: Dispatch + ?Sized>(
        &mut self,
        sequence: u64,
        realtime: Micros,
        sample: bool,
        data: Vec<u8>,
        dispatch: &D,
        stats: &Stats,
    ) {
        self.last_sequence = if self.is_restart(sequence) {
            sequence
        } else {
            self.last_sequence.max(sequence)
        };
        Stats::incr(&stats.dispatched);
        dispatch.dispatch(Package {
            sensor: Arc::clone(&self.tag),
            sequence,
            realtime,
            sample,
            data,
        });
    }

    /// Copies the session state for inspection.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.tag.id,
            address: self.address.to_string(),
            holding: self.holding,
            last_sequence: self.last_sequence,
            last_arrival: self.last_arrival,
            buffered: self.reorder.as_ref().map_or(0, ReorderBuffer::len),
            buffered_bytes: self.reorder.as_ref().map_or(0, ReorderBuffer::bytes),
            redo: self.redo,
            pending_resend: (self.req_sequence != 0).then_some(self.req_sequence),
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: SensorId,
    /// Peer of the latest delivering connection.
    pub address: String,
    pub holding: bool,
    pub last_sequence: u64,
    /// Wall clock of the latest packet, in microseconds.
    pub last_arrival: Micros,
    /// Packets parked ahead of sequence.
    pub buffered: usize,
    pub buffered_bytes: usize,
    /// Resend requests sent for the current gap.
    pub redo: u32,
    /// Sequence of the unanswered resend request, if any.
    pub pending_resend: Option<u64>,
}
