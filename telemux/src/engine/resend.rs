//! Gap handling for sensors with resend enabled.
//!
//! A packet that skips ahead of `last_sequence + 1` is parked in the
//! session's [`ReorderBuffer`] and the sensor is asked to retransmit the
//! first missing sequence. Requests are throttled to one every
//! [`RESEND_INTERVAL`] while unanswered. After [`MAX_REDO`] requests, or when
//! the buffer fills, the oldest parked packet is released regardless and the
//! gap is given up on: delivery degrades to out-of-order rather than loss.
//!
//! A packet at or below `last_sequence` flushes the buffer in order. It is
//! then either a late retransmission, reported as [`ResendVerdict::Stale`]
//! and never dispatched twice, or a counter restart
//! (see [`SensorSession::is_restart`]), which proceeds.

use crate::dispatch::Dispatch;
use crate::stats::Stats;
use crate::trace::{debug, trace};
use crate::types::Micros;
use crate::wire::control::{RESEND_LEN, resend_request};

use super::reorder::{InsertResult, ReorderBuffer};
use super::sensor::SensorSession;

/// Requests per gap before the buffer is force-drained.
pub const MAX_REDO: u32 = 5;
/// Minimum spacing between requests for an unanswered gap.
pub const RESEND_INTERVAL: Micros = 5_000_000;

/// What the acceptor should do with the packet it just offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendVerdict {
    /// Not ahead of sequence: dispatch it.
    Proceed(Vec<u8>),
    /// Parked; nothing to send.
    Buffered,
    /// Parked; reply with this resend request.
    Request([u8; RESEND_LEN]),
    /// Already delivered: do not dispatch again.
    Stale,
}

impl SensorSession {
    /// Offers a packet to the reorder logic.
    ///
    /// May dispatch previously buffered packets (forced drain or
    /// regression flush) before returning.
    pub fn offer<D: Dispatch + ?Sized>(
        &mut self,
        seq: u64,
        now: Micros,
        data: Vec<u8>,
        dispatch: &D,
        stats: &Stats,
    ) -> ResendVerdict {
        if self.last_sequence > 0 && seq > self.last_sequence + 1 {
            let full = self.reorder.as_ref().is_some_and(ReorderBuffer::is_full);
            if full || self.redo >= MAX_REDO {
                self.force_drain(dispatch, stats);
            }

            if seq > self.last_sequence + 1 {
                let Some(buf) = self.reorder.as_mut() else {
                    return ResendVerdict::Proceed(data);
                };
                if buf.insert(seq, now, data) == InsertResult::Duplicate {
                    Stats::incr(&stats.duplicates);
                }

                let expired = now - self.req_time > RESEND_INTERVAL;
                if self.req_sequence == 0 || expired {
                    self.redo += 1;
                    self.req_sequence = self.last_sequence + 1;
                    self.req_time = now;
                    if self.redo == 1 {
                        Stats::incr(&stats.resend_total);
                    }
                    Stats::incr(&stats.resend_requests);
                    debug!(
                        sensor = %self.tag.id,
                        request = self.req_sequence,
                        received = seq,
                        redo = self.redo,
                        "requesting resend"
                    );
                    return ResendVerdict::Request(resend_request(self.tag.id, self.req_sequence));
                }
                return ResendVerdict::Buffered;
            }
        }

        self.redo = 0;
        if self.last_sequence > 0 && seq <= self.last_sequence {
            let restart = self.is_restart(seq);
            debug!(
                sensor = %self.tag.id,
                seq,
                last = self.last_sequence,
                restart,
                "sequence behind, flushing buffer"
            );
            self.drain_all(dispatch, stats);
            if restart {
                self.req_sequence = 0;
            } else {
                if self.req_sequence <= self.last_sequence {
                    self.req_sequence = 0;
                }
                Stats::incr(&stats.duplicates);
                return ResendVerdict::Stale;
            }
        }
        if self.req_sequence != 0 && seq == self.req_sequence {
            Stats::incr(&stats.resend_success);
            self.req_sequence = 0;
        }
        ResendVerdict::Proceed(data)
    }

    /// Dispatches buffered packets that continue the sequence.
    ///
    /// Entries at or below `last_sequence` are stale and dropped.
    pub fn drain_contiguous<D: Dispatch + ?Sized>(&mut self, dispatch: &D, stats: &Stats) {
        loop {
            let limit = self.last_sequence + 1;
            let Some((seq, entry)) = self.reorder.as_mut().and_then(|b| b.pop_through(limit))
            else {
                return;
            };
            if seq < limit {
                trace!(sensor = %self.tag.id, seq, "dropping stale buffered packet");
                Stats::incr(&stats.duplicates);
                continue;
            }
            self.hand_off(seq, entry.realtime, false, entry.data, dispatch, stats);
        }
    }

    /// Dispatches every buffered packet in sequence order.
    fn drain_all<D: Dispatch + ?Sized>(&mut self, dispatch: &D, stats: &Stats) {
        let Some(mut buf) = self.reorder.take() else {
            return;
        };
        buf.drain_all(|seq, entry| {
            self.hand_off(seq, entry.realtime, false, entry.data, dispatch, stats);
        });
        self.reorder = Some(buf);
    }

    /// Gives up on the current gap: releases the oldest buffered packet and
    /// whatever follows it contiguously.
    fn force_drain<D: Dispatch + ?Sized>(&mut self, dispatch: &D, stats: &Stats) {
        if let Some((seq, entry)) = self.reorder.as_mut().and_then(ReorderBuffer::pop_oldest) {
            debug!(
                sensor = %self.tag.id,
                last = self.last_sequence,
                released = seq,
                redo = self.redo,
                "resend timeout, forcing drain"
            );
            Stats::incr(&stats.forced_drains);
            self.hand_off(seq, entry.realtime, false, entry.data, dispatch, stats);
        }
        self.redo = 0;
        if self.req_sequence <= self.last_sequence {
            self.req_sequence = 0;
        }
        self.drain_contiguous(dispatch, stats);
    }
}
