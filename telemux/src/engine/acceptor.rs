//! Receive path: the reactor's [`EventHandler`].
//!
//! A session is only ever locked from the connection currently delivering
//! that sensor's packets, so the per-session mutex is uncontended except
//! across reconnects that land on a different event loop.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::clock::WallClock;
use crate::dispatch::Dispatch;
use crate::net::{ConnInfo, EventHandler};
use crate::net::reactor::DEFAULT_TICK;
use crate::stats::Stats;
use crate::trace::{debug, info, trace, warn};
use crate::wire::control::Outbound;
use crate::wire::{FrameError, RawHeader};

use super::registry::SensorRegistry;
use super::resend::ResendVerdict;

/// Packets at or below this sequence from sensors that cannot be answered
/// are boot noise.
const STARTUP_SEQUENCE: u64 = 2;

/// Receive-path settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptorConfig {
    /// Park packets that skip ahead and ask the sensor to resend the gap.
    /// When off, packets are dispatched in arrival order.
    pub resend_enable: bool,
}

/// Filters, sequences and dispatches every frame the reactor delivers.
pub struct Acceptor<D> {
    registry: Arc<SensorRegistry>,
    dispatch: Arc<D>,
    stats: Arc<Stats>,
    clock: Arc<dyn WallClock>,
    config: AcceptorConfig,
}

impl<D: Dispatch + 'static> Acceptor<D> {
    #[must_use]
    pub fn new(
        registry: Arc<SensorRegistry>,
        dispatch: Arc<D>,
        stats: Arc<Stats>,
        clock: Arc<dyn WallClock>,
        config: AcceptorConfig,
    ) -> Self {
        Self {
            registry,
            dispatch,
            stats,
            clock,
            config,
        }
    }

    /// Handles one complete frame from `conn` and returns the reply, if any.
    pub fn receive(&self, conn: &ConnInfo, raw: Vec<u8>) -> Option<Outbound> {
        let header = match RawHeader::new(&raw) {
            Ok(h) => h,
            Err(e) => {
                self.on_malformed(conn, &e);
                return None;
            }
        };
        let seq = header.sequence();
        let id = header.sensor_id();
        let flags = header.flags();
        let respond = flags.response();

        if seq <= STARTUP_SEQUENCE && !respond {
            Stats::incr(&self.stats.startup_drops);
            info!(sensor = %id, seq, peer = %conn.peer, "dropping startup packet");
            return None;
        }
        if flags.end_of_stream() {
            info!(sensor = %id, seq, "end of stream");
        }

        let now = self.clock.now_micros();
        let (handle, created) = self.registry.session(id, conn.peer);
        if created {
            info!(sensor = %id, peer = %conn.peer, resend = self.config.resend_enable, "new sensor");
        }
        let mut session = handle.lock();
        if respond && !session.holding {
            session.holding = true;
        }
        let sample = session.touch(conn.peer, now);
        Stats::incr(&self.stats.packets);
        self.stats
            .bytes
            .fetch_add(raw.len() as u64, Ordering::Relaxed);

        if respond && seq == session.last_sequence {
            Stats::incr(&self.stats.duplicates);
            trace!(sensor = %id, seq, "duplicate retransmission");
            return Some(Outbound::ack(seq));
        }

        let data = if self.config.resend_enable {
            match session.offer(seq, now, raw, self.dispatch.as_ref(), &self.stats) {
                ResendVerdict::Proceed(data) => data,
                ResendVerdict::Buffered => return None,
                ResendVerdict::Request(frame) => return Some(Outbound::Resend(frame)),
                ResendVerdict::Stale => return respond.then(|| Outbound::ack(seq)),
            }
        } else {
            raw
        };

        session.hand_off(seq, now, sample, data, self.dispatch.as_ref(), &self.stats);
        if self.config.resend_enable {
            session.drain_contiguous(self.dispatch.as_ref(), &self.stats);
        }

        respond.then(|| Outbound::ack(seq))
    }
}

impl<D: Dispatch + 'static> EventHandler for Acceptor<D> {
    fn on_open(&self, conn: &ConnInfo) {
        let open = self.stats.connections.fetch_add(1, Ordering::Relaxed) + 1;
        info!(peer = %conn.peer, event_loop = conn.loop_index, connections = open, "connection opened");
    }

    fn on_close(&self, conn: &ConnInfo) {
        let open = self.stats.connections.fetch_sub(1, Ordering::Relaxed) - 1;
        let released = self.registry.release(conn.peer);
        for id in &released {
            self.dispatch.forget(*id);
        }
        info!(
            peer = %conn.peer,
            connections = open,
            released = released.len(),
            "connection closed"
        );
    }

    fn on_frame(&self, conn: &ConnInfo, frame: Vec<u8>) -> Option<Outbound> {
        self.receive(conn, frame)
    }

    fn on_malformed(&self, conn: &ConnInfo, err: &FrameError) {
        Stats::incr(&self.stats.malformed);
        warn!(peer = %conn.peer, error = %err, "malformed frame");
    }

    fn on_tick(&self) -> Duration {
        let snap = self.stats.snapshot();
        debug!(
            sensors = self.registry.len(),
            connections = snap.connections,
            packets = snap.packets,
            dispatched = snap.dispatched,
            queued = snap.queued,
            resend_requests = snap.resend_requests,
            "stats"
        );
        DEFAULT_TICK
    }
}
