//! Lane worker: decode, align and fan out.
//!
//! Alignment state is lane-local: a sensor always lands on the same lane, so
//! its [`TimeAligner`] is never shared between threads.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use serde::Serialize;

use crate::engine::{AlignKind, TimeAligner};
use crate::shard::ShardedMap;
use crate::sink::{SinkError, Sinks};
use crate::stats::Stats;
use crate::trace::{debug, error, info, warn};
use crate::types::{Micros, SensorId};
use crate::wire::{Frame, FrameError};

use super::package::Package;

/// Last aligned timestamp per sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlignSnapshot {
    pub sequence: u64,
    /// Device-relative timestamp of the packet's first sample.
    pub aligntime: Micros,
    /// Arrival wall clock.
    pub realtime: Micros,
    /// How the aligner treated the packet.
    pub kind: AlignKind,
}

/// Shared "last seen frame timestamp" index, written by lane workers.
pub type AlignIndex = ShardedMap<AlignSnapshot>;

/// Work item on a lane queue.
#[derive(Debug)]
pub enum LaneItem {
    /// Align and fan out.
    Packet(Package),
    /// Drop the sensor's alignment state and published snapshot.
    Forget(SensorId),
}

/// Per-lane settings, copied into every worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Alignment threshold in microseconds; `<= 0` disables it.
    pub offset_threshold: Micros,
    /// Forward to the proxy after alignment rather than before decoding.
    pub proxy_timealign: bool,
}

/// Single-threaded consumer of one lane.
pub struct LaneWorker {
    index: usize,
    config: WorkerConfig,
    sinks: Sinks,
    align_index: Arc<AlignIndex>,
    stats: Arc<Stats>,
    aligners: HashMap<SensorId, TimeAligner>,
}

impl LaneWorker {
    #[must_use]
    pub fn new(
        index: usize,
        config: WorkerConfig,
        sinks: Sinks,
        align_index: Arc<AlignIndex>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            index,
            config,
            sinks,
            align_index,
            stats,
            aligners: HashMap::new(),
        }
    }

    /// Consumes the lane until every sender is gone and the queue is empty.
    pub fn run(mut self, rx: &Receiver<LaneItem>) {
        while let Ok(item) = rx.recv() {
            self.handle(item);
        }
        debug!(lane = self.index, sensors = self.aligners.len(), "lane drained");
    }

    /// Applies one lane item. `Packet` also releases its queued count.
    pub fn handle(&mut self, item: LaneItem) {
        match item {
            LaneItem::Packet(pkg) => {
                self.stats.queued.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                self.process(&pkg);
            }
            LaneItem::Forget(id) => {
                self.aligners.remove(&id);
                self.align_index.remove(id);
            }
        }
    }

    /// Runs one packet through decode, alignment and every sink.
    pub fn process(&mut self, pkg: &Package) {
        let id = pkg.sensor.id;
        let label = pkg.sensor.label.as_str();

        if let Some(presence) = &self.sinks.presence {
            let r = presence.sync(id);
            self.check("presence", label, r);
        }

        if !self.config.proxy_timealign
            && let Some(proxy) = &self.sinks.proxy
        {
            let r = proxy.write(id, label, &pkg.data).map(drop);
            self.check("proxy", label, r);
        }

        let frame = match Frame::decode(&pkg.data) {
            Ok(frame) => frame,
            Err(e) => {
                Stats::incr(&self.stats.decode_errors);
                error!(sensor = label, seq = pkg.sequence, error = %e, "decode failed");
                return;
            }
        };
        let span = match frame.arc_span() {
            Ok(span) => span,
            Err(e @ FrameError::MissingSegment(_)) => {
                Stats::incr(&self.stats.missing_segments);
                error!(sensor = label, seq = pkg.sequence, error = %e, "packet skipped");
                return;
            }
            Err(e) => {
                Stats::incr(&self.stats.decode_errors);
                error!(sensor = label, seq = pkg.sequence, error = %e, "bad arc segment");
                return;
            }
        };

        let threshold = self.config.offset_threshold;
        let aligner = self
            .aligners
            .entry(id)
            .or_insert_with(|| TimeAligner::new(threshold));
        let (aligntime, kind) =
            aligner.next(pkg.sequence as i64, span.fill, pkg.realtime, span.duration);
        self.stats.record_align(kind);
        if kind != AlignKind::Align {
            info!(
                sensor = label,
                seq = pkg.sequence,
                kind = kind.as_str(),
                aligntime,
                tracked = aligner.last_sequence(),
                anchor = aligner.realtime(),
                offset = pkg.realtime - span.duration - aligntime,
                "alignment adjusted"
            );
        }
        if pkg.sample {
            debug!(
                sensor = label,
                seq = pkg.sequence,
                rate = span.sample_rate,
                samples = span.samples,
                offset = pkg.realtime - span.duration - aligntime,
                "sample"
            );
        }
        self.align_index.insert(
            id,
            AlignSnapshot {
                sequence: pkg.sequence,
                aligntime,
                realtime: pkg.realtime,
                kind,
            },
        );

        if self.config.proxy_timealign
            && let Some(proxy) = &self.sinks.proxy
        {
            let r = proxy.write(id, label, frame.raw()).map(drop);
            self.check("proxy", label, r);
        }
        if let Some(broadcast) = &self.sinks.broadcast {
            let r = broadcast.write(id, &frame);
            self.check("broadcast", label, r);
        }
        if let Some(grpc) = &self.sinks.grpc {
            let r = grpc.write(id, label, frame.raw());
            self.check("grpc", label, r);
        }
        if let Some(file) = &self.sinks.file {
            let r = file.write(id, &frame);
            self.check("file", label, r);
        }
    }

    fn check(&self, sink: &'static str, label: &str, result: Result<(), SinkError>) {
        if let Err(e) = result {
            Stats::incr(&self.stats.sink_errors);
            warn!(sink, sensor = label, error = %e, "sink write failed");
        }
    }

    /// Sensors with live alignment state on this lane.
    #[must_use]
    pub fn tracked_sensors(&self) -> usize {
        self.aligners.len()
    }
}
