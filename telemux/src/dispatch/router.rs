//! Lane routing and the worker threads behind it.

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded};
use parking_lot::{Mutex, RwLock};

use crate::sink::Sinks;
use crate::stats::Stats;
use crate::trace::{debug, error, info, warn};
use crate::types::SensorId;

use super::Dispatch;
use super::package::Package;
use super::worker::{AlignIndex, LaneItem, LaneWorker, WorkerConfig};

/// Packets a lane can hold before dispatch blocks the network thread.
pub const LANE_CAPACITY: usize = 102_400;

/// Routes packets to `lane_count` single-consumer lanes by sensor id.
pub struct Dispatcher {
    /// Sender per lane; `None` once closed.
    lanes: Box<[RwLock<Option<Sender<LaneItem>>>]>,
    /// `lane_count - 1`.
    mask: u64,
    stats: Arc<Stats>,
    /// Worker threads, emptied by [`close_and_join`](Self::close_and_join).
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawns one worker thread per lane.
    ///
    /// With `pin_lanes`, lane `i` is pinned to the `i`-th available core
    /// (wrapping when there are more lanes than cores).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `lane_count` is not a power of two, or the
    /// spawn error if a thread cannot be started.
    pub fn spawn(
        lane_count: usize,
        config: WorkerConfig,
        sinks: &Sinks,
        align_index: &Arc<AlignIndex>,
        stats: &Arc<Stats>,
        pin_lanes: bool,
    ) -> io::Result<Self> {
        Self::with_capacity(
            lane_count,
            LANE_CAPACITY,
            config,
            sinks,
            align_index,
            stats,
            pin_lanes,
        )
    }

    /// [`spawn`](Self::spawn) with an explicit per-lane capacity.
    ///
    /// # Errors
    ///
    /// See [`spawn`](Self::spawn).
    pub fn with_capacity(
        lane_count: usize,
        capacity: usize,
        config: WorkerConfig,
        sinks: &Sinks,
        align_index: &Arc<AlignIndex>,
        stats: &Arc<Stats>,
        pin_lanes: bool,
    ) -> io::Result<Self> {
        if !lane_count.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("lane count {lane_count} is not a power of two"),
            ));
        }
        let cores = if pin_lanes {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let dispatcher = Self {
            lanes: (0..lane_count).map(|_| RwLock::new(None)).collect(),
            mask: lane_count as u64 - 1,
            stats: Arc::clone(stats),
            handles: Mutex::new(Vec::with_capacity(lane_count)),
        };

        for index in 0..lane_count {
            let (tx, rx) = bounded(capacity);
            let worker = LaneWorker::new(
                index,
                config,
                sinks.clone(),
                Arc::clone(align_index),
                Arc::clone(stats),
            );
            let core = (!cores.is_empty()).then(|| cores[index % cores.len()]);
            let spawned = thread::Builder::new()
                .name(format!("telemux-lane-{index}"))
                .spawn(move || {
                    if let Some(core) = core
                        && !core_affinity::set_for_current(core)
                    {
                        warn!(lane = index, core = core.id, "failed to pin lane");
                    }
                    worker.run(&rx);
                });
            match spawned {
                Ok(handle) => {
                    *dispatcher.lanes[index].write() = Some(tx);
                    dispatcher.handles.lock().push(handle);
                }
                Err(e) => {
                    dispatcher.close_and_join();
                    return Err(e);
                }
            }
        }

        info!(lanes = lane_count, capacity, pinned = !cores.is_empty(), "dispatcher started");
        Ok(dispatcher)
    }

    /// Number of lanes, a power of two.
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Lane owning `id`: its low bits under the lane mask.
    #[must_use]
    pub const fn lane_of(&self, id: SensorId) -> usize {
        id.shard(self.mask)
    }

    /// Packets waiting on each lane.
    #[must_use]
    pub fn depths(&self) -> Vec<usize> {
        self.lanes
            .iter()
            .map(|lane| lane.read().as_ref().map_or(0, Sender::len))
            .collect()
    }

    /// Blocks while the lane is full. Returns false once the lane is closed.
    fn send(&self, id: SensorId, item: LaneItem) -> bool {
        let lane = &self.lanes[self.lane_of(id)];
        let guard = lane.read();
        match guard.as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Closes every lane, lets the workers drain what was queued and joins
    /// them. Later dispatches are dropped.
    pub fn close_and_join(&self) {
        for lane in &self.lanes {
            lane.write().take();
        }
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("lane worker panicked");
            }
        }
        debug!("dispatcher stopped");
    }
}

impl Dispatch for Dispatcher {
    fn dispatch(&self, pkg: Package) {
        let id = pkg.sensor.id;
        let seq = pkg.sequence;
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        if !self.send(id, LaneItem::Packet(pkg)) {
            self.stats.queued.fetch_sub(1, Ordering::Relaxed);
            warn!(sensor = %id, seq, "lane closed, packet dropped");
        }
    }

    fn forget(&self, sensor: SensorId) {
        // Queued behind the sensor's packets, so they still align first.
        self.send(sensor, LaneItem::Forget(sensor));
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.handles.get_mut().is_empty() {
            self.close_and_join();
        }
    }
}
