//! Sharded dispatch of ordered packets to lane workers.
//!
//! A sensor always maps to lane `id & (lanes - 1)`, and each lane is a single
//! FIFO consumed by one thread, so per-sensor order survives the hop from the
//! network threads to the sinks while different sensors proceed in parallel.

pub mod package;
pub mod router;
pub mod worker;

pub use package::{Package, SensorTag};
pub use router::{Dispatcher, LANE_CAPACITY};
pub use worker::{AlignIndex, AlignSnapshot, LaneWorker, WorkerConfig};

use crate::types::SensorId;

/// Destination for packets leaving the sequencing engine.
pub trait Dispatch: Send + Sync {
    /// Queues a packet. May block when the sensor's lane is full.
    fn dispatch(&self, pkg: Package);

    /// Drops per-sensor lane state once earlier packets are processed.
    fn forget(&self, _sensor: SensorId) {}
}
