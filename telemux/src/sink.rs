//! Downstream consumers of ordered, aligned packets.
//!
//! Each lane worker calls the configured sinks in a fixed order for every
//! packet. Sinks are best-effort: an error is logged and counted, and the
//! remaining sinks still run.
//!
//! Concrete implementations live here for the proxy forwarder, the PCM file
//! recorder and the presence tracker. Broadcast (websocket) and gRPC
//! transports are supplied by the embedding application.

pub mod file;
pub mod presence;
pub mod proxy;

use std::sync::Arc;

use thiserror::Error;

use crate::types::SensorId;
use crate::wire::Frame;

pub use file::FileRecorder;
pub use presence::PresenceTracker;
pub use proxy::ProxyForwarder;

/// A sink write failure.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink unavailable")]
    Unavailable,
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Raw packet forwarding to an upstream collector.
pub trait ProxyForward: Send + Sync {
    /// Returns the number of bytes forwarded.
    fn write(&self, sensor: SensorId, label: &str, raw: &[u8]) -> Result<usize, SinkError>;

    fn stop(&self) {}
}

/// Live push of decoded frames (websocket subscribers).
pub trait Broadcast: Send + Sync {
    fn write(&self, sensor: SensorId, frame: &Frame<'_>) -> Result<(), SinkError>;

    fn stop(&self) {}
}

/// Raw packet forwarding over gRPC.
pub trait GrpcForward: Send + Sync {
    /// Called once at startup with `lane_count - 1`.
    fn set_shard_mask(&self, mask: u64);

    fn write(&self, sensor: SensorId, label: &str, raw: &[u8]) -> Result<(), SinkError>;

    fn stop(&self) {}
}

/// Persistent recording of decoded frames.
pub trait FileWrite: Send + Sync {
    fn write(&self, sensor: SensorId, frame: &Frame<'_>) -> Result<(), SinkError>;

    fn stop(&self) {}
}

/// Sensor liveness reporting, called once per dispatched packet.
pub trait PresenceSync: Send + Sync {
    fn sync(&self, sensor: SensorId) -> Result<(), SinkError>;

    fn stop(&self) {}
}

/// The set of configured sinks. Absent sinks are skipped.
#[derive(Clone, Default)]
pub struct Sinks {
    pub proxy: Option<Arc<dyn ProxyForward>>,
    pub broadcast: Option<Arc<dyn Broadcast>>,
    pub grpc: Option<Arc<dyn GrpcForward>>,
    pub file: Option<Arc<dyn FileWrite>>,
    pub presence: Option<Arc<dyn PresenceSync>>,
}

impl Sinks {
    /// Stops every sink. Called after the lanes have drained.
    pub fn stop(&self) {
        if let Some(s) = &self.proxy {
            s.stop();
        }
        if let Some(s) = &self.broadcast {
            s.stop();
        }
        if let Some(s) = &self.grpc {
            s.stop();
        }
        if let Some(s) = &self.file {
            s.stop();
        }
        if let Some(s) = &self.presence {
            s.stop();
        }
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks")
            .field("proxy", &self.proxy.is_some())
            .field("broadcast", &self.broadcast.is_some())
            .field("grpc", &self.grpc.is_some())
            .field("file", &self.file.is_some())
            .field("presence", &self.presence.is_some())
            .finish()
    }
}
