//! Sensor telemetry ingestion engine.
//!
//! Sensors stream framed packets over raw TCP. For every sensor the engine
//! rebuilds an ordered sequence (asking the device to resend gaps when
//! enabled), assigns a device-relative timestamp and fans the packet out to
//! downstream sinks on a fixed set of worker lanes.
//!
//! ```text
//! TCP ──> net::Reactor ──> engine::Acceptor ──> dispatch::Dispatcher ──> lane workers ──> sinks
//!              │                  │
//!          FrameCodec      SensorRegistry / ReorderBuffer
//! ```

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod net;
pub mod server;
pub mod shard;
pub mod sink;
pub mod stats;
pub mod types;
pub mod wire;

mod trace;

pub use config::{Config, ConfigError};
pub use server::{Server, ServerError};
pub use trace::init_tracing;
pub use types::SensorId;

// Re-export serde traits for convenience
pub use serde::{Deserialize, Serialize};
