//! Ingestion and sequencing engine.
//!
//! - [`acceptor`]: per-connection callbacks; filters noise and duplicates.
//! - [`resend`]: gap handling, resend requests and buffer drains.
//! - [`reorder`]: bounded buffer of packets that arrived ahead of sequence.
//! - [`sensor`] / [`registry`]: per-sensor session state.
//! - [`align`]: device-relative timestamp state machine.

pub mod acceptor;
pub mod align;
pub mod registry;
pub mod reorder;
pub mod resend;
pub mod sensor;

pub use acceptor::{Acceptor, AcceptorConfig};
pub use align::{AlignKind, TimeAligner};
pub use registry::SensorRegistry;
pub use reorder::ReorderBuffer;
pub use sensor::{SensorSession, SessionSnapshot};
