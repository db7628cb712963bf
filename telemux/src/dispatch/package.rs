use std::sync::Arc;

use crate::types::{Micros, SensorId};

/// Sensor identity shared by all packets of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorTag {
    pub id: SensorId,
    /// Twelve upper-case hex digits, as sinks key sensors.
    pub label: String,
}

impl SensorTag {
    #[must_use]
    pub fn new(id: SensorId) -> Self {
        Self {
            id,
            label: id.to_string(),
        }
    }
}

/// One packet on its way to a lane worker.
#[derive(Debug)]
pub struct Package {
    pub sensor: Arc<SensorTag>,
    pub sequence: u64,
    /// Arrival wall clock.
    pub realtime: Micros,
    /// Selected for statistics sampling.
    pub sample: bool,
    /// The raw frame.
    pub data: Vec<u8>,
}
