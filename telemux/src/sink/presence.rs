//! In-memory sensor presence.
//!
//! Tracks when each sensor was first and last seen. Sensors silent for
//! longer than the idle limit are expired on the next sweep; sweeps run
//! opportunistically from [`PresenceSync::sync`] at most once per interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

use crate::clock::WallClock;
use crate::shard::ShardedMap;
use crate::trace::info;
use crate::types::{Micros, SensorId};

use super::{PresenceSync, SinkError};

/// Silence after which a sensor is considered gone.
pub const IDLE_LIMIT: Micros = 5_000_000;
/// Minimum spacing between expiry sweeps.
pub const SWEEP_INTERVAL: Micros = 60_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Presence {
    pub first_seen: Micros,
    pub last_packet: Micros,
}

pub struct PresenceTracker {
    seen: ShardedMap<Presence>,
    clock: Arc<dyn WallClock>,
    last_sweep: AtomicI64,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(clock: Arc<dyn WallClock>) -> Self {
        let now = clock.now_micros();
        Self {
            seen: ShardedMap::default(),
            clock,
            last_sweep: AtomicI64::new(now),
        }
    }

    #[must_use]
    pub fn get(&self, sensor: SensorId) -> Option<Presence> {
        self.seen.get(sensor)
    }

    /// Sensors heard from within the idle limit.
    #[must_use]
    pub fn online(&self) -> Vec<SensorId> {
        let now = self.clock.now_micros();
        let mut ids: Vec<SensorId> = self
            .seen
            .keys()
            .into_iter()
            .filter(|&id| {
                self.seen
                    .with(id, |p| now - p.last_packet <= IDLE_LIMIT)
                    .unwrap_or(false)
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Forgets sensors idle longer than the limit; returns them.
    pub fn expire(&self) -> Vec<SensorId> {
        let now = self.clock.now_micros();
        self.last_sweep.store(now, Ordering::Relaxed);
        let gone = self
            .seen
            .retain(|_, p| now - p.last_packet <= IDLE_LIMIT);
        for id in &gone {
            info!(sensor = %id, "sensor offline");
        }
        gone
    }
}

impl PresenceSync for PresenceTracker {
    fn sync(&self, sensor: SensorId) -> Result<(), SinkError> {
        let now = self.clock.now_micros();
        let (current, created) = self.seen.get_or_insert_with(sensor, || Presence {
            first_seen: now,
            last_packet: now,
        });
        if created {
            info!(sensor = %sensor, "sensor online");
        } else {
            self.seen.insert(
                sensor,
                Presence {
                    last_packet: now,
                    ..current
                },
            );
        }

        if now - self.last_sweep.load(Ordering::Relaxed) >= SWEEP_INTERVAL {
            self.expire();
        }
        Ok(())
    }
}
