//! Sensor id to session map.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::net::Endpoint;
use crate::shard::{DEFAULT_SHARDS, ShardedMap};
use crate::types::SensorId;

use super::sensor::{SensorSession, SessionSnapshot};

pub type SessionHandle = Arc<Mutex<SensorSession>>;

/// Sharded registry of live sensor sessions.
pub struct SensorRegistry {
    sessions: ShardedMap<SessionHandle>,
    resend_enable: bool,
}

impl SensorRegistry {
    #[must_use]
    pub fn new(resend_enable: bool) -> Self {
        Self {
            sessions: ShardedMap::new(DEFAULT_SHARDS),
            resend_enable,
        }
    }

    /// Returns the sensor's session, creating it on first sight.
    pub fn session(&self, id: SensorId, address: Endpoint) -> (SessionHandle, bool) {
        self.sessions.get_or_insert_with(id, || {
            Arc::new(Mutex::new(SensorSession::new(id, address, self.resend_enable)))
        })
    }

    #[must_use]
    pub fn get(&self, id: SensorId) -> Option<SessionHandle> {
        self.sessions.get(id)
    }

    /// Drops every non-holding session last seen on `address`.
    ///
    /// Returns the removed ids.
    pub fn release(&self, address: Endpoint) -> Vec<SensorId> {
        self.sessions.retain(|_, session| {
            let s = session.lock();
            s.holding || s.address != address
        })
    }

    #[must_use]
    pub fn ids(&self) -> Vec<SensorId> {
        let mut ids = self.sessions.keys();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn snapshot(&self, id: SensorId) -> Option<SessionSnapshot> {
        self.sessions.with(id, |s| s.lock().snapshot())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
