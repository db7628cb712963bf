//! Top-level server handle.
//!
//! Wires configuration, sinks, the dispatcher, the acceptor and the reactor
//! together, and tears them down in reverse:
//!
//! ```text
//! shutdown: reactor (stop accepting, close connections, join)
//!        -> dispatcher (close lanes, drain, join)
//!        -> sinks (stop)
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::clock::{SystemClock, WallClock};
use crate::config::{Config, ConfigError};
use crate::dispatch::{AlignIndex, AlignSnapshot, Dispatcher, WorkerConfig};
use crate::engine::{Acceptor, AcceptorConfig, SensorRegistry, SessionSnapshot};
use crate::net::{Endpoint, Reactor, ReactorConfig};
use crate::sink::{FileRecorder, PresenceTracker, ProxyForwarder, Sinks};
use crate::stats::{Stats, StatsSnapshot};
use crate::trace::{info, warn};
use crate::types::SensorId;

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to listen: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to open sink: {0}")]
    Sink(#[source] io::Error),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),
}

/// A running ingestion server.
///
/// Dropping the handle shuts the server down; [`Server::shutdown`] does the
/// same explicitly.
pub struct Server {
    reactor: Option<Reactor>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<SensorRegistry>,
    align_index: Arc<AlignIndex>,
    presence: Option<Arc<PresenceTracker>>,
    stats: Arc<Stats>,
    sinks: Sinks,
}

impl Server {
    /// Starts a server on the system clock.
    ///
    /// `sinks` carries externally implemented sinks (broadcast, gRPC).
    /// Proxy and file sinks are created from `config` when enabled and not
    /// already supplied, and an in-memory presence tracker is attached when
    /// no presence sink is given.
    ///
    /// # Errors
    ///
    /// Configuration errors are reported before any socket or thread is
    /// created.
    pub fn start(config: &Config, sinks: Sinks) -> Result<Self, ServerError> {
        Self::start_with_clock(config, sinks, Arc::new(SystemClock::new()))
    }

    /// [`start`](Self::start) with an explicit wall clock.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub fn start_with_clock(
        config: &Config,
        mut sinks: Sinks,
        clock: Arc<dyn WallClock>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let service = &config.service;
        let addr = service.listen_addr()?;
        let lanes = service.lane_count;

        if let Some(grpc) = &sinks.grpc {
            grpc.set_shard_mask(service.lane_mask());
        }
        if sinks.proxy.is_none() && config.proxy.enable {
            let proxy = ProxyForwarder::start(
                config.proxy.parent_addr()?,
                Duration::from_millis(config.proxy.timeout),
                Duration::from_millis(config.proxy.interval),
                lanes,
            )
            .map_err(ServerError::Spawn)?;
            sinks.proxy = Some(Arc::new(proxy));
        }
        if sinks.file.is_none() && config.file.enable {
            let recorder = FileRecorder::new(&config.file.dir).map_err(ServerError::Sink)?;
            sinks.file = Some(Arc::new(recorder));
        }
        let presence = if sinks.presence.is_none() {
            let tracker = Arc::new(PresenceTracker::new(Arc::clone(&clock)));
            sinks.presence = Some(tracker.clone());
            Some(tracker)
        } else {
            None
        };

        let stats = Arc::new(Stats::default());
        let align_index = Arc::new(AlignIndex::default());
        let dispatcher = Dispatcher::spawn(
            lanes,
            WorkerConfig {
                offset_threshold: service.offset_threshold_micros(),
                proxy_timealign: service.proxy_timealign,
            },
            &sinks,
            &align_index,
            &stats,
            service.pin_lanes,
        );
        let dispatcher = match dispatcher {
            Ok(d) => Arc::new(d),
            Err(e) => {
                sinks.stop();
                return Err(ServerError::Spawn(e));
            }
        };

        let registry = Arc::new(SensorRegistry::new(service.resend_enable));
        let acceptor = Arc::new(Acceptor::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&stats),
            clock,
            AcceptorConfig {
                resend_enable: service.resend_enable,
            },
        ));

        let reactor_config = ReactorConfig {
            addr,
            event_loops: service.event_loop_count(),
            keepalive: service.keepalive(),
            verify_checksum: service.enable_crc_check,
        };
        let reactor = match Reactor::spawn(&reactor_config, acceptor) {
            Ok(r) => r,
            Err(e) => {
                dispatcher.close_and_join();
                sinks.stop();
                return Err(ServerError::Bind(e));
            }
        };

        info!(
            addr = %reactor.local_addr(),
            lanes,
            resend = service.resend_enable,
            crc = service.enable_crc_check,
            "server started"
        );
        Ok(Self {
            reactor: Some(reactor),
            dispatcher,
            registry,
            align_index,
            presence,
            stats,
            sinks,
        })
    }

    /// Address the listener is bound to (resolves port 0).
    #[must_use]
    pub fn local_addr(&self) -> Option<Endpoint> {
        self.reactor.as_ref().map(Reactor::local_addr)
    }

    /// Ids of every live session, sorted.
    #[must_use]
    pub fn sensors(&self) -> Vec<SensorId> {
        self.registry.ids()
    }

    #[must_use]
    pub fn sensor(&self, id: SensorId) -> Option<SessionSnapshot> {
        self.registry.snapshot(id)
    }

    /// Last aligned timestamp published for `id`.
    #[must_use]
    pub fn alignment(&self, id: SensorId) -> Option<AlignSnapshot> {
        self.align_index.get(id)
    }

    /// Sensors seen by the built-in presence tracker within its idle limit.
    ///
    /// Empty when an external presence sink was supplied.
    #[must_use]
    pub fn online(&self) -> Vec<SensorId> {
        self.presence
            .as_ref()
            .map_or_else(Vec::new, |p| p.online())
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Packets waiting per lane.
    #[must_use]
    pub fn lane_depths(&self) -> Vec<usize> {
        self.dispatcher.depths()
    }

    /// Stops accepting, drains every lane and stops the sinks.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(reactor) = self.reactor.take() else {
            return;
        };
        reactor.shutdown();
        self.dispatcher.close_and_join();
        self.sinks.stop();
        let stats = self.stats.snapshot();
        if stats.queued != 0 {
            warn!(queued = stats.queued, "lanes closed with packets outstanding");
        }
        info!(
            packets = stats.packets,
            dispatched = stats.dispatched,
            duplicates = stats.duplicates,
            "server stopped"
        );
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
