//! Raw TCP forwarding to a parent collector.
//!
//! One outbound connection per shard (`sensor_id & mask`), so each lane
//! writes to its own socket and per-sensor order is preserved upstream.
//! Connections are opened lazily on first use. A failed connection drops
//! packets until the background reconnect thread restores it.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::trace::{debug, info, warn};
use crate::types::SensorId;

use super::{ProxyForward, SinkError};

#[derive(Default)]
struct Slot {
    stream: Option<TcpStream>,
    /// A connection was wanted at least once; the reconnect loop only
    /// revives slots that have seen traffic.
    wanted: bool,
}

struct Shared {
    parent: SocketAddr,
    timeout: Duration,
    mask: u64,
    slots: Box<[Mutex<Slot>]>,
}

impl Shared {
    fn connect(&self, shard: usize) -> Option<TcpStream> {
        match TcpStream::connect_timeout(&self.parent, self.timeout) {
            Ok(stream) => {
                if let Err(e) = stream.set_write_timeout(Some(self.timeout)) {
                    warn!(shard, error = %e, "failed to set proxy write timeout");
                }
                let _ = stream.set_nodelay(true);
                info!(shard, parent = %self.parent, "proxy connected");
                Some(stream)
            }
            Err(e) => {
                debug!(shard, parent = %self.parent, error = %e, "proxy connect failed");
                None
            }
        }
    }

    fn reconnect_idle(&self) {
        for (shard, slot) in self.slots.iter().enumerate() {
            let needs = {
                let s = slot.lock();
                s.wanted && s.stream.is_none()
            };
            if !needs {
                continue;
            }
            // Connect without holding the slot; the lane keeps dropping meanwhile.
            if let Some(stream) = self.connect(shard) {
                let mut s = slot.lock();
                if s.stream.is_none() {
                    s.stream = Some(stream);
                }
            }
        }
    }
}

/// Forwards raw packets to `parent` over plain TCP.
pub struct ProxyForwarder {
    shared: Arc<Shared>,
    stop_tx: Mutex<Option<Sender<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyForwarder {
    /// Spawns the reconnect thread. Connections open on first write.
    ///
    /// `lanes` must be a power of two.
    ///
    /// # Errors
    ///
    /// Returns an error if the reconnect thread cannot be spawned.
    pub fn start(
        parent: SocketAddr,
        timeout: Duration,
        interval: Duration,
        lanes: usize,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            parent,
            timeout,
            mask: lanes.saturating_sub(1) as u64,
            slots: (0..lanes.max(1)).map(|_| Mutex::new(Slot::default())).collect(),
        });

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("telemux-proxy".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => worker.reconnect_idle(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("proxy reconnect thread exiting");
            })?;

        Ok(Self {
            shared,
            stop_tx: Mutex::new(Some(stop_tx)),
            reconnect: Mutex::new(Some(handle)),
        })
    }

    /// Number of shards with a live connection.
    #[must_use]
    pub fn connected(&self) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|s| s.lock().stream.is_some())
            .count()
    }
}

impl ProxyForward for ProxyForwarder {
    fn write(&self, sensor: SensorId, label: &str, raw: &[u8]) -> Result<usize, SinkError> {
        let shard = sensor.shard(self.shared.mask);
        let mut slot = self.shared.slots[shard].lock();
        if !slot.wanted {
            slot.wanted = true;
            slot.stream = self.shared.connect(shard);
        }
        let Some(stream) = slot.stream.as_mut() else {
            return Err(SinkError::Unavailable);
        };
        if let Err(e) = stream.write_all(raw) {
            warn!(sensor = label, shard, error = %e, "proxy write failed, dropping connection");
            slot.stream = None;
            return Err(SinkError::Io(e));
        }
        Ok(raw.len())
    }

    fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.reconnect.lock().take() {
            let _ = handle.join();
        }
        for slot in &*self.shared.slots {
            if let Some(stream) = slot.lock().stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Drop for ProxyForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn forwards_each_shard_on_its_own_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let parent = listener.local_addr().unwrap();
        let proxy =
            ProxyForwarder::start(parent, Duration::from_secs(1), Duration::from_secs(60), 2)
                .unwrap();

        assert_eq!(proxy.write(SensorId::new(2), "a", b"even").unwrap(), 4);
        assert_eq!(proxy.write(SensorId::new(3), "b", b"odd!").unwrap(), 4);
        assert_eq!(proxy.connected(), 2);

        let mut got = Vec::new();
        for _ in 0..2 {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).unwrap();
            got.push(buf);
        }
        got.sort_unstable();
        assert_eq!(got, vec![*b"even", *b"odd!"]);

        proxy.stop();
        assert_eq!(proxy.connected(), 0);
    }

    #[test]
    fn unreachable_parent_drops_packets() {
        let parent = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let proxy = ProxyForwarder::start(
            parent,
            Duration::from_millis(200),
            Duration::from_secs(60),
            1,
        )
        .unwrap();

        assert!(proxy.write(SensorId::new(1), "x", b"data").is_err());
        assert!(matches!(
            proxy.write(SensorId::new(1), "x", b"data"),
            Err(SinkError::Unavailable)
        ));
    }

    #[test]
    fn reconnect_thread_revives_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let parent = listener.local_addr().unwrap();
        let proxy =
            ProxyForwarder::start(parent, Duration::from_secs(1), Duration::from_millis(20), 1)
                .unwrap();
        proxy.write(SensorId::new(1), "x", b"a").unwrap();
        proxy.shared.slots[0].lock().stream = None;

        for _ in 0..200 {
            if proxy.connected() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(proxy.connected(), 1);
    }
}
