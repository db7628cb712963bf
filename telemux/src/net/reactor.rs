//! TCP reactor: accept thread plus N event loops.
//!
//! ```text
//!                     ┌──────────────┐  round-robin   ┌──────────────────┐
//!   listener ───────> │ accept thread│ ─────────────> │ telemux-loop-0..N│ ──> EventHandler
//!                     └──────────────┘  (chan + wake) └──────────────────┘
//! ```
//!
//! Every connection lives on exactly one loop, so all callbacks for a given
//! connection are serialized. Loop 0 additionally drives the periodic tick.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::trace::{debug, error, info, warn};
use crate::wire::control::Outbound;
use crate::wire::{FrameCodec, FrameError};

use super::{Endpoint, TcpListener, TcpStream};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
/// First token handed to a connection.
const FIRST_CONN: usize = 2;

const READ_BUF_SIZE: usize = 64 * 1024;
/// Pending replies above this mean the peer stopped reading.
const MAX_OUTBOX: usize = 1024 * 1024;
/// Accepted connections waiting for their loop.
const HANDOFF_CAPACITY: usize = 1024;
/// First tick after startup.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    pub peer: Endpoint,
    /// Event loop owning the connection.
    pub loop_index: usize,
    pub token: usize,
}

/// Connection callbacks.
///
/// Calls for one connection never overlap; calls for different connections
/// may run concurrently on different loops.
pub trait EventHandler: Send + Sync + 'static {
    fn on_open(&self, _conn: &ConnInfo) {}

    fn on_close(&self, _conn: &ConnInfo) {}

    /// A complete frame arrived. The returned reply is written back.
    fn on_frame(&self, conn: &ConnInfo, frame: Vec<u8>) -> Option<Outbound>;

    /// The codec rejected input; the bad bytes were already skipped.
    fn on_malformed(&self, _conn: &ConnInfo, _err: &FrameError) {}

    /// Periodic callback; returns the delay until the next one.
    fn on_tick(&self) -> Duration {
        DEFAULT_TICK
    }
}

/// Reactor settings.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub addr: SocketAddr,
    pub event_loops: usize,
    pub keepalive: Option<Duration>,
    pub verify_checksum: bool,
}

struct Handoff {
    stream: TcpStream,
    peer: Endpoint,
}

/// Handle to the running reactor threads.
///
/// Dropping the handle signals shutdown without waiting; use
/// [`Reactor::shutdown`] to join.
pub struct Reactor {
    shutdown: Arc<AtomicBool>,
    wakers: Vec<Arc<Waker>>,
    handles: Vec<JoinHandle<()>>,
    local_addr: Endpoint,
}

impl Reactor {
    /// Binds the listener and spawns the accept and loop threads.
    ///
    /// # Errors
    ///
    /// Returns an error if binding, poll setup or thread spawning fails.
    pub fn spawn<H: EventHandler>(config: &ReactorConfig, handler: Arc<H>) -> io::Result<Self> {
        let mut listener = TcpListener::bind(Endpoint::from(config.addr))?;
        let local_addr = listener.local_addr()?;
        let loops = config.event_loops.max(1);

        let mut reactor = Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            wakers: Vec::with_capacity(loops + 1),
            handles: Vec::with_capacity(loops + 1),
            local_addr,
        };

        let mut outlets = Vec::with_capacity(loops);
        for index in 0..loops {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
            let (tx, rx) = bounded(HANDOFF_CAPACITY);
            reactor.wakers.push(Arc::clone(&waker));
            outlets.push((tx, waker));

            let event_loop = EventLoop {
                index,
                poll,
                inbox: rx,
                conns: HashMap::new(),
                next_token: FIRST_CONN,
                handler: Arc::clone(&handler),
                shutdown: Arc::clone(&reactor.shutdown),
                verify_checksum: config.verify_checksum,
                read_buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
            };
            let handle = thread::Builder::new()
                .name(format!("telemux-loop-{index}"))
                .spawn(move || {
                    debug!(index, "event loop started");
                    event_loop.run();
                    debug!(index, "event loop exiting");
                })?;
            reactor.handles.push(handle);
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        reactor.wakers.push(waker);

        let acceptor = AcceptLoop {
            poll,
            listener,
            outlets,
            next: 0,
            keepalive: config.keepalive,
            shutdown: Arc::clone(&reactor.shutdown),
        };
        let handle = thread::Builder::new()
            .name("telemux-accept".into())
            .spawn(move || {
                acceptor.run();
                debug!("accept thread exiting");
            })?;
        reactor.handles.push(handle);

        info!(addr = %local_addr, event_loops = loops, "listening");
        Ok(reactor)
    }

    #[must_use]
    pub const fn local_addr(&self) -> Endpoint {
        self.local_addr
    }

    fn signal(&self) {
        self.shutdown.store(true, Ordering::Release);
        for waker in &self.wakers {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "failed to wake reactor thread");
            }
        }
    }

    /// Stops accepting, closes every connection and joins all threads.
    pub fn shutdown(mut self) {
        self.signal();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("reactor thread panicked");
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.signal();
        }
    }
}

struct AcceptLoop {
    poll: Poll,
    listener: TcpListener,
    outlets: Vec<(Sender<Handoff>, Arc<Waker>)>,
    next: usize,
    keepalive: Option<Duration>,
    shutdown: Arc<AtomicBool>,
}

impl AcceptLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "accept poll failed");
                return;
            }
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            if events.iter().any(|e| e.token() == LISTENER) {
                self.accept_pending();
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let (stream, peer) = match self.listener.try_accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };
            if let Err(e) = stream.configure(self.keepalive) {
                warn!(peer = %peer, error = %e, "failed to set socket options");
            }

            let (tx, waker) = &self.outlets[self.next % self.outlets.len()];
            self.next = self.next.wrapping_add(1);
            if tx.send(Handoff { stream, peer }).is_err() {
                // Loop already gone: shutting down.
                return;
            }
            if let Err(e) = waker.wake() {
                warn!(error = %e, "failed to wake event loop");
            }
        }
    }
}

struct Conn {
    stream: TcpStream,
    info: ConnInfo,
    codec: FrameCodec,
    outbox: Vec<u8>,
    writable: bool,
}

struct EventLoop<H> {
    index: usize,
    poll: Poll,
    inbox: Receiver<Handoff>,
    conns: HashMap<Token, Conn>,
    next_token: usize,
    handler: Arc<H>,
    shutdown: Arc<AtomicBool>,
    verify_checksum: bool,
    read_buf: Box<[u8]>,
}

impl<H: EventHandler> EventLoop<H> {
    fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        let mut next_tick = (self.index == 0).then(|| Instant::now() + DEFAULT_TICK);

        loop {
            let timeout = next_tick.map(|t| t.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(index = self.index, error = %e, "event loop poll failed");
                break;
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            for event in &events {
                match event.token() {
                    WAKER => self.register_pending(),
                    token => {
                        let readable = event.is_readable() || event.is_read_closed();
                        let closed = self.service(token, readable, event.is_writable());
                        if closed {
                            self.close(token);
                        }
                    }
                }
            }

            if let Some(at) = next_tick
                && Instant::now() >= at
            {
                next_tick = Some(Instant::now() + self.handler.on_tick());
            }
        }

        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.close(token);
        }
    }

    fn register_pending(&mut self) {
        while let Ok(Handoff { mut stream, peer }) = self.inbox.try_recv() {
            let token = Token(self.next_token);
            self.next_token += 1;
            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                warn!(peer = %peer, error = %e, "failed to register connection");
                continue;
            }
            let info = ConnInfo {
                peer,
                loop_index: self.index,
                token: token.0,
            };
            self.handler.on_open(&info);
            self.conns.insert(
                token,
                Conn {
                    stream,
                    info,
                    codec: FrameCodec::new(self.verify_checksum),
                    outbox: Vec::new(),
                    writable: false,
                },
            );
        }
    }

    /// Handles readiness for one connection. Returns true if it must close.
    fn service(&mut self, token: Token, readable: bool, writable: bool) -> bool {
        let Some(conn) = self.conns.get_mut(&token) else {
            return false;
        };
        let mut closed = false;

        if readable {
            loop {
                match conn.stream.read(&mut self.read_buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.codec.feed(&self.read_buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!(peer = %conn.info.peer, error = %e, "read failed");
                        closed = true;
                        break;
                    }
                }
            }

            // Frames that arrived before EOF still count.
            while let Some(next) = conn.codec.next_frame() {
                match next {
                    Ok(frame) => {
                        if let Some(reply) = self.handler.on_frame(&conn.info, frame) {
                            conn.outbox.extend_from_slice(reply.as_bytes());
                        }
                    }
                    Err(e) => self.handler.on_malformed(&conn.info, &e),
                }
            }
        }

        if closed {
            return true;
        }

        if (writable || !conn.outbox.is_empty()) && flush(conn) {
            return true;
        }
        if conn.outbox.len() > MAX_OUTBOX {
            warn!(peer = %conn.info.peer, pending = conn.outbox.len(), "peer not reading replies");
            return true;
        }

        let want_write = !conn.outbox.is_empty();
        if want_write != conn.writable {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if let Err(e) = self
                .poll
                .registry()
                .reregister(&mut conn.stream, token, interest)
            {
                warn!(peer = %conn.info.peer, error = %e, "failed to update interest");
                return true;
            }
            conn.writable = want_write;
        }
        false
    }

    fn close(&mut self, token: Token) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut conn.stream);
        conn.stream.shutdown();
        self.handler.on_close(&conn.info);
    }
}

/// Writes as much of the outbox as the socket takes. Returns true on a
/// fatal write error.
fn flush(conn: &mut Conn) -> bool {
    while !conn.outbox.is_empty() {
        match conn.stream.write(&conn.outbox) {
            Ok(0) => return true,
            Ok(n) => {
                conn.outbox.drain(..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(peer = %conn.info.peer, error = %e, "write failed");
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    use parking_lot::Mutex;

    use super::*;
    use crate::types::SensorId;
    use crate::wire::FrameBuilder;
    use crate::wire::control::ACK_LEN;

    #[derive(Default)]
    struct Echo {
        events: Mutex<Vec<String>>,
    }

    impl EventHandler for Echo {
        fn on_open(&self, _conn: &ConnInfo) {
            self.events.lock().push("open".into());
        }

        fn on_close(&self, _conn: &ConnInfo) {
            self.events.lock().push("close".into());
        }

        fn on_frame(&self, _conn: &ConnInfo, frame: Vec<u8>) -> Option<Outbound> {
            let seq = crate::wire::RawHeader::new(&frame).ok()?.sequence();
            self.events.lock().push(format!("frame {seq}"));
            Some(Outbound::ack(seq))
        }

        fn on_malformed(&self, _conn: &ConnInfo, _err: &FrameError) {
            self.events.lock().push("malformed".into());
        }
    }

    fn wait_for(handler: &Echo, pred: impl Fn(&[String]) -> bool) {
        for _ in 0..400 {
            if pred(&handler.events.lock()) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out; events: {:?}", handler.events.lock());
    }

    #[test]
    fn frames_are_acked_and_close_is_reported() {
        let handler = Arc::new(Echo::default());
        let config = ReactorConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            event_loops: 2,
            keepalive: None,
            verify_checksum: true,
        };
        let reactor = Reactor::spawn(&config, Arc::clone(&handler)).unwrap();

        let mut client = StdTcpStream::connect(reactor.local_addr().as_socket_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut stream = vec![0xEE, 0xEE];
        for seq in [7, 8] {
            stream.extend(
                FrameBuilder::new(SensorId::new(1))
                    .sequence(seq)
                    .arc(8_000, &[0; 8])
                    .build(),
            );
        }
        client.write_all(&stream).unwrap();

        let mut acks = [0u8; 2 * ACK_LEN];
        client.read_exact(&mut acks).unwrap();
        assert_eq!(&acks[..ACK_LEN], &7u64.to_be_bytes());
        assert_eq!(&acks[ACK_LEN..], &8u64.to_be_bytes());

        drop(client);
        wait_for(&handler, |ev| ev.iter().any(|e| e == "close"));
        assert_eq!(
            *handler.events.lock(),
            vec!["open", "malformed", "frame 7", "frame 8", "close"]
        );

        reactor.shutdown();
    }

    #[test]
    fn shutdown_closes_open_connections() {
        let handler = Arc::new(Echo::default());
        let config = ReactorConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            event_loops: 1,
            keepalive: Some(Duration::from_secs(30)),
            verify_checksum: false,
        };
        let reactor = Reactor::spawn(&config, Arc::clone(&handler)).unwrap();
        let _client = StdTcpStream::connect(reactor.local_addr().as_socket_addr()).unwrap();
        wait_for(&handler, |ev| ev.iter().any(|e| e == "open"));

        reactor.shutdown();
        assert_eq!(*handler.events.lock(), vec!["open", "close"]);
    }
}
