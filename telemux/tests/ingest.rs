//! End-to-end ingestion over real TCP sockets.
//!
//! A server is started on an ephemeral port, a fake sensor writes frames
//! with a blocking `TcpStream`, and a recording gRPC sink observes what
//! leaves the lanes.
//!
//! ```bash
//! RUST_LOG=telemux=debug cargo test --test ingest -- --nocapture
//! ```

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serial_test::serial;

use telemux::config::ConfigError;
use telemux::engine::AlignKind;
use telemux::sink::{GrpcForward, SinkError, Sinks};
use telemux::wire::control::{Reply, split_reply};
use telemux::wire::{Flags, FrameBuilder, RawHeader};
use telemux::{Config, SensorId, Server, ServerError};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        telemux::init_tracing();
    });
}

/// gRPC sink that records `(sensor, sequence)` in delivery order.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(SensorId, u64)>>,
    mask: Mutex<Option<u64>>,
}

impl GrpcForward for Recorder {
    fn set_shard_mask(&self, mask: u64) {
        *self.mask.lock() = Some(mask);
    }

    fn write(&self, sensor: SensorId, _label: &str, raw: &[u8]) -> Result<(), SinkError> {
        let seq = RawHeader::new(raw)
            .map_err(|e| SinkError::Rejected(e.to_string()))?
            .sequence();
        self.seen.lock().push((sensor, seq));
        Ok(())
    }
}

impl Recorder {
    fn sequences(&self, sensor: SensorId) -> Vec<u64> {
        self.seen
            .lock()
            .iter()
            .filter(|(id, _)| *id == sensor)
            .map(|(_, seq)| *seq)
            .collect()
    }
}

fn config(resend: bool) -> Config {
    let mut config = Config::default();
    config.service.port = 0;
    config.service.lane_count = 4;
    config.service.event_loops = 2;
    config.service.resend_enable = resend;
    config
}

fn start(config: &Config) -> (Server, Arc<Recorder>) {
    init_test_tracing();
    let recorder = Arc::new(Recorder::default());
    let sinks = Sinks {
        grpc: Some(recorder.clone()),
        ..Sinks::default()
    };
    let server = Server::start(config, sinks).expect("server starts");
    (server, recorder)
}

fn connect(server: &Server) -> TcpStream {
    let addr = server.local_addr().expect("listening").as_socket_addr();
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

fn frame(sensor: SensorId, seq: u64, flags: u8) -> Vec<u8> {
    FrameBuilder::new(sensor)
        .sequence(seq)
        .flags(flags)
        .arc(16_000, &[7; 16])
        .build()
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Reads and splits exactly `len` bytes of replies.
fn read_replies(stream: &mut TcpStream, len: usize) -> Vec<Reply> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("replies");
    let mut replies = Vec::new();
    let mut rest = &buf[..];
    while let Some((reply, used)) = split_reply(rest) {
        replies.push(reply);
        rest = &rest[used..];
    }
    assert!(rest.is_empty(), "trailing reply bytes: {rest:?}");
    replies
}

#[test]
#[serial]
fn swapped_packets_are_resent_and_reordered() {
    let (server, recorder) = start(&config(true));
    let sensor = SensorId::new(0x0000_0000_0001);
    let mut stream = connect(&server);

    for seq in [1, 3, 2, 4] {
        stream
            .write_all(&frame(sensor, seq, Flags::RESPONSE))
            .expect("write");
    }

    // ack 1, resend 2 (in place of an ack for 3), ack 2, ack 4
    let replies = read_replies(&mut stream, 8 + 19 + 8 + 8);
    assert_eq!(
        replies,
        vec![
            Reply::Ack(1),
            Reply::Resend { sensor, sequence: 2 },
            Reply::Ack(2),
            Reply::Ack(4),
        ]
    );

    wait_until("four deliveries", || recorder.sequences(sensor).len() == 4);
    assert_eq!(recorder.sequences(sensor), vec![1, 2, 3, 4]);
    assert_eq!(*recorder.mask.lock(), Some(3));

    let stats = server.stats();
    assert_eq!(stats.resend_requests, 1);
    assert_eq!(stats.resend_success, 1);
    assert_eq!(stats.dispatched, 4);

    let session = server.sensor(sensor).expect("session");
    assert!(session.holding);
    assert_eq!(session.last_sequence, 4);
    assert_eq!(session.pending_resend, None);

    server.shutdown();
}

#[test]
#[serial]
fn duplicate_retransmission_is_acked_once_and_not_redelivered() {
    let (server, recorder) = start(&config(true));
    let sensor = SensorId::new(0x00AB_CDEF_0102);
    let mut stream = connect(&server);

    stream.write_all(&frame(sensor, 9, Flags::RESPONSE)).expect("write");
    stream.write_all(&frame(sensor, 9, Flags::RESPONSE)).expect("write");
    assert_eq!(read_replies(&mut stream, 16), vec![Reply::Ack(9), Reply::Ack(9)]);

    wait_until("delivery", || !recorder.sequences(sensor).is_empty());
    server.shutdown();
    assert_eq!(recorder.sequences(sensor), vec![9]);
}

#[test]
#[serial]
fn late_retransmission_after_drain_is_acked_not_redelivered() {
    let (server, recorder) = start(&config(true));
    let sensor = SensorId::new(0x0000_0000_0D0D);
    let mut stream = connect(&server);

    for seq in [1, 3, 4, 2, 3, 5] {
        stream
            .write_all(&frame(sensor, seq, Flags::RESPONSE))
            .expect("write");
    }

    // 4 is held silently; 2 drains 3 and 4; the second 3 is already delivered
    let replies = read_replies(&mut stream, 8 + 19 + 8 + 8 + 8);
    assert_eq!(
        replies,
        vec![
            Reply::Ack(1),
            Reply::Resend { sensor, sequence: 2 },
            Reply::Ack(2),
            Reply::Ack(3),
            Reply::Ack(5),
        ]
    );

    wait_until("five deliveries", || recorder.sequences(sensor).len() == 5);
    assert_eq!(recorder.sequences(sensor), vec![1, 2, 3, 4, 5]);

    let stats = server.stats();
    assert_eq!(stats.resend_requests, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.dispatched, 5);

    let session = server.sensor(sensor).expect("session");
    assert_eq!(session.last_sequence, 5);
    assert_eq!(session.pending_resend, None);

    server.shutdown();
}

#[test]
#[serial]
fn aligned_sessions_are_released_on_disconnect() {
    let (server, recorder) = start(&config(false));
    let sensor = SensorId::new(0x0000_0000_0BAD);
    {
        let mut stream = connect(&server);
        for seq in 3..=7 {
            stream.write_all(&frame(sensor, seq, 0)).expect("write");
        }
        wait_until("five deliveries", || recorder.sequences(sensor).len() == 5);

        let aligned = server.alignment(sensor).expect("alignment published");
        assert_eq!(aligned.sequence, 7);
        assert_eq!(server.sensors(), vec![sensor]);
        assert_eq!(server.online(), vec![sensor]);
        let counts = server.stats().align;
        assert_eq!(counts.reset, 1);
        assert_eq!(counts.align + counts.corr + counts.drop, 4);
        assert_ne!(aligned.kind, AlignKind::Broken);
    }

    // Non-holding sessions go away with their connection.
    wait_until("session release", || server.sensors().is_empty());
    wait_until("alignment release", || server.alignment(sensor).is_none());
    server.shutdown();
}

#[test]
#[serial]
fn startup_noise_and_garbage_are_filtered() {
    let (server, recorder) = start(&config(false));
    let sensor = SensorId::new(0x0000_0000_0042);
    let mut stream = connect(&server);

    stream.write_all(&frame(sensor, 1, 0)).expect("write");
    stream.write_all(&frame(sensor, 2, 0)).expect("write");
    stream.write_all(b"not a frame at all").expect("write");
    stream.write_all(&frame(sensor, 3, Flags::RESPONSE)).expect("write");

    // The connection survives the garbage.
    assert_eq!(read_replies(&mut stream, 8), vec![Reply::Ack(3)]);
    wait_until("delivery", || !recorder.sequences(sensor).is_empty());

    let stats = server.stats();
    assert_eq!(stats.startup_drops, 2);
    assert!(stats.malformed >= 1);
    assert_eq!(recorder.sequences(sensor), vec![3]);
    server.shutdown();
}

#[test]
#[serial]
fn file_sink_records_pcm() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(false);
    config.file.enable = true;
    config.file.dir = dir.path().to_path_buf();

    let (server, recorder) = start(&config);
    let sensor = SensorId::new(0x0012_3456_789A);
    let mut stream = connect(&server);
    for seq in 10..13 {
        stream.write_all(&frame(sensor, seq, 0)).expect("write");
    }
    wait_until("deliveries", || recorder.sequences(sensor).len() == 3);
    drop(stream);
    server.shutdown();

    let pcm = std::fs::read(dir.path().join("00123456789A.pcm")).expect("pcm file");
    assert_eq!(pcm.len(), 3 * 16 * 2);
    assert_eq!(&pcm[..2], &7i16.to_le_bytes());
}

#[test]
#[serial]
fn invalid_lane_count_fails_before_listening() {
    init_test_tracing();
    let mut config = config(true);
    config.service.lane_count = 6;

    let result = Server::start(&config, Sinks::default());
    assert!(matches!(
        result,
        Err(ServerError::Config(ConfigError::InvalidLaneCount(6)))
    ));
}
