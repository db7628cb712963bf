//! TCP sensor simulator.
//!
//! Streams arc frames for one sensor at a fixed cadence. With `--shuffle`
//! adjacent packets are swapped at random to exercise reordering, and resend
//! requests from the server are answered from a bounded history.
//!
//! # Usage
//!
//! ```sh
//! sensor-sim --addr 127.0.0.1:8972 --sensor 00AABBCCDDEE --count 1000 --response --shuffle 0.05
//! ```

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};
use telemux::SensorId;
use telemux::wire::control::{Reply, split_reply};
use telemux::wire::{Flags, FrameBuilder};

/// Frames kept for answering resend requests.
const HISTORY: usize = 20_000;
/// Time to keep answering resends after the last packet.
const LINGER: Duration = Duration::from_secs(2);

struct Args {
    addr: String,
    sensor: SensorId,
    count: u64,
    start: u64,
    interval: Duration,
    rate: u32,
    shuffle: f64,
    response: bool,
}

#[derive(Default)]
struct Counters {
    acks: AtomicU64,
    resends: AtomicU64,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("sensor-sim: {e}");
        std::process::exit(1);
    }
}

fn run() -> io::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(args) = parse_args(&args)? else {
        print_usage();
        return Ok(());
    };

    let mut stream = TcpStream::connect(&args.addr)?;
    stream.set_nodelay(true)?;
    eprintln!("sensor-sim: connected to {} as {}", args.addr, args.sensor);

    let counters = Arc::new(Counters::default());
    let (req_tx, req_rx) = unbounded();
    let mut reader = stream.try_clone()?;
    let reader_counters = Arc::clone(&counters);
    let sensor = args.sensor;
    thread::Builder::new()
        .name("sim-reader".into())
        .spawn(move || {
            let mut buf = Vec::with_capacity(4096);
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
                while let Some((reply, used)) = split_reply(&buf) {
                    buf.drain(..used);
                    match reply {
                        Reply::Ack(_) => {
                            reader_counters.acks.fetch_add(1, Ordering::Relaxed);
                        }
                        Reply::Resend { sensor: id, sequence } if id == sensor => {
                            reader_counters.resends.fetch_add(1, Ordering::Relaxed);
                            if req_tx.send(sequence).is_err() {
                                return;
                            }
                        }
                        Reply::Resend { .. } => {}
                    }
                }
            }
        })?;

    let mut history = History::default();
    let mut held: Option<Vec<u8>> = None;
    let samples = (u64::from(args.rate) * args.interval.as_micros() as u64 / 1_000_000) as usize;
    let flags = if args.response { Flags::RESPONSE } else { 0 };

    for seq in args.start..args.start + args.count {
        let last = seq + 1 == args.start + args.count;
        let frame = FrameBuilder::new(args.sensor)
            .sequence(seq)
            .flags(if last { flags | Flags::END_OF_STREAM } else { flags })
            .arc(args.rate, &waveform(seq, samples))
            .build();
        history.push(seq, frame.clone());

        match held.take() {
            Some(earlier) => {
                // Swapped pair: the later packet goes first.
                stream.write_all(&frame)?;
                stream.write_all(&earlier)?;
            }
            None if !last && args.shuffle > 0.0 && rand::random_bool(args.shuffle) => {
                held = Some(frame);
            }
            None => stream.write_all(&frame)?,
        }

        answer_resends(&mut stream, &req_rx, &history)?;
        thread::sleep(args.interval);
    }

    let deadline = std::time::Instant::now() + LINGER;
    while std::time::Instant::now() < deadline {
        answer_resends(&mut stream, &req_rx, &history)?;
        thread::sleep(Duration::from_millis(10));
    }

    eprintln!(
        "sensor-sim: sent {} packets, {} acks, {} resend requests",
        args.count,
        counters.acks.load(Ordering::Relaxed),
        counters.resends.load(Ordering::Relaxed)
    );
    Ok(())
}

#[derive(Default)]
struct History {
    frames: HashMap<u64, Vec<u8>>,
    order: VecDeque<u64>,
}

impl History {
    fn push(&mut self, seq: u64, frame: Vec<u8>) {
        if self.order.len() == HISTORY
            && let Some(old) = self.order.pop_front()
        {
            self.frames.remove(&old);
        }
        self.order.push_back(seq);
        self.frames.insert(seq, frame);
    }

    fn get(&self, seq: u64) -> Option<&[u8]> {
        self.frames.get(&seq).map(Vec::as_slice)
    }
}

fn answer_resends(
    stream: &mut TcpStream,
    requests: &Receiver<u64>,
    history: &History,
) -> io::Result<()> {
    for seq in requests.try_iter() {
        match history.get(seq) {
            Some(frame) => stream.write_all(frame)?,
            None => eprintln!("sensor-sim: resend for {seq} no longer in history"),
        }
    }
    Ok(())
}

/// Deterministic test tone, phase-continuous across packets.
fn waveform(seq: u64, samples: usize) -> Vec<i16> {
    let base = seq as usize * samples;
    (0..samples)
        .map(|i| {
            let t = (base + i) as f64 / 32.0;
            (t.sin() * 8_000.0) as i16
        })
        .collect()
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn parse_args(args: &[String]) -> io::Result<Option<Args>> {
    let mut out = Args {
        addr: "127.0.0.1:8972".to_string(),
        sensor: SensorId::new(1),
        count: 1_000,
        start: 1,
        interval: Duration::from_millis(10),
        rate: 16_000,
        shuffle: 0.0,
        response: false,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut next = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| invalid(format!("missing value for {flag}")))
        };
        match flag {
            "--addr" | "-a" => out.addr = next()?,
            "--sensor" | "-s" => {
                let raw = next()?;
                let id = u64::from_str_radix(&raw, 16)
                    .map_err(|e| invalid(format!("invalid sensor id {raw:?}: {e}")))?;
                out.sensor = SensorId::new(id);
            }
            "--count" | "-n" => out.count = parse(&next()?, flag)?,
            "--start" => out.start = parse(&next()?, flag)?,
            "--interval-ms" => out.interval = Duration::from_millis(parse(&next()?, flag)?),
            "--rate" => out.rate = parse(&next()?, flag)?,
            "--shuffle" => out.shuffle = parse::<f64>(&next()?, flag)?.clamp(0.0, 1.0),
            "--response" => out.response = true,
            "--help" | "-h" => return Ok(None),
            arg => return Err(invalid(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }
    if out.rate == 0 {
        return Err(invalid("--rate must be positive".into()));
    }
    Ok(Some(out))
}

fn parse<T: std::str::FromStr>(raw: &str, flag: &str) -> io::Result<T> {
    raw.parse()
        .map_err(|_| invalid(format!("invalid value {raw:?} for {flag}")))
}

fn print_usage() {
    eprintln!(
        r#"sensor-sim - telemux sensor simulator

USAGE:
    sensor-sim [OPTIONS]

OPTIONS:
    -a, --addr <ADDR>        Server address (default: 127.0.0.1:8972)
    -s, --sensor <HEX>       48-bit sensor id in hex (default: 1)
    -n, --count <N>          Packets to send (default: 1000)
        --start <SEQ>        First sequence number (default: 1)
        --interval-ms <MS>   Packet interval (default: 10)
        --rate <HZ>          Arc sample rate (default: 16000)
        --shuffle <P>        Probability of swapping a packet with the next
        --response           Set the response flag (acks and resends)
    -h, --help               Print this help message
"#
    );
}
