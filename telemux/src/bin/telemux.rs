//! telemux ingestion daemon.
//!
//! # Usage
//!
//! ```sh
//! telemux --config /etc/telemux.toml --port 8972 --resend
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown (lanes drain before exit)

use std::path::PathBuf;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use telemux::sink::Sinks;
use telemux::{Config, ConfigError, Server, ServerError, init_tracing};

fn main() {
    if let Err(e) = run() {
        eprintln!("telemux: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), ServerError> {
    let args: Vec<String> = std::env::args().collect();
    let Some(config) = parse_args(&args)? else {
        print_usage();
        return Ok(());
    };

    init_tracing();

    // Registered before the server starts so an early signal is not lost.
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(ServerError::Spawn)?;
    let server = Server::start(&config, Sinks::default())?;
    if let Some(addr) = server.local_addr() {
        eprintln!("telemux: listening on {addr}");
    }

    let waiter = std::thread::Builder::new()
        .name("signal-handler".into())
        .spawn(move || signals.forever().next())
        .map_err(ServerError::Spawn)?;
    let signal = waiter.join().ok().flatten();

    eprintln!("telemux: received signal {signal:?}, shutting down");
    server.shutdown();
    eprintln!("telemux: stopped");
    Ok(())
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, ConfigError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::InvalidArgument(format!("missing value for {flag}")))
}

fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::InvalidArgument(format!("invalid value {raw:?} for {flag}")))
}

/// Loads the config file (if any) and applies flag overrides.
///
/// Returns `None` when help was requested.
fn parse_args(args: &[String]) -> Result<Option<Config>, ConfigError> {
    let mut path: Option<PathBuf> = None;
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut lanes: Option<usize> = None;
    let mut resend = false;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" | "-c" => {
                i += 1;
                path = Some(PathBuf::from(value(args, i, flag)?));
            }
            "--host" => {
                i += 1;
                host = Some(value(args, i, flag)?.to_string());
            }
            "--port" | "-p" => {
                i += 1;
                port = Some(number(value(args, i, flag)?, flag)?);
            }
            "--lanes" | "-l" => {
                i += 1;
                lanes = Some(number(value(args, i, flag)?, flag)?);
            }
            "--resend" => resend = true,
            "--help" | "-h" => return Ok(None),
            arg => {
                return Err(ConfigError::InvalidArgument(format!(
                    "unknown argument: {arg}"
                )));
            }
        }
        i += 1;
    }

    let mut config = match path {
        Some(p) => Config::load(&p)?,
        None => Config::default(),
    };
    if let Some(host) = host {
        config.service.host = host;
    }
    if let Some(port) = port {
        config.service.port = port;
    }
    if let Some(lanes) = lanes {
        config.service.lane_count = lanes;
    }
    if resend {
        config.service.resend_enable = true;
    }
    Ok(Some(config))
}

fn print_usage() {
    eprintln!(
        r#"telemux - sensor telemetry ingestion server

USAGE:
    telemux [OPTIONS]

OPTIONS:
    -c, --config <PATH>     TOML configuration file
        --host <HOST>       Listen host (default: 127.0.0.1)
    -p, --port <PORT>       Listen port (default: 8972)
    -l, --lanes <N>         Dispatch lanes, a power of two (default: 8)
        --resend            Enable gap resend requests
    -h, --help              Print this help message

ENVIRONMENT:
    RUST_LOG                Log filter (default: telemux=info)

EXAMPLE:
    telemux -c telemux.toml --port 9000 --resend
"#
    );
}
