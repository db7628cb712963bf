//! Service configuration.
//!
//! Loaded from a TOML file with a `[service]` table and optional `[proxy]`
//! and `[file]` tables. Every field has a default, so an empty file is a
//! valid configuration.
//!
//! ```toml
//! [service]
//! host = "0.0.0.0"
//! port = 8972
//! lane_count = 8
//! resend_enable = true
//! offset_threshold = 1000   # ms
//!
//! [proxy]
//! enable = true
//! parent = "10.0.0.5:9000"
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Micros;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("lane count must be a power of two greater than 0, got {0}")]
    InvalidLaneCount(usize),
    #[error("unsupported net type {0:?} (only \"tcp\")")]
    UnsupportedNetType(String),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("{0}")]
    InvalidArgument(String),
}

/// Full configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub file: FileConfig,
}

impl Config {
    /// Loads and parses a TOML file. Does not validate.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parses TOML text.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML or mistyped fields.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Checks values that cannot be expressed in the type system.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service.validate()?;
        if self.proxy.enable {
            self.proxy.parent_addr()?;
        }
        Ok(())
    }
}

/// `[service]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_net_type")]
    pub net_type: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// TCP keepalive idle time in milliseconds; 0 disables keepalive.
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    /// Number of dispatch lanes. Must be a power of two.
    #[serde(default = "default_lane_count", alias = "goroutine_count")]
    pub lane_count: usize,
    /// Network event loops; 0 picks `cores / 2 + 1`.
    #[serde(default)]
    pub event_loops: usize,
    #[serde(default)]
    pub resend_enable: bool,
    /// Alignment deviation threshold in milliseconds; `<= 0` disables it.
    #[serde(default = "default_offset_threshold")]
    pub offset_threshold: i64,
    #[serde(default = "default_true")]
    pub enable_crc_check: bool,
    /// Forward to the proxy after alignment instead of before decoding.
    #[serde(default = "default_true")]
    pub proxy_timealign: bool,
    /// Pin lane workers to cores.
    #[serde(default)]
    pub pin_lanes: bool,
}

fn default_net_type() -> String {
    "tcp".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8972
}

const fn default_keepalive() -> u64 {
    60_000
}

const fn default_lane_count() -> usize {
    8
}

const fn default_offset_threshold() -> i64 {
    1_000
}

const fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            net_type: default_net_type(),
            host: default_host(),
            port: default_port(),
            keepalive: default_keepalive(),
            lane_count: default_lane_count(),
            event_loops: 0,
            resend_enable: false,
            offset_threshold: default_offset_threshold(),
            enable_crc_check: true,
            proxy_timealign: true,
            pin_lanes: false,
        }
    }
}

impl ServiceConfig {
    /// # Errors
    ///
    /// Lane count not a power of two, unsupported net type or bad address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.lane_count.is_power_of_two() {
            return Err(ConfigError::InvalidLaneCount(self.lane_count));
        }
        if self.net_type != "tcp" {
            return Err(ConfigError::UnsupportedNetType(self.net_type.clone()));
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Resolves `host:port`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidAddress`] if the host does not resolve.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(&format!("{}:{}", self.host, self.port))
    }

    /// Lane mask, `lane_count - 1`. Only meaningful after validation.
    #[must_use]
    pub const fn lane_mask(&self) -> u64 {
        self.lane_count.saturating_sub(1) as u64
    }

    #[must_use]
    pub fn event_loop_count(&self) -> usize {
        if self.event_loops > 0 {
            return self.event_loops;
        }
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
        cores / 2 + 1
    }

    /// Alignment threshold in microseconds.
    #[must_use]
    pub const fn offset_threshold_micros(&self) -> Micros {
        self.offset_threshold.saturating_mul(1_000)
    }

    #[must_use]
    pub const fn keepalive(&self) -> Option<Duration> {
        if self.keepalive == 0 {
            None
        } else {
            Some(Duration::from_millis(self.keepalive))
        }
    }
}

/// `[proxy]` table: raw-TCP forwarding to an upstream collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_parent")]
    pub parent: String,
    /// Connect and write timeout in milliseconds.
    #[serde(default = "default_proxy_timeout")]
    pub timeout: u64,
    /// Reconnect interval in milliseconds.
    #[serde(default = "default_proxy_interval")]
    pub interval: u64,
}

fn default_parent() -> String {
    "127.0.0.1:9000".to_string()
}

const fn default_proxy_timeout() -> u64 {
    1_000
}

const fn default_proxy_interval() -> u64 {
    1_000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enable: false,
            parent: default_parent(),
            timeout: default_proxy_timeout(),
            interval: default_proxy_interval(),
        }
    }
}

impl ProxyConfig {
    /// # Errors
    ///
    /// [`ConfigError::InvalidAddress`] if `parent` does not resolve.
    pub fn parent_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(&self.parent)
    }
}

/// `[file]` table: raw PCM recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_dir", alias = "dirent")]
    pub dir: PathBuf,
}

fn default_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            enable: false,
            dir: default_dir(),
        }
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.service.net_type, "tcp");
        assert_eq!(cfg.service.port, 8972);
        assert_eq!(cfg.service.lane_count, 8);
        assert_eq!(cfg.service.keepalive, 60_000);
        assert!(!cfg.service.resend_enable);
        assert!(cfg.service.enable_crc_check);
        assert!(cfg.service.proxy_timealign);
        assert_eq!(cfg.service.offset_threshold_micros(), 1_000_000);
        assert!(!cfg.proxy.enable);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_service_table() {
        let cfg = Config::from_toml(
            r#"
            [service]
            host = "0.0.0.0"
            port = 9100
            goroutine_count = 16
            resend_enable = true
            offset_threshold = 0
            enable_crc_check = false

            [file]
            enable = true
            dirent = "/tmp/pcm"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.service.lane_count, 16);
        assert_eq!(cfg.service.lane_mask(), 15);
        assert!(cfg.service.resend_enable);
        assert_eq!(cfg.service.offset_threshold_micros(), 0);
        assert!(!cfg.service.enable_crc_check);
        assert_eq!(cfg.service.listen_addr().unwrap().port(), 9100);
        assert_eq!(cfg.file.dir, PathBuf::from("/tmp/pcm"));
    }

    #[test]
    fn lane_count_must_be_power_of_two() {
        for bad in [0, 3, 6, 12] {
            let mut cfg = Config::default();
            cfg.service.lane_count = bad;
            assert!(
                matches!(cfg.validate(), Err(ConfigError::InvalidLaneCount(n)) if n == bad),
                "lane count {bad} accepted"
            );
        }
        for good in [1, 2, 8, 64] {
            let mut cfg = Config::default();
            cfg.service.lane_count = good;
            assert!(cfg.validate().is_ok());
        }
    }

    #[test]
    fn only_tcp_is_supported() {
        let mut cfg = Config::default();
        cfg.service.net_type = "udp".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnsupportedNetType(t)) if t == "udp"
        ));
    }

    #[test]
    fn keepalive_zero_disables() {
        let mut cfg = ServiceConfig::default();
        assert_eq!(cfg.keepalive(), Some(Duration::from_secs(60)));
        cfg.keepalive = 0;
        assert_eq!(cfg.keepalive(), None);
    }

    #[test]
    fn mistyped_field_is_a_parse_error() {
        assert!(matches!(
            Config::from_toml("[service]\nport = \"high\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/telemux.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
