//! Configuration loading for relay-tunnel-node.
//!
//! Configuration is loaded from a TOML file (default: `node.toml`).

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tunnel_core::{ReassemblyOptions, ReconnectPolicy, RttOptions};
use tunnel_types::DeviceId;

/// Root configuration for relay-tunnel-node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identity of this device.
    pub device: DeviceConfig,
    /// Relay connection.
    pub uplink: UplinkConfig,
    /// Per-connection defaults.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flow window and RTT estimator tuning.
    #[serde(default)]
    pub window: WindowConfig,
    /// Reassembly buffer limits.
    #[serde(default)]
    pub reassembly: ReassemblyConfig,
    /// Retransmission scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Local services forwarded to peer devices.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Device identity.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Device id assigned by the relay (UUID).
    pub id: DeviceId,
}

/// Relay connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    /// WebSocket URL of the relay (`ws://host:port/path`).
    pub url: String,
    /// Token sent in the `Authorization` header.
    #[serde(default)]
    pub api_token: String,
    /// Upper bound for the reconnect backoff (default: 5000 ms).
    #[serde(default = "default_max_reconnect_interval_ms")]
    pub max_reconnect_interval_ms: u64,
    /// Consecutive failed reconnects before giving up (default: 0 = never).
    #[serde(default)]
    pub reconnect_retries: u32,
    /// Capacity of the inbound envelope queue (default: 1000).
    #[serde(default = "default_receive_queue_size")]
    pub receive_queue_size: usize,
    /// Timeout for a single frame write (default: 10000 ms).
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

/// Per-connection defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Resend interval for Open/Accept (default: 1000 ms).
    #[serde(default = "default_response_interval_ms")]
    pub response_interval_ms: u64,
    /// Local socket read timeout (default: 1000 ms).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Egress throughput limit in bytes/second (default: 0 = unlimited).
    #[serde(default)]
    pub throughput_limit: u64,
    /// Bytes read from the local socket per segment (default: 4096).
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Flow window capacity in bytes (default: 128 KiB, also used for 0).
    #[serde(default = "default_ack_window_size")]
    pub ack_window_size: usize,
    /// Confirm interval until traffic flows (default: 1000 ms).
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Timeout for dialing the remote service (default: 5000 ms).
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Data envelopes queued for the ingress pump (default: 1024).
    #[serde(default = "default_ingress_queue_size")]
    pub ingress_queue_size: usize,
    /// Session cipher offered on outbound connections.
    #[serde(default = "default_cipher")]
    pub cipher: String,
    /// Key agreement curve offered on outbound connections.
    #[serde(default = "default_curve")]
    pub curve: String,
}

/// Flow window and RTT estimator tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// RTO before the first sample (default: 100 ms).
    #[serde(default = "default_initial_rto_ms")]
    pub initial_rto_ms: u64,
    /// Lower RTO bound (default: 50 ms).
    #[serde(default = "default_min_rto_ms")]
    pub min_rto_ms: u64,
    /// Upper RTO bound (default: 500 ms).
    #[serde(default = "default_max_rto_ms")]
    pub max_rto_ms: u64,
    /// Variance multiplier (default: 10).
    #[serde(default = "default_k")]
    pub k: f64,
    /// SRTT smoothing factor (default: 0.125).
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// RTTVAR smoothing factor (default: 0.25).
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Raw RTT samples kept (default: 10).
    #[serde(default = "default_histogram_size")]
    pub histogram_size: usize,
}

/// Reassembly buffer limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ReassemblyConfig {
    /// Early segments held at once (default: 4096).
    #[serde(default = "default_reassembly_queue_size")]
    pub max_queue_size: usize,
    /// Maximum distance ahead of the cursor (default: 4096).
    #[serde(default = "default_reassembly_queue_gap")]
    pub max_queue_gap: u64,
}

/// Retransmission scheduler tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Scan interval (default: 20 ms).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Maximum segments in flight (default: 1000000).
    #[serde(default = "default_scheduler_queue_size")]
    pub max_queue_size: usize,
}

/// A local listener forwarded to a service on a peer device.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Display name.
    pub name: String,
    /// Local TCP address to listen on.
    pub listen: String,
    /// Target on the peer, `tcp://host:port` or `udp://host:port`.
    pub url_remote: String,
    /// Device that dials `url_remote`.
    pub peer_device_id: DeviceId,
}

// Default value functions
fn default_max_reconnect_interval_ms() -> u64 {
    5000
}

fn default_receive_queue_size() -> usize {
    1000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_response_interval_ms() -> u64 {
    1000
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_ack_window_size() -> usize {
    128 * 1024
}

fn default_keepalive_interval_ms() -> u64 {
    1000
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_ingress_queue_size() -> usize {
    1024
}

fn default_cipher() -> String {
    crate::crypto::CIPHER_XCHACHA.to_string()
}

fn default_curve() -> String {
    crate::crypto::CURVE_X25519.to_string()
}

fn default_initial_rto_ms() -> u64 {
    100
}

fn default_min_rto_ms() -> u64 {
    50
}

fn default_max_rto_ms() -> u64 {
    500
}

fn default_k() -> f64 {
    10.0
}

fn default_alpha() -> f64 {
    0.125
}

fn default_beta() -> f64 {
    0.25
}

fn default_histogram_size() -> usize {
    10
}

fn default_reassembly_queue_size() -> usize {
    4096
}

fn default_reassembly_queue_gap() -> u64 {
    4096
}

fn default_tick_ms() -> u64 {
    20
}

fn default_scheduler_queue_size() -> usize {
    1_000_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            response_interval_ms: default_response_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            throughput_limit: 0,
            read_buffer_size: default_read_buffer_size(),
            ack_window_size: default_ack_window_size(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            ingress_queue_size: default_ingress_queue_size(),
            cipher: default_cipher(),
            curve: default_curve(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            initial_rto_ms: default_initial_rto_ms(),
            min_rto_ms: default_min_rto_ms(),
            max_rto_ms: default_max_rto_ms(),
            k: default_k(),
            alpha: default_alpha(),
            beta: default_beta(),
            histogram_size: default_histogram_size(),
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_reassembly_queue_size(),
            max_queue_gap: default_reassembly_queue_gap(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_queue_size: default_scheduler_queue_size(),
        }
    }
}

impl UplinkConfig {
    /// Reconnect policy for the uplink.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.max_reconnect_interval_ms),
            self.reconnect_retries,
        )
    }

    /// Write timeout for a single frame.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Resolved per-connection settings.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings::from_sections(
            &self.connection,
            &self.window,
            &self.reassembly,
            &self.scheduler,
        )
    }
}

/// Per-connection settings with resolved durations.
///
/// Handed to every connection adapter; inbound connections override the
/// window size and rate limit with the opener's bridge options.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Resend interval for Open/Accept.
    pub response_interval: Duration,
    /// Local socket read timeout.
    pub read_timeout: Duration,
    /// Egress throughput limit in bytes/second (0 = unlimited).
    pub throughput_limit: u64,
    /// Bytes read per segment.
    pub read_buffer_size: usize,
    /// Flow window capacity in bytes.
    pub ack_window_size: usize,
    /// Confirm interval until traffic flows.
    pub keepalive_interval: Duration,
    /// Timeout for dialing the remote service.
    pub dial_timeout: Duration,
    /// Data envelopes queued for the ingress pump.
    pub ingress_queue_size: usize,
    /// Session cipher name.
    pub cipher: String,
    /// Key agreement curve name.
    pub curve: String,
    /// RTT estimator tuning.
    pub rtt: RttOptions,
    /// Reassembly limits.
    pub reassembly: ReassemblyOptions,
    /// Retransmission scan interval.
    pub scheduler_tick: Duration,
    /// Maximum segments in flight.
    pub scheduler_queue_size: usize,
}

impl ConnectionSettings {
    /// Resolve settings from the configuration sections.
    pub fn from_sections(
        c: &ConnectionConfig,
        w: &WindowConfig,
        r: &ReassemblyConfig,
        s: &SchedulerConfig,
    ) -> Self {
        Self {
            response_interval: Duration::from_millis(c.response_interval_ms),
            read_timeout: Duration::from_millis(c.read_timeout_ms),
            throughput_limit: c.throughput_limit,
            read_buffer_size: c.read_buffer_size.max(1),
            ack_window_size: if c.ack_window_size == 0 {
                default_ack_window_size()
            } else {
                c.ack_window_size
            },
            keepalive_interval: Duration::from_millis(c.keepalive_interval_ms),
            dial_timeout: Duration::from_millis(c.dial_timeout_ms),
            ingress_queue_size: c.ingress_queue_size.max(1),
            cipher: c.cipher.clone(),
            curve: c.curve.clone(),
            rtt: RttOptions {
                initial_rto: Duration::from_millis(w.initial_rto_ms),
                min_rto: Duration::from_millis(w.min_rto_ms),
                max_rto: Duration::from_millis(w.max_rto_ms),
                k: w.k,
                alpha: w.alpha,
                beta: w.beta,
                histogram_size: w.histogram_size,
            },
            reassembly: ReassemblyOptions {
                max_queue_size: r.max_queue_size,
                max_queue_gap: r.max_queue_gap,
            },
            scheduler_tick: Duration::from_millis(s.tick_ms.max(1)),
            scheduler_queue_size: s.max_queue_size,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_sections(
            &ConnectionConfig::default(),
            &WindowConfig::default(),
            &ReassemblyConfig::default(),
            &SchedulerConfig::default(),
        )
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[device]
id = "6f1c2a4e-1b7d-4a51-9f0e-3c2d8b5a7e10"

[uplink]
url = "ws://127.0.0.1:8080/relay"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();

        assert_eq!(
            config.device.id.to_string(),
            "6f1c2a4e-1b7d-4a51-9f0e-3c2d8b5a7e10"
        );
        assert_eq!(config.uplink.max_reconnect_interval_ms, 5000);
        assert_eq!(config.uplink.reconnect_retries, 0);
        assert_eq!(config.uplink.receive_queue_size, 1000);
        assert_eq!(config.connection.read_buffer_size, 4096);
        assert_eq!(config.connection.cipher, "xchacha20-poly1305");
        assert_eq!(config.window.k, 10.0);
        assert_eq!(config.scheduler.tick_ms, 20);
        assert!(config.services.is_empty());
    }

    #[test]
    fn settings_resolve_durations() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        let settings = config.connection_settings();

        assert_eq!(settings.response_interval, Duration::from_secs(1));
        assert_eq!(settings.keepalive_interval, Duration::from_secs(1));
        assert_eq!(settings.rtt.initial_rto, Duration::from_millis(100));
        assert_eq!(settings.rtt.max_rto, Duration::from_millis(500));
        assert_eq!(settings.scheduler_tick, Duration::from_millis(20));
        assert_eq!(settings.reassembly, ReassemblyOptions::default());
    }

    #[test]
    fn full_config_from_toml_string() {
        let toml = r#"
[device]
id = "6f1c2a4e-1b7d-4a51-9f0e-3c2d8b5a7e10"

[uplink]
url = "ws://relay.local/ws"
api_token = "secret"
reconnect_retries = 3

[connection]
throughput_limit = 65536
ack_window_size = 8192
cipher = "none"

[window]
max_rto_ms = 2000

[reassembly]
max_queue_gap = 16

[scheduler]
tick_ms = 5

[[services]]
name = "ssh"
listen = "127.0.0.1:2222"
url_remote = "tcp://127.0.0.1:22"
peer_device_id = "0b9f3d6c-28e4-4f3a-8d1e-7a6b5c4d3e2f"
"#;

        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.uplink.api_token, "secret");
        assert_eq!(config.uplink.reconnect_policy().max_retries, 3);
        assert_eq!(config.connection.throughput_limit, 65536);
        assert_eq!(config.connection.cipher, "none");
        assert_eq!(config.window.max_rto_ms, 2000);
        assert_eq!(config.reassembly.max_queue_gap, 16);
        assert_eq!(config.reassembly.max_queue_size, 4096);
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "ssh");
        assert_eq!(config.services[0].url_remote, "tcp://127.0.0.1:22");

        let settings = config.connection_settings();
        assert_eq!(settings.ack_window_size, 8192);
        assert_eq!(settings.scheduler_tick, Duration::from_millis(5));
    }

    #[test]
    fn invalid_device_id_is_a_parse_error() {
        let toml = MINIMAL.replace("6f1c2a4e-1b7d-4a51-9f0e-3c2d8b5a7e10", "not-a-uuid");
        assert!(toml::from_str::<Config>(&toml).is_err());
    }

    #[test]
    fn from_file_reads_and_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.uplink.url, "ws://127.0.0.1:8080/relay");
    }

    #[test]
    fn from_file_reports_missing_and_malformed_files() {
        let missing = Config::from_file(std::path::Path::new("/nonexistent/node.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[device\nid = ").unwrap();
        let malformed = Config::from_file(file.path());
        assert!(matches!(malformed, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn zero_ack_window_falls_back_to_default() {
        let toml = format!("{MINIMAL}\n[connection]\nack_window_size = 0\n");
        let config: Config = toml::from_str(&toml).unwrap();

        assert_eq!(config.connection_settings().ack_window_size, 128 * 1024);
    }

    #[test]
    fn default_settings_match_config_defaults() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.ack_window_size, 128 * 1024);
        assert_eq!(settings.dial_timeout, Duration::from_secs(5));
        assert_eq!(settings.curve, "x25519");
    }
}
