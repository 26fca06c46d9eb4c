// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway configuration.
//!
//! Loaded from a TOML file or assembled from command-line / environment
//! values. Every field has a default so an empty file is a valid config.

use crate::envelope::BrokerTopic;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Largest payload a UDP/IPv4 datagram can carry.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address every listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Fixed device identifier. When unset the identity is derived from the
    /// host name and then replaced by the hardware address.
    #[serde(default)]
    pub device_id: Option<String>,

    /// Request/response endpoint.
    #[serde(default)]
    pub rest: RestConfig,

    /// Datagram endpoint.
    #[serde(default)]
    pub udp: DatagramConfig,

    /// Embedded MQTT broker endpoint.
    #[serde(default)]
    pub mqtt: BrokerConfig,

    /// Upstream broker session.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Log sinks.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Statistics reporting interval (seconds, 0 to disable).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Log envelopes instead of publishing them upstream.
    #[serde(default)]
    pub dry_run: bool,
}

/// Request endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_rest_port")]
    pub port: u16,

    /// Answer failed requests with 404 instead of 400.
    #[serde(default)]
    pub legacy_not_found_status: bool,
}

/// Datagram endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_udp_port")]
    pub port: u16,

    /// Receive buffer size; longer datagrams are truncated by the kernel.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

/// Embedded broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Largest accepted packet (fixed header included), in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

/// Upstream broker session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_host")]
    pub host: String,

    #[serde(default = "default_upstream_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    /// Account identifier used in the data topic. Defaults to `username`.
    #[serde(default)]
    pub account_id: Option<String>,

    /// Static first segment of the data topic.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// MQTT client id. Defaults to the device identity at startup.
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Use TLS. Disable only for plain-text brokers.
    #[serde(default = "default_true")]
    pub tls: bool,

    /// CA bundle (PEM). The platform trust store is used when unset.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    /// Client certificate (PEM).
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// Client private key (PEM).
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Outbound request queue depth; publishes beyond it are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

/// Log sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Console filter (trace, debug, info, warn, error or an env-filter directive).
    #[serde(default = "default_console_level")]
    pub console_level: String,

    /// Optional log file.
    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default = "default_file_level")]
    pub file_level: String,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_true() -> bool {
    true
}

fn default_rest_port() -> u16 {
    8080
}

fn default_udp_port() -> u16 {
    41234
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_max_datagram_size() -> usize {
    MAX_UDP_PAYLOAD
}

fn default_max_packet_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_upstream_port() -> u16 {
    8884
}

fn default_username() -> String {
    "username".to_string()
}

fn default_password() -> String {
    "password".to_string()
}

fn default_topic_prefix() -> String {
    "data2".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    100
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_console_level() -> String {
    "info".to_string()
}

fn default_file_level() -> String {
    "warn".to_string()
}

fn default_stats_interval() -> u64 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            device_id: None,
            rest: RestConfig::default(),
            udp: DatagramConfig::default(),
            mqtt: BrokerConfig::default(),
            upstream: UpstreamConfig::default(),
            logging: LoggingConfig::default(),
            stats_interval_secs: default_stats_interval(),
            dry_run: false,
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_rest_port(),
            legacy_not_found_status: false,
        }
    }
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_udp_port(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_mqtt_port(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            username: default_username(),
            password: default_password(),
            account_id: None,
            topic_prefix: default_topic_prefix(),
            client_id: None,
            keep_alive_secs: default_keep_alive(),
            tls: true,
            ca_path: None,
            cert_path: None,
            key_path: None,
            queue_capacity: default_queue_capacity(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console_level: default_console_level(),
            file: None,
            file_level: default_file_level(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as pretty TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rest.enabled && !self.udp.enabled && !self.mqtt.enabled {
            return Err(ConfigError::Invalid("All listeners are disabled".into()));
        }
        if let Some(device_id) = &self.device_id {
            if device_id.trim().is_empty() {
                return Err(ConfigError::Invalid("device_id cannot be empty".into()));
            }
        }
        if self.udp.max_datagram_size == 0 || self.udp.max_datagram_size > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "udp.max_datagram_size must be in 1..={}",
                u16::MAX
            )));
        }
        // Smallest useful packet is a 2-byte PINGREQ.
        if self.mqtt.max_packet_size < 2 {
            return Err(ConfigError::Invalid(
                "mqtt.max_packet_size must be >= 2".into(),
            ));
        }

        let upstream = &self.upstream;
        if upstream.host.is_empty() {
            return Err(ConfigError::Invalid("upstream.host cannot be empty".into()));
        }
        if upstream.topic_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.topic_prefix cannot be empty".into(),
            ));
        }
        if self.account_id().is_empty() {
            return Err(ConfigError::Invalid(
                "upstream account id cannot be empty".into(),
            ));
        }
        if upstream.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid(
                "upstream.keep_alive_secs must be >= 5".into(),
            ));
        }
        if upstream.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "upstream.queue_capacity must be > 0".into(),
            ));
        }
        if upstream.cert_path.is_some() != upstream.key_path.is_some() {
            return Err(ConfigError::Invalid(
                "upstream.cert_path and upstream.key_path must be set together".into(),
            ));
        }
        let tls_material = upstream.ca_path.is_some() || upstream.cert_path.is_some();
        if tls_material && !upstream.tls {
            return Err(ConfigError::Invalid(
                "upstream TLS files are set but upstream.tls is false".into(),
            ));
        }
        Ok(())
    }

    /// Account identifier used in the upstream topic.
    pub fn account_id(&self) -> &str {
        self.upstream
            .account_id
            .as_deref()
            .unwrap_or(&self.upstream.username)
    }

    /// The single upstream data topic.
    pub fn broker_topic(&self) -> BrokerTopic {
        BrokerTopic::new(&self.upstream.topic_prefix, self.account_id())
    }

    pub fn rest_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.rest.port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.udp.port)
    }

    pub fn mqtt_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.mqtt.port)
    }

    /// Get stats interval as Duration (`None` when disabled).
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

impl UpstreamConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.rest.port, 8080);
        assert_eq!(config.udp.port, 41234);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.upstream.port, 8884);
        assert!(!config.rest.legacy_not_found_status);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_broker_topic_defaults_to_username() {
        let config = GatewayConfig::default();
        assert_eq!(config.account_id(), "username");
        assert_eq!(config.broker_topic().as_str(), "data2/username");
    }

    #[test]
    fn test_broker_topic_with_account() {
        let mut config = GatewayConfig::default();
        config.upstream.account_id = Some("acme".into());
        config.upstream.topic_prefix = "metrics".into();
        assert_eq!(config.broker_topic().as_str(), "metrics/acme");
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.upstream.topic_prefix, "data2");
    }

    #[test]
    fn test_partial_toml() {
        let config: GatewayConfig = toml::from_str(
            r#"
            device_id = "d-test"

            [rest]
            legacy_not_found_status = true

            [udp]
            enabled = false

            [upstream]
            host = "broker.example.com"
            account_id = "acct-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.device_id.as_deref(), Some("d-test"));
        assert!(config.rest.legacy_not_found_status);
        assert!(!config.udp.enabled);
        assert_eq!(config.udp.port, 41234);
        assert_eq!(config.upstream.host, "broker.example.com");
        assert_eq!(config.broker_topic().as_str(), "data2/acct-1");
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = GatewayConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: GatewayConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.udp.max_datagram_size, config.udp.max_datagram_size);
        assert_eq!(parsed.upstream.host, config.upstream.host);
    }

    #[test]
    fn test_validation_all_disabled() {
        let mut config = GatewayConfig::default();
        config.rest.enabled = false;
        config.udp.enabled = false;
        config.mqtt.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_empty_account() {
        let mut config = GatewayConfig::default();
        config.upstream.account_id = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_cert_without_key() {
        let mut config = GatewayConfig::default();
        config.upstream.cert_path = Some("client.crt".into());
        assert!(config.validate().is_err());

        config.upstream.key_path = Some("client.key".into());
        assert!(config.validate().is_ok());
        assert!(config.upstream.tls_enabled());
    }

    #[test]
    fn test_tls_on_by_default() {
        let config = GatewayConfig::default();
        assert!(config.upstream.tls_enabled());

        let config: GatewayConfig = toml::from_str("[upstream]\nhost = \"b\"\n").unwrap();
        assert!(config.upstream.tls);
    }

    #[test]
    fn test_validation_tls_files_without_tls() {
        let mut config = GatewayConfig::default();
        config.upstream.tls = false;
        assert!(config.validate().is_ok());
        assert!(!config.upstream.tls_enabled());

        config.upstream.ca_path = Some("ca.pem".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_keep_alive() {
        let mut config = GatewayConfig::default();
        config.upstream.keep_alive_secs = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stats_interval() {
        let mut config = GatewayConfig::default();
        assert_eq!(config.stats_interval(), Some(Duration::from_secs(60)));
        config.stats_interval_secs = 0;
        assert_eq!(config.stats_interval(), None);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[mqtt]\nport = 11883\n").unwrap();
        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.mqtt.port, 11883);

        std::fs::write(&path, "[mqtt\nport = ").unwrap();
        assert!(matches!(
            GatewayConfig::from_file(&path),
            Err(ConfigError::Toml(_))
        ));
    }
}
