//! Configuration management

use crate::protocol;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel configuration
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Link configuration
    #[serde(default)]
    pub link: LinkConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the tunnel cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        let nonzero = [
            ("tunnel.dial_timeout_ms", self.tunnel.dial_timeout_ms),
            ("tunnel.keepalive_interval_ms", self.tunnel.keepalive_interval_ms),
            ("tunnel.discover_interval_ms", self.tunnel.discover_interval_ms),
            ("tunnel.reconnect_interval_ms", self.tunnel.reconnect_interval_ms),
            ("tunnel.queue_size", self.tunnel.queue_size as u64),
            ("link.channel_ttl_ms", self.link.channel_ttl_ms),
            ("link.probe_interval_ms", self.link.probe_interval_ms),
            ("link.metrics_interval_ms", self.link.metrics_interval_ms),
            ("link.queue_size", self.link.queue_size as u64),
            ("link.probe_queue_size", self.link.probe_queue_size as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(crate::Error::Config(format!("{} must be greater than zero", name)));
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(crate::Error::Config(format!(
                "Unknown log format: {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Tunnel id (random when unset)
    pub id: Option<String>,
    /// Transport listen address
    pub address: String,
    /// Peer nodes to keep links to
    pub nodes: Vec<String>,
    /// Shared secret all session keys derive from
    pub token: String,
    /// Dial, discover and open timeout in milliseconds
    pub dial_timeout_ms: u64,
    /// Keepalive interval per link in milliseconds
    pub keepalive_interval_ms: u64,
    /// Discover interval per link in milliseconds
    pub discover_interval_ms: u64,
    /// Interval of the link reconnection manager in milliseconds
    pub reconnect_interval_ms: u64,
    /// Capacity of the outbound queue and of each session queue
    pub queue_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            id: None,
            address: "127.0.0.1:0".to_string(),
            nodes: Vec::new(),
            token: protocol::DEFAULT_TOKEN.to_string(),
            dial_timeout_ms: protocol::DIAL_TIMEOUT_MS,
            keepalive_interval_ms: protocol::KEEPALIVE_INTERVAL_MS,
            discover_interval_ms: protocol::DISCOVER_INTERVAL_MS,
            reconnect_interval_ms: protocol::RECONNECT_INTERVAL_MS,
            queue_size: protocol::QUEUE_SIZE,
        }
    }
}

impl TunnelConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn discover_interval(&self) -> Duration {
        Duration::from_millis(self.discover_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How long a channel mapping lives without a refresh, in milliseconds
    pub channel_ttl_ms: u64,
    /// RTT probe and mapping purge interval in milliseconds
    pub probe_interval_ms: u64,
    /// Metrics batch interval in milliseconds
    pub metrics_interval_ms: u64,
    /// Capacity of the send and receive packet queues
    pub queue_size: usize,
    /// Capacity of the probe queue
    pub probe_queue_size: usize,
    /// Consecutive errors tolerated before the link reports error state
    pub error_threshold: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            channel_ttl_ms: protocol::CHANNEL_TTL_MS,
            probe_interval_ms: protocol::PROBE_INTERVAL_MS,
            metrics_interval_ms: protocol::METRICS_INTERVAL_MS,
            queue_size: protocol::QUEUE_SIZE,
            probe_queue_size: protocol::PROBE_QUEUE_SIZE,
            error_threshold: protocol::ERROR_THRESHOLD,
        }
    }
}

impl LinkConfig {
    pub fn channel_ttl(&self) -> Duration {
        Duration::from_millis(self.channel_ttl_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

/// Accepted values of [`LoggingConfig::format`]
pub const LOG_FORMATS: [&str; 3] = ["pretty", "json", "compact"];

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Append logs to this file instead of stdout
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        tunnel: TunnelConfig {
            address: "0.0.0.0:8085".to_string(),
            nodes: vec!["10.0.0.2:8085".to_string(), "10.0.0.3:8085".to_string()],
            token: "change-me".to_string(),
            ..TunnelConfig::default()
        },
        link: LinkConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tunnel.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.tunnel.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.tunnel.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.link.channel_ttl(), Duration::from_secs(120));
        assert_eq!(config.link.probe_interval(), Duration::from_secs(60));
        assert_eq!(config.link.metrics_interval(), Duration::from_secs(5));
        assert_eq!(config.link.error_threshold, 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.toml");

        let config = generate_example_config();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.tunnel.address, config.tunnel.address);
        assert_eq!(loaded.tunnel.nodes, config.tunnel.nodes);
        assert_eq!(loaded.tunnel.token, "change-me");
        assert_eq!(loaded.link.queue_size, config.link.queue_size);
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [tunnel]
            address = "127.0.0.1:9000"
            nodes = ["127.0.0.1:9001"]
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel.address, "127.0.0.1:9000");
        assert_eq!(config.tunnel.token, protocol::DEFAULT_TOKEN);
        assert_eq!(config.link.probe_interval_ms, protocol::PROBE_INTERVAL_MS);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.toml");
        std::fs::write(&path, "[link]\nprobe_interval_ms = 0\n").unwrap();

        match Config::load(&path) {
            Err(crate::Error::Config(msg)) => assert!(msg.contains("link.probe_interval_ms")),
            other => panic!("unexpected result: {:?}", other),
        }

        let mut config = Config::default();
        config.tunnel.reconnect_interval_ms = 0;
        assert!(config.validate().is_err());

        config.tunnel.reconnect_interval_ms = 100;
        config.tunnel.queue_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.logging.format = "xml".to_string();
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        config.logging.format = "json".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/tunnel.toml"),
            Err(crate::Error::Config(_))
        ));
    }
}
