//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and field has a default, so a missing file or an empty
//! section yields a working configuration. A handful of environment
//! variables override the file (see [`Config::apply_env_overrides`]).

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ProxyError, Result};

/// Receiver settings document name
pub const RECEIVER_SETTINGS_FILENAME: &str = "settings.json";

/// Measurement file written by the receiver
pub const DOA_FILENAME: &str = "DOA_value.html";

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Filesystem locations of the receiver installation
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_doa_root")]
    pub doa_root: PathBuf,

    #[serde(default = "default_local_settings")]
    pub local_settings: PathBuf,
}

/// Measurement polling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_window_ms")]
    pub window_ms: i64,

    #[serde(default = "default_freshness_ms")]
    pub freshness_ms: i64,
}

/// Power relay and sequencing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PowerConfig {
    #[serde(default = "default_power_enabled")]
    pub enabled: bool,

    #[serde(default = "default_relay_pin")]
    pub relay_pin: u32,

    #[serde(default = "default_relay_active_high")]
    pub relay_active_high: bool,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_usb_id")]
    pub usb_id: String,

    #[serde(default = "default_power_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default = "default_service_timeout_ms")]
    pub service_timeout_ms: u64,

    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u64,
}

/// HTTP listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Connection to the receiver's web UI
#[derive(Debug, Deserialize, Clone)]
pub struct ReceiverConfig {
    /// Hold a push-channel connection open so the web UI keeps publishing
    #[serde(default = "default_keepalive_enabled")]
    pub keepalive_enabled: bool,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Log output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rolling log files; stdout only when unset
    #[serde(default)]
    pub file_dir: Option<PathBuf>,
}

// Default value functions
fn default_doa_root() -> PathBuf { PathBuf::from("/home/krakenrf/krakensdr_doa/krakensdr_doa") }
fn default_local_settings() -> PathBuf { PathBuf::from("geo_settings.json") }

fn default_poll_interval_ms() -> u64 { 100 }
fn default_window_ms() -> i64 { 5000 }
fn default_freshness_ms() -> i64 { 1000 }

fn default_power_enabled() -> bool { true }
fn default_relay_pin() -> u32 { 27 }
fn default_relay_active_high() -> bool { true }
fn default_service_name() -> String { "krakensdr".to_string() }
fn default_usb_id() -> String { "0bda:2838".to_string() }
fn default_power_poll_interval_ms() -> u64 { 100 }
fn default_settle_ms() -> u64 { 200 }
fn default_service_timeout_ms() -> u64 { 10_000 }
fn default_device_timeout_ms() -> u64 { 15_000 }

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8082 }

fn default_keepalive_enabled() -> bool { true }
fn default_ws_url() -> String { "ws://127.0.0.1:8080/_push".to_string() }
fn default_reconnect_delay_ms() -> u64 { 1000 }

fn default_log_level() -> String { "warn".to_string() }

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            doa_root: default_doa_root(),
            local_settings: default_local_settings(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            window_ms: default_window_ms(),
            freshness_ms: default_freshness_ms(),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            enabled: default_power_enabled(),
            relay_pin: default_relay_pin(),
            relay_active_high: default_relay_active_high(),
            service_name: default_service_name(),
            usb_id: default_usb_id(),
            poll_interval_ms: default_power_poll_interval_ms(),
            settle_ms: default_settle_ms(),
            service_timeout_ms: default_service_timeout_ms(),
            device_timeout_ms: default_device_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            keepalive_enabled: default_keepalive_enabled(),
            ws_url: default_ws_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_dir: None,
        }
    }
}

/// Files inside the receiver installation, resolved from `doa_root`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverPaths {
    pub settings_file: PathBuf,
    pub doa_file: PathBuf,
    pub backup_dir: PathBuf,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use kraken_proxy::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.logging.level = normalize_log_level(&config.logging.level);
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    ///
    /// Recognised variables: `DOA_PATH`, `DOA_READ_REGULARITY_MS`,
    /// `DOA_TIME_THRESHOLD_MS`, `LOG_LEVEL`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("DOA_PATH") {
            self.paths.doa_root = PathBuf::from(path);
        }
        if let Some(value) = lookup("DOA_READ_REGULARITY_MS") {
            self.ingest.poll_interval_ms = parse_override("DOA_READ_REGULARITY_MS", &value)?;
        }
        if let Some(value) = lookup("DOA_TIME_THRESHOLD_MS") {
            self.ingest.window_ms = parse_override("DOA_TIME_THRESHOLD_MS", &value)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = normalize_log_level(&level);
        }
        self.validate()
    }

    /// Resolve receiver file locations.
    ///
    /// Newer receiver releases keep the settings and measurement file in a
    /// shared `_share` directory; older ones keep them in the root and in
    /// `_android_web`.
    pub fn receiver_paths(&self) -> ReceiverPaths {
        let root = &self.paths.doa_root;
        let share = root.join("_share");

        let (settings_file, doa_file) = if share.exists() {
            (share.join(RECEIVER_SETTINGS_FILENAME), share.join(DOA_FILENAME))
        } else {
            (
                root.join(RECEIVER_SETTINGS_FILENAME),
                root.join("_android_web").join(DOA_FILENAME),
            )
        };

        ReceiverPaths {
            settings_file,
            doa_file,
            backup_dir: root.join("settings_backups"),
        }
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        if self.paths.doa_root.as_os_str().is_empty() {
            return Err(invalid("doa_root cannot be empty"));
        }

        if self.paths.local_settings.as_os_str().is_empty() {
            return Err(invalid("local_settings cannot be empty"));
        }

        if self.ingest.poll_interval_ms == 0 || self.ingest.poll_interval_ms > 60_000 {
            return Err(invalid("poll_interval_ms must be between 1 and 60000"));
        }

        if self.ingest.window_ms <= 0 || self.ingest.window_ms > 3_600_000 {
            return Err(invalid("window_ms must be between 1 and 3600000"));
        }

        if self.ingest.freshness_ms <= 0 || self.ingest.freshness_ms > self.ingest.window_ms {
            return Err(invalid("freshness_ms must be between 1 and window_ms"));
        }

        if self.power.service_name.is_empty() {
            return Err(invalid("service_name cannot be empty"));
        }

        if !is_usb_id(&self.power.usb_id) {
            return Err(invalid("usb_id must look like 'vvvv:pppp' (hex vendor:product)"));
        }

        if self.power.poll_interval_ms == 0 || self.power.poll_interval_ms > 10_000 {
            return Err(invalid("power poll_interval_ms must be between 1 and 10000"));
        }

        if self.power.settle_ms > 10_000 {
            return Err(invalid("settle_ms must be at most 10000"));
        }

        for (name, value) in [
            ("service_timeout_ms", self.power.service_timeout_ms),
            ("device_timeout_ms", self.power.device_timeout_ms),
        ] {
            if value == 0 || value > 120_000 {
                return Err(invalid(&format!("{} must be between 1 and 120000", name)));
            }
        }

        if self.server.host.is_empty() {
            return Err(invalid("server host cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(invalid("server port must be greater than 0"));
        }

        if !self.receiver.ws_url.starts_with("ws://") && !self.receiver.ws_url.starts_with("wss://") {
            return Err(invalid("ws_url must start with ws:// or wss://"));
        }

        if self.receiver.reconnect_delay_ms == 0 || self.receiver.reconnect_delay_ms > 600_000 {
            return Err(invalid("reconnect_delay_ms must be between 1 and 600000"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> ProxyError {
    ProxyError::Config(toml::de::Error::custom(msg))
}

/// Lowercase a level name and map `warning`, `critical`, `fatal` and `notset` onto tracing levels
fn normalize_log_level(level: &str) -> String {
    let level = level.trim().to_lowercase();
    match level.as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        "notset" => "trace".to_string(),
        _ => level,
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(&format!("{} must be an integer, got '{}'", name, value)))
}

fn is_usb_id(id: &str) -> bool {
    match id.split_once(':') {
        Some((vendor, product)) => [vendor, product]
            .iter()
            .all(|part| part.len() == 4 && part.chars().all(|c| c.is_ascii_hexdigit())),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[paths]
doa_root = "/opt/krakensdr_doa"

[ingest]
window_ms = 3000

[power]
service_name = "krakensdr_doa"

[server]
port = 9000
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.paths.doa_root, PathBuf::from("/opt/krakensdr_doa"));
        assert_eq!(config.ingest.window_ms, 3000);
        assert_eq!(config.ingest.poll_interval_ms, 100);
        assert_eq!(config.power.service_name, "krakensdr_doa");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 8082);
        assert_eq!(config.power.relay_pin, 27);
    }

    #[test]
    fn test_shipped_default_file_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let config = Config::load(path).unwrap();
        let defaults = Config::default();

        assert_eq!(config.paths.doa_root, defaults.paths.doa_root);
        assert_eq!(config.ingest.window_ms, defaults.ingest.window_ms);
        assert_eq!(config.power.device_timeout_ms, defaults.power.device_timeout_ms);
        assert_eq!(config.server.port, defaults.server.port);
        assert_eq!(config.receiver.ws_url, defaults.receiver.ws_url);
        assert_eq!(config.receiver.reconnect_delay_ms, defaults.receiver.reconnect_delay_ms);
        assert_eq!(config.logging.file_dir, None);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.ingest.window_ms, 5000);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        match Config::from_toml("[server\nport = ") {
            Err(ProxyError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    #[test]
    fn test_poll_interval_zero() {
        let mut config = Config::default();
        config.ingest.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_window_zero() {
        let mut config = Config::default();
        config.ingest.window_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_freshness_longer_than_window() {
        let mut config = Config::default();
        config.ingest.freshness_ms = config.ingest.window_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_usb_id() {
        for id in ["", "0bda2838", "0bda:28", "zzzz:2838"] {
            let mut config = Config::default();
            config.power.usb_id = id.to_string();
            assert!(config.validate().is_err(), "usb_id '{}' should be rejected", id);
        }
    }

    #[test]
    fn test_timeout_out_of_range() {
        let mut config = Config::default();
        config.power.device_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.power.service_timeout_ms = 120_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup_from(&[
                ("DOA_PATH", "/srv/kraken"),
                ("DOA_READ_REGULARITY_MS", "250"),
                ("DOA_TIME_THRESHOLD_MS", "8000"),
                ("LOG_LEVEL", "DEBUG"),
            ]))
            .unwrap();

        assert_eq!(config.paths.doa_root, PathBuf::from("/srv/kraken"));
        assert_eq!(config.ingest.poll_interval_ms, 250);
        assert_eq!(config.ingest.window_ms, 8000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_log_level_aliases() {
        for (given, expected) in [
            ("WARNING", "warn"),
            ("Warning", "warn"),
            ("CRITICAL", "error"),
            ("fatal", "error"),
            ("INFO", "info"),
            (" error ", "error"),
        ] {
            let mut config = Config::default();
            config
                .apply_overrides(lookup_from(&[("LOG_LEVEL", given)]))
                .unwrap_or_else(|e| panic!("LOG_LEVEL={} rejected: {}", given, e));
            assert_eq!(config.logging.level, expected);
        }
    }

    #[test]
    fn test_log_level_alias_in_file() {
        let config = Config::from_toml("[logging]\nlevel = \"WARNING\"\n").unwrap();
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_receiver_defaults() {
        let config = Config::default();
        assert!(config.receiver.keepalive_enabled);
        assert_eq!(config.receiver.ws_url, "ws://127.0.0.1:8080/_push");
        assert_eq!(config.receiver.reconnect_delay_ms, 1000);
    }

    #[test]
    fn test_invalid_ws_url() {
        let result = Config::from_toml("[receiver]\nws_url = \"http://127.0.0.1:8080/_push\"\n");
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_env_override_not_a_number() {
        let mut config = Config::default();
        let result = config.apply_overrides(lookup_from(&[("DOA_TIME_THRESHOLD_MS", "soon")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_receiver_paths_legacy_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.doa_root = dir.path().to_path_buf();

        let paths = config.receiver_paths();
        assert_eq!(paths.settings_file, dir.path().join("settings.json"));
        assert_eq!(paths.doa_file, dir.path().join("_android_web").join("DOA_value.html"));
        assert_eq!(paths.backup_dir, dir.path().join("settings_backups"));
    }

    #[test]
    fn test_receiver_paths_share_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("_share")).unwrap();
        let mut config = Config::default();
        config.paths.doa_root = dir.path().to_path_buf();

        let paths = config.receiver_paths();
        assert_eq!(paths.settings_file, dir.path().join("_share").join("settings.json"));
        assert_eq!(paths.doa_file, dir.path().join("_share").join("DOA_value.html"));
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_poll_interval_ms(), 100);
        assert_eq!(default_window_ms(), 5000);
        assert_eq!(default_freshness_ms(), 1000);
        assert_eq!(default_relay_pin(), 27);
        assert_eq!(default_settle_ms(), 200);
        assert_eq!(default_service_timeout_ms(), 10_000);
        assert_eq!(default_device_timeout_ms(), 15_000);
        assert_eq!(default_port(), 8082);
        assert!(default_keepalive_enabled());
        assert_eq!(default_reconnect_delay_ms(), 1000);
        assert_eq!(default_log_level(), "warn");
    }
}
