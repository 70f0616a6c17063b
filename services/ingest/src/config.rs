//! Configuration management for the camera event listener.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Camera connection configuration
    pub camera: CameraConfig,

    /// Event classification rules
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Event sink configuration
    #[serde(default)]
    pub sink: SinkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How credentials are presented to the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Basic,
    Digest,
}

/// Camera alarm stream connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Camera host name or IP address
    pub host: String,

    /// HTTP port of the camera
    #[serde(default = "default_port")]
    pub port: u16,

    /// URL scheme (http or https)
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Camera account name
    #[serde(default)]
    pub username: String,

    /// Camera account password
    #[serde(default)]
    pub password: String,

    /// Authentication scheme
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: AuthScheme,

    /// Event codes to subscribe to (empty = all)
    #[serde(default = "default_event_codes")]
    pub event_codes: Vec<String>,

    /// Heartbeat interval requested from the camera in seconds (0 = none)
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum silence on an open stream before it is considered dead
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Base delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Randomization applied to each reconnect delay (0.0 - 1.0)
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,

    /// Largest accepted multipart part in bytes
    #[serde(default = "default_max_part_bytes")]
    pub max_part_bytes: usize,

    /// Bytes scanned for a boundary or header block before giving up
    #[serde(default = "default_boundary_window_bytes")]
    pub boundary_window_bytes: usize,

    /// How long a text part waits for a trailing image part in milliseconds
    #[serde(default = "default_attachment_grace_ms")]
    pub attachment_grace_ms: u64,
}

/// Event classification configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Event code of tripwire crossings
    #[serde(default = "default_traffic_code")]
    pub traffic_code: String,

    /// Event code of intrusion detection
    #[serde(default = "default_intrusion_code")]
    pub intrusion_code: String,

    /// Tripwire rule names counted as traffic (empty = all)
    #[serde(default)]
    pub traffic_rules: Vec<String>,

    /// Rule name reported as an intrusion (unset = intrusions ignored)
    #[serde(default)]
    pub intrusion_rule: Option<String>,

    /// Only classify frames whose action is Start
    #[serde(default = "default_true")]
    pub start_action_only: bool,

    /// Minimum spacing between recorded intrusions in seconds (0 = off)
    #[serde(default = "default_intrusion_debounce_secs")]
    pub intrusion_debounce_secs: u64,
}

/// Downstream event sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Events buffered between the listener and the recorder
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// JSON-lines file events are appended to
    #[serde(default = "default_events_path")]
    pub events_path: String,

    /// Directory intrusion snapshots are written to
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

// Default value functions
fn default_port() -> u16 {
    80
}
fn default_protocol() -> String {
    "http".to_string()
}
fn default_auth_scheme() -> AuthScheme {
    AuthScheme::Digest
}
fn default_event_codes() -> Vec<String> {
    vec![
        "CrossLineDetection".to_string(),
        "CrossRegionDetection".to_string(),
    ]
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    30
}
fn default_reconnect_base_delay_ms() -> u64 {
    2000
}
fn default_reconnect_max_delay_ms() -> u64 {
    60000
}
fn default_reconnect_jitter() -> f64 {
    0.25
}
fn default_max_part_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_boundary_window_bytes() -> usize {
    64 * 1024
}
fn default_attachment_grace_ms() -> u64 {
    500
}
fn default_traffic_code() -> String {
    "CrossLineDetection".to_string()
}
fn default_intrusion_code() -> String {
    "CrossRegionDetection".to_string()
}
fn default_true() -> bool {
    true
}
fn default_intrusion_debounce_secs() -> u64 {
    10
}
fn default_channel_capacity() -> usize {
    256
}
fn default_events_path() -> String {
    "data/events.jsonl".to_string()
}
fn default_snapshot_dir() -> String {
    "data/snapshots".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            traffic_code: default_traffic_code(),
            intrusion_code: default_intrusion_code(),
            traffic_rules: Vec::new(),
            intrusion_rule: None,
            start_action_only: true,
            intrusion_debounce_secs: default_intrusion_debounce_secs(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            events_path: default_events_path(),
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with INGEST_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. INGEST__CAMERA__HOST, INGEST__CLASSIFIER__TRAFFIC_RULES=a,b
            .add_source(env_source())
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder().add_source(env_source()).build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.camera.validate()?;

        if self.classifier.traffic_code.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "classifier.traffic_code".to_string(),
            ));
        }

        if self.sink.channel_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sink.channel_capacity".to_string(),
                message: "Capacity must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("INGEST")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("camera.event_codes")
        .with_list_parse_key("classifier.traffic_rules")
        .try_parsing(true)
}

impl CameraConfig {
    /// Validate the connection settings on their own.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.host.is_empty() {
            return Err(ConfigValidationError::MissingField("camera.host".to_string()));
        }
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.protocol".to_string(),
                message: "Protocol must be http or https".to_string(),
            });
        }
        if self.username.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "camera.username".to_string(),
            ));
        }
        if self.password.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "camera.password".to_string(),
            ));
        }
        if self.reconnect_base_delay_ms == 0
            || self.reconnect_max_delay_ms < self.reconnect_base_delay_ms
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.reconnect_max_delay_ms".to_string(),
                message: "Delays must be non-zero and max must not be below base".to_string(),
            });
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.idle_timeout_secs".to_string(),
                message: "Idle timeout must be greater than 0".to_string(),
            });
        }
        if self.heartbeat_secs > 0 && self.idle_timeout_secs <= self.heartbeat_secs {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.idle_timeout_secs".to_string(),
                message: "Idle timeout must exceed the heartbeat interval".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.reconnect_jitter".to_string(),
                message: "Jitter must be between 0.0 and 1.0".to_string(),
            });
        }
        Ok(())
    }

    /// URL of the camera's alarm subscription endpoint.
    pub fn event_url(&self) -> String {
        let mut url = format!(
            "{}://{}:{}/cgi-bin/eventManager.cgi?action=attach&codes=[{}]",
            self.protocol,
            self.host,
            self.port,
            if self.event_codes.is_empty() {
                "All".to_string()
            } else {
                self.event_codes.join(",")
            }
        );
        if self.heartbeat_secs > 0 {
            url.push_str(&format!("&heartbeat={}", self.heartbeat_secs));
        }
        url
    }

    /// Get connection timeout as Duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get idle read timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get base reconnection delay as Duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Get maximum reconnection delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// Get image attachment grace period as Duration.
    pub fn attachment_grace(&self) -> Duration {
        Duration::from_millis(self.attachment_grace_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
pub(crate) fn test_camera_config(host: &str, port: u16) -> CameraConfig {
    CameraConfig {
        host: host.to_string(),
        port,
        protocol: "http".to_string(),
        username: "admin".to_string(),
        password: "secret".to_string(),
        auth_scheme: AuthScheme::Basic,
        event_codes: default_event_codes(),
        heartbeat_secs: 0,
        connection_timeout_secs: 2,
        idle_timeout_secs: 5,
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 50,
        reconnect_jitter: 0.0,
        max_part_bytes: default_max_part_bytes(),
        boundary_window_bytes: default_boundary_window_bytes(),
        attachment_grace_ms: 20,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> IngestConfig {
        IngestConfig {
            camera: test_camera_config("192.168.1.108", 80),
            classifier: ClassifierConfig::default(),
            sink: SinkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_host() {
        let mut config = create_test_config();
        config.camera.host = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_missing_credentials_fail_fast() {
        let mut config = create_test_config();
        config.camera.password = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(field)) if field == "camera.password"
        ));
    }

    #[test]
    fn test_idle_timeout_must_outlast_heartbeat() {
        let mut config = create_test_config();
        config.camera.idle_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "camera.idle_timeout_secs"
        ));

        config.camera.heartbeat_secs = 5;
        config.camera.idle_timeout_secs = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "camera.idle_timeout_secs"
        ));

        config.camera.idle_timeout_secs = 15;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_protocol() {
        let mut config = create_test_config();
        config.camera.protocol = "rtsp".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_inverted_backoff_bounds() {
        let mut config = create_test_config();
        config.camera.reconnect_base_delay_ms = 5000;
        config.camera.reconnect_max_delay_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_event_url() {
        let mut camera = test_camera_config("cam", 8080);
        camera.heartbeat_secs = 5;
        assert_eq!(
            camera.event_url(),
            "http://cam:8080/cgi-bin/eventManager.cgi?action=attach\
             &codes=[CrossLineDetection,CrossRegionDetection]&heartbeat=5"
        );

        camera.event_codes.clear();
        camera.heartbeat_secs = 0;
        assert!(camera.event_url().ends_with("codes=[All]"));
    }
}
