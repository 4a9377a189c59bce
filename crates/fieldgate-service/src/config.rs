//! Gateway configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fieldgate_core::{ClientOptions, RetryPolicy, SerialConfig};
use fieldgate_types::MAX_PROTOCOL_ADDRESS;

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage settings.
    pub storage: StorageConfig,
    /// Meter polling settings.
    pub meters: MeterConfig,
    /// Remote delivery settings.
    pub upload: UploadConfig,
    /// Retention settings.
    pub retention: RetentionConfig,
    /// Weather push receiver settings.
    pub receiver: ReceiverConfig,
    /// Supervisor settings.
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// Every section is checked and all problems are reported together.
    ///
    /// # Example
    ///
    /// ```
    /// use fieldgate_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.storage.validate());
        errors.extend(self.meters.validate());
        errors.extend(self.upload.validate());
        errors.extend(self.retention.validate());
        errors.extend(self.receiver.validate());
        errors.extend(self.supervisor.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: fieldgate_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            ));
        }

        errors
    }
}

/// Meter polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Run the polling loop.
    pub enabled: bool,
    /// Serial device path.
    pub port: String,
    pub baud_rate: u32,
    /// Drive RTS as the RS485 DE/RE line.
    pub direction_control: bool,
    /// Settling time around direction changes, in microseconds.
    pub settle_delay_us: u64,
    /// Pause between polling cycles, in seconds.
    pub sampling_interval_secs: u64,
    /// Aggregation window, in seconds.
    pub aggregation_window_secs: u64,
    /// Restrict polling to these protocol addresses. Empty polls every
    /// registered meter.
    pub addresses: Vec<u8>,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Linear backoff base, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Response read window, in milliseconds.
    pub read_timeout_ms: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            direction_control: false,
            settle_delay_us: 800,
            sampling_interval_secs: 1,
            aggregation_window_secs: 300,
            addresses: Vec::new(),
            max_retries: 2,
            retry_backoff_ms: 10,
            read_timeout_ms: 200,
        }
    }
}

/// Shortest aggregation window in seconds.
pub const MIN_AGGREGATION_WINDOW: u64 = 10;
/// Longest aggregation window in seconds (1 hour).
pub const MAX_AGGREGATION_WINDOW: u64 = 3600;

impl MeterConfig {
    /// Validate meter configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.port.is_empty() {
            errors.push(ValidationError::new(
                "meters.port",
                "serial port cannot be empty",
            ));
        }
        if self.baud_rate == 0 {
            errors.push(ValidationError::new(
                "meters.baud_rate",
                "baud rate must be greater than 0",
            ));
        }
        if self.sampling_interval_secs == 0 {
            errors.push(ValidationError::new(
                "meters.sampling_interval_secs",
                "sampling interval must be at least 1 second",
            ));
        }
        if self.aggregation_window_secs < MIN_AGGREGATION_WINDOW {
            errors.push(ValidationError::new(
                "meters.aggregation_window_secs",
                format!(
                    "aggregation window {} is too short (minimum {} seconds)",
                    self.aggregation_window_secs, MIN_AGGREGATION_WINDOW
                ),
            ));
        } else if self.aggregation_window_secs > MAX_AGGREGATION_WINDOW {
            errors.push(ValidationError::new(
                "meters.aggregation_window_secs",
                format!(
                    "aggregation window {} is too long (maximum {} seconds / 1 hour)",
                    self.aggregation_window_secs, MAX_AGGREGATION_WINDOW
                ),
            ));
        }
        if self.read_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "meters.read_timeout_ms",
                "read timeout must be greater than 0",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for (i, address) in self.addresses.iter().enumerate() {
            let field = format!("meters.addresses[{}]", i);
            if *address == 0 || *address > MAX_PROTOCOL_ADDRESS {
                errors.push(ValidationError::new(
                    &field,
                    format!(
                        "protocol address {} out of range 1-{}",
                        address, MAX_PROTOCOL_ADDRESS
                    ),
                ));
            }
            if !seen.insert(*address) {
                errors.push(ValidationError::new(
                    &field,
                    format!("duplicate protocol address {}", address),
                ));
            }
        }

        errors
    }

    /// Serial port settings for the transport.
    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            direction_control: self.direction_control,
            settle_delay: Duration::from_micros(self.settle_delay_us),
        }
    }

    /// Timing and retry settings for each meter client.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::default()
            .read_timeout(Duration::from_millis(self.read_timeout_ms))
            .retry(
                RetryPolicy::new(self.max_retries)
                    .backoff_base(Duration::from_millis(self.retry_backoff_ms)),
            )
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_secs)
    }

    pub fn aggregation_window(&self) -> Duration {
        Duration::from_secs(self.aggregation_window_secs)
    }
}

/// Remote delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Run the upload loop.
    pub enabled: bool,
    /// Collector endpoint.
    pub url: String,
    /// Bearer credential sent with every batch.
    pub api_key: String,
    /// Largest number of records per batch.
    pub batch_size: u32,
    /// Pause between upload cycles, in seconds.
    pub interval_secs: u64,
    /// Per-request timeout, in seconds.
    pub timeout_secs: u64,
    /// Source label placed in every envelope.
    pub source: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            api_key: String::new(),
            batch_size: 100,
            interval_secs: 60,
            timeout_secs: 30,
            source: "fieldgate".to_string(),
        }
    }
}

impl UploadConfig {
    /// Validate upload configuration. An endpoint is only required when
    /// uploading is enabled.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.enabled {
            if self.url.is_empty() {
                errors.push(ValidationError::new(
                    "upload.url",
                    "endpoint URL is required when upload is enabled",
                ));
            } else if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
                errors.push(ValidationError::new(
                    "upload.url",
                    format!("invalid endpoint URL '{}': must start with http(s)://", self.url),
                ));
            }
            if self.api_key.is_empty() {
                errors.push(ValidationError::new(
                    "upload.api_key",
                    "API key is required when upload is enabled",
                ));
            }
        }
        if self.batch_size == 0 {
            errors.push(ValidationError::new(
                "upload.batch_size",
                "batch size must be greater than 0",
            ));
        }
        if self.interval_secs == 0 {
            errors.push(ValidationError::new(
                "upload.interval_secs",
                "upload interval must be at least 1 second",
            ));
        }
        if self.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "upload.timeout_secs",
                "request timeout must be at least 1 second",
            ));
        }

        errors
    }
}

/// Retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Clean up after successful uploads and run the periodic retention loop.
    pub enabled: bool,
    /// Age threshold for delivered records, in days.
    pub days: u32,
    /// Pause between periodic cleanups, in seconds.
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            days: 7,
            interval_secs: 86_400,
        }
    }
}

impl RetentionConfig {
    /// Validate retention configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.days == 0 {
            errors.push(ValidationError::new(
                "retention.days",
                "retention must keep records for at least 1 day",
            ));
        }
        if self.interval_secs < 60 {
            errors.push(ValidationError::new(
                "retention.interval_secs",
                format!(
                    "cleanup interval {} is too short (minimum 60 seconds)",
                    self.interval_secs
                ),
            ));
        }

        errors
    }
}

/// Weather push receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Run the receiver.
    pub enabled: bool,
    /// Bind address (e.g., "0.0.0.0:5001").
    pub bind: String,
    /// Internal field name to the name the station sends.
    pub field_mapping: BTreeMap<String, String>,
    /// Fields every push must carry.
    pub required_fields: Vec<String>,
    /// Plausible `[min, max]` per internal field. Values outside are logged
    /// and kept.
    pub value_ranges: BTreeMap<String, [f64; 2]>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:5001".to_string(),
            field_mapping: BTreeMap::new(),
            required_fields: Vec::new(),
            value_ranges: BTreeMap::new(),
        }
    }
}

impl ReceiverConfig {
    /// Validate receiver configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(message) = validate_bind(&self.bind) {
            errors.push(ValidationError::new("receiver.bind", message));
        }

        for (name, [min, max]) in &self.value_ranges {
            if min > max {
                errors.push(ValidationError::new(
                    format!("receiver.value_ranges.{}", name),
                    format!("minimum {} is greater than maximum {}", min, max),
                ));
            }
        }

        errors
    }
}

/// Check a `host:port` bind address.
fn validate_bind(bind: &str) -> Result<(), String> {
    if bind.is_empty() {
        return Err("bind address cannot be empty".to_string());
    }
    let Some((_, port)) = bind.rsplit_once(':') else {
        return Err(format!(
            "invalid bind address '{}': expected format 'host:port'",
            bind
        ));
    };
    match port.parse::<u16>() {
        Ok(_) => Ok(()),
        Err(_) => Err(format!("invalid port '{}': must be a number 0-65535", port)),
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Wait before restarting a service, in seconds.
    pub restart_delay_secs: u64,
    /// How long `stop` waits for a service to finish, in seconds.
    pub stop_timeout_secs: u64,
    /// Gap between service launches at startup, in milliseconds.
    pub startup_stagger_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_secs: 10,
            stop_timeout_secs: 10,
            startup_stagger_ms: 500,
        }
    }
}

impl SupervisorConfig {
    /// Validate supervisor configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.stop_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "supervisor.stop_timeout_secs",
                "stop timeout must be at least 1 second",
            ));
        }

        errors
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn startup_stagger(&self) -> Duration {
        Duration::from_millis(self.startup_stagger_ms)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `upload.url` or `meters.addresses[0]`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldgate")
        .join("server.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(result: Result<(), ConfigError>) -> Vec<String> {
        match result {
            Err(ConfigError::Validation(errors)) => errors.into_iter().map(|e| e.field).collect(),
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.receiver.bind, "0.0.0.0:5001");
        assert_eq!(config.meters.aggregation_window_secs, 300);
        assert_eq!(config.meters.max_retries, 2);
        assert_eq!(config.retention.days, 7);
        assert_eq!(config.supervisor.restart_delay(), Duration::from_secs(10));
        assert!(!config.upload.enabled);
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.path, fieldgate_store::default_db_path());
    }

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [storage]
            path = "/data/fieldgate.db"

            [meters]
            port = "/dev/ttyAMA0"
            direction_control = true
            aggregation_window_secs = 60
            addresses = [1, 2, 7]
            max_retries = 3

            [upload]
            enabled = true
            url = "https://collector.example.com/api/ingest"
            api_key = "secret"
            batch_size = 50

            [retention]
            days = 14

            [receiver]
            bind = "127.0.0.1:5001"
            required_fields = ["sensor_id", "temp"]

            [receiver.field_mapping]
            temperature = "temp"
            humidity = "hum"

            [receiver.value_ranges]
            temperature = [-40.0, 60.0]

            [supervisor]
            restart_delay_secs = 5
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.path, PathBuf::from("/data/fieldgate.db"));
        assert_eq!(config.meters.addresses, vec![1, 2, 7]);
        assert!(config.meters.direction_control);
        assert_eq!(config.meters.baud_rate, 9600);
        assert_eq!(config.upload.batch_size, 50);
        assert_eq!(config.upload.timeout_secs, 30);
        assert_eq!(config.retention.days, 14);
        assert!(config.retention.enabled);
        assert_eq!(config.receiver.field_mapping["temperature"], "temp");
        assert_eq!(config.receiver.value_ranges["temperature"], [-40.0, 60.0]);
        assert_eq!(config.supervisor.restart_delay_secs, 5);
        assert_eq!(config.supervisor.stop_timeout_secs, 10);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_meter_config_conversions() {
        let meters = MeterConfig {
            max_retries: 4,
            retry_backoff_ms: 25,
            read_timeout_ms: 300,
            settle_delay_us: 500,
            ..Default::default()
        };

        let options = meters.client_options();
        assert_eq!(options.retry.max_retries, 4);
        assert_eq!(options.retry.backoff_base, Duration::from_millis(25));
        assert_eq!(options.read_timeout, Duration::from_millis(300));

        let serial = meters.serial_config();
        assert_eq!(serial.settle_delay, Duration::from_micros(500));
        assert_eq!(serial.port, "/dev/ttyUSB0");
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("server.toml");

        let mut config = Config::default();
        config.storage.path = PathBuf::from("/tmp/test.db");
        config.meters.addresses = vec![3];
        config
            .receiver
            .field_mapping
            .insert("pressure".into(), "press".into());

        config.save(&config_path).unwrap();
        let loaded = Config::load_validated(&config_path).unwrap();

        assert_eq!(loaded.storage.path, PathBuf::from("/tmp/test.db"));
        assert_eq!(loaded.meters.addresses, vec![3]);
        assert_eq!(loaded.receiver.field_mapping["pressure"], "press");
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_upload_requires_endpoint_when_enabled() {
        let mut config = Config::default();
        config.upload.enabled = true;

        let errors = fields(config.validate());
        assert!(errors.contains(&"upload.url".to_string()));
        assert!(errors.contains(&"upload.api_key".to_string()));

        config.upload.url = "ftp://example.com".into();
        config.upload.api_key = "k".into();
        assert_eq!(fields(config.validate()), vec!["upload.url".to_string()]);
    }

    #[test]
    fn test_meter_address_validation() {
        let mut config = Config::default();
        config.meters.addresses = vec![1, 0, 1, 248];

        let errors = fields(config.validate());
        assert_eq!(
            errors,
            vec![
                "meters.addresses[1]".to_string(),
                "meters.addresses[2]".to_string(),
                "meters.addresses[3]".to_string(),
            ]
        );
    }

    #[test]
    fn test_window_bounds() {
        let mut config = Config::default();
        config.meters.aggregation_window_secs = 5;
        assert!(config.validate().is_err());

        config.meters.aggregation_window_secs = 7200;
        assert!(config.validate().is_err());

        config.meters.aggregation_window_secs = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_receiver_validation() {
        let mut config = Config::default();
        config.receiver.bind = "no-port".into();
        config
            .receiver
            .value_ranges
            .insert("humidity".into(), [100.0, 0.0]);

        let errors = fields(config.validate());
        assert_eq!(
            errors,
            vec![
                "receiver.bind".to_string(),
                "receiver.value_ranges.humidity".to_string(),
            ]
        );
    }

    #[test]
    fn test_multiple_errors_collected() {
        let mut config = Config::default();
        config.storage.path = PathBuf::new();
        config.retention.days = 0;
        config.supervisor.stop_timeout_secs = 0;

        let err = config.validate().unwrap_err();
        let display = err.to_string();
        assert!(display.contains("storage.path"));
        assert!(display.contains("retention.days"));
        assert!(display.contains("supervisor.stop_timeout_secs"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("fieldgate/server.toml"));
    }
}
