//! Configuration module
//!
//! Handles loading and saving pvaccess configuration, and turns it into the
//! runtime [`NetworkConfig`](crate::network::NetworkConfig) and the records a
//! server hosts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::{self, FlushStrategy};
use crate::protocol::{DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT};
use crate::provider::MemoryProvider;
use crate::pvdata::{PvDataError, PvStructure, ScalarType, ScalarValue, Structure, DEFAULT_REGISTRY_MAX_SIZE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Record '{name}': {reason}")]
    InvalidRecord { name: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Server listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Connection settings shared by client and server
    #[serde(default)]
    pub transport: TransportConfig,

    /// Records served by `serve`
    #[serde(default, rename = "record")]
    pub records: Vec<RecordConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Receive buffer size advertised to clients
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: u32,
    /// Largest accepted message payload
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_receive_buffer_size() -> u32 {
    16 * 1024
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            receive_buffer_size: default_receive_buffer_size(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// How queued messages reach the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    #[default]
    Immediate,
    Buffered,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// TCP connect plus handshake timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Liveness interval in ms; idle connections are probed after one
    /// interval and flagged unresponsive after two
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default)]
    pub flush: FlushMode,
    /// Buffered mode writes once this many bytes are queued
    #[serde(default = "default_flush_max_bytes")]
    pub flush_max_bytes: usize,
    /// Client priority
    #[serde(default)]
    pub priority: i16,
    /// Maximum cached outgoing type descriptors per connection
    #[serde(default = "default_registry_max_size")]
    pub registry_max_size: u16,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_connection_timeout() -> u64 {
    30_000
}

fn default_flush_max_bytes() -> usize {
    16 * 1024
}

fn default_registry_max_size() -> u16 {
    DEFAULT_REGISTRY_MAX_SIZE
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            connection_timeout_ms: default_connection_timeout(),
            flush: FlushMode::default(),
            flush_max_bytes: default_flush_max_bytes(),
            priority: 0,
            registry_max_size: default_registry_max_size(),
        }
    }
}

/// A scalar record hosted by the in-memory provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    pub name: String,
    /// Scalar type name, e.g. `double`, `int`, `string`
    #[serde(rename = "type", default = "default_record_type")]
    pub value_type: String,
    /// Initial value, parsed as `type`
    pub value: Option<String>,
}

fn default_record_type() -> String {
    "double".to_string()
}

impl RecordConfig {
    /// Build the record's initial value
    pub fn build(&self) -> ConfigResult<PvStructure> {
        let invalid = |reason: String| ConfigError::InvalidRecord {
            name: self.name.clone(),
            reason,
        };
        let scalar_type = ScalarType::from_name(&self.value_type)
            .ok_or_else(|| invalid(format!("unknown type '{}'", self.value_type)))?;
        let mut value = PvStructure::new(Structure::nt_scalar(scalar_type));
        if let Some(text) = &self.value {
            let initial = ScalarValue::parse(scalar_type, text)
                .map_err(|e: PvDataError| invalid(e.to_string()))?;
            value
                .set("value", initial)
                .map_err(|e| invalid(e.to_string()))?;
        }
        Ok(value)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            Self::default_path(),
            Some(PathBuf::from("./pvaccess.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Per-user configuration file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("pvaccess/config.toml"))
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Runtime network settings
    pub fn network_config(&self) -> network::NetworkConfig {
        let flush_strategy = match self.transport.flush {
            FlushMode::Immediate => FlushStrategy::Immediate,
            FlushMode::Buffered => FlushStrategy::Buffered {
                max_bytes: self.transport.flush_max_bytes,
            },
        };
        network::NetworkConfig {
            bind_address: self
                .server
                .bind_address
                .clone()
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.server.port,
            connect_timeout_ms: self.transport.connect_timeout_ms,
            connection_timeout_ms: self.transport.connection_timeout_ms,
            flush_strategy,
            priority: self.transport.priority,
            receive_buffer_size: self.server.receive_buffer_size,
            max_message_size: self.server.max_message_size,
            registry_max_size: self.transport.registry_max_size,
        }
    }

    /// An in-memory provider holding the configured records
    pub fn build_provider(&self) -> ConfigResult<MemoryProvider> {
        let provider = MemoryProvider::new();
        for record in &self.records {
            provider.add_record(record.name.clone(), record.build()?);
        }
        Ok(provider)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        transport: TransportConfig {
            connection_timeout_ms: 15_000,
            ..Default::default()
        },
        records: vec![
            RecordConfig {
                name: "demo:setpoint".to_string(),
                value_type: "double".to_string(),
                value: Some("0.0".to_string()),
            },
            RecordConfig {
                name: "demo:mode".to_string(),
                value_type: "string".to_string(),
                value: Some("auto".to_string()),
            },
        ],
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.network_config().flush_strategy, FlushStrategy::Immediate);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.transport.flush = FlushMode::Buffered;
        config.transport.priority = 5;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.transport.flush, FlushMode::Buffered);
        assert_eq!(loaded.transport.priority, 5);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[transport]\nflush = \"buffered\"\nflush_max_bytes = 512\n\n[[record]]\nname = \"x\"\nvalue = \"2.5\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        let network = config.network_config();
        assert_eq!(network.flush_strategy, FlushStrategy::Buffered { max_bytes: 512 });
        assert_eq!(network.connection_timeout_ms, 30_000);

        let provider = config.build_provider().unwrap();
        let record = provider.record("x").unwrap();
        let value = tokio_test::block_on(record.snapshot());
        assert_eq!(value.scalar("value"), Some(&ScalarValue::Double(2.5)));
    }

    #[test]
    fn test_invalid_record() {
        let mut config = Config::default();
        config.records.push(RecordConfig {
            name: "bad".to_string(),
            value_type: "int".to_string(),
            value: Some("abc".to_string()),
        });
        assert!(matches!(
            config.build_provider(),
            Err(ConfigError::InvalidRecord { .. })
        ));

        config.records[0].value_type = "quaternion".to_string();
        assert!(config.build_provider().is_err());
    }

    #[test]
    fn test_missing_file() {
        let missing = Path::new("/nonexistent/pvaccess.toml");
        assert!(matches!(Config::load(missing), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert!(parsed.build_provider().is_ok());
    }
}
