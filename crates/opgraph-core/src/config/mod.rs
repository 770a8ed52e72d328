//! Runtime configuration.
//!
//! Configuration is layered the same way everywhere:
//! 1. `config/default.toml` (base settings)
//! 2. `config/{OPGRAPH_ENV}.toml` (environment-specific)
//! 3. Environment variables with the `OPGRAPH__` prefix, `__` separated
//!    (`OPGRAPH__DEVICE__DEFAULT_DEVICE=1`)


use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Upper bound on device indices a process may address.
pub const MAX_DEVICES: usize = 16;

/// Which device backend to install.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// CUDA when compiled in and a device is visible, simulated otherwise.
    #[default]
    Auto,
    /// Real CUDA devices; initialization fails without them.
    Cuda,
    /// In-process simulated devices.
    Simulated,
}

/// What a context does when the blocking synchronize in its destructor
/// reports a device error.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncFailurePolicy {
    /// Log and abort the process.
    #[default]
    Abort,
    /// Log and panic (unwinds unless already panicking).
    Panic,
}

/// Device selection and backend settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    /// Device used when a context or descriptor names none.
    pub default_device: usize,
    /// Number of devices the simulated backend exposes.
    pub simulated_devices: usize,
    /// Per-device memory capacity of the simulated backend.
    pub simulated_memory_bytes: usize,
    pub sync_failure: SyncFailurePolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            default_device: 0,
            simulated_devices: 2,
            simulated_memory_bytes: 1 << 30,
            sync_failure: SyncFailurePolicy::Abort,
        }
    }
}

/// Device memory pool settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Keep released blocks for reuse instead of freeing them.
    pub caching: bool,
    /// Cached block sizes are rounded up to a multiple of this.
    pub block_rounding: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            caching: true,
            block_rounding: 512,
        }
    }
}

/// Logging settings consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `opgraph_cuda=debug`.
    pub level: String,
    /// `pretty`, `compact` or `full`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device: DeviceConfig,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load configuration from files and environment.
    pub fn load() -> CoreResult<Self> {
        let env = std::env::var("OPGRAPH_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("OPGRAPH").separator("__"));

        let config: RuntimeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: RuntimeConfig = toml::from_str(&content)
            .map_err(|e| CoreError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> CoreResult<()> {
        if self.device.simulated_devices == 0 {
            return Err(CoreError::ConfigError(
                "device.simulated_devices must be greater than 0".into(),
            ));
        }
        if self.device.simulated_devices > MAX_DEVICES {
            return Err(CoreError::ConfigError(format!(
                "device.simulated_devices must be at most {}, got {}",
                MAX_DEVICES, self.device.simulated_devices
            )));
        }
        if self.device.default_device >= MAX_DEVICES {
            return Err(CoreError::ConfigError(format!(
                "device.default_device must be below {}, got {}",
                MAX_DEVICES, self.device.default_device
            )));
        }
        if self.memory.block_rounding == 0 || !self.memory.block_rounding.is_power_of_two() {
            return Err(CoreError::ConfigError(format!(
                "memory.block_rounding must be a non-zero power of two, got {}",
                self.memory.block_rounding
            )));
        }
        match self.logging.format.as_str() {
            "pretty" | "compact" | "full" => {}
            other => {
                return Err(CoreError::ConfigError(format!(
                    "logging.format must be pretty, compact or full, got '{}'",
                    other
                )))
            }
        }
        Ok(())
    }
}
