//! Service configuration
//!
//! Priority (highest to lowest):
//! 1. Environment variables (`PLCSRV_`, sections split on `__`)
//! 2. Config file (`config/plcsrv.yaml` unless overridden)
//! 3. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::ProcessorType;
use crate::device::DeviceConfig;
use crate::error::{PlcError, Result};
use crate::poller::{clamp_interval, MAX_POLL_INTERVAL, MIN_POLL_INTERVAL};
use crate::signal::{AddressMode, CodecOptions, RegistryOptions, WordOrder};
use crate::transport::TransportConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/plcsrv.yaml";
pub const ENV_PREFIX: &str = "PLCSRV_";
pub const SERVICE_NAME: &str = "plcsrv";

const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Modbus request limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Per-request timeout; unset means the device record's `timeout`
    pub timeout_ms: Option<u64>,
    pub retries: u32,
    pub connect_timeout_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            retries: 3,
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub interval_ms: u64,
    /// Start polling as soon as signals are loaded
    pub autostart: bool,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            autostart: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecSection {
    pub word_order: WordOrder,
    pub address_mode: AddressMode,
    pub unit_scale_is_identity: bool,
}

impl Default for CodecSection {
    fn default() -> Self {
        let codec = CodecOptions::default();
        Self {
            word_order: codec.word_order,
            address_mode: AddressMode::default(),
            unit_scale_is_identity: codec.unit_scale_is_identity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// Directory for daily rotated log files
    pub dir: PathBuf,
    pub json: bool,
    /// Write log files in addition to the console
    pub file: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("logs"),
            json: false,
            file: false,
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcsrvConfig {
    pub device: DeviceConfig,
    /// Vendor profile; falls back to the device record when blank
    pub processor_type: String,
    pub transport: TransportSection,
    pub reconnect: ReconnectSection,
    pub polling: PollingSection,
    pub codec: CodecSection,
    /// JSON array of signal records
    pub signals_file: Option<PathBuf>,
    pub logging: LoggingSection,
    /// File the settings were read from, if any
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl PlcsrvConfig {
    /// Load from the default path plus environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` plus environment. A missing file yields defaults and
    /// leaves `source` empty.
    ///
    /// This usually runs before logging is up, so callers report `source`
    /// themselves once it is.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut figment = Figment::new();
        let source = if path.exists() {
            figment = merge_file(figment, path)?;
            Some(path.to_path_buf())
        } else {
            None
        };
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment.extract()?;
        config.source = source;
        debug!(source = ?config.source, "Config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.device
            .validate()
            .map_err(|e| PlcError::config(format!("device: {}", e)))?;

        if self.transport.timeout_ms == Some(0) {
            return Err(PlcError::config("transport.timeout_ms must be greater than 0"));
        }
        if self.transport.connect_timeout_ms == 0 {
            return Err(PlcError::config(
                "transport.connect_timeout_ms must be greater than 0",
            ));
        }
        if self.reconnect.enabled && self.reconnect.interval_ms == 0 {
            return Err(PlcError::config("reconnect.interval_ms must be greater than 0"));
        }
        if self.polling.interval_ms == 0 {
            return Err(PlcError::config("polling.interval_ms must be greater than 0"));
        }
        if self.logging.level.trim().is_empty() {
            return Err(PlcError::config("logging.level is empty"));
        }
        if let Some(path) = &self.signals_file {
            if !path.exists() {
                return Err(PlcError::config(format!(
                    "signals_file {} not found",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn processor(&self) -> ProcessorType {
        if self.processor_type.trim().is_empty() {
            self.device.processor()
        } else {
            ProcessorType::parse(&self.processor_type)
        }
    }

    /// Per-request timeout: the transport section wins, then the device record
    pub fn request_timeout(&self) -> Duration {
        let ms = self.transport.timeout_ms.unwrap_or_else(|| {
            u64::try_from(self.device.timeout_ms)
                .ok()
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_TIMEOUT_MS)
        });
        Duration::from_millis(ms)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            timeout: self.request_timeout(),
            retries: self.transport.retries,
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect.interval_ms)
    }

    /// Poll interval clamped to the supported window
    pub fn poll_interval(&self) -> Duration {
        let requested = Duration::from_millis(self.polling.interval_ms);
        let interval = clamp_interval(requested);
        if interval != requested {
            warn!(
                "polling.interval_ms {} clamped to {} ({}..={} ms)",
                self.polling.interval_ms,
                interval.as_millis(),
                MIN_POLL_INTERVAL.as_millis(),
                MAX_POLL_INTERVAL.as_millis()
            );
        }
        interval
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            codec: CodecOptions {
                word_order: self.codec.word_order,
                unit_scale_is_identity: self.codec.unit_scale_is_identity,
            },
            address_mode: self.codec.address_mode,
        }
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match extension.as_str() {
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        "json" => Ok(figment.merge(Json::file(path))),
        "toml" => Ok(figment.merge(Toml::file(path))),
        _ => Err(PlcError::config(format!(
            "Unsupported config file format: {}",
            path.display()
        ))),
    }
}
