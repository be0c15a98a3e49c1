//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/daq_comm.toml` (or an explicit path)
//! 2. Environment variables prefixed with `DAQ_COMM_`, nested keys separated
//!    by `__` (for example `DAQ_COMM_SESSION__MAX_ATTEMPTS=5`)
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "compact"
//!
//! [session]
//! max_attempts = 3
//! max_reconnects = 1
//! poll_interval = "50ms"
//!
//! [transport]
//! timeout = "200ms"
//! baud_rate = 19200
//!
//! [[devices]]
//! name = "henon"
//! driver = "henon"
//! address = "sim"
//! presets = [{ knob = "a", value = 1.2 }]
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::address::Address;
use crate::channel::ChannelMediator;
use crate::device::{Binding, DeviceOptions, KnobSetting};
use crate::error::{CommError, CommResult};
use crate::recovery::RetryPolicy;
use crate::tracing_setup::{parse_log_level, OutputFormat};
use crate::transport::{self, BackendKind, TransportSettings};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_comm.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_COMM_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Log output settings
    pub logging: LoggingConfig,
    /// Recovery policy applied to every session
    pub session: RetryPolicy,
    /// Transport settings for backends selected by a device's `backend` key
    pub transport: TransportSettings,
    /// Device definitions
    pub devices: Vec<DeviceDefinition>,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is not set
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device name
    pub name: String,
    /// Driver identifier (see [`crate::drivers::driver_for`])
    pub driver: String,
    /// Instrument address
    pub address: Address,
    /// Use only this backend instead of the driver's preference list
    #[serde(default)]
    pub backend: Option<BackendKind>,
    /// Transport settings replacing the global ones for this device
    #[serde(default)]
    pub transport: Option<TransportSettings>,
    /// Preset overrides, applied in order
    #[serde(default)]
    pub presets: Vec<KnobSetting>,
    /// Postset overrides, applied in order
    #[serde(default)]
    pub postsets: Vec<KnobSetting>,
    /// Whether this device is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl CommConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment
    pub fn load() -> CommResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> CommResult<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Load from a TOML string and the environment
    pub fn from_toml_str(toml: &str) -> CommResult<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> CommResult<Self> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> CommResult<()> {
        parse_log_level(&self.logging.level)?;

        if self.session.max_attempts == 0 {
            return Err(CommError::Configuration(
                "session.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.session.poll_interval.is_zero() {
            return Err(CommError::Configuration(
                "session.poll_interval must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(CommError::Configuration(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
        }

        Ok(())
    }

    /// Enabled devices, in file order
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled)
    }

    /// Device definition by name
    pub fn device(&self, name: &str) -> Option<&DeviceDefinition> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Options for constructing the device `definition` describes.
    pub fn device_options(
        &self,
        definition: &DeviceDefinition,
        mediator: Arc<ChannelMediator>,
    ) -> CommResult<DeviceOptions> {
        let mut options = DeviceOptions::new(mediator)
            .with_name(&definition.name)
            .with_presets(definition.presets.clone())
            .with_postsets(definition.postsets.clone())
            .with_policy(self.session.clone());

        // Driver bindings keep their own settings unless the device overrides them
        if let Some(settings) = &definition.transport {
            options = options.with_settings(settings.clone());
        }

        if let Some(kind) = definition.backend {
            let settings = definition
                .transport
                .clone()
                .unwrap_or_else(|| self.transport.clone());
            let backend = transport::backend_for(kind).ok_or_else(|| {
                CommError::Configuration(format!(
                    "device {}: backend '{}' cannot be selected from configuration",
                    definition.name, kind
                ))
            })?;
            options = options.with_binding(Binding::new(backend, settings));
        }

        Ok(options)
    }
}
