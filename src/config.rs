//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `CAMD_`, nested keys separated by `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! CAMD_APPLICATION__LOG_LEVEL=debug
//! CAMD_CAMERA__EXPOSURE_MAX=600
//! CAMD_POLL__IDLE_TIMEOUT_MS=500
//! ```
//!
//! Every section has defaults, so an empty file yields a one-chip simulated
//! camera.
//!
//! # Example
//!
//! ```no_run
//! use camd::config::CamdConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = CamdConfig::load_from("config/camd.toml")?;
//!     println!("Camera: {}", config.camera.name);
//!     println!("Chips: {}", config.simulator.chips.len());
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::simulator::SimulatedChipConfig;

/// Longest exposure the configuration accepts, in seconds (one year).
pub const EXPOSURE_LIMIT_SECS: f64 = 365.0 * 86_400.0;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but make no sense together.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CamdConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// State machine settings
    #[serde(default)]
    pub camera: CameraConfig,
    /// Poll loop cadence
    #[serde(default)]
    pub poll: PollConfig,
    /// Simulated sensors
    #[serde(default)]
    pub simulator: SimulatorConfig,
    /// Simulated cooler, absent when the camera has none
    #[serde(default)]
    pub cooler: Option<CoolerConfig>,
    /// Simulated filter wheel, absent when the camera has none
    #[serde(default)]
    pub filter_wheel: Option<FilterWheelConfig>,
}

/// Application-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Device name used in logs
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// State machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Camera name
    #[serde(default = "default_camera_name")]
    pub name: String,
    /// Upper bound on the number of chips
    #[serde(default = "default_max_chips")]
    pub max_chips: usize,
    /// Shortest accepted exposure, seconds
    #[serde(default)]
    pub exposure_min: f64,
    /// Longest accepted exposure, seconds
    #[serde(default = "default_exposure_max")]
    pub exposure_max: f64,
    /// Start readout as soon as an exposure ends
    #[serde(default = "default_true")]
    pub auto_readout: bool,
    /// Collect pixel statistics during readout
    #[serde(default = "default_true")]
    pub statistics: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: default_camera_name(),
            max_chips: default_max_chips(),
            exposure_min: 0.0,
            exposure_max: default_exposure_max(),
            auto_readout: true,
            statistics: true,
        }
    }
}

/// Poll loop cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Sleep when nothing is in flight
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Shortest sleep between ticks while data flows
    #[serde(default)]
    pub min_interval_us: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            min_interval_us: 0,
        }
    }
}

impl PollConfig {
    /// Idle sleep as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Minimum sleep as a duration.
    pub fn min_interval(&self) -> Duration {
        Duration::from_micros(self.min_interval_us)
    }
}

/// Simulated sensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// One entry per chip
    #[serde(default = "default_sim_chips")]
    pub chips: Vec<SimulatedChipConfig>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            chips: default_sim_chips(),
        }
    }
}

/// Simulated cooler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoolerConfig {
    /// Temperature with cooling off, degrees Celsius
    #[serde(default = "default_ambient")]
    pub ambient: f64,
    /// Lowest reachable setpoint, degrees Celsius
    #[serde(default = "default_min_temp")]
    pub min_temp: f64,
}

/// Simulated filter wheel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterWheelConfig {
    /// Number of positions
    #[serde(default = "default_filter_positions")]
    pub positions: u32,
}

// Default value functions
fn default_app_name() -> String {
    "camd".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_camera_name() -> String {
    "C0".to_string()
}

fn default_max_chips() -> usize {
    4
}

fn default_exposure_max() -> f64 {
    3600.0
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout_ms() -> u64 {
    1000
}

fn default_sim_chips() -> Vec<SimulatedChipConfig> {
    vec![SimulatedChipConfig::default()]
}

fn default_ambient() -> f64 {
    20.0
}

fn default_min_temp() -> f64 {
    -40.0
}

fn default_filter_positions() -> u32 {
    5
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl CamdConfig {
    /// Load configuration from a specific file path
    ///
    /// # Arguments
    /// * `path` - TOML file; a missing file leaves every value at its default
    ///
    /// # Errors
    /// * `LoadError` - the file or an environment variable could not be parsed
    /// * `ValidationError` - values are inconsistent
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(CamdConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CAMD_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    ///
    /// # Errors
    /// Same as [`CamdConfig::load_from`].
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(CamdConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    /// `ValidationError` if a value has no TOML representation.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate configuration values
    ///
    /// # Errors
    /// `ValidationError` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let camera = &self.camera;
        if camera.max_chips == 0 {
            return Err(ConfigError::ValidationError(
                "max_chips must be at least 1".to_string(),
            ));
        }
        if !camera.exposure_min.is_finite()
            || !camera.exposure_max.is_finite()
            || camera.exposure_min < 0.0
            || camera.exposure_min > camera.exposure_max
            || camera.exposure_max > EXPOSURE_LIMIT_SECS
        {
            return Err(ConfigError::ValidationError(format!(
                "Invalid exposure range [{}, {}]",
                camera.exposure_min, camera.exposure_max
            )));
        }

        if self.poll.idle_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "idle_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let chips = &self.simulator.chips;
        if chips.is_empty() || chips.len() > camera.max_chips {
            return Err(ConfigError::ValidationError(format!(
                "{} chips configured, expected 1..={}",
                chips.len(),
                camera.max_chips
            )));
        }
        for chip in chips {
            self.validate_chip(chip)?;
        }

        if let Some(cooler) = &self.cooler {
            if cooler.min_temp >= cooler.ambient {
                return Err(ConfigError::ValidationError(format!(
                    "cooler min_temp {} must be below ambient {}",
                    cooler.min_temp, cooler.ambient
                )));
            }
        }
        if let Some(wheel) = &self.filter_wheel {
            if wheel.positions == 0 {
                return Err(ConfigError::ValidationError(
                    "filter wheel needs at least one position".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn validate_chip(&self, chip: &SimulatedChipConfig) -> Result<(), ConfigError> {
        if chip.width == 0 || chip.height == 0 {
            return Err(ConfigError::ValidationError(format!(
                "chip '{}' has empty geometry {}x{}",
                chip.name, chip.width, chip.height
            )));
        }
        if chip.binnings.is_empty()
            || chip
                .binnings
                .iter()
                .any(|b| b.vertical == 0 || b.horizontal == 0)
        {
            return Err(ConfigError::ValidationError(format!(
                "chip '{}' needs non-zero binnings",
                chip.name
            )));
        }
        if chip.data_types.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "chip '{}' declares no data types",
                chip.name
            )));
        }
        if chip.channels == 0 {
            return Err(ConfigError::ValidationError(format!(
                "chip '{}' declares no channels",
                chip.name
            )));
        }
        Ok(())
    }
}
