//! Configuration loading using Figment.
//!
//! Configuration is layered, later layers overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/dcam.toml` (or the file given with `--config`)
//! 3. Environment variables prefixed with `DCAM_`, using `__` between sections
//!
//! # Example
//! ```no_run
//! use hamamatsu_dcam::config::DcamConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // DCAM_ACQUISITION__BUFFER_COUNT=16 overrides the file value
//! let config = DcamConfig::load()?;
//! config.validate()?;
//! println!("ring capacity cap: {}", config.acquisition.buffer_count);
//! # Ok(())
//! # }
//! ```

use crate::error::{DcamError, DcamResult};
use crate::logging::OutputFormat;
use crate::property::PixelType;
use crate::ring::OverflowPolicy;
use crate::stream::Scheduling;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/dcam.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DcamConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Buffer ring and stream settings
    pub acquisition: AcquisitionConfig,
    /// Simulated cameras used when no vendor driver is present
    pub simulator: SimulatorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "dcam".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Acquisition settings shared by every stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Upper bound on the number of buffers in a ring
    pub buffer_count: usize,
    /// How long `take_next()` waits before failing with a timeout
    pub frame_timeout_ms: u64,
    /// Bounded wait per driver poll when the consumer drives the driver itself
    pub poll_interval_ms: u64,
    /// What the producer does when every buffer is still held by the consumer
    pub overflow_policy: OverflowPolicy,
    /// Whether completions are pumped by a capture thread or polled by the consumer
    pub scheduling: Scheduling,
    /// Largest ring (in bytes) a stream may allocate
    pub max_ring_bytes: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            buffer_count: 8,
            frame_timeout_ms: 1000,
            poll_interval_ms: 10,
            overflow_policy: OverflowPolicy::Stall,
            scheduling: Scheduling::CaptureThread,
            max_ring_bytes: 1 << 30,
        }
    }
}

impl AcquisitionConfig {
    /// Timeout applied to each blocking pull.
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Bounded wait for one cooperative poll.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Simulated camera settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Number of cameras reported by enumeration
    pub device_count: usize,
    /// Model string reported in the identity
    pub model: String,
    /// Full sensor width in pixels
    pub sensor_width: u32,
    /// Full sensor height in pixels
    pub sensor_height: u32,
    /// Pixel format of produced frames
    pub pixel_type: PixelType,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            model: "C13440-20CU".to_string(),
            sensor_width: 2048,
            sensor_height: 2048,
            pixel_type: PixelType::Mono16,
        }
    }
}

impl DcamConfig {
    /// Load configuration from `config/dcam.toml` and environment variables.
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load() -> DcamResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> DcamResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(DcamError::from)
    }

    /// The provider stack used by [`DcamConfig::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(DcamConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DCAM_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DcamResult<()> {
        crate::logging::parse_log_level(&self.application.log_level).map_err(DcamError::Config)?;

        if self.acquisition.buffer_count == 0 {
            return Err(DcamError::Config(
                "acquisition.buffer_count must be at least 1".to_string(),
            ));
        }
        if self.acquisition.frame_timeout_ms == 0 || self.acquisition.poll_interval_ms == 0 {
            return Err(DcamError::Config(
                "acquisition timeouts must be non-zero".to_string(),
            ));
        }
        if self.acquisition.max_ring_bytes == 0 {
            return Err(DcamError::Config(
                "acquisition.max_ring_bytes must be non-zero".to_string(),
            ));
        }

        if self.simulator.sensor_width == 0 || self.simulator.sensor_height == 0 {
            return Err(DcamError::Config(format!(
                "Invalid simulated sensor size {}x{}",
                self.simulator.sensor_width, self.simulator.sensor_height
            )));
        }

        Ok(())
    }
}
