//! Subscriber setup for the `dcam` binary and for tests.
//!
//! The library only emits `tracing` events and never installs a subscriber
//! itself. `RUST_LOG` takes precedence over the configured level, so a
//! single module can be turned up without editing the config file:
//!
//! ```text
//! RUST_LOG=hamamatsu_dcam::ring=trace dcam acquire -n 5
//! ```
//!
//! # Example
//! ```no_run
//! use hamamatsu_dcam::{config::DcamConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DcamConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(device = 0, "camera opened");
//! # Ok(())
//! # }
//! ```

use crate::config::DcamConfig;
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// How log lines are rendered on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, human oriented, colored on a terminal
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

/// Settings for [`init`].
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Rendering of each event
    pub format: OutputFormat,
    /// Source location on every event; on by default at debug and trace
    pub with_file_and_line: bool,
}

impl TracingConfig {
    /// Defaults for `level`: pretty output, source locations when verbose.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::Pretty,
            with_file_and_line: level >= Level::DEBUG,
        }
    }

    /// Level and format from the `application` config section.
    pub fn from_config(config: &DcamConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;
        Ok(Self::new(level).with_format(config.application.log_format))
    }

    /// Replace the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

/// [`init`] with settings taken from `config`.
pub fn init_from_config(config: &DcamConfig) -> Result<(), String> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// A subscriber that is already installed (a second call, or a test harness)
/// is left in place and reported as success.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    // Capture threads are named per device index.
    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line);

    let layer = match config.format {
        OutputFormat::Pretty => base
            .pretty()
            .with_ansi(std::io::stderr().is_terminal())
            .with_filter(filter)
            .boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
        OutputFormat::Json => base.json().with_filter(filter).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(err) if err.to_string().contains("already") => Ok(()),
        Err(err) => Err(format!("Failed to initialize tracing: {}", err)),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}
