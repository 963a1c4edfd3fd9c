//! CLI entry point for hamamatsu_dcam
//!
//! Provides command-line access to the acquisition core:
//! - Listing connected cameras
//! - Dumping identity and property tables
//! - Timed acquisition with frame count and exposure
//!
//! # Usage
//!
//! ```bash
//! dcam scan
//! dcam dump --id 0 --json
//! dcam acquire --id 0 -n 10 -e 0.1
//! DCAM_ACQUISITION__BUFFER_COUNT=16 dcam acquire -n 100
//! ```
//!
//! Without the vendor DCAM-API the cameras come from the built-in simulator,
//! configured by the `[simulator]` config section.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hamamatsu_dcam::config::{DcamConfig, DEFAULT_CONFIG_PATH};
use hamamatsu_dcam::driver::sim::SimDriver;
use hamamatsu_dcam::logging::{self, OutputFormat, TracingConfig};
use hamamatsu_dcam::{Camera, DeviceIdentity, DriverSession, PixelType, PropertyId};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dcam")]
#[command(about = "Hamamatsu DCAM camera control and acquisition", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the configured log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected cameras
    Scan,

    /// Show identity of one camera
    Info {
        /// Camera index
        #[arg(long, default_value_t = 0)]
        id: usize,
    },

    /// Show every property of one camera
    Dump {
        /// Camera index
        #[arg(long, default_value_t = 0)]
        id: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Capture frames
    Acquire {
        /// Camera index
        #[arg(long, default_value_t = 0)]
        id: usize,

        /// Number of frames
        #[arg(short = 'n', long, default_value_t = 10)]
        nb_frames: u64,

        /// Exposure time in seconds
        #[arg(short = 'e', long, default_value_t = 0.1)]
        exposure: f64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DcamConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    config.validate()?;

    let tracing = TracingConfig::from_config(&config).map_err(anyhow::Error::msg)?;
    logging::init(tracing).map_err(anyhow::Error::msg)?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let driver = Arc::new(SimDriver::new(config.simulator.clone()));
    let session = DriverSession::init(driver).context("failed to initialize DCAM")?;

    let result = match cli.command {
        Commands::Scan => scan(&session),
        Commands::Info { id } => show_info(&session, id),
        Commands::Dump { id, json } => dump(&session, &config, id, json),
        Commands::Acquire {
            id,
            nb_frames,
            exposure,
        } => acquire(Arc::clone(&session), config, id, nb_frames, exposure).await,
        Commands::Config => Ok(()),
    };

    session.shutdown();
    result
}

fn identity_row(identity: &DeviceIdentity) -> [String; 10] {
    [
        identity.index.to_string(),
        identity.vendor.clone(),
        identity.model.clone(),
        identity.serial_number().to_string(),
        identity.bus.clone(),
        identity.camera_version.clone(),
        identity.driver_version.clone(),
        identity.module_version.clone(),
        identity.api_version.clone(),
        identity.series_name.clone(),
    ]
}

fn print_table<const N: usize>(header: [&str; N], rows: &[[String; N]]) {
    let mut widths = header.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join("  ")
    };
    println!("{}", line(header.to_vec()));
    println!("{}", line(widths.iter().map(|_| "").collect()).replace(' ', "-"));
    for row in rows {
        println!("{}", line(row.iter().map(String::as_str).collect()));
    }
}

fn scan(session: &Arc<DriverSession>) -> Result<()> {
    let identities = session.identities()?;
    if identities.is_empty() {
        println!("No cameras found");
        return Ok(());
    }
    let rows: Vec<_> = identities.iter().map(identity_row).collect();
    print_table(
        ["ID", "Vendor", "Model", "S/N", "Bus", "Version", "Driver", "Module", "API", "Series"],
        &rows,
    );
    Ok(())
}

fn show_info(session: &Arc<DriverSession>, id: usize) -> Result<()> {
    let camera = Camera::open_index(Arc::clone(session), id)
        .with_context(|| format!("failed to open camera {}", id))?;
    let identity = camera.info()?;
    let (px_w, px_h) = camera.pixel_size()?;
    let geometry = camera.geometry()?;

    println!("Vendor:      {}", identity.vendor);
    println!("Model:       {}", identity.model);
    println!("Serial:      {}", identity.serial_number());
    println!("Bus:         {}", identity.bus);
    println!("Version:     {}", identity.camera_version);
    println!("Driver:      {}", identity.driver_version);
    println!("Module:      {}", identity.module_version);
    println!("API:         {}", identity.api_version);
    println!("Series:      {}", identity.series_name);
    println!("Status:      {}", camera.status()?);
    println!("Image:       {}x{} {}", geometry.width, geometry.height, geometry.pixel_type.label());
    println!("Pixel size:  {:.2} x {:.2} um", px_w * 1e6, px_h * 1e6);
    Ok(())
}

fn dump(session: &Arc<DriverSession>, config: &DcamConfig, id: usize, json: bool) -> Result<()> {
    let camera = Camera::open_index(Arc::clone(session), id)
        .with_context(|| format!("failed to open camera {}", id))?
        .with_config(config);
    let properties = camera.properties()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&properties)?);
        return Ok(());
    }

    let rows: Vec<[String; 4]> = properties
        .iter()
        .map(|entry| {
            [
                entry.name.clone(),
                entry
                    .value
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_string()),
                entry.descriptor.unit.symbol().to_string(),
                format!("{:?}", entry.descriptor.kind),
            ]
        })
        .collect();
    print_table(["Name", "Value", "Unit", "DType"], &rows);
    Ok(())
}

async fn acquire(
    session: Arc<DriverSession>,
    config: DcamConfig,
    id: usize,
    nb_frames: u64,
    exposure: f64,
) -> Result<()> {
    let camera = Camera::open_index(session, id)
        .with_context(|| format!("failed to open camera {}", id))?
        .with_config(&config);
    camera
        .set(PropertyId::ExposureTime, exposure)
        .context("failed to set exposure time")?;

    let mut stream = camera.start(Some(nb_frames))?;
    let stop = stream.stop_handle();
    let ctrl_c = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping acquisition");
            stop.stop();
        }
    });

    let received = tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut received = 0;
        while let Some(frame) = stream.next_frame()? {
            let mean = match frame.pixel_type() {
                PixelType::Mono16 => {
                    let data = frame.data();
                    let sum: u64 = data
                        .chunks_exact(2)
                        .map(|b| u64::from(u16::from_le_bytes([b[0], b[1]])))
                        .sum();
                    sum as f64 / (data.len() / 2).max(1) as f64
                }
                _ => frame.data().iter().map(|&b| f64::from(b)).sum::<f64>() / frame.data().len().max(1) as f64,
            };
            println!(
                "frame {:>6}  t={:>12.6}s  buffer={:<3} {}x{}  mean={:.1}",
                frame.sequence(),
                frame.timestamp().as_secs_f64(),
                frame.index(),
                frame.width(),
                frame.height(),
                mean
            );
            received += 1;
        }
        let stats = stream.stats();
        info!(delivered = stats.delivered, dropped = stats.dropped, stalls = stats.stalls, "stream finished");
        drop(stream);
        drop(camera);
        Ok(received)
    })
    .await??;

    ctrl_c.abort();
    println!("Acquired {} of {} frames", received, nb_frames);
    Ok(())
}
