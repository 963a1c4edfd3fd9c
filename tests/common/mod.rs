//! Shared fixtures for integration tests against the simulated driver.

#![allow(dead_code)]

use hamamatsu_dcam::config::SimulatorConfig;
use hamamatsu_dcam::driver::sim::SimDriver;
use hamamatsu_dcam::{Camera, Driver, DriverSession, PropertyId, StreamOptions};
use std::sync::Arc;
use std::time::Duration;

pub const WIDTH: usize = 64;
pub const HEIGHT: usize = 32;

/// Shortest exposure the simulated camera accepts.
pub const FAST_EXPOSURE: f64 = 1e-3;

/// Value of the trigger source option that waits for software triggers.
pub const TRIGGER_SOFTWARE: i32 = 3;

/// Small sensor so rings stay tiny.
pub fn sim_config(device_count: usize) -> SimulatorConfig {
    SimulatorConfig {
        device_count,
        sensor_width: WIDTH as u32,
        sensor_height: HEIGHT as u32,
        ..Default::default()
    }
}

pub fn session(device_count: usize) -> (Arc<SimDriver>, Arc<DriverSession>) {
    let sim = Arc::new(SimDriver::new(sim_config(device_count)));
    let driver: Arc<dyn Driver> = sim.clone();
    let session = DriverSession::init(driver).expect("Failed to initialize simulator");
    (sim, session)
}

pub fn options(buffer_count: usize) -> StreamOptions {
    StreamOptions::default()
        .with_buffer_count(buffer_count)
        .with_timeout(Duration::from_secs(2))
}

/// Open camera 0 with the fastest frame rate.
pub fn fast_camera(session: &Arc<DriverSession>, buffer_count: usize) -> Camera {
    let camera = Camera::open_index(Arc::clone(session), 0)
        .expect("Failed to open camera")
        .with_options(options(buffer_count));
    camera
        .set(PropertyId::ExposureTime, FAST_EXPOSURE)
        .expect("Failed to set exposure");
    camera
}
