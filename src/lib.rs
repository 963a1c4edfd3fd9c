//! # Hamamatsu DCAM Acquisition Core
//!
//! This crate is the acquisition core for Hamamatsu scientific cameras driven
//! through the DCAM API. It owns the pieces that must stay correct no matter
//! which frontend drives the camera: exclusive device ownership, validated
//! property access, the frame buffer ring shared with the driver, and ordered
//! frame delivery. The `dcam` binary (`main.rs`) is a thin CLI on top.
//!
//! ## Crate Structure
//!
//! - **`property`**: `PropertyId`, typed values, capability descriptors and the
//!   per-device `PropertyRegistry` that validates reads and writes.
//! - **`device`**: `DeviceHandle`, exclusive ownership of one open camera.
//! - **`ring`**: `BufferRing`, the fixed-capacity circular queue of frame
//!   buffers filled by the driver and drained in sequence order.
//! - **`stream`**: `AcquisitionStream`, start/stop and frame iteration, with a
//!   capture thread or cooperative polling.
//! - **`camera`**: `Camera`, the facade application code uses.
//! - **`driver`**: the `Driver` boundary, the `DriverSession`, and the
//!   in-process simulator (`driver::sim`, feature `sim`).
//! - **`config`**: figment-based configuration (`config/dcam.toml` + `DCAM_*`).
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: `DcamError` and `DcamResult`.
//!
//! ## Example
//!
//! ```no_run
//! use hamamatsu_dcam::driver::sim::SimDriver;
//! use hamamatsu_dcam::{Camera, DriverSession, PropertyId};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = DriverSession::init(Arc::new(SimDriver::default()))?;
//! let camera = Camera::open_index(Arc::clone(&session), 0)?;
//! camera.set(PropertyId::ExposureTime, 0.01)?;
//!
//! let mut stream = camera.start(Some(10))?;
//! while let Some(frame) = stream.next_frame()? {
//!     println!("frame {} at {:?}", frame.sequence(), frame.timestamp());
//! }
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod logging;
pub mod property;
pub mod ring;
pub mod stream;

pub use camera::Camera;
pub use config::DcamConfig;
pub use device::{CaptureState, DeviceHandle, Geometry};
pub use driver::{CaptureMode, CaptureStatus, DeviceId, DeviceIdentity, Driver, DriverSession, WaitOutcome};
pub use error::{DcamError, DcamResult};
pub use property::{
    PixelType, PropertyDescriptor, PropertyEntry, PropertyId, PropertyKey, PropertyKind, PropertyRegistry,
    PropertyValue, Unit,
};
pub use ring::{BufferRing, FrameBuffer, FrameStamp, OverflowPolicy, RingStats};
pub use stream::{AcquisitionStream, Frame, OwnedFrame, Scheduling, StopHandle, StreamOptions, StreamState};
