//! Camera facade: the single object application code talks to.
//!
//! [`Camera`] composes a [`DeviceHandle`] with stream construction. It keeps
//! no state of its own beyond the open handle and the default
//! [`StreamOptions`]; every invariant lives in the device and the stream.

use crate::config::DcamConfig;
use crate::device::{CaptureState, DeviceHandle, Geometry};
use crate::driver::{CaptureStatus, DeviceIdentity, DriverSession};
use crate::error::{DcamError, DcamResult};
use crate::property::{PropertyEntry, PropertyId, PropertyKey, PropertyValue};
use crate::stream::{AcquisitionStream, OwnedFrame, StreamOptions};
use std::sync::Arc;
use tracing::{info, instrument};

/// One camera, opened on demand, with default stream options.
///
/// Dropping the camera closes the device and stops its stream.
#[derive(Debug)]
pub struct Camera {
    session: Arc<DriverSession>,
    index: usize,
    device: Option<DeviceHandle>,
    options: StreamOptions,
}

impl Camera {
    /// A closed camera for device `index`.
    pub fn new(session: Arc<DriverSession>, index: usize) -> Self {
        Self {
            session,
            index,
            device: None,
            options: StreamOptions::default(),
        }
    }

    /// Open device `index` right away.
    pub fn open_index(session: Arc<DriverSession>, index: usize) -> DcamResult<Self> {
        let mut camera = Self::new(session, index);
        camera.open()?;
        Ok(camera)
    }

    /// Stream defaults from the `acquisition` config section.
    pub fn with_config(mut self, config: &DcamConfig) -> Self {
        self.options = StreamOptions::from(&config.acquisition);
        self
    }

    /// Replace the stream defaults.
    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Defaults used by [`stream`](Self::stream) and [`start`](Self::start).
    pub fn options(&self) -> StreamOptions {
        self.options
    }

    /// Device index this camera opens.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Open the device. A no-op if this camera already has it open.
    pub fn open(&mut self) -> DcamResult<()> {
        if self.device.as_ref().is_some_and(DeviceHandle::is_open) {
            return Ok(());
        }
        self.device = Some(DeviceHandle::open(&self.session, self.index)?);
        Ok(())
    }

    /// Close the device, stopping any active stream. Idempotent.
    pub fn close(&mut self) {
        if let Some(device) = self.device.take() {
            device.close();
        }
    }

    /// Whether the device is currently open.
    pub fn is_open(&self) -> bool {
        self.device.as_ref().is_some_and(DeviceHandle::is_open)
    }

    /// The open device handle.
    pub fn device(&self) -> DcamResult<&DeviceHandle> {
        self.device
            .as_ref()
            .filter(|device| device.is_open())
            .ok_or(DcamError::DeviceNotOpen)
    }

    /// Identity of the open device.
    pub fn info(&self) -> DcamResult<&DeviceIdentity> {
        Ok(self.device()?.info())
    }

    /// Read one property.
    pub fn get(&self, key: impl Into<PropertyKey>) -> DcamResult<PropertyValue> {
        self.device()?.get(key)
    }

    /// Write one property; returns the value the device applied.
    pub fn set(&self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> DcamResult<PropertyValue> {
        self.device()?.set(key, value)
    }

    /// Every property with its current value.
    pub fn properties(&self) -> DcamResult<Vec<PropertyEntry>> {
        self.device()?.list()
    }

    /// Frame layout the next stream would use.
    pub fn geometry(&self) -> DcamResult<Geometry> {
        self.device()?.geometry()
    }

    /// Driver-reported status.
    pub fn status(&self) -> DcamResult<CaptureStatus> {
        self.device()?.status()
    }

    /// Whether a stream is attached and running.
    pub fn capture_state(&self) -> DcamResult<CaptureState> {
        Ok(self.device()?.capture_state())
    }

    /// Pixel size (width, height) in metres.
    pub fn pixel_size(&self) -> DcamResult<(f64, f64)> {
        self.device()?.pixel_size()
    }

    /// Trigger one exposure under the software trigger source.
    pub fn fire_software_trigger(&self) -> DcamResult<()> {
        self.device()?.fire_software_trigger()
    }

    /// Arm a stream with the camera's default options.
    pub fn stream(&self, nb_frames: Option<u64>) -> DcamResult<AcquisitionStream> {
        self.stream_with(nb_frames, self.options)
    }

    /// Arm a stream with explicit options.
    pub fn stream_with(&self, nb_frames: Option<u64>, options: StreamOptions) -> DcamResult<AcquisitionStream> {
        AcquisitionStream::new(self.device()?, nb_frames, options)
    }

    /// Arm and start a stream.
    pub fn start(&self, nb_frames: Option<u64>) -> DcamResult<AcquisitionStream> {
        let mut stream = self.stream(nb_frames)?;
        stream.start()?;
        Ok(stream)
    }

    /// Set the exposure time, capture `nb_frames` and return copies of them.
    #[instrument(skip(self), fields(index = self.index), err)]
    pub fn acquire(&self, nb_frames: u64, exposure_time: f64) -> DcamResult<Vec<OwnedFrame>> {
        self.set(PropertyId::ExposureTime, exposure_time)?;
        let mut stream = self.start(Some(nb_frames))?;
        let frames = stream.frames().collect::<DcamResult<Vec<_>>>()?;
        info!(frames = frames.len(), "acquisition complete");
        Ok(frames)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}
