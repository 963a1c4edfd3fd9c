//! Device handle: exclusive ownership of one open camera.
//!
//! A [`DeviceHandle`] is created by [`DeviceHandle::open`] and closed by
//! [`DeviceHandle::close`] or by dropping the last clone. Closing is
//! idempotent and force-stops any acquisition stream still attached.
//!
//! The handle also owns the device's [`PropertyRegistry`]. Property writes,
//! stream construction and stream start all take the same state lock, so a
//! geometry change can never interleave with a ring allocation, and writes
//! forbidden during capture are rejected synchronously.

use crate::driver::{CaptureStatus, DeviceId, DeviceIdentity, DriverSession};
use crate::error::{DcamError, DcamResult};
use crate::property::{
    PixelType, PropertyEntry, PropertyId, PropertyKey, PropertyRegistry, PropertyValue,
};
use crate::stream::StreamShared;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};

/// Where the device is in the capture cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No stream attached.
    Idle,
    /// A stream has allocated and registered its ring.
    Armed,
    /// The driver is capturing into the ring.
    Running,
}

/// Frame layout derived from the current properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Pixels per row
    pub width: usize,
    /// Rows
    pub height: usize,
    /// Pixel layout
    pub pixel_type: PixelType,
    /// Bytes per buffer; may include padding beyond the pixel data.
    pub frame_bytes: usize,
}

#[derive(Debug)]
struct DeviceState {
    open: bool,
    capture: CaptureState,
    stream: Weak<StreamShared>,
}

#[derive(Debug)]
pub(crate) struct DeviceInner {
    session: Arc<DriverSession>,
    index: usize,
    id: DeviceId,
    identity: DeviceIdentity,
    registry: PropertyRegistry,
    state: Mutex<DeviceState>,
}

impl DeviceInner {
    pub(crate) fn session(&self) -> &Arc<DriverSession> {
        &self.session
    }

    pub(crate) fn id(&self) -> DeviceId {
        self.id
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    fn ensure_open(state: &DeviceState) -> DcamResult<()> {
        if state.open {
            Ok(())
        } else {
            Err(DcamError::DeviceNotOpen)
        }
    }

    fn read(&self, id: PropertyId) -> DcamResult<PropertyValue> {
        let value = self.session.driver().get_property(self.id, id)?;
        self.registry.record(id, value.clone());
        Ok(value)
    }

    fn read_number(&self, id: PropertyId) -> DcamResult<f64> {
        self.read(id)?
            .as_f64()
            .ok_or_else(|| DcamError::driver("get_property", format!("{} is not numeric", id)))
    }

    /// Current frame geometry. Callers hold the state lock.
    fn geometry(&self) -> DcamResult<Geometry> {
        let width = self.read_number(PropertyId::ImageWidth)? as usize;
        let height = self.read_number(PropertyId::ImageHeight)? as usize;
        let code = self.read_number(PropertyId::ImagePixelType)? as i32;
        let pixel_type = PixelType::from_code(code)
            .ok_or_else(|| DcamError::UnsupportedGeometry(format!("pixel type 0x{:X}", code)))?;
        if width == 0 || height == 0 {
            return Err(DcamError::UnsupportedGeometry(format!("{}x{} image", width, height)));
        }

        let needed = pixel_type.frame_bytes(width, height);
        let frame_bytes = [PropertyId::BufferFramebytes, PropertyId::ImageFramebytes]
            .into_iter()
            .find(|id| self.registry.contains(*id))
            .map(|id| self.read_number(id).map(|n| n as usize))
            .transpose()?
            .unwrap_or(needed);
        if frame_bytes < needed {
            return Err(DcamError::UnsupportedGeometry(format!(
                "driver reports {} byte frames, {}x{} {} needs {}",
                frame_bytes,
                width,
                height,
                pixel_type.label(),
                needed
            )));
        }

        Ok(Geometry {
            width,
            height,
            pixel_type,
            frame_bytes,
        })
    }

    /// Attach a new stream. `build` runs under the state lock with the
    /// current geometry; on error the device stays open and idle.
    pub(crate) fn arm<F>(self: &Arc<Self>, build: F) -> DcamResult<Arc<StreamShared>>
    where
        F: FnOnce(&Arc<DeviceInner>, Geometry) -> DcamResult<Arc<StreamShared>>,
    {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.capture != CaptureState::Idle && state.stream.strong_count() > 0 {
            return Err(DcamError::StreamAlreadyActive);
        }

        let geometry = self.geometry()?;
        let stream = build(self, geometry)?;
        state.capture = CaptureState::Armed;
        state.stream = Arc::downgrade(&stream);
        debug!(index = self.index, ?geometry, "stream armed");
        Ok(stream)
    }

    /// Run `start` under the state lock and mark the device running.
    pub(crate) fn begin_capture<F>(&self, start: F) -> DcamResult<()>
    where
        F: FnOnce() -> DcamResult<()>,
    {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        start()?;
        state.capture = CaptureState::Running;
        Ok(())
    }

    /// Detach `stream` after it stopped.
    pub(crate) fn end_capture(&self, stream: &StreamShared) {
        let mut state = self.state.lock();
        let current = state
            .stream
            .upgrade()
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s), stream));
        if current || state.stream.strong_count() == 0 {
            state.capture = CaptureState::Idle;
            state.stream = Weak::new();
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Stop the attached stream, close the driver handle, give the index
    /// back to the session. Idempotent.
    pub(crate) fn close(&self) {
        let stream = {
            let mut state = self.state.lock();
            if !state.open {
                return;
            }
            state.open = false;
            std::mem::take(&mut state.stream)
        };

        // Stopping takes the state lock again through `end_capture`.
        if let Some(stream) = stream.upgrade() {
            warn!(index = self.index, "closing device with an active stream");
            stream.stop();
        }

        {
            let mut state = self.state.lock();
            state.capture = CaptureState::Idle;
        }
        if let Err(err) = self.session.driver().close(self.id) {
            warn!(index = self.index, error = %err, "driver close failed");
        }
        self.session.release(self.index);
        info!(index = self.index, "device closed");
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// An open camera.
///
/// Clones share the same device; the device closes when [`close`](Self::close)
/// is called or the last clone is dropped.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    inner: Arc<DeviceInner>,
}

impl DeviceHandle {
    /// Open device `index`. Fails with `DeviceUnavailable` if the index does
    /// not exist or another handle already owns it.
    #[instrument(skip(session), err)]
    pub fn open(session: &Arc<DriverSession>, index: usize) -> DcamResult<Self> {
        let count = session.device_count()?;
        if index >= count {
            return Err(DcamError::DeviceUnavailable {
                index,
                reason: format!("only {} device(s) present", count),
            });
        }
        session.claim(index)?;

        let opened = Self::open_claimed(session, index);
        match opened {
            Ok(inner) => {
                session.adopt(index, &inner);
                info!(index, model = %inner.identity.model, "device opened");
                Ok(Self { inner })
            }
            Err(err) => {
                session.release(index);
                Err(err)
            }
        }
    }

    fn open_claimed(session: &Arc<DriverSession>, index: usize) -> DcamResult<Arc<DeviceInner>> {
        let driver = session.driver();
        let identity = session.identity(index)?;
        let id = driver.open(index).map_err(|err| match err {
            DcamError::DeviceUnavailable { .. } => err,
            other => DcamError::DeviceUnavailable {
                index,
                reason: other.to_string(),
            },
        })?;

        let descriptors = match driver.properties(id) {
            Ok(descriptors) => descriptors,
            Err(err) => {
                // Never leak a driver handle when building the capability set fails.
                let _ = driver.close(id);
                return Err(err);
            }
        };

        Ok(Arc::new(DeviceInner {
            session: Arc::clone(session),
            index,
            id,
            identity,
            registry: PropertyRegistry::new(descriptors),
            state: Mutex::new(DeviceState {
                open: true,
                capture: CaptureState::Idle,
                stream: Weak::new(),
            }),
        }))
    }

    pub(crate) fn inner(&self) -> &Arc<DeviceInner> {
        &self.inner
    }

    /// Enumeration index of the device.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Driver handle.
    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    /// Static identity snapshot taken at open.
    pub fn info(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    /// False after `close`, or after the session shut down.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether a stream is attached, and whether it is running.
    pub fn capture_state(&self) -> CaptureState {
        self.inner.state.lock().capture
    }

    /// Capability descriptor and last-seen values.
    pub fn registry(&self) -> &PropertyRegistry {
        &self.inner.registry
    }

    /// Close the device, stopping any active stream. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Read a property from the device.
    pub fn get(&self, key: impl Into<PropertyKey>) -> DcamResult<PropertyValue> {
        let key = key.into();
        let state = self.inner.state.lock();
        DeviceInner::ensure_open(&state)?;
        let descriptor = self.inner.registry.descriptor(&key)?;
        if !descriptor.readable {
            return Err(DcamError::driver("get_property", format!("{} is write-only", descriptor.name())));
        }
        let id = descriptor.id;
        self.inner.read(id)
    }

    /// Validate and write a property; returns the value the device applied.
    ///
    /// Nothing reaches the driver when validation fails, so the previous
    /// value stays in effect.
    pub fn set(&self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> DcamResult<PropertyValue> {
        let key = key.into();
        let value = value.into();
        let state = self.inner.state.lock();
        DeviceInner::ensure_open(&state)?;

        let capturing = state.capture != CaptureState::Idle && state.stream.strong_count() > 0;
        let (descriptor, normalized) = self.inner.registry.check_write(&key, &value, capturing)?;
        let id = descriptor.id;
        let geometry = descriptor.affects_geometry();

        let applied = self
            .inner
            .session
            .driver()
            .set_property(self.inner.id, id, &normalized)?;
        self.inner.registry.record(id, applied.clone());
        if geometry {
            self.inner.registry.invalidate_derived();
        }
        debug!(index = self.inner.index, property = %id, value = %applied, "property set");
        Ok(applied)
    }

    /// Snapshot of every property with its current value.
    ///
    /// Taken under the state lock, so no write can land halfway through.
    pub fn list(&self) -> DcamResult<Vec<PropertyEntry>> {
        let state = self.inner.state.lock();
        DeviceInner::ensure_open(&state)?;
        self.inner
            .registry
            .descriptors()
            .iter()
            .map(|descriptor| {
                let value = if descriptor.readable {
                    Some(self.inner.read(descriptor.id)?)
                } else {
                    None
                };
                Ok(PropertyEntry {
                    name: descriptor.name(),
                    value,
                    descriptor: descriptor.clone(),
                })
            })
            .collect()
    }

    /// Current frame geometry.
    pub fn geometry(&self) -> DcamResult<Geometry> {
        let state = self.inner.state.lock();
        DeviceInner::ensure_open(&state)?;
        self.inner.geometry()
    }

    /// Driver-reported status.
    pub fn status(&self) -> DcamResult<CaptureStatus> {
        let state = self.inner.state.lock();
        DeviceInner::ensure_open(&state)?;
        self.inner.session.driver().status(self.inner.id)
    }

    /// Physical pixel size (width, height) in metres.
    pub fn pixel_size(&self) -> DcamResult<(f64, f64)> {
        let state = self.inner.state.lock();
        DeviceInner::ensure_open(&state)?;
        let mut size = [0.0; 2];
        for (slot, id) in size
            .iter_mut()
            .zip([PropertyId::ImageDetectorPixelWidth, PropertyId::ImageDetectorPixelHeight])
        {
            let unit = self.inner.registry.descriptor(&id.into())?.unit;
            *slot = unit.to_si(self.inner.read_number(id)?);
        }
        Ok((size[0], size[1]))
    }

    /// Trigger one exposure; the trigger source must be software.
    pub fn fire_software_trigger(&self) -> DcamResult<()> {
        let state = self.inner.state.lock();
        DeviceInner::ensure_open(&state)?;
        self.inner.session.driver().fire_software_trigger(self.inner.id)
    }
}
