//! Driver boundary and process-wide driver session.
//!
//! [`Driver`] is everything the core needs from a camera backend: the vendor
//! DCAM-API binding or the in-process simulator ([`sim::SimDriver`]). All
//! methods take `&self`; implementations synchronize internally so a capture
//! thread can block in [`Driver::wait_for_frame`] while another thread stops
//! the capture.
//!
//! [`DriverSession`] replaces ambient global state: it initializes the driver
//! once, tracks which device indices are owned by an open
//! [`DeviceHandle`](crate::device::DeviceHandle), and tears everything down on
//! [`DriverSession::shutdown`] or drop.

#[cfg(feature = "sim")]
pub mod sim;

use crate::device::DeviceInner;
use crate::error::{DcamError, DcamResult};
use crate::property::{PropertyDescriptor, PropertyId, PropertyValue};
use crate::ring::{BufferRing, FrameStamp};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Opaque handle the driver hands out for an opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Identity strings reported for one camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct DeviceIdentity {
    /// Enumeration index
    pub index: usize,
    /// Always `Hamamatsu` for DCAM cameras
    pub vendor: String,
    /// Model number, e.g. `C13440-20CU`
    pub model: String,
    /// Camera ID, usually the serial number (`S/N: 000123`).
    pub camera_id: String,
    /// Interface the camera is attached to
    pub bus: String,
    /// Camera firmware version
    pub camera_version: String,
    /// Bus driver version
    pub driver_version: String,
    /// DCAM module version
    pub module_version: String,
    /// DCAM-API version
    pub api_version: String,
    /// Product family, e.g. `ORCA-Flash4.0`
    pub series_name: String,
}

impl DeviceIdentity {
    /// Serial number without the `S/N: ` prefix.
    pub fn serial_number(&self) -> &str {
        self.camera_id
            .strip_prefix("S/N:")
            .map(str::trim)
            .unwrap_or(&self.camera_id)
    }
}

/// How many frames a capture produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Run until stopped, reusing the ring.
    Sequence,
    /// Capture exactly this many frames, then stop.
    Snap(u64),
}

/// Device status as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    /// The device reported an error.
    Error,
    /// Capturing.
    Busy,
    /// Buffers registered, ready to start.
    Ready,
    /// Idle without buffers.
    Stable,
    /// Buffers registered but the device is not yet ready.
    Unstable,
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CaptureStatus::Error => "ERROR",
            CaptureStatus::Busy => "BUSY",
            CaptureStatus::Ready => "READY",
            CaptureStatus::Stable => "STABLE",
            CaptureStatus::Unstable => "UNSTABLE",
        };
        f.write_str(label)
    }
}

/// Result of one [`Driver::wait_for_frame`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Buffer `index` of the registered ring now holds a complete frame.
    Frame {
        /// Ring slot that was filled
        index: usize,
        /// Sequence and device timestamp of the frame
        stamp: FrameStamp,
    },
    /// Nothing completed within the timeout.
    Timeout,
    /// The capture ended (frame count reached or `stop_capture`).
    Stopped,
    /// [`Driver::abort_wait`] was called.
    Aborted,
}

/// Camera backend consumed by the device handle and the acquisition stream.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Initialize the backend. Called once by [`DriverSession::init`].
    fn init(&self) -> DcamResult<()>;

    /// Release backend resources. Called once by [`DriverSession::shutdown`].
    fn uninit(&self);

    /// One identity per attached camera, index order.
    fn enumerate(&self) -> DcamResult<Vec<DeviceIdentity>>;

    /// Open camera `index`. The session guarantees one open per index.
    fn open(&self, index: usize) -> DcamResult<DeviceId>;

    /// Close an open device. Unknown handles are an error.
    fn close(&self, device: DeviceId) -> DcamResult<()>;

    /// Capability descriptor of an open device.
    fn properties(&self, device: DeviceId) -> DcamResult<Vec<PropertyDescriptor>>;

    /// Current value of a property.
    fn get_property(&self, device: DeviceId, id: PropertyId) -> DcamResult<PropertyValue>;

    /// Apply a validated value and return the value actually in effect,
    /// which may be rounded by the device.
    fn set_property(&self, device: DeviceId, id: PropertyId, value: &PropertyValue) -> DcamResult<PropertyValue>;

    /// Make `ring` the destination of incoming frames.
    fn register_buffers(&self, device: DeviceId, ring: Arc<BufferRing>) -> DcamResult<()>;

    /// Forget the registered ring. The driver must not touch it afterwards.
    fn unregister_buffers(&self, device: DeviceId) -> DcamResult<()>;

    /// Begin capturing into the registered ring.
    fn start_capture(&self, device: DeviceId, mode: CaptureMode) -> DcamResult<()>;

    /// Tell the device to cease filling buffers. Must not block on the consumer.
    fn stop_capture(&self, device: DeviceId) -> DcamResult<()>;

    /// Wait up to `timeout` for the next completion event.
    fn wait_for_frame(&self, device: DeviceId, timeout: Duration) -> DcamResult<WaitOutcome>;

    /// Wake a thread blocked in [`Driver::wait_for_frame`].
    fn abort_wait(&self, device: DeviceId) -> DcamResult<()>;

    /// Current status of the device.
    fn status(&self, device: DeviceId) -> DcamResult<CaptureStatus>;

    /// Trigger one exposure when the trigger source is software.
    fn fire_software_trigger(&self, device: DeviceId) -> DcamResult<()>;
}

#[derive(Debug)]
enum Owner {
    /// Claimed, driver open in progress.
    Opening,
    Open(Weak<DeviceInner>),
}

#[derive(Debug, Default)]
struct SessionState {
    active: bool,
    owned: HashMap<usize, Owner>,
}

/// An initialized driver plus the set of devices opened through it.
#[derive(Debug)]
pub struct DriverSession {
    driver: Arc<dyn Driver>,
    state: Mutex<SessionState>,
}

impl DriverSession {
    /// Initialize `driver` and start a session.
    pub fn init(driver: Arc<dyn Driver>) -> DcamResult<Arc<Self>> {
        driver.init()?;
        info!(driver = driver.name(), "driver session initialized");
        Ok(Arc::new(Self {
            driver,
            state: Mutex::new(SessionState {
                active: true,
                owned: HashMap::new(),
            }),
        }))
    }

    /// The initialized backend.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// False once [`DriverSession::shutdown`] ran.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Number of cameras the driver enumerates.
    pub fn device_count(&self) -> DcamResult<usize> {
        Ok(self.identities()?.len())
    }

    /// Identity of every camera, open or not.
    pub fn identities(&self) -> DcamResult<Vec<DeviceIdentity>> {
        self.ensure_active()?;
        self.driver.enumerate()
    }

    /// Identity of camera `index`.
    pub fn identity(&self, index: usize) -> DcamResult<DeviceIdentity> {
        self.identities()?
            .into_iter()
            .find(|identity| identity.index == index)
            .ok_or_else(|| DcamError::DeviceUnavailable {
                index,
                reason: "no such device".to_string(),
            })
    }

    fn ensure_active(&self) -> DcamResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DcamError::SessionClosed)
        }
    }

    /// Reserve `index` for a handle being opened.
    pub(crate) fn claim(&self, index: usize) -> DcamResult<()> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(DcamError::SessionClosed);
        }
        let taken = match state.owned.get(&index) {
            Some(Owner::Opening) => true,
            Some(Owner::Open(device)) => device.strong_count() > 0,
            None => false,
        };
        if taken {
            return Err(DcamError::DeviceUnavailable {
                index,
                reason: "already owned by another handle".to_string(),
            });
        }
        state.owned.insert(index, Owner::Opening);
        Ok(())
    }

    /// Attach the opened device to its claimed index.
    pub(crate) fn adopt(&self, index: usize, device: &Arc<DeviceInner>) {
        self.state
            .lock()
            .owned
            .insert(index, Owner::Open(Arc::downgrade(device)));
    }

    pub(crate) fn release(&self, index: usize) {
        self.state.lock().owned.remove(&index);
    }

    /// Indices currently owned by open handles.
    pub fn owned_indices(&self) -> Vec<usize> {
        let mut owned: Vec<usize> = self.state.lock().owned.keys().copied().collect();
        owned.sort_unstable();
        owned
    }

    /// Close every device still open and release the driver. Idempotent.
    pub fn shutdown(&self) {
        let devices: Vec<Arc<DeviceInner>> = {
            let mut state = self.state.lock();
            if !state.active {
                return;
            }
            state.active = false;
            state
                .owned
                .drain()
                .filter_map(|(_, owner)| match owner {
                    Owner::Open(device) => device.upgrade(),
                    Owner::Opening => None,
                })
                .collect()
        };

        if !devices.is_empty() {
            warn!(count = devices.len(), "closing devices left open at session shutdown");
        }
        for device in devices {
            device.close();
        }
        self.driver.uninit();
        debug!(driver = self.driver.name(), "driver session shut down");
    }
}

impl Drop for DriverSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
