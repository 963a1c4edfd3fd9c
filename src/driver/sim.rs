//! In-process camera simulator.
//!
//! Implements [`Driver`] for a configurable number of ORCA-like cameras so the
//! core, the CLI and the tests run without hardware. Each capture starts a
//! producer thread that claims buffers from the registered ring, writes a
//! deterministic test pattern and queues a completion event, pacing itself on
//! the exposure time or on software triggers.
//!
//! Derived read-only properties (image size, row/frame bytes, readout time,
//! frame rate) are recomputed from subarray, binning and pixel type after
//! every write, the way the camera firmware reports them.
//!
//! A few fault injection hooks let tests provoke driver misbehaviour:
//! failed opens, swapped completion order and duplicated completions.

use super::{CaptureMode, CaptureStatus, DeviceId, DeviceIdentity, Driver, WaitOutcome};
use crate::config::SimulatorConfig;
use crate::error::{DcamError, DcamResult};
use crate::property::{
    EnumOption, PixelType, PropertyDescriptor, PropertyId, PropertyKind, PropertyValue, Unit,
};
use crate::ring::{BufferRing, FrameStamp};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Time to read out one sensor line.
const LINE_TIME: f64 = 10e-6;
const PIXEL_SIZE_UM: f64 = 6.5;

const TRIGGER_INTERNAL: i32 = 1;
const TRIGGER_SOFTWARE: i32 = 3;
const SUBARRAY_ON: i32 = 2;
const COOLER_OFF: i32 = 1;

/// Completion events waiting for `wait_for_frame`.
#[derive(Debug, Default)]
struct EventQueue {
    events: Mutex<QueueState>,
    signal: Condvar,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<WaitOutcome>,
    aborted: bool,
}

impl EventQueue {
    fn push(&self, event: WaitOutcome) {
        self.events.lock().queue.push_back(event);
        self.signal.notify_all();
    }

    fn clear(&self) {
        let mut state = self.events.lock();
        state.queue.clear();
        state.aborted = false;
    }

    fn abort(&self) {
        self.events.lock().aborted = true;
        self.signal.notify_all();
    }

    fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.events.lock();
        loop {
            if state.aborted {
                state.aborted = false;
                return WaitOutcome::Aborted;
            }
            if let Some(event) = state.queue.pop_front() {
                return event;
            }
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut state, deadline).timed_out()
                        && state.queue.is_empty()
                        && !state.aborted
                    {
                        return WaitOutcome::Timeout;
                    }
                }
                None => self.signal.wait(&mut state),
            }
        }
    }
}

/// Counts software triggers not yet consumed by the producer.
#[derive(Debug, Default)]
struct TriggerGate {
    pending: Mutex<u64>,
    signal: Condvar,
}

impl TriggerGate {
    fn fire(&self) {
        *self.pending.lock() += 1;
        self.signal.notify_all();
    }

    fn wake(&self) {
        self.signal.notify_all();
    }

    fn reset(&self) {
        *self.pending.lock() = 0;
    }

    /// Consume one trigger; false if `stop` was raised first.
    fn wait(&self, stop: &AtomicBool) -> bool {
        let mut pending = self.pending.lock();
        loop {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            if *pending > 0 {
                *pending -= 1;
                return true;
            }
            self.signal.wait_for(&mut pending, Duration::from_millis(50));
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_open: bool,
    swap_next_pair: bool,
    duplicate_next: bool,
    held: Option<WaitOutcome>,
}

#[derive(Debug)]
struct Capture {
    stop: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct CameraState {
    handle: Option<DeviceId>,
    values: HashMap<PropertyId, PropertyValue>,
    ring: Option<Arc<BufferRing>>,
    capture: Option<Capture>,
}

#[derive(Debug)]
struct SimCamera {
    identity: DeviceIdentity,
    descriptors: Vec<PropertyDescriptor>,
    state: Mutex<CameraState>,
    events: Arc<EventQueue>,
    triggers: Arc<TriggerGate>,
    faults: Arc<Mutex<Faults>>,
}

/// Simulated DCAM backend.
#[derive(Debug)]
pub struct SimDriver {
    config: SimulatorConfig,
    cameras: Vec<SimCamera>,
    handles: Mutex<HashMap<DeviceId, usize>>,
    next_handle: AtomicU64,
    initialized: AtomicBool,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl SimDriver {
    /// `config.device_count` cameras, all closed, at their default property values.
    pub fn new(config: SimulatorConfig) -> Self {
        let descriptors = build_descriptors(&config);
        let cameras = (0..config.device_count)
            .map(|index| {
                let mut values: HashMap<PropertyId, PropertyValue> = descriptors
                    .iter()
                    .map(|d| (d.id, default_value(d)))
                    .collect();
                values.insert(PropertyId::SensorTemperature, PropertyValue::Numeric(-20.0));
                update_derived(&config, &mut values);
                SimCamera {
                    identity: identity(&config, index),
                    descriptors: descriptors.clone(),
                    state: Mutex::new(CameraState {
                        handle: None,
                        values,
                        ring: None,
                        capture: None,
                    }),
                    events: Arc::new(EventQueue::default()),
                    triggers: Arc::new(TriggerGate::default()),
                    faults: Arc::new(Mutex::new(Faults::default())),
                }
            })
            .collect();

        Self {
            config,
            cameras,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
        }
    }

    fn camera(&self, device: DeviceId) -> DcamResult<&SimCamera> {
        let index = self
            .handles
            .lock()
            .get(&device)
            .copied()
            .ok_or(DcamError::DeviceNotOpen)?;
        Ok(&self.cameras[index])
    }

    fn camera_at(&self, index: usize) -> DcamResult<&SimCamera> {
        self.cameras.get(index).ok_or_else(|| DcamError::DeviceUnavailable {
            index,
            reason: "no such device".to_string(),
        })
    }

    /// Make the next `open(index)` fail as if the camera were unplugged.
    pub fn fail_next_open(&self, index: usize) -> DcamResult<()> {
        self.camera_at(index)?.faults.lock().fail_next_open = true;
        Ok(())
    }

    /// Deliver the next two completions of camera `index` in reverse order.
    pub fn swap_next_completions(&self, index: usize) -> DcamResult<()> {
        self.camera_at(index)?.faults.lock().swap_next_pair = true;
        Ok(())
    }

    /// Report the next completion of camera `index` twice.
    pub fn duplicate_next_completion(&self, index: usize) -> DcamResult<()> {
        self.camera_at(index)?.faults.lock().duplicate_next = true;
        Ok(())
    }

    /// Number of buffers camera `index` currently has registered.
    pub fn registered_buffers(&self, index: usize) -> usize {
        self.cameras
            .get(index)
            .and_then(|camera| camera.state.lock().ring.as_ref().map(|ring| ring.capacity()))
            .unwrap_or(0)
    }

    /// Whether camera `index` has a capture in progress.
    pub fn is_capturing(&self, index: usize) -> bool {
        self.cameras
            .get(index)
            .is_some_and(|camera| camera.state.lock().capture.is_some())
    }

    /// Whether camera `index` has an open handle.
    pub fn is_open(&self, index: usize) -> bool {
        self.cameras
            .get(index)
            .is_some_and(|camera| camera.state.lock().handle.is_some())
    }

    fn halt(state: &mut CameraState, triggers: &TriggerGate) {
        if let Some(capture) = state.capture.as_ref() {
            capture.stop.store(true, Ordering::Release);
            triggers.wake();
        }
    }

    /// Stop capture, release the ring and wait for the producer to exit.
    fn teardown(state: &mut CameraState, triggers: &TriggerGate) {
        Self::halt(state, triggers);
        if let Some(ring) = state.ring.take() {
            // Unblocks a producer stalled on unread buffers.
            ring.stop();
            ring.set_registered(false);
        }
        if let Some(mut capture) = state.capture.take() {
            if let Some(producer) = capture.producer.take() {
                if producer.join().is_err() {
                    warn!("simulated producer thread panicked");
                }
            }
        }
    }
}

fn identity(config: &SimulatorConfig, index: usize) -> DeviceIdentity {
    DeviceIdentity {
        index,
        vendor: "Hamamatsu".to_string(),
        model: config.model.clone(),
        camera_id: format!("S/N: {:06}", 100_200 + index),
        bus: "USB3.0".to_string(),
        camera_version: "4.20.B".to_string(),
        driver_version: "4.2.6500".to_string(),
        module_version: "21.6.4658".to_string(),
        api_version: "4.00".to_string(),
        series_name: "ORCA-Flash4.0".to_string(),
    }
}

fn default_value(descriptor: &PropertyDescriptor) -> PropertyValue {
    match descriptor.kind {
        PropertyKind::Mode => {
            let value = descriptor.default as i32;
            let label = descriptor
                .option(value)
                .map(|o| o.label.clone())
                .unwrap_or_default();
            PropertyValue::Enumerated { value, label }
        }
        PropertyKind::Text => PropertyValue::Text(String::new()),
        PropertyKind::Real | PropertyKind::Long => PropertyValue::Numeric(descriptor.default),
    }
}

fn options(pairs: &[(i32, &str)]) -> Vec<EnumOption> {
    pairs.iter().map(|(v, l)| EnumOption::new(*v, *l)).collect()
}

fn build_descriptors(config: &SimulatorConfig) -> Vec<PropertyDescriptor> {
    use PropertyId as P;
    use PropertyKind::{Long, Real};

    let width = f64::from(config.sensor_width);
    let height = f64::from(config.sensor_height);
    let long_ro = |id, max: f64| PropertyDescriptor::numeric(id, Long, Unit::None, 0.0, max, 1.0, 0.0).read_only();
    let frame_max = width * height * 6.0;

    vec![
        PropertyDescriptor::mode(
            P::TriggerSource,
            options(&[(1, "INTERNAL"), (2, "EXTERNAL"), (3, "SOFTWARE"), (4, "MASTER PULSE")]),
            TRIGGER_INTERNAL,
        ),
        PropertyDescriptor::mode(
            P::TriggerMode,
            options(&[(1, "NORMAL"), (3, "PIV"), (6, "START")]),
            1,
        ),
        PropertyDescriptor::mode(P::TriggerPolarity, options(&[(1, "NEGATIVE"), (2, "POSITIVE")]), 1),
        PropertyDescriptor::numeric(P::ExposureTime, Real, Unit::Second, 1e-3, 10.0, 0.0, 0.01),
        PropertyDescriptor::numeric(P::SensorTemperature, Real, Unit::Celsius, -50.0, 50.0, 0.0, -20.0).read_only(),
        PropertyDescriptor::mode(P::SensorCooler, options(&[(1, "OFF"), (2, "ON"), (4, "MAX")]), 2),
        PropertyDescriptor::numeric(P::ReadoutSpeed, Long, Unit::None, 1.0, 2.0, 1.0, 2.0),
        PropertyDescriptor::mode(P::SensorMode, options(&[(1, "AREA"), (12, "PROGRESSIVE")]), 1),
        PropertyDescriptor::mode(P::Binning, options(&[(1, "1X1"), (2, "2X2"), (4, "4X4")]), 1),
        PropertyDescriptor::numeric(P::SubarrayHpos, Long, Unit::None, 0.0, width - 4.0, 4.0, 0.0),
        PropertyDescriptor::numeric(P::SubarrayHsize, Long, Unit::None, 4.0, width, 4.0, width),
        PropertyDescriptor::numeric(P::SubarrayVpos, Long, Unit::None, 0.0, height - 4.0, 4.0, 0.0),
        PropertyDescriptor::numeric(P::SubarrayVsize, Long, Unit::None, 4.0, height, 4.0, height),
        PropertyDescriptor::mode(P::SubarrayMode, options(&[(1, "OFF"), (2, "ON")]), 1),
        PropertyDescriptor::numeric(P::TimingReadoutTime, Real, Unit::Second, 0.0, 1.0, 0.0, 0.0).read_only(),
        PropertyDescriptor::numeric(P::InternalFrameRate, Real, Unit::PerSecond, 0.0, 1e4, 0.0, 0.0).read_only(),
        PropertyDescriptor::numeric(P::InternalFrameInterval, Real, Unit::Second, 0.0, 10.0, 0.0, 0.0).read_only(),
        PropertyDescriptor::mode(
            P::TimeStampProducer,
            options(&[(1, "NONE"), (2, "DCAM MODULE"), (3, "KERNEL DRIVER"), (4, "CAPTURE DEVICE"), (5, "IMAGING DEVICE")]),
            5,
        )
        .read_only(),
        PropertyDescriptor::mode(
            P::FrameStampProducer,
            options(&[(1, "NONE"), (2, "DCAM MODULE"), (3, "KERNEL DRIVER"), (4, "CAPTURE DEVICE"), (5, "IMAGING DEVICE")]),
            5,
        )
        .read_only(),
        long_ro(P::BitsPerChannel, 16.0),
        long_ro(P::ImageWidth, width),
        long_ro(P::ImageHeight, height),
        long_ro(P::ImageRowbytes, width * 6.0),
        long_ro(P::ImageFramebytes, frame_max),
        PropertyDescriptor::mode(
            P::ImagePixelType,
            options(&[(1, "MONO8"), (2, "MONO16"), (3, "MONO12")]),
            config.pixel_type.code(),
        ),
        long_ro(P::BufferFramebytes, frame_max),
        PropertyDescriptor::numeric(P::ImageDetectorPixelWidth, Real, Unit::Micrometer, 0.0, 100.0, 0.0, PIXEL_SIZE_UM).read_only(),
        PropertyDescriptor::numeric(P::ImageDetectorPixelHeight, Real, Unit::Micrometer, 0.0, 100.0, 0.0, PIXEL_SIZE_UM).read_only(),
        PropertyDescriptor::mode(P::DefectCorrectMode, options(&[(1, "OFF"), (2, "ON")]), 2),
    ]
}

fn number(values: &HashMap<PropertyId, PropertyValue>, id: PropertyId) -> f64 {
    values.get(&id).and_then(PropertyValue::as_f64).unwrap_or_default()
}

/// Frame geometry and pacing implied by the current settings.
#[derive(Debug, Clone, Copy)]
struct Plan {
    width: usize,
    height: usize,
    pixel_type: PixelType,
    interval: Duration,
    software_trigger: bool,
}

fn plan(config: &SimulatorConfig, values: &HashMap<PropertyId, PropertyValue>) -> Plan {
    let binning = number(values, PropertyId::Binning).max(1.0);
    let (hsize, vsize) = if number(values, PropertyId::SubarrayMode) as i32 == SUBARRAY_ON {
        (number(values, PropertyId::SubarrayHsize), number(values, PropertyId::SubarrayVsize))
    } else {
        (f64::from(config.sensor_width), f64::from(config.sensor_height))
    };
    let pixel_type = PixelType::from_code(number(values, PropertyId::ImagePixelType) as i32)
        .unwrap_or(config.pixel_type);
    let readout = vsize * LINE_TIME;
    let exposure = number(values, PropertyId::ExposureTime);

    Plan {
        width: (hsize / binning) as usize,
        height: (vsize / binning) as usize,
        pixel_type,
        interval: Duration::from_secs_f64(exposure.max(readout)),
        software_trigger: number(values, PropertyId::TriggerSource) as i32 == TRIGGER_SOFTWARE,
    }
}

fn update_derived(config: &SimulatorConfig, values: &mut HashMap<PropertyId, PropertyValue>) {
    let plan = plan(config, values);
    let vsize = if number(values, PropertyId::SubarrayMode) as i32 == SUBARRAY_ON {
        number(values, PropertyId::SubarrayVsize)
    } else {
        f64::from(config.sensor_height)
    };
    let readout = vsize * LINE_TIME;
    let interval = plan.interval.as_secs_f64();
    let row_bytes = plan.pixel_type.row_bytes(plan.width);
    let frame_bytes = plan.pixel_type.frame_bytes(plan.width, plan.height);
    let bits = match plan.pixel_type {
        PixelType::Mono8 => 8.0,
        PixelType::Mono12 | PixelType::Mono12P => 12.0,
        _ => 16.0,
    };
    let temperature = if number(values, PropertyId::SensorCooler) as i32 == COOLER_OFF {
        25.0
    } else {
        -20.0
    };

    for (id, value) in [
        (PropertyId::ImageWidth, plan.width as f64),
        (PropertyId::ImageHeight, plan.height as f64),
        (PropertyId::ImageRowbytes, row_bytes as f64),
        (PropertyId::ImageFramebytes, frame_bytes as f64),
        (PropertyId::BufferFramebytes, frame_bytes as f64),
        (PropertyId::BitsPerChannel, bits),
        (PropertyId::TimingReadoutTime, readout),
        (PropertyId::InternalFrameInterval, interval),
        (PropertyId::InternalFrameRate, if interval > 0.0 { 1.0 / interval } else { 0.0 }),
        (PropertyId::SensorTemperature, temperature),
    ] {
        values.insert(id, PropertyValue::Numeric(value));
    }
}

/// Deterministic test pattern: a diagonal gradient offset by the sequence number.
fn write_pattern(data: &mut [u8], plan: &Plan, sequence: u64) {
    match plan.pixel_type {
        PixelType::Mono16 => {
            for (i, pixel) in data.chunks_exact_mut(2).enumerate() {
                let x = i % plan.width.max(1);
                let y = i / plan.width.max(1);
                let value = (x + y) as u64 + sequence;
                pixel.copy_from_slice(&(value as u16).to_le_bytes());
            }
        }
        _ => {
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = (i as u64 + sequence) as u8;
            }
        }
    }
}

struct Producer {
    ring: Arc<BufferRing>,
    events: Arc<EventQueue>,
    triggers: Arc<TriggerGate>,
    faults: Arc<Mutex<Faults>>,
    stop: Arc<AtomicBool>,
    plan: Plan,
    frames: Option<u64>,
}

impl Producer {
    fn pace(&self) -> bool {
        if self.plan.software_trigger {
            return self.triggers.wait(&self.stop);
        }
        let until = Instant::now() + self.plan.interval;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep((until - now).min(Duration::from_millis(5)));
        }
    }

    fn emit(&self, event: WaitOutcome) {
        let mut faults = self.faults.lock();
        if let Some(held) = faults.held.take() {
            self.events.push(event);
            self.events.push(held);
        } else if faults.swap_next_pair {
            faults.swap_next_pair = false;
            faults.held = Some(event);
        } else if faults.duplicate_next {
            faults.duplicate_next = false;
            self.events.push(event);
            self.events.push(event);
        } else {
            self.events.push(event);
        }
    }

    fn run(self) {
        let started = Instant::now();
        let mut last = Duration::ZERO;
        let mut produced = 0u64;

        while self.frames.map_or(true, |limit| produced < limit) {
            if !self.pace() {
                break;
            }
            let Some(mut slot) = self.ring.begin_fill() else {
                break;
            };
            let sequence = slot.sequence;
            write_pattern(slot.data_mut(), &self.plan, sequence);

            // Strictly increasing even if the clock is coarse.
            let timestamp = started.elapsed().max(last + Duration::from_nanos(1));
            last = timestamp;
            let event = WaitOutcome::Frame {
                index: slot.index,
                stamp: FrameStamp {
                    sequence,
                    timestamp,
                    complete: true,
                },
            };
            drop(slot);

            trace!(?event, "simulated frame complete");
            self.emit(event);
            produced += 1;
        }

        if let Some(held) = self.faults.lock().held.take() {
            self.events.push(held);
        }
        self.events.push(WaitOutcome::Stopped);
        debug!(produced, "simulated capture finished");
    }
}

impl Driver for SimDriver {
    fn name(&self) -> &str {
        "simulator"
    }

    fn init(&self) -> DcamResult<()> {
        self.initialized.store(true, Ordering::Release);
        info!(devices = self.cameras.len(), model = %self.config.model, "simulated DCAM initialized");
        Ok(())
    }

    fn uninit(&self) {
        for camera in &self.cameras {
            let mut state = camera.state.lock();
            Self::teardown(&mut state, &camera.triggers);
            state.handle = None;
        }
        self.handles.lock().clear();
        self.initialized.store(false, Ordering::Release);
    }

    fn enumerate(&self) -> DcamResult<Vec<DeviceIdentity>> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(DcamError::SessionClosed);
        }
        Ok(self.cameras.iter().map(|c| c.identity.clone()).collect())
    }

    fn open(&self, index: usize) -> DcamResult<DeviceId> {
        let camera = self.camera_at(index)?;
        {
            let mut faults = camera.faults.lock();
            if faults.fail_next_open {
                faults.fail_next_open = false;
                return Err(DcamError::driver("open", "camera did not respond"));
            }
        }

        let mut state = camera.state.lock();
        if state.handle.is_some() {
            return Err(DcamError::DeviceUnavailable {
                index,
                reason: "camera is busy".to_string(),
            });
        }
        let handle = DeviceId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state.handle = Some(handle);
        self.handles.lock().insert(handle, index);
        debug!(index, %handle, "simulated camera opened");
        Ok(handle)
    }

    fn close(&self, device: DeviceId) -> DcamResult<()> {
        let camera = self.camera(device)?;
        let mut state = camera.state.lock();
        Self::teardown(&mut state, &camera.triggers);
        state.handle = None;
        self.handles.lock().remove(&device);
        Ok(())
    }

    fn properties(&self, device: DeviceId) -> DcamResult<Vec<PropertyDescriptor>> {
        Ok(self.camera(device)?.descriptors.clone())
    }

    fn get_property(&self, device: DeviceId, id: PropertyId) -> DcamResult<PropertyValue> {
        self.camera(device)?
            .state
            .lock()
            .values
            .get(&id)
            .cloned()
            .ok_or_else(|| DcamError::UnknownProperty(id.name()))
    }

    fn set_property(&self, device: DeviceId, id: PropertyId, value: &PropertyValue) -> DcamResult<PropertyValue> {
        let camera = self.camera(device)?;
        let mut state = camera.state.lock();
        if state.capture.is_some() && id.affects_geometry() {
            return Err(DcamError::driver("set_property", "camera busy"));
        }

        let (pos, size, limit) = match id {
            PropertyId::SubarrayHpos => (Some(value), state.values.get(&PropertyId::SubarrayHsize), self.config.sensor_width),
            PropertyId::SubarrayHsize => (state.values.get(&PropertyId::SubarrayHpos), Some(value), self.config.sensor_width),
            PropertyId::SubarrayVpos => (Some(value), state.values.get(&PropertyId::SubarrayVsize), self.config.sensor_height),
            PropertyId::SubarrayVsize => (state.values.get(&PropertyId::SubarrayVpos), Some(value), self.config.sensor_height),
            _ => (None, None, 0),
        };
        if let (Some(pos), Some(size)) = (pos.and_then(PropertyValue::as_f64), size.and_then(PropertyValue::as_f64)) {
            if pos + size > f64::from(limit) {
                return Err(DcamError::invalid_value(
                    id.name(),
                    format!("subarray {}+{} exceeds sensor size {}", pos, size, limit),
                ));
            }
        }

        state.values.insert(id, value.clone());
        update_derived(&self.config, &mut state.values);
        Ok(value.clone())
    }

    fn register_buffers(&self, device: DeviceId, ring: Arc<BufferRing>) -> DcamResult<()> {
        let camera = self.camera(device)?;
        let mut state = camera.state.lock();
        if state.ring.is_some() {
            return Err(DcamError::driver("register_buffers", "buffers already registered"));
        }
        ring.set_registered(true);
        state.ring = Some(ring);
        Ok(())
    }

    fn unregister_buffers(&self, device: DeviceId) -> DcamResult<()> {
        let camera = self.camera(device)?;
        let mut state = camera.state.lock();
        Self::teardown(&mut state, &camera.triggers);
        Ok(())
    }

    fn start_capture(&self, device: DeviceId, mode: CaptureMode) -> DcamResult<()> {
        let camera = self.camera(device)?;
        let mut state = camera.state.lock();
        if state.capture.is_some() {
            return Err(DcamError::driver("start_capture", "capture already running"));
        }
        let ring = state
            .ring
            .clone()
            .ok_or_else(|| DcamError::driver("start_capture", "no buffers registered"))?;
        let plan = plan(&self.config, &state.values);
        let needed = plan.pixel_type.frame_bytes(plan.width, plan.height);
        if ring.frame_size() < needed {
            return Err(DcamError::driver(
                "start_capture",
                format!("registered buffers hold {} bytes, frame needs {}", ring.frame_size(), needed),
            ));
        }

        camera.events.clear();
        camera.triggers.reset();
        let stop = Arc::new(AtomicBool::new(false));
        let producer = Producer {
            ring,
            events: Arc::clone(&camera.events),
            triggers: Arc::clone(&camera.triggers),
            faults: Arc::clone(&camera.faults),
            stop: Arc::clone(&stop),
            plan,
            frames: match mode {
                CaptureMode::Sequence => None,
                CaptureMode::Snap(n) => Some(n),
            },
        };
        let producer = thread::Builder::new()
            .name(format!("dcam-sim-{}", camera.identity.index))
            .spawn(move || producer.run())
            .map_err(|e| DcamError::driver("start_capture", e.to_string()))?;

        state.capture = Some(Capture {
            stop,
            producer: Some(producer),
        });
        info!(
            index = camera.identity.index,
            ?mode,
            width = plan.width,
            height = plan.height,
            interval_ms = plan.interval.as_secs_f64() * 1e3,
            "simulated capture started"
        );
        Ok(())
    }

    fn stop_capture(&self, device: DeviceId) -> DcamResult<()> {
        let camera = self.camera(device)?;
        let mut state = camera.state.lock();
        // The producer may be stalled on the ring; it is joined once the
        // buffers are unregistered.
        Self::halt(&mut state, &camera.triggers);
        Ok(())
    }

    fn wait_for_frame(&self, device: DeviceId, timeout: Duration) -> DcamResult<WaitOutcome> {
        let events = Arc::clone(&self.camera(device)?.events);
        Ok(events.wait(timeout))
    }

    fn abort_wait(&self, device: DeviceId) -> DcamResult<()> {
        self.camera(device)?.events.abort();
        Ok(())
    }

    fn status(&self, device: DeviceId) -> DcamResult<CaptureStatus> {
        let state = self.camera(device)?.state.lock();
        let running = state
            .capture
            .as_ref()
            .is_some_and(|capture| !capture.stop.load(Ordering::Acquire));
        Ok(if running {
            CaptureStatus::Busy
        } else if state.ring.is_some() {
            CaptureStatus::Ready
        } else {
            CaptureStatus::Stable
        })
    }

    fn fire_software_trigger(&self, device: DeviceId) -> DcamResult<()> {
        let camera = self.camera(device)?;
        let state = camera.state.lock();
        if state.capture.is_none() {
            return Err(DcamError::driver("fire_software_trigger", "camera is not capturing"));
        }
        if number(&state.values, PropertyId::TriggerSource) as i32 != TRIGGER_SOFTWARE {
            return Err(DcamError::driver("fire_software_trigger", "trigger source is not SOFTWARE"));
        }
        camera.triggers.fire();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SimulatorConfig {
        SimulatorConfig {
            device_count: 2,
            sensor_width: 64,
            sensor_height: 32,
            ..Default::default()
        }
    }

    #[test]
    fn derived_geometry_follows_binning_and_subarray() {
        let sim = SimDriver::new(small());
        sim.init().unwrap();
        let dev = sim.open(0).unwrap();

        assert_eq!(sim.get_property(dev, PropertyId::ImageWidth).unwrap(), PropertyValue::Numeric(64.0));
        sim.set_property(dev, PropertyId::Binning, &PropertyValue::Enumerated { value: 2, label: "2X2".into() })
            .unwrap();
        assert_eq!(sim.get_property(dev, PropertyId::ImageWidth).unwrap(), PropertyValue::Numeric(32.0));
        assert_eq!(
            sim.get_property(dev, PropertyId::ImageFramebytes).unwrap(),
            PropertyValue::Numeric((32 * 16 * 2) as f64)
        );

        sim.set_property(dev, PropertyId::SubarrayMode, &PropertyValue::Enumerated { value: 2, label: "ON".into() })
            .unwrap();
        sim.set_property(dev, PropertyId::SubarrayHsize, &16.0.into()).unwrap();
        assert_eq!(sim.get_property(dev, PropertyId::ImageWidth).unwrap(), PropertyValue::Numeric(8.0));
    }

    #[test]
    fn subarray_must_fit_the_sensor() {
        let sim = SimDriver::new(small());
        sim.init().unwrap();
        let dev = sim.open(0).unwrap();
        let err = sim.set_property(dev, PropertyId::SubarrayHpos, &16.0.into()).unwrap_err();
        assert!(matches!(err, DcamError::InvalidValue { .. }));
    }

    #[test]
    fn open_twice_is_rejected() {
        let sim = SimDriver::new(small());
        sim.init().unwrap();
        sim.open(1).unwrap();
        assert!(matches!(sim.open(1), Err(DcamError::DeviceUnavailable { index: 1, .. })));
        assert!(matches!(sim.open(5), Err(DcamError::DeviceUnavailable { index: 5, .. })));
    }

    #[test]
    fn snap_produces_frames_then_stops() {
        let sim = SimDriver::new(small());
        sim.init().unwrap();
        let dev = sim.open(0).unwrap();
        sim.set_property(dev, PropertyId::ExposureTime, &1e-3.into()).unwrap();
        let ring = Arc::new(BufferRing::allocate(4, 64 * 32 * 2).unwrap());
        sim.register_buffers(dev, Arc::clone(&ring)).unwrap();
        assert_eq!(sim.status(dev).unwrap(), CaptureStatus::Ready);

        sim.start_capture(dev, CaptureMode::Snap(3)).unwrap();
        let mut sequences = Vec::new();
        loop {
            match sim.wait_for_frame(dev, Duration::from_secs(1)).unwrap() {
                WaitOutcome::Frame { index, stamp } => {
                    ring.mark_ready(index, stamp).unwrap();
                    let frame = ring.take_next(Duration::from_millis(10)).unwrap();
                    sequences.push(frame.stamp().sequence);
                }
                WaitOutcome::Stopped => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(sequences, vec![0, 1, 2]);

        sim.unregister_buffers(dev).unwrap();
        assert!(!ring.is_registered());
        assert_eq!(sim.status(dev).unwrap(), CaptureStatus::Stable);
    }

    #[test]
    fn abort_wakes_a_waiter() {
        let sim = Arc::new(SimDriver::new(small()));
        sim.init().unwrap();
        let dev = sim.open(0).unwrap();
        let waiter = {
            let sim = Arc::clone(&sim);
            thread::spawn(move || sim.wait_for_frame(dev, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        sim.abort_wait(dev).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::Aborted);
    }

    #[test]
    fn software_trigger_requires_software_source() {
        let sim = SimDriver::new(small());
        sim.init().unwrap();
        let dev = sim.open(0).unwrap();
        let ring = Arc::new(BufferRing::allocate(2, 64 * 32 * 2).unwrap());
        sim.register_buffers(dev, ring).unwrap();
        sim.start_capture(dev, CaptureMode::Sequence).unwrap();
        assert!(matches!(sim.fire_software_trigger(dev), Err(DcamError::Driver { .. })));
        sim.close(dev).unwrap();
        assert!(!sim.is_open(0));
    }
}
