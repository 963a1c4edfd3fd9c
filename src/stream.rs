//! Acquisition stream: start/stop of capture and ordered frame delivery.
//!
//! ```text
//! Armed --start()--> Running --stop() / exhaustion / fatal error--> Stopped
//!   \____________________stop()____________________________________/
//! ```
//!
//! Construction arms the stream: it reads the device geometry, allocates the
//! [`BufferRing`] and registers it with the driver. [`AcquisitionStream::start`]
//! tells the driver to capture. Frames are pulled one at a time with
//! [`AcquisitionStream::take_next`]; each [`Frame`] borrows the stream, so the
//! previous buffer is back in the ring before the next pull can happen.
//!
//! Completions reach the ring in one of two ways ([`Scheduling`]): a capture
//! thread blocking on the driver, or the consumer polling the driver inside
//! `take_next` with a bounded wait.
//!
//! [`StopHandle`] stops the stream from any thread and wakes a consumer blocked
//! in `take_next`. Dropping the stream stops it too, so breaking out of a
//! frame loop never leaks a capture or a buffer registration.

use crate::config::AcquisitionConfig;
use crate::device::{DeviceHandle, DeviceInner, Geometry};
use crate::driver::{CaptureMode, DeviceId, Driver, WaitOutcome};
use crate::error::{DcamError, DcamResult};
use crate::property::PixelType;
use crate::ring::{BufferRing, FrameBuffer, FrameStamp, OverflowPolicy, RingOptions, RingStats};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How completions get from the driver into the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    /// A dedicated thread blocks on the driver and marks buffers ready.
    #[default]
    CaptureThread,
    /// `take_next` polls the driver itself; no extra thread.
    Polling,
}

/// Per-stream settings, usually taken from [`AcquisitionConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamOptions {
    /// Ring capacity cap.
    pub buffer_count: usize,
    /// How long `take_next` waits.
    pub frame_timeout: Duration,
    /// Longest single driver wait.
    pub poll_interval: Duration,
    /// What happens when the consumer falls behind.
    pub overflow_policy: OverflowPolicy,
    /// Who moves completions into the ring.
    pub scheduling: Scheduling,
    /// Refuse rings larger than this.
    pub max_ring_bytes: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&AcquisitionConfig::default())
    }
}

impl From<&AcquisitionConfig> for StreamOptions {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            buffer_count: config.buffer_count,
            frame_timeout: config.frame_timeout(),
            poll_interval: config.poll_interval(),
            overflow_policy: config.overflow_policy,
            scheduling: config.scheduling,
            max_ring_bytes: config.max_ring_bytes,
        }
    }
}

impl StreamOptions {
    /// Replace the frame timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Replace the scheduling.
    pub fn with_scheduling(mut self, scheduling: Scheduling) -> Self {
        self.scheduling = scheduling;
        self
    }

    /// Replace the ring capacity cap.
    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Replace the overflow policy.
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }
}

/// Lifecycle of an [`AcquisitionStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Ring allocated and registered, capture not started.
    Armed,
    /// The driver is filling buffers.
    Running,
    /// Terminal. A new stream must be constructed to capture again.
    Stopped,
}

#[derive(Debug)]
pub(crate) struct StreamShared {
    device: Arc<DeviceInner>,
    ring: Arc<BufferRing>,
    mode: CaptureMode,
    options: StreamOptions,
    geometry: Geometry,
    state: Mutex<StreamState>,
    started: AtomicBool,
    stopping: Arc<AtomicBool>,
    capture_thread: Mutex<Option<JoinHandle<()>>>,
    /// Held for the whole of `stop` so concurrent callers all return after cleanup.
    stop_lock: Mutex<()>,
}

impl StreamShared {
    fn driver(&self) -> &Arc<dyn Driver> {
        self.device.session().driver()
    }

    fn start(&self) -> DcamResult<()> {
        if !self.device.is_open() {
            return Err(DcamError::DeviceNotOpen);
        }
        let mut state = self.state.lock();
        match *state {
            StreamState::Running => return Err(DcamError::AlreadyRunning),
            StreamState::Stopped => return Err(DcamError::Stopped),
            StreamState::Armed => {}
        }

        self.device.begin_capture(|| {
            self.driver().start_capture(self.device.id(), self.mode)?;
            if self.options.scheduling == Scheduling::CaptureThread {
                let pump = Pump {
                    driver: Arc::clone(self.driver()),
                    device: self.device.id(),
                    ring: Arc::clone(&self.ring),
                    stopping: Arc::clone(&self.stopping),
                    poll: self.options.poll_interval,
                };
                let spawned = thread::Builder::new()
                    .name(format!("dcam-capture-{}", self.device.index()))
                    .spawn(move || pump.run());
                match spawned {
                    Ok(handle) => *self.capture_thread.lock() = Some(handle),
                    Err(err) => {
                        let _ = self.driver().stop_capture(self.device.id());
                        return Err(DcamError::driver("start_capture", err.to_string()));
                    }
                }
            }
            Ok(())
        })?;

        self.started.store(true, Ordering::Release);
        *state = StreamState::Running;
        info!(
            index = self.device.index(),
            mode = ?self.mode,
            capacity = self.ring.capacity(),
            scheduling = ?self.options.scheduling,
            "acquisition started"
        );
        Ok(())
    }

    /// Stop capture, unblock the consumer, unregister the ring. Idempotent;
    /// every caller returns only after the buffers are unregistered.
    pub(crate) fn stop(&self) {
        let _serialized = self.stop_lock.lock();
        {
            let mut state = self.state.lock();
            if *state == StreamState::Stopped {
                return;
            }
            *state = StreamState::Stopped;
        }

        let driver = self.driver();
        let device = self.device.id();
        self.stopping.store(true, Ordering::Release);
        if self.started.load(Ordering::Acquire) {
            if let Err(err) = driver.stop_capture(device) {
                warn!(error = %err, "driver refused to stop capture");
            }
        }
        let _ = driver.abort_wait(device);
        self.ring.stop();

        if let Some(handle) = self.capture_thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("capture thread panicked");
            }
        }
        if let Err(err) = driver.unregister_buffers(device) {
            warn!(error = %err, "failed to unregister buffers");
        }
        self.device.end_capture(self);

        let stats = self.ring.stats();
        info!(
            index = self.device.index(),
            delivered = stats.delivered,
            dropped = stats.dropped,
            "acquisition stopped"
        );
    }

    /// Cooperative scheduling: drive the driver from the consumer thread.
    fn poll_next(&self, timeout: Duration) -> DcamResult<FrameBuffer<'_>> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(frame) = self.ring.try_take_next()? {
                return Ok(frame);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(DcamError::AcquisitionTimeout(timeout));
                    }
                    remaining.min(self.options.poll_interval)
                }
                None => self.options.poll_interval,
            };

            match self.driver().wait_for_frame(self.device.id(), wait)? {
                WaitOutcome::Frame { index, stamp } => deliver(&self.ring, index, stamp)?,
                WaitOutcome::Timeout | WaitOutcome::Aborted => {}
                WaitOutcome::Stopped => {
                    // Every completion precedes the driver's stop event.
                    return match self.ring.try_take_next()? {
                        Some(frame) => Ok(frame),
                        None => Err(DcamError::Stopped),
                    };
                }
            }
        }
    }
}

impl Drop for StreamShared {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hand a completion to the ring; driver-side mistakes fault the ring.
fn deliver(ring: &BufferRing, index: usize, stamp: FrameStamp) -> DcamResult<()> {
    match ring.mark_ready(index, stamp) {
        Ok(()) => Ok(()),
        Err(DcamError::Stopped) => Err(DcamError::Stopped),
        Err(err) => {
            ring.fault(err.clone());
            Err(err)
        }
    }
}

/// Capture-thread loop moving driver completions into the ring.
struct Pump {
    driver: Arc<dyn Driver>,
    device: DeviceId,
    ring: Arc<BufferRing>,
    stopping: Arc<AtomicBool>,
    poll: Duration,
}

impl Pump {
    fn run(self) {
        debug!(device = %self.device, "capture thread running");
        while !self.stopping.load(Ordering::Acquire) {
            match self.driver.wait_for_frame(self.device, self.poll) {
                Ok(WaitOutcome::Frame { index, stamp }) => {
                    if let Err(err) = deliver(&self.ring, index, stamp) {
                        if err != DcamError::Stopped {
                            error!(index, sequence = stamp.sequence, error = %err, "capture thread stopping on fatal error");
                        }
                        break;
                    }
                }
                Ok(WaitOutcome::Timeout) | Ok(WaitOutcome::Aborted) => {}
                Ok(WaitOutcome::Stopped) => break,
                Err(err) => {
                    error!(error = %err, "waiting for frame failed");
                    self.ring.fault(DcamError::driver("wait_for_frame", err.to_string()));
                    break;
                }
            }
        }
        debug!(device = %self.device, "capture thread exiting");
    }
}

/// Stops a stream from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shared: Arc<StreamShared>,
}

impl StopHandle {
    /// Same as [`AcquisitionStream::stop`].
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Whether the stream has stopped, for any reason.
    pub fn is_stopped(&self) -> bool {
        *self.shared.state.lock() == StreamState::Stopped
    }
}

/// A completed frame, readable until the next pull from the stream.
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: FrameBuffer<'a>,
    geometry: Geometry,
}

impl Frame<'_> {
    /// Ring slot the frame lives in.
    pub fn index(&self) -> usize {
        self.buffer.index()
    }

    /// Capture sequence number, from 0.
    pub fn sequence(&self) -> u64 {
        self.buffer.stamp().sequence
    }

    /// Device timestamp relative to the start of capture.
    pub fn timestamp(&self) -> Duration {
        self.buffer.stamp().timestamp
    }

    /// False for a partially transferred frame.
    pub fn complete(&self) -> bool {
        self.buffer.stamp().complete
    }

    /// Host wall clock when the completion reached the ring.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.buffer.meta().received_at
    }

    /// Pixels per row.
    pub fn width(&self) -> usize {
        self.geometry.width
    }

    /// Rows.
    pub fn height(&self) -> usize {
        self.geometry.height
    }

    /// Pixel layout of [`data`](Self::data).
    pub fn pixel_type(&self) -> PixelType {
        self.geometry.pixel_type
    }

    /// Pixel bytes, without buffer padding.
    pub fn data(&self) -> &[u8] {
        let data = self.buffer.data();
        let used = self
            .geometry
            .pixel_type
            .frame_bytes(self.geometry.width, self.geometry.height)
            .min(data.len());
        &data[..used]
    }

    /// Copy the frame out of the ring.
    pub fn to_owned_frame(&self) -> OwnedFrame {
        OwnedFrame {
            index: self.index(),
            sequence: self.sequence(),
            timestamp: self.timestamp(),
            complete: self.complete(),
            received_at: self.received_at(),
            width: self.width(),
            height: self.height(),
            pixel_type: self.pixel_type(),
            data: self.data().to_vec(),
        }
    }
}

/// A frame copied out of the ring.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedFrame {
    /// Ring slot the frame was read from
    pub index: usize,
    /// Capture sequence number
    pub sequence: u64,
    /// Device timestamp relative to capture start
    pub timestamp: Duration,
    /// False for a partially transferred frame
    pub complete: bool,
    /// Host wall clock at completion
    pub received_at: DateTime<Utc>,
    /// Pixels per row
    pub width: usize,
    /// Rows
    pub height: usize,
    /// Pixel layout of `data`
    pub pixel_type: PixelType,
    /// Pixel bytes without padding
    pub data: Vec<u8>,
}

impl OwnedFrame {
    /// Pixel values of a MONO16 frame.
    pub fn pixels_u16(&self) -> Option<Vec<u16>> {
        (self.pixel_type == PixelType::Mono16).then(|| {
            self.data
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect()
        })
    }
}

/// Ordered frame delivery from one device.
#[derive(Debug)]
pub struct AcquisitionStream {
    shared: Arc<StreamShared>,
}

impl AcquisitionStream {
    /// Arm a stream on `device`. `nb_frames` of `None` means continuous capture.
    ///
    /// Fails with `StreamAlreadyActive` if another stream is armed or running
    /// on the device, and with `UnsupportedGeometry`/`OutOfMemory` if the ring
    /// cannot be allocated; the device stays open either way.
    pub fn new(device: &DeviceHandle, nb_frames: Option<u64>, options: StreamOptions) -> DcamResult<Self> {
        if nb_frames == Some(0) {
            return Err(DcamError::invalid_value("nb_frames", "must be at least 1"));
        }
        if options.buffer_count == 0 {
            return Err(DcamError::invalid_value("buffer_count", "must be at least 1"));
        }
        let capacity = match nb_frames {
            Some(n) => n.min(options.buffer_count as u64) as usize,
            None => options.buffer_count,
        };
        let mode = match nb_frames {
            Some(n) => CaptureMode::Snap(n),
            None => CaptureMode::Sequence,
        };

        let shared = device.inner().arm(|inner, geometry| {
            let ring = Arc::new(BufferRing::with_options(
                capacity,
                geometry.frame_bytes,
                RingOptions {
                    max_bytes: options.max_ring_bytes,
                    overflow_policy: options.overflow_policy,
                    frame_limit: nb_frames,
                },
            )?);
            inner
                .session()
                .driver()
                .register_buffers(inner.id(), Arc::clone(&ring))?;

            Ok(Arc::new(StreamShared {
                device: Arc::clone(inner),
                ring,
                mode,
                options,
                geometry,
                state: Mutex::new(StreamState::Armed),
                started: AtomicBool::new(false),
                stopping: Arc::new(AtomicBool::new(false)),
                capture_thread: Mutex::new(None),
                stop_lock: Mutex::new(()),
            }))
        })?;

        Ok(Self { shared })
    }

    /// Begin capturing. Fails with `AlreadyRunning` on a running stream,
    /// `DeviceNotOpen` if the device was closed, `Stopped` after stop.
    pub fn start(&mut self) -> DcamResult<()> {
        self.shared.start()
    }

    /// Stop capturing and release every buffer. Idempotent.
    pub fn stop(&mut self) {
        self.shared.stop();
    }

    /// A handle that can stop this stream from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    /// Requested frame count, `None` in continuous mode.
    pub fn nb_frames(&self) -> Option<u64> {
        match self.shared.mode {
            CaptureMode::Snap(n) => Some(n),
            CaptureMode::Sequence => None,
        }
    }

    /// Frame layout, fixed when the stream was armed.
    pub fn geometry(&self) -> Geometry {
        self.shared.geometry
    }

    /// Buffers in the ring.
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Whether every requested frame has been delivered.
    pub fn is_exhausted(&self) -> bool {
        self.shared.ring.is_exhausted()
    }

    /// Whether the driver still holds the ring as its frame destination.
    pub fn is_registered(&self) -> bool {
        self.shared.ring.is_registered()
    }

    /// Ring counters so far.
    pub fn stats(&self) -> RingStats {
        self.shared.ring.stats()
    }

    /// Next frame using the configured timeout.
    pub fn take_next(&mut self) -> DcamResult<Frame<'_>> {
        let timeout = self.shared.options.frame_timeout;
        self.take_next_timeout(timeout)
    }

    /// Next frame in sequence order.
    ///
    /// `Exhausted` ends a finite stream and `Stopped` follows a stop; both
    /// leave the stream stopped. `AcquisitionTimeout` changes nothing and
    /// may be retried. Fatal ring errors stop the stream before returning.
    pub fn take_next_timeout(&mut self, timeout: Duration) -> DcamResult<Frame<'_>> {
        let shared = &*self.shared;
        let result = match shared.options.scheduling {
            Scheduling::CaptureThread => shared.ring.take_next(timeout),
            Scheduling::Polling => shared.poll_next(timeout),
        };

        match result {
            Ok(buffer) => Ok(Frame {
                buffer,
                geometry: shared.geometry,
            }),
            Err(err) => {
                if err.is_fatal() || shared.ring.fault_error().is_some() {
                    error!(error = %err, "stream desynchronized, stopping");
                    shared.stop();
                } else if err.is_end_of_stream() {
                    shared.stop();
                }
                Err(err)
            }
        }
    }

    /// Like [`take_next`](Self::take_next), with end of stream as `Ok(None)`.
    pub fn next_frame(&mut self) -> DcamResult<Option<Frame<'_>>> {
        match self.take_next() {
            Ok(frame) => Ok(Some(frame)),
            Err(err) if err.is_end_of_stream() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Iterator over owned copies of the remaining frames.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            stream: self,
            done: false,
        }
    }
}

impl Drop for AcquisitionStream {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

/// See [`AcquisitionStream::frames`]. Ends after the stream ends or after
/// the first error that is not a timeout.
#[derive(Debug)]
pub struct Frames<'s> {
    stream: &'s mut AcquisitionStream,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = DcamResult<OwnedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.stream.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame.to_owned_frame())),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = !err.is_recoverable();
                Some(Err(err))
            }
        }
    }
}
