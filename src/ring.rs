//! Buffer ring shared between the capture driver and the consumer.
//!
//! A fixed set of frame buffers, pre-allocated for the current geometry and
//! registered with the driver. Each buffer moves through
//!
//! ```text
//! Free -> Filling -> Ready -> Lent -> Free
//! ```
//!
//! The producer (driver) claims buffers with [`BufferRing::begin_fill`] and
//! reports completions with [`BufferRing::mark_ready`]. The consumer pulls
//! them with [`BufferRing::take_next`], which always hands out the next
//! sequence number even if completions arrived out of order, and gives them
//! back by dropping the returned [`FrameBuffer`].
//!
//! All bookkeeping lives behind one mutex. Pixel memory sits in per-slot
//! `RwLock`s so the producer writes and the consumer reads without copying;
//! the slot state guarantees those locks are never contended for long.
//!
//! ## Overflow
//!
//! When the producer wraps onto a buffer the consumer has not taken yet,
//! [`OverflowPolicy`] decides. `Stall` (default) blocks the producer and logs a
//! warning; `DropOldest` recycles the unread buffer and records the lost
//! sequence. A buffer currently lent to the consumer is never overwritten.

use crate::error::{DcamError, DcamResult};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// What the producer does when the buffer it needs next has not been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Block capture until the consumer catches up.
    #[default]
    Stall,
    /// Overwrite the oldest unread frame and count it as dropped.
    DropOldest,
}

/// Metadata the driver attaches to a completed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStamp {
    /// Capture sequence number, starting at 0 for the first frame of a stream.
    pub sequence: u64,
    /// Device timestamp relative to the start of capture.
    pub timestamp: Duration,
    /// False when the driver reports a partially transferred frame.
    pub complete: bool,
}

/// Completed-frame metadata as seen by the consumer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    /// Ring slot holding the pixels
    pub index: usize,
    /// What the driver reported with the completion
    pub stamp: FrameStamp,
    /// Host wall clock at completion.
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SlotState {
    Free,
    Filling { sequence: u64 },
    Ready(FrameMeta),
    Lent(FrameMeta),
}

/// Allocation limits and behaviour of a ring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingOptions {
    /// Upper bound on `capacity * frame_size`.
    pub max_bytes: usize,
    /// What `begin_fill` does when the next slot still holds an unread frame.
    pub overflow_policy: OverflowPolicy,
    /// Number of frames after which the ring reports `Exhausted`.
    pub frame_limit: Option<u64>,
}

impl Default for RingOptions {
    fn default() -> Self {
        Self {
            max_bytes: 1 << 30,
            overflow_policy: OverflowPolicy::Stall,
            frame_limit: None,
        }
    }
}

/// Counters describing a ring's life so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    /// Buffers in the ring
    pub capacity: usize,
    /// Frames handed to the consumer
    pub delivered: u64,
    /// Frames overwritten unread under `DropOldest`
    pub dropped: u64,
    /// Times the producer had to wait for a free buffer
    pub stalls: u64,
    /// Buffers not currently free (filling, ready or lent).
    pub outstanding: usize,
}

#[derive(Debug)]
struct RingState {
    slots: Vec<SlotState>,
    /// Sequence number handed to the next `begin_fill`.
    next_fill: u64,
    /// Sequence number the consumer receives next.
    next_deliver: u64,
    ready: BTreeMap<u64, usize>,
    dropped_sequences: BTreeSet<u64>,
    delivered: u64,
    dropped: u64,
    stalls: u64,
    registered: bool,
    stopped: bool,
    fault: Option<DcamError>,
}

impl RingState {
    fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| **s != SlotState::Free).count()
    }

    fn skip_dropped(&mut self) {
        while self.dropped_sequences.remove(&self.next_deliver) {
            self.next_deliver += 1;
        }
    }
}

/// Fixed-capacity ring of frame buffers.
pub struct BufferRing {
    frame_size: usize,
    options: RingOptions,
    state: Mutex<RingState>,
    /// Signalled on `mark_ready`, stop and fault.
    ready: Condvar,
    /// Signalled on `release`, stop and fault.
    freed: Condvar,
    buffers: Vec<RwLock<Box<[u8]>>>,
}

impl BufferRing {
    /// Allocate `capacity` buffers of `frame_size` bytes with default options.
    pub fn allocate(capacity: usize, frame_size: usize) -> DcamResult<Self> {
        Self::with_options(capacity, frame_size, RingOptions::default())
    }

    /// Allocate a ring; fails with `UnsupportedGeometry` for empty or
    /// oversized rings and `OutOfMemory` when the host cannot provide the memory.
    pub fn with_options(capacity: usize, frame_size: usize, options: RingOptions) -> DcamResult<Self> {
        if capacity == 0 {
            return Err(DcamError::UnsupportedGeometry(
                "ring capacity must be at least one buffer".to_string(),
            ));
        }
        if frame_size == 0 {
            return Err(DcamError::UnsupportedGeometry("frame size is zero".to_string()));
        }
        let total = capacity
            .checked_mul(frame_size)
            .filter(|total| *total <= options.max_bytes)
            .ok_or_else(|| {
                DcamError::UnsupportedGeometry(format!(
                    "{} buffers of {} bytes exceed the {} byte limit",
                    capacity, frame_size, options.max_bytes
                ))
            })?;

        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(capacity)
            .map_err(|_| DcamError::OutOfMemory { requested: total })?;
        for _ in 0..capacity {
            let mut buffer: Vec<u8> = Vec::new();
            buffer
                .try_reserve_exact(frame_size)
                .map_err(|_| DcamError::OutOfMemory { requested: total })?;
            buffer.resize(frame_size, 0);
            buffers.push(RwLock::new(buffer.into_boxed_slice()));
        }

        debug!(capacity, frame_size, total, "allocated buffer ring");

        Ok(Self {
            frame_size,
            options,
            state: Mutex::new(RingState {
                slots: vec![SlotState::Free; capacity],
                next_fill: 0,
                next_deliver: 0,
                ready: BTreeMap::new(),
                dropped_sequences: BTreeSet::new(),
                delivered: 0,
                dropped: 0,
                stalls: 0,
                registered: false,
                stopped: false,
                fault: None,
            }),
            ready: Condvar::new(),
            freed: Condvar::new(),
            buffers,
        })
    }

    /// Number of buffers.
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Bytes per buffer.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Options the ring was allocated with.
    pub fn options(&self) -> RingOptions {
        self.options
    }

    fn check_index(&self, index: usize) -> DcamResult<()> {
        if index >= self.capacity() {
            return Err(DcamError::InvalidIndex {
                index,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// Claim the buffer for the next capture.
    ///
    /// Blocks while that buffer is still unread under `Stall`, or lent to the
    /// consumer under either policy. Returns `None` once the ring is stopped
    /// or the frame limit has been handed out.
    pub fn begin_fill(&self) -> Option<FillSlot<'_>> {
        let mut state = self.state.lock();
        let (index, sequence) = loop {
            if state.stopped {
                return None;
            }
            if let Some(limit) = self.options.frame_limit {
                if state.next_fill >= limit {
                    return None;
                }
            }

            let sequence = state.next_fill;
            let index = (sequence % self.capacity() as u64) as usize;
            let slot = state.slots[index];
            match slot {
                SlotState::Free => break (index, sequence),
                SlotState::Ready(meta) if self.options.overflow_policy == OverflowPolicy::DropOldest => {
                    let lost = meta.stamp.sequence;
                    state.ready.remove(&lost);
                    state.dropped_sequences.insert(lost);
                    state.dropped += 1;
                    state.skip_dropped();
                    warn!(index, sequence = lost, "consumer behind, dropping oldest frame");
                    break (index, sequence);
                }
                _ => {
                    state.stalls += 1;
                    warn!(index, sequence, "all buffers in use, capture stalled");
                    while !state.stopped && self.blocks_producer(state.slots[index]) {
                        self.freed.wait(&mut state);
                    }
                }
            }
        };

        state.slots[index] = SlotState::Filling { sequence };
        state.next_fill += 1;
        drop(state);

        trace!(index, sequence, "filling buffer");
        Some(FillSlot {
            index,
            sequence,
            data: self.buffers[index].write(),
        })
    }

    fn blocks_producer(&self, slot: SlotState) -> bool {
        match slot {
            SlotState::Free => false,
            SlotState::Ready(_) => self.options.overflow_policy == OverflowPolicy::Stall,
            SlotState::Filling { .. } | SlotState::Lent(_) => true,
        }
    }

    /// Record that the driver finished writing buffer `index`.
    ///
    /// Rejects out-of-range indices with `InvalidIndex`. The buffer must be
    /// filling and `stamp.sequence` must be the sequence claimed for it in
    /// [`begin_fill`](Self::begin_fill). A second completion for a buffer that
    /// has not been consumed yet (`DoubleMark`), a completion naming another
    /// sequence, or one for an unclaimed buffer (`SequenceDesync`) faults the
    /// ring: every waiter wakes up with that error.
    pub fn mark_ready(&self, index: usize, stamp: FrameStamp) -> DcamResult<()> {
        self.check_index(index)?;
        let mut state = self.state.lock();
        if let Some(err) = &state.fault {
            return Err(err.clone());
        }
        if state.stopped {
            return Err(DcamError::Stopped);
        }

        let desync = match state.slots[index] {
            SlotState::Filling { sequence } if sequence == stamp.sequence => None,
            SlotState::Filling { sequence } => Some(DcamError::SequenceDesync {
                expected: sequence,
                got: stamp.sequence,
            }),
            SlotState::Ready(_) | SlotState::Lent(_) => Some(DcamError::DoubleMark { index }),
            // Nothing was claimed here: a stale or invented completion.
            SlotState::Free => Some(DcamError::SequenceDesync {
                expected: state.next_deliver,
                got: stamp.sequence,
            }),
        };
        if let Some(err) = desync {
            error!(index, sequence = stamp.sequence, error = %err, "buffer ring desynchronized");
            self.fault_locked(&mut state, err.clone());
            return Err(err);
        }

        let meta = FrameMeta {
            index,
            stamp,
            received_at: Utc::now(),
        };
        state.slots[index] = SlotState::Ready(meta);
        state.ready.insert(stamp.sequence, index);
        trace!(index, sequence = stamp.sequence, "buffer ready");
        self.ready.notify_all();
        Ok(())
    }

    /// Non-blocking form of [`BufferRing::take_next`]: `Ok(None)` when the next
    /// frame has not completed yet.
    pub fn try_take_next(&self) -> DcamResult<Option<FrameBuffer<'_>>> {
        let mut state = self.state.lock();
        let taken = self.take_locked(&mut state)?;
        drop(state);
        Ok(taken.map(|meta| self.lend(meta)))
    }

    /// Block until the next frame in sequence order is ready.
    ///
    /// Fails with `AcquisitionTimeout` after `timeout` without changing any
    /// state, `Stopped` once the ring is stopped, `Exhausted` after the frame
    /// limit, or the fault that stopped the ring.
    pub fn take_next(&self, timeout: Duration) -> DcamResult<FrameBuffer<'_>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(meta) = self.take_locked(&mut state)? {
                drop(state);
                return Ok(self.lend(meta));
            }
            let Some(deadline) = deadline else {
                self.ready.wait(&mut state);
                continue;
            };
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                // A completion may have raced the deadline.
                if let Some(meta) = self.take_locked(&mut state)? {
                    drop(state);
                    return Ok(self.lend(meta));
                }
                return Err(DcamError::AcquisitionTimeout(timeout));
            }
        }
    }

    fn take_locked(&self, state: &mut RingState) -> DcamResult<Option<FrameMeta>> {
        if let Some(err) = &state.fault {
            return Err(err.clone());
        }
        state.skip_dropped();
        if let Some(limit) = self.options.frame_limit {
            if state.next_deliver >= limit {
                return Err(DcamError::Exhausted);
            }
        }
        if state.stopped {
            return Err(DcamError::Stopped);
        }

        match state.ready.remove(&state.next_deliver) {
            Some(index) => {
                let SlotState::Ready(meta) = state.slots[index] else {
                    let err = DcamError::DoubleMark { index };
                    self.fault_locked(state, err.clone());
                    return Err(err);
                };
                state.slots[index] = SlotState::Lent(meta);
                state.next_deliver += 1;
                state.delivered += 1;
                Ok(Some(meta))
            }
            None if state.ready.len() == self.capacity() => {
                // Every buffer holds a later frame; the expected one can never arrive.
                let got = state.ready.keys().next().copied().unwrap_or_default();
                let err = DcamError::SequenceDesync {
                    expected: state.next_deliver,
                    got,
                };
                error!(error = %err, "buffer ring desynchronized");
                self.fault_locked(state, err.clone());
                Err(err)
            }
            None => Ok(None),
        }
    }

    fn lend(&self, meta: FrameMeta) -> FrameBuffer<'_> {
        FrameBuffer {
            ring: self,
            meta,
            data: Some(self.buffers[meta.index].read()),
        }
    }

    /// Give a lent buffer back to the producer.
    ///
    /// Normally called by dropping the [`FrameBuffer`]. Fails with
    /// `BufferNotLent` if the consumer does not hold `index`.
    pub fn release(&self, index: usize) -> DcamResult<()> {
        self.check_index(index)?;
        let mut state = self.state.lock();
        let slot = state.slots[index];
        match slot {
            SlotState::Lent(_) => {
                state.slots[index] = SlotState::Free;
                self.freed.notify_all();
                Ok(())
            }
            _ => Err(DcamError::BufferNotLent { index }),
        }
    }

    /// Stop the ring: wake every waiter with `Stopped` and free every buffer
    /// not currently lent. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.stopped {
            debug!(
                delivered = state.delivered,
                dropped = state.dropped,
                "stopping buffer ring"
            );
        }
        Self::stop_locked(&mut state);
        self.ready.notify_all();
        self.freed.notify_all();
    }

    fn stop_locked(state: &mut RingState) {
        state.stopped = true;
        state.ready.clear();
        for slot in state.slots.iter_mut() {
            if !matches!(slot, SlotState::Lent(_)) {
                *slot = SlotState::Free;
            }
        }
    }

    /// Stop the ring with a fatal error that every later call reports.
    pub fn fault(&self, err: DcamError) {
        let mut state = self.state.lock();
        self.fault_locked(&mut state, err);
    }

    fn fault_locked(&self, state: &mut RingState, err: DcamError) {
        if state.fault.is_none() {
            state.fault = Some(err);
        }
        Self::stop_locked(state);
        self.ready.notify_all();
        self.freed.notify_all();
    }

    /// The error that faulted the ring, if any.
    pub fn fault_error(&self) -> Option<DcamError> {
        self.state.lock().fault.clone()
    }

    /// True after `stop` or a fault.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Whether the consumer has received everything it asked for.
    pub fn is_exhausted(&self) -> bool {
        let state = self.state.lock();
        self.options
            .frame_limit
            .is_some_and(|limit| state.next_deliver >= limit)
    }

    /// Called by the driver when it starts or stops writing into this ring.
    pub fn set_registered(&self, registered: bool) {
        self.state.lock().registered = registered;
    }

    /// Whether a driver currently holds the ring.
    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> RingStats {
        let state = self.state.lock();
        RingStats {
            capacity: self.capacity(),
            delivered: state.delivered,
            dropped: state.dropped,
            stalls: state.stalls,
            outstanding: state.outstanding(),
        }
    }
}

impl fmt::Debug for BufferRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRing")
            .field("capacity", &self.capacity())
            .field("frame_size", &self.frame_size)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Write access to a buffer claimed by the producer.
pub struct FillSlot<'a> {
    /// Slot being filled
    pub index: usize,
    /// Sequence to report when the fill completes
    pub sequence: u64,
    data: RwLockWriteGuard<'a, Box<[u8]>>,
}

impl FillSlot<'_> {
    /// The whole buffer, `frame_size` bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for FillSlot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FillSlot")
            .field("index", &self.index)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// A completed frame lent to the consumer. Dropping it returns the buffer
/// to the ring.
pub struct FrameBuffer<'a> {
    ring: &'a BufferRing,
    meta: FrameMeta,
    data: Option<RwLockReadGuard<'a, Box<[u8]>>>,
}

impl FrameBuffer<'_> {
    /// Ring slot.
    pub fn index(&self) -> usize {
        self.meta.index
    }

    /// Sequence and device timestamp.
    pub fn stamp(&self) -> FrameStamp {
        self.meta.stamp
    }

    /// Stamp plus host receive time.
    pub fn meta(&self) -> FrameMeta {
        self.meta
    }

    /// The whole buffer, padding included.
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().map(|b| &b[..]).unwrap_or_default()
    }
}

impl fmt::Debug for FrameBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("meta", &self.meta)
            .field("bytes", &self.data().len())
            .finish()
    }
}

impl Drop for FrameBuffer<'_> {
    fn drop(&mut self) {
        // Unlock the pixels before the producer can see the slot as free.
        self.data.take();
        if let Err(err) = self.ring.release(self.meta.index) {
            warn!(index = self.meta.index, error = %err, "failed to release frame buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn stamp(sequence: u64) -> FrameStamp {
        FrameStamp {
            sequence,
            timestamp: Duration::from_millis(sequence * 10),
            complete: true,
        }
    }

    fn fill(ring: &BufferRing) -> (usize, u64) {
        let mut slot = ring.begin_fill().unwrap();
        let sequence = slot.sequence;
        slot.data_mut()[0] = sequence as u8;
        (slot.index, slot.sequence)
    }

    #[test]
    fn allocation_limits() {
        assert!(matches!(
            BufferRing::allocate(4, 0),
            Err(DcamError::UnsupportedGeometry(_))
        ));
        assert!(matches!(
            BufferRing::allocate(0, 16),
            Err(DcamError::UnsupportedGeometry(_))
        ));
        let options = RingOptions {
            max_bytes: 1024,
            ..Default::default()
        };
        assert!(matches!(
            BufferRing::with_options(4, 512, options),
            Err(DcamError::UnsupportedGeometry(_))
        ));
        assert!(matches!(
            BufferRing::allocate(2, usize::MAX),
            Err(DcamError::UnsupportedGeometry(_))
        ));

        let ring = BufferRing::allocate(3, 64).unwrap();
        assert_eq!(ring.capacity(), 3);
        assert_eq!(ring.frame_size(), 64);
        assert_eq!(ring.stats().outstanding, 0);
    }

    #[test]
    fn fill_take_release_cycle() {
        let ring = BufferRing::allocate(2, 8).unwrap();
        let (index, sequence) = fill(&ring);
        ring.mark_ready(index, stamp(sequence)).unwrap();

        {
            let frame = ring.take_next(Duration::from_millis(10)).unwrap();
            assert_eq!(frame.stamp().sequence, 0);
            assert_eq!(frame.data()[0], 0);
            assert_eq!(ring.stats().outstanding, 1);
        }
        assert_eq!(ring.stats().outstanding, 0);
        assert_eq!(ring.stats().delivered, 1);
    }

    #[test]
    fn invalid_index() {
        let ring = BufferRing::allocate(2, 8).unwrap();
        assert_eq!(
            ring.mark_ready(2, stamp(0)),
            Err(DcamError::InvalidIndex { index: 2, capacity: 2 })
        );
        // not fatal
        assert!(ring.fault_error().is_none());
    }

    #[test]
    fn double_mark_faults_the_ring() {
        let ring = BufferRing::allocate(2, 8).unwrap();
        let (index, sequence) = fill(&ring);
        ring.mark_ready(index, stamp(sequence)).unwrap();

        let err = ring.mark_ready(index, stamp(sequence)).unwrap_err();
        assert_eq!(err, DcamError::DoubleMark { index });
        assert!(ring.is_stopped());
        assert_eq!(
            ring.take_next(Duration::from_millis(1)).unwrap_err(),
            DcamError::DoubleMark { index }
        );
    }

    #[test]
    fn stale_sequence_is_rejected() {
        let ring = BufferRing::allocate(2, 8).unwrap();
        let (index, sequence) = fill(&ring);
        ring.mark_ready(index, stamp(sequence)).unwrap();
        drop(ring.take_next(Duration::from_millis(1)).unwrap());

        let (index, _) = fill(&ring);
        let err = ring.mark_ready(index, stamp(0)).unwrap_err();
        assert!(matches!(err, DcamError::SequenceDesync { expected: 1, got: 0 }));
    }

    #[test]
    fn out_of_order_completions_are_reordered() {
        let ring = BufferRing::allocate(4, 8).unwrap();
        let first = fill(&ring);
        let second = fill(&ring);
        ring.mark_ready(second.0, stamp(second.1)).unwrap();

        // sequence 1 is ready but 0 is not: nothing to deliver yet
        assert!(ring.try_take_next().unwrap().is_none());

        ring.mark_ready(first.0, stamp(first.1)).unwrap();
        let a = ring.take_next(Duration::from_millis(1)).unwrap().stamp().sequence;
        let b = ring.take_next(Duration::from_millis(1)).unwrap().stamp().sequence;
        assert_eq!((a, b), (0, 1));
    }

    #[test]
    fn completion_must_match_the_claimed_sequence() {
        let ring = BufferRing::allocate(2, 8).unwrap();
        let (index, sequence) = fill(&ring);
        assert_eq!(sequence, 0);

        let err = ring.mark_ready(index, stamp(5)).unwrap_err();
        assert_eq!(err, DcamError::SequenceDesync { expected: 0, got: 5 });
        assert_eq!(ring.fault_error(), Some(err.clone()));
        assert_eq!(ring.take_next(Duration::from_millis(1)).unwrap_err(), err);
    }

    #[test]
    fn completion_for_an_unclaimed_buffer_faults() {
        let ring = BufferRing::allocate(2, 8).unwrap();
        let (claimed, _) = fill(&ring);
        assert_eq!(claimed, 0);

        // slot 1 was never handed to the producer
        let err = ring.mark_ready(1, stamp(0)).unwrap_err();
        assert!(matches!(err, DcamError::SequenceDesync { got: 0, .. }));
        assert!(ring.is_stopped());
        assert_eq!(ring.take_next(Duration::from_millis(1)).unwrap_err(), err);
        assert_eq!(ring.stats().delivered, 0);
    }

    #[test]
    fn timeout_leaves_state_untouched() {
        let ring = BufferRing::allocate(2, 8).unwrap();
        let before = ring.stats();
        assert_eq!(
            ring.take_next(Duration::from_millis(5)).unwrap_err(),
            DcamError::AcquisitionTimeout(Duration::from_millis(5))
        );
        assert_eq!(ring.stats(), before);

        let (index, sequence) = fill(&ring);
        ring.mark_ready(index, stamp(sequence)).unwrap();
        assert!(ring.take_next(Duration::from_millis(5)).is_ok());
    }

    #[test]
    fn frame_limit_exhausts() {
        let options = RingOptions {
            frame_limit: Some(2),
            ..Default::default()
        };
        let ring = BufferRing::with_options(4, 8, options).unwrap();
        for _ in 0..2 {
            let (index, sequence) = fill(&ring);
            ring.mark_ready(index, stamp(sequence)).unwrap();
        }
        assert!(ring.begin_fill().is_none());
        assert!(ring.take_next(Duration::from_millis(1)).is_ok());
        assert!(!ring.is_exhausted());
        assert!(ring.take_next(Duration::from_millis(1)).is_ok());
        assert!(ring.is_exhausted());
        assert_eq!(
            ring.take_next(Duration::from_millis(1)).unwrap_err(),
            DcamError::Exhausted
        );
    }

    #[test]
    fn release_requires_a_lent_buffer() {
        let ring = BufferRing::allocate(2, 8).unwrap();
        assert_eq!(ring.release(0), Err(DcamError::BufferNotLent { index: 0 }));
    }

    #[test]
    fn stop_unblocks_a_waiting_consumer() {
        let ring = Arc::new(BufferRing::allocate(2, 8).unwrap());
        let waiter = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.take_next(Duration::from_secs(10)).map(|f| f.index()))
        };
        thread::sleep(Duration::from_millis(20));
        ring.stop();
        assert_eq!(waiter.join().unwrap(), Err(DcamError::Stopped));
        assert_eq!(ring.stats().outstanding, 0);
    }

    #[test]
    fn stall_blocks_producer_until_release() {
        let ring = Arc::new(BufferRing::allocate(1, 8).unwrap());
        let (index, sequence) = fill(&ring);
        ring.mark_ready(index, stamp(sequence)).unwrap();

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let slot = ring.begin_fill().map(|s| (s.index, s.sequence));
                if let Some((index, sequence)) = slot {
                    ring.mark_ready(index, stamp(sequence)).unwrap();
                }
                slot
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());
        drop(ring.take_next(Duration::from_millis(10)).unwrap());

        assert_eq!(producer.join().unwrap(), Some((0, 1)));
        assert_eq!(ring.take_next(Duration::from_millis(100)).unwrap().stamp().sequence, 1);
        assert!(ring.stats().stalls >= 1);
    }

    #[test]
    fn drop_oldest_skips_unread_frames() {
        let options = RingOptions {
            overflow_policy: OverflowPolicy::DropOldest,
            ..Default::default()
        };
        let ring = BufferRing::with_options(2, 8, options).unwrap();
        for _ in 0..3 {
            let (index, sequence) = fill(&ring);
            ring.mark_ready(index, stamp(sequence)).unwrap();
        }

        let stats = ring.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(ring.take_next(Duration::from_millis(1)).unwrap().stamp().sequence, 1);
        assert_eq!(ring.take_next(Duration::from_millis(1)).unwrap().stamp().sequence, 2);
    }
}
