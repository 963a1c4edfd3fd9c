//! Integration tests for acquisition streams against the simulated camera.
//!
//! Covers ordered delivery, exact frame counts, stop semantics from any
//! state, timeouts, and the fatal handling of driver desynchronization.

mod common;

use common::{fast_camera, options, session, FAST_EXPOSURE, HEIGHT, TRIGGER_SOFTWARE, WIDTH};
use hamamatsu_dcam::{
    CaptureState, DcamError, OverflowPolicy, PixelType, PropertyId, Scheduling, StreamOptions, StreamState,
};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_ten_frames_with_increasing_timestamps() {
    let (sim, session) = session(1);
    let camera = fast_camera(&session, 4);
    camera.set(PropertyId::ExposureTime, 0.1).expect("Failed to set exposure");

    let mut stream = camera.stream(Some(10)).expect("Failed to arm stream");
    assert_eq!(stream.state(), StreamState::Armed);
    assert!(stream.is_registered());
    stream.start().expect("Failed to start");

    let mut sequences = Vec::new();
    let mut timestamps = Vec::new();
    while let Some(frame) = stream.next_frame().expect("Acquisition failed") {
        assert!(frame.complete());
        assert_eq!(frame.width(), WIDTH);
        assert_eq!(frame.height(), HEIGHT);
        assert_eq!(frame.pixel_type(), PixelType::Mono16);
        assert_eq!(frame.data().len(), WIDTH * HEIGHT * 2);
        sequences.push(frame.sequence());
        timestamps.push(frame.timestamp());
    }

    assert_eq!(sequences, (0..10).collect::<Vec<_>>());
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]), "timestamps not increasing: {:?}", timestamps);

    assert_eq!(stream.state(), StreamState::Stopped);
    assert!(!stream.is_registered());
    assert_eq!(sim.registered_buffers(0), 0);
    assert!(!sim.is_capturing(0));
    assert_eq!(camera.capture_state().unwrap(), CaptureState::Idle);
    assert_eq!(stream.stats().delivered, 10);
}

#[test]
fn test_exactly_n_frames_then_exhausted() {
    let (_sim, session) = session(1);
    let camera = fast_camera(&session, 4);

    for n in [1u64, 3, 4, 9] {
        let mut stream = camera.start(Some(n)).expect("Failed to start stream");
        for expected in 0..n {
            let frame = stream.take_next().expect("Missing frame");
            assert_eq!(frame.sequence(), expected);
        }
        assert_eq!(stream.take_next().unwrap_err(), DcamError::Exhausted);
        assert_eq!(stream.take_next().unwrap_err(), DcamError::Exhausted);
        assert!(stream.is_exhausted());
        assert_eq!(stream.state(), StreamState::Stopped);
    }
}

#[test]
fn test_sequences_unique_and_increasing_for_every_capacity() {
    let (_sim, session) = session(1);
    let camera = fast_camera(&session, 1);

    for capacity in 1..=6 {
        let mut stream = camera
            .stream_with(Some(15), options(capacity))
            .expect("Failed to arm stream");
        assert_eq!(stream.capacity(), capacity);
        stream.start().expect("Failed to start");

        let sequences: Vec<u64> = stream
            .frames()
            .map(|frame| frame.expect("Acquisition failed").sequence)
            .collect();
        assert_eq!(sequences, (0..15).collect::<Vec<_>>(), "capacity {}", capacity);
    }
}

#[test]
fn test_ring_is_sized_to_small_frame_counts() {
    let (_sim, session) = session(1);
    let camera = fast_camera(&session, 8);
    let stream = camera.stream(Some(3)).expect("Failed to arm stream");
    assert_eq!(stream.capacity(), 3);
    assert_eq!(stream.nb_frames(), Some(3));
}

#[test]
fn test_zero_frames_is_rejected() {
    let (_sim, session) = session(1);
    let camera = fast_camera(&session, 4);
    assert!(matches!(camera.stream(Some(0)), Err(DcamError::InvalidValue { .. })));
    assert_eq!(camera.capture_state().unwrap(), CaptureState::Idle);
}

#[test]
fn test_failed_ring_allocation_leaves_device_usable() {
    let (sim, session) = session(1);
    let camera = fast_camera(&session, 4);

    let tiny = StreamOptions {
        max_ring_bytes: 16,
        ..options(4)
    };
    assert!(matches!(
        camera.stream_with(Some(4), tiny),
        Err(DcamError::UnsupportedGeometry(_))
    ));
    assert!(camera.is_open());
    assert_eq!(camera.capture_state().unwrap(), CaptureState::Idle);
    assert_eq!(sim.registered_buffers(0), 0);

    // Nothing was left attached, so a normal stream arms and runs
    let mut stream = camera.start(Some(2)).expect("Failed to start after allocation failure");
    assert_eq!(stream.frames().map(|f| f.expect("Acquisition failed")).count(), 2);
}

#[test]
fn test_second_stream_rejected_while_first_running() {
    let (_sim, session) = session(1);
    let camera = fast_camera(&session, 4);

    let mut first = camera.stream(Some(6)).expect("Failed to arm stream");
    assert_eq!(camera.stream(Some(2)).unwrap_err(), DcamError::StreamAlreadyActive);

    first.start().expect("Failed to start");
    assert_eq!(camera.stream(Some(2)).unwrap_err(), DcamError::StreamAlreadyActive);
    assert_eq!(first.start().unwrap_err(), DcamError::AlreadyRunning);

    // First stream unaffected
    let count = first.frames().map(|f| f.expect("Acquisition failed")).count();
    assert_eq!(count, 6);

    // Once stopped, a new stream can be armed
    let mut second = camera.start(Some(2)).expect("Failed to start second stream");
    assert_eq!(second.frames().count(), 2);
}

#[test]
fn test_timeout_is_recoverable() {
    let (_sim, session) = session(1);
    let camera = fast_camera(&session, 2);
    camera
        .set(PropertyId::TriggerSource, TRIGGER_SOFTWARE)
        .expect("Failed to select software trigger");

    let mut stream = camera.start(Some(2)).expect("Failed to start");
    let err = stream.take_next_timeout(Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, DcamError::AcquisitionTimeout(_)));
    assert!(err.is_recoverable());
    assert_eq!(stream.state(), StreamState::Running);
    assert_eq!(stream.stats().delivered, 0);

    camera.fire_software_trigger().expect("Failed to fire trigger");
    let frame = stream.take_next_timeout(Duration::from_secs(2)).expect("Frame after retry");
    assert_eq!(frame.sequence(), 0);
    drop(frame);

    camera.fire_software_trigger().expect("Failed to fire trigger");
    assert_eq!(stream.take_next().expect("Second frame").sequence(), 1);
    assert_eq!(stream.take_next().unwrap_err(), DcamError::Exhausted);
}

#[test]
fn test_stop_before_start() {
    let (sim, session) = session(1);
    let camera = fast_camera(&session, 4);

    let mut stream = camera.stream(Some(5)).expect("Failed to arm stream");
    assert_eq!(sim.registered_buffers(0), 4);

    stream.stop();
    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(sim.registered_buffers(0), 0);
    assert!(!stream.is_registered());
    assert_eq!(camera.capture_state().unwrap(), CaptureState::Idle);

    // Idempotent, and a stopped stream cannot be restarted
    stream.stop();
    assert_eq!(stream.start().unwrap_err(), DcamError::Stopped);
    assert_eq!(stream.take_next().unwrap_err(), DcamError::Stopped);

    // The device is free for a new stream
    let mut next = camera.start(Some(1)).expect("Failed to start new stream");
    assert_eq!(next.frames().count(), 1);
}

#[test]
fn test_stop_unblocks_waiting_consumer() {
    let (sim, session) = session(1);
    let camera = fast_camera(&session, 4);
    camera
        .set(PropertyId::TriggerSource, TRIGGER_SOFTWARE)
        .expect("Failed to select software trigger");

    let mut stream = camera.start(None).expect("Failed to start");
    let handle = stream.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.stop();
    });

    let started = Instant::now();
    let err = stream.take_next_timeout(Duration::from_secs(30)).unwrap_err();
    assert_eq!(err, DcamError::Stopped);
    assert!(started.elapsed() < Duration::from_secs(5), "stop did not wake consumer");
    stopper.join().unwrap();

    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(sim.registered_buffers(0), 0);
    assert!(!sim.is_capturing(0));
}

#[test]
fn test_concurrent_and_repeated_stop() {
    let (sim, session) = session(1);
    let camera = fast_camera(&session, 4);
    let mut stream = camera.start(None).expect("Failed to start");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let handle = stream.stop_handle();
            thread::spawn(move || {
                handle.stop();
                handle.is_stopped()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }

    stream.stop();
    stream.stop();
    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(sim.registered_buffers(0), 0);
    assert_eq!(camera.capture_state().unwrap(), CaptureState::Idle);
}

#[test]
fn test_dropping_stream_mid_iteration_releases_buffers() {
    let (sim, session) = session(1);
    let camera = fast_camera(&session, 4);

    {
        let mut stream = camera.start(None).expect("Failed to start");
        for frame in stream.frames().take(3) {
            frame.expect("Acquisition failed");
        }
    }

    assert_eq!(sim.registered_buffers(0), 0);
    assert!(!sim.is_capturing(0));
    assert_eq!(camera.capture_state().unwrap(), CaptureState::Idle);
}

#[test]
fn test_duplicate_completion_is_fatal() {
    let (sim, session) = session(1);
    let camera = fast_camera(&session, 4);
    sim.duplicate_next_completion(0).unwrap();

    let mut stream = camera.start(Some(8)).expect("Failed to start");
    let err = loop {
        match stream.take_next() {
            Ok(_) => {}
            Err(err) => break err,
        }
    };
    assert!(err.is_fatal(), "expected a fatal error, got {:?}", err);
    assert!(matches!(err, DcamError::DoubleMark { .. } | DcamError::SequenceDesync { .. }));

    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(sim.registered_buffers(0), 0);
    // The fault is sticky
    assert_eq!(stream.take_next().unwrap_err(), err);
}

#[test]
fn test_out_of_order_completions_are_delivered_in_order() {
    let (sim, session) = session(1);
    let camera = fast_camera(&session, 4);
    sim.swap_next_completions(0).unwrap();

    let mut stream = camera.start(Some(6)).expect("Failed to start");
    let sequences: Vec<u64> = stream
        .frames()
        .map(|frame| frame.expect("Acquisition failed").sequence)
        .collect();
    assert_eq!(sequences, (0..6).collect::<Vec<_>>());
}

#[test]
fn test_polling_scheduling() {
    let (sim, session) = session(1);
    let camera = fast_camera(&session, 3);
    let mut stream = camera
        .stream_with(Some(7), options(3).with_scheduling(Scheduling::Polling))
        .expect("Failed to arm stream");
    stream.start().expect("Failed to start");

    let sequences: Vec<u64> = stream
        .frames()
        .map(|frame| frame.expect("Acquisition failed").sequence)
        .collect();
    assert_eq!(sequences, (0..7).collect::<Vec<_>>());
    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(sim.registered_buffers(0), 0);
}

#[test]
fn test_drop_oldest_keeps_order_when_consumer_lags() {
    let (_sim, session) = session(1);
    let camera = fast_camera(&session, 2);
    let mut stream = camera
        .stream_with(None, options(2).with_overflow_policy(OverflowPolicy::DropOldest))
        .expect("Failed to arm stream");
    stream.start().expect("Failed to start");

    // Let the producer lap the ring a few times
    thread::sleep(Duration::from_millis(100));

    let mut last = None;
    for _ in 0..5 {
        let sequence = stream.take_next().expect("Acquisition failed").sequence();
        if let Some(previous) = last {
            assert!(sequence > previous);
        }
        last = Some(sequence);
    }
    assert!(stream.stats().dropped > 0);
    stream.stop();
}

#[test]
fn test_acquire_returns_owned_frames() {
    let (_sim, session) = session(1);
    let camera = fast_camera(&session, 4);

    let frames = camera.acquire(5, FAST_EXPOSURE).expect("Acquisition failed");
    assert_eq!(frames.len(), 5);
    for (expected, frame) in frames.iter().enumerate() {
        assert_eq!(frame.sequence, expected as u64);
        let pixels = frame.pixels_u16().expect("MONO16 frame");
        assert_eq!(pixels.len(), WIDTH * HEIGHT);
        // Test pattern: x + y + sequence
        assert_eq!(pixels[0], expected as u16);
        assert_eq!(pixels[WIDTH + 1], expected as u16 + 2);
    }
    assert_eq!(camera.capture_state().unwrap(), CaptureState::Idle);
}
