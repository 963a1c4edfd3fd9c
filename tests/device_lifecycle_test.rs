//! Integration tests for device ownership and driver session teardown.

mod common;

use common::{fast_camera, session};
use hamamatsu_dcam::{Camera, CaptureStatus, DcamError, DeviceHandle, StreamState};
use std::sync::Arc;

#[test]
fn test_device_is_owned_exclusively() {
    let (_sim, session) = session(2);

    let first = DeviceHandle::open(&session, 0).expect("Failed to open device 0");
    assert!(matches!(
        DeviceHandle::open(&session, 0),
        Err(DcamError::DeviceUnavailable { index: 0, .. })
    ));

    // Other indices are independent
    let second = DeviceHandle::open(&session, 1).expect("Failed to open device 1");
    assert_eq!(session.owned_indices(), vec![0, 1]);

    first.close();
    assert!(!first.is_open());
    let reopened = DeviceHandle::open(&session, 0).expect("Index free after close");
    assert!(reopened.is_open());
    drop(second);
    assert_eq!(session.owned_indices(), vec![0]);
}

#[test]
fn test_missing_and_failing_devices() {
    let (sim, session) = session(1);

    assert!(matches!(
        DeviceHandle::open(&session, 3),
        Err(DcamError::DeviceUnavailable { index: 3, .. })
    ));

    sim.fail_next_open(0).unwrap();
    assert!(matches!(
        DeviceHandle::open(&session, 0),
        Err(DcamError::DeviceUnavailable { index: 0, .. })
    ));
    // A failed open does not leave the index claimed
    assert!(session.owned_indices().is_empty());
    DeviceHandle::open(&session, 0).expect("Open succeeds on retry");
}

#[test]
fn test_identity_snapshot() {
    let (_sim, session) = session(2);
    let identities = session.identities().unwrap();
    assert_eq!(identities.len(), 2);
    assert_ne!(identities[0].camera_id, identities[1].camera_id);

    let device = DeviceHandle::open(&session, 1).unwrap();
    assert_eq!(device.info(), &identities[1]);
    assert_eq!(device.info().vendor, "Hamamatsu");
    assert!(!device.info().serial_number().starts_with("S/N"));
}

#[test]
fn test_close_is_idempotent_and_stops_stream() {
    let (sim, session) = session(1);
    let mut camera = fast_camera(&session, 4);
    let mut stream = camera.start(None).expect("Failed to start");
    stream.take_next().expect("Frame before close");
    assert_eq!(camera.status().unwrap(), CaptureStatus::Busy);

    camera.close();
    camera.close();
    assert!(!camera.is_open());
    assert!(!sim.is_open(0));
    assert!(!sim.is_capturing(0));
    assert_eq!(sim.registered_buffers(0), 0);

    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(stream.take_next().unwrap_err(), DcamError::Stopped);
    assert_eq!(stream.start().unwrap_err(), DcamError::DeviceNotOpen);
}

#[test]
fn test_status_follows_stream() {
    let (_sim, session) = session(1);
    let camera = fast_camera(&session, 2);
    assert_eq!(camera.status().unwrap(), CaptureStatus::Stable);

    let mut stream = camera.stream(Some(2)).expect("Failed to arm stream");
    assert_eq!(camera.status().unwrap(), CaptureStatus::Ready);
    stream.start().expect("Failed to start");
    assert_eq!(stream.frames().count(), 2);
    assert_eq!(camera.status().unwrap(), CaptureStatus::Stable);
}

#[test]
fn test_session_shutdown_closes_everything() {
    let (sim, session) = session(2);
    let camera = Camera::open_index(Arc::clone(&session), 0).expect("Failed to open");
    let other = DeviceHandle::open(&session, 1).expect("Failed to open");
    let mut stream = camera.start(None).expect("Failed to start");

    session.shutdown();
    assert!(!session.is_active());
    assert!(!camera.is_open());
    assert!(!other.is_open());
    assert!(!sim.is_open(0));
    assert!(!sim.is_open(1));
    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(stream.take_next().unwrap_err(), DcamError::Stopped);

    assert_eq!(session.identities().unwrap_err(), DcamError::SessionClosed);
    assert!(matches!(DeviceHandle::open(&session, 0), Err(DcamError::SessionClosed)));
    session.shutdown();
}
