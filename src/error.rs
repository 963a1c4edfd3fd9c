//! Error types for the DCAM acquisition core.
//!
//! `DcamError` is the single error type returned by every layer of the crate,
//! from property validation up to frame streaming. Variants fall into three
//! groups that callers are expected to treat differently:
//!
//! - **Setup errors** (`DeviceUnavailable`, `UnknownProperty`, `InvalidValue`, ...)
//!   surface synchronously and are never retried by the core.
//! - **Recoverable acquisition errors**: only `AcquisitionTimeout`. The ring is left
//!   untouched and the caller may simply call `take_next()` again.
//! - **Fatal stream errors** (`DoubleMark`, `SequenceDesync`): the producer and
//!   consumer disagree about buffer ownership. The stream stops itself and
//!   releases its buffers before the error reaches the caller.
//!
//! `Exhausted` and `Stopped` are end-of-stream signals rather than failures; see
//! [`DcamError::is_end_of_stream`].

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DcamResult<T> = std::result::Result<T, DcamError>;

/// Every failure the acquisition core reports.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DcamError {
    /// The index does not exist, is owned by another handle, or the driver refused to open it.
    #[error("Device {index} is unavailable: {reason}")]
    DeviceUnavailable {
        /// Requested device index
        index: usize,
        /// Why it could not be opened
        reason: String,
    },

    /// The handle was never opened or has been closed.
    #[error("Device is not open")]
    DeviceNotOpen,

    /// The name, code or ID is not in the device's capability descriptor.
    #[error("Unknown property '{0}'")]
    UnknownProperty(String),

    /// Outside the declared range or step, not a declared option, or the wrong type.
    #[error("Invalid value for property '{property}': {reason}")]
    InvalidValue {
        /// Canonical property name
        property: String,
        /// Which constraint the value broke
        reason: String,
    },

    /// Write to a property the device only reports.
    #[error("Property '{0}' is read-only")]
    ReadOnlyProperty(String),

    /// Geometry-affecting write while a stream is armed or running.
    #[error("Property '{0}' cannot be changed while a capture is in progress")]
    NotMutableWhileCapturing(String),

    /// The host could not provide the ring's buffers.
    #[error("Out of memory allocating {requested} bytes for the buffer ring")]
    OutOfMemory {
        /// Total ring size in bytes
        requested: usize,
    },

    /// Zero-sized frames, or a ring larger than the configured limit.
    #[error("Unsupported frame geometry: {0}")]
    UnsupportedGeometry(String),

    /// Not recoverable by the stream, but does not fault the ring.
    #[error("Buffer index {index} is outside the ring (capacity {capacity})")]
    InvalidIndex {
        /// Index the driver reported
        index: usize,
        /// Buffers in the ring
        capacity: usize,
    },

    /// Fatal.
    #[error("Buffer {index} was marked ready twice before being consumed")]
    DoubleMark {
        /// Buffer marked twice
        index: usize,
    },

    /// Fatal. The completion does not match the sequence claimed for that buffer.
    #[error("Completion for sequence {got} arrived after sequence {expected} was expected")]
    SequenceDesync {
        /// Sequence claimed for the buffer, or next due for delivery
        expected: u64,
        /// Sequence the completion carried
        got: u64,
    },

    /// Release of a buffer the consumer does not hold.
    #[error("Buffer {index} is not lent to the consumer")]
    BufferNotLent {
        /// Buffer being released
        index: usize,
    },

    /// Finite stream: every requested frame has been delivered.
    #[error("Requested frame count has been delivered")]
    Exhausted,

    /// The stream, or the ring under it, was stopped.
    #[error("Acquisition stopped")]
    Stopped,

    /// Recoverable; the ring is unchanged.
    #[error("No frame ready within {0:?}")]
    AcquisitionTimeout(Duration),

    /// `start` on a running stream.
    #[error("Acquisition is already running")]
    AlreadyRunning,

    /// One stream per device at a time.
    #[error("Another acquisition stream is already active on this device")]
    StreamAlreadyActive,

    /// Anything the driver reports that has no variant of its own.
    #[error("Driver error during {operation}: {reason}")]
    Driver {
        /// Driver call that failed
        operation: &'static str,
        /// Driver-supplied detail
        reason: String,
    },

    /// The driver session was shut down.
    #[error("Driver session has been shut down")]
    SessionClosed,

    /// Configuration failed to load or validate.
    #[error("Configuration validation error: {0}")]
    Config(String),
}

impl DcamError {
    /// Whether the operation may be retried without reconfiguring anything.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DcamError::AcquisitionTimeout(_))
    }

    /// Whether the error means the driver and the ring disagree about buffer
    /// ownership. A stream that sees one of these stops for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DcamError::DoubleMark { .. } | DcamError::SequenceDesync { .. } | DcamError::Driver { .. }
        )
    }

    /// Normal termination of a frame sequence.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, DcamError::Exhausted | DcamError::Stopped)
    }

    pub(crate) fn driver(operation: &'static str, reason: impl Into<String>) -> Self {
        DcamError::Driver {
            operation,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_value(property: impl Into<String>, reason: impl Into<String>) -> Self {
        DcamError::InvalidValue {
            property: property.into(),
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for DcamError {
    fn from(err: figment::Error) -> Self {
        DcamError::Config(err.to_string())
    }
}
