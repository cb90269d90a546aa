//! Error types for the SANE client engine.
//!
//! Every backend call that returns a non-success status is translated into a
//! [`SaneError`] at the call site and handed back through the operation's
//! completion. Nothing in this crate retries on its own.

use std::fmt;

use thiserror::Error;

/// Native status codes reported by a SANE backend.
///
/// The numeric values match the ones used by the C API and the network
/// protocol, so they can be decoded straight off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Good,
    Unsupported,
    Cancelled,
    DeviceBusy,
    Invalid,
    Eof,
    Jammed,
    NoDocs,
    CoverOpen,
    IoError,
    NoMem,
    AccessDenied,
    /// Forward-compatible fallback for codes newer than this crate.
    Unknown(i32),
}

impl Status {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Status::Good,
            1 => Status::Unsupported,
            2 => Status::Cancelled,
            3 => Status::DeviceBusy,
            4 => Status::Invalid,
            5 => Status::Eof,
            6 => Status::Jammed,
            7 => Status::NoDocs,
            8 => Status::CoverOpen,
            9 => Status::IoError,
            10 => Status::NoMem,
            11 => Status::AccessDenied,
            other => Status::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Status::Good => 0,
            Status::Unsupported => 1,
            Status::Cancelled => 2,
            Status::DeviceBusy => 3,
            Status::Invalid => 4,
            Status::Eof => 5,
            Status::Jammed => 6,
            Status::NoDocs => 7,
            Status::CoverOpen => 8,
            Status::IoError => 9,
            Status::NoMem => 10,
            Status::AccessDenied => 11,
            Status::Unknown(code) => *code,
        }
    }

    /// Human readable description, same wording as `sane_strstatus`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Good => "Success",
            Status::Unsupported => "Operation not supported",
            Status::Cancelled => "Operation was cancelled",
            Status::DeviceBusy => "Device busy",
            Status::Invalid => "Invalid argument",
            Status::Eof => "End of file reached",
            Status::Jammed => "Document feeder jammed",
            Status::NoDocs => "Document feeder out of documents",
            Status::CoverOpen => "Scanner cover is open",
            Status::IoError => "Error during device I/O",
            Status::NoMem => "Out of memory",
            Status::AccessDenied => "Access to resource has been denied",
            Status::Unknown(_) => "Unknown SANE status code",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Unknown(code) => write!(f, "{} ({})", self.as_str(), code),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Errors surfaced by the session, option I/O, and scan pipeline.
#[derive(Debug, Error)]
pub enum SaneError {
    /// A backend call returned a status that is not otherwise special-cased.
    #[error("Backend error: {0}")]
    Backend(Status),

    /// The scan was stopped by the user. Callers usually don't present this.
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Device is not opened")]
    DeviceNotOpened,

    /// Reading a button or group, or writing a group.
    #[error("Cannot {action} a {kind} option")]
    InvalidOperationForOptionKind {
        action: &'static str,
        kind: &'static str,
    },

    #[error("Option does not support automatic values")]
    AutoValueUnsupported,

    #[error("Option is inactive")]
    InactiveOption,

    #[error("Option is read-only")]
    ReadOnlyOption,

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The option count of an opened device could not be read.
    #[error("Could not enumerate options: {0}")]
    CannotEnumerateOptions(#[source] Box<SaneError>),

    #[error("No image data")]
    NoImageData,

    #[error("Cannot generate image")]
    CannotGenerateImage,

    #[error("Unsupported channel layout")]
    UnsupportedChannelLayout,

    /// Malformed data on the network protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker thread is gone (session dropped or panicked mid-request).
    #[error("SANE worker is not running")]
    WorkerUnavailable,
}

impl SaneError {
    /// Translate a non-success backend status.
    ///
    /// `Cancelled` maps to the dedicated variant so UI layers can match it.
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::Cancelled => SaneError::Cancelled,
            other => SaneError::Backend(other),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SaneError::Cancelled)
    }

    /// The native status behind this error, if it came from the backend.
    pub fn status(&self) -> Option<Status> {
        match self {
            SaneError::Backend(status) => Some(*status),
            SaneError::Cancelled => Some(Status::Cancelled),
            SaneError::CannotEnumerateOptions(inner) => inner.status(),
            _ => None,
        }
    }
}

impl From<Status> for SaneError {
    fn from(status: Status) -> Self {
        SaneError::from_status(status)
    }
}

pub type Result<T, E = SaneError> = std::result::Result<T, E>;
