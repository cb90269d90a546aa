//! The scanner backend seam.
//!
//! [`Backend`] mirrors the SANE C API one call at a time. Implementations are
//! assumed to be non-reentrant: the session owns exactly one backend and only
//! ever calls it from its worker thread, so the trait only requires `Send`.
//!
//! Two implementations ship with the crate:
//!
//! - [`net::NetBackend`](crate::net::NetBackend) talks to `saned` over TCP
//! - [`virtual_scanner::VirtualBackend`] is an in-process simulated scanner

pub mod virtual_scanner;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::SaneConfig;
use crate::error::Result;
use crate::models::FrameKind;

pub use virtual_scanner::VirtualBackend;

/// Calls slower than this are logged at warn level.
const SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(1);

/// Opaque token for an opened device.
pub type HandleId = u32;

/// Username and password handed to a backend that requested authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuthentication {
    pub username: String,
    pub password: String,
}

/// Invoked by the backend when a resource needs credentials.
///
/// Blocks the calling thread until an answer is available; `None` declines.
pub type AuthCallback = Box<dyn Fn(&str) -> Option<DeviceAuthentication> + Send>;

/// Backend version as reported by `sane_init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl BackendVersion {
    /// Decode a `SANE_VERSION_CODE` word.
    pub fn from_code(code: u32) -> Self {
        Self {
            major: ((code >> 24) & 0xff) as u8,
            minor: ((code >> 16) & 0xff) as u8,
            build: (code & 0xffff) as u16,
        }
    }

    pub fn code(&self) -> u32 {
        (u32::from(self.major) << 24) | (u32::from(self.minor) << 16) | u32::from(self.build)
    }
}

impl std::fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// A device as listed by `sane_get_devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDevice {
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub kind: String,
}

/// Constraint part of an option descriptor, still in raw words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawConstraint {
    None,
    Range { min: i32, max: i32, quant: i32 },
    WordList(Vec<i32>),
    StringList(Vec<String>),
}

/// `SANE_Option_Descriptor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDescriptor {
    pub name: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub value_type: i32,
    pub unit: i32,
    pub size: i32,
    pub capabilities: u32,
    pub constraint: RawConstraint,
}

/// Result bits of a `sane_control_option` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Info(pub u32);

impl Info {
    pub const INEXACT: u32 = 1 << 0;
    pub const RELOAD_OPTIONS: u32 = 1 << 1;
    pub const RELOAD_PARAMS: u32 = 1 << 2;

    /// The backend rounded or clamped the written value.
    pub fn is_inexact(&self) -> bool {
        self.0 & Self::INEXACT != 0
    }

    /// Other options changed; the option table must be listed again before
    /// any further write.
    pub fn reload_options(&self) -> bool {
        self.0 & Self::RELOAD_OPTIONS != 0
    }

    pub fn reload_params(&self) -> bool {
        self.0 & Self::RELOAD_PARAMS != 0
    }
}

/// `SANE_Action` with its value buffer.
#[derive(Debug)]
pub enum ControlAction<'a> {
    /// Fill the buffer with the current value.
    GetValue(&'a mut [u8]),
    /// Write the buffer; the backend may store the coerced value back.
    SetValue(&'a mut [u8]),
    SetAuto,
}

impl ControlAction<'_> {
    pub fn code(&self) -> i32 {
        match self {
            ControlAction::GetValue(_) => 0,
            ControlAction::SetValue(_) => 1,
            ControlAction::SetAuto => 2,
        }
    }
}

/// `SANE_Parameters` for the frame about to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameParameters {
    pub format: FrameKind,
    pub last_frame: bool,
    pub bytes_per_line: i32,
    pub pixels_per_line: i32,
    /// Negative when the height is not known before the scan completes.
    pub lines: i32,
    pub depth: i32,
}

/// One scanner backend, called from a single thread.
///
/// Every method mirrors the SANE C call of the same name. Non-success
/// statuses are returned as [`SaneError`](crate::error::SaneError); end of
/// data in [`Backend::read`] is reported as `Status::Eof`.
pub trait Backend: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Apply process-wide settings. They take effect at the next `init`.
    fn configure(&mut self, _config: &SaneConfig) {}

    fn init(&mut self, auth: AuthCallback) -> Result<BackendVersion>;

    fn exit(&mut self);

    fn devices(&mut self, local_only: bool) -> Result<Vec<RawDevice>>;

    fn open(&mut self, name: &str) -> Result<HandleId>;

    fn close(&mut self, handle: HandleId);

    /// Descriptor of option `index`. Index 0 is the option-count option.
    fn option_descriptor(&mut self, handle: HandleId, index: usize) -> Result<OptionDescriptor>;

    fn control_option(
        &mut self,
        handle: HandleId,
        index: usize,
        action: ControlAction<'_>,
    ) -> Result<Info>;

    fn parameters(&mut self, handle: HandleId) -> Result<FrameParameters>;

    fn start(&mut self, handle: HandleId) -> Result<()>;

    fn set_io_mode(&mut self, handle: HandleId, non_blocking: bool) -> Result<()>;

    /// Read up to `buf.len()` bytes of image data.
    fn read(&mut self, handle: HandleId, buf: &mut [u8]) -> Result<usize>;

    fn cancel(&mut self, handle: HandleId);
}

/// Backends chosen at runtime.
impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn configure(&mut self, config: &SaneConfig) {
        (**self).configure(config)
    }

    fn init(&mut self, auth: AuthCallback) -> Result<BackendVersion> {
        (**self).init(auth)
    }

    fn exit(&mut self) {
        (**self).exit()
    }

    fn devices(&mut self, local_only: bool) -> Result<Vec<RawDevice>> {
        (**self).devices(local_only)
    }

    fn open(&mut self, name: &str) -> Result<HandleId> {
        (**self).open(name)
    }

    fn close(&mut self, handle: HandleId) {
        (**self).close(handle)
    }

    fn option_descriptor(&mut self, handle: HandleId, index: usize) -> Result<OptionDescriptor> {
        (**self).option_descriptor(handle, index)
    }

    fn control_option(
        &mut self,
        handle: HandleId,
        index: usize,
        action: ControlAction<'_>,
    ) -> Result<Info> {
        (**self).control_option(handle, index, action)
    }

    fn parameters(&mut self, handle: HandleId) -> Result<FrameParameters> {
        (**self).parameters(handle)
    }

    fn start(&mut self, handle: HandleId) -> Result<()> {
        (**self).start(handle)
    }

    fn set_io_mode(&mut self, handle: HandleId, non_blocking: bool) -> Result<()> {
        (**self).set_io_mode(handle, non_blocking)
    }

    fn read(&mut self, handle: HandleId, buf: &mut [u8]) -> Result<usize> {
        (**self).read(handle, buf)
    }

    fn cancel(&mut self, handle: HandleId) {
        (**self).cancel(handle)
    }
}

/// Run a backend call, logging it and warning when it is slow.
pub(crate) fn timed<T>(label: &str, call: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let result = call();
    let elapsed = started.elapsed();
    if elapsed > SLOW_CALL_THRESHOLD {
        tracing::warn!("{} took {:.2}s", label, elapsed.as_secs_f64());
    } else {
        tracing::trace!("{} took {}ms", label, elapsed.as_millis());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_code_decoding() {
        let version = BackendVersion::from_code((1 << 24) | 32);
        assert_eq!(version.major, 1);
        assert_eq!(version.minor, 0);
        assert_eq!(version.build, 32);
        assert_eq!(version.to_string(), "1.0.32");
        assert_eq!(BackendVersion::from_code(version.code()), version);
    }

    #[test]
    fn test_info_bits() {
        let info = Info(Info::RELOAD_OPTIONS | Info::INEXACT);
        assert!(info.reload_options());
        assert!(info.is_inexact());
        assert!(!info.reload_params());
        assert!(!Info::default().reload_options());
    }

    #[test]
    fn test_timed_returns_call_result() {
        assert_eq!(timed("noop", || 7), 7);
    }
}
