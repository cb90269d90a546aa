//! Client for the SANE network protocol (`saned`).
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  control connection (RPC)   ┌─────────┐
//! │  NetBackend   │ ──────────────────────────▶ │  saned  │
//! │ (worker thr.) │ ◀────────────────────────── │ :6566   │
//! │               │  data connection per scan   │         │
//! │               │ ◀────────────────────────── │ :port   │
//! └───────────────┘                             └─────────┘
//! ```
//!
//! One control connection is kept per host. Device names handed to the
//! session are `host:remote-name`, so a single backend can serve devices from
//! several hosts.

pub mod backend;
pub mod wire;

use md5::{Digest, Md5};

pub use backend::NetBackend;

/// Separates the resource name from the salt of salted authorization.
const MD5_MARKER: &str = "$MD5$";

/// saned reads at most this many bytes of salt and of password.
const MAX_SALTED_INPUT: usize = 128;

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 3;

/// `SANE_VERSION_CODE(1, 0, 3)`
pub const VERSION_CODE: i32 = (1 << 24) | PROTOCOL_VERSION as i32;

/// Data records of this length carry a status byte instead of image data.
pub const END_OF_DATA: u32 = 0xFFFF_FFFF;

/// Byte order markers of the START reply.
pub const BYTE_ORDER_LITTLE_ENDIAN: i32 = 0x1234;
pub const BYTE_ORDER_BIG_ENDIAN: i32 = 0x4321;

/// RPC procedure numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Procedure {
    Init = 0,
    GetDevices = 1,
    Open = 2,
    Close = 3,
    GetOptionDescriptors = 4,
    ControlOption = 5,
    GetParameters = 6,
    Start = 7,
    Cancel = 8,
    Authorize = 9,
    Exit = 10,
}

impl Procedure {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Procedure::Init,
            1 => Procedure::GetDevices,
            2 => Procedure::Open,
            3 => Procedure::Close,
            4 => Procedure::GetOptionDescriptors,
            5 => Procedure::ControlOption,
            6 => Procedure::GetParameters,
            7 => Procedure::Start,
            8 => Procedure::Cancel,
            9 => Procedure::Authorize,
            10 => Procedure::Exit,
            _ => return None,
        })
    }
}

/// Join a host and a remote device name. Hosts containing colons (IPv6
/// literals, explicit ports) are bracketed.
pub fn device_name(host: &str, remote: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, remote)
    } else {
        format!("{}:{}", host, remote)
    }
}

/// Split a device name into its host prefix and remote name.
pub fn split_device_name(name: &str) -> (Option<&str>, &str) {
    if let Some(rest) = name.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (Some(host), tail.strip_prefix(':').unwrap_or(tail));
        }
    }
    match name.split_once(':') {
        Some((host, remote)) => (Some(host), remote),
        None => (None, name),
    }
}

/// Resource strings may carry an MD5 salt (`device$MD5$salt`).
pub fn resource_display_name(resource: &str) -> &str {
    resource
        .split_once(MD5_MARKER)
        .map(|(name, _)| name)
        .unwrap_or(resource)
}

/// Password field of an AUTHORIZE request.
///
/// For a salted resource this is `$MD5$` followed by the hex digest of the
/// salt and the password; otherwise the password itself.
pub fn authorization_password(resource: &str, password: &str) -> String {
    let Some((_, salt)) = resource.split_once(MD5_MARKER) else {
        return password.to_string();
    };
    let clip = |value: &str| -> Vec<u8> {
        value.bytes().take(MAX_SALTED_INPUT).collect()
    };
    let digest = Md5::new()
        .chain_update(clip(salt))
        .chain_update(clip(password))
        .finalize();
    format!("{}{:x}", MD5_MARKER, digest)
}

/// Swap 16-bit samples in place. A trailing odd byte is left alone.
pub fn swap_16bit_samples(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

pub fn host_is_little_endian() -> bool {
    cfg!(target_endian = "little")
}
