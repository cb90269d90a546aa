//! Client engine for SANE scanners.
//!
//! This library provides the pieces a scanning frontend needs:
//!
//! - `sane` - the session handle; every backend call runs on its worker thread
//! - `backend` - the backend trait, plus an in-process virtual scanner
//! - `net` - a backend speaking the `saned` network protocol
//! - `options` - typed device options and their wire encoding
//! - `models` - devices, scan parameters, crop areas and progress
//! - `assembly` - turning raw frame bytes into images
//!
//! # Example
//!
//! ```ignore
//! use sane_client::{NetBackend, Sane, SaneConfig};
//!
//! let config = SaneConfig::load_default()?;
//! let (sane, mut events) = Sane::spawn(NetBackend::with_config(&config), config);
//! let devices = sane.update_devices().await?;
//! sane.open_device(&devices[0], true).await?;
//! let (progress, _) = tokio::sync::mpsc::unbounded_channel();
//! let pages = sane.scan(&devices[0], false, progress).await?;
//! ```

pub mod assembly;
pub mod backend;
pub mod config;
pub mod error;
pub mod models;
pub mod net;
pub mod options;
pub mod sane;

mod scan;
mod worker;

pub use backend::{Backend, DeviceAuthentication, Info, VirtualBackend};
pub use config::{SaneConfig, SaneHost};
pub use error::{Result, SaneError, Status};
pub use models::{
    CropArea, Device, FeederHeuristic, FrameKind, ScanOperation, ScanParameters, ScannedImage,
    SourceNameHeuristic,
};
pub use net::NetBackend;
pub use options::{DeviceOption, NewValue, OptionValue, StandardOption};
pub use sane::{AuthRequest, CredentialStore, Sane, SaneBuilder, SaneEvent, ScanCanceller};
