//! Device and scan data models.
//!
//! A [`Device`] is a cheap, cloneable handle: its identity is fixed at
//! discovery time, while the option list, crop rectangle, cached preview and
//! current operation live behind a lock. The session mutates that state on
//! its worker thread; every other thread only ever sees whole snapshots.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::backend::{FrameParameters, RawDevice};
use crate::options::{DeviceOption, OptionGroup, OptionValue, StandardOption};

// =============================================================================
// Scan parameters
// =============================================================================

/// Layout of one frame (`SANE_Frame`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    Gray,
    Rgb,
    Red,
    Green,
    Blue,
    /// Forward-compatible fallback for layouts this crate can't decode.
    Other(i32),
}

impl FrameKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => FrameKind::Gray,
            1 => FrameKind::Rgb,
            2 => FrameKind::Red,
            3 => FrameKind::Green,
            4 => FrameKind::Blue,
            other => FrameKind::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            FrameKind::Gray => 0,
            FrameKind::Rgb => 1,
            FrameKind::Red => 2,
            FrameKind::Green => 3,
            FrameKind::Blue => 4,
            FrameKind::Other(code) => *code,
        }
    }

    /// One channel of a three-pass acquisition.
    pub fn is_single_channel_of_rgb(&self) -> bool {
        matches!(self, FrameKind::Red | FrameKind::Green | FrameKind::Blue)
    }

    /// Slot of this channel in an interleaved RGB buffer.
    pub fn channel_index(&self) -> Option<usize> {
        match self {
            FrameKind::Red => Some(0),
            FrameKind::Green => Some(1),
            FrameKind::Blue => Some(2),
            _ => None,
        }
    }

    pub fn channel_count(&self) -> Option<usize> {
        match self {
            FrameKind::Gray => Some(1),
            FrameKind::Rgb | FrameKind::Red | FrameKind::Green | FrameKind::Blue => Some(3),
            FrameKind::Other(_) => None,
        }
    }
}

/// Geometry of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    pub frame_kind: FrameKind,
    pub is_last_frame: bool,
    pub bytes_per_line: usize,
    pub width: usize,
    /// Revised from the bytes actually read for incomplete or
    /// unknown-height acquisitions.
    pub height: usize,
    /// Bits per sample.
    pub depth: u32,
    pub crop_area: Option<CropArea>,
}

impl ScanParameters {
    pub fn from_frame(frame: &FrameParameters, crop_area: Option<CropArea>) -> Self {
        Self {
            frame_kind: frame.format,
            is_last_frame: frame.last_frame,
            bytes_per_line: frame.bytes_per_line.max(0) as usize,
            width: frame.pixels_per_line.max(0) as usize,
            height: frame.lines.max(0) as usize,
            depth: frame.depth.max(0) as u32,
            crop_area,
        }
    }

    /// Bytes in one frame.
    pub fn file_size(&self) -> usize {
        self.bytes_per_line * self.height
    }

    /// Bytes of the assembled image: three frames for a three-pass scan.
    pub fn image_size(&self) -> usize {
        if self.frame_kind.is_single_channel_of_rgb() {
            self.file_size() * 3
        } else {
            self.file_size()
        }
    }

    pub fn channel_count(&self) -> usize {
        self.frame_kind.channel_count().unwrap_or(0)
    }
}

/// Rectangle in the units of the crop options (usually millimetres).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropArea {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CropArea {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from top-left and bottom-right corners.
    pub fn from_corners(tl_x: f64, tl_y: f64, br_x: f64, br_y: f64) -> Self {
        Self::new(tl_x, tl_y, br_x - tl_x, br_y - tl_y)
    }

    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Overlap of both rectangles, `None` when they don't intersect.
    pub fn intersection(&self, other: &CropArea) -> Option<CropArea> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let max_x = self.max_x().min(other.max_x());
        let max_y = self.max_y().min(other.max_y());
        let area = CropArea::from_corners(x, y, max_x, max_y);
        (!area.is_empty()).then_some(area)
    }
}

// =============================================================================
// Operation status
// =============================================================================

/// Progress of a scan or preview, reported in order.
#[derive(Debug, Clone)]
pub enum ScanOperation {
    /// Reported before the first backend call.
    WarmingUp,
    Scanning {
        /// 0.0..=1.0
        progress: f32,
        /// Partial image, when one was generated for this step.
        preview: Option<DynamicImage>,
    },
    Cancelling,
}

impl ScanOperation {
    pub fn progress(&self) -> Option<f32> {
        match self {
            ScanOperation::Scanning { progress, .. } => Some(*progress),
            _ => None,
        }
    }

    pub fn has_preview(&self) -> bool {
        matches!(
            self,
            ScanOperation::Scanning {
                preview: Some(_),
                ..
            }
        )
    }
}

impl fmt::Display for ScanOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanOperation::WarmingUp => f.write_str("Warming up"),
            ScanOperation::Scanning { progress, .. } => {
                write!(f, "Scanning {:.0}%", progress * 100.0)
            }
            ScanOperation::Cancelling => f.write_str("Cancelling"),
        }
    }
}

/// A finished page.
#[derive(Debug, Clone)]
pub struct ScannedImage {
    pub image: DynamicImage,
    pub parameters: ScanParameters,
}

// =============================================================================
// Device
// =============================================================================

/// Decides whether a scan will pull several pages from a document feeder.
///
/// The protocol does not say how to detect the last page of a feeder batch,
/// so the session asks this trait and lets callers swap in their own guess.
pub trait FeederHeuristic: Send + Sync {
    fn is_using_feeder(&self, device: &Device) -> bool;
}

/// Looks for "feeder" or "adf" in the current value of the `source` option.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceNameHeuristic;

impl FeederHeuristic for SourceNameHeuristic {
    fn is_using_feeder(&self, device: &Device) -> bool {
        match device.option(StandardOption::Source).and_then(|o| o.value()) {
            Some(OptionValue::String(source)) => {
                let source = source.to_lowercase();
                source.contains("feeder") || source.contains("adf")
            }
            _ => false,
        }
    }
}

#[derive(Default)]
struct DeviceState {
    options: Arc<Vec<DeviceOption>>,
    crop_area: Option<CropArea>,
    last_preview: Option<DynamicImage>,
    operation: Option<ScanOperation>,
}

struct DeviceInner {
    name: String,
    vendor: String,
    model: String,
    kind: String,
    state: RwLock<DeviceState>,
}

/// A scanner known to the session.
///
/// Clones share state. Equality and hashing use the device name only.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        vendor: impl Into<String>,
        model: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        let model = model.into();
        // Some backends append a bus id after a colon.
        let model = match model.split_once(':') {
            Some((head, _)) => head.trim_end().to_string(),
            None => model,
        };
        Self {
            inner: Arc::new(DeviceInner {
                name: name.into(),
                vendor: vendor.into(),
                model,
                kind: kind.into(),
                state: RwLock::new(DeviceState::default()),
            }),
        }
    }

    pub fn from_raw(raw: &RawDevice) -> Self {
        Self::new(&raw.name, &raw.vendor, &raw.model, &raw.kind)
    }

    fn state(&self) -> RwLockReadGuard<'_, DeviceState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, DeviceState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Backend address, the primary key of a device.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn vendor(&self) -> &str {
        &self.inner.vendor
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Network host of a `host:device` name, if it has one.
    ///
    /// Bracketed IPv6 literals are supported.
    pub fn host(&self) -> Option<&str> {
        let name = self.inner.name.strip_prefix("net:").unwrap_or(&self.inner.name);
        if let Some(rest) = name.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            return tail.starts_with(':').then_some(host);
        }
        let (host, _) = name.split_once(':')?;
        (!host.is_empty()).then_some(host)
    }

    // -------------------------------------------------------------------------
    // Options
    // -------------------------------------------------------------------------

    /// Snapshot of the option list.
    pub fn options(&self) -> Arc<Vec<DeviceOption>> {
        Arc::clone(&self.state().options)
    }

    pub fn option(&self, standard: StandardOption) -> Option<DeviceOption> {
        self.option_named(standard.identifier())
    }

    pub fn option_named(&self, identifier: &str) -> Option<DeviceOption> {
        self.state()
            .options
            .iter()
            .find(|o| o.identifier() == Some(identifier))
            .cloned()
    }

    pub fn option_at(&self, index: usize) -> Option<DeviceOption> {
        self.state()
            .options
            .iter()
            .find(|o| o.index() == index)
            .cloned()
    }

    /// Swap in a complete new list.
    pub(crate) fn replace_options(&self, options: Vec<DeviceOption>) {
        self.state_mut().options = Arc::new(options);
    }

    /// Replace one option, copying the list so existing snapshots stay intact.
    pub(crate) fn replace_option(&self, option: DeviceOption) {
        let mut state = self.state_mut();
        let mut options = state.options.as_ref().clone();
        if let Some(slot) = options.iter_mut().find(|o| o.index() == option.index()) {
            *slot = option;
            state.options = Arc::new(options);
        }
    }

    /// Options organised under their groups.
    ///
    /// Hides the preview toggle, the crop options when the crop area can be
    /// edited as a rectangle, and advanced options unless requested.
    pub fn option_groups(&self, include_advanced: bool) -> Vec<OptionGroup> {
        let options = self.options();
        let hide_crop = self.can_crop();
        let mut groups: Vec<OptionGroup> = Vec::new();
        let mut current = OptionGroup {
            group: None,
            options: Vec::new(),
        };

        for option in options.iter() {
            if let DeviceOption::Group(info) = option {
                let finished = std::mem::replace(
                    &mut current,
                    OptionGroup {
                        group: Some(info.clone()),
                        options: Vec::new(),
                    },
                );
                if !finished.options.is_empty() {
                    groups.push(finished);
                }
                continue;
            }
            if option.is(StandardOption::Preview) {
                continue;
            }
            if hide_crop
                && option
                    .identifier()
                    .and_then(StandardOption::from_identifier)
                    .is_some_and(|s| s.is_crop())
            {
                continue;
            }
            if !include_advanced && option.capabilities().is_advanced() {
                continue;
            }
            current.options.push(option.clone());
        }
        if !current.options.is_empty() {
            groups.push(current);
        }
        groups
    }

    // -------------------------------------------------------------------------
    // Crop
    // -------------------------------------------------------------------------

    fn crop_value(&self, standard: StandardOption) -> Option<f64> {
        let option = self.option(standard)?;
        let preferred = match standard.best_preview_value(&option) {
            Some(crate::options::NewValue::Value(value)) => value.as_f64(),
            _ => None,
        };
        preferred.or_else(|| option.value().and_then(|v| v.as_f64()))
    }

    /// Largest area the device can scan, from the limits of the crop options.
    pub fn max_crop_area(&self) -> Option<CropArea> {
        let tl_x = self.crop_value(StandardOption::TopLeftX)?;
        let tl_y = self.crop_value(StandardOption::TopLeftY)?;
        let br_x = self.crop_value(StandardOption::BottomRightX)?;
        let br_y = self.crop_value(StandardOption::BottomRightY)?;
        Some(CropArea::from_corners(tl_x, tl_y, br_x, br_y))
    }

    /// All four crop options exist and can be written.
    pub fn can_crop(&self) -> bool {
        StandardOption::CROP.iter().all(|standard| {
            self.option(*standard).is_some_and(|o| {
                let caps = o.capabilities();
                caps.is_settable() && caps.is_active()
            })
        })
    }

    /// Requested crop clamped to the scannable area; the whole area by default.
    pub fn crop_area(&self) -> Option<CropArea> {
        let max = self.max_crop_area()?;
        match self.state().crop_area {
            Some(area) => area.intersection(&max).or(Some(max)),
            None => Some(max),
        }
    }

    pub fn set_crop_area(&self, area: Option<CropArea>) {
        let clamped = match (area, self.max_crop_area()) {
            (Some(area), Some(max)) => area.intersection(&max),
            (area, None) => area,
            (None, _) => None,
        };
        self.state_mut().crop_area = clamped;
    }

    /// Width over height of the scannable area.
    pub fn preview_image_ratio(&self) -> Option<f64> {
        if let Some(area) = self.max_crop_area().filter(|a| !a.is_empty()) {
            return Some(area.width / area.height);
        }
        self.last_preview()
            .filter(|p| p.height() > 0)
            .map(|p| f64::from(p.width()) / f64::from(p.height()))
    }

    // -------------------------------------------------------------------------
    // Cached state
    // -------------------------------------------------------------------------

    pub fn last_preview(&self) -> Option<DynamicImage> {
        self.state().last_preview.clone()
    }

    pub(crate) fn set_last_preview(&self, image: Option<DynamicImage>) {
        self.state_mut().last_preview = image;
    }

    /// Operation currently running on this device, if any.
    pub fn operation(&self) -> Option<ScanOperation> {
        self.state().operation.clone()
    }

    pub(crate) fn set_operation(&self, operation: Option<ScanOperation>) {
        self.state_mut().operation = operation;
    }

    /// Forget the running operation and the cached preview.
    pub(crate) fn clear_cached_state(&self) {
        let mut state = self.state_mut();
        state.operation = None;
        state.last_preview = None;
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.name.hash(state);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .field("vendor", &self.inner.vendor)
            .field("model", &self.inner.model)
            .field("kind", &self.inner.kind)
            .field("options", &self.state().options.len())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.inner.vendor, self.inner.model)
    }
}
