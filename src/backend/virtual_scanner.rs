//! In-process simulated scanner.
//!
//! Behaves like a small flatbed with an optional document feeder, in the
//! spirit of the SANE `test` backend. Everything is deterministic so tests
//! can assert on exact pixels and on the sequence of backend calls, which is
//! recorded in a shared [`CallLog`].
//!
//! Option table:
//!
//! ```text
//!  0  option count
//!  1  group "Scan Mode"
//!  2  mode          string  Gray | Color | Lineart   (automatic, reloads options)
//!  3  depth         int     8 | 16                   (inactive in Lineart)
//!  4  resolution    int     1..=50 dpi
//!  5  source        string  Flatbed | Automatic Document Feeder
//!  6  preview       bool                             (optional)
//!  .  group "Geometry"
//!  .  tl-x tl-y br-x br-y  fixed mm
//!  .  group "Extras"
//!  .  calibrate     button
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::{
    AuthCallback, Backend, BackendVersion, ControlAction, DeviceAuthentication,
    FrameParameters, HandleId, Info, OptionDescriptor, RawConstraint, RawDevice,
};
use crate::error::{Result, SaneError, Status};
use crate::models::FrameKind;
use crate::options::{f64_to_fixed, Capabilities, Unit, ValueType, WireValue};

const MM_PER_INCH: f64 = 25.4;
const STRING_SIZE: usize = 32;
const DEFAULT_READ_CHUNK: usize = 32 * 1024;

pub const MODE_GRAY: &str = "Gray";
pub const MODE_COLOR: &str = "Color";
pub const MODE_LINEART: &str = "Lineart";
pub const SOURCE_FLATBED: &str = "Flatbed";
pub const SOURCE_ADF: &str = "Automatic Document Feeder";

/// Shared, append-only record of backend calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of entries starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn clear(&self) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

struct VirtualOption {
    descriptor: OptionDescriptor,
    value: Vec<u8>,
}

impl VirtualOption {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &str,
        title: &str,
        value_type: ValueType,
        unit: Unit,
        size: usize,
        capabilities: u32,
        constraint: RawConstraint,
        value: Vec<u8>,
    ) -> Self {
        Self {
            descriptor: OptionDescriptor {
                name: Some(name.to_string()),
                title: Some(title.to_string()),
                description: Some(format!("{} of the virtual scanner", title)),
                value_type: value_type.code(),
                unit: unit.code(),
                size: size as i32,
                capabilities,
                constraint,
            },
            value,
        }
    }

    fn group(title: &str) -> Self {
        Self {
            descriptor: OptionDescriptor {
                name: None,
                title: Some(title.to_string()),
                description: None,
                value_type: ValueType::Group.code(),
                unit: Unit::None.code(),
                size: 0,
                capabilities: 0,
                constraint: RawConstraint::None,
            },
            value: Vec::new(),
        }
    }

    fn name(&self) -> Option<&str> {
        self.descriptor.name.as_deref()
    }

    fn is_active(&self) -> bool {
        self.descriptor.capabilities & Capabilities::INACTIVE == 0
    }

    fn set_active(&mut self, active: bool) {
        if active {
            self.descriptor.capabilities &= !Capabilities::INACTIVE;
        } else {
            self.descriptor.capabilities |= Capabilities::INACTIVE;
        }
    }
}

fn word(value: i32) -> Vec<u8> {
    value.to_ne_bytes().to_vec()
}

fn string_value(value: &str) -> Vec<u8> {
    let mut buf = vec![0u8; STRING_SIZE];
    let len = value.len().min(STRING_SIZE - 1);
    buf[..len].copy_from_slice(&value.as_bytes()[..len]);
    buf
}

struct ScanState {
    frames: Vec<FrameKind>,
    frame_index: usize,
    parameters: FrameParameters,
    data: Vec<u8>,
    position: usize,
}

impl ScanState {
    fn finished_frame(&self) -> bool {
        self.position >= self.data.len()
    }

    fn has_more_frames(&self) -> bool {
        self.frame_index + 1 < self.frames.len()
    }
}

struct HandleState {
    options: Vec<VirtualOption>,
    scan: Option<ScanState>,
    pages_scanned: usize,
}

type StartHook = Box<dyn FnMut() + Send>;

/// A simulated scanner backend.
pub struct VirtualBackend {
    devices: Vec<RawDevice>,
    three_pass: bool,
    hand_scanner: bool,
    preview_option: bool,
    feeder_pages: usize,
    read_chunk: usize,
    max_width_mm: f64,
    max_height_mm: f64,
    credentials: Option<DeviceAuthentication>,
    failures: HashMap<String, Status>,
    start_hook: Option<StartHook>,
    log: CallLog,
    auth: Option<AuthCallback>,
    handles: HashMap<HandleId, HandleState>,
    next_handle: HandleId,
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self {
            devices: vec![RawDevice {
                name: "test:0".to_string(),
                vendor: "Noname".to_string(),
                model: "frontend-tester".to_string(),
                kind: "virtual device".to_string(),
            }],
            three_pass: false,
            hand_scanner: false,
            preview_option: true,
            feeder_pages: 3,
            read_chunk: DEFAULT_READ_CHUNK,
            max_width_mm: 215.0,
            max_height_mm: 297.0,
            credentials: None,
            failures: HashMap::new(),
            start_hook: None,
            log: CallLog::default(),
            auth: None,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn with_devices(mut self, devices: Vec<RawDevice>) -> Self {
        self.devices = devices;
        self
    }

    /// Acquire colour as separate red, green and blue frames.
    pub fn three_pass(mut self, enabled: bool) -> Self {
        self.three_pass = enabled;
        self
    }

    /// Report an unknown height until the data runs out.
    pub fn hand_scanner(mut self, enabled: bool) -> Self {
        self.hand_scanner = enabled;
        self
    }

    /// Leave out the `preview` option.
    pub fn without_preview_option(mut self) -> Self {
        self.preview_option = false;
        self
    }

    /// Pages loaded in the document feeder.
    pub fn feeder_pages(mut self, pages: usize) -> Self {
        self.feeder_pages = pages;
        self
    }

    /// Upper bound of bytes returned by one `read`.
    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(1);
        self
    }

    pub fn scan_area(mut self, width_mm: f64, height_mm: f64) -> Self {
        self.max_width_mm = width_mm;
        self.max_height_mm = height_mm;
        self
    }

    /// Require these credentials to open any device.
    pub fn require_auth(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(DeviceAuthentication {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Fail the next call named `call` with `status`.
    ///
    /// Call names: `init`, `devices`, `open`, `start`, `read`, `parameters`,
    /// `get:<option>` and `set:<option>`.
    pub fn fail_once(mut self, call: &str, status: Status) -> Self {
        self.failures.insert(call.to_string(), status);
        self
    }

    /// Run `hook` inside every `start` call.
    pub fn on_start(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.start_hook = Some(Box::new(hook));
        self
    }

    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    fn check_failure(&mut self, call: &str) -> Result<()> {
        match self.failures.remove(call) {
            Some(status) => {
                self.log.push(format!("fail {}", call));
                Err(SaneError::from_status(status))
            }
            None => Ok(()),
        }
    }

    fn build_options(&self) -> Vec<VirtualOption> {
        let rw = Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT;
        let mut options = vec![
            VirtualOption::new(
                "",
                "Number of options",
                ValueType::Int,
                Unit::None,
                4,
                Capabilities::SOFT_DETECT,
                RawConstraint::None,
                word(0),
            ),
            VirtualOption::group("Scan Mode"),
            VirtualOption::new(
                "mode",
                "Scan mode",
                ValueType::String,
                Unit::None,
                STRING_SIZE,
                rw | Capabilities::AUTOMATIC,
                RawConstraint::StringList(vec![
                    MODE_GRAY.to_string(),
                    MODE_COLOR.to_string(),
                    MODE_LINEART.to_string(),
                ]),
                string_value(MODE_COLOR),
            ),
            VirtualOption::new(
                "depth",
                "Bit depth",
                ValueType::Int,
                Unit::Bit,
                4,
                rw,
                RawConstraint::WordList(vec![8, 16]),
                word(8),
            ),
            VirtualOption::new(
                "resolution",
                "Scan resolution",
                ValueType::Int,
                Unit::Dpi,
                4,
                rw,
                RawConstraint::Range {
                    min: 1,
                    max: 50,
                    quant: 0,
                },
                word(10),
            ),
            VirtualOption::new(
                "source",
                "Scan source",
                ValueType::String,
                Unit::None,
                STRING_SIZE,
                rw,
                RawConstraint::StringList(vec![
                    SOURCE_FLATBED.to_string(),
                    SOURCE_ADF.to_string(),
                ]),
                string_value(SOURCE_FLATBED),
            ),
        ];
        if self.preview_option {
            options.push(VirtualOption::new(
                "preview",
                "Preview",
                ValueType::Bool,
                Unit::None,
                4,
                rw,
                RawConstraint::None,
                word(0),
            ));
        }
        options.push(VirtualOption::group("Geometry"));
        for (name, title, max, initial) in [
            ("tl-x", "Top-left x", self.max_width_mm, 0.0),
            ("tl-y", "Top-left y", self.max_height_mm, 0.0),
            ("br-x", "Bottom-right x", self.max_width_mm, self.max_width_mm),
            ("br-y", "Bottom-right y", self.max_height_mm, self.max_height_mm),
        ] {
            options.push(VirtualOption::new(
                name,
                title,
                ValueType::Fixed,
                Unit::Millimeter,
                4,
                rw,
                RawConstraint::Range {
                    min: 0,
                    max: f64_to_fixed(max),
                    quant: 0,
                },
                word(f64_to_fixed(initial)),
            ));
        }
        options.push(VirtualOption::group("Extras"));
        options.push(VirtualOption::new(
            "calibrate",
            "Calibrate",
            ValueType::Button,
            Unit::None,
            0,
            Capabilities::SOFT_SELECT,
            RawConstraint::None,
            Vec::new(),
        ));

        let count = options.len() as i32;
        options[0].value = word(count);
        options
    }

    fn handle_mut(&mut self, handle: HandleId) -> Result<&mut HandleState> {
        self.handles
            .get_mut(&handle)
            .ok_or(SaneError::Backend(Status::Invalid))
    }
}

// =============================================================================
// Option helpers
// =============================================================================

fn find<'a>(options: &'a [VirtualOption], name: &str) -> Option<&'a VirtualOption> {
    options.iter().find(|o| o.name() == Some(name))
}

fn string_of(options: &[VirtualOption], name: &str) -> String {
    find(options, name)
        .and_then(|o| String::decode(&o.value).ok())
        .unwrap_or_default()
}

fn int_of(options: &[VirtualOption], name: &str) -> i32 {
    find(options, name)
        .and_then(|o| i32::decode(&o.value).ok())
        .unwrap_or_default()
}

fn fixed_of(options: &[VirtualOption], name: &str) -> f64 {
    find(options, name)
        .and_then(|o| f64::decode(&o.value).ok())
        .unwrap_or_default()
}

/// Clamp a word to the option's constraint. Returns the stored word and
/// whether it had to change.
fn constrain_word(constraint: &RawConstraint, word: i32) -> Result<(i32, bool)> {
    match constraint {
        RawConstraint::Range { min, max, .. } => {
            let clamped = word.clamp(*min, *max);
            Ok((clamped, clamped != word))
        }
        RawConstraint::WordList(list) if !list.contains(&word) => {
            Err(SaneError::Backend(Status::Invalid))
        }
        _ => Ok((word, false)),
    }
}

fn apply_mode_side_effects(options: &mut [VirtualOption]) {
    let lineart = string_of(options, "mode") == MODE_LINEART;
    if let Some(depth) = options.iter_mut().find(|o| o.name() == Some("depth")) {
        depth.set_active(!lineart);
    }
}

// =============================================================================
// Frame rendering
// =============================================================================

fn sample(x: usize, y: usize, channel: usize) -> u8 {
    match channel {
        0 => (x % 256) as u8,
        1 => (y % 256) as u8,
        _ => ((x + y) % 256) as u8,
    }
}

fn gray_sample(x: usize, y: usize) -> u8 {
    ((x + y) % 256) as u8
}

/// Lineart uses 1 for black, like real devices.
fn lineart_is_black(x: usize, y: usize) -> bool {
    (x / 8 + y / 8) % 2 == 0
}

fn push_sample(data: &mut Vec<u8>, value: u8, depth: i32) {
    if depth == 16 {
        data.extend_from_slice(&(u16::from(value) * 257).to_ne_bytes());
    } else {
        data.push(value);
    }
}

fn render_frame(kind: FrameKind, depth: i32, width: usize, height: usize) -> (Vec<u8>, usize) {
    if depth == 1 {
        let bytes_per_line = width.div_ceil(8);
        let mut data = vec![0u8; bytes_per_line * height];
        for y in 0..height {
            for x in 0..width {
                if lineart_is_black(x, y) {
                    data[y * bytes_per_line + x / 8] |= 0x80 >> (x % 8);
                }
            }
        }
        return (data, bytes_per_line);
    }

    let sample_bytes = if depth == 16 { 2 } else { 1 };
    let samples_per_pixel = if kind == FrameKind::Rgb { 3 } else { 1 };
    let bytes_per_line = width * samples_per_pixel * sample_bytes;
    let mut data = Vec::with_capacity(bytes_per_line * height);
    for y in 0..height {
        for x in 0..width {
            match kind {
                FrameKind::Rgb => {
                    for channel in 0..3 {
                        push_sample(&mut data, sample(x, y, channel), depth);
                    }
                }
                FrameKind::Red | FrameKind::Green | FrameKind::Blue => {
                    let channel = kind.channel_index().unwrap_or(0);
                    push_sample(&mut data, sample(x, y, channel), depth);
                }
                _ => push_sample(&mut data, gray_sample(x, y), depth),
            }
        }
    }
    (data, bytes_per_line)
}

impl VirtualBackend {
    fn frame_plan(&self, options: &[VirtualOption]) -> (Vec<FrameKind>, i32) {
        match string_of(options, "mode").as_str() {
            MODE_LINEART => (vec![FrameKind::Gray], 1),
            MODE_GRAY => (vec![FrameKind::Gray], int_of(options, "depth")),
            _ if self.three_pass => (
                vec![FrameKind::Red, FrameKind::Green, FrameKind::Blue],
                int_of(options, "depth"),
            ),
            _ => (vec![FrameKind::Rgb], int_of(options, "depth")),
        }
    }

    fn geometry(&self, options: &[VirtualOption]) -> (usize, usize) {
        let resolution = f64::from(int_of(options, "resolution"));
        let width_mm = (fixed_of(options, "br-x") - fixed_of(options, "tl-x")).max(0.0);
        let height_mm = (fixed_of(options, "br-y") - fixed_of(options, "tl-y")).max(0.0);
        (
            (width_mm * resolution / MM_PER_INCH) as usize,
            (height_mm * resolution / MM_PER_INCH) as usize,
        )
    }

    fn prepare_frame(&self, options: &[VirtualOption], frame_index: usize) -> ScanState {
        let (frames, depth) = self.frame_plan(options);
        let (width, height) = self.geometry(options);
        let kind = frames[frame_index.min(frames.len() - 1)];
        let (data, bytes_per_line) = render_frame(kind, depth, width, height);
        let parameters = FrameParameters {
            format: kind,
            last_frame: frame_index + 1 >= frames.len(),
            bytes_per_line: bytes_per_line as i32,
            pixels_per_line: width as i32,
            lines: if self.hand_scanner { -1 } else { height as i32 },
            depth,
        };
        ScanState {
            frames,
            frame_index,
            parameters,
            data,
            position: 0,
        }
    }
}

// =============================================================================
// Backend implementation
// =============================================================================

impl Backend for VirtualBackend {
    fn name(&self) -> &str {
        "virtual"
    }

    fn init(&mut self, auth: AuthCallback) -> Result<BackendVersion> {
        self.log.push("init");
        self.check_failure("init")?;
        self.auth = Some(auth);
        Ok(BackendVersion {
            major: 1,
            minor: 0,
            build: 3,
        })
    }

    fn exit(&mut self) {
        self.log.push("exit");
        self.handles.clear();
        self.auth = None;
    }

    fn devices(&mut self, local_only: bool) -> Result<Vec<RawDevice>> {
        self.log.push(format!("devices local_only={}", local_only));
        self.check_failure("devices")?;
        Ok(self.devices.clone())
    }

    fn open(&mut self, name: &str) -> Result<HandleId> {
        self.log.push(format!("open {}", name));
        self.check_failure("open")?;
        if !self.devices.iter().any(|d| d.name == name) {
            return Err(SaneError::Backend(Status::Invalid));
        }
        if let Some(expected) = self.credentials.clone() {
            let answer = self.auth.as_ref().and_then(|auth| auth(name));
            if answer.as_ref() != Some(&expected) {
                self.log.push(format!("denied {}", name));
                return Err(SaneError::Backend(Status::AccessDenied));
            }
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        let options = self.build_options();
        self.handles.insert(
            handle,
            HandleState {
                options,
                scan: None,
                pages_scanned: 0,
            },
        );
        Ok(handle)
    }

    fn close(&mut self, handle: HandleId) {
        self.log.push(format!("close {}", handle));
        self.handles.remove(&handle);
    }

    fn option_descriptor(&mut self, handle: HandleId, index: usize) -> Result<OptionDescriptor> {
        let state = self.handle_mut(handle)?;
        state
            .options
            .get(index)
            .map(|o| o.descriptor.clone())
            .ok_or(SaneError::Backend(Status::Invalid))
    }

    fn control_option(
        &mut self,
        handle: HandleId,
        index: usize,
        action: ControlAction<'_>,
    ) -> Result<Info> {
        let name = self
            .handles
            .get(&handle)
            .and_then(|s| s.options.get(index))
            .and_then(|o| o.name().map(str::to_string))
            .unwrap_or_default();

        match action {
            ControlAction::GetValue(buf) => {
                self.log.push(format!("get {}", name));
                self.check_failure(&format!("get:{}", name))?;
                let state = self
                    .handles
                    .get_mut(&handle)
                    .ok_or(SaneError::Backend(Status::Invalid))?;
                let option = state
                    .options
                    .get(index)
                    .ok_or(SaneError::Backend(Status::Invalid))?;
                if !option.is_active() {
                    return Err(SaneError::Backend(Status::Invalid));
                }
                let len = buf.len().min(option.value.len());
                buf[..len].copy_from_slice(&option.value[..len]);
                Ok(Info::default())
            }
            ControlAction::SetAuto => {
                self.log.push(format!("set_auto {}", name));
                self.check_failure(&format!("set:{}", name))?;
                let state = self
                    .handles
                    .get_mut(&handle)
                    .ok_or(SaneError::Backend(Status::Invalid))?;
                let option = state
                    .options
                    .get_mut(index)
                    .ok_or(SaneError::Backend(Status::Invalid))?;
                if option.descriptor.capabilities & Capabilities::AUTOMATIC == 0 {
                    return Err(SaneError::Backend(Status::Invalid));
                }
                // Auto colour mode resolves to colour.
                option.value = string_value(MODE_COLOR);
                apply_mode_side_effects(&mut state.options);
                Ok(Info(Info::RELOAD_OPTIONS | Info::RELOAD_PARAMS))
            }
            ControlAction::SetValue(buf) => {
                self.log.push(format!("set {}", name));
                self.check_failure(&format!("set:{}", name))?;
                let state = self
                    .handles
                    .get_mut(&handle)
                    .ok_or(SaneError::Backend(Status::Invalid))?;
                let option = state
                    .options
                    .get_mut(index)
                    .ok_or(SaneError::Backend(Status::Invalid))?;
                if !option.is_active()
                    || option.descriptor.capabilities & Capabilities::SOFT_SELECT == 0
                {
                    return Err(SaneError::Backend(Status::Invalid));
                }

                let mut info = Info::default();
                match ValueType::from_code(option.descriptor.value_type) {
                    Some(ValueType::Button) => {
                        self.log.push(format!("press {}", name));
                        return Ok(info);
                    }
                    Some(ValueType::String) => {
                        let value = String::decode(buf)?;
                        if let RawConstraint::StringList(list) = &option.descriptor.constraint {
                            if !list.contains(&value) {
                                return Err(SaneError::Backend(Status::Invalid));
                            }
                        }
                        option.value = string_value(&value);
                        if name == "mode" {
                            apply_mode_side_effects(&mut state.options);
                            info.0 |= Info::RELOAD_OPTIONS | Info::RELOAD_PARAMS;
                        }
                    }
                    Some(ValueType::Bool | ValueType::Int | ValueType::Fixed) => {
                        let requested = i32::decode(buf)?;
                        let (stored, inexact) =
                            constrain_word(&option.descriptor.constraint, requested)?;
                        option.value = word(stored);
                        if inexact {
                            info.0 |= Info::INEXACT;
                            buf[..4].copy_from_slice(&stored.to_ne_bytes());
                        }
                        if matches!(name.as_str(), "tl-x" | "tl-y" | "br-x" | "br-y" | "resolution") {
                            info.0 |= Info::RELOAD_PARAMS;
                        }
                    }
                    _ => return Err(SaneError::Backend(Status::Invalid)),
                }
                Ok(info)
            }
        }
    }

    fn parameters(&mut self, handle: HandleId) -> Result<FrameParameters> {
        self.log.push("parameters");
        self.check_failure("parameters")?;
        let state = self
            .handles
            .get(&handle)
            .ok_or(SaneError::Backend(Status::Invalid))?;
        if let Some(scan) = &state.scan {
            return Ok(scan.parameters);
        }
        Ok(self.prepare_frame(&state.options, 0).parameters)
    }

    fn start(&mut self, handle: HandleId) -> Result<()> {
        self.log.push("start");
        if let Some(hook) = self.start_hook.as_mut() {
            hook();
        }
        self.check_failure("start")?;

        let (next_frame, new_page) = {
            let state = self.handle_mut(handle)?;
            match &state.scan {
                Some(scan) if scan.finished_frame() && scan.has_more_frames() => {
                    (scan.frame_index + 1, false)
                }
                _ => (0, true),
            }
        };

        let state = self
            .handles
            .get(&handle)
            .ok_or(SaneError::Backend(Status::Invalid))?;
        if new_page
            && string_of(&state.options, "source") == SOURCE_ADF
            && state.pages_scanned >= self.feeder_pages
        {
            return Err(SaneError::Backend(Status::NoDocs));
        }
        let scan = self.prepare_frame(&state.options, next_frame);

        let state = self.handle_mut(handle)?;
        if new_page {
            state.pages_scanned += 1;
        }
        state.scan = Some(scan);
        Ok(())
    }

    fn set_io_mode(&mut self, _handle: HandleId, non_blocking: bool) -> Result<()> {
        self.log.push(format!("set_io_mode non_blocking={}", non_blocking));
        if non_blocking {
            return Err(SaneError::Backend(Status::Unsupported));
        }
        Ok(())
    }

    fn read(&mut self, handle: HandleId, buf: &mut [u8]) -> Result<usize> {
        self.log.push("read");
        self.check_failure("read")?;
        let chunk = self.read_chunk;
        let state = self.handle_mut(handle)?;
        let scan = state
            .scan
            .as_mut()
            .ok_or(SaneError::Backend(Status::Invalid))?;
        if scan.finished_frame() {
            return Err(SaneError::Backend(Status::Eof));
        }
        let len = chunk
            .min(buf.len())
            .min(scan.data.len() - scan.position);
        buf[..len].copy_from_slice(&scan.data[scan.position..scan.position + len]);
        scan.position += len;
        Ok(len)
    }

    fn cancel(&mut self, handle: HandleId) {
        self.log.push("cancel");
        if let Some(state) = self.handles.get_mut(&handle) {
            state.scan = None;
            state.pages_scanned = 0;
        }
    }
}
