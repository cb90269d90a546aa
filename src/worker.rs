//! The session worker thread.
//!
//! Scanner backends are not reentrant, so every backend call happens on one
//! dedicated thread. [`Sane`](crate::Sane) turns each public operation into a
//! [`WorkerRequest`] carrying a oneshot reply channel; the worker runs them
//! one at a time in arrival order.
//!
//! State shared with other threads is limited to [`SessionShared`]: the
//! handle table and update counter (read for status queries) and the cancel
//! latch (set from anywhere, checked between reads).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};

use image::DynamicImage;
use tokio::sync::{mpsc, oneshot};

use crate::backend::{
    timed, AuthCallback, Backend, BackendVersion, ControlAction, HandleId, Info,
};
use crate::config::SaneConfig;
use crate::error::{Result, SaneError};
use crate::models::{Device, FeederHeuristic, ScanOperation, ScannedImage};
use crate::options::{DeviceOption, NewValue, OptionValue, WireValue, WORD_SIZE};
use crate::sane::{AuthRequest, CredentialStore, SaneEvent};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Shared state
// =============================================================================

/// State read or written outside the worker thread.
#[derive(Default)]
pub(crate) struct SessionShared {
    handles: Mutex<HashMap<String, HandleId>>,
    updating: Mutex<usize>,
    cancel: Arc<AtomicBool>,
    init_error: Mutex<Option<String>>,
    version: Mutex<Option<BackendVersion>>,
}

impl SessionShared {
    pub(crate) fn handle(&self, device_name: &str) -> Option<HandleId> {
        lock(&self.handles).get(device_name).copied()
    }

    pub(crate) fn is_open(&self, device_name: &str) -> bool {
        lock(&self.handles).contains_key(device_name)
    }

    fn insert_handle(&self, device_name: &str, handle: HandleId) {
        lock(&self.handles).insert(device_name.to_string(), handle);
    }

    fn remove_handle(&self, device_name: &str) -> Option<HandleId> {
        lock(&self.handles).remove(device_name)
    }

    fn open_handles(&self) -> Vec<(String, HandleId)> {
        lock(&self.handles)
            .iter()
            .map(|(name, handle)| (name.clone(), *handle))
            .collect()
    }

    fn has_open_handles(&self) -> bool {
        !lock(&self.handles).is_empty()
    }

    fn clear_handles(&self) {
        lock(&self.handles).clear();
    }

    /// Returns true for the first of overlapping updates.
    pub(crate) fn begin_update(&self) -> bool {
        let mut updating = lock(&self.updating);
        *updating += 1;
        *updating == 1
    }

    /// Returns true when the last overlapping update finished.
    pub(crate) fn end_update(&self) -> bool {
        let mut updating = lock(&self.updating);
        *updating = updating.saturating_sub(1);
        *updating == 0
    }

    pub(crate) fn is_updating(&self) -> bool {
        *lock(&self.updating) > 0
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub(crate) fn init_error(&self) -> Option<String> {
        lock(&self.init_error).clone()
    }

    pub(crate) fn version(&self) -> Option<BackendVersion> {
        *lock(&self.version)
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Work items for the worker thread.
///
/// Each carries the oneshot sender its result goes back on. A dropped sender
/// (worker gone or panicked) surfaces as `WorkerUnavailable` to the caller.
pub(crate) enum WorkerRequest {
    /// Close every handle, shut the backend down and exit the loop.
    Shutdown,
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Configure {
        config: SaneConfig,
    },
    UpdateDevices {
        reply: oneshot::Sender<Result<Vec<Device>>>,
    },
    OpenDevice {
        device: Device,
        list_options: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseDevice {
        device: Device,
        reply: oneshot::Sender<()>,
    },
    ListOptions {
        device: Device,
        reply: oneshot::Sender<Result<Arc<Vec<DeviceOption>>>>,
    },
    ValueForOption {
        device: Device,
        option: DeviceOption,
        reply: oneshot::Sender<Result<OptionValue>>,
    },
    UpdateOption {
        device: Device,
        option: DeviceOption,
        value: NewValue,
        reply: oneshot::Sender<Result<Info>>,
    },
    PressButton {
        device: Device,
        option: DeviceOption,
        reply: oneshot::Sender<Result<Info>>,
    },
    Preview {
        device: Device,
        progress: mpsc::UnboundedSender<ScanOperation>,
        reply: oneshot::Sender<Result<DynamicImage>>,
    },
    Scan {
        device: Device,
        use_crop: bool,
        progress: mpsc::UnboundedSender<ScanOperation>,
        reply: oneshot::Sender<Result<Vec<ScannedImage>>>,
    },
}

impl WorkerRequest {
    fn label(&self) -> &'static str {
        match self {
            WorkerRequest::Shutdown => "shutdown",
            WorkerRequest::Start { .. } => "start",
            WorkerRequest::Stop { .. } => "stop",
            WorkerRequest::Configure { .. } => "configure",
            WorkerRequest::UpdateDevices { .. } => "update_devices",
            WorkerRequest::OpenDevice { .. } => "open_device",
            WorkerRequest::CloseDevice { .. } => "close_device",
            WorkerRequest::ListOptions { .. } => "list_options",
            WorkerRequest::ValueForOption { .. } => "value_for_option",
            WorkerRequest::UpdateOption { .. } => "update_option",
            WorkerRequest::PressButton { .. } => "press_button",
            WorkerRequest::Preview { .. } => "preview",
            WorkerRequest::Scan { .. } => "scan",
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Everything the worker thread owns.
pub(crate) struct Worker {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) events: mpsc::UnboundedSender<SaneEvent>,
    pub(crate) config: SaneConfig,
    pub(crate) credential_store: Option<Arc<dyn CredentialStore>>,
    pub(crate) feeder: Arc<dyn FeederHeuristic>,
    started: bool,
}

impl Worker {
    pub(crate) fn new(
        backend: Box<dyn Backend>,
        shared: Arc<SessionShared>,
        events: mpsc::UnboundedSender<SaneEvent>,
        config: SaneConfig,
        credential_store: Option<Arc<dyn CredentialStore>>,
        feeder: Arc<dyn FeederHeuristic>,
    ) -> Self {
        Self {
            backend,
            shared,
            events,
            config,
            credential_store,
            feeder,
            started: false,
        }
    }

    /// Credentials callback handed to the backend.
    ///
    /// Runs on the worker thread and blocks it until the request is answered
    /// or dropped. No other backend call can make progress without the
    /// credentials, so holding the thread here is intended.
    fn auth_callback(&self) -> AuthCallback {
        let events = self.events.clone();
        let store = self.credential_store.clone();
        Box::new(move |resource: &str| {
            if let Some(credentials) = store.as_ref().and_then(|s| s.credentials(resource)) {
                tracing::debug!("Using stored credentials for {}", resource);
                return Some(credentials);
            }
            let (tx, rx) = std::sync::mpsc::sync_channel(1);
            let request = AuthRequest::new(resource, tx);
            if events
                .send(SaneEvent::AuthenticationRequired(request))
                .is_err()
            {
                tracing::warn!("No listener for authentication of {}", resource);
                return None;
            }
            rx.recv().ok().flatten()
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub(crate) fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.backend.configure(&self.config);
        let auth = self.auth_callback();
        let result = timed("sane_init", || self.backend.init(auth));
        match result {
            Ok(version) => {
                tracing::info!("Started {} backend {}", self.backend.name(), version);
                self.started = true;
                self.shared.clear_handles();
                *lock(&self.shared.version) = Some(version);
                *lock(&self.shared.init_error) = None;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to start {} backend: {}", self.backend.name(), e);
                *lock(&self.shared.init_error) = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Shut the backend down unless a device is still open.
    pub(crate) fn stop(&mut self) {
        if !self.started {
            return;
        }
        if self.shared.has_open_handles() {
            tracing::debug!("Not stopping backend, devices still open");
            return;
        }
        timed("sane_exit", || self.backend.exit());
        self.started = false;
        tracing::info!("Stopped {} backend", self.backend.name());
    }

    fn shutdown(&mut self) {
        for (name, handle) in self.shared.open_handles() {
            tracing::debug!("Closing {} on shutdown", name);
            self.backend.cancel(handle);
            self.backend.close(handle);
            self.shared.remove_handle(&name);
        }
        self.stop();
    }

    fn configure(&mut self, config: SaneConfig) {
        self.backend.configure(&config);
        self.config = config;
        tracing::debug!("Configuration applied, effective at next start");
    }

    pub(crate) fn update_devices(&mut self) -> Result<Vec<Device>> {
        let result = self.start().and_then(|()| {
            timed("sane_get_devices", || self.backend.devices(false))
        });
        if self.shared.end_update() {
            self.stop();
            let _ = self.events.send(SaneEvent::DevicesUpdateFinished);
        }
        let devices: Vec<Device> = result?.iter().map(Device::from_raw).collect();
        tracing::info!("Found {} device(s)", devices.len());
        Ok(devices)
    }

    pub(crate) fn open_device(&mut self, device: &Device, list_options: bool) -> Result<()> {
        if self.shared.is_open(device.name()) {
            return Ok(());
        }
        self.start()?;
        let handle = timed("sane_open", || self.backend.open(device.name()))?;
        self.shared.insert_handle(device.name(), handle);
        tracing::info!("Opened {}", device.name());
        if list_options {
            if let Err(e) = self.list_options(device) {
                tracing::warn!("Closing {} after failed option listing: {}", device.name(), e);
                self.close_device(device);
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn close_device(&mut self, device: &Device) {
        if let Some(handle) = self.shared.remove_handle(device.name()) {
            timed("sane_close", || self.backend.close(handle));
            tracing::info!("Closed {}", device.name());
        }
        if !self.shared.has_open_handles() {
            self.stop();
        }
    }

    pub(crate) fn handle_for(&self, device: &Device) -> Result<HandleId> {
        self.shared
            .handle(device.name())
            .ok_or(SaneError::DeviceNotOpened)
    }

    // -------------------------------------------------------------------------
    // Option I/O
    // -------------------------------------------------------------------------

    /// Fetch every descriptor and current value, then swap the list in.
    ///
    /// Only the option count is required. Descriptors and values that fail
    /// to load are logged and left out or left at their defaults.
    pub(crate) fn list_options(&mut self, device: &Device) -> Result<Arc<Vec<DeviceOption>>> {
        let handle = self.handle_for(device)?;
        let count = self
            .option_count(handle)
            .map_err(|e| SaneError::CannotEnumerateOptions(Box::new(e)))?;

        let mut options = Vec::with_capacity(count.saturating_sub(1));
        for index in 1..count {
            let descriptor = match self.backend.option_descriptor(handle, index) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::warn!("Skipping option {}: {}", index, e);
                    continue;
                }
            };
            match DeviceOption::from_descriptor(index, &descriptor) {
                Some(option) => options.push(option),
                None => tracing::warn!(
                    "Skipping option {} of unknown type {}",
                    index,
                    descriptor.value_type
                ),
            }
        }

        for option in options.iter_mut() {
            if option.value().is_none() || !option.capabilities().is_readable() {
                continue;
            }
            match self.read_value(handle, option) {
                Ok(value) => option.set_cached_value(value)?,
                Err(e) if !option.capabilities().is_active() => {
                    tracing::debug!("Ignoring read failure on inactive {:?}: {}", option.identifier(), e);
                }
                Err(e) => {
                    tracing::warn!("Could not read {:?}: {}", option.identifier(), e);
                }
            }
        }

        tracing::debug!("Listed {} options for {}", options.len(), device.name());
        device.replace_options(options);
        Ok(device.options())
    }

    /// Option 0 holds the number of options, itself included.
    fn option_count(&mut self, handle: HandleId) -> Result<usize> {
        let mut count = vec![0u8; WORD_SIZE];
        timed("sane_control_option(count)", || {
            self.backend
                .control_option(handle, 0, ControlAction::GetValue(&mut count))
        })?;
        Ok(i32::decode(&count)?.max(0) as usize)
    }

    fn read_value(&mut self, handle: HandleId, option: &DeviceOption) -> Result<OptionValue> {
        match option {
            DeviceOption::Group(_) => {
                return Err(SaneError::InvalidOperationForOptionKind {
                    action: "read",
                    kind: "group",
                })
            }
            DeviceOption::Button(_) => {
                return Err(SaneError::InvalidOperationForOptionKind {
                    action: "read",
                    kind: "button",
                })
            }
            _ => {}
        }
        let mut buf = vec![0u8; option.info().size];
        timed("sane_control_option(get)", || {
            self.backend
                .control_option(handle, option.index(), ControlAction::GetValue(&mut buf))
        })?;
        option.decode_value(&buf)
    }

    /// Read one option and store the value on the device.
    pub(crate) fn value_for_option(
        &mut self,
        device: &Device,
        option: &DeviceOption,
    ) -> Result<OptionValue> {
        if matches!(option, DeviceOption::Group(_) | DeviceOption::Button(_)) {
            return self.read_value(0, option);
        }
        let handle = self.handle_for(device)?;
        match self.read_value(handle, option) {
            Ok(value) => {
                let mut updated = option.clone();
                updated.set_cached_value(value.clone())?;
                device.replace_option(updated);
                Ok(value)
            }
            Err(e) if !option.capabilities().is_active() => {
                tracing::debug!("Using cached value of inactive {:?}: {}", option.identifier(), e);
                option.value().ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    /// The device's current copy of `option`, when it still describes the
    /// same setting.
    fn current(device: &Device, option: &DeviceOption) -> DeviceOption {
        device
            .option_at(option.index())
            .filter(|current| current.identifier() == option.identifier())
            .unwrap_or_else(|| option.clone())
    }

    pub(crate) fn update_option(
        &mut self,
        device: &Device,
        option: &DeviceOption,
        value: NewValue,
    ) -> Result<Info> {
        let option = Self::current(device, option);
        if let DeviceOption::Group(_) = option {
            return Err(SaneError::InvalidOperationForOptionKind {
                action: "write",
                kind: "group",
            });
        }
        let caps = option.capabilities();
        if value == NewValue::Auto && !caps.supports_auto() {
            return Err(SaneError::AutoValueUnsupported);
        }
        if !caps.is_active() {
            return Err(SaneError::InactiveOption);
        }
        if !caps.is_settable() {
            return Err(SaneError::ReadOnlyOption);
        }
        let handle = self.handle_for(device)?;

        let info = match &value {
            NewValue::Auto => timed("sane_control_option(auto)", || {
                self.backend
                    .control_option(handle, option.index(), ControlAction::SetAuto)
            })?,
            NewValue::Value(v) => {
                let mut buf = option.encode_value(v)?;
                timed("sane_control_option(set)", || {
                    self.backend
                        .control_option(handle, option.index(), ControlAction::SetValue(&mut buf))
                })?
            }
        };
        tracing::debug!(
            "Set {:?} to {:?} (info {:#x})",
            option.identifier(),
            value,
            info.0
        );
        self.after_write(handle, device, &option, info)?;
        Ok(info)
    }

    pub(crate) fn press_button(&mut self, device: &Device, option: &DeviceOption) -> Result<Info> {
        let option = Self::current(device, option);
        let DeviceOption::Button(info) = &option else {
            return Err(SaneError::InvalidOperationForOptionKind {
                action: "press",
                kind: option.value_type().as_str(),
            });
        };
        if !info.capabilities.is_active() {
            return Err(SaneError::InactiveOption);
        }
        let handle = self.handle_for(device)?;
        let mut empty = Vec::new();
        let result = timed("sane_control_option(press)", || {
            self.backend
                .control_option(handle, option.index(), ControlAction::SetValue(&mut empty))
        })?;
        self.after_write(handle, device, &option, result)?;
        Ok(result)
    }

    /// Reload everything on a reload signal, otherwise re-read the written
    /// option since the backend may have adjusted it.
    fn after_write(
        &mut self,
        handle: HandleId,
        device: &Device,
        option: &DeviceOption,
        info: Info,
    ) -> Result<()> {
        if info.reload_options() {
            self.list_options(device)?;
            return Ok(());
        }
        if option.value().is_none() || !option.capabilities().is_readable() {
            return Ok(());
        }
        let value = self.read_value(handle, option)?;
        let mut updated = option.clone();
        updated.set_cached_value(value)?;
        device.replace_option(updated);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    fn process(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::Start { reply } => {
                let _ = reply.send(self.start());
            }
            WorkerRequest::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            WorkerRequest::Configure { config } => self.configure(config),
            WorkerRequest::UpdateDevices { reply } => {
                let _ = reply.send(self.update_devices());
            }
            WorkerRequest::OpenDevice {
                device,
                list_options,
                reply,
            } => {
                let _ = reply.send(self.open_device(&device, list_options));
            }
            WorkerRequest::CloseDevice { device, reply } => {
                self.close_device(&device);
                let _ = reply.send(());
            }
            WorkerRequest::ListOptions { device, reply } => {
                let _ = reply.send(self.list_options(&device));
            }
            WorkerRequest::ValueForOption {
                device,
                option,
                reply,
            } => {
                let _ = reply.send(self.value_for_option(&device, &option));
            }
            WorkerRequest::UpdateOption {
                device,
                option,
                value,
                reply,
            } => {
                let _ = reply.send(self.update_option(&device, &option, value));
            }
            WorkerRequest::PressButton {
                device,
                option,
                reply,
            } => {
                let _ = reply.send(self.press_button(&device, &option));
            }
            WorkerRequest::Preview {
                device,
                progress,
                reply,
            } => {
                let _ = reply.send(self.preview(&device, &progress));
            }
            WorkerRequest::Scan {
                device,
                use_crop,
                progress,
                reply,
            } => {
                let _ = reply.send(self.scan(&device, use_crop, &progress));
            }
            // Handled by the loop before dispatch.
            WorkerRequest::Shutdown => {}
        }
    }
}

/// Worker loop.
///
/// Runs until a `Shutdown` request arrives or every sender is gone. Each
/// request is wrapped in `catch_unwind` so a panicking backend only loses
/// that request: its reply sender is dropped and the caller sees
/// `WorkerUnavailable`.
pub(crate) fn worker_loop(mut worker: Worker, requests: Receiver<WorkerRequest>) {
    while let Ok(request) = requests.recv() {
        if matches!(request, WorkerRequest::Shutdown) {
            tracing::info!("SANE worker received shutdown signal, exiting");
            break;
        }

        let label = request.label();
        tracing::trace!("Processing {}", label);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            worker.process(request)
        }));

        if let Err(panic_info) = result {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic in SANE worker".to_string()
            };
            tracing::error!("SANE worker caught panic during {}: {}", label, panic_msg);
        }
    }
    worker.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VirtualBackend;
    use crate::error::Status;
    use crate::models::SourceNameHeuristic;
    use crate::options::StandardOption;
    use pretty_assertions::assert_eq;

    fn worker(backend: VirtualBackend) -> (Worker, mpsc::UnboundedReceiver<SaneEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = Worker::new(
            Box::new(backend),
            Arc::new(SessionShared::default()),
            events_tx,
            SaneConfig::default(),
            None,
            Arc::new(SourceNameHeuristic),
        );
        (worker, events_rx)
    }

    fn opened(backend: VirtualBackend) -> (Worker, Device) {
        let (mut worker, _events) = worker(backend);
        let device = Device::new("test:0", "Noname", "frontend-tester", "virtual device");
        worker.open_device(&device, true).unwrap();
        (worker, device)
    }

    #[test]
    fn test_update_counter_reports_first_and_last() {
        let shared = SessionShared::default();
        assert!(shared.begin_update());
        assert!(!shared.begin_update());
        assert!(shared.is_updating());
        assert!(!shared.end_update());
        assert!(shared.end_update());
        assert!(!shared.is_updating());
    }

    #[test]
    fn test_start_failure_is_recorded() {
        let (mut worker, _events) = worker(VirtualBackend::new().fail_once("init", Status::IoError));
        assert!(worker.start().is_err());
        assert_eq!(
            worker.shared.init_error().as_deref(),
            Some("Backend error: Error during device I/O")
        );
        assert!(worker.start().is_ok());
        assert_eq!(worker.shared.init_error(), None);
        assert!(worker.shared.version().is_some());
    }

    #[test]
    fn test_update_devices_stops_backend_afterwards() {
        let backend = VirtualBackend::new();
        let log = backend.call_log();
        let (mut worker, mut events) = worker(backend);
        worker.shared.begin_update();

        let devices = worker.update_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name(), "test:0");
        assert_eq!(log.entries(), vec!["init", "devices local_only=false", "exit"]);
        assert!(matches!(
            events.try_recv(),
            Ok(SaneEvent::DevicesUpdateFinished)
        ));
    }

    #[test]
    fn test_open_twice_is_noop() {
        let backend = VirtualBackend::new();
        let log = backend.call_log();
        let (mut worker, device) = opened(backend);
        worker.open_device(&device, true).unwrap();
        assert_eq!(log.count("open"), 1);
    }

    #[test]
    fn test_list_options_skips_count_slot() {
        let (_worker, device) = opened(VirtualBackend::new());
        let options = device.options();
        assert_eq!(options.len(), 13);
        assert_eq!(options[0].index(), 1);
        assert!(matches!(options[0], DeviceOption::Group(_)));
        assert_eq!(
            device.option(StandardOption::Resolution).and_then(|o| o.value()),
            Some(OptionValue::Int(10))
        );
    }

    #[test]
    fn test_failed_option_read_keeps_listing() {
        let backend = VirtualBackend::new().fail_once("get:resolution", Status::IoError);
        let log = backend.call_log();
        let (mut worker, _events) = worker(backend);
        let device = Device::new("test:0", "Noname", "frontend-tester", "virtual device");

        worker.open_device(&device, true).unwrap();
        assert_eq!(log.count("fail get:resolution"), 1);
        assert!(worker.shared.is_open("test:0"));
        assert_eq!(device.options().len(), 13);
        assert_eq!(
            device.option(StandardOption::Mode).and_then(|o| o.value()),
            Some(OptionValue::String("Color".into()))
        );
        assert!(device.option(StandardOption::Resolution).is_some());
    }

    #[test]
    fn test_failed_option_count_closes_device() {
        let backend = VirtualBackend::new().fail_once("get:", Status::IoError);
        let log = backend.call_log();
        let (mut worker, _events) = worker(backend);
        let device = Device::new("test:0", "Noname", "frontend-tester", "virtual device");

        let err = worker.open_device(&device, true).unwrap_err();
        assert!(matches!(err, SaneError::CannotEnumerateOptions(_)));
        assert_eq!(err.status(), Some(Status::IoError));
        assert!(!worker.shared.is_open("test:0"));
        assert!(device.options().is_empty());
        assert_eq!(log.count("close"), 1);
        assert_eq!(log.count("exit"), 1);
    }

    #[test]
    fn test_reading_button_fails_without_backend_call() {
        let backend = VirtualBackend::new();
        let log = backend.call_log();
        let (mut worker, device) = opened(backend);
        let button = device.option_named("calibrate").unwrap();
        log.clear();
        assert!(matches!(
            worker.value_for_option(&device, &button),
            Err(SaneError::InvalidOperationForOptionKind { .. })
        ));
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_inactive_read_failure_returns_cached_value() {
        let (mut worker, device) = opened(VirtualBackend::new());
        let mode = device.option(StandardOption::Mode).unwrap();
        worker
            .update_option(&device, &mode, NewValue::Value(OptionValue::String("Lineart".into())))
            .unwrap();
        let depth = device.option_named("depth").unwrap();
        assert!(!depth.capabilities().is_active());
        assert_eq!(
            worker.value_for_option(&device, &depth).unwrap(),
            OptionValue::Int(0)
        );
    }

    #[test]
    fn test_write_refreshes_coerced_value() {
        let (mut worker, device) = opened(VirtualBackend::new());
        let resolution = device.option(StandardOption::Resolution).unwrap();
        let info = worker
            .update_option(&device, &resolution, NewValue::Value(OptionValue::Int(300)))
            .unwrap();
        assert!(info.is_inexact());
        assert_eq!(
            device.option(StandardOption::Resolution).and_then(|o| o.value()),
            Some(OptionValue::Int(50))
        );
    }

    #[test]
    fn test_press_button() {
        let backend = VirtualBackend::new();
        let log = backend.call_log();
        let (mut worker, device) = opened(backend);
        let button = device.option_named("calibrate").unwrap();
        worker.press_button(&device, &button).unwrap();
        assert_eq!(log.count("press calibrate"), 1);

        let mode = device.option(StandardOption::Mode).unwrap();
        assert!(matches!(
            worker.press_button(&device, &mode),
            Err(SaneError::InvalidOperationForOptionKind { action: "press", .. })
        ));
    }

    #[test]
    fn test_close_last_device_stops_backend() {
        let backend = VirtualBackend::new();
        let log = backend.call_log();
        let (mut worker, device) = opened(backend);
        worker.close_device(&device);
        assert!(!worker.shared.is_open("test:0"));
        assert_eq!(log.count("exit"), 1);
        assert!(matches!(
            worker.list_options(&device),
            Err(SaneError::DeviceNotOpened)
        ));
    }
}
