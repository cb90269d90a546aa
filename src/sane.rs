//! Public session handle.
//!
//! [`Sane`] owns the worker thread that talks to the backend. Every
//! operation is queued to that thread and answered through a future, so
//! callers never block on device I/O. The worker runs requests strictly in
//! the order they were issued.
//!
//! # Events
//!
//! Things the caller did not ask for arrive on the [`SaneEvent`] receiver
//! returned by [`Sane::spawn`]: device list updates starting and finishing,
//! and credential requests from the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use image::DynamicImage;
use tokio::sync::{mpsc as async_mpsc, oneshot};

use crate::backend::{Backend, BackendVersion, DeviceAuthentication, Info};
use crate::config::SaneConfig;
use crate::error::{Result, SaneError, Status};
use crate::models::{Device, FeederHeuristic, ScanOperation, ScannedImage, SourceNameHeuristic};
use crate::options::{DeviceOption, NewValue, OptionValue};
use crate::worker::{worker_loop, SessionShared, Worker, WorkerRequest};

/// Queued requests beyond this are rejected as busy.
const CHANNEL_BOUND: usize = 64;

// =============================================================================
// Events
// =============================================================================

/// Notifications from the session.
#[derive(Debug)]
pub enum SaneEvent {
    /// The first of possibly overlapping device list updates started.
    DevicesUpdateStarted,
    /// The last running device list update finished.
    DevicesUpdateFinished,
    /// The backend needs credentials for a resource. The worker waits until
    /// the request is answered or dropped.
    AuthenticationRequired(AuthRequest),
}

/// A pending credentials request.
///
/// Dropping it without calling [`respond`](Self::respond) declines.
#[derive(Debug)]
pub struct AuthRequest {
    device_name: String,
    responder: SyncSender<Option<DeviceAuthentication>>,
}

impl AuthRequest {
    pub(crate) fn new(
        device_name: impl Into<String>,
        responder: SyncSender<Option<DeviceAuthentication>>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            responder,
        }
    }

    /// Resource the backend asked about, usually the device name.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Answer the request; `None` declines.
    pub fn respond(self, credentials: Option<DeviceAuthentication>) {
        let _ = self.responder.send(credentials);
    }
}

/// Source of stored credentials, consulted before asking through
/// [`SaneEvent::AuthenticationRequired`].
pub trait CredentialStore: Send + Sync {
    fn credentials(&self, device_name: &str) -> Option<DeviceAuthentication>;
}

/// Cancels the scan running on a session from any thread.
#[derive(Debug, Clone)]
pub struct ScanCanceller {
    flag: Arc<AtomicBool>,
}

impl ScanCanceller {
    /// Takes effect before the next read. Scans started afterwards are not
    /// affected.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures a session before its worker starts.
pub struct SaneBuilder {
    backend: Box<dyn Backend>,
    config: SaneConfig,
    credential_store: Option<Arc<dyn CredentialStore>>,
    feeder: Arc<dyn FeederHeuristic>,
}

impl SaneBuilder {
    pub fn config(mut self, config: SaneConfig) -> Self {
        self.config = config;
        self
    }

    pub fn credential_store(mut self, store: impl CredentialStore + 'static) -> Self {
        self.credential_store = Some(Arc::new(store));
        self
    }

    /// Replace the default [`SourceNameHeuristic`].
    pub fn feeder_heuristic(mut self, heuristic: impl FeederHeuristic + 'static) -> Self {
        self.feeder = Arc::new(heuristic);
        self
    }

    pub fn spawn(self) -> (Sane, async_mpsc::UnboundedReceiver<SaneEvent>) {
        let (request_tx, request_rx) = mpsc::sync_channel::<WorkerRequest>(CHANNEL_BOUND);
        let (events_tx, events_rx) = async_mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared::default());

        let worker = Worker::new(
            self.backend,
            Arc::clone(&shared),
            events_tx.clone(),
            self.config.clone(),
            self.credential_store,
            Arc::clone(&self.feeder),
        );
        let worker_handle = thread::spawn(move || {
            worker_loop(worker, request_rx);
        });

        let sane = Sane {
            request_tx,
            worker_handle: Some(worker_handle),
            shared,
            events: events_tx,
            config: Mutex::new(self.config),
            feeder: self.feeder,
        };
        (sane, events_rx)
    }
}

// =============================================================================
// Session
// =============================================================================

/// A SANE session.
pub struct Sane {
    request_tx: SyncSender<WorkerRequest>,
    worker_handle: Option<JoinHandle<()>>,
    shared: Arc<SessionShared>,
    events: async_mpsc::UnboundedSender<SaneEvent>,
    config: Mutex<SaneConfig>,
    feeder: Arc<dyn FeederHeuristic>,
}

impl Sane {
    pub fn builder(backend: impl Backend + 'static) -> SaneBuilder {
        SaneBuilder {
            backend: Box::new(backend),
            config: SaneConfig::default(),
            credential_store: None,
            feeder: Arc::new(SourceNameHeuristic),
        }
    }

    /// Start a session with default collaborators.
    pub fn spawn(
        backend: impl Backend + 'static,
        config: SaneConfig,
    ) -> (Self, async_mpsc::UnboundedReceiver<SaneEvent>) {
        Self::builder(backend).config(config).spawn()
    }

    fn send(&self, request: WorkerRequest) -> Result<()> {
        match self.request_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("SANE worker queue full");
                Err(SaneError::Backend(Status::DeviceBusy))
            }
            Err(TrySendError::Disconnected(_)) => Err(SaneError::WorkerUnavailable),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerRequest,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| SaneError::WorkerUnavailable)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Initialise the backend. Does nothing when already started.
    ///
    /// # Errors
    ///
    /// The backend's init failure, also kept in [`init_error`](Self::init_error).
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| WorkerRequest::Start { reply }).await?
    }

    /// Shut the backend down, unless a device is open.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| WorkerRequest::Stop { reply }).await
    }

    /// Store a new configuration. It takes effect at the next start.
    pub fn set_configuration(&self, config: SaneConfig) -> Result<()> {
        *self.config.lock().unwrap_or_else(|p| p.into_inner()) = config.clone();
        self.send(WorkerRequest::Configure { config })
    }

    pub fn configuration(&self) -> SaneConfig {
        self.config.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Why the last start failed, if it did.
    pub fn init_error(&self) -> Option<String> {
        self.shared.init_error()
    }

    pub fn backend_version(&self) -> Option<BackendVersion> {
        self.shared.version()
    }

    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    /// Enumerate devices, starting the backend for the duration if needed.
    pub async fn update_devices(&self) -> Result<Vec<Device>> {
        if self.shared.begin_update() {
            let _ = self.events.send(SaneEvent::DevicesUpdateStarted);
        }
        let (reply, rx) = oneshot::channel();
        if let Err(e) = self.send(WorkerRequest::UpdateDevices { reply }) {
            if self.shared.end_update() {
                let _ = self.events.send(SaneEvent::DevicesUpdateFinished);
            }
            return Err(e);
        }
        rx.await.map_err(|_| SaneError::WorkerUnavailable)?
    }

    pub fn is_updating_devices(&self) -> bool {
        self.shared.is_updating()
    }

    /// Open `device`, optionally loading its options right away.
    pub async fn open_device(&self, device: &Device, list_options: bool) -> Result<()> {
        let device = device.clone();
        self.request(|reply| WorkerRequest::OpenDevice {
            device,
            list_options,
            reply,
        })
        .await?
    }

    /// Close `device`. Its cached preview and status are dropped at once.
    pub async fn close_device(&self, device: &Device) -> Result<()> {
        device.clear_cached_state();
        let device = device.clone();
        self.request(|reply| WorkerRequest::CloseDevice { device, reply })
            .await
    }

    pub fn is_device_opened(&self, device: &Device) -> bool {
        self.shared.is_open(device.name())
    }

    /// Whether a scan of `device` would run the document feeder loop,
    /// according to the session's feeder heuristic.
    pub fn is_using_feeder(&self, device: &Device) -> bool {
        self.feeder.is_using_feeder(device)
    }

    /// What the device is doing, while a preview or scan runs.
    pub fn device_status(&self, device: &Device) -> Option<ScanOperation> {
        device.operation()
    }

    // -------------------------------------------------------------------------
    // Options
    // -------------------------------------------------------------------------

    /// Reload every option of an open device.
    pub async fn list_options(&self, device: &Device) -> Result<Arc<Vec<DeviceOption>>> {
        let device = device.clone();
        self.request(|reply| WorkerRequest::ListOptions { device, reply })
            .await?
    }

    /// Read the current value of one option from the device.
    ///
    /// # Errors
    ///
    /// `InvalidOperationForOptionKind` for groups and buttons.
    pub async fn value_for_option(
        &self,
        device: &Device,
        option: &DeviceOption,
    ) -> Result<OptionValue> {
        let (device, option) = (device.clone(), option.clone());
        self.request(|reply| WorkerRequest::ValueForOption {
            device,
            option,
            reply,
        })
        .await?
    }

    /// Write an option. The device's option list is already refreshed when
    /// this returns.
    ///
    /// # Errors
    ///
    /// - `AutoValueUnsupported`, `InactiveOption`, `ReadOnlyOption`, checked
    ///   before anything reaches the backend
    /// - `InvalidValue` when the value does not fit the option type
    /// - backend failures
    pub async fn update_option(
        &self,
        device: &Device,
        option: &DeviceOption,
        value: impl Into<NewValue>,
    ) -> Result<Info> {
        let (device, option, value) = (device.clone(), option.clone(), value.into());
        self.request(|reply| WorkerRequest::UpdateOption {
            device,
            option,
            value,
            reply,
        })
        .await?
    }

    pub async fn press_button(&self, device: &Device, option: &DeviceOption) -> Result<Info> {
        let (device, option) = (device.clone(), option.clone());
        self.request(|reply| WorkerRequest::PressButton {
            device,
            option,
            reply,
        })
        .await?
    }

    // -------------------------------------------------------------------------
    // Acquisition
    // -------------------------------------------------------------------------

    /// Low resolution scan of the whole area. Progress goes to `progress`.
    pub async fn preview(
        &self,
        device: &Device,
        progress: async_mpsc::UnboundedSender<ScanOperation>,
    ) -> Result<DynamicImage> {
        let device = device.clone();
        self.request(|reply| WorkerRequest::Preview {
            device,
            progress,
            reply,
        })
        .await?
    }

    /// Scan with the current settings; one image per page.
    ///
    /// With `use_crop`, the device's crop area is written to the geometry
    /// options first.
    pub async fn scan(
        &self,
        device: &Device,
        use_crop: bool,
        progress: async_mpsc::UnboundedSender<ScanOperation>,
    ) -> Result<Vec<ScannedImage>> {
        let device = device.clone();
        self.request(|reply| WorkerRequest::Scan {
            device,
            use_crop,
            progress,
            reply,
        })
        .await?
    }

    /// Ask the running scan to stop; it ends with `SaneError::Cancelled`.
    ///
    /// The latch is cleared when the worker begins a preview or scan, so a
    /// cancel issued while the request is still queued is dropped. Cancel
    /// again once [`device_status`](Self::device_status) reports progress.
    pub fn cancel_current_scan(&self) {
        tracing::debug!("Scan cancel requested");
        self.shared.request_cancel();
    }

    pub fn canceller(&self) -> ScanCanceller {
        ScanCanceller {
            flag: self.shared.cancel_flag(),
        }
    }
}

impl Drop for Sane {
    fn drop(&mut self) {
        // The worker may already be gone.
        let _ = self.request_tx.send(WorkerRequest::Shutdown);

        if let Some(handle) = self.worker_handle.take() {
            const QUICK_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);
            const MAX_QUICK_CHECKS: u32 = 10;

            for _ in 0..MAX_QUICK_CHECKS {
                if handle.is_finished() {
                    if let Err(e) = handle.join() {
                        tracing::warn!("SANE worker thread panicked during shutdown: {:?}", e);
                    } else {
                        tracing::debug!("SANE worker thread shut down");
                    }
                    return;
                }
                std::thread::sleep(QUICK_CHECK_INTERVAL);
            }

            // A backend stuck in I/O keeps the thread alive; leave it behind.
            tracing::debug!(
                "SANE worker still running after {}ms, detaching",
                QUICK_CHECK_INTERVAL.as_millis() * MAX_QUICK_CHECKS as u128
            );
        }
    }
}
