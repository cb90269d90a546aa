//! Integration tests for the session handle.
//!
//! Every test drives a [`Sane`] session backed by the in-process virtual
//! scanner, so the full path is covered: caller futures, the worker thread,
//! option refreshes and the acquisition pipeline.
//!
//! # Running
//!
//! ```bash
//! cargo test --test session_integration -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use sane_client::backend::virtual_scanner::{CallLog, SOURCE_ADF};
use sane_client::{
    CredentialStore, Device, DeviceAuthentication, DeviceOption, FeederHeuristic, NewValue,
    OptionValue, Sane, SaneConfig, SaneError, SaneEvent, ScanCanceller, ScanOperation,
    StandardOption, Status, VirtualBackend,
};
use tokio::sync::mpsc;

fn spawn(backend: VirtualBackend) -> (Sane, mpsc::UnboundedReceiver<SaneEvent>, CallLog) {
    let log = backend.call_log();
    let (sane, events) = Sane::spawn(backend, SaneConfig::default());
    (sane, events, log)
}

async fn first_device(sane: &Sane) -> Device {
    let devices = sane.update_devices().await.expect("device list");
    devices.into_iter().next().expect("one device")
}

async fn opened(backend: VirtualBackend) -> (Sane, Device, CallLog) {
    let (sane, _events, log) = spawn(backend);
    let device = first_device(&sane).await;
    sane.open_device(&device, true).await.expect("open");
    (sane, device, log)
}

fn option(device: &Device, standard: StandardOption) -> DeviceOption {
    device.option(standard).expect("standard option present")
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ScanOperation>) -> Vec<ScanOperation> {
    let mut ops = Vec::new();
    while let Ok(op) = rx.try_recv() {
        ops.push(op);
    }
    ops
}

// =============================================================================
// Devices and lifecycle
// =============================================================================

#[tokio::test]
async fn test_device_update_reports_start_and_finish() {
    let (sane, mut events, log) = spawn(VirtualBackend::new());

    let devices = sane.update_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name(), "test:0");
    assert_eq!(devices[0].vendor(), "Noname");
    assert!(!sane.is_updating_devices());

    assert!(matches!(events.recv().await, Some(SaneEvent::DevicesUpdateStarted)));
    assert!(matches!(events.recv().await, Some(SaneEvent::DevicesUpdateFinished)));
    // Started for the update only.
    assert_eq!(log.count("exit"), 1);
    assert_eq!(sane.backend_version().map(|v| v.to_string()).as_deref(), Some("1.0.3"));
}

#[tokio::test]
async fn test_init_failure_is_exposed() {
    let (sane, _events, _log) = spawn(VirtualBackend::new().fail_once("init", Status::IoError));
    let err = sane.update_devices().await.unwrap_err();
    assert_eq!(err.status(), Some(Status::IoError));
    assert!(sane.init_error().is_some());

    sane.start().await.unwrap();
    assert_eq!(sane.init_error(), None);
}

#[tokio::test]
async fn test_backend_stays_up_while_device_open() {
    let (sane, device, log) = opened(VirtualBackend::new()).await;
    assert!(sane.is_device_opened(&device));

    sane.stop().await.unwrap();
    assert_eq!(log.count("exit"), 1, "only the device update stopped the backend");

    sane.close_device(&device).await.unwrap();
    assert!(!sane.is_device_opened(&device));
    assert_eq!(log.count("exit"), 2);
}

#[tokio::test]
async fn test_unopened_device_is_rejected() {
    let (sane, _events, _log) = spawn(VirtualBackend::new());
    let device = first_device(&sane).await;
    assert!(matches!(
        sane.list_options(&device).await,
        Err(SaneError::DeviceNotOpened)
    ));
    let (progress, _rx) = mpsc::unbounded_channel();
    assert!(matches!(
        sane.scan(&device, false, progress).await,
        Err(SaneError::DeviceNotOpened)
    ));
}

#[tokio::test]
async fn test_configuration_roundtrip() {
    let (sane, _events, _log) = spawn(VirtualBackend::new());
    let mut config = sane.configuration();
    config.show_incomplete_scan_images = false;
    sane.set_configuration(config.clone()).unwrap();
    assert_eq!(sane.configuration(), config);
}

// =============================================================================
// Options
// =============================================================================

#[tokio::test]
async fn test_write_then_read_returns_written_value() {
    let (sane, device, _log) = opened(VirtualBackend::new()).await;
    let resolution = option(&device, StandardOption::Resolution);

    let info = sane
        .update_option(&device, &resolution, OptionValue::Int(30))
        .await
        .unwrap();
    assert!(!info.is_inexact());
    assert_eq!(
        sane.value_for_option(&device, &resolution).await.unwrap(),
        OptionValue::Int(30)
    );
    assert_eq!(
        option(&device, StandardOption::Resolution).value(),
        Some(OptionValue::Int(30))
    );
}

#[tokio::test]
async fn test_listing_twice_gives_same_options() {
    let (sane, device, _log) = opened(VirtualBackend::new()).await;
    let first = sane.list_options(&device).await.unwrap();
    let second = sane.list_options(&device).await.unwrap();
    assert_eq!(*first, *second);
}

#[tokio::test]
async fn test_reload_is_visible_when_write_completes() {
    let (sane, device, _log) = opened(VirtualBackend::new()).await;
    let depth = device.option_named("depth").unwrap();
    assert!(depth.capabilities().is_active());

    let info = sane
        .update_option(
            &device,
            &option(&device, StandardOption::Mode),
            OptionValue::String("Lineart".into()),
        )
        .await
        .unwrap();
    assert!(info.reload_options());

    let depth = device.option_named("depth").unwrap();
    assert!(!depth.capabilities().is_active());
    assert_eq!(
        option(&device, StandardOption::Mode).value(),
        Some(OptionValue::String("Lineart".into()))
    );
}

#[tokio::test]
async fn test_auto_rejected_without_backend_call() {
    let (sane, device, log) = opened(VirtualBackend::new()).await;
    log.clear();

    let err = sane
        .update_option(&device, &option(&device, StandardOption::Resolution), NewValue::Auto)
        .await
        .unwrap_err();
    assert!(matches!(err, SaneError::AutoValueUnsupported));
    assert_eq!(log.count("set"), 0);
}

#[tokio::test]
async fn test_auto_mode_goes_to_backend() {
    let (sane, device, log) = opened(VirtualBackend::new()).await;
    sane.update_option(&device, &option(&device, StandardOption::Mode), NewValue::Auto)
        .await
        .unwrap();
    assert_eq!(log.count("set_auto mode"), 1);
}

#[tokio::test]
async fn test_invalid_writes_are_rejected_early() {
    let (sane, device, log) = opened(VirtualBackend::new()).await;
    sane.update_option(
        &device,
        &option(&device, StandardOption::Mode),
        OptionValue::String("Lineart".into()),
    )
    .await
    .unwrap();
    log.clear();

    let group = device.options()[0].clone();
    assert!(matches!(
        sane.update_option(&device, &group, OptionValue::Int(1)).await,
        Err(SaneError::InvalidOperationForOptionKind { .. })
    ));
    let depth = device.option_named("depth").unwrap();
    assert!(matches!(
        sane.update_option(&device, &depth, OptionValue::Int(16)).await,
        Err(SaneError::InactiveOption)
    ));
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn test_backend_rejection_is_reported() {
    let (sane, device, _log) = opened(VirtualBackend::new()).await;
    let err = sane
        .update_option(
            &device,
            &option(&device, StandardOption::Mode),
            OptionValue::String("Infrared".into()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::Invalid));
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_authentication_request_is_answered() {
    let (sane, mut events, log) = spawn(VirtualBackend::new().require_auth("scan", "secret"));
    let device = first_device(&sane).await;

    let answered = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let SaneEvent::AuthenticationRequired(request) = event {
                assert_eq!(request.device_name(), "test:0");
                request.respond(Some(DeviceAuthentication {
                    username: "scan".into(),
                    password: "secret".into(),
                }));
                return true;
            }
        }
        false
    });

    sane.open_device(&device, true).await.unwrap();
    assert!(answered.await.unwrap());
    assert_eq!(log.count("denied"), 0);
}

#[tokio::test]
async fn test_declined_authentication_fails_open() {
    let (sane, mut events, _log) = spawn(VirtualBackend::new().require_auth("scan", "secret"));
    let device = first_device(&sane).await;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let SaneEvent::AuthenticationRequired(request) = event {
                drop(request);
            }
        }
    });

    let err = sane.open_device(&device, true).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::AccessDenied));
    assert!(!sane.is_device_opened(&device));
}

struct StaticCredentials;

impl CredentialStore for StaticCredentials {
    fn credentials(&self, _device_name: &str) -> Option<DeviceAuthentication> {
        Some(DeviceAuthentication {
            username: "scan".into(),
            password: "secret".into(),
        })
    }
}

#[tokio::test]
async fn test_credential_store_answers_first() {
    let (sane, mut events) = Sane::builder(VirtualBackend::new().require_auth("scan", "secret"))
        .credential_store(StaticCredentials)
        .spawn();
    let device = first_device(&sane).await;
    sane.open_device(&device, false).await.unwrap();

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SaneEvent::AuthenticationRequired(_)));
    }
}

// =============================================================================
// Acquisition
// =============================================================================

#[tokio::test]
async fn test_scan_reports_progress_then_clears_status() {
    let (sane, device, log) = opened(VirtualBackend::new()).await;
    let (progress, mut rx) = mpsc::unbounded_channel();

    let pages = sane.scan(&device, false, progress).await.unwrap();
    assert_eq!(pages.len(), 1);
    // 215 x 297 mm at 10 dpi.
    assert_eq!((pages[0].image.width(), pages[0].image.height()), (84, 116));
    assert_eq!(pages[0].image.to_rgb8().get_pixel(3, 4).0, [3, 4, 7]);

    let ops = drain(&mut rx);
    assert!(matches!(ops.first(), Some(ScanOperation::WarmingUp)));
    assert_eq!(ops.last().and_then(|op| op.progress()), Some(1.0));
    assert!(sane.device_status(&device).is_none());
    assert_eq!(log.count("cancel"), 1);
    assert!(device.last_preview().is_some());
}

#[tokio::test]
async fn test_sixteen_bit_gray_scan() {
    let (sane, device, _log) = opened(VirtualBackend::new()).await;
    sane.update_option(
        &device,
        &option(&device, StandardOption::Mode),
        OptionValue::String("Gray".into()),
    )
    .await
    .unwrap();
    let depth = device.option_named("depth").unwrap();
    sane.update_option(&device, &depth, OptionValue::Int(16))
        .await
        .unwrap();

    let (progress, _rx) = mpsc::unbounded_channel();
    let pages = sane.scan(&device, false, progress).await.unwrap();
    let gray = pages[0].image.to_luma16();
    assert_eq!(gray.get_pixel(2, 3).0, [5 * 257]);
}

#[tokio::test]
async fn test_cancel_from_another_thread() {
    let slot: Arc<Mutex<Option<ScanCanceller>>> = Arc::new(Mutex::new(None));
    let hook_slot = Arc::clone(&slot);
    let backend = VirtualBackend::new().on_start(move || {
        if let Some(canceller) = hook_slot.lock().unwrap().take() {
            std::thread::spawn(move || canceller.cancel()).join().unwrap();
        }
    });
    let (sane, device, log) = opened(backend).await;
    *slot.lock().unwrap() = Some(sane.canceller());
    log.clear();

    let (progress, mut rx) = mpsc::unbounded_channel();
    let err = sane.scan(&device, false, progress).await.unwrap_err();
    assert!(matches!(err, SaneError::Cancelled));
    assert!(log.count("read") <= 1);
    assert_eq!(log.count("cancel"), 1);
    assert!(matches!(drain(&mut rx).last(), Some(ScanOperation::Cancelling)));

    // The latch does not outlive the cancelled scan.
    let (progress, _rx) = mpsc::unbounded_channel();
    assert_eq!(sane.scan(&device, false, progress).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_before_scan_is_dropped() {
    let (sane, device, _log) = opened(VirtualBackend::new()).await;
    sane.cancel_current_scan();

    let (progress, _rx) = mpsc::unbounded_channel();
    assert_eq!(sane.scan(&device, false, progress).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_preview_restores_settings() {
    let (sane, device, _log) = opened(VirtualBackend::new().without_preview_option()).await;
    let (progress, _rx) = mpsc::unbounded_channel();

    let image = sane.preview(&device, progress).await.unwrap();
    assert!(image.width() > 84);
    assert_eq!(
        option(&device, StandardOption::Resolution).value(),
        Some(OptionValue::Int(10))
    );
    assert!(device.last_preview().is_some());
}

#[tokio::test]
async fn test_close_clears_cached_state() {
    let (sane, device, _log) = opened(VirtualBackend::new()).await;
    let (progress, _rx) = mpsc::unbounded_channel();
    sane.preview(&device, progress).await.unwrap();
    assert!(device.last_preview().is_some());

    sane.close_device(&device).await.unwrap();
    assert!(device.last_preview().is_none());
    assert!(sane.device_status(&device).is_none());
}

#[tokio::test]
async fn test_feeder_pages_until_empty() {
    let (sane, device, _log) = opened(VirtualBackend::new().feeder_pages(2)).await;
    sane.update_option(
        &device,
        &option(&device, StandardOption::Source),
        OptionValue::String(SOURCE_ADF.into()),
    )
    .await
    .unwrap();
    assert!(sane.is_using_feeder(&device));

    let (progress, _rx) = mpsc::unbounded_channel();
    let pages = sane.scan(&device, false, progress).await.unwrap();
    assert_eq!(pages.len(), 2);
}

struct NeverFeeder;

impl FeederHeuristic for NeverFeeder {
    fn is_using_feeder(&self, _device: &Device) -> bool {
        false
    }
}

#[tokio::test]
async fn test_feeder_heuristic_is_pluggable() {
    let (sane, _events) = Sane::builder(VirtualBackend::new().feeder_pages(3))
        .feeder_heuristic(NeverFeeder)
        .spawn();
    let device = first_device(&sane).await;
    sane.open_device(&device, true).await.unwrap();
    sane.update_option(
        &device,
        &option(&device, StandardOption::Source),
        OptionValue::String(SOURCE_ADF.into()),
    )
    .await
    .unwrap();
    assert!(!sane.is_using_feeder(&device));

    let (progress, _rx) = mpsc::unbounded_channel();
    assert_eq!(sane.scan(&device, false, progress).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_worker_survives_backend_panic() {
    let armed = Arc::new(AtomicBool::new(true));
    let hook_armed = Arc::clone(&armed);
    let backend = VirtualBackend::new().on_start(move || {
        if hook_armed.swap(false, Ordering::SeqCst) {
            panic!("simulated driver crash");
        }
    });
    let (sane, device, _log) = opened(backend).await;

    let (progress, _rx) = mpsc::unbounded_channel();
    assert!(matches!(
        sane.scan(&device, false, progress).await,
        Err(SaneError::WorkerUnavailable)
    ));

    // Later requests are still served.
    assert!(!sane.list_options(&device).await.unwrap().is_empty());
}
