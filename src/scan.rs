//! Acquisition pipeline.
//!
//! Runs on the worker thread. A scan is a sequence of pages (more than one
//! only with a document feeder); a page is one frame, or three frames for
//! backends that deliver red, green and blue in separate passes. Every byte
//! read goes into the page buffer, and progress is pushed to the caller's
//! channel after each read.
//!
//! ```text
//! start ─▶ set_io_mode(blocking) ─▶ parameters ─▶ read … read ─▶ EOF
//!   ▲                                                             │
//!   └─────────── next frame (three-pass) / next page (feeder) ◀───┘
//! ```
//!
//! The backend's `cancel` is called exactly once per acquisition, after the
//! last page, or from the read loop when the cancel latch is set.

use image::DynamicImage;
use tokio::sync::mpsc::UnboundedSender;

use crate::assembly::{image_from_buffer, interleaved_offset, pad_partial, PARTIAL_FILLER};
use crate::backend::HandleId;
use crate::error::{Result, SaneError, Status};
use crate::models::{CropArea, Device, FrameKind, ScanOperation, ScanParameters, ScannedImage};
use crate::options::{DeviceOption, NewValue, OptionValue, StandardOption};
use crate::worker::Worker;

/// Smallest read buffer; larger frames read in 1% steps.
const MIN_READ_CHUNK: usize = 500_000;

/// Partial previews are generated every 1/PREVIEW_STEPS of the scan.
const PREVIEW_STEPS: usize = 20;

/// Full scans above this size are not kept as the device's last preview.
const MAX_CACHED_SCAN_BYTES: usize = 30 * 1024 * 1024;

/// Progress state carried across the frames of one page.
struct PageProgress<'a> {
    device: &'a Device,
    sink: &'a UnboundedSender<ScanOperation>,
    show_previews: bool,
    last_preview_step: usize,
    /// Complete lines shown by the last partial image of a frame whose
    /// height is unknown.
    last_preview_lines: usize,
}

impl PageProgress<'_> {
    fn report(&self, operation: ScanOperation) {
        report(self.device, self.sink, operation);
    }
}

fn report(device: &Device, sink: &UnboundedSender<ScanOperation>, operation: ScanOperation) {
    device.set_operation(Some(operation.clone()));
    // A caller that stopped listening still gets the final result.
    let _ = sink.send(operation);
}

/// One frame read to EOF. `data` is `None` when the bytes went into the
/// interleaved three-pass buffer.
struct Frame {
    parameters: ScanParameters,
    data: Option<Vec<u8>>,
}

impl Worker {
    // -------------------------------------------------------------------------
    // Preview
    // -------------------------------------------------------------------------

    /// Low resolution scan of the whole area.
    pub(crate) fn preview(
        &mut self,
        device: &Device,
        progress: &UnboundedSender<ScanOperation>,
    ) -> Result<DynamicImage> {
        let handle = self.handle_for(device)?;
        self.shared.reset_cancel();
        report(device, progress, ScanOperation::WarmingUp);

        let toggle = device
            .option(StandardOption::Preview)
            .filter(|o| o.capabilities().is_settable() && o.capabilities().is_active());
        let saved = match &toggle {
            Some(option) => self.enter_preview_toggle(device, option),
            None => self.apply_preview_overrides(device),
        };

        let crop = device.max_crop_area();
        let result = self.acquire_page(device, handle, crop, progress);
        self.finish_acquisition(device, handle, &result);

        for (standard, value) in saved.into_iter().rev() {
            self.restore_option(device, standard, value);
        }

        let page = result?;
        let auto_color_gray = toggle.is_none()
            && self.config.preview_with_auto_color_mode
            && page.parameters.frame_kind == FrameKind::Gray;
        if !auto_color_gray {
            device.set_last_preview(Some(page.image.clone()));
        }
        tracing::info!(
            "Preview of {} done: {}x{}",
            device.name(),
            page.parameters.width,
            page.parameters.height
        );
        Ok(page.image)
    }

    fn enter_preview_toggle(
        &mut self,
        device: &Device,
        option: &DeviceOption,
    ) -> Vec<(StandardOption, OptionValue)> {
        match self.update_option(device, option, NewValue::Value(OptionValue::Bool(true))) {
            Ok(_) => vec![(StandardOption::Preview, OptionValue::Bool(false))],
            Err(e) => {
                tracing::warn!("Could not enable preview mode on {}: {}", device.name(), e);
                Vec::new()
            }
        }
    }

    /// Push preview-friendly values into the standard options and return
    /// what they were before. Options are looked up again for every write
    /// since a write may reload the list.
    fn apply_preview_overrides(&mut self, device: &Device) -> Vec<(StandardOption, OptionValue)> {
        let mut saved = Vec::new();
        for standard in StandardOption::preview_overrides(self.config.preview_with_auto_color_mode)
        {
            let Some(option) = device.option(standard) else {
                continue;
            };
            let caps = option.capabilities();
            if !caps.is_settable() || !caps.is_active() {
                continue;
            }
            let (Some(best), Some(current)) = (standard.best_preview_value(&option), option.value())
            else {
                continue;
            };
            if best == NewValue::Value(current.clone()) {
                continue;
            }
            match self.update_option(device, &option, best) {
                Ok(_) => saved.push((standard, current)),
                Err(e) => tracing::warn!(
                    "Could not set {} for preview: {}",
                    standard.identifier(),
                    e
                ),
            }
        }
        saved
    }

    fn restore_option(&mut self, device: &Device, standard: StandardOption, value: OptionValue) {
        let Some(option) = device.option(standard) else {
            tracing::warn!("{} disappeared before it could be restored", standard.identifier());
            return;
        };
        if let Err(e) = self.update_option(device, &option, NewValue::Value(value)) {
            tracing::warn!("Could not restore {}: {}", standard.identifier(), e);
        }
    }

    // -------------------------------------------------------------------------
    // Scan
    // -------------------------------------------------------------------------

    /// Full scan. With a document feeder, pages are acquired until the
    /// feeder runs empty.
    pub(crate) fn scan(
        &mut self,
        device: &Device,
        use_crop: bool,
        progress: &UnboundedSender<ScanOperation>,
    ) -> Result<Vec<ScannedImage>> {
        let handle = self.handle_for(device)?;
        self.shared.reset_cancel();
        report(device, progress, ScanOperation::WarmingUp);

        let max_area = device.max_crop_area();
        let crop = if use_crop && device.can_crop() {
            let area = device.crop_area();
            if let Some(area) = area {
                if let Err(e) = self.apply_crop(device, area) {
                    device.set_operation(None);
                    return Err(e);
                }
            }
            area
        } else {
            max_area
        };

        let using_feeder = self.feeder.is_using_feeder(device);
        let mut pages: Vec<ScannedImage> = Vec::new();
        let outcome = loop {
            if !pages.is_empty() {
                report(device, progress, ScanOperation::WarmingUp);
            }
            match self.acquire_page(device, handle, crop, progress) {
                Ok(page) => {
                    tracing::debug!("Page {} of {} done", pages.len() + 1, device.name());
                    pages.push(page);
                    if !using_feeder {
                        break Ok(());
                    }
                }
                Err(e) if e.status() == Some(Status::NoDocs) && !pages.is_empty() => {
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };
        self.finish_acquisition(device, handle, &outcome);
        outcome?;

        if let Some(first) = pages.first() {
            if crop == max_area && first.parameters.image_size() < MAX_CACHED_SCAN_BYTES {
                device.set_last_preview(Some(first.image.clone()));
            }
        }
        tracing::info!("Scanned {} page(s) on {}", pages.len(), device.name());
        Ok(pages)
    }

    fn apply_crop(&mut self, device: &Device, area: CropArea) -> Result<()> {
        let targets = [
            (StandardOption::TopLeftX, area.x),
            (StandardOption::TopLeftY, area.y),
            (StandardOption::BottomRightX, area.max_x()),
            (StandardOption::BottomRightY, area.max_y()),
        ];
        for (standard, target) in targets {
            let Some(option) = device.option(standard) else {
                continue;
            };
            let value = match option {
                DeviceOption::Int(_) => OptionValue::Int(target.round() as i32),
                _ => OptionValue::Fixed(target),
            };
            self.update_option(device, &option, NewValue::Value(value))?;
        }
        Ok(())
    }

    /// Terminal cancel, unless the read loop already sent one.
    fn finish_acquisition<T>(&mut self, device: &Device, handle: HandleId, outcome: &Result<T>) {
        if !matches!(outcome, Err(e) if e.is_cancelled()) {
            self.backend.cancel(handle);
        }
        device.set_operation(None);
    }

    // -------------------------------------------------------------------------
    // Pages and frames
    // -------------------------------------------------------------------------

    fn acquire_page(
        &mut self,
        device: &Device,
        handle: HandleId,
        crop: Option<CropArea>,
        sink: &UnboundedSender<ScanOperation>,
    ) -> Result<ScannedImage> {
        let mut progress = PageProgress {
            device,
            sink,
            show_previews: self.config.show_incomplete_scan_images,
            last_preview_step: 0,
            last_preview_lines: 0,
        };
        let mut combined: Option<Vec<u8>> = None;

        let frame = loop {
            let frame = self.acquire_frame(handle, crop, &mut progress, &mut combined)?;
            let kind = frame.parameters.frame_kind;
            if kind.is_single_channel_of_rgb() && !frame.parameters.is_last_frame {
                tracing::debug!("Frame {:?} done, next pass", kind);
                continue;
            }
            break frame;
        };

        let data = match (&frame.data, &combined) {
            (Some(data), _) => data,
            (None, Some(combined)) => combined,
            (None, None) => return Err(SaneError::NoImageData),
        };
        let image = image_from_buffer(&frame.parameters, data)?;
        Ok(ScannedImage {
            image,
            parameters: frame.parameters,
        })
    }

    fn acquire_frame(
        &mut self,
        handle: HandleId,
        crop: Option<CropArea>,
        progress: &mut PageProgress<'_>,
        combined: &mut Option<Vec<u8>>,
    ) -> Result<Frame> {
        crate::backend::timed("sane_start", || self.backend.start(handle))?;
        match self.backend.set_io_mode(handle, false) {
            Err(e) if e.status() == Some(Status::Unsupported) => {}
            other => other?,
        }
        let raw = self.backend.parameters(handle)?;
        let mut parameters = ScanParameters::from_frame(&raw, crop);
        let height_known = raw.lines >= 0;
        if parameters.bytes_per_line == 0 || (height_known && parameters.file_size() == 0) {
            return Err(SaneError::NoImageData);
        }
        tracing::debug!(
            "Frame {:?}: {}x{} depth {} ({} bytes/line)",
            parameters.frame_kind,
            parameters.width,
            if height_known { raw.lines.to_string() } else { "?".to_string() },
            parameters.depth,
            parameters.bytes_per_line
        );

        let expected = if height_known { parameters.file_size() } else { 0 };
        let channel = parameters
            .frame_kind
            .is_single_channel_of_rgb()
            .then(|| parameters.frame_kind.channel_index())
            .flatten();
        if channel.is_some() && combined.is_none() {
            // Passes still to come show as filler in partial images.
            *combined = Some(vec![PARTIAL_FILLER; expected * 3]);
        }
        progress.last_preview_lines = 0;
        let invert = parameters.frame_kind == FrameKind::Gray && parameters.depth == 1;

        let mut data = Vec::with_capacity(if channel.is_none() { expected } else { 0 });
        let mut buf = vec![0u8; MIN_READ_CHUNK.max(expected / 100)];
        let mut read_total = 0usize;

        let end = loop {
            if self.shared.is_cancel_requested() {
                progress.report(ScanOperation::Cancelling);
                tracing::info!("Cancelling scan");
                self.backend.cancel(handle);
                return Err(SaneError::Cancelled);
            }
            let n = match self.backend.read(handle, &mut buf) {
                Ok(n) => n,
                Err(e) => break e,
            };
            if n == 0 {
                continue;
            }
            let chunk = &mut buf[..n];
            if invert {
                // Lineart comes with 1 meaning black.
                chunk.iter_mut().for_each(|b| *b = !*b);
            }
            match (channel, combined.as_mut()) {
                (Some(c), Some(target)) => {
                    for (i, byte) in chunk.iter().enumerate() {
                        let offset = interleaved_offset(read_total + i, c, parameters.depth);
                        if offset >= target.len() {
                            target.resize(offset + 1, PARTIAL_FILLER);
                        }
                        target[offset] = *byte;
                    }
                }
                _ => data.extend_from_slice(chunk),
            }
            read_total += n;

            let buffer: &[u8] = match (channel, combined.as_ref()) {
                (Some(_), Some(target)) => target,
                _ => &data,
            };
            if height_known {
                report_progress(
                    progress,
                    &parameters,
                    channel,
                    read_total,
                    expected,
                    buffer,
                );
            } else {
                report_growing_frame(progress, &parameters, read_total, buffer);
            }
        };
        if end.status() != Some(Status::Eof) {
            return Err(end);
        }

        if !height_known || read_total < expected {
            parameters.height = read_total / parameters.bytes_per_line;
            tracing::debug!("Frame height revised to {} lines", parameters.height);
        }
        Ok(Frame {
            parameters,
            data: channel.is_none().then_some(data),
        })
    }
}

/// Send a progress update, with a partial image each time the scan crosses
/// into a new 1/PREVIEW_STEPS step.
fn report_progress(
    progress: &mut PageProgress<'_>,
    parameters: &ScanParameters,
    channel: Option<usize>,
    read_total: usize,
    expected: usize,
    buffer: &[u8],
) {
    let (done, total) = match channel {
        Some(c) => (c * expected + read_total, 3 * expected),
        None => (read_total, expected),
    };
    let done = done.min(total);
    let step = done * PREVIEW_STEPS / total;

    let mut preview = None;
    if progress.show_previews && step > progress.last_preview_step {
        progress.last_preview_step = step;
        let padded = pad_partial(buffer, parameters.image_size());
        match image_from_buffer(parameters, &padded) {
            Ok(image) => preview = Some(image),
            Err(e) => tracing::debug!("No partial image: {}", e),
        }
    }
    progress.report(ScanOperation::Scanning {
        progress: done as f32 / total as f32,
        preview,
    });
}

/// Progress of a frame whose height is only known at EOF: always 0.0, with
/// a partial image whenever more complete lines have arrived.
fn report_growing_frame(
    progress: &mut PageProgress<'_>,
    parameters: &ScanParameters,
    read_total: usize,
    buffer: &[u8],
) {
    let lines = read_total / parameters.bytes_per_line;
    let mut preview = None;
    if progress.show_previews && lines > progress.last_preview_lines {
        progress.last_preview_lines = lines;
        let received = ScanParameters {
            height: lines,
            ..*parameters
        };
        let padded = pad_partial(buffer, received.image_size());
        match image_from_buffer(&received, &padded) {
            Ok(image) => preview = Some(image),
            Err(e) => tracing::debug!("No partial image: {}", e),
        }
    }
    progress.report(ScanOperation::Scanning {
        progress: 0.0,
        preview,
    });
}
