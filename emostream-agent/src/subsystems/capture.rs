//! Capture subsystem: camera frames at a bounded rate
//!
//! The controller owns one camera handle at a time. Once capturing, a
//! cooperative loop ticks at `tick_interval` (roughly display refresh) and
//! only grabs + encodes a frame when `frame_interval` has elapsed since the
//! previous emitted one, so latency stays low without oversampling.
//!
//! Grabbing and JPEG encoding run on the blocking pool; the loop itself never
//! blocks the runtime.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use emostream_core::config::CaptureConfig;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Types
// ============================================================================

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("camera permission denied")]
    PermissionDenied,

    #[error("no camera acquired")]
    NotAcquired,

    #[error("frame grab failed: {0}")]
    Grab(String),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Requested camera settings. Devices may deliver a different size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub facing_mode: String,
}

impl CaptureConstraints {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            facing_mode: config.facing_mode.clone(),
        }
    }

    /// Narrow viewports get the compact resolution.
    pub fn for_viewport(config: &CaptureConfig, viewport_width: Option<u32>) -> Self {
        match viewport_width {
            Some(width) if width < config.compact_breakpoint => Self {
                width: config.compact_width,
                height: config.compact_height,
                facing_mode: config.facing_mode.clone(),
            },
            _ => Self::from_config(config),
        }
    }
}

/// One encoded still image plus its capture index.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub tick_interval: Duration,
    /// 1..=100
    pub jpeg_quality: u8,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            jpeg_quality: config.jpeg_quality_percent(),
        }
    }
}

// ============================================================================
// Device traits
// ============================================================================

/// A camera that can be opened for exclusive use.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    async fn open(&self, constraints: &CaptureConstraints)
        -> Result<Box<dyn VideoSource>, CaptureError>;

    /// Device name for logging.
    fn name(&self) -> &str;
}

/// An open camera handle. `close` must be idempotent.
pub trait VideoSource: Send {
    fn grab(&mut self) -> Result<RgbImage, CaptureError>;
    fn close(&mut self);
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let mut bytes = Vec::with_capacity((image.width() * image.height()) as usize / 4);
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    encoder.encode_image(image)?;
    Ok(bytes)
}

// ============================================================================
// CaptureController
// ============================================================================

/// Pause flag that also guards frame hand-off: once `set(true)` returns, the
/// callback is not entered again until `set(false)`.
#[derive(Debug, Clone, Default)]
struct PauseGate(Arc<Mutex<bool>>);

impl PauseGate {
    fn set(&self, paused: bool) {
        *self.lock() = paused;
    }

    fn is_paused(&self) -> bool {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct CaptureWorker {
    cancel: CancellationToken,
    handle: JoinHandle<Option<Box<dyn VideoSource>>>,
}

pub struct CaptureController {
    device: Arc<dyn CameraDevice>,
    settings: CaptureSettings,
    /// Held between acquire and release while no loop is running.
    source: Option<Box<dyn VideoSource>>,
    /// Owns the source while the loop runs; hands it back on stop.
    worker: Option<CaptureWorker>,
    paused: PauseGate,
    emitted: Arc<AtomicU64>,
}

impl CaptureController {
    pub fn new(device: Arc<dyn CameraDevice>, settings: CaptureSettings) -> Self {
        Self {
            device,
            settings,
            source: None,
            worker: None,
            paused: PauseGate::default(),
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<(), CaptureError> {
        if self.is_acquired() {
            tracing::debug!(device = self.device.name(), "Camera already acquired");
            return Ok(());
        }

        let source = self.device.open(constraints).await?;
        tracing::info!(
            device = self.device.name(),
            width = constraints.width,
            height = constraints.height,
            facing_mode = %constraints.facing_mode,
            "Camera acquired"
        );
        self.source = Some(source);
        Ok(())
    }

    pub fn is_acquired(&self) -> bool {
        self.source.is_some() || self.worker.is_some()
    }

    pub fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }

    /// Start the capture loop; `on_frame` is invoked at most once per `interval`.
    pub fn start_capturing<F>(&mut self, on_frame: F, interval: Duration) -> Result<(), CaptureError>
    where
        F: FnMut(Frame) + Send + 'static,
    {
        if self.worker.is_some() {
            tracing::debug!("Capture loop already running");
            return Ok(());
        }
        let source = self.source.take().ok_or(CaptureError::NotAcquired)?;

        self.paused.set(false);
        self.emitted.store(0, Ordering::Release);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(capture_loop(
            source,
            on_frame,
            interval,
            self.settings,
            self.paused.clone(),
            self.emitted.clone(),
            cancel.clone(),
        ));
        self.worker = Some(CaptureWorker { cancel, handle });

        tracing::info!(interval_ms = interval.as_millis() as u64, "Capture loop started");
        Ok(())
    }

    /// Suppress emission. A frame already being handed off completes first;
    /// none is handed off after this returns.
    pub fn pause(&self) {
        self.paused.set(true);
    }

    pub fn resume(&self) {
        self.paused.set(false);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_paused()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Acquire)
    }

    /// Stop the loop but keep the camera. No frame is emitted after this returns.
    pub async fn stop_capturing(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.cancel.cancel();
        match worker.handle.await {
            Ok(Some(source)) => self.source = Some(source),
            Ok(None) => tracing::warn!("Capture loop lost its camera handle"),
            Err(e) => tracing::error!(error = %e, "Capture loop task failed"),
        }
        tracing::debug!(frames = self.frames_emitted(), "Capture loop stopped");
    }

    /// Stop the loop and close the camera. Safe to call in any state.
    pub async fn release(&mut self) {
        self.stop_capturing().await;
        if let Some(mut source) = self.source.take() {
            source.close();
            tracing::info!(device = self.device.name(), "Camera released");
        }
    }
}

async fn capture_loop<F>(
    mut source: Box<dyn VideoSource>,
    mut on_frame: F,
    interval: Duration,
    settings: CaptureSettings,
    paused: PauseGate,
    emitted: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Option<Box<dyn VideoSource>>
where
    F: FnMut(Frame) + Send + 'static,
{
    let mut ticker = time::interval(settings.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_emit: Option<Instant> = None;
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if paused.is_paused() {
                    continue;
                }
                if last_emit.is_some_and(|last| last.elapsed() < interval) {
                    continue;
                }
                last_emit = Some(Instant::now());

                let quality = settings.jpeg_quality;
                let joined = tokio::task::spawn_blocking(move || {
                    let encoded = source.grab().and_then(|image| encode_jpeg(&image, quality));
                    (source, encoded)
                })
                .await;

                let encoded = match joined {
                    Ok((returned, encoded)) => {
                        source = returned;
                        encoded
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Capture worker panicked");
                        return None;
                    }
                };

                // Shutdown may have started while encoding.
                if cancel.is_cancelled() {
                    continue;
                }

                match encoded {
                    Ok(bytes) => {
                        if hand_off(&paused, &mut on_frame, Frame { sequence, bytes }) {
                            sequence += 1;
                            emitted.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Frame capture failed, skipping"),
                }
            }
        }
    }

    Some(source)
}

/// Deliver `frame` unless paused; the gate stays locked for the call.
fn hand_off<F: FnMut(Frame)>(gate: &PauseGate, on_frame: &mut F, frame: Frame) -> bool {
    let paused = gate.lock();
    if *paused {
        return false;
    }
    on_frame(frame);
    true
}

// ============================================================================
// Devices
// ============================================================================

/// Exclusive-use flag shared between a device and its open handle.
#[derive(Debug, Clone, Default)]
struct DeviceLease(Arc<AtomicBool>);

impl DeviceLease {
    fn try_take(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn give_back(&self) {
        self.0.store(false, Ordering::Release);
    }

    fn is_taken(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Moving test-pattern camera; stands in when no real device is wired up.
#[derive(Debug, Default)]
pub struct SyntheticCamera {
    lease: DeviceLease,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_use(&self) -> bool {
        self.lease.is_taken()
    }
}

#[async_trait]
impl CameraDevice for SyntheticCamera {
    async fn open(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn VideoSource>, CaptureError> {
        if !self.lease.try_take() {
            return Err(CaptureError::DeviceUnavailable(
                "camera already in use".to_string(),
            ));
        }
        Ok(Box::new(SyntheticSource {
            width: constraints.width.max(1),
            height: constraints.height.max(1),
            frame: 0,
            lease: Some(self.lease.clone()),
        }))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

struct SyntheticSource {
    width: u32,
    height: u32,
    frame: u32,
    lease: Option<DeviceLease>,
}

impl VideoSource for SyntheticSource {
    fn grab(&mut self) -> Result<RgbImage, CaptureError> {
        if self.lease.is_none() {
            return Err(CaptureError::Grab("source closed".to_string()));
        }
        let shift = self.frame;
        self.frame = self.frame.wrapping_add(3);
        Ok(RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                (x.wrapping_add(shift) % 256) as u8,
                (y.wrapping_add(shift / 2) % 256) as u8,
                128,
            ])
        }))
    }

    fn close(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.give_back();
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Replays one still image, scaled to the requested size, as every frame.
#[derive(Debug)]
pub struct ImageFileCamera {
    path: PathBuf,
    lease: DeviceLease,
}

impl ImageFileCamera {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lease: DeviceLease::default(),
        }
    }
}

#[async_trait]
impl CameraDevice for ImageFileCamera {
    async fn open(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn VideoSource>, CaptureError> {
        if !self.lease.try_take() {
            return Err(CaptureError::DeviceUnavailable(
                "camera already in use".to_string(),
            ));
        }

        let path = self.path.clone();
        let (width, height) = (constraints.width.max(1), constraints.height.max(1));
        let loaded = tokio::task::spawn_blocking(move || {
            image::open(&path).map(|img| imageops::resize(&img.to_rgb8(), width, height, FilterType::Triangle))
        })
        .await;

        let image = match loaded {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                self.lease.give_back();
                return Err(CaptureError::DeviceUnavailable(format!(
                    "{}: {e}",
                    self.path.display()
                )));
            }
            Err(e) => {
                self.lease.give_back();
                return Err(CaptureError::DeviceUnavailable(e.to_string()));
            }
        };

        Ok(Box::new(StillSource {
            image,
            lease: Some(self.lease.clone()),
        }))
    }

    fn name(&self) -> &str {
        "image-file"
    }
}

struct StillSource {
    image: RgbImage,
    lease: Option<DeviceLease>,
}

impl VideoSource for StillSource {
    fn grab(&mut self) -> Result<RgbImage, CaptureError> {
        if self.lease.is_none() {
            return Err(CaptureError::Grab("source closed".to_string()));
        }
        Ok(self.image.clone())
    }

    fn close(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.give_back();
        }
    }
}

impl Drop for StillSource {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================
