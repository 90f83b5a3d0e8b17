//! Media Handles - lokale Aufnahme und eingehender Audio-Track
//!
//! [`LocalMedia`] gehört exklusiv der aktiven Peer Session und wird beim
//! Auflegen gestoppt. Die Aufnahme selbst kommt von einem [`MediaDevices`]
//! Backend: `CpalMediaDevices` (Feature `device-audio`) oder
//! [`NullMediaDevices`] für Headless-Betrieb.

use async_trait::async_trait;
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "device-audio")]
pub use device::CpalMediaDevices;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, passend zu Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Audio capture thread failed: {0}")]
    DeviceThread(String),
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Vom Aufnahme-Callback geteilter Zustand
struct CaptureShared {
    muted: AtomicBool,
    live: AtomicBool,
    buffer: Mutex<HeapRb<f32>>,
    input_level: Mutex<f32>,
}

impl CaptureShared {
    fn push(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }

        // Audio Level berechnen (RMS)
        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        *self.input_level.lock() = rms.min(1.0);

        if self.muted.load(Ordering::Relaxed) || !self.live.load(Ordering::Relaxed) {
            return;
        }

        let mut buffer = self.buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }
}

struct LocalMediaInner {
    id: String,
    label: String,
    capture: Arc<CaptureShared>,
    /// Weckt den Aufnahme-Thread zum Beenden
    stop_tx: Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

impl LocalMediaInner {
    fn stop(&self) -> bool {
        if !self.capture.live.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }
        true
    }
}

impl Drop for LocalMediaInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle auf die lokale Mikrofon-Aufnahme
#[derive(Clone)]
pub struct LocalMedia {
    inner: Arc<LocalMediaInner>,
}

impl LocalMedia {
    /// Handle ohne Gerät (liefert nur, was per `push_samples` kommt)
    pub fn new(label: impl Into<String>) -> Self {
        Self::build(label.into(), None)
    }

    #[cfg_attr(not(feature = "device-audio"), allow(dead_code))]
    fn with_stop_signal(label: impl Into<String>, stop_tx: std::sync::mpsc::Sender<()>) -> Self {
        Self::build(label.into(), Some(stop_tx))
    }

    fn build(label: String, stop_tx: Option<std::sync::mpsc::Sender<()>>) -> Self {
        Self {
            inner: Arc::new(LocalMediaInner {
                id: uuid::Uuid::new_v4().to_string(),
                label,
                capture: Arc::new(CaptureShared {
                    muted: AtomicBool::new(false),
                    live: AtomicBool::new(true),
                    buffer: Mutex::new(HeapRb::new(RING_BUFFER_SIZE)),
                    input_level: Mutex::new(0.0),
                }),
                stop_tx: Mutex::new(stop_tx),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// `false` sobald die Aufnahme gestoppt wurde
    pub fn is_live(&self) -> bool {
        self.inner.capture.live.load(Ordering::SeqCst)
    }

    /// Stoppt die Aufnahme; mehrfacher Aufruf ist ein No-op
    pub fn stop(&self) {
        if self.inner.stop() {
            tracing::info!("Local audio capture '{}' stopped", self.inner.label);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.inner.capture.muted.store(muted, Ordering::Relaxed);
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.inner.capture.muted.load(Ordering::Relaxed)
    }

    /// Schreibt aufgenommene Samples (verworfen wenn stumm oder gestoppt)
    pub fn push_samples(&self, samples: &[f32]) {
        self.inner.capture.push(samples);
    }

    /// Liest einen Frame von aufgenommenem Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.inner.capture.buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }

    /// RMS-Pegel (0.0 - 1.0) für Visualisierung
    pub fn input_level(&self) -> f32 {
        *self.inner.capture.input_level.lock()
    }

    /// Gleiches zugrundeliegendes Handle
    pub fn same_as(&self, other: &LocalMedia) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("live", &self.is_live())
            .field("muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// REMOTE MEDIA
// ============================================================================

struct RemoteMediaInner {
    track_id: String,
    stream_id: String,
    codec: String,
    live: AtomicBool,
}

/// Handle auf den eingehenden Audio-Track
#[derive(Clone)]
pub struct RemoteMedia {
    inner: Arc<RemoteMediaInner>,
}

impl RemoteMedia {
    pub fn new(
        track_id: impl Into<String>,
        stream_id: impl Into<String>,
        codec: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(RemoteMediaInner {
                track_id: track_id.into(),
                stream_id: stream_id.into(),
                codec: codec.into(),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn track_id(&self) -> &str {
        &self.inner.track_id
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn codec(&self) -> &str {
        &self.inner.codec
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Markiert den Track als beendet
    pub fn end(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("track_id", &self.inner.track_id)
            .field("stream_id", &self.inner.stream_id)
            .field("codec", &self.inner.codec)
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

/// Quelle für lokale Aufnahme-Handles
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Öffnet das Mikrofon. Kann dauern (Berechtigungsdialog, Gerätestart).
    async fn acquire_audio(&self) -> Result<LocalMedia, MediaError>;
}

/// Stille Aufnahme ohne Gerät
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMediaDevices;

#[async_trait]
impl MediaDevices for NullMediaDevices {
    async fn acquire_audio(&self) -> Result<LocalMedia, MediaError> {
        Ok(LocalMedia::new("null"))
    }
}

// ============================================================================
// CPAL CAPTURE
// ============================================================================

#[cfg(feature = "device-audio")]
mod device {
    use super::{CaptureShared, LocalMedia, MediaDevices, MediaError, SAMPLE_RATE};
    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    /// Mikrofon über cpal
    ///
    /// `cpal::Stream` ist nicht `Send`, daher lebt der Stream auf einem
    /// eigenen Thread, bis das Handle gestoppt wird.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CpalMediaDevices;

    #[async_trait]
    impl MediaDevices for CpalMediaDevices {
        async fn acquire_audio(&self) -> Result<LocalMedia, MediaError> {
            let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
            let media = LocalMedia::with_stop_signal("microphone", stop_tx);
            let capture = Arc::clone(&media.inner.capture);
            let (ready_tx, ready_rx) = oneshot::channel();

            std::thread::Builder::new()
                .name("audio-capture".to_string())
                .spawn(move || match build_capture_stream(capture) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                        tracing::info!("Audio streams stopped");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })
                .map_err(|e| MediaError::DeviceThread(e.to_string()))?;

            ready_rx
                .await
                .map_err(|_| MediaError::DeviceThread("capture thread exited".to_string()))??;

            Ok(media)
        }
    }

    fn build_capture_stream(capture: Arc<CaptureShared>) -> Result<Stream, MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(MediaError::NoInputDevice)?;

        let configs = device
            .supported_input_configs()
            .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect())?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let source_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Downmix auf Mono
                    let mono: Vec<f32> = if channels > 1 {
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                            .collect()
                    } else {
                        data.to_vec()
                    };
                    capture.push(&resample(&mono, source_sample_rate, SAMPLE_RATE));
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    MediaError::PermissionDenied(e.to_string())
                }
                other => MediaError::StreamBuildError(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| MediaError::StreamPlayError(e.to_string()))?;

        Ok(stream)
    }

    /// Einfaches Linear-Resampling
    fn resample(data: &[f32], from: u32, to: u32) -> Vec<f32> {
        if from == to {
            return data.to_vec();
        }
        let ratio = to as f32 / from as f32;
        let new_len = (data.len() as f32 * ratio) as usize;
        (0..new_len)
            .map(|i| {
                let src_idx = i as f32 / ratio;
                let idx = src_idx as usize;
                let frac = src_idx - idx as f32;
                let s1 = data.get(idx).copied().unwrap_or(0.0);
                let s2 = data.get(idx + 1).copied().unwrap_or(s1);
                s1 + (s2 - s1) * frac
            })
            .collect()
    }

    /// Priorität: 48kHz > andere, F32 > andere
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, MediaError> {
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        let f32_configs = configs
            .iter()
            .filter(|c| c.sample_format() == SampleFormat::F32);

        for config in f32_configs.clone() {
            if config.min_sample_rate() <= target_rate && config.max_sample_rate() >= target_rate {
                return Ok(config.clone().with_sample_rate(target_rate).into());
            }
        }

        if let Some(config) = f32_configs.into_iter().next() {
            return Ok(config.clone().with_max_sample_rate().into());
        }

        Err(MediaError::UnsupportedConfig(
            "No f32 input configuration found".to_string(),
        ))
    }
}
