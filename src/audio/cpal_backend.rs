//! Audio Backend auf Basis von cpal
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Capture wird auf 48kHz mono
//! gebracht, Playback liest aus einer Queue, die ein Tokio-Task aus dem
//! Remote-Track befüllt.

use super::buffer::SampleRing;
use super::device::{
    AudioBackend, AudioError, CaptureConstraints, CaptureStream, CaptureTargets, PlaybackRoute,
    PlaybackSink, RemoteAudioTrack,
};
use super::{RING_BUFFER_SIZE, SAMPLE_RATE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, PlayStreamError, SampleFormat, Stream, StreamConfig,
    SupportedStreamConfigRange,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

// ============================================================================
// BACKEND
// ============================================================================

/// Produktiv-Backend für die Standard-Audiogeräte des Hosts
#[derive(Debug, Default, Clone)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_capture(
        &self,
        constraints: &CaptureConstraints,
        targets: CaptureTargets,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::DeviceNotFound)?;

        if constraints.echo_cancellation
            || constraints.noise_suppression
            || constraints.auto_gain_control
        {
            // Die Host-APIs bieten keine Sprachverarbeitung an, das
            // übernimmt das Betriebssystem bzw. der Treiber
            tracing::debug!("Capture processing requested: {:?}", constraints);
        }

        let config = find_best_input_config(&device)?;
        let source_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            source_sample_rate,
            config.channels
        );

        let enabled = Arc::new(AtomicBool::new(true));
        let enabled_cb = Arc::clone(&enabled);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !enabled_cb.load(Ordering::Relaxed) {
                        return;
                    }

                    let mono = downmix(data, channels);
                    let samples = resample_linear(&mono, source_sample_rate, SAMPLE_RATE);

                    targets.tap.push_overwrite(&samples);
                    targets.feed.push_slice(&samples);
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(map_build_error)?;

        stream.play().map_err(|e| match e {
            PlayStreamError::DeviceNotAvailable => AudioError::DeviceNotFound,
            PlayStreamError::BackendSpecific { err } => classify(&err.description)
                .unwrap_or_else(|| AudioError::DeviceBusy(err.description)),
        })?;

        Ok(Box::new(CpalCapture {
            stream: Some(stream),
            enabled,
        }))
    }

    fn open_playback(
        &self,
        track: Arc<dyn RemoteAudioTrack>,
        route: PlaybackRoute,
    ) -> Result<Box<dyn PlaybackSink>, AudioError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::DeviceNotFound)?;

        let config = find_best_output_config(&device)?;
        let target_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            target_sample_rate,
            config.channels
        );

        let queue = SampleRing::new(RING_BUFFER_SIZE);
        let gain = Arc::new(Mutex::new(route.volume));
        let muted = Arc::new(AtomicBool::new(route.muted));

        let queue_cb = queue.clone();
        let gain_cb = Arc::clone(&gain);
        let muted_cb = Arc::clone(&muted);
        let tap = route.tap;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels.max(1);
                    let ratio = SAMPLE_RATE as f32 / target_sample_rate as f32;
                    let source_len = ((frames as f32) * ratio).ceil() as usize;

                    let mut source = vec![0.0f32; source_len];
                    queue_cb.pop_into(&mut source);
                    let samples = resample_linear(&source, SAMPLE_RATE, target_sample_rate);

                    // Tap vor der Gain-Stufe
                    tap.push_overwrite(&samples);

                    let gain = if muted_cb.load(Ordering::Relaxed) {
                        0.0
                    } else {
                        *gain_cb.lock()
                    };

                    for i in 0..frames {
                        let sample = samples.get(i).copied().unwrap_or(0.0) * gain;
                        for c in 0..channels {
                            if let Some(s) = data.get_mut(i * channels + c) {
                                *s = sample;
                            }
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(map_build_error)?;

        // Schlägt der Start fehl, wird beim nächsten Interaktions-Signal erneut versucht
        stream.play().map_err(|e| {
            tracing::warn!("Audio playback could not start: {}", e);
            AudioError::PlaybackBlocked
        })?;

        let track_id = track.id();
        let pump = runtime.spawn(async move {
            while let Some(frame) = track.next_frame().await {
                queue.push_slice(&frame);
            }
            tracing::info!("Remote track {} ended", track_id);
        });

        Ok(Box::new(CpalPlayback {
            stream: Some(stream),
            gain,
            muted,
            pump: Some(pump),
        }))
    }
}

// ============================================================================
// STREAM HANDLES
// ============================================================================

struct CpalCapture {
    stream: Option<Stream>,
    enabled: Arc<AtomicBool>,
}

// Stream ist nicht Send, der Handle wird aber nur hinter dem Mutex des
// Managers angefasst
unsafe impl Send for CpalCapture {}

impl CaptureStream for CpalCapture {
    fn set_enabled(&mut self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Audio capture stopped");
        }
    }
}

struct CpalPlayback {
    stream: Option<Stream>,
    gain: Arc<Mutex<f32>>,
    muted: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

unsafe impl Send for CpalPlayback {}

impl PlaybackSink for CpalPlayback {
    fn set_volume(&mut self, volume: f32) {
        *self.gain.lock() = volume;
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.stream.take().is_some() {
            tracing::info!("Audio playback stopped");
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn map_build_error(err: BuildStreamError) -> AudioError {
    match err {
        BuildStreamError::DeviceNotAvailable => AudioError::DeviceNotFound,
        BuildStreamError::StreamConfigNotSupported => {
            AudioError::UnsupportedConfig("Stream configuration not supported".to_string())
        }
        BuildStreamError::BackendSpecific { err } => classify(&err.description)
            .unwrap_or_else(|| AudioError::StreamBuildError(err.description)),
        other => AudioError::StreamBuildError(other.to_string()),
    }
}

/// Leitet aus Backend-Fehlertexten Berechtigungs- und Belegt-Fehler ab
fn classify(description: &str) -> Option<AudioError> {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        Some(AudioError::PermissionDenied)
    } else if lower.contains("busy") || lower.contains("in use") {
        Some(AudioError::DeviceBusy(description.to_string()))
    } else {
        None
    }
}

/// Mischt interleaved Samples auf Mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Einfaches Linear-Resampling
fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
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

fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

fn find_best_output_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste F32-Konfiguration, bevorzugt 48kHz
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let mut f32_configs: Vec<SupportedStreamConfigRange> = configs
        .into_iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if let Some(pos) = f32_configs
        .iter()
        .position(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
    {
        return Ok(f32_configs
            .swap_remove(pos)
            .with_sample_rate(target_rate)
            .into());
    }

    if let Some(config) = f32_configs.into_iter().next() {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No f32 audio configuration found".to_string(),
    ))
}
