//! Hardware-Schnittstellen für Capture und Playback
//!
//! Der AudioIOManager spricht ausschließlich über diese Traits mit der
//! Plattform. Die Produktiv-Implementierung liegt in `cpal_backend`,
//! Tests verwenden Mocks.

use super::buffer::SampleRing;
use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No audio device found")]
    DeviceNotFound,

    #[error("Audio device is busy: {0}")]
    DeviceBusy(String),

    #[error("Playback was blocked by the platform")]
    PlaybackBlocked,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Audio manager has been disposed")]
    Disposed,
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Gewünschte Signalverarbeitung beim Capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Ziele für aufgenommene Samples
#[derive(Debug, Clone)]
pub struct CaptureTargets {
    /// Feed für den lokalen Media-Track (48 kHz mono)
    pub feed: SampleRing,
    /// Tap für die Pegel-Analyse
    pub tap: SampleRing,
}

/// Ein laufender Capture-Stream
pub trait CaptureStream: Send {
    /// Schaltet den Track an/aus ohne die Hardware freizugeben
    fn set_enabled(&mut self, enabled: bool);

    /// Gibt die Hardware frei
    fn stop(&mut self);
}

// ============================================================================
// PLAYBACK
// ============================================================================

/// Eingehender Audio-Track des Remote-Peers
#[async_trait]
pub trait RemoteAudioTrack: Send + Sync {
    fn id(&self) -> String;

    /// Nächster dekodierter Frame (48 kHz mono), `None` wenn der Track endet
    async fn next_frame(&self) -> Option<Vec<f32>>;
}

/// Ziel für abgespielte Samples
#[derive(Debug, Clone)]
pub struct PlaybackRoute {
    pub tap: SampleRing,
    pub volume: f32,
    pub muted: bool,
}

/// Eine laufende Playback-Senke
pub trait PlaybackSink: Send {
    fn set_volume(&mut self, volume: f32);

    fn set_muted(&mut self, muted: bool);

    /// Stoppt die Wiedergabe und gibt das Gerät frei
    fn stop(&mut self);
}

// ============================================================================
// BACKEND
// ============================================================================

/// Zugriff auf die Audio-Hardware
pub trait AudioBackend: Send + Sync {
    fn open_capture(
        &self,
        constraints: &CaptureConstraints,
        targets: CaptureTargets,
    ) -> Result<Box<dyn CaptureStream>, AudioError>;

    fn open_playback(
        &self,
        track: std::sync::Arc<dyn RemoteAudioTrack>,
        route: PlaybackRoute,
    ) -> Result<Box<dyn PlaybackSink>, AudioError>;
}
