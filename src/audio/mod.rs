//! Audio Module - Capture, Playback und Pegel
//!
//! Dieses Modul verwaltet:
//! - Mikrofon Capture (mit Mute über das Track-Enabled-Flag)
//! - Wiedergabe des Remote-Tracks inkl. Lautstärke
//! - Pegel-Analyse im Frequenzbereich
//! - Opus Encoding/Decoding (Feature `opus`)

mod buffer;
mod cpal_backend;
mod device;
mod level;
mod manager;
pub mod opus;

pub use buffer::SampleRing;
pub use cpal_backend::CpalBackend;
pub use device::{
    AudioBackend, AudioError, CaptureConstraints, CaptureStream, CaptureTargets, PlaybackRoute,
    PlaybackSink, RemoteAudioTrack,
};
pub use level::{clamp_unit, AudioLevels, LevelAnalyser, FFT_SIZE};
pub use manager::{AudioEvent, AudioIOManager};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate der Media-Tracks (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für Audio-Ring-Buffer
pub const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;
