//! AudioIOManager - Mikrofon Capture und Remote-Playback
//!
//! Besitzt genau einen Capture-Handle und genau eine Playback-Senke.
//! Beim Ersetzen wird die alte Ressource immer zuerst freigegeben.
//! Plattform-Eigenheiten (blockierte Wiedergabe, verzögerte Aktivierung)
//! bleiben in diesem Modul.

use super::buffer::SampleRing;
use super::device::{
    AudioBackend, AudioError, CaptureConstraints, CaptureStream, CaptureTargets, PlaybackRoute,
    PlaybackSink, RemoteAudioTrack,
};
use super::level::{clamp_unit, AudioLevels, LevelAnalyser, FFT_SIZE};
use super::RING_BUFFER_SIZE;
use crate::config::AudioSettings;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Änderungs-Benachrichtigungen des AudioIOManagers
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    MicrophoneEnabled,
    MicrophoneDisabled,
    VolumeChanged(f32),
    CaptureMuted(bool),
    PlaybackMuted(bool),
    /// Wiedergabe blockiert, wird bei der nächsten Interaktion erneut versucht
    PlaybackBlocked { track_id: String },
    PlaybackStarted { track_id: String },
}

/// Verwaltet Audio Capture/Playback und Pegel
pub struct AudioIOManager {
    backend: Arc<dyn AudioBackend>,
    constraints: CaptureConstraints,

    capture: Option<Box<dyn CaptureStream>>,
    playback: Option<Box<dyn PlaybackSink>>,
    playback_track_id: Option<String>,

    /// Track, dessen Wiedergabe blockiert wurde
    pending_track: Option<Arc<dyn RemoteAudioTrack>>,

    feed: SampleRing,
    input_tap: SampleRing,
    output_tap: SampleRing,
    analyser: LevelAnalyser,

    volume: f32,
    capture_muted: bool,
    playback_muted: bool,
    disposed: bool,

    event_tx: broadcast::Sender<AudioEvent>,
}

impl AudioIOManager {
    /// Erstellt einen neuen AudioIOManager
    pub fn new(backend: Arc<dyn AudioBackend>, settings: &AudioSettings) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            backend,
            constraints: CaptureConstraints {
                echo_cancellation: settings.echo_cancellation,
                noise_suppression: settings.noise_suppression,
                auto_gain_control: settings.auto_gain_control,
            },
            capture: None,
            playback: None,
            playback_track_id: None,
            pending_track: None,
            feed: SampleRing::new(RING_BUFFER_SIZE),
            input_tap: SampleRing::new(FFT_SIZE * 4),
            output_tap: SampleRing::new(FFT_SIZE * 4),
            analyser: LevelAnalyser::new(),
            volume: clamp_unit(settings.initial_volume),
            capture_muted: false,
            playback_muted: false,
            disposed: false,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<AudioEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // CAPTURE
    // ========================================================================

    /// Aktiviert das Mikrofon (idempotent)
    pub fn enable_microphone(&mut self) -> Result<(), AudioError> {
        if self.disposed {
            return Err(AudioError::Disposed);
        }
        if self.capture.is_some() {
            return Ok(());
        }

        let targets = CaptureTargets {
            feed: self.feed.clone(),
            tap: self.input_tap.clone(),
        };

        let mut stream = self.backend.open_capture(&self.constraints, targets)?;
        if self.capture_muted {
            stream.set_enabled(false);
        }
        self.capture = Some(stream);

        tracing::info!("Microphone enabled");
        self.emit(AudioEvent::MicrophoneEnabled);
        Ok(())
    }

    /// Gibt das Mikrofon frei (idempotent)
    pub fn disable_microphone(&mut self) {
        if let Some(mut stream) = self.capture.take() {
            stream.stop();
            self.feed.reset();
            self.input_tap.reset();
            tracing::info!("Microphone disabled");
            self.emit(AudioEvent::MicrophoneDisabled);
        }
    }

    pub fn is_microphone_enabled(&self) -> bool {
        self.capture.is_some()
    }

    /// Feed für den lokalen Media-Track, falls das Mikrofon aktiv ist
    pub fn local_feed(&self) -> Option<SampleRing> {
        self.capture.as_ref().map(|_| self.feed.clone())
    }

    // ========================================================================
    // PLAYBACK
    // ========================================================================

    /// Leitet einen Remote-Track auf die Wiedergabe
    ///
    /// Ein vorher angehängter Track wird zuerst freigegeben. Blockiert die
    /// Plattform die Wiedergabe, wird bei `notify_user_interaction` erneut
    /// versucht.
    pub fn attach_remote_track(
        &mut self,
        track: Arc<dyn RemoteAudioTrack>,
    ) -> Result<(), AudioError> {
        if self.disposed {
            return Err(AudioError::Disposed);
        }

        self.release_playback();
        self.start_playback(track)
    }

    /// Entfernt den aktuellen Remote-Track
    pub fn detach_remote_track(&mut self) {
        self.release_playback();
    }

    /// Signal einer Benutzer-Interaktion, startet blockierte Wiedergabe neu
    pub fn notify_user_interaction(&mut self) -> Result<bool, AudioError> {
        if self.disposed {
            return Err(AudioError::Disposed);
        }
        match self.pending_track.take() {
            Some(track) => {
                self.start_playback(track)?;
                Ok(self.playback.is_some())
            }
            None => Ok(false),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_some()
    }

    pub fn has_pending_playback(&self) -> bool {
        self.pending_track.is_some()
    }

    fn start_playback(&mut self, track: Arc<dyn RemoteAudioTrack>) -> Result<(), AudioError> {
        let track_id = track.id();
        let route = PlaybackRoute {
            tap: self.output_tap.clone(),
            volume: self.volume,
            muted: self.playback_muted,
        };

        match self.backend.open_playback(Arc::clone(&track), route) {
            Ok(sink) => {
                self.playback = Some(sink);
                self.playback_track_id = Some(track_id.clone());
                tracing::info!("Playback started for track {}", track_id);
                self.emit(AudioEvent::PlaybackStarted { track_id });
                Ok(())
            }
            Err(AudioError::PlaybackBlocked) => {
                tracing::warn!(
                    "Playback of track {} blocked, retrying on next interaction",
                    track_id
                );
                self.pending_track = Some(track);
                self.emit(AudioEvent::PlaybackBlocked { track_id });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn release_playback(&mut self) {
        self.pending_track = None;
        if let Some(mut sink) = self.playback.take() {
            sink.stop();
            tracing::debug!(
                "Released playback for track {:?}",
                self.playback_track_id.take()
            );
        }
        self.output_tap.reset();
    }

    // ========================================================================
    // VOLUME / MUTE
    // ========================================================================

    /// Setzt die Lautstärke (geklemmt auf [0, 1]) und gibt den Wert zurück
    pub fn set_volume(&mut self, level: f32) -> f32 {
        let volume = clamp_unit(level);
        self.volume = volume;
        if let Some(sink) = self.playback.as_mut() {
            sink.set_volume(volume);
        }
        tracing::debug!("Volume set to {}", volume);
        self.emit(AudioEvent::VolumeChanged(volume));
        volume
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Schaltet Capture und Playback stumm
    pub fn mute(&mut self) {
        self.set_capture_muted(true);
        self.set_playback_muted(true);
    }

    /// Hebt die Stummschaltung beider Pfade auf
    pub fn unmute(&mut self) {
        self.set_capture_muted(false);
        self.set_playback_muted(false);
    }

    /// Setzt nur das Enabled-Flag des Tracks, die Hardware bleibt offen
    pub fn set_capture_muted(&mut self, muted: bool) {
        if self.capture_muted == muted {
            return;
        }
        self.capture_muted = muted;
        if let Some(stream) = self.capture.as_mut() {
            stream.set_enabled(!muted);
        }
        if muted {
            self.input_tap.reset();
        }
        tracing::debug!("Capture muted: {}", muted);
        self.emit(AudioEvent::CaptureMuted(muted));
    }

    pub fn set_playback_muted(&mut self, muted: bool) {
        if self.playback_muted == muted {
            return;
        }
        self.playback_muted = muted;
        if let Some(sink) = self.playback.as_mut() {
            sink.set_muted(muted);
        }
        if muted {
            self.output_tap.reset();
        }
        tracing::debug!("Playback muted: {}", muted);
        self.emit(AudioEvent::PlaybackMuted(muted));
    }

    pub fn is_capture_muted(&self) -> bool {
        self.capture_muted
    }

    pub fn is_playback_muted(&self) -> bool {
        self.playback_muted
    }

    // ========================================================================
    // LEVELS
    // ========================================================================

    /// Gibt die Audio-Levels zurück, (0, 0) für stumme oder inaktive Pfade
    pub fn get_levels(&self) -> AudioLevels {
        let input = if self.capture.is_some() && !self.capture_muted {
            self.analyser.level(&self.input_tap)
        } else {
            0.0
        };
        let output = if self.playback.is_some() && !self.playback_muted {
            self.analyser.level(&self.output_tap)
        } else {
            0.0
        };
        AudioLevels::new(input, output)
    }

    // ========================================================================
    // DISPOSE
    // ========================================================================

    /// Gibt alle Ressourcen frei (mehrfach aufrufbar)
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disable_microphone();
        self.release_playback();
        self.disposed = true;
        tracing::info!("Audio manager disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn emit(&self, event: AudioEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for AudioIOManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for AudioIOManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioIOManager")
            .field("microphone", &self.capture.is_some())
            .field("playback", &self.playback_track_id)
            .field("volume", &self.volume)
            .field("capture_muted", &self.capture_muted)
            .field("playback_muted", &self.playback_muted)
            .field("disposed", &self.disposed)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAudioBackend, MockRemoteTrack};

    fn manager(backend: &MockAudioBackend) -> AudioIOManager {
        AudioIOManager::new(Arc::new(backend.clone()), &AudioSettings::default())
    }

    #[test]
    fn test_volume_is_clamped() {
        let backend = MockAudioBackend::new();
        let mut audio = manager(&backend);

        for input in [-3.0, -0.0, 0.25, 1.0, 1.5, f32::INFINITY, f32::NAN] {
            let volume = audio.set_volume(input);
            assert!((0.0..=1.0).contains(&volume), "volume {} for {}", volume, input);
            assert_eq!(audio.volume(), volume);
        }
        assert_eq!(audio.set_volume(0.25), 0.25);
    }

    #[test]
    fn test_volume_change_is_notified_and_applied() {
        let backend = MockAudioBackend::new();
        let mut audio = manager(&backend);
        let mut events = audio.subscribe();

        audio
            .attach_remote_track(MockRemoteTrack::new("remote-1"))
            .unwrap();
        audio.set_volume(0.4);

        assert_eq!(backend.last_sink_volume(), Some(0.4));
        let mut saw_volume = false;
        while let Ok(event) = events.try_recv() {
            if event == AudioEvent::VolumeChanged(0.4) {
                saw_volume = true;
            }
        }
        assert!(saw_volume);
    }

    #[test]
    fn test_enable_microphone_is_idempotent() {
        let backend = MockAudioBackend::new();
        let mut audio = manager(&backend);

        audio.enable_microphone().unwrap();
        audio.enable_microphone().unwrap();

        assert_eq!(backend.captures_opened(), 1);
        assert!(audio.is_microphone_enabled());
        assert!(audio.local_feed().is_some());
    }

    #[test]
    fn test_permission_denied_keeps_microphone_disabled() {
        let backend = MockAudioBackend::new();
        backend.fail_capture_with(AudioError::PermissionDenied);
        let mut audio = manager(&backend);

        assert_eq!(audio.enable_microphone(), Err(AudioError::PermissionDenied));
        assert!(!audio.is_microphone_enabled());
        assert!(audio.local_feed().is_none());
    }

    #[test]
    fn test_disable_microphone_releases_hardware() {
        let backend = MockAudioBackend::new();
        let mut audio = manager(&backend);

        audio.enable_microphone().unwrap();
        audio.disable_microphone();
        audio.disable_microphone();

        assert_eq!(backend.captures_stopped(), 1);
        assert!(!audio.is_microphone_enabled());
    }

    #[test]
    fn test_levels_zero_when_muted_or_inactive() {
        let backend = MockAudioBackend::new();
        backend.emit_signal(true);
        let mut audio = manager(&backend);

        // Inaktiv
        assert_eq!(audio.get_levels(), AudioLevels::SILENT);

        audio.enable_microphone().unwrap();
        audio
            .attach_remote_track(MockRemoteTrack::new("remote-1"))
            .unwrap();
        let active = audio.get_levels();
        assert!(active.input > 0.0);
        assert!(active.output > 0.0);

        audio.mute();
        assert_eq!(audio.get_levels(), AudioLevels::SILENT);

        // Nach unmute keine alten Daten
        audio.unmute();
        assert_eq!(audio.get_levels(), AudioLevels::SILENT);

        audio.disable_microphone();
        audio.detach_remote_track();
        assert_eq!(audio.get_levels(), AudioLevels::SILENT);
    }

    #[test]
    fn test_capture_mute_toggles_enabled_flag() {
        let backend = MockAudioBackend::new();
        let mut audio = manager(&backend);
        audio.enable_microphone().unwrap();

        audio.set_capture_muted(true);
        assert_eq!(backend.capture_enabled(), Some(false));
        assert_eq!(backend.captures_stopped(), 0);

        audio.set_capture_muted(false);
        assert_eq!(backend.capture_enabled(), Some(true));
        assert!(!audio.is_playback_muted());
    }

    #[test]
    fn test_attach_replaces_previous_track() {
        let backend = MockAudioBackend::new();
        let mut audio = manager(&backend);

        audio
            .attach_remote_track(MockRemoteTrack::new("remote-1"))
            .unwrap();
        audio
            .attach_remote_track(MockRemoteTrack::new("remote-2"))
            .unwrap();

        assert_eq!(backend.sinks_opened(), 2);
        assert_eq!(backend.sinks_stopped(), 1);
        assert_eq!(backend.active_sinks(), 1);
    }

    #[test]
    fn test_blocked_playback_retries_on_interaction() {
        let backend = MockAudioBackend::new();
        backend.block_playback(1);
        let mut audio = manager(&backend);
        let mut events = audio.subscribe();

        audio
            .attach_remote_track(MockRemoteTrack::new("remote-1"))
            .unwrap();
        assert!(!audio.is_playing());
        assert!(audio.has_pending_playback());
        assert_eq!(
            events.try_recv().unwrap(),
            AudioEvent::PlaybackBlocked {
                track_id: "remote-1".to_string()
            }
        );

        assert!(audio.notify_user_interaction().unwrap());
        assert!(audio.is_playing());
        assert!(!audio.has_pending_playback());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let backend = MockAudioBackend::new();
        let mut audio = manager(&backend);
        audio.enable_microphone().unwrap();
        audio
            .attach_remote_track(MockRemoteTrack::new("remote-1"))
            .unwrap();

        audio.dispose();
        audio.dispose();

        assert_eq!(backend.captures_stopped(), 1);
        assert_eq!(backend.sinks_stopped(), 1);
        assert_eq!(audio.enable_microphone(), Err(AudioError::Disposed));
        assert!(audio
            .attach_remote_track(MockRemoteTrack::new("remote-2"))
            .is_err());
    }
}
