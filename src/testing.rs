//! Test-Doubles für Audio-Hardware, HTTP-Kollaborateure und Transport
//!
//! Alle Mocks zählen Allokationen und Freigaben, damit Tests prüfen können,
//! dass keine Ressourcen liegen bleiben.

use crate::audio::{
    AudioBackend, AudioError, CaptureConstraints, CaptureStream, CaptureTargets, PlaybackRoute,
    PlaybackSink, RemoteAudioTrack, SampleRing, FFT_SIZE,
};
use crate::config::IceServerConfig;
use crate::connection::{
    ChannelState, ConnectionError, ControlChannel, EphemeralToken, PeerTransport, SdpNegotiator,
    TokenProvider, TransportEvent, TransportEvents, TransportFactory, TransportState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// AUDIO
// ============================================================================

#[derive(Default)]
struct AudioCounters {
    capture_error: Option<AudioError>,
    emit_signal: bool,
    blocked_playbacks: u32,

    captures_opened: u32,
    captures_stopped: u32,
    capture_enabled: Option<Arc<Mutex<bool>>>,

    sinks_opened: u32,
    sinks_stopped: u32,
    last_sink_volume: Option<Arc<Mutex<f32>>>,
}

/// Audio-Backend ohne Hardware
#[derive(Clone, Default)]
pub struct MockAudioBackend {
    inner: Arc<Mutex<AudioCounters>>,
}

impl MockAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nächste Capture-Versuche schlagen mit `error` fehl
    pub fn fail_capture_with(&self, error: AudioError) {
        self.inner.lock().capture_error = Some(error);
    }

    /// Schreibt beim Öffnen einen Sinus in die Analyse-Taps
    pub fn emit_signal(&self, enabled: bool) {
        self.inner.lock().emit_signal = enabled;
    }

    /// Die nächsten `count` Wiedergaben werden blockiert
    pub fn block_playback(&self, count: u32) {
        self.inner.lock().blocked_playbacks = count;
    }

    pub fn captures_opened(&self) -> u32 {
        self.inner.lock().captures_opened
    }

    pub fn captures_stopped(&self) -> u32 {
        self.inner.lock().captures_stopped
    }

    pub fn capture_enabled(&self) -> Option<bool> {
        self.inner
            .lock()
            .capture_enabled
            .as_ref()
            .map(|flag| *flag.lock())
    }

    pub fn sinks_opened(&self) -> u32 {
        self.inner.lock().sinks_opened
    }

    pub fn sinks_stopped(&self) -> u32 {
        self.inner.lock().sinks_stopped
    }

    pub fn active_sinks(&self) -> u32 {
        let inner = self.inner.lock();
        inner.sinks_opened - inner.sinks_stopped
    }

    pub fn last_sink_volume(&self) -> Option<f32> {
        self.inner
            .lock()
            .last_sink_volume
            .as_ref()
            .map(|volume| *volume.lock())
    }
}

fn sine(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 * (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 48_000.0).sin())
        .collect()
}

impl AudioBackend for MockAudioBackend {
    fn open_capture(
        &self,
        _constraints: &CaptureConstraints,
        targets: CaptureTargets,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.capture_error.clone() {
            return Err(error);
        }
        if inner.emit_signal {
            targets.tap.push_overwrite(&sine(FFT_SIZE * 4));
        }

        let enabled = Arc::new(Mutex::new(true));
        inner.captures_opened += 1;
        inner.capture_enabled = Some(Arc::clone(&enabled));

        Ok(Box::new(MockCapture {
            backend: Arc::clone(&self.inner),
            enabled,
            stopped: false,
        }))
    }

    fn open_playback(
        &self,
        _track: Arc<dyn RemoteAudioTrack>,
        route: PlaybackRoute,
    ) -> Result<Box<dyn PlaybackSink>, AudioError> {
        let mut inner = self.inner.lock();
        if inner.blocked_playbacks > 0 {
            inner.blocked_playbacks -= 1;
            return Err(AudioError::PlaybackBlocked);
        }
        if inner.emit_signal {
            route.tap.push_overwrite(&sine(FFT_SIZE * 4));
        }

        let volume = Arc::new(Mutex::new(route.volume));
        inner.sinks_opened += 1;
        inner.last_sink_volume = Some(Arc::clone(&volume));

        Ok(Box::new(MockSink {
            backend: Arc::clone(&self.inner),
            volume,
            stopped: false,
        }))
    }
}

struct MockCapture {
    backend: Arc<Mutex<AudioCounters>>,
    enabled: Arc<Mutex<bool>>,
    stopped: bool,
}

impl CaptureStream for MockCapture {
    fn set_enabled(&mut self, enabled: bool) {
        *self.enabled.lock() = enabled;
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.backend.lock().captures_stopped += 1;
        }
    }
}

struct MockSink {
    backend: Arc<Mutex<AudioCounters>>,
    volume: Arc<Mutex<f32>>,
    stopped: bool,
}

impl PlaybackSink for MockSink {
    fn set_volume(&mut self, volume: f32) {
        *self.volume.lock() = volume;
    }

    fn set_muted(&mut self, _muted: bool) {}

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.backend.lock().sinks_stopped += 1;
        }
    }
}

/// Remote-Track ohne Daten
pub struct MockRemoteTrack {
    id: String,
}

impl MockRemoteTrack {
    pub fn new(id: &str) -> Arc<dyn RemoteAudioTrack> {
        Arc::new(Self { id: id.to_string() })
    }
}

#[async_trait]
impl RemoteAudioTrack for MockRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn next_frame(&self) -> Option<Vec<f32>> {
        None
    }
}

// ============================================================================
// HTTP
// ============================================================================

pub struct MockTokenProvider {
    result: Result<EphemeralToken, ConnectionError>,
}

impl MockTokenProvider {
    pub fn ok() -> Self {
        Self {
            result: Ok(EphemeralToken::new("ek_test")),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(ConnectionError::TokenFetch(message.to_string())),
        }
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn fetch_token(&self) -> Result<EphemeralToken, ConnectionError> {
        self.result.clone()
    }
}

pub struct MockNegotiator {
    result: Result<String, ConnectionError>,
}

impl MockNegotiator {
    pub fn ok() -> Self {
        Self {
            result: Ok("v=0\r\nmock-answer".to_string()),
        }
    }

    pub fn failing(status: u16, body: &str) -> Self {
        Self {
            result: Err(ConnectionError::Negotiation {
                status,
                body: body.to_string(),
            }),
        }
    }
}

#[async_trait]
impl SdpNegotiator for MockNegotiator {
    async fn negotiate(
        &self,
        offer_sdp: &str,
        token: &EphemeralToken,
    ) -> Result<String, ConnectionError> {
        assert!(offer_sdp.starts_with("v=0"));
        assert!(!token.secret().is_empty());
        self.result.clone()
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Verhalten eines Mock-Transports nach dem Answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportScript {
    /// Transport verbunden, Channel offen
    Connects,
    /// Transport verbunden, Channel bleibt `Connecting`
    ChannelStaysConnecting,
    /// Transport meldet `Failed`
    FailsAfterAnswer,
    /// `create()` schlägt fehl
    FailsToCreate,
}

struct FactoryState {
    script: TransportScript,
    transports: Vec<Arc<MockTransport>>,
    create_calls: u32,
}

#[derive(Clone)]
pub struct MockTransportFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::with_script(TransportScript::Connects)
    }

    pub fn with_script(script: TransportScript) -> Self {
        Self {
            state: Arc::new(Mutex::new(FactoryState {
                script,
                transports: Vec::new(),
                create_calls: 0,
            })),
        }
    }

    /// Ändert das Verhalten für alle folgenden Transports
    pub fn set_script(&self, script: TransportScript) {
        self.state.lock().script = script;
    }

    /// Anzahl der Aufrufe von `create()`
    pub fn create_calls(&self) -> u32 {
        self.state.lock().create_calls
    }

    /// Anzahl erfolgreich erzeugter Transports
    pub fn created(&self) -> usize {
        self.state.lock().transports.len()
    }

    /// Transports, die noch nicht geschlossen wurden
    pub fn open_transports(&self) -> usize {
        self.state
            .lock()
            .transports
            .iter()
            .filter(|t| t.close_calls() == 0)
            .count()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.state.lock().transports.last().cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), ConnectionError> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if state.script == TransportScript::FailsToCreate {
            return Err(ConnectionError::TransportFailed(
                "mock transport unavailable".to_string(),
            ));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            script: state.script,
            event_tx,
            inner: Mutex::new(TransportRecord::default()),
            channel_state: Arc::new(Mutex::new(ChannelState::Connecting)),
        });
        state.transports.push(Arc::clone(&transport));

        Ok((transport, event_rx))
    }
}

#[derive(Default)]
struct TransportRecord {
    local_audio: bool,
    receive_only: bool,
    offers: u32,
    close_calls: u32,
    sent: Arc<Mutex<Vec<String>>>,
}

pub struct MockTransport {
    script: TransportScript,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<TransportRecord>,
    channel_state: Arc<Mutex<ChannelState>>,
}

impl MockTransport {
    pub fn offers_received(&self) -> u32 {
        self.inner.lock().offers
    }

    pub fn has_local_audio(&self) -> bool {
        self.inner.lock().local_audio
    }

    pub fn is_receive_only(&self) -> bool {
        self.inner.lock().receive_only
    }

    pub fn close_calls(&self) -> u32 {
        self.inner.lock().close_calls
    }

    pub fn channel_closed(&self) -> bool {
        *self.channel_state.lock() == ChannelState::Closed
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.inner.lock().sent.lock().clone()
    }

    /// Simuliert einen eingehenden Control-Frame
    pub fn push_message(&self, text: &str) {
        let _ = self
            .event_tx
            .send(TransportEvent::ChannelMessage(text.to_string()));
    }

    /// Simuliert einen Transport-Ausfall
    pub fn fail(&self) {
        let _ = self
            .event_tx
            .send(TransportEvent::StateChanged(TransportState::Failed));
    }

    /// Simuliert ein Schließen durch die Gegenseite
    pub fn close_remotely(&self) {
        *self.channel_state.lock() = ChannelState::Closed;
        let _ = self.event_tx.send(TransportEvent::ChannelClosed);
    }

    pub fn emit_remote_track(&self, track: Arc<dyn RemoteAudioTrack>) {
        let _ = self.event_tx.send(TransportEvent::RemoteTrack(track));
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn add_local_audio(&self, _feed: SampleRing) -> Result<(), ConnectionError> {
        self.inner.lock().local_audio = true;
        Ok(())
    }

    async fn add_receive_only_audio(&self) -> Result<(), ConnectionError> {
        self.inner.lock().receive_only = true;
        Ok(())
    }

    async fn open_channel(&self, _label: &str) -> Result<Arc<dyn ControlChannel>, ConnectionError> {
        Ok(Arc::new(MockChannel {
            state: Arc::clone(&self.channel_state),
            sent: Arc::clone(&self.inner.lock().sent),
        }))
    }

    async fn create_offer(&self) -> Result<String, ConnectionError> {
        self.inner.lock().offers += 1;
        Ok("v=0\r\nmock-offer".to_string())
    }

    async fn apply_answer(&self, _sdp: String) -> Result<(), ConnectionError> {
        let send = |event| {
            let _ = self.event_tx.send(event);
        };

        match self.script {
            TransportScript::Connects => {
                send(TransportEvent::StateChanged(TransportState::Connecting));
                send(TransportEvent::StateChanged(TransportState::Connected));
                *self.channel_state.lock() = ChannelState::Open;
                send(TransportEvent::ChannelOpen);
            }
            TransportScript::ChannelStaysConnecting => {
                send(TransportEvent::StateChanged(TransportState::Connecting));
                send(TransportEvent::StateChanged(TransportState::Connected));
            }
            TransportScript::FailsAfterAnswer => {
                send(TransportEvent::StateChanged(TransportState::Connecting));
                send(TransportEvent::StateChanged(TransportState::Failed));
            }
            TransportScript::FailsToCreate => {}
        }
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.inner.lock();
        inner.close_calls += 1;
        *self.channel_state.lock() = ChannelState::Closed;
    }
}

struct MockChannel {
    state: Arc<Mutex<ChannelState>>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ControlChannel for MockChannel {
    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if *self.state.lock() != ChannelState::Open {
            return Err(ConnectionError::ChannelUnavailable);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) {
        *self.state.lock() = ChannelState::Closed;
    }
}
