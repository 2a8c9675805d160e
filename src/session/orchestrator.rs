//! SessionOrchestrator - öffentliche Schnittstelle einer Voice-Session
//!
//! Besitzt pro Verbindungsversuch genau einen ConnectionManager, übersetzt
//! Control-Frames in `SessionEvent`s, steuert Reconnects und überwacht
//! Zeit und Kosten.
//!
//! Jeder Timer und jeder Callback ist an ein `LivenessToken` gebunden.
//! `disconnect()` und `dispose()` machen alle älteren Tokens ungültig.

use super::events::{
    DecisionHandle, ErrorKind, SessionDecision, SessionEvent, SessionSnapshot, SessionStatus,
    TranscriptEntry,
};
use super::governor::{DecisionOutcome, Governor, GovernorAction};
use super::scheduler::{Liveness, LivenessToken, RetryScheduler};
use crate::audio::{
    AudioBackend, AudioError, AudioEvent, AudioIOManager, AudioLevels, CpalBackend,
};
use crate::config::{ConfigError, SessionConfig};
use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionPhase, HttpNegotiator,
    HttpTokenProvider, PeerConnectionState, SdpNegotiator, TokenProvider, TransportFactory,
    WebRtcTransportFactory,
};
use crate::protocol::{ClientEvent, Role, ServerEvent};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Session has been disposed")]
    Disposed,

    #[error("Connection attempt was cancelled")]
    Aborted,

    #[error("Reconnection failed after {0} attempts")]
    RetriesExhausted(u32),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Audio(AudioError::PermissionDenied) => ErrorKind::PermissionDenied,
            SessionError::Audio(AudioError::DeviceNotFound) => ErrorKind::DeviceNotFound,
            SessionError::Audio(AudioError::DeviceBusy(_)) => ErrorKind::DeviceBusy,
            SessionError::Audio(AudioError::Disposed) => ErrorKind::Disposed,
            SessionError::Audio(_) => ErrorKind::Audio,
            SessionError::Connection(e) => match e {
                ConnectionError::TokenFetch(_) => ErrorKind::TokenFetch,
                ConnectionError::Negotiation { .. }
                | ConnectionError::NegotiationRequest(_)
                | ConnectionError::InvalidSdp(_) => ErrorKind::Negotiation,
                ConnectionError::TransportFailed(_) | ConnectionError::InvalidState(_) => {
                    ErrorKind::TransportFailed
                }
                ConnectionError::ChannelUnavailable => ErrorKind::ChannelUnavailable,
                ConnectionError::Encode(_) => ErrorKind::Protocol,
                ConnectionError::Disposed => ErrorKind::Aborted,
            },
            SessionError::Config(_) => ErrorKind::Config,
            SessionError::NotConnected => ErrorKind::NotConnected,
            SessionError::Disposed => ErrorKind::Disposed,
            SessionError::Aborted => ErrorKind::Aborted,
            SessionError::RetriesExhausted(_) => ErrorKind::RetriesExhausted,
        }
    }

    /// Negotiation- und Transportfehler, für die die Reconnect-Policy greift
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Negotiation | ErrorKind::TransportFailed
        )
    }

    /// Fehler, die eine Benutzeraktion brauchen und nie automatisch wiederholt werden
    pub fn needs_user_action(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PermissionDenied | ErrorKind::DeviceNotFound | ErrorKind::DeviceBusy
        )
    }
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Austauschbare Kollaborateure einer Session
#[derive(Clone)]
pub struct SessionDeps {
    pub audio: Arc<dyn AudioBackend>,
    pub tokens: Arc<dyn TokenProvider>,
    pub negotiator: Arc<dyn SdpNegotiator>,
    pub transports: Arc<dyn TransportFactory>,
}

impl SessionDeps {
    /// cpal, HTTP und WebRTC
    pub fn production(config: &SessionConfig) -> Result<Self, SessionError> {
        let connection = &config.connection;
        Ok(Self {
            audio: Arc::new(CpalBackend::new()),
            tokens: Arc::new(HttpTokenProvider::new(
                connection.token_endpoint.clone(),
                connection.http_timeout(),
            )?),
            negotiator: Arc::new(HttpNegotiator::new(
                &connection.base_url,
                &connection.model,
                connection.http_timeout(),
            )?),
            transports: Arc::new(WebRtcTransportFactory::new()),
        })
    }
}

// ============================================================================
// STATE
// ============================================================================

struct SessionState {
    id: Option<Uuid>,
    status: SessionStatus,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    governor: Governor,
    reconnect_attempts: u32,
    /// Zuletzt gemeldete Fehlerursache
    last_error: Option<ErrorKind>,
    transcript: Vec<TranscriptEntry>,
    utterance: String,
    connection_seq: u64,
}

impl SessionState {
    fn new(governor: Governor) -> Self {
        Self {
            id: None,
            status: SessionStatus::Disconnected,
            started_at: None,
            started: None,
            governor,
            reconnect_attempts: 0,
            last_error: None,
            transcript: Vec::new(),
            utterance: String::new(),
            connection_seq: 0,
        }
    }

    fn begin(&mut self) {
        self.id = Some(Uuid::new_v4());
        self.started_at = None;
        self.started = None;
        self.governor.reset();
        self.reconnect_attempts = 0;
        self.last_error = None;
        self.transcript.clear();
        self.utterance.clear();
    }

    fn end(&mut self) {
        self.begin();
        self.id = None;
    }

    fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

struct Inner {
    config: Mutex<SessionConfig>,
    deps: SessionDeps,
    audio: Mutex<AudioIOManager>,
    event_tx: broadcast::Sender<SessionEvent>,
    state: Mutex<SessionState>,

    /// Aktuelle Verbindung mit ihrer laufenden Nummer
    connection: Mutex<Option<(u64, Arc<ConnectionManager>)>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Meter-Schleife der aktuellen Epoche
    meter: Mutex<Option<(LivenessToken, JoinHandle<()>)>>,
    /// Ausstehende Entscheidungen
    tasks: Mutex<Vec<JoinHandle<()>>>,

    scheduler: RetryScheduler,
    liveness: Liveness,
}

// ============================================================================
// SESSION ORCHESTRATOR
// ============================================================================

/// Öffentliche Schnittstelle einer Realtime-Voice-Session
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    /// Erstellt eine neue Session, die Konfiguration wird hier validiert
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Result<Self, SessionError> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(256);
        let audio = AudioIOManager::new(Arc::clone(&deps.audio), &config.audio);
        let governor = Governor::new(config.cost, config.limits.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                deps,
                audio: Mutex::new(audio),
                event_tx,
                state: Mutex::new(SessionState::new(governor)),
                connection: Mutex::new(None),
                pump: Mutex::new(None),
                meter: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                scheduler: RetryScheduler::new(),
                liveness: Liveness::new(),
            }),
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Änderungen an Lautstärke, Mute und Wiedergabe
    pub fn audio_events(&self) -> broadcast::Receiver<AudioEvent> {
        self.inner.audio.lock().subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.state.lock();
        let usage = state.governor.usage();
        SessionSnapshot {
            id: state.id,
            status: state.status,
            started_at: state.started_at,
            input_seconds: usage.input_seconds,
            output_seconds: usage.output_seconds,
            cost: usage.cost,
            reconnect_attempts: state.reconnect_attempts,
            extensions_used: state.governor.extensions_used(),
        }
    }

    /// Abgeschlossene Äußerungen der aktuellen Session
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.inner.state.lock().transcript.clone()
    }

    /// Zustand der aktuellen Peer-Verbindung
    pub fn connection_state(&self) -> Option<PeerConnectionState> {
        self.inner
            .connection
            .lock()
            .as_ref()
            .map(|(_, connection)| connection.get_state())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.liveness.is_disposed()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Baut die Session auf
    ///
    /// Während `connecting`/`connected` ein No-op. Fehler beim ersten Aufbau
    /// werden zurückgegeben. Negotiation- und Transportfehler planen zusätzlich
    /// einen Reconnect nach der Policy, Token- und Gerätefehler nicht.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.liveness.is_disposed() {
            return Err(SessionError::Disposed);
        }

        {
            let mut state = inner.state.lock();
            if state.status.is_active() {
                return Ok(());
            }
            state.begin();
            state.status = SessionStatus::Connecting;
        }
        inner.scheduler.cancel();
        let token = inner.liveness.invalidate();
        inner.emit(SessionEvent::StatusChanged(SessionStatus::Connecting));
        tracing::info!("Connecting session");

        match inner.establish(token).await {
            Ok(()) => {
                inner.on_connected(token);
                Ok(())
            }
            Err(e) => {
                if !inner.liveness.is_current(token) {
                    return Err(e);
                }
                tracing::error!("Failed to connect: {}", e);
                inner.drop_connection().await;

                if e.is_retryable() {
                    inner.handle_failure(token, e.clone());
                } else {
                    inner.audio.lock().disable_microphone();
                    inner.report_error(&e);
                    inner.set_status(SessionStatus::Error);
                }
                Err(e)
            }
        }
    }

    /// Beendet die Session, ausstehende Retries werden verworfen
    pub async fn disconnect(&self) {
        if self.inner.liveness.is_disposed() {
            return;
        }
        self.inner.shutdown().await;
    }

    /// Gibt alle Ressourcen frei (mehrfach aufrufbar)
    pub async fn dispose(&self) {
        if !self.inner.liveness.dispose() {
            return;
        }
        self.inner.shutdown().await;
        self.inner.audio.lock().dispose();
        tracing::info!("Session disposed");
    }

    // ========================================================================
    // MESSAGES
    // ========================================================================

    /// Sendet eine Text-Nachricht und fordert eine Antwort an
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.inner
            .send_frames(&[ClientEvent::user_text(text), ClientEvent::response()])
            .await
    }

    /// Ändert die Instruktionen, bei bestehender Verbindung sofort
    pub async fn update_instructions(&self, instructions: &str) -> Result<(), SessionError> {
        if self.inner.liveness.is_disposed() {
            return Err(SessionError::Disposed);
        }

        let settings = {
            let mut config = self.inner.config.lock();
            config.session.instructions = instructions.to_string();
            config.session.clone()
        };

        if self.status() != SessionStatus::Connected {
            tracing::debug!("Instructions stored for the next connection");
            return Ok(());
        }
        self.inner
            .send_frames(&[ClientEvent::SessionUpdate { session: settings }])
            .await
    }

    /// Liefert das Ergebnis eines Function-Calls zurück
    pub async fn send_function_result(
        &self,
        call_id: &str,
        output: &str,
    ) -> Result<(), SessionError> {
        self.inner
            .send_frames(&[
                ClientEvent::function_output(call_id, output),
                ClientEvent::response(),
            ])
            .await
    }

    /// Bricht die laufende Antwort ab
    pub async fn cancel_response(&self) -> Result<(), SessionError> {
        self.inner.send_frames(&[ClientEvent::ResponseCancel]).await
    }

    // ========================================================================
    // AUDIO
    // ========================================================================

    pub fn set_volume(&self, level: f32) -> f32 {
        self.inner.audio.lock().set_volume(level)
    }

    pub fn volume(&self) -> f32 {
        self.inner.audio.lock().volume()
    }

    pub fn mute(&self) {
        self.inner.audio.lock().mute();
    }

    pub fn unmute(&self) {
        self.inner.audio.lock().unmute();
    }

    pub fn set_capture_muted(&self, muted: bool) {
        self.inner.audio.lock().set_capture_muted(muted);
    }

    pub fn set_playback_muted(&self, muted: bool) {
        self.inner.audio.lock().set_playback_muted(muted);
    }

    pub fn get_levels(&self) -> AudioLevels {
        self.inner.audio.lock().get_levels()
    }

    /// Startet blockierte Wiedergabe nach einer Benutzer-Interaktion
    pub fn notify_user_interaction(&self) -> Result<bool, SessionError> {
        Ok(self.inner.audio.lock().notify_user_interaction()?)
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        if !self.inner.liveness.dispose() {
            return;
        }
        self.inner.scheduler.cancel();
        self.inner.abort_tasks();

        let connection = self.inner.connection.lock().take();
        if let Some((_, connection)) = connection {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { connection.close().await });
            }
        }
        self.inner.audio.lock().dispose();
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

// ============================================================================
// INTERNALS
// ============================================================================

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Status-Übergang entlang der erlaubten Kanten
    fn set_status(&self, next: SessionStatus) -> bool {
        {
            let mut state = self.state.lock();
            if !state.status.can_transition_to(next) {
                tracing::debug!("Ignoring status change {:?} -> {:?}", state.status, next);
                return false;
            }
            state.status = next;
        }
        tracing::info!("Session status: {:?}", next);
        self.emit(SessionEvent::StatusChanged(next));
        true
    }

    /// Genau ein Error-Event pro Fehlerursache
    fn report_error(&self, error: &SessionError) {
        let kind = error.kind();
        {
            let mut state = self.state.lock();
            if state.last_error == Some(kind) {
                tracing::debug!("Suppressing repeated {:?} error: {}", kind, error);
                return;
            }
            state.last_error = Some(kind);
        }
        self.emit(SessionEvent::Error {
            kind,
            message: error.to_string(),
        });
    }

    fn on_connected(self: &Arc<Self>, token: LivenessToken) {
        if !self.liveness.is_current(token) {
            return;
        }
        {
            let mut state = self.state.lock();
            state.reconnect_attempts = 0;
            state.last_error = None;
            if state.started.is_none() {
                state.started = Some(Instant::now());
                state.started_at = Some(Utc::now());
            }
        }
        self.set_status(SessionStatus::Connected);
        self.start_meter(token);
    }

    /// Ein Verbindungsversuch: Mikrofon, neuer ConnectionManager, session.update
    async fn establish(self: &Arc<Self>, token: LivenessToken) -> Result<(), SessionError> {
        let feed = {
            let mut audio = self.audio.lock();
            if self.config.lock().audio.enable_microphone {
                audio.enable_microphone()?;
            }
            audio.local_feed()
        };

        let (settings, connection_config) = {
            let config = self.config.lock();
            (config.session.clone(), config.connection.clone())
        };

        // Vorherige Verbindung zuerst freigeben
        let previous = self.connection.lock().take();
        if let Some((_, previous)) = previous {
            previous.close().await;
        }
        if !self.liveness.is_current(token) {
            return Err(SessionError::Aborted);
        }

        let (manager, events) = ConnectionManager::new(
            connection_config,
            Arc::clone(&self.deps.tokens),
            Arc::clone(&self.deps.negotiator),
            Arc::clone(&self.deps.transports),
        );
        let manager = Arc::new(manager);
        let seq = {
            let mut state = self.state.lock();
            state.connection_seq += 1;
            state.connection_seq
        };
        *self.connection.lock() = Some((seq, Arc::clone(&manager)));
        self.spawn_pump(token, seq, events);

        let result = manager.initialize(feed).await;
        if !self.liveness.is_current(token) {
            self.release_connection(seq).await;
            return Err(SessionError::Aborted);
        }
        result?;

        manager
            .send(&ClientEvent::SessionUpdate { session: settings })
            .await?;
        Ok(())
    }

    /// Reconnect-Versuch nach Ablauf des Retry-Timers
    async fn retry(self: Arc<Self>, token: LivenessToken) {
        if !self.liveness.is_current(token) || !self.set_status(SessionStatus::Connecting) {
            return;
        }

        match self.establish(token).await {
            Ok(()) => {
                tracing::info!("Reconnected");
                self.on_connected(token);
            }
            Err(e) => {
                if self.liveness.is_current(token) {
                    self.drop_connection().await;
                }
                self.handle_failure(token, e);
            }
        }
    }

    /// Unerwarteter Fehler: melden und ggf. Retry planen
    fn handle_failure(self: &Arc<Self>, token: LivenessToken, error: SessionError) {
        if !self.liveness.is_current(token) {
            return;
        }
        tracing::error!("Session failure: {}", error);
        self.report_error(&error);
        self.set_status(SessionStatus::Error);

        if error.needs_user_action() {
            tracing::warn!("Not retrying, user action required");
            return;
        }

        let policy = self.config.lock().reconnect.clone();
        let attempt = {
            let mut state = self.state.lock();
            if state.reconnect_attempts >= policy.max_attempts {
                None
            } else {
                state.reconnect_attempts += 1;
                Some(state.reconnect_attempts)
            }
        };

        let Some(attempt) = attempt else {
            let exhausted = SessionError::RetriesExhausted(policy.max_attempts);
            tracing::error!("{}", exhausted);
            self.report_error(&exhausted);
            return;
        };

        let delay = policy.delay_for(attempt - 1);
        tracing::warn!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt,
            policy.max_attempts
        );
        self.emit(SessionEvent::Reconnecting { attempt, delay });

        let weak = Arc::downgrade(self);
        self.scheduler.schedule(delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.retry(token).await;
            }
        });
    }

    /// Gemeinsamer Abbau für disconnect() und dispose()
    async fn shutdown(&self) {
        self.liveness.invalidate();
        self.scheduler.cancel();
        self.abort_tasks();
        self.drop_connection().await;

        {
            let mut audio = self.audio.lock();
            audio.detach_remote_track();
            audio.disable_microphone();
        }

        let was_active = {
            let mut state = self.state.lock();
            let was_active = state.status != SessionStatus::Disconnected;
            state.end();
            was_active
        };
        if was_active {
            self.set_status(SessionStatus::Disconnected);
            tracing::info!("Session disconnected");
        }
    }

    fn spawn_shutdown(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.shutdown().await });
    }

    fn abort_tasks(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Some((_, meter)) = self.meter.lock().take() {
            meter.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn track_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn drop_connection(&self) {
        let connection = self.connection.lock().take();
        if let Some((_, connection)) = connection {
            connection.close().await;
        }
    }

    async fn release_connection(&self, seq: u64) {
        let connection = {
            let mut slot = self.connection.lock();
            let is_current = matches!(slot.as_ref(), Some((current, _)) if *current == seq);
            if is_current {
                slot.take()
            } else {
                None
            }
        };
        if let Some((_, connection)) = connection {
            connection.close().await;
        }
    }

    fn is_current_connection(&self, seq: u64) -> bool {
        matches!(self.connection.lock().as_ref(), Some((current, _)) if *current == seq)
    }

    async fn send_frames(&self, frames: &[ClientEvent]) -> Result<(), SessionError> {
        if self.liveness.is_disposed() {
            return Err(SessionError::Disposed);
        }
        if self.state.lock().status != SessionStatus::Connected {
            return Err(SessionError::NotConnected);
        }
        let connection = self
            .connection
            .lock()
            .as_ref()
            .map(|(_, c)| Arc::clone(c))
            .ok_or(SessionError::NotConnected)?;

        for frame in frames {
            connection.send(frame).await?;
        }
        Ok(())
    }

    // ========================================================================
    // CONNECTION EVENTS
    // ========================================================================

    fn spawn_pump(
        self: &Arc<Self>,
        token: LivenessToken,
        seq: u64,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.liveness.is_current(token) {
                    break;
                }
                inner.handle_connection_event(token, seq, event);
            }
        });

        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    fn handle_connection_event(
        self: &Arc<Self>,
        token: LivenessToken,
        seq: u64,
        event: ConnectionEvent,
    ) {
        match event {
            ConnectionEvent::Frame(frame) => self.dispatch_frame(frame),
            ConnectionEvent::RemoteTrack(track) => {
                let attached = self.audio.lock().attach_remote_track(track);
                if let Err(e) = attached {
                    tracing::warn!("Failed to attach remote track: {}", e);
                    self.report_error(&SessionError::Audio(e));
                }
            }
            ConnectionEvent::PhaseChanged { phase, failure } => {
                // Fehler beim Aufbau meldet initialize() selbst
                if !self.is_current_connection(seq)
                    || self.state.lock().status != SessionStatus::Connected
                {
                    return;
                }

                match phase {
                    ConnectionPhase::Failed => {
                        let error = failure.unwrap_or_else(|| {
                            ConnectionError::TransportFailed("peer connection failed".into())
                        });
                        let inner = Arc::clone(self);
                        tokio::spawn(async move { inner.release_connection(seq).await });
                        self.handle_failure(token, SessionError::Connection(error));
                    }
                    ConnectionPhase::Disconnected => {
                        tracing::info!("Connection closed by remote");
                        self.spawn_shutdown();
                    }
                    _ => {}
                }
            }
        }
    }

    /// Übersetzt eingehende Frames in Session-Events, in Eingangsreihenfolge
    fn dispatch_frame(&self, frame: ServerEvent) {
        match frame {
            ServerEvent::SessionCreated { session } => {
                tracing::debug!("Session created");
                self.emit(SessionEvent::SessionCreated(session));
            }
            ServerEvent::SessionUpdated { session } => {
                self.emit(SessionEvent::SessionUpdated(session));
            }
            ServerEvent::ConversationItemCreated { item } => {
                self.emit(SessionEvent::ItemCreated(item));
            }
            ServerEvent::TextDelta { delta } => {
                self.state.lock().utterance.push_str(&delta);
                self.emit(SessionEvent::TextDelta(delta));
            }
            ServerEvent::TextDone { text } => {
                let text = {
                    let mut state = self.state.lock();
                    let buffered = std::mem::take(&mut state.utterance);
                    let text = if text.is_empty() { buffered } else { text };
                    state.transcript.push(TranscriptEntry {
                        role: Role::Assistant,
                        text: text.clone(),
                    });
                    text
                };
                self.emit(SessionEvent::TextDone(text));
            }
            ServerEvent::AudioDelta { delta } => match BASE64.decode(delta.as_bytes()) {
                Ok(pcm) => {
                    let rate = self.config.lock().audio.delta_sample_rate;
                    // PCM16 mono
                    let seconds = pcm.len() as f64 / (2.0 * rate as f64);
                    self.add_usage(0.0, seconds);
                    self.emit(SessionEvent::Audio(Bytes::from(pcm)));
                }
                Err(e) => tracing::warn!("Dropping audio delta with invalid base64: {}", e),
            },
            ServerEvent::InputTranscriptionCompleted { transcript, .. } => {
                self.state.lock().transcript.push(TranscriptEntry {
                    role: Role::User,
                    text: transcript.clone(),
                });
                self.emit(SessionEvent::UserTranscript(transcript));
            }
            ServerEvent::FunctionCall(call) => {
                tracing::info!("Function call requested: {}", call.name);
                self.emit(SessionEvent::FunctionCall(call));
            }
            ServerEvent::Error(info) => {
                tracing::warn!("Server error: {}", info.message);
                self.emit(SessionEvent::Error {
                    kind: ErrorKind::Protocol,
                    message: info.message,
                });
            }
            ServerEvent::Unrecognized { kind } => {
                tracing::debug!("Ignoring frame type {}", kind);
            }
        }
    }

    // ========================================================================
    // GOVERNANCE
    // ========================================================================

    fn add_usage(&self, input_seconds: f64, output_seconds: f64) {
        let usage = {
            let mut state = self.state.lock();
            let before = state.governor.usage();
            state.governor.add_input(input_seconds);
            state.governor.add_output(output_seconds);
            let after = state.governor.usage();
            if after == before {
                return;
            }
            after
        };
        self.emit(SessionEvent::CostUpdated {
            input_seconds: usage.input_seconds,
            output_seconds: usage.output_seconds,
            cost: usage.cost,
        });
    }

    /// Pegel-Messung und Limit-Prüfung im festen Takt, eine Schleife pro Epoche
    fn start_meter(self: &Arc<Self>, token: LivenessToken) {
        let mut slot = self.meter.lock();
        if let Some((running, handle)) = slot.as_ref() {
            if *running == token && !handle.is_finished() {
                return;
            }
        }

        let weak = Arc::downgrade(self);
        let interval = self.config.lock().audio.meter_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut last = AudioLevels::SILENT;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.liveness.is_current(token) {
                    break;
                }
                inner.meter_tick(token, interval, &mut last);
            }
        });

        if let Some((_, previous)) = slot.replace((token, handle)) {
            previous.abort();
        }
    }

    fn meter_tick(
        self: &Arc<Self>,
        token: LivenessToken,
        interval: Duration,
        last: &mut AudioLevels,
    ) {
        let levels = self.audio.lock().get_levels();
        if levels.distance(last) > 0.01 {
            *last = levels;
            self.emit(SessionEvent::AudioLevels(levels));
        }

        if self.state.lock().status != SessionStatus::Connected {
            return;
        }

        let threshold = self.config.lock().audio.activity_threshold;
        let seconds = interval.as_secs_f64();
        self.add_usage(
            if levels.input > threshold { seconds } else { 0.0 },
            if levels.output > threshold { seconds } else { 0.0 },
        );

        let action = {
            let mut state = self.state.lock();
            let elapsed = state.elapsed();
            state.governor.check(elapsed)
        };

        match action {
            Some(GovernorAction::TimeWarning { remaining }) => {
                tracing::info!("Session limit in {:?}", remaining);
                self.emit(SessionEvent::TimeWarning { remaining });
            }
            Some(GovernorAction::SessionComplete) => self.request_decision(token),
            Some(GovernorAction::MaxSessionsReached) => {
                tracing::warn!("Maximum session extensions reached, ending session");
                self.emit(SessionEvent::MaxSessionsReached);
                self.spawn_shutdown();
            }
            None => {}
        }
    }

    /// Feuert `SessionComplete` und wartet auf die Antwort des Aufrufers
    fn request_decision(self: &Arc<Self>, token: LivenessToken) {
        let (handle, decision) = DecisionHandle::new();
        if self.event_tx.send(SessionEvent::SessionComplete(handle)).is_err() {
            tracing::info!("Session limit reached without subscriber, ending session");
            self.apply_decision(token, SessionDecision::End);
            return;
        }

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let decision = decision.await.unwrap_or(SessionDecision::End);
            if let Some(inner) = weak.upgrade() {
                inner.apply_decision(token, decision);
            }
        });
        self.track_task(task);
    }

    fn apply_decision(self: &Arc<Self>, token: LivenessToken, decision: SessionDecision) {
        if !self.liveness.is_current(token) {
            return;
        }

        let outcome = {
            let mut state = self.state.lock();
            let elapsed = state.elapsed();
            state.governor.resolve(decision, elapsed)
        };

        match outcome {
            DecisionOutcome::Extended => tracing::info!("Session extended"),
            DecisionOutcome::Ended => {
                tracing::info!("Session ended at limit");
                self.spawn_shutdown();
            }
            DecisionOutcome::Ignored => {}
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
