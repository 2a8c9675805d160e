//! ConnectionManager - Token, Negotiation und Peer-Lifecycle
//!
//! Zustandsmaschine:
//! `Idle → TokenAcquired → Negotiating → Connected → {Disconnected | Failed}`
//!
//! `Connected` wird erst erreicht, wenn der Transport verbunden UND der
//! Control-Channel offen ist. `Failed` und `Disconnected` sind terminal,
//! für einen neuen Versuch braucht es eine neue Instanz.

use super::http::{SdpNegotiator, TokenProvider};
use super::transport::{
    ChannelState, ControlChannel, IceState, PeerTransport, TransportEvent, TransportEvents,
    TransportFactory, TransportState,
};
use crate::audio::{RemoteAudioTrack, SampleRing};
use crate::config::ConnectionConfig;
use crate::protocol::{self, ClientEvent, EncodeError, ServerEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Failed to fetch ephemeral token: {0}")]
    TokenFetch(String),

    #[error("SDP negotiation failed with status {status}: {body}")]
    Negotiation { status: u16, body: String },

    #[error("SDP negotiation request failed: {0}")]
    NegotiationRequest(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Transport failed: {0}")]
    TransportFailed(String),

    #[error("Control channel is not open")]
    ChannelUnavailable,

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Operation not allowed in state {0:?}")]
    InvalidState(ConnectionPhase),

    #[error("Connection manager has been closed")]
    Disposed,
}

// ============================================================================
// STATE
// ============================================================================

/// Phase der Verbindungs-Zustandsmaschine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Idle,
    TokenAcquired,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionPhase::Disconnected | ConnectionPhase::Failed)
    }
}

/// Snapshot des Transport-Zustands (nur lesend nach außen)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerConnectionState {
    pub phase: ConnectionPhase,
    pub transport: TransportState,
    pub ice: IceState,
    pub channel: ChannelState,
    /// Ursache, falls `phase == Failed`
    pub failure: Option<ConnectionError>,
}

impl PeerConnectionState {
    pub fn is_ready(&self) -> bool {
        self.transport == TransportState::Connected && self.channel == ChannelState::Open
    }
}

/// Events die vom ConnectionManager ausgelöst werden
#[derive(Clone)]
pub enum ConnectionEvent {
    PhaseChanged {
        phase: ConnectionPhase,
        failure: Option<ConnectionError>,
    },
    /// Dekodierter Frame vom Control-Channel, in Eingangsreihenfolge
    Frame(ServerEvent),
    RemoteTrack(Arc<dyn RemoteAudioTrack>),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::PhaseChanged { phase, failure } => f
                .debug_struct("PhaseChanged")
                .field("phase", phase)
                .field("failure", failure)
                .finish(),
            ConnectionEvent::Frame(frame) => f.debug_tuple("Frame").field(frame).finish(),
            ConnectionEvent::RemoteTrack(track) => {
                f.debug_tuple("RemoteTrack").field(&track.id()).finish()
            }
        }
    }
}

/// Nächste Phase aus dem aktuellen Snapshot, `None` wenn unverändert
pub(crate) fn next_phase(
    state: &PeerConnectionState,
) -> Option<(ConnectionPhase, Option<ConnectionError>)> {
    let transport_failed =
        state.transport == TransportState::Failed || state.ice == IceState::Failed;

    match state.phase {
        ConnectionPhase::Idle | ConnectionPhase::Disconnected | ConnectionPhase::Failed => None,
        ConnectionPhase::TokenAcquired | ConnectionPhase::Negotiating => {
            if transport_failed {
                Some((
                    ConnectionPhase::Failed,
                    Some(ConnectionError::TransportFailed(
                        "peer connection failed during negotiation".to_string(),
                    )),
                ))
            } else if state.transport == TransportState::Closed {
                Some((
                    ConnectionPhase::Failed,
                    Some(ConnectionError::TransportFailed(
                        "peer connection closed during negotiation".to_string(),
                    )),
                ))
            } else if state.phase == ConnectionPhase::Negotiating && state.is_ready() {
                Some((ConnectionPhase::Connected, None))
            } else {
                None
            }
        }
        ConnectionPhase::Connected => {
            if transport_failed {
                Some((
                    ConnectionPhase::Failed,
                    Some(ConnectionError::TransportFailed(
                        "peer connection failed".to_string(),
                    )),
                ))
            } else if state.transport == TransportState::Closed
                || state.channel == ChannelState::Closed
            {
                Some((ConnectionPhase::Disconnected, None))
            } else {
                None
            }
        }
    }
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

/// Besitzt genau eine Peer-Verbindung samt Control-Channel
pub struct ConnectionManager {
    config: ConnectionConfig,
    tokens: Arc<dyn TokenProvider>,
    negotiator: Arc<dyn SdpNegotiator>,
    transports: Arc<dyn TransportFactory>,

    state_tx: Arc<watch::Sender<PeerConnectionState>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,

    transport: Mutex<Option<Arc<dyn PeerTransport>>>,
    channel: Mutex<Option<Arc<dyn ControlChannel>>>,
    pump: Mutex<Option<JoinHandle<()>>>,

    /// Späte Callbacks nach close() werden verworfen
    alive: Arc<AtomicBool>,
    send_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Erstellt einen neuen ConnectionManager samt Event-Receiver
    pub fn new(
        config: ConnectionConfig,
        tokens: Arc<dyn TokenProvider>,
        negotiator: Arc<dyn SdpNegotiator>,
        transports: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(PeerConnectionState::default());

        let manager = Self {
            config,
            tokens,
            negotiator,
            transports,
            state_tx: Arc::new(state_tx),
            event_tx,
            transport: Mutex::new(None),
            channel: Mutex::new(None),
            pump: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(true)),
            send_lock: tokio::sync::Mutex::new(()),
        };

        (manager, event_rx)
    }

    /// Gibt den aktuellen Zustand zurück
    pub fn get_state(&self) -> PeerConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state_tx.borrow().phase
    }

    /// Receiver für Zustandsänderungen
    pub fn watch_state(&self) -> watch::Receiver<PeerConnectionState> {
        self.state_tx.subscribe()
    }

    /// Baut die Verbindung auf: Token → Peer/Channel/Offer → Answer → Connected
    ///
    /// Bei jedem Fehler werden alle bis dahin erzeugten Ressourcen
    /// freigegeben, bevor der Fehler zurückgegeben wird.
    pub async fn initialize(&self, local_audio: Option<SampleRing>) -> Result<(), ConnectionError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ConnectionError::Disposed);
        }
        let phase = self.phase();
        if phase != ConnectionPhase::Idle {
            return Err(ConnectionError::InvalidState(phase));
        }

        match self.run_setup(local_audio).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!("Connection setup failed: {}", err);
                self.teardown().await;
                transition(
                    &self.state_tx,
                    &self.event_tx,
                    ConnectionPhase::Failed,
                    Some(err.clone()),
                );
                Err(err)
            }
        }
    }

    async fn run_setup(&self, local_audio: Option<SampleRing>) -> Result<(), ConnectionError> {
        // 1. Token holen
        let token = self.tokens.fetch_token().await?;
        self.ensure_alive()?;
        transition(
            &self.state_tx,
            &self.event_tx,
            ConnectionPhase::TokenAcquired,
            None,
        );

        // 2. Peer Connection, lokaler Track, Control-Channel
        let (transport, events) = self.transports.create(&self.config.ice_servers).await?;
        *self.transport.lock() = Some(Arc::clone(&transport));
        self.ensure_alive()?;
        self.start_pump(events);

        match local_audio {
            Some(feed) => transport.add_local_audio(feed).await?,
            None => {
                tracing::info!("No microphone available, negotiating receive-only audio");
                transport.add_receive_only_audio().await?;
            }
        }

        let channel = transport.open_channel(&self.config.channel_label).await?;
        *self.channel.lock() = Some(channel);
        self.ensure_alive()?;

        // Offer erstellen und beim Provider gegen das Answer tauschen
        transition(
            &self.state_tx,
            &self.event_tx,
            ConnectionPhase::Negotiating,
            None,
        );
        let offer = transport.create_offer().await?;
        let answer = self.negotiator.negotiate(&offer, &token).await?;
        self.ensure_alive()?;
        transport.apply_answer(answer).await?;

        // 3. Auf Transport UND Channel warten
        reevaluate(&self.state_tx, &self.event_tx);
        self.wait_until_connected().await
    }

    async fn wait_until_connected(&self) -> Result<(), ConnectionError> {
        let mut rx = self.state_tx.subscribe();

        let wait = async {
            loop {
                {
                    let state = rx.borrow_and_update();
                    match state.phase {
                        ConnectionPhase::Connected => return Ok(()),
                        ConnectionPhase::Failed => {
                            return Err(state.failure.clone().unwrap_or_else(|| {
                                ConnectionError::TransportFailed("peer connection failed".into())
                            }))
                        }
                        ConnectionPhase::Disconnected => {
                            return Err(ConnectionError::TransportFailed(
                                "peer connection closed".to_string(),
                            ))
                        }
                        _ => {}
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(ConnectionError::Disposed);
                }
            }
        };

        match tokio::time::timeout(self.config.connect_timeout(), wait).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::TransportFailed(format!(
                "not connected after {:?} (transport and control channel must both be ready)",
                self.config.connect_timeout()
            ))),
        }
    }

    /// Sendet einen Frame, nur bei offenem Channel
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ConnectionError> {
        let _guard = self.send_lock.lock().await;

        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or(ConnectionError::ChannelUnavailable)?;
        if channel.state() != ChannelState::Open {
            return Err(ConnectionError::ChannelUnavailable);
        }

        let text = protocol::encode(event)?;
        tracing::debug!("Sending {} frame", event.kind());
        channel.send_text(text).await
    }

    /// Schließt die Verbindung (idempotent)
    pub async fn close(&self) {
        if !self.phase().is_terminal() {
            transition(
                &self.state_tx,
                &self.event_tx,
                ConnectionPhase::Disconnected,
                None,
            );
        }
        self.teardown().await;
    }

    /// Gibt Channel, Transport und Pump frei
    async fn teardown(&self) {
        self.alive.store(false, Ordering::SeqCst);

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await;
        }

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.close().await;
            tracing::info!("Peer connection closed");
        }
    }

    fn ensure_alive(&self) -> Result<(), ConnectionError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::Disposed)
        }
    }

    /// Verarbeitet Transport-Events der Reihe nach
    fn start_pump(&self, mut events: TransportEvents) {
        let state_tx = Arc::clone(&self.state_tx);
        let event_tx = self.event_tx.clone();
        let alive = Arc::clone(&self.alive);

        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                handle_transport_event(event, &state_tx, &event_tx);
            }
        });

        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }
}

fn handle_transport_event(
    event: TransportEvent,
    state_tx: &watch::Sender<PeerConnectionState>,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    match event {
        TransportEvent::StateChanged(s) => {
            tracing::info!("Peer connection state: {:?}", s);
            state_tx.send_modify(|state| state.transport = s);
            reevaluate(state_tx, event_tx);
        }
        TransportEvent::IceStateChanged(s) => {
            tracing::debug!("ICE connection state: {:?}", s);
            state_tx.send_modify(|state| state.ice = s);
            reevaluate(state_tx, event_tx);
        }
        TransportEvent::ChannelOpen => {
            tracing::info!("Control channel open");
            state_tx.send_modify(|state| state.channel = ChannelState::Open);
            reevaluate(state_tx, event_tx);
        }
        TransportEvent::ChannelClosed => {
            tracing::info!("Control channel closed");
            state_tx.send_modify(|state| state.channel = ChannelState::Closed);
            reevaluate(state_tx, event_tx);
        }
        TransportEvent::ChannelMessage(text) => match protocol::decode(&text) {
            Ok(frame) => {
                let _ = event_tx.send(ConnectionEvent::Frame(frame));
            }
            Err(e) => {
                tracing::warn!("Dropping inbound frame: {}", e);
            }
        },
        TransportEvent::RemoteTrack(track) => {
            tracing::info!("Received remote track {}", track.id());
            let _ = event_tx.send(ConnectionEvent::RemoteTrack(track));
        }
    }
}

/// Wendet die nächste Phase atomar an und meldet sie
fn reevaluate(
    state_tx: &watch::Sender<PeerConnectionState>,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut change = None;
    state_tx.send_if_modified(|state| match next_phase(state) {
        Some((phase, failure)) => {
            state.phase = phase;
            state.failure = failure.clone();
            change = Some((phase, failure));
            true
        }
        None => false,
    });

    if let Some((phase, failure)) = change {
        tracing::info!("Connection phase: {:?}", phase);
        let _ = event_tx.send(ConnectionEvent::PhaseChanged { phase, failure });
    }
}

/// Setzt eine Phase explizit, terminale Phasen bleiben bestehen
fn transition(
    state_tx: &watch::Sender<PeerConnectionState>,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    phase: ConnectionPhase,
    failure: Option<ConnectionError>,
) {
    let changed = state_tx.send_if_modified(|state| {
        if state.phase.is_terminal() || state.phase == phase {
            return false;
        }
        state.phase = phase;
        state.failure = failure.clone();
        true
    });

    if changed {
        tracing::info!("Connection phase: {:?}", phase);
        let _ = event_tx.send(ConnectionEvent::PhaseChanged { phase, failure });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }

        let channel = self.channel.get_mut().take();
        let transport = self.transport.get_mut().take();
        if channel.is_none() && transport.is_none() {
            return;
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Some(channel) = channel {
                    channel.close().await;
                }
                if let Some(transport) = transport {
                    transport.close().await;
                }
            });
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.get_state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
