//! Schnittstellen zur Peer-Transport-Schicht
//!
//! Der ConnectionManager kennt nur diese Traits. `webrtc::WebRtcTransportFactory`
//! ist die Produktiv-Implementierung, Tests verwenden Mocks.

use super::manager::ConnectionError;
use crate::audio::{RemoteAudioTrack, SampleRing};
use crate::config::IceServerConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// STATES
// ============================================================================

/// Zustand der Peer-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE-Konnektivität
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Zustand des zuverlässigen Control-Channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Ereignisse der Transport-Schicht, in Eingangsreihenfolge
#[derive(Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    IceStateChanged(IceState),
    ChannelOpen,
    ChannelClosed,
    /// Text-Frame vom Control-Channel
    ChannelMessage(String),
    RemoteTrack(Arc<dyn RemoteAudioTrack>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::StateChanged(s) => write!(f, "StateChanged({:?})", s),
            TransportEvent::IceStateChanged(s) => write!(f, "IceStateChanged({:?})", s),
            TransportEvent::ChannelOpen => write!(f, "ChannelOpen"),
            TransportEvent::ChannelClosed => write!(f, "ChannelClosed"),
            TransportEvent::ChannelMessage(m) => write!(f, "ChannelMessage({} bytes)", m.len()),
            TransportEvent::RemoteTrack(t) => write!(f, "RemoteTrack({})", t.id()),
        }
    }
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

// ============================================================================
// TRAITS
// ============================================================================

/// Erzeugt Peer-Verbindungen
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), ConnectionError>;
}

/// Eine Peer-Verbindung
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Hängt das Mikrofon als lokalen Track an
    async fn add_local_audio(&self, feed: SampleRing) -> Result<(), ConnectionError>;

    /// Nur Empfang, wenn kein Mikrofon verfügbar ist
    async fn add_receive_only_audio(&self) -> Result<(), ConnectionError>;

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>, ConnectionError>;

    /// Erzeugt das Offer, setzt es lokal und liefert das SDP
    async fn create_offer(&self) -> Result<String, ConnectionError>;

    async fn apply_answer(&self, sdp: String) -> Result<(), ConnectionError>;

    async fn close(&self);
}

/// Der zuverlässige, geordnete Control-Channel
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn state(&self) -> ChannelState;

    async fn send_text(&self, text: String) -> Result<(), ConnectionError>;

    async fn close(&self);
}
