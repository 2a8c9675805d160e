//! Connection Module - Token, SDP-Negotiation und Peer-Verbindung
//!
//! Dieses Modul verwaltet:
//! - Ephemere Tokens und den SDP-Austausch per HTTP
//! - Die Peer Connection samt Control-Channel (WebRTC)
//! - Die Verbindungs-Zustandsmaschine (ConnectionManager)

mod http;
mod manager;
mod transport;
mod webrtc;

pub use http::{EphemeralToken, HttpNegotiator, HttpTokenProvider, SdpNegotiator, TokenProvider};
pub use manager::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionPhase, PeerConnectionState,
};
pub use transport::{
    ChannelState, ControlChannel, IceState, PeerTransport, TransportEvent, TransportEvents,
    TransportFactory, TransportState,
};
pub use self::webrtc::WebRtcTransportFactory;
