//! WebRTC-Transport auf Basis von webrtc-rs
//!
//! Eine Peer Connection mit:
//! - einem Opus-Audio-Track (sendrecv) oder einem reinen Empfangs-Transceiver
//! - einem geordneten Data-Channel für die JSON-Frames
//!
//! Alle Callbacks werden als `TransportEvent` über einen mpsc-Kanal
//! weitergereicht, damit der ConnectionManager sie der Reihe nach
//! verarbeiten kann.

use super::manager::ConnectionError;
use super::transport::{
    ChannelState, ControlChannel, IceState, PeerTransport, TransportEvent, TransportEvents,
    TransportFactory, TransportState,
};
use crate::audio::opus::{OpusDecoder, OpusEncoder};
use crate::audio::{RemoteAudioTrack, SampleRing, FRAME_SIZE, SAMPLE_RATE};
use crate::config::IceServerConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Dauer eines Audio-Frames (20ms)
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Gepufferte dekodierte Frames pro Remote-Track
const REMOTE_FRAME_QUEUE: usize = 50;

fn webrtc_error(e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::TransportFailed(e.to_string())
}

// ============================================================================
// STATE MAPPING
// ============================================================================

fn map_peer_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
    }
}

fn map_channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
            ChannelState::Connecting
        }
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
    }
}

fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt echte WebRTC Peer Connections
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), ConnectionError> {
        // Media Engine mit Opus konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_error)?);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let transport = WebRtcTransport {
            pc,
            event_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        };
        transport.register_handlers();

        Ok((Arc::new(transport), event_rx))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Sende-Schleife und Empfangs-Pumps
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WebRtcTransport {
    /// Registriert Event Handler für die Peer Connection
    fn register_handlers(&self) {
        let event_tx = self.event_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let _ = event_tx.send(TransportEvent::StateChanged(map_peer_state(s)));
                Box::pin(async {})
            }));

        let event_tx = self.event_tx.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let _ = event_tx.send(TransportEvent::IceStateChanged(map_ice_state(s)));
                Box::pin(async {})
            }));

        // Track Handler (für eingehendes Audio)
        let event_tx = self.event_tx.clone();
        let tasks = Arc::clone(&self.tasks);
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let event_tx = event_tx.clone();
            let tasks = Arc::clone(&tasks);
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    tracing::debug!("Ignoring non-audio track {}", track.id());
                    return;
                }
                tracing::info!("Received track: {:?}", track.codec().capability.mime_type);

                let (frame_tx, frame_rx) = mpsc::channel(REMOTE_FRAME_QUEUE);
                let remote = WebRtcRemoteTrack {
                    id: track.id(),
                    frames: tokio::sync::Mutex::new(frame_rx),
                };

                tasks.lock().push(tokio::spawn(decode_remote_track(track, frame_tx)));
                let _ = event_tx.send(TransportEvent::RemoteTrack(Arc::new(remote)));
            })
        }));
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_local_audio(&self, feed: SampleRing) -> Result<(), ConnectionError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "realtime-voice".to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_error)?;

        self.tasks.lock().push(tokio::spawn(send_local_audio(track, feed)));
        Ok(())
    }

    async fn add_receive_only_audio(&self) -> Result<(), ConnectionError> {
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(webrtc_error)?;
        Ok(())
    }

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>, ConnectionError> {
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(webrtc_error)?;

        let event_tx = self.event_tx.clone();
        dc.on_open(Box::new(move || {
            let _ = event_tx.send(TransportEvent::ChannelOpen);
            Box::pin(async {})
        }));

        let event_tx = self.event_tx.clone();
        dc.on_close(Box::new(move || {
            let _ = event_tx.send(TransportEvent::ChannelClosed);
            Box::pin(async {})
        }));

        let event_tx = self.event_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = event_tx.send(TransportEvent::ChannelMessage(text));
                }
                Err(e) => tracing::warn!("Dropping non-UTF-8 control frame: {}", e),
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcChannel { dc }))
    }

    async fn create_offer(&self) -> Result<String, ConnectionError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_error)?;

        // Kein Trickle-ICE: das Offer enthält alle Kandidaten
        let mut gathering_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_error)?;
        let _ = gathering_complete.recv().await;

        let sdp = self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or(offer.sdp);
        Ok(sdp)
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), ConnectionError> {
        let answer =
            RTCSessionDescription::answer(sdp).map_err(|e| ConnectionError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(webrtc_error)
    }

    async fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

/// Liest 20ms-Frames aus dem Mikrofon-Feed, kodiert sie und schreibt sie in den Track
async fn send_local_audio(track: Arc<TrackLocalStaticSample>, feed: SampleRing) {
    let Some(mut encoder) = OpusEncoder::new() else {
        return;
    };

    let mut ticker = tokio::time::interval(FRAME_DURATION);
    loop {
        ticker.tick().await;
        while let Some(frame) = feed.read_frame(FRAME_SIZE) {
            let Some(packet) = encoder.encode(&frame) else {
                continue;
            };
            let sample = Sample {
                data: packet.into(),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!("Local track closed: {}", e);
                return;
            }
        }
    }
}

/// Liest RTP-Pakete des Remote-Tracks und dekodiert sie zu PCM-Frames
async fn decode_remote_track(track: Arc<TrackRemote>, frames: mpsc::Sender<Vec<f32>>) {
    let mut decoder = OpusDecoder::new();

    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                let pcm = decoder.decode(&packet.payload);
                if frames.send(pcm).await.is_err() {
                    tracing::debug!("Remote audio consumer gone");
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Remote track read ended: {}", e);
                break;
            }
        }
    }
}

// ============================================================================
// CONTROL CHANNEL
// ============================================================================

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl ControlChannel for WebRtcChannel {
    fn state(&self) -> ChannelState {
        map_channel_state(self.dc.ready_state())
    }

    async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if self.dc.ready_state() != RTCDataChannelState::Open {
            return Err(ConnectionError::ChannelUnavailable);
        }
        self.dc.send_text(text).await.map_err(webrtc_error)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            tracing::debug!("Failed to close control channel: {}", e);
        }
    }
}

// ============================================================================
// REMOTE TRACK
// ============================================================================

pub struct WebRtcRemoteTrack {
    id: String,
    frames: tokio::sync::Mutex<mpsc::Receiver<Vec<f32>>>,
}

#[async_trait]
impl RemoteAudioTrack for WebRtcRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn next_frame(&self) -> Option<Vec<f32>> {
        self.frames.lock().await.recv().await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_peer_state(RTCPeerConnectionState::Connected),
            TransportState::Connected
        );
        assert_eq!(
            map_peer_state(RTCPeerConnectionState::Unspecified),
            TransportState::New
        );
        assert_eq!(map_ice_state(RTCIceConnectionState::Failed), IceState::Failed);
        assert_eq!(
            map_channel_state(RTCDataChannelState::Open),
            ChannelState::Open
        );
    }

    #[test]
    fn test_ice_server_conversion() {
        let servers = vec![IceServerConfig {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: "user".to_string(),
            credential: "pass".to_string(),
        }];

        let rtc = to_rtc_ice_servers(&servers);
        assert_eq!(rtc.len(), 1);
        assert_eq!(rtc[0].urls, servers[0].urls);
        assert_eq!(rtc[0].username, "user");
        assert_eq!(rtc[0].credential, "pass");
    }

    #[tokio::test]
    async fn test_offer_contains_audio_and_data_channel() {
        let factory = WebRtcTransportFactory::new();
        let (transport, _events) = factory.create(&[]).await.unwrap();

        transport.add_receive_only_audio().await.unwrap();
        let channel = transport.open_channel("oai-events").await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connecting);

        let sdp = transport.create_offer().await.unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=application"));
        assert!(sdp.contains("a=recvonly"));

        assert_eq!(
            channel.send_text("{}".to_string()).await,
            Err(ConnectionError::ChannelUnavailable)
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn test_invalid_answer_is_rejected() {
        let factory = WebRtcTransportFactory::new();
        let (transport, _events) = factory.create(&[]).await.unwrap();
        let _channel = transport.open_channel("oai-events").await.unwrap();
        transport.create_offer().await.unwrap();

        assert!(transport.apply_answer("not sdp".to_string()).await.is_err());
        transport.close().await;
    }
}
