//! Opus Encoding/Decoding für die Media-Tracks
//!
//! Mit dem Feature `opus` wird libopus über audiopus verwendet. Ohne das
//! Feature wird kein lokales Audio gesendet und Remote-Audio als Stille
//! dekodiert; das wird einmalig als Warnung geloggt.

use super::FRAME_SIZE;

/// Maximale Größe eines Opus-Pakets
pub const MAX_PACKET_SIZE: usize = 4000;

/// Ob der Build Opus unterstützt
pub const fn is_available() -> bool {
    cfg!(feature = "opus")
}

#[cfg(feature = "opus")]
mod imp {
    use super::{FRAME_SIZE, MAX_PACKET_SIZE};
    use crate::audio::SAMPLE_RATE;
    use audiopus::coder::{Decoder, Encoder};
    use audiopus::{Application, Channels, SampleRate};

    pub struct OpusEncoder {
        encoder: Encoder,
    }

    impl OpusEncoder {
        pub fn new() -> Option<Self> {
            debug_assert_eq!(SAMPLE_RATE, 48000);
            match Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip) {
                Ok(encoder) => Some(Self { encoder }),
                Err(e) => {
                    tracing::error!("Failed to create Opus encoder: {}", e);
                    None
                }
            }
        }

        /// Kodiert einen 20ms Frame
        pub fn encode(&mut self, frame: &[f32]) -> Option<Vec<u8>> {
            let mut out = vec![0u8; MAX_PACKET_SIZE];
            match self.encoder.encode_float(frame, &mut out[..]) {
                Ok(len) => {
                    out.truncate(len);
                    Some(out)
                }
                Err(e) => {
                    tracing::warn!("Opus encode failed: {}", e);
                    None
                }
            }
        }
    }

    pub struct OpusDecoder {
        decoder: Option<Decoder>,
    }

    impl OpusDecoder {
        pub fn new() -> Self {
            let decoder = match Decoder::new(SampleRate::Hz48000, Channels::Mono) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    tracing::error!("Failed to create Opus decoder: {}", e);
                    None
                }
            };
            Self { decoder }
        }

        /// Dekodiert ein Paket, bei Fehlern ein Frame Stille
        pub fn decode(&mut self, packet: &[u8]) -> Vec<f32> {
            // 120ms ist die maximale Opus-Framegröße
            let mut out = vec![0.0f32; FRAME_SIZE * 6];
            let Some(decoder) = self.decoder.as_mut() else {
                return vec![0.0; FRAME_SIZE];
            };
            match decoder.decode_float(Some(packet), &mut out[..], false) {
                Ok(len) => {
                    out.truncate(len);
                    out
                }
                Err(e) => {
                    tracing::warn!("Opus decode failed: {}", e);
                    vec![0.0; FRAME_SIZE]
                }
            }
        }
    }
}

#[cfg(not(feature = "opus"))]
mod imp {
    use super::FRAME_SIZE;
    use std::sync::Once;

    static WARN_ONCE: Once = Once::new();

    fn warn_missing_codec() {
        WARN_ONCE.call_once(|| {
            tracing::warn!(
                "Built without the `opus` feature: local audio is not sent and remote audio is silent"
            );
        });
    }

    pub struct OpusEncoder;

    impl OpusEncoder {
        pub fn new() -> Option<Self> {
            warn_missing_codec();
            None
        }

        pub fn encode(&mut self, _frame: &[f32]) -> Option<Vec<u8>> {
            None
        }
    }

    pub struct OpusDecoder;

    impl OpusDecoder {
        pub fn new() -> Self {
            warn_missing_codec();
            Self
        }

        pub fn decode(&mut self, _packet: &[u8]) -> Vec<f32> {
            vec![0.0; FRAME_SIZE]
        }
    }
}

pub use imp::{OpusDecoder, OpusEncoder};
