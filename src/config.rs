//! Konfiguration einer Realtime-Voice-Session
//!
//! Alle Optionen liegen in expliziten Structs mit dokumentierten Defaults.
//! Die Validierung läuft genau einmal beim Erzeugen des Orchestrators.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(&'static str),

    #[error("Invalid URL for {field}: {value}")]
    InvalidUrl { field: &'static str, value: String },

    #[error("Value out of range for {field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

// ============================================================================
// DEFAULTS
// ============================================================================

/// Standard-Modell des Realtime-Endpoints
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Basis-URL des Negotiation-Endpoints
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/realtime";

/// Lokaler Token-Endpoint (wird vom Backend bereitgestellt)
pub const DEFAULT_TOKEN_ENDPOINT: &str = "http://localhost:3000/api/realtime/token";

/// Label des zuverlässigen Control-Channels
pub const DEFAULT_CHANNEL_LABEL: &str = "oai-events";

// ============================================================================
// CONNECTION
// ============================================================================

/// Ein STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

/// Verbindungsparameter für Token-Abruf und SDP-Negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// POST-Endpoint, der ein ephemeres Token ausstellt
    pub token_endpoint: String,
    /// Negotiation-Endpoint des Providers (ohne Query)
    pub base_url: String,
    /// Modell, wird als `?model=` angehängt
    pub model: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Maximale Dauer bis Transport UND Channel bereit sind
    pub connect_timeout_ms: u64,
    /// Timeout für einzelne HTTP-Requests
    pub http_timeout_ms: u64,
    pub channel_label: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            ice_servers: default_ice_servers(),
            connect_timeout_ms: 15_000,
            http_timeout_ms: 10_000,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

// ============================================================================
// SESSION SETTINGS (session.update payload)
// ============================================================================

/// Server-seitige Turn-Detection (VAD)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputTranscription {
    pub model: String,
}

/// Obergrenze für Output-Tokens: Zahl oder `"inf"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxTokens {
    Limited(u32),
    Infinite(String),
}

impl Default for MaxTokens {
    fn default() -> Self {
        MaxTokens::Infinite("inf".to_string())
    }
}

/// Session-Konfiguration, wie sie per `session.update` gesendet wird
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub model: String,
    pub modalities: Vec<String>,
    pub voice: String,
    pub instructions: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputTranscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    pub temperature: f32,
    pub max_response_output_tokens: MaxTokens,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: "alloy".to_string(),
            instructions: String::new(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: Some(InputTranscription {
                model: "whisper-1".to_string(),
            }),
            turn_detection: Some(TurnDetection::default()),
            temperature: 0.8,
            max_response_output_tokens: MaxTokens::default(),
        }
    }
}

// ============================================================================
// RECONNECT / COST / LIMITS
// ============================================================================

/// Retry-Verhalten bei unerwarteten Verbindungsabbrüchen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Obergrenze für eine einzelne Wartezeit
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl ReconnectPolicy {
    /// Wartezeit vor dem Retry mit Index `attempt` (0-basiert):
    /// `base_delay × multiplier^attempt`, höchstens `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay_ms as f64 / 1000.0 * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(max, |delay| delay.min(max))
    }
}

/// Preise pro Sekunde Audio
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub input_price_per_second: f64,
    pub output_price_per_second: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        // 0.06 / min Input, 0.24 / min Output
        Self {
            input_price_per_second: 0.001,
            output_price_per_second: 0.004,
        }
    }
}

impl CostModel {
    pub fn cost(&self, input_seconds: f64, output_seconds: f64) -> f64 {
        input_seconds * self.input_price_per_second + output_seconds * self.output_price_per_second
    }
}

/// Zeitliche Grenzen einer Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// Länge eines Limit-Fensters
    pub soft_limit_secs: u64,
    /// Vorwarnzeit vor dem Soft-Limit
    pub warning_lead_secs: u64,
    /// Anzahl erlaubter Verlängerungen (Hard-Limit)
    pub max_extensions: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            soft_limit_secs: 600,
            warning_lead_secs: 60,
            max_extensions: 2,
        }
    }
}

impl SessionLimits {
    pub fn soft_limit(&self) -> Duration {
        Duration::from_secs(self.soft_limit_secs)
    }

    pub fn warning_at(&self) -> Duration {
        Duration::from_secs(self.soft_limit_secs.saturating_sub(self.warning_lead_secs))
    }
}

// ============================================================================
// AUDIO
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Mikrofon beim Verbinden automatisch aktivieren
    pub enable_microphone: bool,
    pub initial_volume: f32,
    /// Ab diesem Pegel gilt ein Pfad als aktiv (für die Kostenrechnung)
    pub activity_threshold: f32,
    pub meter_interval_ms: u64,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Sample-Rate der `response.audio.delta` Chunks (PCM16 mono)
    pub delta_sample_rate: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enable_microphone: true,
            initial_volume: 1.0,
            activity_threshold: 0.05,
            meter_interval_ms: 100,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            delta_sample_rate: 24_000,
        }
    }
}

impl AudioSettings {
    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms)
    }
}

// ============================================================================
// SESSION CONFIG
// ============================================================================

/// Gesamtkonfiguration einer Session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub session: SessionSettings,
    pub reconnect: ReconnectPolicy,
    pub cost: CostModel,
    pub limits: SessionLimits,
    pub audio: AudioSettings,
}

impl SessionConfig {
    /// Defaults mit Überschreibungen aus Umgebungsvariablen
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var("REALTIME_TOKEN_ENDPOINT") {
            config.connection.token_endpoint = endpoint;
        }
        if let Ok(base_url) = std::env::var("REALTIME_BASE_URL") {
            config.connection.base_url = base_url;
        }
        if let Ok(model) = std::env::var("REALTIME_MODEL") {
            config.connection.model = model.clone();
            config.session.model = model;
        }
        if let Ok(voice) = std::env::var("REALTIME_VOICE") {
            config.session.voice = voice;
        }
        if let Ok(instructions) = std::env::var("REALTIME_INSTRUCTIONS") {
            config.session.instructions = instructions;
        }

        config
    }

    /// Prüft die Konfiguration einmalig
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("connection.token_endpoint", &self.connection.token_endpoint)?;
        check_url("connection.base_url", &self.connection.base_url)?;

        if self.connection.model.trim().is_empty() {
            return Err(ConfigError::Missing("connection.model"));
        }
        if self.connection.channel_label.is_empty() {
            return Err(ConfigError::Missing("connection.channel_label"));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(out_of_range("connection.connect_timeout_ms", "must be > 0"));
        }

        let multiplier = self.reconnect.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(out_of_range(
                "reconnect.backoff_multiplier",
                "must be finite and >= 1.0",
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(out_of_range(
                "reconnect.max_delay_ms",
                "must not be smaller than the base delay",
            ));
        }

        let prices = [
            self.cost.input_price_per_second,
            self.cost.output_price_per_second,
        ];
        if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(out_of_range("cost", "prices must be finite and not negative"));
        }

        if self.limits.soft_limit_secs == 0 {
            return Err(out_of_range("limits.soft_limit_secs", "must be > 0"));
        }
        if self.limits.warning_lead_secs >= self.limits.soft_limit_secs {
            return Err(out_of_range(
                "limits.warning_lead_secs",
                "must be smaller than the soft limit",
            ));
        }

        if self.audio.meter_interval_ms == 0 {
            return Err(out_of_range("audio.meter_interval_ms", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.audio.initial_volume) {
            return Err(out_of_range("audio.initial_volume", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.audio.activity_threshold) {
            return Err(out_of_range("audio.activity_threshold", "must be within [0, 1]"));
        }
        if self.audio.delta_sample_rate == 0 {
            return Err(out_of_range("audio.delta_sample_rate", "must be > 0"));
        }

        Ok(())
    }
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Missing(field));
    }
    match url::Url::parse(value) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        }),
    }
}

fn out_of_range(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        reason: reason.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
