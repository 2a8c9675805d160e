//! Event-Vokabular der Session
//!
//! Der Aufrufer sieht nur diese Typen. Control-Frames werden vom
//! Orchestrator in `SessionEvent`s übersetzt.

use crate::audio::AudioLevels;
use crate::protocol::{FunctionCall, ItemInfo, Role};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

// ============================================================================
// STATUS
// ============================================================================

/// Status einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl SessionStatus {
    /// Erlaubte Übergänge der Status-Maschine
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Error)
                | (Connected, Disconnected)
                | (Error, Connecting)
                | (Error, Disconnected)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Connected)
    }
}

// ============================================================================
// ERROR KIND
// ============================================================================

/// Fehlerursache ohne Details, für die Deduplizierung von Error-Events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    Audio,
    TokenFetch,
    Negotiation,
    TransportFailed,
    ChannelUnavailable,
    Protocol,
    Config,
    NotConnected,
    Disposed,
    Aborted,
    RetriesExhausted,
}

// ============================================================================
// DECISION
// ============================================================================

/// Antwort auf `SessionComplete`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDecision {
    /// Neues Limit-Fenster beginnen
    Continue,
    /// Session beenden
    End,
}

/// Handle zum Beantworten eines `SessionComplete`-Events
///
/// Nur die erste Antwort zählt. Werden alle Handles verworfen ohne zu
/// antworten, gilt `End`.
#[derive(Clone)]
pub struct DecisionHandle {
    tx: Arc<Mutex<Option<oneshot::Sender<SessionDecision>>>>,
}

impl DecisionHandle {
    pub(crate) fn new() -> (Self, oneshot::Receiver<SessionDecision>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Gibt `false` zurück, wenn bereits entschieden wurde
    pub fn resolve(&self, decision: SessionDecision) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn continue_session(&self) -> bool {
        self.resolve(SessionDecision::Continue)
    }

    pub fn end_session(&self) -> bool {
        self.resolve(SessionDecision::End)
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl std::fmt::Debug for DecisionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionHandle")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der Session ausgelöst werden
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged(SessionStatus),
    SessionCreated(serde_json::Value),
    SessionUpdated(serde_json::Value),
    ItemCreated(ItemInfo),
    TextDelta(String),
    /// Abgeschlossene Äußerung des Assistenten
    TextDone(String),
    /// Dekodiertes PCM16 aus `response.audio.delta`
    Audio(Bytes),
    /// Transkribierte Sprache des Benutzers
    UserTranscript(String),
    FunctionCall(FunctionCall),
    Error {
        kind: ErrorKind,
        message: String,
    },
    CostUpdated {
        input_seconds: f64,
        output_seconds: f64,
        cost: f64,
    },
    TimeWarning {
        remaining: Duration,
    },
    SessionComplete(DecisionHandle),
    MaxSessionsReached,
    AudioLevels(AudioLevels),
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Eine abgeschlossene Äußerung
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
}

/// Lesende Sicht auf die Session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: Option<Uuid>,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub input_seconds: f64,
    pub output_seconds: f64,
    pub cost: f64,
    pub reconnect_attempts: u32,
    pub extensions_used: u32,
}

// ============================================================================
// TESTS
// ============================================================================
