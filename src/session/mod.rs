//! Session Module - Lebenszyklus einer Realtime-Voice-Session
//!
//! Dieses Modul verwaltet:
//! - Das Event-Vokabular für den Aufrufer
//! - Reconnects mit exponentiellem Backoff
//! - Zeit- und Kostenkontrolle
//! - Den SessionOrchestrator als öffentliche Schnittstelle

mod events;
mod governor;
mod orchestrator;
mod scheduler;

pub use events::{
    DecisionHandle, ErrorKind, SessionDecision, SessionEvent, SessionSnapshot, SessionStatus,
    TranscriptEntry,
};
pub use governor::{DecisionOutcome, Governor, GovernorAction, Usage};
pub use orchestrator::{SessionDeps, SessionError, SessionOrchestrator};
pub use scheduler::{Liveness, LivenessToken, RetryScheduler};
