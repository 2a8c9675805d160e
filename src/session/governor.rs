//! Zeit- und Kostenkontrolle einer Session
//!
//! Reine Zustandsmaschine ohne Timer: der Orchestrator übergibt die
//! verstrichene Zeit und bekommt die fälligen Aktionen zurück.

use crate::config::{CostModel, SessionLimits};
use super::events::SessionDecision;
use std::time::Duration;

/// Aktion, die der Orchestrator auslösen muss
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GovernorAction {
    TimeWarning { remaining: Duration },
    /// Wartet auf eine `SessionDecision`
    SessionComplete,
    /// Keine Verlängerungen mehr, Session wird beendet
    MaxSessionsReached,
}

/// Ergebnis einer `SessionDecision`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    Extended,
    Ended,
    /// Es stand keine Entscheidung aus
    Ignored,
}

/// Akkumulierte Audio-Nutzung
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub input_seconds: f64,
    pub output_seconds: f64,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct Governor {
    cost_model: CostModel,
    limits: SessionLimits,

    input_seconds: f64,
    output_seconds: f64,

    /// Beginn des aktuellen Limit-Fensters (relativ zum Session-Start)
    window_start: Duration,
    warned: bool,
    awaiting_decision: bool,
    extensions: u32,
    finished: bool,
}

impl Governor {
    pub fn new(cost_model: CostModel, limits: SessionLimits) -> Self {
        Self {
            cost_model,
            limits,
            input_seconds: 0.0,
            output_seconds: 0.0,
            window_start: Duration::ZERO,
            warned: false,
            awaiting_decision: false,
            extensions: 0,
            finished: false,
        }
    }

    /// Setzt alle Zähler für eine neue Session zurück
    pub fn reset(&mut self) {
        *self = Self::new(self.cost_model, self.limits.clone());
    }

    // ========================================================================
    // USAGE
    // ========================================================================

    pub fn add_input(&mut self, seconds: f64) {
        if seconds.is_finite() && seconds > 0.0 {
            self.input_seconds += seconds;
        }
    }

    pub fn add_output(&mut self, seconds: f64) {
        if seconds.is_finite() && seconds > 0.0 {
            self.output_seconds += seconds;
        }
    }

    /// Kosten sind immer aus den Sekunden abgeleitet
    pub fn usage(&self) -> Usage {
        Usage {
            input_seconds: self.input_seconds,
            output_seconds: self.output_seconds,
            cost: self.cost_model.cost(self.input_seconds, self.output_seconds),
        }
    }

    pub fn extensions_used(&self) -> u32 {
        self.extensions
    }

    pub fn is_awaiting_decision(&self) -> bool {
        self.awaiting_decision
    }

    // ========================================================================
    // LIMITS
    // ========================================================================

    /// Prüft die Limits zum Zeitpunkt `elapsed` (seit Session-Start)
    pub fn check(&mut self, elapsed: Duration) -> Option<GovernorAction> {
        if self.finished || self.awaiting_decision {
            return None;
        }

        let in_window = elapsed.saturating_sub(self.window_start);
        let soft_limit = self.limits.soft_limit();

        if in_window >= soft_limit {
            if self.extensions >= self.limits.max_extensions {
                self.finished = true;
                return Some(GovernorAction::MaxSessionsReached);
            }
            self.awaiting_decision = true;
            return Some(GovernorAction::SessionComplete);
        }

        if !self.warned && in_window >= self.limits.warning_at() {
            self.warned = true;
            return Some(GovernorAction::TimeWarning {
                remaining: soft_limit - in_window,
            });
        }

        None
    }

    /// Wendet die Entscheidung auf ein ausstehendes `SessionComplete` an
    pub fn resolve(&mut self, decision: SessionDecision, elapsed: Duration) -> DecisionOutcome {
        if !self.awaiting_decision {
            return DecisionOutcome::Ignored;
        }
        self.awaiting_decision = false;

        match decision {
            SessionDecision::Continue => {
                self.extensions += 1;
                self.window_start = elapsed;
                self.warned = false;
                DecisionOutcome::Extended
            }
            SessionDecision::End => {
                self.finished = true;
                DecisionOutcome::Ended
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
