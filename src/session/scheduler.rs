//! Retry-Timer und Liveness-Prüfung
//!
//! `RetryScheduler` hält höchstens einen ausstehenden Timer. `Liveness`
//! bindet Callbacks an eine Epoche: nach `invalidate()` werden späte
//! Callbacks der alten Epoche verworfen.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// LIVENESS
// ============================================================================

/// Epoche, an die ein Callback gebunden ist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessToken(u64);

#[derive(Debug, Clone, Default)]
pub struct Liveness {
    epoch: Arc<AtomicU64>,
    disposed: Arc<AtomicBool>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> LivenessToken {
        LivenessToken(self.epoch.load(Ordering::SeqCst))
    }

    /// Ob ein Callback mit diesem Token noch wirken darf
    pub fn is_current(&self, token: LivenessToken) -> bool {
        !self.is_disposed() && self.epoch.load(Ordering::SeqCst) == token.0
    }

    /// Macht alle bisherigen Tokens ungültig und gibt ein neues zurück
    pub fn invalidate(&self) -> LivenessToken {
        LivenessToken(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Endgültig, kein Token ist danach mehr gültig
    pub fn dispose(&self) -> bool {
        self.invalidate();
        !self.disposed.swap(true, Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// RETRY SCHEDULER
// ============================================================================

/// Genau ein ausstehender Retry-Timer
#[derive(Debug, Default)]
pub struct RetryScheduler {
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant `task` nach `delay`, ein vorher geplanter Timer wird verworfen
    ///
    /// Nach Ablauf läuft `task` als eigener Task, damit ein erneutes
    /// `schedule` aus dem Retry heraus den laufenden Versuch nicht abbricht.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(task);
        });

        if let Some(previous) = self.slot.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Verwirft den ausstehenden Timer, `true` wenn einer ausstand
    pub fn cancel(&self) -> bool {
        match self.slot.lock().take() {
            Some(timer) => {
                let pending = !timer.is_finished();
                timer.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .map(|timer| !timer.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.slot.get_mut().take() {
            timer.abort();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
