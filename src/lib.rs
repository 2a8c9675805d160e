//! Realtime Voice - Voice-Sessions mit einem Realtime-Modell
//!
//! Eine Client-Bibliothek für Sprach-Sessions mit:
//! - Ephemeren Tokens und SDP-Negotiation per HTTP
//! - WebRTC für Audio und den JSON Control-Channel
//! - Reconnects mit exponentiellem Backoff
//! - Zeit- und Kostenkontrolle pro Session

pub mod audio;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod session;

#[cfg(test)]
mod testing;

pub use audio::{AudioError, AudioEvent, AudioIOManager, AudioLevels};
pub use config::{ConfigError, SessionConfig};
pub use connection::{ConnectionError, ConnectionManager, ConnectionPhase, PeerConnectionState};
pub use protocol::{ClientEvent, DecodeError, ServerEvent};
pub use session::{
    DecisionHandle, ErrorKind, SessionDecision, SessionDeps, SessionError, SessionEvent,
    SessionOrchestrator, SessionSnapshot, SessionStatus, TranscriptEntry,
};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den fmt-Subscriber, `RUST_LOG` überschreibt die Defaults
///
/// Mehrfache Aufrufe sind harmlos.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("realtime_voice=debug,webrtc=warn"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CONSOLE DRIVER
// ============================================================================

/// Befehl aus einer Eingabezeile
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Say(String),
    Mute,
    Unmute,
    Volume(f32),
    Instructions(String),
    Continue,
    End,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Say(line.to_string()));
    }

    let (name, arg) = match line.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (line, ""),
    };

    Some(match name {
        "/mute" => Command::Mute,
        "/unmute" => Command::Unmute,
        "/volume" => match arg.parse::<f32>() {
            Ok(level) => Command::Volume(level),
            Err(_) => Command::Unknown(line.to_string()),
        },
        "/instructions" => Command::Instructions(arg.to_string()),
        "/continue" => Command::Continue,
        "/end" => Command::End,
        "/quit" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    })
}

/// Gibt ein Session-Event auf der Konsole aus
fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StatusChanged(status) => println!("[status] {:?}", status),
        SessionEvent::TextDone(text) => println!("assistant: {}", text),
        SessionEvent::UserTranscript(text) => println!("you: {}", text),
        SessionEvent::FunctionCall(call) => {
            println!("[function] {}({}) id={}", call.name, call.arguments, call.call_id)
        }
        SessionEvent::Error { kind, message } => println!("[error] {:?}: {}", kind, message),
        SessionEvent::CostUpdated { cost, .. } => tracing::debug!("Cost: {:.4}", cost),
        SessionEvent::TimeWarning { remaining } => {
            println!("[limit] {}s remaining", remaining.as_secs())
        }
        SessionEvent::SessionComplete(_) => {
            println!("[limit] Session limit reached, /continue or /end")
        }
        SessionEvent::MaxSessionsReached => println!("[limit] Maximum session length reached"),
        SessionEvent::Reconnecting { attempt, delay } => {
            println!("[reconnect] attempt {} in {:?}", attempt, delay)
        }
        _ => {}
    }
}

fn resolve_pending(pending: &Mutex<Option<DecisionHandle>>, decision: SessionDecision) {
    let handle = pending.lock().take();
    match handle {
        Some(handle) => {
            handle.resolve(decision);
        }
        None => println!("No decision pending"),
    }
}

/// Konsolen-Client: verbindet eine Session und liest Befehle von stdin
pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("Starting realtime voice console...");

    let config = SessionConfig::from_env();
    let deps = SessionDeps::production(&config)?;
    let session = SessionOrchestrator::new(config, deps)?;

    // Event Handler starten
    let pending: Arc<Mutex<Option<DecisionHandle>>> = Arc::new(Mutex::new(None));
    let mut events = session.subscribe();
    let pending_ref = Arc::clone(&pending);
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let SessionEvent::SessionComplete(handle) = &event {
                        *pending_ref.lock() = Some(handle.clone());
                    }
                    print_event(&event);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Console lagged behind by {} events", n);
                }
                Err(_) => break,
            }
        }
    });

    session.connect().await?;
    println!("Connected. Type a message or /quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            continue;
        };

        let result = match command {
            Command::Say(text) => session.send_text(&text).await,
            Command::Mute => {
                session.mute();
                Ok(())
            }
            Command::Unmute => {
                session.unmute();
                Ok(())
            }
            Command::Volume(level) => {
                println!("[volume] {:.2}", session.set_volume(level));
                Ok(())
            }
            Command::Instructions(text) => session.update_instructions(&text).await,
            Command::Continue => {
                resolve_pending(&pending, SessionDecision::Continue);
                Ok(())
            }
            Command::End => {
                resolve_pending(&pending, SessionDecision::End);
                Ok(())
            }
            Command::Quit => break,
            Command::Unknown(input) => {
                println!("Unknown command: {}", input);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("[error] {}", e);
        }
    }

    session.dispose().await;
    printer.abort();
    tracing::info!("Console closed");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
