//! Message Types für das Control-Channel-Protokoll
//!
//! Diese Strukturen spiegeln das JSON-Schema des Realtime-Endpoints wider
//! und ermöglichen typsichere Kommunikation über den Data-Channel.

use crate::config::SessionSettings;
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle ausgehenden Frames
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Session-Konfiguration aktualisieren
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    /// Item in die Konversation einfügen
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    /// Antwort des Modells anfordern
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseOptions>,
    },

    /// Laufende Antwort abbrechen
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// Text-Nachricht des Benutzers
    pub fn user_text(text: impl Into<String>) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::Message {
                role: Role::User,
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }

    /// Ergebnis eines Function-Calls
    pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
        }
    }

    pub fn response() -> Self {
        ClientEvent::ResponseCreate { response: None }
    }

    /// Protokoll-Name des Frames
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: Role,
        content: Vec<ContentPart>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}

/// Optionale Parameter für `response.create`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle eingehenden Frames nach dem Dekodieren
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionCreated { session: serde_json::Value },
    SessionUpdated { session: serde_json::Value },
    ConversationItemCreated { item: ItemInfo },
    TextDelta { delta: String },
    TextDone { text: String },
    /// Base64-kodiertes PCM16
    AudioDelta { delta: String },
    InputTranscriptionCompleted { item_id: String, transcript: String },
    FunctionCall(FunctionCall),
    Error(ErrorInfo),
    /// Unbekannter Frame-Typ, wird ignoriert
    Unrecognized { kind: String },
}

/// Kurzinfo zu einem Konversations-Item
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ItemInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
    pub call_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorInfo {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

// Payload-Formen für das Dekodieren

#[derive(Debug, Deserialize)]
pub(super) struct SessionPayload {
    #[serde(default)]
    pub session: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(super) struct ItemPayload {
    pub item: ItemInfo,
}

#[derive(Debug, Deserialize)]
pub(super) struct DeltaPayload {
    pub delta: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct TextDonePayload {
    #[serde(default, alias = "transcript")]
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct TranscriptionPayload {
    #[serde(default)]
    pub item_id: String,
    pub transcript: String,
}

/// Fehler-Frame: `{"error": {...}}` oder flach mit `message`
#[derive(Debug, Deserialize)]
pub(super) struct ErrorPayload {
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub message: Option<String>,
}
