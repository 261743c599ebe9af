//! Backend stdin/stdout message shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::{AgentEvent, InteractionKind};

/// One parsed line of backend stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    /// An event for the client.
    Event(AgentEvent),
    /// The turn identified by `turn_id` finished.
    TurnComplete {
        turn_id: Option<u64>,
        output: Option<String>,
    },
    /// The turn identified by `turn_id` failed.
    TurnFailed {
        turn_id: Option<u64>,
        message: String,
    },
    /// Unrecognized type with no displayable content.
    Unknown { msg_type: String, payload: Value },
}

/// The backend's answer shape for a request-type event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserResponse {
    InputResponse {
        prompt_id: String,
        response: String,
    },
    ConfirmationResponse {
        prompt_id: String,
        confirmed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
    SelectionResponse {
        prompt_id: String,
        selected: Vec<String>,
    },
}

impl UserResponse {
    pub fn prompt_id(&self) -> &str {
        match self {
            Self::InputResponse { prompt_id, .. }
            | Self::ConfirmationResponse { prompt_id, .. }
            | Self::SelectionResponse { prompt_id, .. } => prompt_id,
        }
    }

    /// The response used when no answer arrives: empty text, declined
    /// confirmation without feedback, empty selection.
    pub fn default_for(kind: InteractionKind, prompt_id: impl Into<String>) -> Self {
        let prompt_id = prompt_id.into();
        match kind {
            InteractionKind::Input => Self::InputResponse {
                prompt_id,
                response: String::new(),
            },
            InteractionKind::Confirm => Self::ConfirmationResponse {
                prompt_id,
                confirmed: false,
                feedback: None,
            },
            InteractionKind::Select => Self::SelectionResponse {
                prompt_id,
                selected: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One entry of the conversation replayed into a fresh backend process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

/// Binary attachment in transit to the backend (base64 payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedAttachment {
    pub mime_type: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Commands written to backend stdin (other than [`UserResponse`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendCommand {
    /// Restore conversation state after a respawn.
    History { turns: Vec<ConversationTurn> },
    /// Start a new turn.
    Prompt {
        turn_id: u64,
        text: String,
        #[serde(default)]
        attachments: Vec<EncodedAttachment>,
    },
    /// Abort the running turn.
    Interrupt,
}
