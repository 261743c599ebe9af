//! Request/reply correlation for blocking backend interactions.

mod correlator;

pub use correlator::{Correlator, PendingReply};

use sidecar_core::protocol::{InteractionKind, UserResponse};

/// Default time a request waits for the client before resolving with its
/// default reply.
pub const DEFAULT_REPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// A client reply normalized per interaction kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionReply {
    Input(String),
    Confirm {
        confirmed: bool,
        feedback: Option<String>,
    },
    Select(Vec<String>),
}

impl InteractionReply {
    pub const fn kind(&self) -> InteractionKind {
        match self {
            Self::Input(_) => InteractionKind::Input,
            Self::Confirm { .. } => InteractionKind::Confirm,
            Self::Select(_) => InteractionKind::Select,
        }
    }

    /// Reply used on timeout or cancellation.
    pub const fn default_for(kind: InteractionKind) -> Self {
        match kind {
            InteractionKind::Input => Self::Input(String::new()),
            InteractionKind::Confirm => Self::Confirm {
                confirmed: false,
                feedback: None,
            },
            InteractionKind::Select => Self::Select(Vec::new()),
        }
    }

    /// Translate into the backend's response shape.
    pub fn into_user_response(self, prompt_id: impl Into<String>) -> UserResponse {
        let prompt_id = prompt_id.into();
        match self {
            Self::Input(response) => UserResponse::InputResponse {
                prompt_id,
                response,
            },
            Self::Confirm {
                confirmed,
                feedback,
            } => UserResponse::ConfirmationResponse {
                prompt_id,
                confirmed,
                feedback,
            },
            Self::Select(selected) => UserResponse::SelectionResponse {
                prompt_id,
                selected,
            },
        }
    }
}

/// Errors from interaction registration.
#[derive(Debug, thiserror::Error)]
pub enum InteractionError {
    #[error("Interaction already pending: {correlation_id}")]
    Duplicate { correlation_id: String },
}
