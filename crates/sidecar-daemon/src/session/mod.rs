//! Per-connection session: owns the agent handle and the active turn.

mod orchestrator;
mod state;

pub use orchestrator::{PromptRequest, Session};
pub use state::{TurnState, TurnTracker};
