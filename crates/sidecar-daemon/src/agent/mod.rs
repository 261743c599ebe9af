//! Agent backend abstraction.
//!
//! An [`Agent`] runs one prompt at a time and reports progress on its
//! [`EventBus`]. An [`AgentLoader`] constructs agents for an identity.

mod process;

pub use process::{ProcessAgent, ProcessAgentLoader};

use std::sync::Arc;

use async_trait::async_trait;

use sidecar_core::config::AgentDescriptor;

use crate::attachments::Attachment;
use crate::bus::EventBus;

/// Which agent, running which model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_name: String,
    pub model_name: String,
}

impl AgentIdentity {
    pub fn new(agent_name: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            model_name: model_name.into(),
        }
    }
}

impl std::fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.agent_name, self.model_name)
    }
}

/// A loaded agent.
///
/// The *generation artifact* is whatever the agent caches to talk to its
/// model (for [`ProcessAgent`], the backend process). Invalidating it must
/// not discard conversation state.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn model_name(&self) -> String;

    fn set_model_name(&self, model: &str);

    /// Drop the cached generation artifact; it is rebuilt on the next run.
    fn invalidate_generation_artifact(&self);

    /// Run one prompt to completion. `Ok(None)` means the turn finished
    /// without an explicit output.
    async fn run(
        &self,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<Option<String>, AgentError>;

    /// Most recent response recorded in the conversation history.
    fn last_response(&self) -> Option<String>;
}

/// Constructs agents.
#[async_trait]
pub trait AgentLoader: Send + Sync {
    /// Agents this loader can construct. Empty means any name is accepted.
    async fn available_agents(&self) -> Vec<AgentDescriptor>;

    async fn load(
        &self,
        identity: &AgentIdentity,
        bus: EventBus,
    ) -> Result<Arc<dyn Agent>, AgentError>;
}

/// Errors from agent construction and execution.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Unknown agent: {name}")]
    UnknownAgent { name: String },

    #[error("Failed to spawn agent backend: {reason}")]
    SpawnFailed { reason: String },

    #[error("Agent backend exited unexpectedly")]
    Exited,

    #[error("Agent backend stdin closed")]
    StdinClosed,

    #[error("{message}")]
    TurnFailed { message: String },

    #[error("Failed to encode backend command: {0}")]
    Encode(#[from] serde_json::Error),
}
