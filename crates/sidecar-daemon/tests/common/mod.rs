//! Scripted in-process agent backend for integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use sidecar_core::config::AgentDescriptor;
use sidecar_core::protocol::{AgentEvent, UserResponse};
use sidecar_daemon::agent::{Agent, AgentError, AgentIdentity, AgentLoader};
use sidecar_daemon::attachments::Attachment;
use sidecar_daemon::bus::EventBus;

/// One scripted backend action.
#[derive(Debug, Clone)]
pub enum Step {
    /// Publish an event.
    Emit(AgentEvent),
    /// Publish a request and wait for its response.
    Ask(AgentEvent),
    /// Never finish on its own.
    Hang,
    /// Fail the turn.
    Fail(String),
}

pub struct ScriptedAgent {
    pub name: String,
    model: Mutex<String>,
    bus: EventBus,
    script: Vec<Step>,
    pub responses: Arc<Mutex<Vec<UserResponse>>>,
    pub prompts: Mutex<Vec<String>>,
    pub invalidations: AtomicUsize,
}

impl ScriptedAgent {
    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    pub fn responses(&self) -> Vec<UserResponse> {
        self.responses.lock().unwrap().clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> String {
        self.model.lock().unwrap().clone()
    }

    fn set_model_name(&self, model: &str) {
        *self.model.lock().unwrap() = model.to_string();
    }

    fn invalidate_generation_artifact(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    async fn run(&self, prompt: &str, _attachments: &[Attachment]) -> Result<Option<String>, AgentError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        for step in &self.script {
            match step {
                Step::Emit(event) => self.bus.publish(event.clone()),
                Step::Ask(event) => {
                    // Answered outside the run future, so a cancelled turn
                    // still records what the backend was told.
                    let bus = self.bus.clone();
                    let responses = Arc::clone(&self.responses);
                    let event = event.clone();
                    let answered = tokio::spawn(async move {
                        if let Some(response) = bus.request(event).await {
                            responses.lock().unwrap().push(response);
                        }
                    });
                    let _ = answered.await;
                }
                Step::Hang => std::future::pending::<()>().await,
                Step::Fail(message) => {
                    return Err(AgentError::TurnFailed {
                        message: message.clone(),
                    });
                }
            }
        }
        Ok(Some(format!("done: {prompt}")))
    }

    fn last_response(&self) -> Option<String> {
        None
    }
}

/// Loads [`ScriptedAgent`]s that all follow the same script.
#[derive(Default)]
pub struct ScriptedLoader {
    script: Vec<Step>,
    pub loaded: Mutex<Vec<Arc<ScriptedAgent>>>,
    pub agents: Vec<AgentDescriptor>,
}

impl ScriptedLoader {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn load_count(&self) -> usize {
        self.loaded.lock().unwrap().len()
    }

    pub fn agent(&self, index: usize) -> Arc<ScriptedAgent> {
        Arc::clone(&self.loaded.lock().unwrap()[index])
    }
}

#[async_trait]
impl AgentLoader for ScriptedLoader {
    async fn available_agents(&self) -> Vec<AgentDescriptor> {
        self.agents.clone()
    }

    async fn load(&self, identity: &AgentIdentity, bus: EventBus) -> Result<Arc<dyn Agent>, AgentError> {
        if identity.agent_name == "missing" {
            return Err(AgentError::UnknownAgent {
                name: identity.agent_name.clone(),
            });
        }
        let agent = Arc::new(ScriptedAgent {
            name: identity.agent_name.clone(),
            model: Mutex::new(identity.model_name.clone()),
            bus,
            script: self.script.clone(),
            responses: Arc::new(Mutex::new(Vec::new())),
            prompts: Mutex::new(Vec::new()),
            invalidations: AtomicUsize::new(0),
        });
        self.loaded.lock().unwrap().push(Arc::clone(&agent));
        Ok(agent)
    }
}

pub fn text(s: &str) -> AgentEvent {
    AgentEvent::info(s)
}
