//! Agent lifecycle: reuse, soft invalidation or full recreation.
//!
//! | desired vs. current             | action                               |
//! |---------------------------------|--------------------------------------|
//! | no handle / other agent name    | discard handle and bus, load anew    |
//! | same agent, other model         | clear generation artifact, set model |
//! | credential epoch advanced       | clear generation artifact            |
//! | otherwise                       | reuse                                |

use std::sync::Arc;

use tracing::{info, warn};

use crate::agent::{Agent, AgentError, AgentIdentity, AgentLoader};
use crate::bus::{DEFAULT_DETACHED_CAPACITY, EventBus};

/// The session's current agent and the queue it publishes on.
#[derive(Clone)]
pub struct AgentHandle {
    pub identity: AgentIdentity,
    pub agent: Arc<dyn Agent>,
    pub bus: EventBus,
    /// Credential epoch the handle was last resolved against.
    pub resolved_epoch: u64,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("identity", &self.identity)
            .field("resolved_epoch", &self.resolved_epoch)
            .finish_non_exhaustive()
    }
}

/// Why an existing handle's generation artifact was cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    ModelChanged { from: String, to: String },
    CredentialsChanged { from: u64, to: u64 },
}

/// Outcome of [`AgentLifecycle::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Created,
    Reused,
    SoftInvalidated(InvalidationReason),
}

/// Errors from resolving an agent handle.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Failed to load agent {agent_name}: {source}")]
    LoadFailed {
        agent_name: String,
        #[source]
        source: AgentError,
    },
}

/// Decides how a session's agent handle follows its desired identity.
pub struct AgentLifecycle {
    loader: Arc<dyn AgentLoader>,
    bus_capacity: usize,
}

impl AgentLifecycle {
    pub fn new(loader: Arc<dyn AgentLoader>) -> Self {
        Self {
            loader,
            bus_capacity: DEFAULT_DETACHED_CAPACITY,
        }
    }

    #[must_use]
    pub const fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    pub fn loader(&self) -> &Arc<dyn AgentLoader> {
        &self.loader
    }

    /// Bring `slot` in line with `desired` and `epoch`.
    ///
    /// On load failure the slot is left empty and no handle is installed.
    pub async fn resolve(
        &self,
        slot: &mut Option<AgentHandle>,
        desired: &AgentIdentity,
        epoch: u64,
    ) -> Result<Resolution, LifecycleError> {
        let reusable = slot
            .as_ref()
            .is_some_and(|h| h.identity.agent_name == desired.agent_name);

        if !reusable {
            if let Some(old) = slot.take() {
                let discarded = old.bus.clear();
                info!(
                    from = %old.identity,
                    to = %desired,
                    discarded,
                    "Agent changed, discarding handle"
                );
            }
            let bus = EventBus::new(self.bus_capacity);
            let agent = self
                .loader
                .load(desired, bus.clone())
                .await
                .map_err(|source| {
                    warn!(agent = %desired, error = %source, "Agent load failed");
                    LifecycleError::LoadFailed {
                        agent_name: desired.agent_name.clone(),
                        source,
                    }
                })?;
            *slot = Some(AgentHandle {
                identity: desired.clone(),
                agent,
                bus,
                resolved_epoch: epoch,
            });
            info!(agent = %desired, epoch, "Agent created");
            return Ok(Resolution::Created);
        }

        let Some(handle) = slot.as_mut() else {
            return Ok(Resolution::Reused);
        };

        let reason = if handle.identity.model_name != desired.model_name {
            Some(InvalidationReason::ModelChanged {
                from: handle.identity.model_name.clone(),
                to: desired.model_name.clone(),
            })
        } else if epoch > handle.resolved_epoch {
            Some(InvalidationReason::CredentialsChanged {
                from: handle.resolved_epoch,
                to: epoch,
            })
        } else {
            None
        };

        handle.resolved_epoch = handle.resolved_epoch.max(epoch);
        let Some(reason) = reason else {
            return Ok(Resolution::Reused);
        };

        if let InvalidationReason::ModelChanged { to, .. } = &reason {
            handle.agent.set_model_name(to);
            handle.identity.model_name.clone_from(to);
        }
        handle.agent.invalidate_generation_artifact();
        info!(agent = %handle.identity, ?reason, "Agent soft-invalidated");
        Ok(Resolution::SoftInvalidated(reason))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use sidecar_core::config::AgentDescriptor;

    use super::*;
    use crate::attachments::Attachment;

    #[derive(Default)]
    struct CountingAgent {
        name: String,
        model: Mutex<String>,
        invalidations: AtomicUsize,
    }

    #[async_trait]
    impl Agent for CountingAgent {
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
        async fn run(&self, _: &str, _: &[Attachment]) -> Result<Option<String>, AgentError> {
            Ok(None)
        }
        fn last_response(&self) -> Option<String> {
            None
        }
    }

    #[derive(Default)]
    struct Loader {
        loads: AtomicUsize,
        agents: Mutex<Vec<Arc<CountingAgent>>>,
    }

    #[async_trait]
    impl AgentLoader for Loader {
        async fn available_agents(&self) -> Vec<AgentDescriptor> {
            Vec::new()
        }
        async fn load(
            &self,
            identity: &AgentIdentity,
            _bus: EventBus,
        ) -> Result<Arc<dyn Agent>, AgentError> {
            if identity.agent_name == "broken" {
                return Err(AgentError::UnknownAgent {
                    name: identity.agent_name.clone(),
                });
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            let agent = Arc::new(CountingAgent {
                name: identity.agent_name.clone(),
                model: Mutex::new(identity.model_name.clone()),
                ..CountingAgent::default()
            });
            self.agents.lock().unwrap().push(Arc::clone(&agent));
            Ok(agent)
        }
    }

    fn setup() -> (Arc<Loader>, AgentLifecycle) {
        let loader = Arc::new(Loader::default());
        let lifecycle = AgentLifecycle::new(Arc::clone(&loader) as Arc<dyn AgentLoader>);
        (loader, lifecycle)
    }

    #[tokio::test]
    async fn same_identity_is_reused() {
        let (loader, lifecycle) = setup();
        let mut slot = None;
        let id = AgentIdentity::new("a", "m1");
        assert_eq!(lifecycle.resolve(&mut slot, &id, 0).await.unwrap(), Resolution::Created);
        assert_eq!(lifecycle.resolve(&mut slot, &id, 0).await.unwrap(), Resolution::Reused);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn model_change_soft_invalidates() {
        let (loader, lifecycle) = setup();
        let mut slot = None;
        lifecycle
            .resolve(&mut slot, &AgentIdentity::new("a", "m1"), 0)
            .await
            .unwrap();
        let bus_before = slot.as_ref().unwrap().bus.clone();
        bus_before.publish(sidecar_core::protocol::AgentEvent::Divider);

        let resolution = lifecycle
            .resolve(&mut slot, &AgentIdentity::new("a", "m2"), 0)
            .await
            .unwrap();
        assert_eq!(
            resolution,
            Resolution::SoftInvalidated(InvalidationReason::ModelChanged {
                from: "m1".into(),
                to: "m2".into(),
            })
        );
        let handle = slot.as_ref().unwrap();
        assert_eq!(handle.identity.model_name, "m2");
        assert_eq!(handle.agent.model_name(), "m2");
        assert_eq!(handle.bus.len(), 1, "bus survives soft invalidation");
        let agent = Arc::clone(&loader.agents.lock().unwrap()[0]);
        assert_eq!(agent.invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn epoch_bump_soft_invalidates_once() {
        let (loader, lifecycle) = setup();
        let mut slot = None;
        let id = AgentIdentity::new("a", "m1");
        lifecycle.resolve(&mut slot, &id, 0).await.unwrap();
        assert_eq!(
            lifecycle.resolve(&mut slot, &id, 1).await.unwrap(),
            Resolution::SoftInvalidated(InvalidationReason::CredentialsChanged { from: 0, to: 1 })
        );
        assert_eq!(lifecycle.resolve(&mut slot, &id, 1).await.unwrap(), Resolution::Reused);
        let agent = Arc::clone(&loader.agents.lock().unwrap()[0]);
        assert_eq!(agent.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn agent_change_discards_handle_and_bus() {
        let (loader, lifecycle) = setup();
        let mut slot = None;
        lifecycle
            .resolve(&mut slot, &AgentIdentity::new("a", "m1"), 0)
            .await
            .unwrap();
        let old_bus = slot.as_ref().unwrap().bus.clone();
        old_bus.publish(sidecar_core::protocol::AgentEvent::Divider);

        assert_eq!(
            lifecycle
                .resolve(&mut slot, &AgentIdentity::new("b", "m1"), 0)
                .await
                .unwrap(),
            Resolution::Created
        );
        assert!(old_bus.is_empty());
        assert!(slot.as_ref().unwrap().bus.is_empty());
        assert_eq!(slot.as_ref().unwrap().agent.name(), "b");
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn load_failure_leaves_no_handle() {
        let (_loader, lifecycle) = setup();
        let mut slot = None;
        lifecycle
            .resolve(&mut slot, &AgentIdentity::new("a", "m1"), 0)
            .await
            .unwrap();
        let err = lifecycle
            .resolve(&mut slot, &AgentIdentity::new("broken", "m1"), 0)
            .await
            .err()
            .expect("load must fail");
        assert!(matches!(err, LifecycleError::LoadFailed { .. }));
        assert!(slot.is_none());
    }
}
