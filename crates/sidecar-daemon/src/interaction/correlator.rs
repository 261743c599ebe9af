//! Pending interaction tracker.
//!
//! One entry per outstanding correlation id. Registration is synchronous so
//! it always completes before the request record is sent; the reply can
//! therefore never race ahead of its slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sidecar_core::protocol::InteractionKind;

use super::{InteractionError, InteractionReply};

struct PendingInteraction {
    kind: InteractionKind,
    slot: oneshot::Sender<InteractionReply>,
    created_at: Instant,
    deadline: Instant,
    token: u64,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingInteraction>>>;

fn lock(map: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<String, PendingInteraction>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks outstanding request/reply pairs for one session.
#[derive(Default)]
pub struct Correlator {
    pending: PendingMap,
    next_token: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending interaction. Must be called before the request
    /// is transmitted.
    pub fn register(
        &self,
        correlation_id: &str,
        kind: InteractionKind,
        timeout: Duration,
    ) -> Result<PendingReply, InteractionError> {
        let (slot, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = now + timeout;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(correlation_id) {
                return Err(InteractionError::Duplicate {
                    correlation_id: correlation_id.to_string(),
                });
            }
            pending.insert(
                correlation_id.to_string(),
                PendingInteraction {
                    kind,
                    slot,
                    created_at: now,
                    deadline,
                    token,
                },
            );
        }
        debug!(correlation_id, %kind, ?timeout, "Registered pending interaction");

        Ok(PendingReply {
            correlation_id: correlation_id.to_string(),
            kind,
            rx,
            deadline,
            token,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Resolve the interaction waiting on `correlation_id`.
    ///
    /// Unknown, already resolved or expired ids are ignored. A reply of the
    /// wrong kind is ignored and the interaction stays pending. Returns
    /// whether a waiter received the reply.
    pub fn deliver_reply(&self, correlation_id: &str, reply: InteractionReply) -> bool {
        let entry = {
            let mut pending = lock(&self.pending);
            match pending.get(correlation_id) {
                None => None,
                Some(entry) if entry.kind != reply.kind() => {
                    warn!(
                        correlation_id,
                        expected = %entry.kind,
                        received = %reply.kind(),
                        "Reply kind mismatch, ignoring"
                    );
                    return false;
                }
                Some(_) => pending.remove(correlation_id),
            }
        };

        let Some(entry) = entry else {
            debug!(correlation_id, "Reply for unknown interaction ignored");
            return false;
        };
        if Instant::now() > entry.deadline {
            debug!(correlation_id, "Reply arrived after deadline");
        }
        let waited = entry.created_at.elapsed();
        let delivered = entry.slot.send(reply).is_ok();
        info!(correlation_id, ?waited, delivered, "Interaction resolved");
        delivered
    }

    /// Register and wait in one step. A duplicate id resolves immediately
    /// with the kind's default.
    pub async fn await_reply(
        &self,
        correlation_id: &str,
        kind: InteractionKind,
        timeout: Duration,
    ) -> InteractionReply {
        match self.register(correlation_id, kind, timeout) {
            Ok(pending) => pending.wait().await,
            Err(e) => {
                warn!(error = %e, "Cannot register interaction, using default reply");
                InteractionReply::default_for(kind)
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        lock(&self.pending).contains_key(correlation_id)
    }
}

/// Waiting side of a registered interaction.
///
/// Dropping it (timeout, cancellation) removes its entry so a late reply
/// becomes a no-op.
pub struct PendingReply {
    correlation_id: String,
    kind: InteractionKind,
    rx: oneshot::Receiver<InteractionReply>,
    deadline: Instant,
    token: u64,
    pending: PendingMap,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub const fn kind(&self) -> InteractionKind {
        self.kind
    }

    /// Wait for the reply or the deadline, whichever comes first.
    pub async fn wait(mut self) -> InteractionReply {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => InteractionReply::default_for(self.kind),
            Err(_) => {
                info!(
                    correlation_id = %self.correlation_id,
                    kind = %self.kind,
                    "Interaction timed out, using default reply"
                );
                InteractionReply::default_for(self.kind)
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let mut pending = lock(&self.pending);
        if pending
            .get(&self.correlation_id)
            .is_some_and(|entry| entry.token == self.token)
        {
            pending.remove(&self.correlation_id);
        }
    }
}
