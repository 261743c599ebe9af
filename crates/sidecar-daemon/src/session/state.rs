//! Unit-of-work state tracking.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Phase of the active unit of work.
///
/// `Idle -> Starting -> Relaying <-> AwaitingReply -> Draining -> Complete`.
/// `Cancelled` is entered from any running phase and always continues
/// through `Draining` to `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    Starting,
    Relaying,
    AwaitingReply,
    Draining,
    Cancelled,
    Complete,
}

impl TurnState {
    pub const fn is_running(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Relaying | Self::AwaitingReply | Self::Draining | Self::Cancelled
        )
    }
}

/// Shared publisher of a session's [`TurnState`].
#[derive(Debug, Clone)]
pub struct TurnTracker {
    tx: Arc<watch::Sender<TurnState>>,
}

impl Default for TurnTracker {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(TurnState::Idle);
        Self { tx: Arc::new(tx) }
    }
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, state: TurnState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Turn state changed");
        }
    }

    pub fn get(&self) -> TurnState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.tx.subscribe()
    }
}
