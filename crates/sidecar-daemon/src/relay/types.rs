//! Relay module types.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::interaction::DEFAULT_REPLY_TIMEOUT;

/// Events forwarded after cancellation before the rest is discarded.
pub const DEFAULT_DRAIN_LIMIT: usize = 100;

/// Configuration for an event relay.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// How long a request waits for the client's reply.
    pub reply_timeout: Duration,
    /// Maximum events forwarded by the bounded drain on stop.
    pub drain_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            drain_limit: DEFAULT_DRAIN_LIMIT,
        }
    }
}

/// Ends a relay run.
///
/// `finish` forwards everything already queued and then stops; `cancel`
/// stops right away, interrupting a pending reply, and runs the bounded
/// drain. Cancelling wins over finishing.
#[derive(Debug, Clone, Default)]
pub struct RelayStop {
    cancel: CancellationToken,
    finish: CancellationToken,
}

impl RelayStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn finish(&self) {
        self.finish.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub async fn finished(&self) {
        self.finish.cancelled().await;
    }

    /// Whether either signal has fired.
    pub fn is_ended(&self) -> bool {
        self.cancel.is_cancelled() || self.finish.is_cancelled()
    }

    /// Resolves once either signal fires.
    pub async fn ended(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = self.finish.cancelled() => {}
        }
    }
}

/// Counters reported when a relay run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Records sent to the client.
    pub forwarded: usize,
    /// Requests resolved (by reply, timeout or default).
    pub interactions: usize,
    /// Events forwarded during the bounded drain.
    pub drained: usize,
    /// Events discarded because the drain limit was reached.
    pub discarded: usize,
    /// Events that failed to forward.
    pub failed: usize,
}

/// Errors from forwarding a single event.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Client sink closed: {0}")]
    Sink(#[from] crate::sink::SinkError),

    #[error("Backend is no longer waiting for response to {prompt_id}")]
    ResponseUndelivered { prompt_id: String },
}
