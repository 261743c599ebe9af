//! Event relay loop: event bus → wire records → client.
//!
//! Data flow:
//! ```text
//! backend → EventBus → EventRelay → translate → ClientSink
//! request event → Correlator (blocks the loop) → UserResponse → EventBus
//! ```
//!
//! Forwarding is strictly sequential, so while a request is outstanding no
//! later event of the same session reaches the client.

use std::sync::Arc;

use tracing::{debug, info, warn};

use sidecar_core::protocol::AgentEvent;

use crate::bus::EventBus;
use crate::interaction::{Correlator, InteractionReply};
use crate::session::{TurnState, TurnTracker};
use crate::sink::ClientSink;

use super::translate::translate;
use super::types::{RelayConfig, RelayError, RelayStats, RelayStop};

/// Forwards one agent's events to one client for the duration of a turn.
pub struct EventRelay {
    sink: ClientSink,
    correlator: Arc<Correlator>,
    tracker: TurnTracker,
    config: RelayConfig,
    session_id: String,
}

impl EventRelay {
    pub fn new(
        session_id: impl Into<String>,
        sink: ClientSink,
        correlator: Arc<Correlator>,
        tracker: TurnTracker,
        config: RelayConfig,
    ) -> Self {
        Self {
            sink,
            correlator,
            tracker,
            config,
            session_id: session_id.into(),
        }
    }

    /// Forward events until `stop` fires, then run the bounded drain.
    ///
    /// After [`RelayStop::finish`] the loop keeps forwarding until the bus is
    /// empty, so a turn that ended normally loses nothing to the drain limit.
    pub async fn run(self, bus: EventBus, stop: RelayStop) -> RelayStats {
        let mut stats = RelayStats::default();
        debug!(session_id = %self.session_id, "Event relay started");

        loop {
            let event = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                event = bus.next() => event,
                () = stop.finished() => break,
            };
            let kind = event.kind();
            match self.forward(&bus, event, &stop).await {
                Ok(Forwarded::Record) => stats.forwarded += 1,
                Ok(Forwarded::Interaction) => {
                    stats.forwarded += 1;
                    stats.interactions += 1;
                }
                Ok(Forwarded::Nothing) => {}
                Err(e) => {
                    stats.failed += 1;
                    warn!(session_id = %self.session_id, event_kind = kind, error = %e, "Failed to forward event");
                }
            }
        }

        self.drain(&bus, &mut stats);
        info!(
            session_id = %self.session_id,
            forwarded = stats.forwarded,
            interactions = stats.interactions,
            drained = stats.drained,
            discarded = stats.discarded,
            failed = stats.failed,
            "Event relay stopped"
        );
        stats
    }

    async fn forward(
        &self,
        bus: &EventBus,
        event: AgentEvent,
        stop: &RelayStop,
    ) -> Result<Forwarded, RelayError> {
        if event.is_request() {
            return self.relay_request(bus, event, stop).await;
        }
        debug!(session_id = %self.session_id, event_kind = event.kind(), "Forwarding event");
        match translate(event) {
            Some(record) => {
                self.sink.send(record)?;
                Ok(Forwarded::Record)
            }
            None => Ok(Forwarded::Nothing),
        }
    }

    /// Send a request record and block until the client answers, the
    /// deadline passes or the relay is stopped.
    async fn relay_request(
        &self,
        bus: &EventBus,
        event: AgentEvent,
        stop: &RelayStop,
    ) -> Result<Forwarded, RelayError> {
        let Some((prompt_id, kind)) = event.interaction() else {
            return Ok(Forwarded::Nothing);
        };
        let prompt_id = prompt_id.to_string();

        let pending = match self
            .correlator
            .register(&prompt_id, kind, self.config.reply_timeout)
        {
            Ok(pending) => pending,
            Err(e) => {
                // The live interaction keeps the id; this request never
                // reaches the client.
                warn!(session_id = %self.session_id, error = %e, "Answering request with default");
                let response = InteractionReply::default_for(kind).into_user_response(&prompt_id);
                return if bus.provide_response(response) {
                    Ok(Forwarded::Nothing)
                } else {
                    Err(RelayError::ResponseUndelivered { prompt_id })
                };
            }
        };

        let sent = match translate(event) {
            Some(record) => self.sink.send(record),
            None => Ok(()),
        };

        let reply = match sent {
            Ok(()) => {
                self.tracker.set(TurnState::AwaitingReply);
                let reply = tokio::select! {
                    reply = pending.wait() => reply,
                    () = stop.ended() => {
                        debug!(session_id = %self.session_id, correlation_id = %prompt_id, "Relay stopped while awaiting reply");
                        InteractionReply::default_for(kind)
                    }
                };
                if !stop.is_ended() {
                    self.tracker.set(TurnState::Relaying);
                }
                reply
            }
            Err(e) => {
                // Client is gone: unblock the backend before reporting.
                drop(pending);
                bus.provide_response(InteractionReply::default_for(kind).into_user_response(&prompt_id));
                return Err(e.into());
            }
        };

        if bus.provide_response(reply.into_user_response(&prompt_id)) {
            Ok(Forwarded::Interaction)
        } else {
            Err(RelayError::ResponseUndelivered { prompt_id })
        }
    }

    /// Forward at most `drain_limit` immediately available events and
    /// discard the rest. Requests are answered with their default instead
    /// of being sent, since nobody will wait for the reply.
    fn drain(&self, bus: &EventBus, stats: &mut RelayStats) {
        for _ in 0..self.config.drain_limit {
            let Some(event) = bus.try_next() else {
                break;
            };
            if let Some((prompt_id, kind)) = event.interaction() {
                debug!(session_id = %self.session_id, correlation_id = prompt_id, "Answering drained request with default");
                bus.provide_response(InteractionReply::default_for(kind).into_user_response(prompt_id));
                continue;
            }
            let kind = event.kind();
            if let Some(record) = translate(event) {
                match self.sink.send(record) {
                    Ok(()) => stats.drained += 1,
                    Err(e) => {
                        stats.failed += 1;
                        warn!(session_id = %self.session_id, event_kind = kind, error = %e, "Failed to forward drained event");
                    }
                }
            }
        }
        stats.discarded = bus.clear();
        if stats.discarded > 0 {
            warn!(
                session_id = %self.session_id,
                discarded = stats.discarded,
                limit = self.config.drain_limit,
                "Drain limit reached, discarding queued events"
            );
        }
    }
}

enum Forwarded {
    Record,
    Interaction,
    Nothing,
}
