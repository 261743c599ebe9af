//! Turn orchestration.
//!
//! A turn is one prompt handed to the agent. Each turn:
//! 1. supersedes (cancels and awaits) the previous unfinished turn,
//! 2. resolves the agent handle through [`AgentLifecycle`],
//! 3. attaches to the agent's bus and starts an [`EventRelay`],
//! 4. runs the agent until it finishes or the turn is cancelled,
//! 5. stops the relay, awaits its drain and reports the outcome.
//!
//! Every turn ends with exactly one `task_complete`, emitted by
//! [`Completion`] on whichever path the turn leaves through.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sidecar_core::protocol::OutboundRecord;

use crate::agent::AgentIdentity;
use crate::attachments::Attachment;
use crate::interaction::{Correlator, InteractionReply};
use crate::lifecycle::{AgentHandle, AgentLifecycle};
use crate::relay::{EventRelay, RelayConfig, RelayStop};
use crate::sink::ClientSink;

use super::state::{TurnState, TurnTracker};

/// A validated prompt ready to run.
#[derive(Debug, Clone, Default)]
pub struct PromptRequest {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl PromptRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    /// A prompt needs text or at least one attachment.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

struct ActiveTurn {
    turn_id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything one connection needs to run turns against its agent.
pub struct Session {
    connection_id: String,
    lifecycle: Arc<AgentLifecycle>,
    correlator: Arc<Correlator>,
    sink: ClientSink,
    relay_config: RelayConfig,
    credentials: watch::Receiver<u64>,
    tracker: TurnTracker,
    agent: Option<AgentHandle>,
    active: Option<ActiveTurn>,
    next_turn: u64,
}

impl Session {
    pub fn new(
        connection_id: impl Into<String>,
        lifecycle: Arc<AgentLifecycle>,
        sink: ClientSink,
        relay_config: RelayConfig,
        credentials: watch::Receiver<u64>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            lifecycle,
            correlator: Arc::new(Correlator::new()),
            sink,
            relay_config,
            credentials,
            tracker: TurnTracker::new(),
            agent: None,
            active: None,
            next_turn: 1,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn sink(&self) -> &ClientSink {
        &self.sink
    }

    pub fn tracker(&self) -> &TurnTracker {
        &self.tracker
    }

    /// Identity of the current agent handle, if one is loaded.
    pub fn agent_identity(&self) -> Option<&AgentIdentity> {
        self.agent.as_ref().map(|h| &h.identity)
    }

    pub fn is_busy(&self) -> bool {
        self.active.as_ref().is_some_and(|t| !t.task.is_finished())
    }

    /// Start a new turn, superseding any unfinished one.
    ///
    /// Returns once the turn is admitted; the turn itself runs in the
    /// background and reports through the sink.
    pub async fn handle_request(&mut self, request: PromptRequest, desired: AgentIdentity) {
        self.supersede().await;

        let turn_id = self.next_turn;
        self.next_turn += 1;
        self.tracker.set(TurnState::Starting);
        let mut completion = Completion::new(
            self.sink.clone(),
            self.tracker.clone(),
            self.connection_id.clone(),
            turn_id,
        );

        let epoch = *self.credentials.borrow();
        if let Err(e) = self.lifecycle.resolve(&mut self.agent, &desired, epoch).await {
            completion.fail(e.to_string());
            completion.finish();
            return;
        }
        let Some(handle) = self.agent.clone() else {
            completion.finish();
            return;
        };

        info!(
            connection_id = %self.connection_id,
            turn_id,
            agent = %handle.identity,
            attachments = request.attachments.len(),
            "Turn started"
        );

        let cancel = CancellationToken::new();
        let turn = Turn {
            turn_id,
            connection_id: self.connection_id.clone(),
            handle,
            request,
            relay: EventRelay::new(
                self.connection_id.clone(),
                self.sink.clone(),
                Arc::clone(&self.correlator),
                self.tracker.clone(),
                self.relay_config,
            ),
            sink: self.sink.clone(),
            tracker: self.tracker.clone(),
            cancel: cancel.clone(),
            completion,
        };
        self.active = Some(ActiveTurn {
            turn_id,
            cancel,
            task: tokio::spawn(turn.run()),
        });
    }

    /// Cancel the active turn without waiting for its teardown.
    /// Returns `false` when nothing was running.
    pub fn cancel(&self) -> bool {
        match &self.active {
            Some(turn) if !turn.task.is_finished() => {
                info!(connection_id = %self.connection_id, turn_id = turn.turn_id, "Cancelling turn");
                self.tracker.set(TurnState::Cancelled);
                turn.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Route a client reply to its pending interaction. Unknown or
    /// already-resolved ids are ignored.
    pub fn deliver_reply(&self, correlation_id: &str, reply: InteractionReply) -> bool {
        self.correlator.deliver_reply(correlation_id, reply)
    }

    /// Clear the current agent's generation artifact now, in response to a
    /// credential change. The handle's epoch is updated so the next request
    /// does not invalidate a second time.
    pub fn on_credentials_changed(&mut self) {
        let epoch = *self.credentials.borrow_and_update();
        if let Some(handle) = self.agent.as_mut() {
            handle.agent.invalidate_generation_artifact();
            handle.resolved_epoch = handle.resolved_epoch.max(epoch);
            info!(
                connection_id = %self.connection_id,
                agent = %handle.identity,
                epoch,
                "Credentials changed, agent invalidated"
            );
        }
    }

    /// Clear the generation artifact without reloading the agent, e.g.
    /// after the working directory changed.
    pub fn invalidate_generation(&self) {
        if let Some(handle) = &self.agent {
            handle.agent.invalidate_generation_artifact();
            debug!(connection_id = %self.connection_id, agent = %handle.identity, "Agent generation invalidated");
        }
    }

    /// Cancel and await the active turn, then drop the agent handle.
    pub async fn shutdown(&mut self) {
        self.supersede().await;
        if let Some(handle) = self.agent.take() {
            handle.agent.invalidate_generation_artifact();
            handle.bus.clear();
        }
        info!(connection_id = %self.connection_id, "Session closed");
    }

    async fn supersede(&mut self) {
        let Some(turn) = self.active.take() else {
            return;
        };
        if !turn.task.is_finished() {
            info!(connection_id = %self.connection_id, turn_id = turn.turn_id, "Superseding active turn");
            self.tracker.set(TurnState::Cancelled);
            turn.cancel.cancel();
        }
        if let Err(e) = turn.task.await {
            warn!(connection_id = %self.connection_id, turn_id = turn.turn_id, error = %e, "Turn task ended abnormally");
        }
    }
}

enum Outcome {
    Finished(Result<Option<String>, crate::agent::AgentError>),
    Cancelled,
}

/// One running turn, moved into its task.
struct Turn {
    turn_id: u64,
    connection_id: String,
    handle: AgentHandle,
    request: PromptRequest,
    relay: EventRelay,
    sink: ClientSink,
    tracker: TurnTracker,
    cancel: CancellationToken,
    completion: Completion,
}

impl Turn {
    async fn run(self) {
        let Self {
            turn_id,
            connection_id,
            handle,
            request,
            relay,
            sink,
            tracker,
            cancel,
            mut completion,
        } = self;

        let consumer = handle.bus.attach();
        let relay_stop = RelayStop::new();
        let relay_task = tokio::spawn(relay.run(handle.bus.clone(), relay_stop.clone()));
        tracker.set(TurnState::Relaying);

        let outcome = tokio::select! {
            () = cancel.cancelled() => Outcome::Cancelled,
            result = handle.agent.run(&request.text, &request.attachments) => Outcome::Finished(result),
        };

        if matches!(outcome, Outcome::Cancelled) {
            tracker.set(TurnState::Cancelled);
        }
        tracker.set(TurnState::Draining);
        if matches!(outcome, Outcome::Cancelled) {
            relay_stop.cancel();
        } else {
            relay_stop.finish();
        }
        match relay_task.await {
            Ok(stats) => debug!(connection_id = %connection_id, turn_id, forwarded = stats.forwarded, "Relay finished"),
            Err(e) => warn!(connection_id = %connection_id, turn_id, error = %e, "Relay task failed"),
        }
        drop(consumer);

        match outcome {
            Outcome::Cancelled => {
                info!(connection_id = %connection_id, turn_id, "Turn cancelled");
                let _ = sink.send(OutboundRecord::status("Task cancelled"));
            }
            Outcome::Finished(Ok(output)) => {
                let content = output
                    .filter(|s| !s.is_empty())
                    .or_else(|| handle.agent.last_response())
                    .filter(|s| !s.is_empty());
                if let Some(content) = content {
                    let _ = sink.send(OutboundRecord::AgentResponse { content });
                }
                info!(connection_id = %connection_id, turn_id, "Turn finished");
            }
            Outcome::Finished(Err(e)) => {
                warn!(connection_id = %connection_id, turn_id, error = %e, "Turn failed");
                completion.fail(e.to_string());
            }
        }
        completion.finish();
    }
}

/// Emits at most one `error` and exactly one `task_complete` for a turn,
/// falling back to `Drop` if the turn task is aborted.
struct Completion {
    sink: ClientSink,
    tracker: TurnTracker,
    connection_id: String,
    turn_id: u64,
    errored: bool,
    completed: bool,
}

impl Completion {
    fn new(sink: ClientSink, tracker: TurnTracker, connection_id: String, turn_id: u64) -> Self {
        Self {
            sink,
            tracker,
            connection_id,
            turn_id,
            errored: false,
            completed: false,
        }
    }

    fn fail(&mut self, message: String) {
        if self.errored || self.completed {
            return;
        }
        self.errored = true;
        let _ = self.sink.send(OutboundRecord::error(message));
    }

    fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.tracker.set(TurnState::Complete);
        if self.sink.send(OutboundRecord::TaskComplete).is_err() {
            debug!(connection_id = %self.connection_id, turn_id = self.turn_id, "Client gone before task_complete");
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.complete();
    }
}
