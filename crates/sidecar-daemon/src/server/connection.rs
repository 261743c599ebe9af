//! One WebSocket connection: frame loop, outbound writer and dispatch.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sidecar_core::protocol::{ControlMessage, ImagePayload, OutboundRecord};

use crate::agent::AgentIdentity;
use crate::attachments::decode_attachments;
use crate::interaction::InteractionReply;
use crate::lifecycle::AgentLifecycle;
use crate::session::{PromptRequest, Session};
use crate::sink::ClientSink;

use super::AppState;

/// Drive one client from upgrade to disconnect.
pub(super) async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let open = state.connection_opened();
    info!(connection_id = %connection_id, connections = open, "Client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sink, mut outbound) = ClientSink::channel();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(record) = outbound.recv().await {
            let json = match serde_json::to_string(&record) {
                Ok(json) => json,
                Err(e) => {
                    warn!(connection_id = %writer_id, error = %e, "Failed to serialize record");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                debug!(connection_id = %writer_id, "WebSocket closed, writer stopping");
                break;
            }
        }
    });

    let mut connection = Connection::new(connection_id.clone(), state.clone(), sink);
    connection.send_banner().await;

    let mut epoch_rx = state.credentials.subscribe();
    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => connection.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                    break;
                }
            },
            Ok(()) = epoch_rx.changed() => connection.session.on_credentials_changed(),
        }
    }

    connection.close().await;
    writer.abort();
    let open = state.connection_closed();
    info!(connection_id = %connection_id, connections = open, "Client disconnected");
}

/// Per-connection state behind the frame loop.
pub(super) struct Connection {
    pub(super) id: String,
    pub(super) state: AppState,
    pub(super) session: Session,
    pub(super) sink: ClientSink,
    /// Session-only; never persisted.
    pub(super) yolo_mode: bool,
    pub(super) login: Option<JoinHandle<()>>,
}

impl Connection {
    fn new(id: String, state: AppState, sink: ClientSink) -> Self {
        let lifecycle = Arc::new(AgentLifecycle::new(Arc::clone(&state.loader)));
        let session = Session::new(
            id.clone(),
            lifecycle,
            sink.clone(),
            state.relay,
            state.credentials.subscribe(),
        );
        Self {
            id,
            state,
            session,
            sink,
            yolo_mode: false,
            login: None,
        }
    }

    pub(super) fn send(&self, record: OutboundRecord) {
        if let Err(e) = self.sink.send(record) {
            debug!(connection_id = %self.id, error = %e, "Dropping record for closed connection");
        }
    }

    /// Agent and model the next prompt should run with.
    pub(super) async fn desired_identity(&self) -> AgentIdentity {
        let store = self.state.config.read().await;
        let settings = store.settings();
        let agent = settings.agent.default_agent.clone();
        let model = settings.effective_model(&agent);
        AgentIdentity::new(agent, model)
    }

    async fn send_banner(&self) {
        let identity = self.desired_identity().await;
        let agents = self.state.loader.available_agents().await;
        let agent_names = if agents.is_empty() {
            identity.agent_name.clone()
        } else {
            agents
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let cwd = self.state.working_dir.get().display().to_string();
        self.send(OutboundRecord::status(format!(
            "Connected to sidecar\nAgent: {}\nModel: {}\nWorking directory: {cwd}\nAvailable agents: {agent_names}",
            identity.agent_name, identity.model_name
        )));
        self.send(OutboundRecord::WorkingDirectory { path: cwd });
    }

    /// Parse and dispatch one inbound text frame.
    pub(super) async fn handle_text(&mut self, text: &str) {
        let message = match ControlMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Invalid client message");
                self.send(OutboundRecord::error(format!("Invalid message: {e}")));
                return;
            }
        };

        match message {
            ControlMessage::SubmitPrompt { text, attachments } => {
                self.submit_prompt(text, &attachments).await;
            }
            ControlMessage::Cancel => {
                if !self.session.cancel() {
                    debug!(connection_id = %self.id, "Cancel with no active turn");
                }
            }
            ControlMessage::ReplyInput {
                correlation_id,
                text,
            } => self.reply(&correlation_id, InteractionReply::Input(text)),
            ControlMessage::ReplyConfirm {
                correlation_id,
                confirmed,
                feedback,
            } => self.reply(
                &correlation_id,
                InteractionReply::Confirm {
                    confirmed,
                    feedback: feedback.filter(|f| !f.is_empty()),
                },
            ),
            ControlMessage::ReplySelect {
                correlation_id,
                selected,
            } => self.reply(
                &correlation_id,
                InteractionReply::Select(selected.into_values()),
            ),
            ControlMessage::GetConfig => self.get_config().await,
            ControlMessage::SetConfig(update) => self.set_config(update).await,
            ControlMessage::SetApiKey { key_name, value } => {
                self.set_api_key(key_name, value).await;
            }
            ControlMessage::SetModelPin {
                agent_name,
                model_name,
            } => self.set_model_pin(agent_name, model_name).await,
            ControlMessage::SetWorkingDirectory { path } => self.set_working_directory(&path),
            ControlMessage::OauthStatus => self.oauth_status().await,
            ControlMessage::OauthStart => self.oauth_start().await,
            ControlMessage::OauthLogout => self.oauth_logout().await,
        }
    }

    async fn submit_prompt(&mut self, text: String, images: &[ImagePayload]) {
        let request = PromptRequest {
            text,
            attachments: decode_attachments(images),
        };
        if request.is_empty() {
            self.send(OutboundRecord::error("Empty prompt"));
            return;
        }
        let desired = self.desired_identity().await;
        self.session.handle_request(request, desired).await;
    }

    fn reply(&self, correlation_id: &str, reply: InteractionReply) {
        if !self.session.deliver_reply(correlation_id, reply) {
            debug!(connection_id = %self.id, correlation_id, "Reply for unknown interaction ignored");
        }
    }

    async fn close(mut self) {
        if let Some(login) = self.login.take() {
            login.abort();
        }
        self.session.shutdown().await;
    }
}
