//! Agent backed by a child process speaking NDJSON.
//!
//! The child is this agent's generation artifact: invalidation discards it
//! and the next run spawns a fresh one, replaying the conversation history
//! first so the conversation survives model or credential changes.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sidecar_core::config::AgentDescriptor;
use sidecar_core::protocol::{
    AgentEvent, BackendCommand, BackendMessage, ConversationTurn, TurnRole, UserResponse,
    parse_line,
};

use super::{Agent, AgentError, AgentIdentity, AgentLoader};
use crate::attachments::Attachment;
use crate::bus::EventBus;
use crate::shared::{SharedConfig, WorkingDirectory};

enum TurnOutcome {
    Complete {
        turn_id: Option<u64>,
        output: Option<String>,
    },
    Failed {
        turn_id: Option<u64>,
        message: String,
    },
}

impl TurnOutcome {
    const fn turn_id(&self) -> Option<u64> {
        match self {
            Self::Complete { turn_id, .. } | Self::Failed { turn_id, .. } => *turn_id,
        }
    }
}

/// How long an interrupted backend gets to report the end of its turn
/// before it is replaced.
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// Which backend output still belongs to a live turn.
///
/// Once a turn is interrupted, events are dropped until the backend reports
/// that turn's outcome; the next prompt is only sent after that.
#[derive(Debug, Default)]
struct TurnGate {
    /// Interrupted turn awaiting its outcome, `0` when none.
    interrupted: AtomicU64,
    /// Highest turn whose outcome the backend has reported.
    finished: AtomicU64,
}

impl TurnGate {
    fn interrupted(&self) -> Option<u64> {
        match self.interrupted.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    fn interrupt(&self, turn_id: u64) -> bool {
        if self.finished.load(Ordering::Acquire) >= turn_id {
            return false;
        }
        self.interrupted.store(turn_id, Ordering::Release);
        true
    }

    /// Record an outcome; returns `true` if it ends the interrupted turn.
    fn finish(&self, turn_id: Option<u64>) -> bool {
        if let Some(id) = turn_id {
            self.finished.fetch_max(id, Ordering::AcqRel);
        }
        let Some(interrupted) = self.interrupted() else {
            return false;
        };
        if turn_id.is_none_or(|id| id >= interrupted) {
            self.interrupted.store(0, Ordering::Release);
            return true;
        }
        false
    }
}

struct BackendProcess {
    id: String,
    child: Child,
    stdin_tx: mpsc::Sender<String>,
    outcomes: mpsc::Receiver<TurnOutcome>,
    gate: Arc<TurnGate>,
}

impl BackendProcess {
    async fn send(&self, command: &BackendCommand) -> Result<(), AgentError> {
        let line = serde_json::to_string(command)?;
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| AgentError::StdinClosed)
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for an interrupted turn's outcome. `false` means the backend
    /// never reported it and must not receive another prompt.
    async fn settle_interrupt(&mut self) -> bool {
        let Some(interrupted) = self.gate.interrupted() else {
            return true;
        };
        let outcomes = &mut self.outcomes;
        let settled = tokio::time::timeout(INTERRUPT_GRACE, async {
            while let Some(outcome) = outcomes.recv().await {
                if outcome.turn_id().is_none_or(|id| id >= interrupted) {
                    return true;
                }
            }
            false
        })
        .await;
        matches!(settled, Ok(true))
    }
}

/// Sends `interrupt` to the backend if the run future is dropped mid-turn.
struct InterruptOnDrop {
    stdin_tx: mpsc::Sender<String>,
    gate: Arc<TurnGate>,
    turn_id: u64,
    armed: bool,
}

impl InterruptOnDrop {
    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if !self.armed || !self.gate.interrupt(self.turn_id) {
            return;
        }
        match serde_json::to_string(&BackendCommand::Interrupt) {
            Ok(line) => {
                if self.stdin_tx.try_send(line).is_err() {
                    warn!("Failed to send interrupt to agent backend");
                } else {
                    info!(turn_id = self.turn_id, "Interrupted running agent turn");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode interrupt"),
        }
    }
}

/// [`Agent`] implementation driving an external backend process.
pub struct ProcessAgent {
    agent_name: String,
    model: Mutex<String>,
    stale: AtomicBool,
    process: tokio::sync::Mutex<Option<BackendProcess>>,
    history: Mutex<Vec<ConversationTurn>>,
    captured_response: Arc<Mutex<Option<String>>>,
    next_turn: AtomicU64,
    bus: EventBus,
    config: SharedConfig,
    working_dir: WorkingDirectory,
}

impl ProcessAgent {
    pub fn new(
        identity: &AgentIdentity,
        bus: EventBus,
        config: SharedConfig,
        working_dir: WorkingDirectory,
    ) -> Self {
        Self {
            agent_name: identity.agent_name.clone(),
            model: Mutex::new(identity.model_name.clone()),
            stale: AtomicBool::new(false),
            process: tokio::sync::Mutex::new(None),
            history: Mutex::new(Vec::new()),
            captured_response: Arc::new(Mutex::new(None)),
            next_turn: AtomicU64::new(0),
            bus,
            config,
            working_dir,
        }
    }

    fn history(&self) -> std::sync::MutexGuard<'_, Vec<ConversationTurn>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn spawn_process(&self) -> Result<BackendProcess, AgentError> {
        let settings = self.config.read().await.settings().clone();
        let working_dir = self.working_dir.get();
        let model = self.model_name();

        let mut cmd = Command::new(&settings.backend.program);
        cmd.current_dir(&working_dir)
            .args(&settings.backend.args)
            .arg("--agent")
            .arg(&self.agent_name)
            .arg("--model")
            .arg(&model)
            .envs(settings.backend_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(temperature) = settings.agent.temperature {
            cmd.arg("--temperature").arg(temperature.to_string());
        }

        info!(
            program = %settings.backend.program.display(),
            working_dir = %working_dir.display(),
            agent = %self.agent_name,
            model = %model,
            "Spawning agent backend"
        );
        let mut child = cmd.spawn().map_err(|e| AgentError::SpawnFailed {
            reason: e.to_string(),
        })?;
        let process_id = uuid::Uuid::new_v4().to_string();

        let stdin = child.stdin.take().ok_or_else(|| AgentError::SpawnFailed {
            reason: "Failed to capture stdin".to_string(),
        })?;
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!("Failed to write to backend stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!("Failed to write newline: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!("Failed to flush backend stdin: {}", e);
                    break;
                }
            }
        });

        let stdout = child.stdout.take().ok_or_else(|| AgentError::SpawnFailed {
            reason: "Failed to capture stdout".to_string(),
        })?;
        let (outcome_tx, outcomes) = mpsc::channel::<TurnOutcome>(8);
        let gate = Arc::new(TurnGate::default());
        tokio::spawn(read_stdout(StdoutContext {
            process_id: process_id.clone(),
            stdout,
            bus: self.bus.clone(),
            stdin_tx: stdin_tx.clone(),
            outcome_tx,
            captured_response: Arc::clone(&self.captured_response),
            gate: Arc::clone(&gate),
        }));

        if let Some(stderr) = child.stderr.take() {
            let pid_err = process_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(process_id = %pid_err, "stderr: {}", line);
                }
                debug!(process_id = %pid_err, "stderr reader finished");
            });
        }

        Ok(BackendProcess {
            id: process_id,
            child,
            stdin_tx,
            outcomes,
            gate,
        })
    }

    fn record_turn(&self, prompt: &str, reply: Option<String>) {
        let mut history = self.history();
        history.push(ConversationTurn {
            role: TurnRole::User,
            content: prompt.to_string(),
        });
        if let Some(content) = reply {
            history.push(ConversationTurn {
                role: TurnRole::Assistant,
                content,
            });
        }
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    fn name(&self) -> &str {
        &self.agent_name
    }

    fn model_name(&self) -> String {
        self.model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_model_name(&self, model: &str) {
        *self.model.lock().unwrap_or_else(PoisonError::into_inner) = model.to_string();
    }

    fn invalidate_generation_artifact(&self) {
        self.stale.store(true, Ordering::Release);
        // A running turn keeps its process; it is replaced on the next run.
        if let Ok(mut slot) = self.process.try_lock()
            && let Some(mut process) = slot.take()
        {
            if let Err(e) = process.child.start_kill() {
                debug!(process_id = %process.id, error = %e, "Backend already exited");
            }
            info!(process_id = %process.id, agent = %self.agent_name, "Discarded agent backend process");
        }
    }

    async fn run(
        &self,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<Option<String>, AgentError> {
        let mut slot = self.process.lock().await;

        if let Some(process) = slot.as_mut()
            && !process.settle_interrupt().await
        {
            warn!(process_id = %process.id, "Backend did not finish interrupted turn, replacing it");
            if let Err(e) = process.child.start_kill() {
                debug!(process_id = %process.id, error = %e, "Backend already exited");
            }
            *slot = None;
        }

        let stale = self.stale.swap(false, Ordering::AcqRel);
        if stale || slot.as_mut().is_none_or(BackendProcess::has_exited) {
            if let Some(old) = slot.take() {
                info!(process_id = %old.id, stale, "Replacing agent backend process");
            }
            let process = self.spawn_process().await?;
            let turns = self.history().clone();
            if !turns.is_empty() {
                debug!(process_id = %process.id, turns = turns.len(), "Replaying conversation history");
                process.send(&BackendCommand::History { turns }).await?;
            }
            *slot = Some(process);
        }
        let Some(process) = slot.as_mut() else {
            return Err(AgentError::Exited);
        };

        *self
            .captured_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        let turn_id = self.next_turn.fetch_add(1, Ordering::Relaxed) + 1;
        process
            .send(&BackendCommand::Prompt {
                turn_id,
                text: prompt.to_string(),
                attachments: attachments.iter().map(Attachment::encode).collect(),
            })
            .await?;
        debug!(process_id = %process.id, turn_id, "Prompt sent to agent backend");

        let mut interrupt = InterruptOnDrop {
            stdin_tx: process.stdin_tx.clone(),
            gate: Arc::clone(&process.gate),
            turn_id,
            armed: true,
        };
        let outcome = loop {
            match process.outcomes.recv().await {
                Some(outcome) if outcome.turn_id().is_none_or(|id| id == turn_id) => {
                    break Some(outcome);
                }
                Some(outcome) => {
                    debug!(stale_turn = ?outcome.turn_id(), turn_id, "Ignoring outcome of earlier turn");
                }
                None => break None,
            }
        };
        interrupt.disarm();

        match outcome {
            Some(TurnOutcome::Complete { output, .. }) => {
                let captured = self
                    .captured_response
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                self.record_turn(prompt, output.clone().or(captured));
                Ok(output)
            }
            Some(TurnOutcome::Failed { message, .. }) => {
                self.record_turn(prompt, None);
                Err(AgentError::TurnFailed { message })
            }
            None => {
                warn!(process_id = %process.id, "Agent backend closed stdout mid-turn");
                *slot = None;
                Err(AgentError::Exited)
            }
        }
    }

    fn last_response(&self) -> Option<String> {
        self.history()
            .iter()
            .rev()
            .find(|turn| turn.role == TurnRole::Assistant)
            .map(|turn| turn.content.clone())
    }
}

struct StdoutContext {
    process_id: String,
    stdout: ChildStdout,
    bus: EventBus,
    stdin_tx: mpsc::Sender<String>,
    outcome_tx: mpsc::Sender<TurnOutcome>,
    captured_response: Arc<Mutex<Option<String>>>,
    gate: Arc<TurnGate>,
}

/// Parse backend stdout, publishing events and routing request answers
/// back to stdin.
async fn read_stdout(ctx: StdoutContext) {
    let StdoutContext {
        process_id,
        stdout,
        bus,
        stdin_tx,
        outcome_tx,
        captured_response,
        gate,
    } = ctx;
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let message = match parse_line(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "Backend protocol parse error");
                continue;
            }
        };

        match message {
            BackendMessage::Event(event) if gate.interrupted().is_some() => {
                debug!(process_id = %process_id, event_kind = event.kind(), "Dropping output of interrupted turn");
                let Some((prompt_id, kind)) = event.interaction() else {
                    continue;
                };
                let response = UserResponse::default_for(kind, prompt_id);
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        if stdin_tx.send(json).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(process_id = %process_id, error = %e, "Failed to encode response"),
                }
            }
            BackendMessage::Event(event) if event.is_request() => {
                let Some(response) = bus.request(event).await else {
                    continue;
                };
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        if stdin_tx.send(json).await.is_err() {
                            warn!(process_id = %process_id, "Backend stdin closed before response");
                            break;
                        }
                    }
                    Err(e) => error!(process_id = %process_id, error = %e, "Failed to encode response"),
                }
            }
            BackendMessage::Event(event) => {
                if let AgentEvent::AgentResponse { content } = &event {
                    *captured_response
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(content.clone());
                }
                bus.publish(event);
            }
            BackendMessage::TurnComplete { turn_id, output } => {
                if gate.finish(turn_id) {
                    debug!(process_id = %process_id, ?turn_id, "Interrupted turn finished");
                }
                if outcome_tx
                    .send(TurnOutcome::Complete { turn_id, output })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            BackendMessage::TurnFailed { turn_id, message } => {
                if gate.finish(turn_id) {
                    debug!(process_id = %process_id, ?turn_id, "Interrupted turn finished");
                }
                if outcome_tx
                    .send(TurnOutcome::Failed { turn_id, message })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            BackendMessage::Unknown { msg_type, .. } => {
                debug!(process_id = %process_id, msg_type, "Ignoring unknown backend message");
            }
        }
    }
    info!(process_id = %process_id, "stdout reader finished");
}

/// Loads [`ProcessAgent`]s configured by the shared settings.
pub struct ProcessAgentLoader {
    config: SharedConfig,
    working_dir: WorkingDirectory,
}

impl ProcessAgentLoader {
    pub const fn new(config: SharedConfig, working_dir: WorkingDirectory) -> Self {
        Self {
            config,
            working_dir,
        }
    }
}

#[async_trait]
impl AgentLoader for ProcessAgentLoader {
    async fn available_agents(&self) -> Vec<AgentDescriptor> {
        self.config.read().await.settings().backend.agents.clone()
    }

    async fn load(
        &self,
        identity: &AgentIdentity,
        bus: EventBus,
    ) -> Result<Arc<dyn Agent>, AgentError> {
        let agents = self.available_agents().await;
        if !agents.is_empty() && !agents.iter().any(|a| a.name == identity.agent_name) {
            return Err(AgentError::UnknownAgent {
                name: identity.agent_name.clone(),
            });
        }
        info!(%identity, "Loading agent");
        Ok(Arc::new(ProcessAgent::new(
            identity,
            bus,
            Arc::clone(&self.config),
            self.working_dir.clone(),
        )))
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use sidecar_core::ConfigStore;
    use sidecar_core::config::{BackendSettings, Settings};

    use super::*;
    use crate::shared::shared_config;

    /// Minimal backend: echoes a text event, then completes the turn with
    /// its agent name and whether history was replayed.
    const SCRIPT: &str = r#"
hist=no
while IFS= read -r line; do
  case "$line" in
    *'"type":"history"'*) hist=yes ;;
    *'"type":"prompt"'*)
      id=$(printf '%s' "$line" | sed 's/.*"turn_id":\([0-9]*\).*/\1/')
      echo '{"type":"text","text":"working"}'
      echo "{\"type\":\"turn_complete\",\"turn_id\":$id,\"output\":\"$2 hist=$hist\"}" ;;
  esac
done
"#;

    fn loader(dir: &std::path::Path) -> ProcessAgentLoader {
        let settings = Settings {
            backend: BackendSettings {
                program: "sh".into(),
                args: vec!["-c".into(), SCRIPT.into(), "sidecar-agent".into()],
                agents: vec![],
                models: vec![],
            },
            ..Settings::default()
        };
        let store = ConfigStore::with_settings(dir.join("settings.json"), settings);
        ProcessAgentLoader::new(shared_config(store), WorkingDirectory::new(dir))
    }

    #[tokio::test]
    async fn runs_turn_and_replays_history_after_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let agent = loader(dir.path())
            .load(&AgentIdentity::new("code-puppy", "m1"), bus.clone())
            .await
            .unwrap();

        let output = agent.run("hello", &[]).await.unwrap();
        assert_eq!(output.as_deref(), Some("code-puppy hist=no"));
        assert_eq!(bus.try_next(), Some(AgentEvent::info("working")));
        assert_eq!(agent.last_response().as_deref(), Some("code-puppy hist=no"));

        agent.invalidate_generation_artifact();
        let output = agent.run("again", &[]).await.unwrap();
        assert_eq!(output.as_deref(), Some("code-puppy hist=yes"));
    }

    /// Backend whose "hang" and "mute" prompts never complete on their own.
    /// An interrupt produces a late text line; only "hang" then reports the
    /// turn as failed.
    const INTERRUPT_SCRIPT: &str = r#"
mute=no
while IFS= read -r line; do
  case "$line" in
    *'"type":"prompt"'*)
      id=$(printf '%s' "$line" | sed 's/.*"turn_id":\([0-9]*\).*/\1/')
      echo "{\"type\":\"text\",\"text\":\"started $id\"}"
      case "$line" in
        *'"text":"hang"'*) mute=no ;;
        *'"text":"mute"'*) mute=yes ;;
        *) echo "{\"type\":\"turn_complete\",\"turn_id\":$id,\"output\":\"done $id\"}" ;;
      esac ;;
    *'"type":"interrupt"'*)
      echo '{"type":"text","text":"late output"}'
      if [ "$mute" = no ]; then
        echo "{\"type\":\"turn_failed\",\"turn_id\":$id,\"message\":\"interrupted\"}"
      fi ;;
  esac
done
"#;

    fn interrupt_agent(dir: &std::path::Path, bus: EventBus) -> ProcessAgent {
        let settings = Settings {
            backend: BackendSettings {
                program: "sh".into(),
                args: vec!["-c".into(), INTERRUPT_SCRIPT.into(), "sidecar-agent".into()],
                agents: vec![],
                models: vec![],
            },
            ..Settings::default()
        };
        let store = ConfigStore::with_settings(dir.join("settings.json"), settings);
        ProcessAgent::new(
            &AgentIdentity::new("code-puppy", "m1"),
            bus,
            shared_config(store),
            WorkingDirectory::new(dir),
        )
    }

    /// Start `prompt`, then drop the run as soon as the backend reports it.
    async fn start_and_cancel(agent: &ProcessAgent, bus: &EventBus, prompt: &str) {
        tokio::select! {
            _ = agent.run(prompt, &[]) => panic!("turn was expected to hang"),
            event = bus.next() => assert_eq!(event, AgentEvent::info("started 1")),
        }
    }

    fn drain(bus: &EventBus) -> Vec<AgentEvent> {
        std::iter::from_fn(|| bus.try_next()).collect()
    }

    #[tokio::test]
    async fn interrupted_turn_output_stays_out_of_next_turn() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let agent = interrupt_agent(dir.path(), bus.clone());

        start_and_cancel(&agent, &bus, "hang").await;

        let output = agent.run("next", &[]).await.unwrap();
        assert_eq!(output.as_deref(), Some("done 2"));
        assert_eq!(drain(&bus), vec![AgentEvent::info("started 2")]);
    }

    #[tokio::test]
    async fn backend_ignoring_interrupt_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let agent = interrupt_agent(dir.path(), bus.clone());

        start_and_cancel(&agent, &bus, "mute").await;

        let output = agent.run("next", &[]).await.unwrap();
        assert_eq!(output.as_deref(), Some("done 2"));
        assert_eq!(drain(&bus), vec![AgentEvent::info("started 2")]);
    }

    #[tokio::test]
    async fn unknown_agent_is_rejected_when_list_is_configured() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        loader
            .config
            .write()
            .await
            .update(|s| {
                s.backend.agents = vec![AgentDescriptor {
                    name: "code-puppy".into(),
                    label: String::new(),
                    description: String::new(),
                }];
            })
            .unwrap();
        let err = loader
            .load(&AgentIdentity::new("ghost", "m1"), EventBus::default())
            .await
            .err()
            .expect("unknown agent must fail");
        assert!(matches!(err, AgentError::UnknownAgent { .. }));
    }

    #[tokio::test]
    async fn missing_program_fails_at_run() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            backend: BackendSettings {
                program: dir.path().join("does-not-exist"),
                ..BackendSettings::default()
            },
            ..Settings::default()
        };
        let store = ConfigStore::with_settings(dir.path().join("settings.json"), settings);
        let agent = ProcessAgent::new(
            &AgentIdentity::new("code-puppy", "m1"),
            EventBus::default(),
            shared_config(store),
            WorkingDirectory::new(dir.path()),
        );
        let err = agent.run("hi", &[]).await.err().expect("spawn must fail");
        assert!(matches!(err, AgentError::SpawnFailed { .. }));
    }
}
