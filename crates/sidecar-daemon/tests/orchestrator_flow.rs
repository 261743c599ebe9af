#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end turn flow through the session orchestrator.
//!
//! A scripted in-process agent publishes events on its bus; assertions are
//! made on the records the client sink receives.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use sidecar_core::protocol::{AgentEvent, DiffLine, OutboundRecord, UserResponse};
use sidecar_daemon::agent::{Agent, AgentIdentity, AgentLoader};
use sidecar_daemon::interaction::InteractionReply;
use sidecar_daemon::lifecycle::AgentLifecycle;
use sidecar_daemon::relay::RelayConfig;
use sidecar_daemon::session::{PromptRequest, Session};
use sidecar_daemon::sink::ClientSink;

use common::{ScriptedLoader, Step, text};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    session: Session,
    rx: mpsc::UnboundedReceiver<OutboundRecord>,
    loader: Arc<ScriptedLoader>,
    epoch: watch::Sender<u64>,
}

fn harness(script: Vec<Step>, relay: RelayConfig) -> Harness {
    let loader = Arc::new(ScriptedLoader::new(script));
    let lifecycle = Arc::new(AgentLifecycle::new(
        Arc::clone(&loader) as Arc<dyn AgentLoader>
    ));
    let (sink, rx) = ClientSink::channel();
    let (epoch, epoch_rx) = watch::channel(0);
    Harness {
        session: Session::new("test-conn", lifecycle, sink, relay, epoch_rx),
        rx,
        loader,
        epoch,
    }
}

async fn next_record(rx: &mut mpsc::UnboundedReceiver<OutboundRecord>) -> OutboundRecord {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timeout waiting for record")
        .expect("sink closed")
}

async fn until_complete(rx: &mut mpsc::UnboundedReceiver<OutboundRecord>) -> Vec<OutboundRecord> {
    let mut records = Vec::new();
    loop {
        let record = next_record(rx).await;
        let done = record == OutboundRecord::TaskComplete;
        records.push(record);
        if done {
            return records;
        }
    }
}

fn identity(agent: &str, model: &str) -> AgentIdentity {
    AgentIdentity::new(agent, model)
}

#[tokio::test]
async fn confirmation_reply_reaches_backend_and_events_continue() {
    let diff = AgentEvent::Diff {
        path: "src/lib.rs".into(),
        operation: "modify".into(),
        diff_lines: vec![DiffLine {
            line_type: "add".into(),
            content: "pub mod relay;".into(),
            line_number: Some(3),
        }],
    };
    let mut h = harness(
        vec![
            Step::Emit(text("building")),
            Step::Emit(diff),
            Step::Ask(AgentEvent::ConfirmationRequest {
                prompt_id: "7".into(),
                prompt: "apply?".into(),
                default: true,
                allow_feedback: false,
            }),
            Step::Emit(text("applied")),
        ],
        RelayConfig::default(),
    );

    h.session
        .handle_request(PromptRequest::new("refactor"), identity("coder", "m1"))
        .await;

    assert_eq!(
        next_record(&mut h.rx).await,
        OutboundRecord::Text {
            content: "building".into(),
            level: sidecar_core::protocol::MessageLevel::Info,
        }
    );
    let OutboundRecord::Diff { content, .. } = next_record(&mut h.rx).await else {
        panic!("expected diff");
    };
    assert_eq!(content, "+pub mod relay;");
    assert_eq!(
        next_record(&mut h.rx).await,
        OutboundRecord::ConfirmationRequest {
            correlation_id: "7".into(),
            prompt: "apply?".into(),
            default: true,
            allow_feedback: false,
        }
    );
    assert!(h.session.deliver_reply(
        "7",
        InteractionReply::Confirm {
            confirmed: true,
            feedback: None,
        },
    ));

    let rest = until_complete(&mut h.rx).await;
    assert_eq!(
        rest,
        vec![
            OutboundRecord::Text {
                content: "applied".into(),
                level: sidecar_core::protocol::MessageLevel::Info,
            },
            OutboundRecord::AgentResponse {
                content: "done: refactor".into(),
            },
            OutboundRecord::TaskComplete,
        ]
    );
    assert_eq!(
        h.loader.agent(0).responses(),
        vec![UserResponse::ConfirmationResponse {
            prompt_id: "7".into(),
            confirmed: true,
            feedback: None,
        }]
    );

    // Already resolved: a second reply is a no-op.
    assert!(!h.session.deliver_reply(
        "7",
        InteractionReply::Confirm {
            confirmed: false,
            feedback: None,
        },
    ));
}

#[tokio::test(start_paused = true)]
async fn unanswered_input_times_out_with_empty_reply() {
    let mut h = harness(
        vec![Step::Ask(AgentEvent::InputRequest {
            prompt_id: "name".into(),
            prompt: "Your name?".into(),
        })],
        RelayConfig {
            reply_timeout: Duration::from_secs(2),
            ..RelayConfig::default()
        },
    );
    h.session
        .handle_request(PromptRequest::new("greet"), identity("coder", "m1"))
        .await;

    let records = until_complete(&mut h.rx).await;
    assert!(matches!(records[0], OutboundRecord::InputRequest { .. }));
    assert_eq!(records.last(), Some(&OutboundRecord::TaskComplete));
    assert_eq!(
        h.loader.agent(0).responses(),
        vec![UserResponse::InputResponse {
            prompt_id: "name".into(),
            response: String::new(),
        }]
    );
}

#[tokio::test]
async fn new_request_supersedes_with_one_completion_per_turn() {
    let mut h = harness(
        vec![Step::Emit(text("working")), Step::Hang],
        RelayConfig::default(),
    );
    let id = identity("coder", "m1");

    h.session
        .handle_request(PromptRequest::new("first"), id.clone())
        .await;
    assert!(matches!(next_record(&mut h.rx).await, OutboundRecord::Text { .. }));

    h.session.handle_request(PromptRequest::new("second"), id).await;
    assert_eq!(
        until_complete(&mut h.rx).await,
        vec![
            OutboundRecord::status("Task cancelled"),
            OutboundRecord::TaskComplete,
        ]
    );
    assert!(matches!(next_record(&mut h.rx).await, OutboundRecord::Text { .. }));
    assert!(h.session.is_busy());

    assert!(h.session.cancel());
    assert_eq!(
        until_complete(&mut h.rx).await,
        vec![
            OutboundRecord::status("Task cancelled"),
            OutboundRecord::TaskComplete,
        ]
    );
    h.session.shutdown().await;
    assert!(h.rx.try_recv().is_err(), "no extra terminal signal");
    assert_eq!(h.loader.load_count(), 1);
}

#[tokio::test]
async fn cancel_while_awaiting_reply_releases_backend() {
    let mut h = harness(
        vec![Step::Ask(AgentEvent::SelectionRequest {
            prompt_id: "pick".into(),
            prompt: "Which file?".into(),
            options: vec![],
            multi_select: false,
        })],
        RelayConfig::default(),
    );
    h.session
        .handle_request(PromptRequest::new("choose"), identity("coder", "m1"))
        .await;
    assert!(matches!(
        next_record(&mut h.rx).await,
        OutboundRecord::SelectionRequest { .. }
    ));

    assert!(h.session.cancel());
    assert_eq!(
        until_complete(&mut h.rx).await,
        vec![
            OutboundRecord::status("Task cancelled"),
            OutboundRecord::TaskComplete,
        ]
    );
    assert!(!h.session.deliver_reply("pick", InteractionReply::Select(vec!["a".into()])));
}

#[tokio::test]
async fn load_failure_reports_error_then_completion() {
    let mut h = harness(vec![], RelayConfig::default());
    h.session
        .handle_request(PromptRequest::new("hi"), identity("missing", "m1"))
        .await;
    let records = until_complete(&mut h.rx).await;
    assert_eq!(records.len(), 2);
    let OutboundRecord::Error { message } = &records[0] else {
        panic!("expected error, got {:?}", records[0]);
    };
    assert!(message.contains("Unknown agent: missing"));
}

#[tokio::test]
async fn backend_failure_reports_single_error() {
    let mut h = harness(
        vec![Step::Emit(text("trying")), Step::Fail("model refused".into())],
        RelayConfig::default(),
    );
    h.session
        .handle_request(PromptRequest::new("go"), identity("coder", "m1"))
        .await;
    let records = until_complete(&mut h.rx).await;
    assert_eq!(
        records[1..],
        [
            OutboundRecord::error("model refused"),
            OutboundRecord::TaskComplete,
        ]
    );
}

#[tokio::test]
async fn model_change_soft_invalidates_same_agent() {
    let mut h = harness(vec![], RelayConfig::default());
    h.session
        .handle_request(PromptRequest::new("a"), identity("coder", "m1"))
        .await;
    until_complete(&mut h.rx).await;
    h.session
        .handle_request(PromptRequest::new("b"), identity("coder", "m2"))
        .await;
    until_complete(&mut h.rx).await;

    assert_eq!(h.loader.load_count(), 1);
    let agent = h.loader.agent(0);
    assert_eq!(agent.invalidation_count(), 1);
    assert_eq!(agent.model_name(), "m2");
    assert_eq!(h.session.agent_identity(), Some(&identity("coder", "m2")));
}

#[tokio::test]
async fn credential_epoch_bump_soft_invalidates_next_request() {
    let mut h = harness(vec![], RelayConfig::default());
    let id = identity("coder", "m1");
    h.session
        .handle_request(PromptRequest::new("a"), id.clone())
        .await;
    until_complete(&mut h.rx).await;

    h.epoch.send_replace(1);
    h.session.handle_request(PromptRequest::new("b"), id.clone()).await;
    until_complete(&mut h.rx).await;
    assert_eq!(h.loader.agent(0).invalidation_count(), 1);

    h.session.handle_request(PromptRequest::new("c"), id).await;
    until_complete(&mut h.rx).await;
    assert_eq!(h.loader.agent(0).invalidation_count(), 1);
    assert_eq!(h.loader.load_count(), 1);
}

#[tokio::test]
async fn agent_change_discards_handle_and_queue() {
    let mut h = harness(vec![], RelayConfig::default());
    h.session
        .handle_request(PromptRequest::new("a"), identity("coder", "m1"))
        .await;
    until_complete(&mut h.rx).await;
    let old = h.loader.agent(0);
    old.bus().publish(text("stale"));

    h.session
        .handle_request(PromptRequest::new("b"), identity("planner", "m1"))
        .await;
    let records = until_complete(&mut h.rx).await;

    assert_eq!(h.loader.load_count(), 2);
    assert!(old.bus().is_empty());
    assert_eq!(h.loader.agent(1).name, "planner");
    assert!(
        !records
            .iter()
            .any(|r| matches!(r, OutboundRecord::Text { content, .. } if content == "stale"))
    );
}

#[tokio::test]
async fn cancel_after_flood_ends_with_single_completion() {
    let mut script: Vec<Step> = (0..150).map(|i| Step::Emit(text(&i.to_string()))).collect();
    script.push(Step::Hang);
    let mut h = harness(
        script,
        RelayConfig {
            drain_limit: 100,
            ..RelayConfig::default()
        },
    );
    h.session
        .handle_request(PromptRequest::new("flood"), identity("coder", "m1"))
        .await;
    // All 150 events are published before the backend parks.
    assert!(matches!(next_record(&mut h.rx).await, OutboundRecord::Text { .. }));
    assert!(h.session.cancel());

    let records = until_complete(&mut h.rx).await;
    let texts = records
        .iter()
        .filter(|r| matches!(r, OutboundRecord::Text { .. }))
        .count();
    // One text was received before cancelling.
    assert!(texts <= 149);
    assert_eq!(
        records[records.len() - 2..],
        [
            OutboundRecord::status("Task cancelled"),
            OutboundRecord::TaskComplete,
        ]
    );
}

#[tokio::test]
async fn finished_turn_forwards_every_queued_event() {
    let script: Vec<Step> = (0..150).map(|i| Step::Emit(text(&i.to_string()))).collect();
    let mut h = harness(
        script,
        RelayConfig {
            drain_limit: 100,
            ..RelayConfig::default()
        },
    );
    h.session
        .handle_request(PromptRequest::new("flood"), identity("coder", "m1"))
        .await;

    let records = until_complete(&mut h.rx).await;
    let texts: Vec<&str> = records
        .iter()
        .filter_map(|r| match r {
            OutboundRecord::Text { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(texts.len(), 150);
    assert_eq!(texts.last(), Some(&"149"));
    assert_eq!(
        records[records.len() - 2..],
        [
            OutboundRecord::AgentResponse {
                content: "done: flood".into(),
            },
            OutboundRecord::TaskComplete,
        ]
    );
}
