//! Client-facing wire messages.
//!
//! Every frame is one JSON object discriminated by `"type"`. Field names
//! are part of the client contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::{DiffLine, FileEntry, GrepMatch, MessageLevel, SelectionOption};
use crate::config::AgentDescriptor;

/// Records sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundRecord {
    Text {
        content: String,
        level: MessageLevel,
    },
    FileContent {
        path: String,
        content: String,
        start_line: Option<u64>,
        num_lines: Option<u64>,
        total_lines: u64,
        num_tokens: u64,
    },
    Diff {
        path: String,
        operation: String,
        diff_lines: Vec<DiffLine>,
        content: String,
    },
    ShellStart {
        command: String,
        content: String,
    },
    ShellOutput {
        command: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
        content: String,
    },
    Reasoning {
        content: String,
        next_steps: Option<String>,
    },
    AgentResponse {
        content: String,
    },
    SubAgent {
        agent_name: String,
        prompt: String,
        session_id: Option<String>,
        is_new_session: bool,
        content: String,
    },
    SubAgentResponse {
        agent_name: String,
        response: String,
        session_id: Option<String>,
        content: String,
    },
    InputRequest {
        correlation_id: String,
        prompt: String,
    },
    ConfirmationRequest {
        correlation_id: String,
        prompt: String,
        default: bool,
        allow_feedback: bool,
    },
    SelectionRequest {
        correlation_id: String,
        prompt: String,
        options: Vec<SelectionOption>,
        multi_select: bool,
    },
    Spinner {
        action: String,
        spinner_id: Option<String>,
        content: String,
    },
    GrepResult {
        search_term: String,
        directory: String,
        matches: Vec<GrepMatch>,
        total_matches: u64,
        files_searched: u64,
    },
    FileListing {
        directory: String,
        files: Vec<FileEntry>,
        recursive: bool,
        total_size: u64,
        dir_count: u64,
        file_count: u64,
    },
    StatusPanel {
        title: String,
        fields: BTreeMap<String, Value>,
    },
    Divider {
        content: String,
    },
    VersionCheck {
        current_version: String,
        latest_version: String,
        content: String,
    },
    Status {
        content: String,
    },
    TaskComplete,
    Error {
        message: String,
    },
    WorkingDirectory {
        path: String,
    },
    WorkingDirectoryResult(OperationResult),
    Config(ConfigSnapshot),
    ConfigUpdated {
        success: bool,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        changes: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ApiKeyResult(OperationResult),
    ModelPinResult(OperationResult),
    OauthUrl {
        url: String,
        redirect_uri: String,
    },
    OauthResult(OperationResult),
    OauthStatus(OAuthStatus),
}

impl OutboundRecord {
    pub fn status(content: impl Into<String>) -> Self {
        Self::Status {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Generic `{success, message | error, ...}` result body.
///
/// `extra` carries operation-specific fields (`key_name`, `path`, ...)
/// flattened into the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Body of the `config` record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    pub current: CurrentConfig,
    pub available: AvailableOptions,
    pub api_keys: BTreeMap<String, ApiKeyStatus>,
    pub model_pinning: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentConfig {
    pub agent: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub yolo_mode: bool,
    pub auto_save: bool,
    pub suppress_thinking: bool,
    pub suppress_info: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableOptions {
    pub agents: Vec<AgentDescriptor>,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyStatus {
    pub is_set: bool,
    pub masked: String,
}

/// Body of the `oauth_status` record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OAuthStatus {
    pub available: bool,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<String>,
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Image attached to a prompt, as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImagePayload {
    #[serde(alias = "dataUrl")]
    pub data_url: String,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// A selection reply: clients may send a single value or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Selection {
    Many(Vec<String>),
    One(String),
}

impl Default for Selection {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl Selection {
    /// Normalize to a set of values: a single value becomes a one-element
    /// set and duplicates are dropped, keeping first-seen order.
    pub fn into_values(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => {
                let mut out: Vec<String> = Vec::with_capacity(values.len());
                for value in values {
                    if !out.contains(&value) {
                        out.push(value);
                    }
                }
                out
            }
        }
    }
}

/// Partial settings update sent with `set_config`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub agent: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub yolo_mode: Option<bool>,
    pub auto_save: Option<bool>,
    pub suppress_thinking: Option<bool>,
    pub suppress_info: Option<bool>,
}

/// Messages received from the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    #[serde(alias = "prompt")]
    SubmitPrompt {
        #[serde(default)]
        text: String,
        #[serde(default, alias = "images")]
        attachments: Vec<ImagePayload>,
    },
    Cancel,
    #[serde(alias = "input_response")]
    ReplyInput {
        #[serde(alias = "prompt_id")]
        correlation_id: String,
        #[serde(default, alias = "response")]
        text: String,
    },
    #[serde(alias = "confirmation_response")]
    ReplyConfirm {
        #[serde(alias = "prompt_id")]
        correlation_id: String,
        #[serde(default)]
        confirmed: bool,
        #[serde(default)]
        feedback: Option<String>,
    },
    #[serde(alias = "selection_response")]
    ReplySelect {
        #[serde(alias = "prompt_id")]
        correlation_id: String,
        #[serde(default)]
        selected: Selection,
    },
    GetConfig,
    SetConfig(ConfigUpdate),
    SetApiKey {
        #[serde(default)]
        key_name: Option<String>,
        #[serde(default)]
        value: String,
    },
    SetModelPin {
        #[serde(default)]
        agent_name: Option<String>,
        #[serde(default)]
        model_name: String,
    },
    SetWorkingDirectory {
        #[serde(default)]
        path: String,
    },
    OauthStatus,
    OauthStart,
    OauthLogout,
}

impl ControlMessage {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn single_selection_wraps_into_set() {
        let msg = ControlMessage::parse(
            r#"{"type":"reply_select","correlation_id":"s1","selected":"blue"}"#,
        )
        .unwrap();
        let ControlMessage::ReplySelect { selected, .. } = msg else {
            panic!("expected reply_select");
        };
        assert_eq!(selected.into_values(), vec!["blue".to_string()]);
    }

    #[test]
    fn selection_list_is_deduplicated() {
        let sel = Selection::Many(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(sel.into_values(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let msg = ControlMessage::parse(
            r#"{"type":"prompt","text":"hi","images":[{"dataUrl":"data:image/png;base64,AA==","mimeType":"image/png"}]}"#,
        )
        .unwrap();
        let ControlMessage::SubmitPrompt { attachments, .. } = msg else {
            panic!("expected submit_prompt");
        };
        assert_eq!(attachments[0].mime_type.as_deref(), Some("image/png"));

        let reply = ControlMessage::parse(
            r#"{"type":"confirmation_response","prompt_id":"7","confirmed":true}"#,
        )
        .unwrap();
        assert_eq!(
            reply,
            ControlMessage::ReplyConfirm {
                correlation_id: "7".into(),
                confirmed: true,
                feedback: None,
            }
        );
    }

    #[test]
    fn unit_messages_parse() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"cancel"}"#).unwrap(),
            ControlMessage::Cancel
        );
        let update = ControlMessage::parse(r#"{"type":"set_config","model":"m2"}"#).unwrap();
        assert_eq!(
            update,
            ControlMessage::SetConfig(ConfigUpdate {
                model: Some("m2".into()),
                ..ConfigUpdate::default()
            })
        );
    }

    #[test]
    fn request_records_use_correlation_id() {
        let json = serde_json::to_value(OutboundRecord::ConfirmationRequest {
            correlation_id: "7".into(),
            prompt: "apply?".into(),
            default: true,
            allow_feedback: false,
        })
        .unwrap();
        assert_eq!(json["type"], "confirmation_request");
        assert_eq!(json["correlation_id"], "7");
        assert_eq!(
            serde_json::to_value(OutboundRecord::TaskComplete).unwrap(),
            serde_json::json!({"type": "task_complete"})
        );
    }

    #[test]
    fn operation_result_flattens_extra_fields() {
        let json = serde_json::to_value(OutboundRecord::ApiKeyResult(
            OperationResult::ok("OPENAI_API_KEY set").with("key_name", "OPENAI_API_KEY"),
        ))
        .unwrap();
        assert_eq!(json["type"], "api_key_result");
        assert_eq!(json["success"], true);
        assert_eq!(json["key_name"], "OPENAI_API_KEY");
        assert!(json.get("error").is_none());
    }
}
