//! Events produced by the agent backend.
//!
//! Events arrive as one JSON object per line, discriminated by `"type"`.
//! The set is closed: anything else is surfaced by the parser as
//! [`super::BackendMessage::Unknown`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity attached to plain text events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Success,
}

/// Kind of reply a request-type event is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Input,
    Confirm,
    Select,
}

impl InteractionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Confirm => "confirm",
            Self::Select => "select",
        }
    }
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    /// `add`, `remove` or `context`.
    #[serde(rename = "type")]
    pub line_type: String,
    pub content: String,
    #[serde(default)]
    pub line_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub file_path: String,
    pub line_number: u64,
    pub line_content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    /// `file` or `directory`.
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionOption {
    pub label: String,
    pub value: String,
}

const fn default_true() -> bool {
    true
}

/// A single backend event. Produced in one total order per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Text {
        text: String,
        #[serde(default)]
        level: MessageLevel,
    },
    FileContent {
        path: String,
        content: String,
        #[serde(default)]
        start_line: Option<u64>,
        #[serde(default)]
        num_lines: Option<u64>,
        #[serde(default)]
        total_lines: u64,
        #[serde(default)]
        num_tokens: u64,
    },
    FileListing {
        directory: String,
        #[serde(default)]
        files: Vec<FileEntry>,
        #[serde(default)]
        recursive: bool,
        #[serde(default)]
        total_size: u64,
        #[serde(default)]
        dir_count: u64,
        #[serde(default)]
        file_count: u64,
    },
    GrepResult {
        search_term: String,
        directory: String,
        #[serde(default)]
        matches: Vec<GrepMatch>,
        #[serde(default)]
        total_matches: u64,
        #[serde(default)]
        files_searched: u64,
    },
    Diff {
        path: String,
        #[serde(default)]
        operation: String,
        #[serde(default)]
        diff_lines: Vec<DiffLine>,
    },
    ShellStart {
        command: String,
    },
    ShellOutput {
        command: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        exit_code: i32,
    },
    Reasoning {
        reasoning: String,
        #[serde(default)]
        next_steps: Option<String>,
    },
    AgentResponse {
        content: String,
    },
    SubAgentInvocation {
        agent_name: String,
        prompt: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_new_session: bool,
    },
    SubAgentResponse {
        agent_name: String,
        response: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    InputRequest {
        prompt_id: String,
        prompt: String,
    },
    ConfirmationRequest {
        prompt_id: String,
        prompt: String,
        #[serde(default = "default_true")]
        default: bool,
        #[serde(default)]
        allow_feedback: bool,
    },
    SelectionRequest {
        prompt_id: String,
        prompt: String,
        #[serde(default)]
        options: Vec<SelectionOption>,
        #[serde(default)]
        multi_select: bool,
    },
    Spinner {
        action: String,
        #[serde(default)]
        spinner_id: Option<String>,
        #[serde(default)]
        text: String,
    },
    StatusPanel {
        title: String,
        #[serde(default)]
        fields: BTreeMap<String, Value>,
    },
    Divider,
    VersionCheck {
        current_version: String,
        latest_version: String,
        #[serde(default)]
        update_available: bool,
    },
}

/// Every `"type"` value [`AgentEvent`] accepts.
pub const EVENT_TYPES: &[&str] = &[
    "text",
    "file_content",
    "file_listing",
    "grep_result",
    "diff",
    "shell_start",
    "shell_output",
    "reasoning",
    "agent_response",
    "sub_agent_invocation",
    "sub_agent_response",
    "input_request",
    "confirmation_request",
    "selection_request",
    "spinner",
    "status_panel",
    "divider",
    "version_check",
];

impl AgentEvent {
    /// Short name used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::FileContent { .. } => "file_content",
            Self::FileListing { .. } => "file_listing",
            Self::GrepResult { .. } => "grep_result",
            Self::Diff { .. } => "diff",
            Self::ShellStart { .. } => "shell_start",
            Self::ShellOutput { .. } => "shell_output",
            Self::Reasoning { .. } => "reasoning",
            Self::AgentResponse { .. } => "agent_response",
            Self::SubAgentInvocation { .. } => "sub_agent_invocation",
            Self::SubAgentResponse { .. } => "sub_agent_response",
            Self::InputRequest { .. } => "input_request",
            Self::ConfirmationRequest { .. } => "confirmation_request",
            Self::SelectionRequest { .. } => "selection_request",
            Self::Spinner { .. } => "spinner",
            Self::StatusPanel { .. } => "status_panel",
            Self::Divider => "divider",
            Self::VersionCheck { .. } => "version_check",
        }
    }

    /// For request-type events, the correlation id and the reply kind the
    /// backend is blocked on.
    pub fn interaction(&self) -> Option<(&str, InteractionKind)> {
        match self {
            Self::InputRequest { prompt_id, .. } => Some((prompt_id, InteractionKind::Input)),
            Self::ConfirmationRequest { prompt_id, .. } => {
                Some((prompt_id, InteractionKind::Confirm))
            }
            Self::SelectionRequest { prompt_id, .. } => Some((prompt_id, InteractionKind::Select)),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.interaction().is_some()
    }

    /// Shorthand for an info-level text event.
    pub fn info(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            level: MessageLevel::Info,
        }
    }
}
