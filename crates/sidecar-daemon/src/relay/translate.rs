//! Event to wire record mapping.

use sidecar_core::protocol::{AgentEvent, OutboundRecord};

const DIVIDER_WIDTH: usize = 40;
const SUB_AGENT_PREVIEW_CHARS: usize = 100;

/// Map a backend event to the record sent to the client.
///
/// Returns `None` for events that produce no client output (a version
/// check without an available update).
pub fn translate(event: AgentEvent) -> Option<OutboundRecord> {
    let record = match event {
        AgentEvent::Text { text, level } => OutboundRecord::Text {
            content: text,
            level,
        },
        AgentEvent::FileContent {
            path,
            content,
            start_line,
            num_lines,
            total_lines,
            num_tokens,
        } => OutboundRecord::FileContent {
            path,
            content,
            start_line,
            num_lines,
            total_lines,
            num_tokens,
        },
        AgentEvent::FileListing {
            directory,
            files,
            recursive,
            total_size,
            dir_count,
            file_count,
        } => OutboundRecord::FileListing {
            directory,
            files,
            recursive,
            total_size,
            dir_count,
            file_count,
        },
        AgentEvent::GrepResult {
            search_term,
            directory,
            matches,
            total_matches,
            files_searched,
        } => OutboundRecord::GrepResult {
            search_term,
            directory,
            matches,
            total_matches,
            files_searched,
        },
        AgentEvent::Diff {
            path,
            operation,
            diff_lines,
        } => {
            let content = diff_lines
                .iter()
                .map(|line| {
                    let prefix = match line.line_type.as_str() {
                        "add" => '+',
                        "remove" => '-',
                        _ => ' ',
                    };
                    format!("{prefix}{}", line.content)
                })
                .collect::<Vec<_>>()
                .join("\n");
            OutboundRecord::Diff {
                path,
                operation,
                diff_lines,
                content,
            }
        }
        AgentEvent::ShellStart { command } => OutboundRecord::ShellStart {
            content: format!("$ {command}"),
            command,
        },
        AgentEvent::ShellOutput {
            command,
            stdout,
            stderr,
            exit_code,
        } => OutboundRecord::ShellOutput {
            content: format!("{stdout}{stderr}"),
            command,
            stdout,
            stderr,
            exit_code,
        },
        AgentEvent::Reasoning {
            reasoning,
            next_steps,
        } => OutboundRecord::Reasoning {
            content: reasoning,
            next_steps,
        },
        AgentEvent::AgentResponse { content } => OutboundRecord::AgentResponse { content },
        AgentEvent::SubAgentInvocation {
            agent_name,
            prompt,
            session_id,
            is_new_session,
        } => {
            let preview: String = prompt.chars().take(SUB_AGENT_PREVIEW_CHARS).collect();
            OutboundRecord::SubAgent {
                content: format!("[{agent_name}] {preview}..."),
                agent_name,
                prompt,
                session_id,
                is_new_session,
            }
        }
        AgentEvent::SubAgentResponse {
            agent_name,
            response,
            session_id,
        } => OutboundRecord::SubAgentResponse {
            content: response.clone(),
            agent_name,
            response,
            session_id,
        },
        AgentEvent::InputRequest { prompt_id, prompt } => OutboundRecord::InputRequest {
            correlation_id: prompt_id,
            prompt,
        },
        AgentEvent::ConfirmationRequest {
            prompt_id,
            prompt,
            default,
            allow_feedback,
        } => OutboundRecord::ConfirmationRequest {
            correlation_id: prompt_id,
            prompt,
            default,
            allow_feedback,
        },
        AgentEvent::SelectionRequest {
            prompt_id,
            prompt,
            options,
            multi_select,
        } => OutboundRecord::SelectionRequest {
            correlation_id: prompt_id,
            prompt,
            options,
            multi_select,
        },
        AgentEvent::Spinner {
            action,
            spinner_id,
            text,
        } => OutboundRecord::Spinner {
            action,
            spinner_id,
            content: text,
        },
        AgentEvent::StatusPanel { title, fields } => OutboundRecord::StatusPanel { title, fields },
        AgentEvent::Divider => OutboundRecord::Divider {
            content: "─".repeat(DIVIDER_WIDTH),
        },
        AgentEvent::VersionCheck {
            current_version,
            latest_version,
            update_available,
        } => {
            if !update_available {
                return None;
            }
            OutboundRecord::VersionCheck {
                content: format!("Update available: {current_version} → {latest_version}"),
                current_version,
                latest_version,
            }
        }
    };
    Some(record)
}
