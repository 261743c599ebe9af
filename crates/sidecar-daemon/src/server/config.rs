//! Configuration messages: settings, API keys, model pins, working directory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{info, warn};

use sidecar_core::Settings;
use sidecar_core::config::mask_secret;
use sidecar_core::protocol::{
    ApiKeyStatus, AvailableOptions, ConfigSnapshot, ConfigUpdate, CurrentConfig, OperationResult,
    OutboundRecord,
};

use super::connection::Connection;

/// Models offered to the client: the backend's list plus the models a
/// successful login unlocks.
pub(super) fn available_models(settings: &Settings) -> Vec<String> {
    let mut models = settings.backend.models.clone();
    if settings.oauth.is_authenticated() {
        for model in &settings.oauth.models {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }
    }
    models
}

fn api_key_listing(settings: &Settings) -> BTreeMap<String, ApiKeyStatus> {
    settings
        .api_key_names()
        .into_iter()
        .map(|name| {
            let value = settings.api_keys.get(&name).map_or("", String::as_str);
            let status = ApiKeyStatus {
                is_set: !value.is_empty(),
                masked: mask_secret(value),
            };
            (name, status)
        })
        .collect()
}

/// Apply `update` to `settings`, returning a label per change.
fn apply_update(settings: &mut Settings, update: &ConfigUpdate) -> Vec<String> {
    let mut changes = Vec::new();
    if let Some(agent) = update.agent.as_deref().filter(|a| !a.is_empty()) {
        settings.agent.default_agent = agent.to_string();
        changes.push(format!("Agent: {agent}"));
    }
    if let Some(model) = update.model.as_deref().filter(|m| !m.is_empty()) {
        settings.agent.default_model = model.to_string();
        changes.push(format!("Model: {model}"));
    }
    if let Some(temperature) = update.temperature {
        settings.agent.temperature = Some(temperature);
        changes.push(format!("Temperature: {temperature}"));
    }
    if let Some(yolo) = update.yolo_mode {
        changes.push(format!("YOLO mode: {yolo} (session only)"));
    }
    if let Some(auto_save) = update.auto_save {
        settings.agent.auto_save = auto_save;
        changes.push(format!("Auto-save: {auto_save}"));
    }
    if let Some(suppress) = update.suppress_thinking {
        settings.agent.suppress_thinking = suppress;
        changes.push(format!("Suppress thinking: {suppress}"));
    }
    if let Some(suppress) = update.suppress_info {
        settings.agent.suppress_info = suppress;
        changes.push(format!("Suppress info: {suppress}"));
    }
    changes
}

impl Connection {
    pub(super) async fn get_config(&self) {
        let agents = self.state.loader.available_agents().await;
        let store = self.state.config.read().await;
        let settings = store.settings();
        let agent = settings.agent.default_agent.clone();
        let snapshot = ConfigSnapshot {
            current: CurrentConfig {
                model: settings.effective_model(&agent),
                agent,
                temperature: settings.agent.temperature,
                yolo_mode: self.yolo_mode,
                auto_save: settings.agent.auto_save,
                suppress_thinking: settings.agent.suppress_thinking,
                suppress_info: settings.agent.suppress_info,
            },
            available: AvailableOptions {
                agents,
                models: available_models(settings),
            },
            api_keys: api_key_listing(settings),
            model_pinning: settings.agent.model_pins.clone(),
        };
        drop(store);
        self.send(OutboundRecord::Config(snapshot));
    }

    /// Persist a partial settings update. Agent and model changes take
    /// effect on the next prompt through the agent lifecycle.
    pub(super) async fn set_config(&mut self, update: ConfigUpdate) {
        let result = self
            .state
            .config
            .write()
            .await
            .update(|settings| apply_update(settings, &update));

        match result {
            Ok(changes) => {
                if let Some(yolo) = update.yolo_mode {
                    self.yolo_mode = yolo;
                }
                info!(connection_id = %self.id, changes = changes.len(), "Configuration updated");
                let summary = (!changes.is_empty()).then(|| {
                    let lines: Vec<String> = changes.iter().map(|c| format!("  • {c}")).collect();
                    format!("Configuration updated:\n{}", lines.join("\n"))
                });
                self.send(OutboundRecord::ConfigUpdated {
                    success: true,
                    changes,
                    error: None,
                });
                if let Some(summary) = summary {
                    self.send(OutboundRecord::status(summary));
                }
            }
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Failed to save configuration");
                self.send(OutboundRecord::ConfigUpdated {
                    success: false,
                    changes: Vec::new(),
                    error: Some(e.to_string()),
                });
            }
        }
    }

    /// Store or clear an API key. A successful change advances the
    /// credential epoch so every session refreshes its backend.
    pub(super) async fn set_api_key(&self, key_name: Option<String>, value: String) {
        let Some(key_name) = key_name.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
        else {
            self.send(OutboundRecord::ApiKeyResult(OperationResult::failed(
                "Key name is required",
            )));
            return;
        };
        let value = value.trim().to_string();
        let clearing = value.is_empty();

        let result = self.state.config.write().await.update(|settings| {
            if clearing {
                settings.api_keys.remove(&key_name);
            } else {
                settings.api_keys.insert(key_name.clone(), value);
            }
        });

        let record = match result {
            Ok(()) => {
                self.state.credentials.bump();
                let verb = if clearing { "cleared" } else { "set" };
                info!(connection_id = %self.id, key_name = %key_name, verb, "API key updated");
                OperationResult::ok(format!("{key_name} {verb}"))
            }
            Err(e) => {
                warn!(connection_id = %self.id, key_name = %key_name, error = %e, "Failed to save API key");
                OperationResult::failed(e.to_string())
            }
        };
        self.send(OutboundRecord::ApiKeyResult(record.with("key_name", key_name)));
    }

    /// Pin a model to an agent; an empty model clears the pin.
    pub(super) async fn set_model_pin(&self, agent_name: Option<String>, model_name: String) {
        let Some(agent_name) = agent_name.filter(|a| !a.trim().is_empty()) else {
            self.send(OutboundRecord::ModelPinResult(OperationResult::failed(
                "Agent name is required",
            )));
            return;
        };
        let model_name = model_name.trim().to_string();

        let result = self.state.config.write().await.update(|settings| {
            if model_name.is_empty() {
                settings.agent.model_pins.remove(&agent_name);
            } else {
                settings
                    .agent
                    .model_pins
                    .insert(agent_name.clone(), model_name.clone());
            }
        });

        let record = match result {
            Ok(()) if model_name.is_empty() => {
                OperationResult::ok(format!("Model pin cleared for agent \"{agent_name}\""))
            }
            Ok(()) => OperationResult::ok(format!(
                "Agent \"{agent_name}\" pinned to model \"{model_name}\""
            ))
            .with("model_name", model_name),
            Err(e) => OperationResult::failed(e.to_string()),
        };
        self.send(OutboundRecord::ModelPinResult(
            record.with("agent_name", agent_name),
        ));
    }

    /// Switch the directory new backends start in. The current agent's
    /// backend is invalidated so the next prompt runs in the new directory.
    pub(super) fn set_working_directory(&self, path: &str) {
        let path = path.trim();
        if path.is_empty() {
            self.send(OutboundRecord::WorkingDirectoryResult(
                OperationResult::failed("Path is required"),
            ));
            return;
        }
        let resolved = expand_home(path);
        let resolved = resolved.canonicalize().unwrap_or(resolved);
        if !resolved.is_dir() {
            self.send(OutboundRecord::WorkingDirectoryResult(
                OperationResult::failed(format!(
                    "Path does not exist or is not a directory: {path}"
                )),
            ));
            return;
        }

        self.state.working_dir.set(&resolved);
        self.session.invalidate_generation();
        let display = resolved.display().to_string();
        self.send(OutboundRecord::WorkingDirectory {
            path: display.clone(),
        });
        self.send(OutboundRecord::WorkingDirectoryResult(
            OperationResult::ok(format!("Working directory changed to: {display}"))
                .with("path", display.clone()),
        ));
        self.send(OutboundRecord::status(format!(
            "Working directory changed to: {display}"
        )));
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => dirs::home_dir().map_or_else(
            || PathBuf::from(path),
            |home| home.join(rest.trim_start_matches('/')),
        ),
        _ => PathBuf::from(path),
    }
}
