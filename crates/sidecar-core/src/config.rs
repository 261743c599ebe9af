//! Persisted sidecar settings.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. Settings file (~/.config/sidecar/settings.json unless overridden)
//! 3. Environment variables
//!
//! CLI arguments are applied by the daemon on top of the loaded store.
//! Mutations go through [`ConfigStore::update`], which persists the file
//! before returning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// API key names always reported by the config snapshot, set or not.
pub const KNOWN_API_KEYS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "CEREBRAS_API_KEY",
    "OPENROUTER_API_KEY",
    "AZURE_OPENAI_API_KEY",
    "AZURE_OPENAI_ENDPOINT",
];

/// Environment variable carrying the stored OAuth access token into the backend.
pub const OAUTH_TOKEN_ENV: &str = "SIDECAR_OAUTH_ACCESS_TOKEN";

/// Complete sidecar settings document.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub api_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub oauth: OAuthSettings,
}

/// Which agent runs prompts and how it behaves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    pub default_agent: String,
    pub default_model: String,
    pub temperature: Option<f64>,
    pub auto_save: bool,
    pub suppress_thinking: bool,
    pub suppress_info: bool,
    /// Per-agent model overrides, keyed by agent name.
    pub model_pins: BTreeMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            default_agent: "code-puppy".to_string(),
            default_model: "gpt-5".to_string(),
            temperature: None,
            auto_save: true,
            suppress_thinking: false,
            suppress_info: false,
            model_pins: BTreeMap::new(),
        }
    }
}

/// An agent the backend advertises.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// How to launch the agent backend process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendSettings {
    /// Backend executable.
    pub program: PathBuf,
    /// Extra arguments placed before `--agent`/`--model`.
    pub args: Vec<String>,
    /// Agents the backend can load. Empty means "accept any name".
    pub agents: Vec<AgentDescriptor>,
    /// Models offered to clients.
    pub models: Vec<String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("sidecar-agent"),
            args: Vec::new(),
            agents: vec![AgentDescriptor {
                name: "code-puppy".to_string(),
                label: "Code Puppy".to_string(),
                description: "General purpose coding agent".to_string(),
            }],
            models: Vec::new(),
        }
    }
}

/// Identity provider endpoints and stored credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OAuthSettings {
    pub authorize_url: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
    /// Inclusive port range tried for the local callback listener.
    pub callback_port_range: (u16, u16),
    pub callback_timeout_secs: u64,
    /// Models unlocked by a successful login.
    pub models: Vec<String>,
    pub tokens: Option<StoredTokens>,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            authorize_url: None,
            token_url: None,
            client_id: None,
            scopes: Vec::new(),
            callback_port_range: (8765, 8795),
            callback_timeout_secs: 300,
            models: Vec::new(),
            tokens: None,
        }
    }
}

impl OAuthSettings {
    /// Whether enough is configured to run the authorization-code flow.
    pub const fn is_configured(&self) -> bool {
        self.authorize_url.is_some() && self.token_url.is_some() && self.client_id.is_some()
    }

    /// Whether a usable access token is stored.
    pub fn is_authenticated(&self) -> bool {
        self.tokens
            .as_ref()
            .is_some_and(|t| !t.access_token.is_empty())
    }
}

/// Tokens returned by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds).
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl StoredTokens {
    /// Remaining lifetime formatted as `"<h>h <m>m"`, if an expiry is known.
    pub fn expires_in(&self, now_unix: u64) -> Option<String> {
        let remaining = self.expires_at?.saturating_sub(now_unix);
        let minutes = remaining / 60;
        Some(format!("{}h {}m", minutes / 60, minutes % 60))
    }
}

impl Settings {
    /// Model used for `agent_name`: its pin if one exists, otherwise the
    /// global default.
    pub fn effective_model(&self, agent_name: &str) -> String {
        self.agent
            .model_pins
            .get(agent_name)
            .cloned()
            .unwrap_or_else(|| self.agent.default_model.clone())
    }

    /// Environment handed to the backend process: every stored API key plus
    /// the OAuth access token when present.
    pub fn backend_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .api_keys
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(tokens) = &self.oauth.tokens
            && !tokens.access_token.is_empty()
        {
            env.push((OAUTH_TOKEN_ENV.to_string(), tokens.access_token.clone()));
        }
        env
    }

    /// Names reported in the API key listing: the well-known ones followed
    /// by any other stored key.
    pub fn api_key_names(&self) -> Vec<String> {
        let mut names: Vec<String> = KNOWN_API_KEYS.iter().map(|k| (*k).to_string()).collect();
        for key in self.api_keys.keys() {
            if !names.iter().any(|n| n == key) {
                names.push(key.clone());
            }
        }
        names
    }
}

/// Mask a secret for display: `********...` plus the last four characters,
/// `****` for short values and an empty string when unset.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 4 {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{tail}", "*".repeat(8))
    } else if chars.is_empty() {
        String::new()
    } else {
        "****".to_string()
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Settings bound to the file they persist to.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    settings: Settings,
}

impl ConfigStore {
    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist yet. Environment overrides are applied on top.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut settings = if path.exists() {
            load_settings_file(&path)?
        } else {
            debug!(path = %path.display(), "Settings file missing, using defaults");
            Settings::default()
        };
        apply_env_overrides(&mut settings);
        Ok(Self { path, settings })
    }

    /// Build an in-memory store that persists to `path` on first update.
    pub fn with_settings(path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            path: path.into(),
            settings,
        }
    }

    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` and persist. On a write failure the in-memory
    /// settings are rolled back so memory and disk never diverge.
    pub fn update<T>(&mut self, change: impl FnOnce(&mut Settings) -> T) -> Result<T> {
        let previous = self.settings.clone();
        let out = change(&mut self.settings);
        if let Err(e) = self.save() {
            self.settings = previous;
            return Err(e);
        }
        Ok(out)
    }

    /// Write the settings file atomically (temp file + rename).
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        info!(path = %self.path.display(), "Settings saved");
        Ok(())
    }
}

/// Default settings path: `<config dir>/sidecar/settings.json`.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sidecar").join("settings.json"))
}

fn load_settings_file(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read settings file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse settings file {}: {}",
            path.display(),
            e
        ))
    })
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(val) = std::env::var("SIDECAR_DEFAULT_AGENT")
        && !val.is_empty()
    {
        settings.agent.default_agent = val;
    }
    if let Ok(val) = std::env::var("SIDECAR_DEFAULT_MODEL")
        && !val.is_empty()
    {
        settings.agent.default_model = val;
    }
    if let Ok(val) = std::env::var("SIDECAR_AGENT_BIN")
        && !val.is_empty()
    {
        settings.backend.program = PathBuf::from(val);
    }
}
