//! Authorization-code login with PKCE against the configured identity
//! provider.
//!
//! ```text
//! oauth_start → PkceContext + CallbackListener → oauth_url to client
//!             → browser redirect → await_callback → exchange_code → tokens
//! ```

mod callback;
mod client;
mod pkce;

pub use callback::{CallbackListener, CallbackParams};
pub use client::OAuthClient;
pub use pkce::PkceContext;

/// Errors from the login flow.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("OAuth is not configured")]
    NotConfigured,

    #[error("No free callback port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("OAuth callback timed out")]
    Timeout,

    #[error("OAuth callback listener stopped unexpectedly")]
    ListenerStopped,

    #[error("Missing code or state in callback")]
    MissingParameters,

    #[error("Authorization denied: {error}")]
    Denied { error: String },

    #[error("State mismatch - possible CSRF attack")]
    StateMismatch,

    #[error("Invalid provider URL: {0}")]
    InvalidUrl(String),

    #[error("Token exchange failed ({status}): {message}")]
    TokenExchange { status: u16, message: String },

    #[error("Failed to store tokens: {0}")]
    Store(#[from] sidecar_core::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
