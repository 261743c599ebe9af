//! Identity provider HTTP client.

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sidecar_core::config::{OAuthSettings, StoredTokens, unix_now};

use super::{OAuthError, PkceContext};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    code: &'a str,
    redirect_uri: &'a str,
    client_id: &'a str,
    code_verifier: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Builds authorization URLs and exchanges codes for tokens.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new() -> Result<Self, OAuthError> {
        // reqwest is built with rustls-no-provider; an Err here means a
        // provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    /// Authorization endpoint URL for a fresh PKCE context.
    pub fn authorization_url(
        settings: &OAuthSettings,
        pkce: &PkceContext,
        redirect_uri: &str,
    ) -> Result<String, OAuthError> {
        let (Some(authorize_url), Some(client_id)) = (&settings.authorize_url, &settings.client_id)
        else {
            return Err(OAuthError::NotConfigured);
        };
        let scope = settings.scopes.join(" ");
        let mut params = vec![
            ("response_type", "code"),
            ("client_id", client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", pkce.state.as_str()),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }
        let url = Url::parse_with_params(authorize_url, &params)
            .map_err(|e| OAuthError::InvalidUrl(format!("{authorize_url}: {e}")))?;
        Ok(url.into())
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        settings: &OAuthSettings,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<StoredTokens, OAuthError> {
        let (Some(token_url), Some(client_id)) = (&settings.token_url, &settings.client_id) else {
            return Err(OAuthError::NotConfigured);
        };
        let body = TokenRequest {
            grant_type: "authorization_code",
            code,
            redirect_uri,
            client_id,
            code_verifier: verifier,
        };
        debug!(token_url = %token_url, "Exchanging authorization code");
        let resp = self.http.post(token_url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .ok()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());
            return Err(OAuthError::TokenExchange {
                status: status.as_u16(),
                message,
            });
        }
        let tokens: TokenResponse = resp.json().await?;
        info!(expires_in = ?tokens.expires_in, "Token exchange succeeded");
        Ok(StoredTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_in.map(|secs| unix_now() + secs),
        })
    }
}
