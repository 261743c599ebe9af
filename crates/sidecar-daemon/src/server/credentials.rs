//! Identity provider login, status and logout.

use std::time::Duration;

use tracing::{info, warn};

use sidecar_core::Settings;
use sidecar_core::config::{OAuthSettings, unix_now};
use sidecar_core::protocol::{OAuthStatus, OperationResult, OutboundRecord};

use crate::oauth::{CallbackListener, OAuthClient, OAuthError, PkceContext};
use crate::shared::{CredentialEpoch, SharedConfig};
use crate::sink::ClientSink;

use super::connection::Connection;

pub(super) fn status_of(settings: &Settings) -> OAuthStatus {
    let oauth = &settings.oauth;
    if !oauth.is_configured() {
        return OAuthStatus::default();
    }
    let authenticated = oauth.is_authenticated();
    OAuthStatus {
        available: true,
        authenticated,
        expires_in: oauth
            .tokens
            .as_ref()
            .filter(|_| authenticated)
            .and_then(|t| t.expires_in(unix_now())),
        models: if authenticated {
            oauth.models.clone()
        } else {
            Vec::new()
        },
        error: None,
    }
}

impl Connection {
    pub(super) async fn oauth_status(&self) {
        let status = status_of(self.state.config.read().await.settings());
        self.send(OutboundRecord::OauthStatus(status));
    }

    /// Begin a login: send the authorization URL, then wait for the
    /// provider's redirect in the background.
    pub(super) async fn oauth_start(&mut self) {
        let settings = self.state.config.read().await.settings().oauth.clone();
        if !settings.is_configured() {
            self.send(OutboundRecord::OauthResult(OperationResult::failed(
                OAuthError::NotConfigured.to_string(),
            )));
            return;
        }
        if let Some(previous) = self.login.take() {
            info!(connection_id = %self.id, "Restarting OAuth login");
            previous.abort();
        }

        let pkce = PkceContext::generate();
        let (start, end) = settings.callback_port_range;
        let prepared = CallbackListener::bind_in_range(start, end).and_then(|listener| {
            let redirect_uri = listener.redirect_uri();
            let url = OAuthClient::authorization_url(&settings, &pkce, &redirect_uri)?;
            Ok((listener, url, redirect_uri))
        });
        let (listener, url, redirect_uri) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Failed to start OAuth login");
                self.send(OutboundRecord::OauthResult(OperationResult::failed(
                    e.to_string(),
                )));
                return;
            }
        };

        info!(connection_id = %self.id, port = listener.port(), "OAuth login started");
        self.send(OutboundRecord::OauthUrl {
            url,
            redirect_uri: redirect_uri.clone(),
        });

        let flow = LoginFlow {
            connection_id: self.id.clone(),
            client: self.state.oauth.clone(),
            config: self.state.config.clone(),
            credentials: self.state.credentials.clone(),
            sink: self.sink.clone(),
            timeout: Duration::from_secs(settings.callback_timeout_secs),
            settings,
            pkce,
            redirect_uri,
        };
        self.login = Some(tokio::spawn(flow.run(listener)));
    }

    pub(super) async fn oauth_logout(&self) {
        let (result, status) = {
            let mut store = self.state.config.write().await;
            let result = store.update(|s| s.oauth.tokens.take().is_some());
            (result, status_of(store.settings()))
        };
        match result {
            Ok(had_tokens) => {
                if had_tokens {
                    self.state.credentials.bump();
                }
                info!(connection_id = %self.id, had_tokens, "OAuth logout");
                self.send(OutboundRecord::OauthResult(OperationResult::ok("Logged out")));
                self.send(OutboundRecord::OauthStatus(status));
            }
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Failed to remove stored tokens");
                self.send(OutboundRecord::OauthResult(OperationResult::failed(
                    e.to_string(),
                )));
            }
        }
    }
}

/// A login waiting for its callback.
struct LoginFlow {
    connection_id: String,
    client: OAuthClient,
    config: SharedConfig,
    credentials: CredentialEpoch,
    sink: ClientSink,
    settings: OAuthSettings,
    pkce: PkceContext,
    redirect_uri: String,
    timeout: Duration,
}

impl LoginFlow {
    async fn run(self, listener: CallbackListener) {
        match self.complete(listener).await {
            Ok(status) => {
                info!(connection_id = %self.connection_id, "OAuth login succeeded");
                let _ = self.sink.send(OutboundRecord::OauthResult(OperationResult::ok(
                    "Authentication successful",
                )));
                let _ = self.sink.send(OutboundRecord::OauthStatus(status));
            }
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "OAuth login failed");
                let _ = self
                    .sink
                    .send(OutboundRecord::OauthResult(OperationResult::failed(
                        e.to_string(),
                    )));
            }
        }
    }

    async fn complete(&self, listener: CallbackListener) -> Result<OAuthStatus, OAuthError> {
        let code = listener
            .await_callback(self.timeout)
            .await?
            .into_code(&self.pkce.state)?;
        let tokens = self
            .client
            .exchange_code(&self.settings, &code, &self.pkce.verifier, &self.redirect_uri)
            .await?;
        let status = {
            let mut store = self.config.write().await;
            store.update(|s| s.oauth.tokens = Some(tokens))?;
            status_of(store.settings())
        };
        self.credentials.bump();
        Ok(status)
    }
}
