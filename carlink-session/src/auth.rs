//! Token lifecycle: initial login, silent refresh, terminal expiry.
//!
//! The identity provider speaks OAuth password/refresh-token grants. The
//! password grant uses a one-time code mailed to the account; the code is
//! spent on its first use regardless of outcome.

use std::sync::Arc;

use crate::types::{AuthConfig, ClientIdentity, CodeUsedFn, Credentials, Error, TokenStore};

const CLIENT_ID: &str = "app";

/// Authentication state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    Expired,
}

#[derive(Debug, serde::Deserialize, Default)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CodeRequestResponse {
    #[serde(default)]
    is_email: bool,
}

/// Owns the authentication state machine. All calls run on the session's
/// event loop, so a pending refresh suppresses new refresh triggers by
/// construction.
pub struct TokenManager {
    http: reqwest::Client,
    config: AuthConfig,
    identity: ClientIdentity,
    store: Arc<TokenStore>,
    state: AuthState,
    on_code_used: Option<CodeUsedFn>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        config: AuthConfig,
        identity: ClientIdentity,
        store: Arc<TokenStore>,
        on_code_used: Option<CodeUsedFn>,
    ) -> Self {
        Self {
            http,
            config,
            identity,
            store,
            state: AuthState::Unauthenticated,
            on_code_used,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Initial login: refresh the stored pair if one exists, otherwise
    /// exchange the one-time code, otherwise request a fresh code by mail and
    /// fail with [`Error::CodeRequired`].
    pub async fn login(&mut self) -> Result<(), Error> {
        self.state = AuthState::Authenticating;

        if !self.store.snapshot().refresh_token.is_empty() {
            match self.refresh().await {
                Ok(()) => return Ok(()),
                Err(Error::AuthExpired) => {
                    tracing::warn!("stored refresh token rejected, falling back to login code");
                }
                Err(e) => {
                    tracing::warn!("stored token refresh failed, falling back to login code: {e}");
                    self.store.clear();
                }
            }
            self.state = AuthState::Authenticating;
        }

        match self.config.login_code.take() {
            Some(code) => self.password_grant(&code).await,
            None => {
                self.request_code().await?;
                self.state = AuthState::Unauthenticated;
                Err(Error::CodeRequired)
            }
        }
    }

    /// Exchange the refresh token for a new pair.
    ///
    /// Transient failures keep the stored credentials and leave the manager in
    /// `Refreshing` so the caller can schedule a retry. A terminal
    /// `invalid_grant` clears the stored pair and parks the manager in
    /// `Expired` until a full re-login.
    pub async fn refresh(&mut self) -> Result<(), Error> {
        self.state = AuthState::Refreshing;
        let refresh_token = self.store.snapshot().refresh_token;
        if refresh_token.is_empty() {
            self.state = AuthState::Unauthenticated;
            return Err(Error::CodeRequired);
        }

        tracing::debug!("refreshing access token");
        let form = [
            ("client_id", CLIENT_ID),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        match self.token_grant(&form, false).await {
            Ok(credentials) => {
                self.store.set(credentials);
                self.state = AuthState::Authenticated;
                tracing::debug!("token refresh complete");
                Ok(())
            }
            Err(Error::AuthExpired) => {
                tracing::error!("refresh token invalidated by the identity provider");
                self.store.clear();
                self.state = AuthState::Expired;
                Err(Error::AuthExpired)
            }
            Err(e) => {
                tracing::warn!("token refresh failed: {e}");
                Err(e)
            }
        }
    }

    async fn password_grant(&mut self, code: &str) -> Result<(), Error> {
        tracing::debug!("exchanging one-time login code");
        let form = [
            ("client_id", CLIENT_ID),
            ("grant_type", "password"),
            ("scope", "offline_access"),
            ("username", self.config.email.as_str()),
            ("password", code),
        ];
        let result = self.token_grant(&form, true).await;

        // The code is single-use: spent now, whatever the outcome.
        if let Some(on_code_used) = &self.on_code_used {
            on_code_used();
        }

        match result {
            Ok(credentials) => {
                self.store.set(credentials);
                self.state = AuthState::Authenticated;
                tracing::info!("login complete");
                Ok(())
            }
            Err(e) => {
                self.state = AuthState::Unauthenticated;
                let reason = match e {
                    Error::AuthExpired => "one-time code rejected".to_string(),
                    other => other.to_string(),
                };
                tracing::error!("login failed: {reason}; request a fresh code via mail");
                Err(Error::Auth(reason))
            }
        }
    }

    /// Ask the backend to mail a fresh one-time code to the account.
    async fn request_code(&self) -> Result<(), Error> {
        let resp = self
            .http
            .post(&self.config.code_request_url)
            .header("X-SessionId", &self.identity.session_id)
            .header("X-TrackingId", &self.identity.tracking_id)
            .json(&serde_json::json!({
                "locale": self.config.locale,
                "emailOrPhoneNumber": self.config.email,
                "countryCode": self.config.country_code,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Auth(format!("code request returned {status}")));
        }
        let body: CodeRequestResponse = resp
            .json()
            .await
            .map_err(|e| Error::Auth(format!("code request decode: {e}")))?;
        if body.is_email {
            tracing::info!("one-time login code sent by mail; supply it via AuthConfig::login_code");
            Ok(())
        } else {
            Err(Error::Auth("account not found for the given email".into()))
        }
    }

    async fn token_grant(
        &self,
        form: &[(&str, &str)],
        with_device_header: bool,
    ) -> Result<Credentials, Error> {
        let mut req = self
            .http
            .post(&self.config.token_url)
            .header("X-SessionId", &self.identity.session_id)
            .header("X-TrackingId", &self.identity.tracking_id)
            .form(form);
        if with_device_header {
            req = req.header("X-DeviceId", &self.identity.device_id);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::Auth(format!("token endpoint {status}: {e}")))?;

        if let Some(err) = body.error {
            if err == "invalid_grant" {
                return Err(Error::AuthExpired);
            }
            let reason = match body.error_description {
                Some(desc) => format!("{err}: {desc}"),
                None => err,
            };
            return Err(Error::Auth(reason));
        }
        if !status.is_success() || body.access_token.is_empty() {
            return Err(Error::Auth(format!("token endpoint returned {status}")));
        }
        Ok(Credentials::new(body.access_token, body.refresh_token))
    }
}
