//! HTTP client for the Fieldbook authentication contract.
//!
//! JSON over bearer-token auth. Every response body uses the server's
//! `{ data, message }` envelope; an envelope whose `data` is missing the
//! required fields is a [`Error::MalformedResponse`] — treated as a
//! defect, surfaced immediately and never retried.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// The authenticated user as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Login name
    pub username: String,
    /// Contact email
    pub email: String,
    /// Authorization role (e.g. `member`, `curator`, `admin`)
    pub role: String,
}

/// Successful login payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    /// The authenticated user
    pub user: UserInfo,
    /// Short-lived access token
    pub token: String,
    /// Longer-lived refresh token
    pub refresh_token: String,
    /// Access token expiry
    pub token_expires_at: DateTime<Utc>,
    /// Refresh token expiry
    pub refresh_token_expires_at: DateTime<Utc>,
    /// Identifier of this user's remote replication store
    pub db_name: String,
}

/// Successful token refresh payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshData {
    /// New access token
    pub token: String,
    /// New access token expiry
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    message: Option<String>,
}

/// Typed client for the Fieldbook server API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    server: ServerConfig,
}

impl ApiClient {
    /// Create a new API client for the given server.
    #[must_use]
    pub fn new(server: ServerConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client, server }
    }

    /// Server this client talks to.
    #[must_use]
    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    /// `POST /login` — authenticate with username and password.
    ///
    /// # Errors
    ///
    /// [`Error::LoginRejected`] on a non-success status,
    /// [`Error::MalformedResponse`] when the envelope is incomplete.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginData> {
        let response = self
            .client
            .post(self.server.auth_url("login"))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::LoginRejected(response.status().as_u16()));
        }

        Self::envelope_data(response, "login response missing data").await
    }

    /// `POST /refresh-token` — mint a new access token.
    ///
    /// # Errors
    ///
    /// [`Error::RefreshFailed`] on a non-success status,
    /// [`Error::MalformedResponse`] when the envelope is incomplete.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshData> {
        let response = self
            .client
            .post(self.server.auth_url("refresh-token"))
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::RefreshFailed(format!(
                "server answered {}",
                response.status()
            )));
        }

        Self::envelope_data(response, "refresh response missing token or expiry").await
    }

    /// `POST /logout` — invalidate the token server-side.
    ///
    /// Best-effort by contract: callers complete the local logout whether
    /// or not this call succeeds.
    pub async fn logout(&self, token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.server.auth_url("logout"))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::rejection(response).await)
        }
    }

    /// `GET /me` — fetch the current user. Opportunistic; never required
    /// for offline operation.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] on 401/403 so the caller can clear a dead
    /// session.
    pub async fn me(&self, token: &str) -> Result<UserInfo> {
        let response = self
            .client
            .get(self.server.auth_url("me"))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Unauthorized);
        }
        if !status.is_success() {
            return Err(Self::rejection(response).await);
        }

        #[derive(Deserialize)]
        struct MeData {
            user: UserInfo,
        }
        let data: MeData = Self::envelope_data(response, "me response missing user").await?;
        Ok(data.user)
    }

    /// `POST /register` — request an account. Returns the server's
    /// confirmation message.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<String> {
        let response = self
            .client
            .post(self.server.auth_url("register"))
            .json(&serde_json::json!({
                "username": username,
                "email": email,
                "password": password,
            }))
            .send()
            .await?;

        let status = response.status();
        let message = Self::message_of(response).await;
        if status == reqwest::StatusCode::CREATED {
            Ok(message)
        } else {
            Err(Error::ServerRejected {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// `POST /forgot-password` — request a password reset email.
    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        let response = self
            .client
            .post(self.server.auth_url("forgot-password"))
            .json(&serde_json::json!({ "email": email }))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::rejection(response).await)
        }
    }

    /// `PUT /change-password` — change the password for the current user.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] on 401/403; the session can no longer be
    /// trusted.
    pub async fn change_password(
        &self,
        token: &str,
        username: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let response = self
            .client
            .put(self.server.auth_url("change-password"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "username": username,
                "currentPassword": current_password,
                "newPassword": new_password,
            }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Unauthorized);
        }
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::rejection(response).await)
        }
    }

    /// `DELETE /account` — delete the current user's account.
    pub async fn delete_account(&self, token: &str, username: &str, password: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.server.user_url("account"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Unauthorized);
        }
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::rejection(response).await)
        }
    }

    async fn envelope_data<T: DeserializeOwned>(
        response: reqwest::Response,
        missing: &'static str,
    ) -> Result<T> {
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|_| Error::MalformedResponse(missing))?;
        envelope.data.ok_or(Error::MalformedResponse(missing))
    }

    async fn message_of(response: reqwest::Response) -> String {
        response
            .json::<Envelope<serde_json::Value>>()
            .await
            .ok()
            .and_then(|envelope| envelope.message)
            .unwrap_or_default()
    }

    async fn rejection(response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let message = Self::message_of(response).await;
        Error::ServerRejected { status, message }
    }
}
