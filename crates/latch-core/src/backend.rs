//! HTTP client for the lock backend.
//!
//! Two classes of call. The lock path (`status`, `send-command`) has no
//! timeout of its own. Account and settings calls abort after the configured
//! request timeout and report "Server unreachable". Every call except sign-in
//! and sign-up carries the bearer token when one is held.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::ble::protocol::LockCommand;
use crate::config::BackendConfig;
use crate::lock_state::LockState;
use crate::realtime::LockBackend;
use crate::session::{Session, SessionUser};

/// Errors from backend calls.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The base URL or a joined path is invalid.
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The request could not be sent or the body not read.
    #[error("Backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The request was aborted after the timeout.
    #[error("Server unreachable")]
    Timeout,

    /// The server answered with a non-success status.
    #[error("{detail} (HTTP {status})")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Server-provided `detail`, or a default message.
        detail: String,
    },

    /// The body did not have the expected shape.
    #[error("Unexpected backend response: {0}")]
    MalformedResponse(String),
}

/// Result alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

fn send_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Request(err)
    }
}

/// Per-device user settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSettings {
    /// Push notifications for lock events.
    pub notis_enabled: bool,
    /// Re-lock automatically after unlocking.
    pub auto_lock_enabled: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            notis_enabled: true,
            auto_lock_enabled: true,
        }
    }
}

impl DeviceSettings {
    /// Value of one setting.
    #[must_use]
    pub const fn get(&self, key: SettingKey) -> bool {
        match key {
            SettingKey::NotisEnabled => self.notis_enabled,
            SettingKey::AutoLockEnabled => self.auto_lock_enabled,
        }
    }
}

/// A single toggle in [`DeviceSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    /// `notisEnabled`
    NotisEnabled,
    /// `autoLockEnabled`
    AutoLockEnabled,
}

impl SettingKey {
    /// JSON field name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotisEnabled => "notisEnabled",
            Self::AutoLockEnabled => "autoLockEnabled",
        }
    }
}

impl std::str::FromStr for SettingKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notisEnabled" | "notis_enabled" | "notifications" => Ok(Self::NotisEnabled),
            "autoLockEnabled" | "auto_lock_enabled" | "auto-lock" => Ok(Self::AutoLockEnabled),
            other => Err(format!("unknown setting '{other}'")),
        }
    }
}

/// Account creation request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    /// Login email.
    pub email: String,
    /// Password.
    pub password: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
}

#[derive(Debug, Serialize)]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    user: Option<SessionUser>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateSettingResponse {
    settings: Option<DeviceSettings>,
}

/// Join `path` onto `base`, tolerating missing or doubled slashes.
///
/// # Errors
///
/// Returns [`BackendError::InvalidUrl`] if either part is invalid.
pub fn build_api_url(base: &Url, path: &str) -> BackendResult<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    Ok(base.join(path.trim_start_matches('/'))?)
}

/// HTTP client for the lock backend.
#[derive(Debug)]
pub struct BackendClient {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
    token: RwLock<Option<String>>,
}

impl BackendClient {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(base_url: &str, request_timeout: Duration) -> BackendResult<Self> {
        let base_url = Url::parse(base_url)?;
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url,
            request_timeout,
            token: RwLock::new(None),
        })
    }

    /// Create a client from the `[backend]` configuration section.
    ///
    /// # Errors
    ///
    /// See [`BackendClient::new`].
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        Self::new(&config.base_url, config.request_timeout())
    }

    /// The configured base URL.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Set or clear the bearer token sent with lock and settings calls.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// The current bearer token.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn url(&self, path: &str) -> BackendResult<Url> {
        build_api_url(&self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn rejection(response: Response, default: &str) -> BackendError {
        let status = response.status().as_u16();
        let detail = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body.get("detail").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| default.to_string());
        BackendError::Rejected { status, detail }
    }

    // =========================================================================
    // Lock path
    // =========================================================================

    /// `GET status/{device_id}`.
    ///
    /// A string `status` of exactly `"LOCKED"` is locked; any other string is
    /// unlocked.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or `status` is not a string.
    pub async fn fetch_status(&self, device_id: &str) -> BackendResult<LockState> {
        let url = self.url(&format!("status/{device_id}"))?;
        let body: Value = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(send_error)?
            .json()
            .await?;

        match body.get("status").and_then(Value::as_str) {
            Some(status) => {
                debug!(device_id, status, "Fetched lock status");
                Ok(LockState::from_http_status(status))
            }
            None => Err(BackendError::MalformedResponse(
                "missing string field 'status'".into(),
            )),
        }
    }

    /// `POST send-command/{device_id}/{LOCK|UNLOCK}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server rejects it.
    pub async fn send_command(&self, device_id: &str, command: LockCommand) -> BackendResult<()> {
        let url = self.url(&format!("send-command/{device_id}/{command}"))?;
        let response = self
            .authorized(self.client.post(url))
            .send()
            .await
            .map_err(send_error)?;
        if !response.status().is_success() {
            return Err(Self::rejection(response, "Command rejected").await);
        }
        info!(device_id, %command, "Remote command accepted");
        Ok(())
    }

    // =========================================================================
    // Account
    // =========================================================================

    /// `POST auth/login`. Stores the returned token on success.
    ///
    /// # Errors
    ///
    /// Returns the server's `detail` on rejection, or [`BackendError::Timeout`].
    pub async fn sign_in(&self, email: &str, password: &str) -> BackendResult<Session> {
        let url = self.url("auth/login")?;
        let request = self
            .client
            .post(url)
            .json(&SignInRequest { email, password })
            .timeout(self.request_timeout);
        self.authenticate(request, "Invalid credentials. Please try again.")
            .await
    }

    /// `POST auth/signup`. Stores the returned token on success.
    ///
    /// # Errors
    ///
    /// Returns the server's `detail` on rejection, or [`BackendError::Timeout`].
    pub async fn sign_up(&self, request: &SignUpRequest) -> BackendResult<Session> {
        let url = self.url("auth/signup")?;
        let request = self
            .client
            .post(url)
            .json(request)
            .timeout(self.request_timeout);
        self.authenticate(request, "Sign up failed. Please try again.")
            .await
    }

    async fn authenticate(&self, request: RequestBuilder, default: &str) -> BackendResult<Session> {
        let response = request.send().await.map_err(send_error)?;
        if !response.status().is_success() {
            let err = Self::rejection(response, default).await;
            warn!(error = %err, "Authentication rejected");
            return Err(err);
        }
        let auth: AuthResponse = response.json().await.map_err(send_error)?;
        self.set_token(auth.token.clone());
        Ok(Session {
            user: auth.user,
            token: auth.token,
            refresh_token: None,
        })
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// `GET settings/{device_id}`; missing fields take their defaults.
    ///
    /// Signed out there is nothing to ask for, so the defaults come back
    /// without a request.
    ///
    /// # Errors
    ///
    /// Returns the server's `detail` on rejection, or [`BackendError::Timeout`].
    pub async fn fetch_settings(&self, device_id: &str) -> BackendResult<DeviceSettings> {
        let Some(token) = self.token() else {
            debug!(device_id, "No session token, using default settings");
            return Ok(DeviceSettings::default());
        };
        let url = self.url(&format!("settings/{device_id}"))?;
        let request = self
            .client
            .get(url)
            .bearer_auth(token)
            .timeout(self.request_timeout);
        let response = request.send().await.map_err(send_error)?;
        if !response.status().is_success() {
            return Err(Self::rejection(response, "Failed to load settings").await);
        }
        response.json().await.map_err(send_error)
    }

    /// `PUT settings/{device_id}/user` with `{key: value}`.
    ///
    /// Returns the server's updated settings when the response carries them.
    ///
    /// # Errors
    ///
    /// Returns the server's `detail` on rejection, or [`BackendError::Timeout`].
    pub async fn update_setting(
        &self,
        device_id: &str,
        key: SettingKey,
        value: bool,
    ) -> BackendResult<Option<DeviceSettings>> {
        let url = self.url(&format!("settings/{device_id}/user"))?;
        let mut body = serde_json::Map::new();
        body.insert(key.as_str().to_string(), Value::Bool(value));

        let request = self
            .authorized(self.client.put(url))
            .json(&body)
            .timeout(self.request_timeout);
        let response = request.send().await.map_err(send_error)?;
        if !response.status().is_success() {
            return Err(Self::rejection(response, "Failed to update setting").await);
        }
        let updated: UpdateSettingResponse = response.json().await.map_err(send_error)?;
        Ok(updated.settings)
    }
}

#[async_trait]
impl LockBackend for BackendClient {
    async fn fetch_status(&self, device_id: &str) -> BackendResult<LockState> {
        Self::fetch_status(self, device_id).await
    }

    async fn send_command(&self, device_id: &str, command: LockCommand) -> BackendResult<()> {
        Self::send_command(self, device_id, command).await
    }
}
