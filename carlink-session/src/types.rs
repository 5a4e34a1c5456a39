//! Public types for the carlink-session crate.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use carlink_proto::PushEvent;
use tokio_tungstenite::tungstenite;

/// Access/refresh token pair. Empty strings mean unauthenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_empty() && self.refresh_token.is_empty()
    }
}

/// Callback invoked whenever stored credentials change, so the host can
/// persist them (e.g. under `auth.access_token` / `auth.refresh_token`).
pub type PersistFn = Box<dyn Fn(&Credentials) + Send + Sync>;

/// Callback invoked once the one-time login code has been spent (success or
/// failure) so the host can discard it.
pub type CodeUsedFn = Box<dyn Fn() + Send + Sync>;

/// Holds the current credentials. Written only by the token manager; read by
/// the connection at connect time via [`snapshot`](TokenStore::snapshot),
/// which always yields a consistent pair.
pub struct TokenStore {
    current: Mutex<Credentials>,
    persist: Option<PersistFn>,
}

impl TokenStore {
    pub fn new(initial: Credentials) -> Self {
        Self {
            current: Mutex::new(initial),
            persist: None,
        }
    }

    pub fn with_persist(initial: Credentials, persist: PersistFn) -> Self {
        Self {
            current: Mutex::new(initial),
            persist: Some(persist),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Credentials> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consistent copy of the current pair.
    pub fn snapshot(&self) -> Credentials {
        self.lock().clone()
    }

    pub fn set(&self, credentials: Credentials) {
        *self.lock() = credentials.clone();
        if let Some(persist) = &self.persist {
            persist(&credentials);
        }
    }

    /// Drop both tokens, e.g. after a terminal refresh rejection.
    pub fn clear(&self) {
        self.set(Credentials::default());
    }
}

/// Per-install identifiers sent as headers on every identity and backend call.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub device_id: String,
    pub session_id: String,
    pub tracking_id: String,
}

impl ClientIdentity {
    pub fn generate() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            tracking_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self::generate()
    }
}

/// Identity-provider endpoints and login inputs.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// OAuth token endpoint (password and refresh-token grants).
    pub token_url: String,
    /// Endpoint that mails a fresh one-time login code to the account.
    pub code_request_url: String,
    pub email: String,
    pub country_code: String,
    pub locale: String,
    /// One-time code received via mail. Spent on the first login attempt.
    pub login_code: Option<String>,
}

/// Timer intervals for the session. Defaults match production behavior;
/// tests override them to run in milliseconds.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Timeout for the initial/reconnect WebSocket handshake and HTTP calls.
    pub connect_timeout: Duration,
    /// Connection is considered dead after this much inbound silence.
    pub heartbeat_timeout: Duration,
    /// Delay before reconnecting after a heartbeat timeout or forced teardown.
    pub reconnect_delay: Duration,
    /// Delay before reconnecting after a frame decode failure.
    pub decode_reconnect_delay: Duration,
    /// Interval between supervised reconnect attempts while not connected.
    pub supervisor_interval: Duration,
    /// Interval between silent token refreshes.
    pub refresh_interval: Duration,
    /// Delay before retrying a failed token refresh.
    pub refresh_retry_delay: Duration,
    pub event_channel_capacity: usize,
    pub command_channel_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(2),
            decode_reconnect_delay: Duration::from_secs(5),
            supervisor_interval: Duration::from_secs(5 * 60),
            refresh_interval: Duration::from_secs(30 * 60),
            refresh_retry_delay: Duration::from_secs(5 * 60),
            event_channel_capacity: 64,
            command_channel_capacity: 16,
        }
    }
}

/// Configuration for [`connect`](crate::connect).
pub struct SessionConfig {
    pub auth: AuthConfig,
    /// Stored credentials plus persistence hook.
    pub tokens: TokenStore,
    /// WebSocket endpoint of the push backend.
    pub ws_url: String,
    pub identity: ClientIdentity,
    pub timing: TimingConfig,
    /// Invoked when the one-time login code has been spent.
    pub on_code_used: Option<CodeUsedFn>,
}

impl SessionConfig {
    pub fn new(auth: AuthConfig, tokens: TokenStore, ws_url: impl Into<String>) -> Self {
        Self {
            auth,
            tokens,
            ws_url: ws_url.into(),
            identity: ClientIdentity::generate(),
            timing: TimingConfig::default(),
            on_code_used: None,
        }
    }
}

/// Events emitted by a [`Session`](crate::Session).
#[derive(Debug)]
pub enum SessionEvent {
    /// Connected (or reconnected) to the push backend.
    Connected,
    /// Temporarily disconnected; the session reconnects on its own.
    Disconnected { reason: Option<String> },
    /// The refresh token was invalidated. Credentials are cleared and the
    /// session has stopped; a full re-login is required.
    AuthExpired,
    /// A decoded inbound event. Its acknowledgment has already been sent.
    Push(PushEvent),
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] carlink_proto::ProtocolError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no usable credentials; a fresh one-time login code is required")]
    CodeRequired,

    #[error("refresh token invalidated; full re-login required")]
    AuthExpired,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("session closed")]
    Closed,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
