//! Session layer for the vehicle telemetry push backend.
//!
//! Maintains a live, authenticated WebSocket to the backend and exposes
//! decoded push events plus an outbound command channel.
//!
//! # Features
//! - Token lifecycle: one-time-code login, silent refresh on a fixed
//!   interval, forced refresh after transport auth failures
//! - Heartbeat-based liveness detection (any inbound frame counts)
//! - Supervised reconnection that never overlaps a prior attempt
//! - Exactly-once, in-order acknowledgment of sequenced inbound frames
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), carlink_session::Error> {
//! use carlink_session::{AuthConfig, Credentials, SessionConfig, SessionEvent, TokenStore, connect};
//!
//! let auth = AuthConfig {
//!     token_url: "https://id.example.com/token".into(),
//!     code_request_url: "https://api.example.com/v1/login".into(),
//!     email: "driver@example.com".into(),
//!     country_code: "DE".into(),
//!     locale: "de-DE".into(),
//!     login_code: None,
//! };
//! let tokens = TokenStore::new(Credentials::new("stored-access", "stored-refresh"));
//! let config = SessionConfig::new(auth, tokens, "wss://push.example.com/ws");
//!
//! let mut session = connect(config).await?;
//! while let Some(event) = session.next().await {
//!     match event {
//!         SessionEvent::Push(event) => println!("got: {event:?}"),
//!         SessionEvent::Connected => println!("connected"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod connection;
mod session;
mod types;

pub use auth::{AuthState, TokenManager};
pub use session::{CommandSender, Session, connect};
pub use types::{
    AuthConfig, ClientIdentity, CodeUsedFn, Credentials, Error, PersistFn, SessionConfig,
    SessionEvent, TimingConfig, TokenStore,
};
