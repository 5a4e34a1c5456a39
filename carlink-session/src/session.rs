//! Public entry point: [`connect`], [`Session`], [`CommandSender`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use carlink_proto::ClientMessage;

use crate::auth::TokenManager;
use crate::connection::{EventLoopState, Outbound, open_socket, run_event_loop};
use crate::types::{Error, SessionConfig, SessionEvent};

/// Handle to a running session.
///
/// Call [`next`](Session::next) to receive events, [`sender`](Session::sender)
/// for an outbound command handle, or [`close`](Session::close) to shut the
/// connection down.
pub struct Session {
    events: mpsc::Receiver<SessionEvent>,
    commands: mpsc::Sender<Outbound>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl Session {
    /// Receive the next event. Returns `None` once the background task has
    /// exited (close requested or terminal authentication failure).
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Clonable handle for sending outbound envelopes.
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            tx: self.commands.clone(),
        }
    }

    /// Close the connection. Timers are dropped and the socket is closed;
    /// in-flight commands are not drained.
    pub fn close(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Sends envelopes over the live connection. Send failures are surfaced to
/// the caller and never retried internally.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Outbound>,
}

impl CommandSender {
    /// Serialize and write one envelope, waiting for the write result.
    pub async fn send(&self, message: ClientMessage) -> Result<(), Error> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Outbound {
                message,
                done: done_tx,
            })
            .await
            .map_err(|_| Error::Closed)?;
        done_rx.await.map_err(|_| Error::Closed)?
    }

    /// In-process pair for tests and hosts embedding the consumer side
    /// without a live backend: envelopes are reported as sent and handed to
    /// the returned receiver. Requires a Tokio runtime.
    pub fn loopback(capacity: usize) -> (Self, mpsc::Receiver<ClientMessage>) {
        let (tx, mut rx) = mpsc::channel::<Outbound>(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let _ = out.done.send(Ok(()));
                if out_tx.send(out.message).await.is_err() {
                    break;
                }
            }
        });
        (Self { tx }, out_rx)
    }
}

/// Establish a session with the push backend.
///
/// Performs the initial login (stored-token refresh, or one-time-code
/// exchange), opens the WebSocket with the resulting access token, and spawns
/// the background event loop that handles heartbeat monitoring, reconnection,
/// silent token refresh, and acknowledgment of sequenced frames.
pub async fn connect(config: SessionConfig) -> Result<Session, Error> {
    let SessionConfig {
        auth,
        tokens,
        ws_url,
        identity,
        timing,
        on_code_used,
    } = config;

    let http = reqwest::Client::builder()
        .timeout(timing.connect_timeout)
        .build()?;
    let store = Arc::new(tokens);
    let mut manager = TokenManager::new(http, auth, identity, store, on_code_used);
    manager.login().await?;

    let credentials = manager.store().snapshot();
    let (ws_write, ws_read) = tokio::time::timeout(
        timing.connect_timeout,
        open_socket(&ws_url, &credentials.access_token, manager.identity()),
    )
    .await
    .map_err(|_| Error::ConnectTimeout)??;

    let (event_tx, event_rx) = mpsc::channel(timing.event_channel_capacity);
    let (cmd_tx, cmd_rx) = mpsc::channel(timing.command_channel_capacity);
    let (close_tx, close_rx) = oneshot::channel();

    let _ = event_tx.send(SessionEvent::Connected).await;

    tokio::spawn(run_event_loop(
        EventLoopState {
            ws_read,
            ws_write,
            event_tx,
            cmd_rx,
            tokens: manager,
            ws_url,
            timing,
            commands_open: true,
        },
        close_rx,
    ));

    Ok(Session {
        events: event_rx,
        commands: cmd_tx,
        close_tx: Some(close_tx),
    })
}
