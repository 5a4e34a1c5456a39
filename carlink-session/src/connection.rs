//! Streaming-connection management: event loop, heartbeat, reconnection, and
//! re-authentication.
//!
//! One background task owns the socket and every timer. Liveness is inferred
//! from *any* inbound traffic (the backend sends no dedicated ping): each
//! frame rearms the heartbeat deadline, and a deadline lapse tears the
//! connection down. Reconnect attempts never overlap: the single task
//! supersedes a prior attempt before arming a new one.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};

use carlink_proto::{ClientMessage, ack_for, decode_push, encode_client};

use crate::auth::TokenManager;
use crate::types::{ClientIdentity, Error, SessionEvent, TimingConfig};

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) type WsRead = futures_util::stream::SplitStream<WsStream>;
pub(crate) type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

/// An outbound envelope plus a completion slot surfacing the send result.
pub(crate) struct Outbound {
    pub message: ClientMessage,
    pub done: oneshot::Sender<Result<(), Error>>,
}

// ---------------------------------------------------------------------------
// Connecting
// ---------------------------------------------------------------------------

/// Open the WebSocket with the current access token in the handshake headers.
/// The connection authenticates only here, never per-message.
pub(crate) async fn open_socket(
    ws_url: &str,
    access_token: &str,
    identity: &ClientIdentity,
) -> Result<(WsWrite, WsRead), Error> {
    let mut request = ws_url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(access_token)
            .map_err(|_| Error::Auth("access token is not a valid header value".into()))?,
    );
    headers.insert(
        "X-SessionId",
        HeaderValue::from_str(&identity.session_id)
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert(
        "X-TrackingId",
        HeaderValue::from_str(&identity.tracking_id)
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    let (ws, _resp) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws.split())
}

/// True when the transport reported an authentication rejection (handshake
/// answered with a 401/403 instead of an upgrade).
fn is_auth_error(e: &tungstenite::Error) -> bool {
    matches!(
        e,
        tungstenite::Error::Http(resp)
            if resp.status() == StatusCode::FORBIDDEN || resp.status() == StatusCode::UNAUTHORIZED
    )
}

// ---------------------------------------------------------------------------
// Background event loop
// ---------------------------------------------------------------------------

pub(crate) struct EventLoopState {
    pub ws_read: WsRead,
    pub ws_write: WsWrite,
    pub event_tx: mpsc::Sender<SessionEvent>,
    pub cmd_rx: mpsc::Receiver<Outbound>,
    pub tokens: TokenManager,
    pub ws_url: String,
    pub timing: TimingConfig,
    pub commands_open: bool,
}

/// Why the connected phase ended.
enum PhaseExit {
    /// Tear down and reconnect after the given delay.
    Reconnect {
        delay: Duration,
        reason: Option<String>,
    },
    /// Terminal authentication failure: credentials cleared, loop must stop.
    Terminal,
    /// Close requested or consumer gone.
    Stop,
}

pub(crate) async fn run_event_loop(mut p: EventLoopState, mut close_rx: oneshot::Receiver<()>) {
    let mut next_refresh_at = Instant::now() + p.timing.refresh_interval;

    'outer: loop {
        let mut delay = match connected_phase(&mut p, &mut close_rx, &mut next_refresh_at).await {
            PhaseExit::Stop => return,
            PhaseExit::Terminal => {
                let _ = p.event_tx.send(SessionEvent::AuthExpired).await;
                return;
            }
            PhaseExit::Reconnect { delay, reason } => {
                let _ = p.event_tx.send(SessionEvent::Disconnected { reason }).await;
                delay
            }
        };

        // Supervised reconnect: one attempt at a time, a failed attempt is
        // retried on the supervisor interval until the socket is open again.
        loop {
            if !sleep_or_close(delay, &mut close_rx).await {
                return;
            }
            match try_connect(&mut p).await {
                Ok(()) => {
                    let _ = p.event_tx.send(SessionEvent::Connected).await;
                    continue 'outer;
                }
                Err(Error::AuthExpired) => {
                    let _ = p.event_tx.send(SessionEvent::AuthExpired).await;
                    return;
                }
                Err(Error::Auth(reason)) => {
                    // Credentials were refreshed after a handshake rejection;
                    // retry promptly with the new token.
                    tracing::warn!("reconnect attempt rejected: {reason}");
                    delay = p.timing.reconnect_delay;
                }
                Err(e) => {
                    tracing::warn!("reconnect attempt failed: {e}");
                    delay = p.timing.supervisor_interval;
                }
            }
        }
    }
}

async fn connected_phase(
    p: &mut EventLoopState,
    close_rx: &mut oneshot::Receiver<()>,
    next_refresh_at: &mut Instant,
) -> PhaseExit {
    let mut last_frame_at = Instant::now();

    loop {
        let heartbeat_deadline = last_frame_at + p.timing.heartbeat_timeout;

        tokio::select! {
            frame = p.ws_read.next() => match frame {
                Some(Ok(msg)) => {
                    last_frame_at = Instant::now();
                    let tungstenite::Message::Binary(data) = msg else {
                        // Text/ping/pong frames count as liveness but carry no events.
                        continue;
                    };
                    match decode_push(&data) {
                        Ok(event) => {
                            // Acknowledge before handing the event downstream:
                            // exactly once per sequence number, in receipt
                            // order, regardless of consumer outcome.
                            if let Some(ack) = ack_for(&event) {
                                if let Err(e) = send_client(&mut p.ws_write, &ack).await {
                                    tracing::warn!("acknowledgment send failed: {e}");
                                    return PhaseExit::Reconnect {
                                        delay: p.timing.reconnect_delay,
                                        reason: Some("acknowledgment send failed".into()),
                                    };
                                }
                            }
                            if p.event_tx.send(SessionEvent::Push(event)).await.is_err() {
                                tracing::info!("event consumer gone, stopping");
                                return PhaseExit::Stop;
                            }
                        }
                        Err(e) => {
                            // The wire format has no resynchronization marker,
                            // so a malformed frame is connection-fatal.
                            tracing::warn!("failed to decode inbound frame: {e}");
                            return PhaseExit::Reconnect {
                                delay: p.timing.decode_reconnect_delay,
                                reason: Some("frame decode failure".into()),
                            };
                        }
                    }
                }
                Some(Err(e)) => {
                    if is_auth_error(&e) {
                        tracing::warn!("transport rejected credentials, forcing token refresh");
                        return refresh_then_reconnect(p).await;
                    }
                    tracing::warn!("WebSocket error: {e}");
                    return PhaseExit::Reconnect {
                        delay: p.timing.reconnect_delay,
                        reason: Some(e.to_string()),
                    };
                }
                None => {
                    tracing::info!("WebSocket stream ended");
                    return PhaseExit::Reconnect {
                        delay: p.timing.reconnect_delay,
                        reason: None,
                    };
                }
            },

            _ = tokio::time::sleep_until(heartbeat_deadline) => {
                tracing::warn!("no inbound traffic within heartbeat deadline, closing connection");
                return PhaseExit::Reconnect {
                    delay: p.timing.reconnect_delay,
                    reason: Some("heartbeat timeout".into()),
                };
            }

            _ = tokio::time::sleep_until(*next_refresh_at) => {
                match p.tokens.refresh().await {
                    Ok(()) => {
                        *next_refresh_at = Instant::now() + p.timing.refresh_interval;
                        // The socket authenticated with the old token at
                        // handshake time; rotate it by reconnecting.
                        tracing::debug!("scheduled refresh complete, reconnecting with new token");
                        return PhaseExit::Reconnect {
                            delay: p.timing.reconnect_delay,
                            reason: Some("credentials rotated".into()),
                        };
                    }
                    Err(Error::AuthExpired) => return PhaseExit::Terminal,
                    Err(e) => {
                        tracing::warn!("scheduled token refresh failed, retrying later: {e}");
                        *next_refresh_at = Instant::now() + p.timing.refresh_retry_delay;
                    }
                }
            }

            cmd = p.cmd_rx.recv(), if p.commands_open => match cmd {
                Some(out) => {
                    let result = send_client(&mut p.ws_write, &out.message).await;
                    if let Err(ref e) = result {
                        tracing::warn!("outbound send failed: {e}");
                    }
                    let _ = out.done.send(result);
                }
                None => p.commands_open = false,
            },

            _ = &mut *close_rx => {
                tracing::info!("close requested");
                let _ = p.ws_write.close().await;
                return PhaseExit::Stop;
            }
        }
    }
}

/// Forced refresh after the transport flagged an authentication failure.
async fn refresh_then_reconnect(p: &mut EventLoopState) -> PhaseExit {
    match p.tokens.refresh().await {
        Ok(()) => PhaseExit::Reconnect {
            delay: p.timing.reconnect_delay,
            reason: Some("credentials refreshed".into()),
        },
        Err(Error::AuthExpired) => PhaseExit::Terminal,
        Err(e) => PhaseExit::Reconnect {
            delay: p.timing.supervisor_interval,
            reason: Some(format!("token refresh failed: {e}")),
        },
    }
}

/// One supervised connect attempt using the current credentials snapshot.
async fn try_connect(p: &mut EventLoopState) -> Result<(), Error> {
    let credentials = p.tokens.store().snapshot();
    let connect = open_socket(&p.ws_url, &credentials.access_token, p.tokens.identity());
    match tokio::time::timeout(p.timing.connect_timeout, connect).await {
        Ok(Ok((ws_write, ws_read))) => {
            p.ws_write = ws_write;
            p.ws_read = ws_read;
            Ok(())
        }
        Ok(Err(e)) => {
            if let Error::WebSocket(ref we) = e
                && is_auth_error(we)
            {
                tracing::warn!("handshake rejected credentials, forcing token refresh");
                p.tokens.refresh().await?;
                return Err(Error::Auth("handshake rejected stale credentials".into()));
            }
            Err(e)
        }
        Err(_) => Err(Error::ConnectTimeout),
    }
}

async fn send_client(ws_write: &mut WsWrite, msg: &ClientMessage) -> Result<(), Error> {
    let data = encode_client(msg)?;
    ws_write
        .send(tungstenite::Message::Binary(data.into()))
        .await?;
    Ok(())
}

/// Sleep for `delay`; false when close was requested meanwhile.
async fn sleep_or_close(delay: Duration, close_rx: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = close_rx => {
            tracing::info!("close requested during reconnect");
            false
        }
    }
}
