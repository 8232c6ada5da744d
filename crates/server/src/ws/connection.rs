// Per-connection driver: pumps frames between one websocket and its
// document session, runs the heartbeat and releases the connection on exit.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::session::{Attachment, SessionHub};

/// Why a connection driver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    TransportError,
    SendFailed,
    HeartbeatTimeout,
    LoadFailed,
    PendingOverflow,
}

impl CloseReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::TransportError => "transport_error",
            Self::SendFailed => "send_failed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::LoadFailed => "load_failed",
            Self::PendingOverflow => "pending_overflow",
        }
    }
}

/// Drive one collaboration connection for document `name` until it closes.
///
/// Binary frames received before the document is ready are queued and
/// replayed in arrival order once it is, followed by the sync handshake.
pub async fn run_connection<S, R, E>(
    hub: Arc<SessionHub>,
    name: String,
    mut sink: S,
    mut stream: R,
) -> CloseReason
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let Attachment { session, mut ready, connection, mut outbound } = hub.connect(&name).await;
    let max_pending = hub.config().max_pending_frames;
    let period = hub.config().heartbeat_interval;

    let mut pending: Option<Vec<Bytes>> = Some(Vec::new());
    let mut pong_received = true;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            loaded = ready.wait(), if pending.is_some() => {
                if let Err(error) = loaded {
                    warn!(doc = %name, connection, %error, "document unavailable, closing");
                    break CloseReason::LoadFailed;
                }
                let queued = pending.take().unwrap_or_default();
                if !queued.is_empty() {
                    debug!(doc = %name, connection, frames = queued.len(), "replaying frames");
                }
                for frame in queued {
                    let _ = session.handle_frame(connection, &frame).await;
                }
                if session.send_handshake(connection).await.is_err() {
                    break CloseReason::SendFailed;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(payload))) => match pending.as_mut() {
                        Some(queue) if queue.len() >= max_pending => {
                            warn!(
                                doc = %name,
                                connection,
                                limit = max_pending,
                                "too many frames queued while loading"
                            );
                            break CloseReason::PendingOverflow;
                        }
                        Some(queue) => queue.push(payload),
                        None => {
                            let _ = session.handle_frame(connection, &payload).await;
                        }
                    },
                    Some(Ok(Message::Pong(_))) => pong_received = true,
                    Some(Ok(Message::Ping(_) | Message::Text(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
                    Some(Err(error)) => {
                        debug!(doc = %name, connection, %error, "websocket transport error");
                        break CloseReason::TransportError;
                    }
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break CloseReason::PeerClosed;
                };
                let message = Message::Binary(frame.into());
                if let Err(error) = send_within(&mut sink, message, period).await {
                    debug!(doc = %name, connection, %error, "websocket send failed");
                    break CloseReason::SendFailed;
                }
            }
            _ = heartbeat.tick() => {
                if !pong_received {
                    break CloseReason::HeartbeatTimeout;
                }
                pong_received = false;
                let ping = Message::Ping(Bytes::new());
                if let Err(error) = send_within(&mut sink, ping, period).await {
                    debug!(doc = %name, connection, %error, "websocket ping failed");
                    break CloseReason::SendFailed;
                }
            }
        }
    };

    hub.release(&session, connection).await;
    let _ = send_within(&mut sink, Message::Close(None), period).await;
    info!(doc = %name, connection, reason = reason.as_str(), "connection closed");
    reason
}

/// Send one message, giving up after `limit`. A peer whose transport stops
/// accepting writes is treated like one that stopped answering pings.
async fn send_within<S>(sink: &mut S, message: Message, limit: Duration) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(error.to_string()),
        Err(_) => Err(format!("send stalled for {}ms", limit.as_millis())),
    }
}
