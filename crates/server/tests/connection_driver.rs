mod support;

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::Message;
use docsync_common::protocol::InboundFrame;
use docsync_server::config::SessionConfig;
use docsync_server::persistence::MemoryDocStore;
use docsync_server::session::SessionHub;
use docsync_server::ws::{run_connection, CloseReason};
use futures::channel::mpsc;
use futures::{Sink, StreamExt};
use support::{settle, text_of_state, Client, GatedStore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use yrs::sync::SyncMessage;

type Inbound = mpsc::UnboundedSender<Result<Message, Infallible>>;
type Outbound = mpsc::UnboundedReceiver<Message>;

/// Spawn a driver over in-memory channels. Returns the client's ends.
fn spawn_driver(hub: Arc<SessionHub>, name: &str) -> (Inbound, Outbound, JoinHandle<CloseReason>) {
    let (client_tx, server_rx) = mpsc::unbounded();
    let (server_tx, client_rx) = mpsc::unbounded();
    let handle = tokio::spawn(run_connection(hub, name.to_string(), server_tx, server_rx));
    (client_tx, client_rx, handle)
}

fn send_binary(inbound: &Inbound, frame: Vec<u8>) {
    inbound.unbounded_send(Ok(Message::Binary(frame.into()))).expect("driver should be reading");
}

fn decode(message: &Message) -> Option<InboundFrame> {
    match message {
        Message::Binary(payload) => Some(InboundFrame::decode(payload).expect("frame decodes")),
        _ => None,
    }
}

// ── Heartbeat ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unanswered_ping_closes_connection_and_releases_it() {
    let hub = Arc::new(SessionHub::new(Arc::new(MemoryDocStore::new()), SessionConfig::default()));
    let started = Instant::now();
    let (_inbound, mut outbound, handle) = spawn_driver(Arc::clone(&hub), "hb");

    let reason = handle.await.expect("driver should finish");

    assert_eq!(reason, CloseReason::HeartbeatTimeout);
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(hub.session("hb").await.is_none());
    assert_eq!(hub.active_sessions().await, 0);

    let mut messages = Vec::new();
    while let Ok(Some(message)) = outbound.try_next() {
        messages.push(message);
    }
    assert!(matches!(
        decode(&messages[0]),
        Some(InboundFrame::Sync(SyncMessage::SyncStep1(_)))
    ));
    assert_eq!(messages.iter().filter(|m| matches!(m, Message::Ping(_))).count(), 1);
    assert!(matches!(messages.last(), Some(Message::Close(None))));
}

#[tokio::test(start_paused = true)]
async fn answered_pings_keep_connection_open() {
    let hub = Arc::new(SessionHub::new(Arc::new(MemoryDocStore::new()), SessionConfig::default()));
    let (inbound, mut outbound, handle) = spawn_driver(Arc::clone(&hub), "hb");

    let responder = {
        let inbound = inbound.clone();
        tokio::spawn(async move {
            let mut pings = 0;
            while let Some(message) = outbound.next().await {
                if let Message::Ping(payload) = message {
                    pings += 1;
                    let _ = inbound.unbounded_send(Ok(Message::Pong(payload)));
                }
            }
            pings
        })
    };

    tokio::time::sleep(Duration::from_secs(155)).await;
    assert!(!handle.is_finished());
    assert_eq!(hub.session("hb").await.expect("still live").connection_count().await, 1);

    inbound.unbounded_send(Ok(Message::Close(None))).expect("driver should be reading");
    assert_eq!(handle.await.expect("driver should finish"), CloseReason::PeerClosed);
    drop(inbound);
    assert_eq!(responder.await.expect("responder should finish"), 5);
}

// ── Stalled transport ──────────────────────────────────────────────

/// A half-open peer: the transport never accepts another write.
struct StalledSink;

impl Sink<Message> for StalledSink {
    type Error = Infallible;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Infallible> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Pending
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_writes_close_connection_and_drain_session() {
    let store = Arc::new(MemoryDocStore::new());
    let hub = Arc::new(SessionHub::new(store.clone(), SessionConfig::default()));
    let (_inbound, server_rx) = mpsc::unbounded::<Result<Message, Infallible>>();
    let started = Instant::now();

    let handle =
        tokio::spawn(run_connection(Arc::clone(&hub), "stuck".to_string(), StalledSink, server_rx));
    let reason = tokio::time::timeout(Duration::from_secs(600), handle)
        .await
        .expect("driver must give up on a stalled transport")
        .expect("driver should finish");

    assert_eq!(reason, CloseReason::SendFailed);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(hub.session("stuck").await.is_none());
    assert_eq!(hub.draining_sessions().await, 0);
    assert_eq!(store.store_count("stuck"), 1, "release flushes the session");
}

// ── Load race ──────────────────────────────────────────────────────

#[tokio::test]
async fn frames_sent_while_loading_are_applied_in_order() {
    let store = GatedStore::open();
    store.set_loads_open(false);
    let hub = Arc::new(SessionHub::new(store.clone(), SessionConfig::default()));
    let (inbound, mut outbound, handle) = spawn_driver(Arc::clone(&hub), "race");

    let client = Client::new(9);
    for content in ["a", "b", "c"] {
        send_binary(&inbound, client.push_frame(content));
    }
    settle().await;

    let session = hub.session("race").await.expect("session is live while loading");
    assert_eq!(text_of_state(&session.encode_state().await), "");

    store.set_loads_open(true);
    let mut frames = Vec::new();
    while frames.len() < 4 {
        let message = outbound.next().await.expect("driver keeps sending");
        frames.extend(decode(&message));
    }

    assert_eq!(text_of_state(&session.encode_state().await), "abc");
    assert!(frames[..3]
        .iter()
        .all(|frame| matches!(frame, InboundFrame::Sync(SyncMessage::Update(_)))));
    assert!(matches!(frames[3], InboundFrame::Sync(SyncMessage::SyncStep1(_))));

    drop(inbound);
    assert_eq!(handle.await.expect("driver should finish"), CloseReason::PeerClosed);
    assert_eq!(text_of_state(&store.inner.get("race").expect("flushed on drain")), "abc");
}

#[tokio::test]
async fn queue_overflow_while_loading_closes_only_that_connection() {
    let store = GatedStore::open();
    store.set_loads_open(false);
    let config = SessionConfig { max_pending_frames: 2, ..SessionConfig::default() };
    let hub = Arc::new(SessionHub::new(store.clone(), config));

    let (calm, _calm_out, calm_handle) = spawn_driver(Arc::clone(&hub), "busy");
    let (noisy, _noisy_out, noisy_handle) = spawn_driver(Arc::clone(&hub), "busy");
    let client = Client::new(3);
    send_binary(&calm, client.push_frame("1"));
    for content in ["a", "b", "c"] {
        send_binary(&noisy, client.push_frame(content));
    }
    settle().await;

    store.set_loads_open(true);
    assert_eq!(noisy_handle.await.expect("driver should finish"), CloseReason::PendingOverflow);

    settle().await;
    assert!(!calm_handle.is_finished());
    let session = hub.session("busy").await.expect("calm connection keeps session live");
    assert_eq!(session.connection_count().await, 1);

    drop(calm);
    assert_eq!(calm_handle.await.expect("driver should finish"), CloseReason::PeerClosed);
}

#[tokio::test]
async fn load_failure_closes_connection() {
    let store = GatedStore::open();
    store.set_fail_loads(true);
    let hub = Arc::new(SessionHub::new(store, SessionConfig::default()));
    let (_inbound, mut outbound, handle) = spawn_driver(Arc::clone(&hub), "broken");

    assert_eq!(handle.await.expect("driver should finish"), CloseReason::LoadFailed);
    assert!(matches!(outbound.next().await, Some(Message::Close(None))));
}
