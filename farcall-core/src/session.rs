//! Per-connection socket session.
//!
//! A session owns an upgraded WebSocket and a bounded outbound queue, and
//! runs two cooperating tasks: a read pump that decodes inbound envelopes and
//! routes their actions, and a write pump that drains the queue and keeps the
//! connection alive with pings. Either pump failing cancels the other;
//! teardown announces the departure to the hub exactly once.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Action, Codec};
use crate::context::{CallContext, ConnId, UserId};
use crate::hub::SessionHandle;
use crate::server::ServerInner;

pub(crate) const PONG_WAIT: Duration = Duration::from_secs(60);
pub(crate) const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);
pub(crate) const WRITE_WAIT: Duration = Duration::from_secs(10);
pub(crate) const OUTBOX_CAPACITY: usize = 256;

/// Run one session to completion. Spawned by the front door on upgrade.
pub(crate) async fn run(socket: WebSocket, server: Arc<ServerInner>, mut ctx: CallContext) {
    let conn = ConnId(server.next_conn_id());
    let user = ctx.get::<UserId>().unwrap_or_default();
    ctx.insert(conn);

    // The session derives its lifetime from the upgrading request's context.
    let halt = ctx.cancellation().child_token();
    ctx.set_cancellation(halt.clone());

    let (outbox, queue) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
    server
        .sessions
        .insert(conn.0, SessionHandle { outbox: outbox.clone(), user });

    let codec = server.config.codec;
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, queue, halt.clone()));

    server.hub.user_in(user, conn).await;
    send_start(codec, &outbox, conn).await;

    read_pump(stream, &server, &ctx, conn, &outbox, &halt).await;

    // Teardown, exactly once: presence out, full unsubscribe, deregister.
    server.hub.user_out(user, conn).await;
    server.hub.unsubscribe("", conn).await;
    server.sessions.remove(&conn.0);
    halt.cancel();
    drop(outbox);
    let _ = writer.await;
    tracing::debug!(conn = conn.0, "session closed");
}

async fn send_start(codec: Codec, outbox: &mpsc::Sender<Message>, conn: ConnId) {
    match codec::encode_envelope(codec, Action::Start, &conn.0) {
        Ok(bytes) => {
            let _ = outbox.send(codec::frame(codec, bytes)).await;
        }
        Err(err) => tracing::error!(error = %err, "cannot encode start frame"),
    }
}

// ── Read pump ───────────────────────────────────────────────────────────────

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    server: &Arc<ServerInner>,
    ctx: &CallContext,
    conn: ConnId,
    outbox: &mpsc::Sender<Message>,
    halt: &CancellationToken,
) {
    let codec = server.config.codec;
    loop {
        let frame = tokio::select! {
            _ = halt.cancelled() => break,
            frame = tokio::time::timeout(PONG_WAIT, stream.next()) => frame,
        };
        let message = match frame {
            // No traffic for a whole keep-alive window: the peer is gone.
            Err(_) => {
                tracing::debug!(conn = conn.0, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                tracing::warn!(conn = conn.0, error = %err, "websocket read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let data = match message {
            Message::Text(text) => normalize_text(text.as_str()).into_bytes(),
            Message::Binary(bytes) => bytes.to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        // Frames are processed concurrently; a slow batch does not stall
        // subscribe traffic behind it.
        let server = Arc::clone(server);
        let ctx = ctx.clone();
        let outbox = outbox.clone();
        tokio::spawn(async move {
            process_frame(server, ctx, conn, outbox, codec, data).await;
        });
    }
}

/// Browser clients pretty-print occasionally; fold newlines before decoding.
fn normalize_text(text: &str) -> String {
    text.replace('\n', " ").trim().to_owned()
}

async fn process_frame(
    server: Arc<ServerInner>,
    ctx: CallContext,
    conn: ConnId,
    outbox: mpsc::Sender<Message>,
    codec: Codec,
    data: Vec<u8>,
) {
    let envelope = match codec::decode_envelope(codec, &data) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::error!(conn = conn.0, error = %err, "invalid socket message");
            return;
        }
    };

    match envelope.action {
        Action::Subscribe => server.hub.subscribe(envelope.name, conn).await,
        Action::Unsubscribe => server.hub.unsubscribe(envelope.name, conn).await,
        Action::Call => {
            let Some(body) = envelope.body else {
                tracing::error!(conn = conn.0, "call frame without a body");
                return;
            };
            // Every call frame gets a result frame, even when the batch was
            // empty or failed to decode (an empty response list).
            let responses = server.process_raw(body, ctx).await;
            match codec::encode_envelope(codec, Action::Result, &responses) {
                Ok(bytes) => {
                    let _ = outbox.send(codec::frame(codec, bytes)).await;
                }
                Err(err) => {
                    tracing::error!(conn = conn.0, error = %err, "cannot encode result frame");
                }
            }
        }
        other => tracing::debug!(conn = conn.0, action = ?other, "ignoring inbound action"),
    }
}

// ── Write pump ──────────────────────────────────────────────────────────────

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Message>,
    halt: CancellationToken,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.reset();

    loop {
        tokio::select! {
            _ = halt.cancelled() => break,
            queued = queue.recv() => match queued {
                Some(frame) => {
                    if write_frame(&mut sink, frame).await.is_err() {
                        halt.cancel();
                        break;
                    }
                    // Drain whatever queued up meanwhile, one frame per
                    // websocket message.
                    let mut failed = false;
                    while let Ok(frame) = queue.try_recv() {
                        if write_frame(&mut sink, frame).await.is_err() {
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        halt.cancel();
                        break;
                    }
                }
                None => {
                    // The queue closed underneath us: say goodbye.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if write_frame(&mut sink, Message::Ping(Bytes::new())).await.is_err() {
                    halt.cancel();
                    break;
                }
            }
        }
    }
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: Message,
) -> Result<(), axum::Error> {
    match tokio::time::timeout(WRITE_WAIT, sink.send(frame)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline expired",
        ))),
    }
}
