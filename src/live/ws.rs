//! `/buffers` WebSocket endpoint
//!
//! Text frames carry JSON control messages (ping/pong/subscribe/
//! unsubscribe); the server pushes binary buffer updates framed as
//!
//! ```text
//! 0xBF | sessionIdLen u32 LE | sessionId utf8 | payload
//! ```
//!
//! where the payload is a binary buffer snapshot. Protocol pings go out
//! every 54 s; a peer silent for 60 s is disconnected.

use crate::error::ApiError;
use crate::live::{Broadcaster, LiveEvent};
use crate::session::{self, SessionManager, SessionStatus};
use crate::term::BufferCache;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub const FRAME_MAGIC: u8 = 0xBF;

const PING_INTERVAL: Duration = Duration::from_secs(54);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const MAX_TEXT_FRAME: usize = 512 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
enum ClientMessage {
    Ping,
    Pong,
    Subscribe { session_id: String },
    Unsubscribe { session_id: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
enum ServerMessage {
    Ping,
    Pong,
    Error { message: String },
}

/// Prepends the 0xBF session-id frame header to a payload.
pub fn binary_frame(session_id: &str, payload: &[u8]) -> Vec<u8> {
    let id = session_id.as_bytes();
    let mut out = Vec::with_capacity(5 + id.len() + payload.len());
    out.push(FRAME_MAGIC);
    out.extend_from_slice(&(id.len() as u32).to_le_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(payload);
    out
}

pub async fn handle_socket(
    socket: WebSocket,
    manager: Arc<SessionManager>,
    broadcaster: Arc<Broadcaster>,
    buffers: Arc<BufferCache>,
) {
    let (mut sink, mut source) = socket.split();

    // All frames funnel through one writer task so subscription tasks and
    // the control loop never interleave partial writes.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match tokio::time::timeout(WRITE_DEADLINE, sink.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    trace!(error = %e, "buffer socket send failed");
                    break;
                }
                Err(_) => {
                    warn!("buffer socket write deadline exceeded");
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut subscriptions: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.reset();

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if out_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            frame = tokio::time::timeout(READ_DEADLINE, source.next()) => {
                let frame = match frame {
                    Err(_) => {
                        debug!("buffer socket read deadline exceeded");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        trace!(error = %e, "buffer socket receive error");
                        break;
                    }
                    Ok(Some(Ok(frame))) => frame,
                };
                match frame {
                    Message::Text(text) => {
                        if text.len() > MAX_TEXT_FRAME {
                            warn!(size = text.len(), "oversized buffer control frame");
                            break;
                        }
                        if !handle_text(
                            &text,
                            &manager,
                            &broadcaster,
                            &buffers,
                            &out_tx,
                            &mut subscriptions,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        if out_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) | Message::Binary(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    for (_, task) in subscriptions {
        task.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    debug!("buffer socket closed");
}

async fn handle_text(
    text: &str,
    manager: &Arc<SessionManager>,
    broadcaster: &Arc<Broadcaster>,
    buffers: &Arc<BufferCache>,
    out_tx: &mpsc::Sender<Message>,
    subscriptions: &mut HashMap<String, tokio::task::JoinHandle<()>>,
) -> bool {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            return send_json(
                out_tx,
                &ServerMessage::Error {
                    message: format!("bad message: {e}"),
                },
            )
            .await;
        }
    };

    match message {
        ClientMessage::Ping => send_json(out_tx, &ServerMessage::Pong).await,
        ClientMessage::Pong => true,
        ClientMessage::Unsubscribe { session_id } => {
            if let Some(task) = subscriptions.remove(&session_id) {
                task.abort();
            }
            true
        }
        ClientMessage::Subscribe { session_id } => {
            let entry = match manager.get(&session_id).await {
                Ok(entry) => entry,
                Err(ApiError::NotFound(_)) => {
                    return send_json(
                        out_tx,
                        &ServerMessage::Error {
                            message: format!("session not found: {session_id}"),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    return send_json(
                        out_tx,
                        &ServerMessage::Error {
                            message: e.to_string(),
                        },
                    )
                    .await;
                }
            };

            if subscriptions.contains_key(&session_id) {
                return true;
            }

            let exit_code = match entry.info.status {
                SessionStatus::Exited => Some(entry.info.exit_code),
                _ => None,
            };
            let session_dir = manager.session_dir(&session_id);
            let stream_path = session::stream_out_path(&session_dir);
            let events = broadcaster
                .subscribe(&session_id, stream_path, exit_code)
                .await;

            // Close the window where the session exits between the status
            // read and the subscription.
            if exit_code.is_none() {
                if let Ok(entry) = manager.get(&session_id).await {
                    if entry.info.status == SessionStatus::Exited {
                        broadcaster
                            .notify_exit(&session_id, entry.info.exit_code)
                            .await;
                    }
                }
            }

            let task = tokio::spawn(push_buffer_updates(
                session_id.clone(),
                session_dir,
                events,
                buffers.clone(),
                out_tx.clone(),
            ));
            subscriptions.insert(session_id, task);
            true
        }
    }
}

/// Per-subscription pump: each batch of stream events invalidates the cached
/// snapshot, which is then re-sent as one framed binary update.
async fn push_buffer_updates(
    session_id: String,
    session_dir: std::path::PathBuf,
    mut events: mpsc::Receiver<LiveEvent>,
    buffers: Arc<BufferCache>,
    out_tx: mpsc::Sender<Message>,
) {
    // Initial state so the client renders without waiting for output.
    if !send_snapshot(&session_id, &session_dir, &buffers, &out_tx).await {
        return;
    }

    while let Some(event) = events.recv().await {
        let mut exited = matches!(event, LiveEvent::Exit { .. });
        // Coalesce whatever is already queued into a single update.
        while let Ok(more) = events.try_recv() {
            exited |= matches!(more, LiveEvent::Exit { .. });
        }
        if !send_snapshot(&session_id, &session_dir, &buffers, &out_tx).await {
            return;
        }
        if exited {
            break;
        }
    }
    debug!(session_id = %session_id, "buffer subscription ended");
}

async fn send_snapshot(
    session_id: &str,
    session_dir: &std::path::Path,
    buffers: &BufferCache,
    out_tx: &mpsc::Sender<Message>,
) -> bool {
    match buffers.snapshot(session_id, session_dir).await {
        Ok(snapshot) => {
            let frame = binary_frame(session_id, &snapshot.encode());
            out_tx.send(Message::Binary(frame)).await.is_ok()
        }
        Err(e) => {
            trace!(session_id, error = %e, "snapshot unavailable");
            true
        }
    }
}

async fn send_json(out_tx: &mpsc::Sender<Message>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => out_tx.send(Message::Text(json)).await.is_ok(),
        Err(_) => false,
    }
}
