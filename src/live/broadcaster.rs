//! Live event fan-out
//!
//! One tailing reader per watched session feeds every subscriber's bounded
//! queue. A subscriber that cannot keep up is disconnected; the session and
//! the other subscribers are unaffected. When the session exits the fanout
//! drains the last complete lines, emits one exit record per subscriber and
//! tears itself down.

use crate::stream::{read_events_from, StreamEvent, StreamTail};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Bounded per-subscriber queue size.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Event(StreamEvent),
    Exit { code: Option<i32> },
}

enum FanoutMsg {
    Subscribe(mpsc::Sender<LiveEvent>),
    Exit(Option<i32>),
}

pub struct Broadcaster {
    fanouts: DashMap<String, mpsc::Sender<FanoutMsg>>,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fanouts: DashMap::new(),
        })
    }

    /// Registers a subscriber for a session's live events.
    ///
    /// `exit_code` carries the session's exit status when it has already
    /// ended; the subscriber then receives the recorded events followed by
    /// the exit record.
    pub async fn subscribe(
        self: &Arc<Self>,
        session_id: &str,
        stream_path: PathBuf,
        exit_code: Option<Option<i32>>,
    ) -> mpsc::Receiver<LiveEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        loop {
            let control = {
                let entry = self.fanouts.entry(session_id.to_string()).or_insert_with(|| {
                    spawn_fanout(
                        self.clone(),
                        session_id.to_string(),
                        stream_path.clone(),
                        exit_code,
                    )
                });
                entry.value().clone()
            };
            match control.send(FanoutMsg::Subscribe(tx.clone())).await {
                Ok(()) => return rx,
                Err(_) => {
                    // The fanout finished between lookup and send; forget the
                    // stale handle and start a fresh one.
                    self.fanouts
                        .remove_if(session_id, |_, sender| sender.same_channel(&control));
                }
            }
        }
    }

    /// Tells the session's fanout (if any) that the session ended.
    pub async fn notify_exit(&self, session_id: &str, code: Option<i32>) {
        let control = self.fanouts.get(session_id).map(|e| e.value().clone());
        if let Some(control) = control {
            let _ = control.send(FanoutMsg::Exit(code)).await;
        }
    }
}

fn spawn_fanout(
    broadcaster: Arc<Broadcaster>,
    session_id: String,
    stream_path: PathBuf,
    initial_exit: Option<Option<i32>>,
) -> mpsc::Sender<FanoutMsg> {
    let (control_tx, control_rx) = mpsc::channel(16);
    tokio::spawn(run_fanout(
        broadcaster,
        session_id,
        stream_path,
        control_rx,
        initial_exit,
    ));
    control_tx
}

async fn run_fanout(
    broadcaster: Arc<Broadcaster>,
    session_id: String,
    stream_path: PathBuf,
    mut control: mpsc::Receiver<FanoutMsg>,
    initial_exit: Option<Option<i32>>,
) {
    let mut subscribers: Vec<mpsc::Sender<LiveEvent>> = Vec::new();
    let mut tail = StreamTail::new(stream_path.clone());
    let mut exit: Option<Option<i32>> = initial_exit;

    debug!(session_id = %session_id, "fanout started");

    while exit.is_none() {
        tokio::select! {
            msg = control.recv() => match msg {
                Some(FanoutMsg::Subscribe(tx)) => subscribers.push(tx),
                Some(FanoutMsg::Exit(code)) => exit = Some(code),
                None => {
                    // Broadcaster dropped; nothing can reach us any more.
                    broadcaster.fanouts.remove(&session_id);
                    return;
                }
            },
            batch = tail.next_batch() => match batch {
                Ok(events) => {
                    for event in &events {
                        broadcast(&mut subscribers, event);
                    }
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "tail failed");
                    exit = Some(None);
                }
            },
        }
    }

    // Unregister before the final drain so new subscribers spin up a fresh
    // fanout instead of racing the teardown.
    broadcaster.fanouts.remove(&session_id);
    control.close();

    // Late subscribers whose registration was already queued.
    while let Some(msg) = control.recv().await {
        if let FanoutMsg::Subscribe(tx) = msg {
            subscribers.push(tx);
        }
    }

    // Everything the writer flushed before exiting.
    match read_events_from(&stream_path, tail.offset()).await {
        Ok((events, _)) => {
            for event in &events {
                broadcast(&mut subscribers, event);
            }
        }
        Err(e) => warn!(session_id = %session_id, error = %e, "final drain failed"),
    }

    let code = exit.flatten();
    for tx in &subscribers {
        let _ = tx.send(LiveEvent::Exit { code }).await;
    }
    debug!(session_id = %session_id, subscribers = subscribers.len(), "fanout finished");
}

/// Delivers one event to every subscriber, dropping the ones whose queue is
/// full or whose receiver is gone.
fn broadcast(subscribers: &mut Vec<mpsc::Sender<LiveEvent>>, event: &StreamEvent) {
    subscribers.retain(|tx| match tx.try_send(LiveEvent::Event(event.clone())) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("subscriber queue overflow, disconnecting");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            trace!("subscriber gone");
            false
        }
    });
}
