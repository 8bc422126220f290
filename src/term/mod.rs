//! Terminal emulation and buffer snapshots
//!
//! Replays a session's output stream into a grid and serializes the result.
//! Snapshots are computed on demand from the stream file; nothing here sits
//! on the write path.

mod buffer;
mod emulator;
mod snapshot;

pub use buffer::{default_style, Cell, ModeFlags, Style, TerminalBuffer};
pub use emulator::Emulator;
pub use snapshot::{BufferSnapshot, BufferStats, SNAPSHOT_VERSION};

use crate::session;
use anyhow::Result;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

/// Replays a stream file into a snapshot.
///
/// The full recording is replayed unmodified: the clear-screen elision used
/// by the JSON snapshot endpoint would drop resize events that still govern
/// the grid's dimensions.
pub async fn snapshot_from_stream(path: &Path) -> Result<BufferSnapshot> {
    let header = crate::stream::read_header(path).await?;
    let (events, _) = crate::stream::read_events_from(path, 0).await?;
    let emulator = Emulator::replay(&header, &events);
    Ok(BufferSnapshot::from(&emulator.buffer))
}

/// Per-session snapshot cache keyed by stream file length, so an unchanged
/// file is never re-replayed.
#[derive(Default)]
pub struct BufferCache {
    entries: DashMap<String, (u64, Arc<BufferSnapshot>)>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(
        &self,
        session_id: &str,
        session_dir: &Path,
    ) -> Result<Arc<BufferSnapshot>> {
        let stream_path = session::stream_out_path(session_dir);
        let len = tokio::fs::metadata(&stream_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        if let Some(entry) = self.entries.get(session_id) {
            let (cached_len, snapshot) = entry.value();
            if *cached_len == len {
                return Ok(snapshot.clone());
            }
        }

        let snapshot = Arc::new(snapshot_from_stream(&stream_path).await?);
        self.entries
            .insert(session_id.to_string(), (len, snapshot.clone()));
        Ok(snapshot)
    }

    pub fn evict(&self, session_id: &str) {
        self.entries.remove(session_id);
    }
}
