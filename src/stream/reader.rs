//! Reading and tailing stream files.
//!
//! Readers must tolerate a file that grows underneath them and a final line
//! that has no terminating newline yet: such a line is deferred until the
//! writer completes it.

use super::event::{AsciicastHeader, StreamEvent};
use anyhow::{anyhow, Context, Result};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Screen-clear control sequences recognized by the snapshot optimization.
const CLEAR_SEQUENCES: [&str; 4] = ["\u{1b}[H\u{1b}[2J", "\u{1b}[2J", "\u{1b}[3J", "\u{1b}c"];

const HEADER_RETRY_STEP: Duration = Duration::from_millis(20);
const HEADER_RETRY_TOTAL: Duration = Duration::from_millis(500);

/// Poll interval used when the filesystem watcher misses (or lacks) events.
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reads the header line, retrying for up to ~500 ms while the writer is
/// still producing it.
pub async fn read_header(path: &Path) -> Result<AsciicastHeader> {
    let mut waited = Duration::ZERO;
    loop {
        if let Some(line) = first_complete_line(path).await? {
            let header: AsciicastHeader = serde_json::from_str(&line)
                .with_context(|| format!("bad stream header in {}", path.display()))?;
            return Ok(header);
        }
        if waited >= HEADER_RETRY_TOTAL {
            return Err(anyhow!("stream header not ready in {}", path.display()));
        }
        tokio::time::sleep(HEADER_RETRY_STEP).await;
        waited += HEADER_RETRY_STEP;
    }
}

async fn first_complete_line(path: &Path) -> Result<Option<String>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match bytes.iter().position(|&b| b == b'\n') {
        Some(end) => Ok(Some(String::from_utf8_lossy(&bytes[..end]).into_owned())),
        None => Ok(None),
    }
}

/// Parses every complete event line at or after `offset`.
///
/// Returns the events and the offset just past the last complete line; a
/// trailing partial line is left for the next call. Lines that are not event
/// arrays (the header, foreign markers) are skipped.
pub async fn read_events_from(path: &Path, offset: u64) -> Result<(Vec<StreamEvent>, u64)> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), offset)),
        Err(e) => return Err(e.into()),
    };
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    let complete = match buf.iter().rposition(|&b| b == b'\n') {
        Some(last_newline) => last_newline + 1,
        None => return Ok((Vec::new(), offset)),
    };

    let mut events = Vec::new();
    for line in buf[..complete].split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(line);
        match serde_json::from_str::<StreamEvent>(&text) {
            Ok(event) => events.push(event),
            Err(e) => trace!(error = %e, "skipping non-event line"),
        }
    }

    Ok((events, offset + complete as u64))
}

/// Follows a growing stream file.
///
/// Uses a filesystem watcher for low latency and a periodic poll so nothing
/// is missed when notifications are dropped or unsupported.
pub struct StreamTail {
    path: PathBuf,
    offset: u64,
    wakeups: mpsc::Receiver<()>,
    _watcher: Option<RecommendedWatcher>,
}

impl StreamTail {
    pub fn new(path: PathBuf) -> Self {
        let (tx, wakeups) = mpsc::channel(4);
        let watcher = match Self::watch(&path, tx) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file watcher unavailable, polling only");
                None
            }
        };
        Self {
            path,
            offset: 0,
            wakeups,
            _watcher: watcher,
        }
    }

    /// Resumes from a byte offset that lies on a line boundary.
    pub fn with_offset(path: PathBuf, offset: u64) -> Self {
        let mut tail = Self::new(path);
        tail.offset = offset;
        tail
    }

    fn watch(path: &Path, tx: mpsc::Sender<()>) -> notify::Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    // A full queue already guarantees a wakeup.
                    let _ = tx.try_send(());
                }
            },
            Config::default(),
        )?;
        // Watch the containing directory: the stream file may not exist for
        // the first poll tick, and some platforms drop watches on rename.
        let target = path.parent().unwrap_or(path);
        watcher.watch(target, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Waits for at least one new complete event and returns the batch.
    pub async fn next_batch(&mut self) -> Result<Vec<StreamEvent>> {
        loop {
            let (events, next_offset) = read_events_from(&self.path, self.offset).await?;
            self.offset = next_offset;
            if !events.is_empty() {
                return Ok(events);
            }
            tokio::select! {
                _ = self.wakeups.recv() => {}
                _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {}
            }
        }
    }
}

/// Reads the full recording, applying the clear-screen optimization: events
/// before the last screen-clearing output event are elided and the remaining
/// timestamps are rebased so the first event is at t=0.
pub async fn snapshot(path: &Path) -> Result<(AsciicastHeader, Vec<StreamEvent>)> {
    let header = read_header(path).await?;
    let (events, _) = read_events_from(path, 0).await?;

    let last_clear = events.iter().rposition(|event| match event {
        StreamEvent::Output { data, .. } => {
            CLEAR_SEQUENCES.iter().any(|seq| data.contains(seq))
        }
        _ => false,
    });

    let kept: Vec<StreamEvent> = match last_clear {
        Some(index) => {
            debug!(elided = index, "snapshot trimmed to last screen clear");
            let base = events[index].time();
            events[index..].iter().map(|e| e.rebased(base)).collect()
        }
        None => events,
    };

    Ok((header, kept))
}
