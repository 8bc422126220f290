//! Session lifecycle orchestration
//!
//! Owns the set of live sessions: creation (directory + metadata + PTY +
//! stream writers + pump tasks), input/resize delegation, kill semantics,
//! disk reconciliation for `list`, and cleanup. Mutating operations on one
//! session are serialized by a per-session lock; cross-session scans touch
//! only the disk and never hold a session lock across blocking I/O.

use super::info::{
    self, SessionInfo, SessionListEntry, SessionStatus, INFO_FILE,
};
use crate::config::expand_tilde;
use crate::error::{ApiError, ApiResult};
use crate::live::Broadcaster;
use crate::pty::{pid_alive, PtyProcess, PtySpawnConfig, DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM};
use crate::stream::StreamWriter;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Window after which a session that produced no output yet is still
/// considered running.
const READY_WINDOW: std::time::Duration = std::time::Duration::from_millis(500);

/// Request to create a session.
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub command: Vec<String>,
    pub working_dir: String,
    pub name: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub term: Option<String>,
}

/// A session whose PTY lives in this process.
pub struct LiveSession {
    pub id: String,
    pub dir: PathBuf,
    pty: Arc<PtyProcess>,
    info: Mutex<SessionInfo>,
    out_writer: Arc<StdMutex<StreamWriter>>,
    in_writer: Mutex<StreamWriter>,
    op_lock: Mutex<()>,
}

impl LiveSession {
    pub async fn info(&self) -> SessionInfo {
        self.info.lock().await.clone()
    }
}

pub struct SessionManager {
    control_path: PathBuf,
    broadcaster: Arc<Broadcaster>,
    live: RwLock<HashMap<String, Arc<LiveSession>>>,
}

impl SessionManager {
    pub fn new(control_path: PathBuf, broadcaster: Arc<Broadcaster>) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&control_path)?;
        Ok(Arc::new(Self {
            control_path,
            broadcaster,
            live: RwLock::new(HashMap::new()),
        }))
    }

    pub fn control_path(&self) -> &PathBuf {
        &self.control_path
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        info::session_dir(&self.control_path, session_id)
    }

    /// Spawns a PTY session and starts its writer/pump/reaper tasks.
    pub async fn create(self: &Arc<Self>, request: CreateSession) -> ApiResult<SessionInfo> {
        if request.command.is_empty() {
            return Err(ApiError::BadRequest("command must be a non-empty array".into()));
        }
        let cols = request.cols.unwrap_or(DEFAULT_COLS);
        let rows = request.rows.unwrap_or(DEFAULT_ROWS);
        if cols == 0 || rows == 0 {
            return Err(ApiError::BadRequest("cols and rows must be positive".into()));
        }

        let cwd = expand_tilde(&request.working_dir);
        if !cwd.is_dir() {
            return Err(ApiError::BadRequest(format!(
                "working directory does not exist: {}",
                cwd.display()
            )));
        }

        let term = request
            .term
            .unwrap_or_else(|| DEFAULT_TERM.to_string());
        let env = snapshot_env(&term);
        let session_id = Uuid::new_v4().simple().to_string();
        let dir = self.session_dir(&session_id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            ApiError::Internal(anyhow::anyhow!("create session dir: {e}"))
        })?;

        let spawn = PtySpawnConfig {
            command: &request.command,
            cwd: &cwd,
            env: &env,
            cols,
            rows,
            term: &term,
        };
        let (pty, reader) = match PtyProcess::spawn(spawn) {
            Ok(pair) => pair,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(ApiError::SpawnFailed(e.to_string()));
            }
        };

        let command_line = request.command.join(" ");
        let out_writer = StreamWriter::create(
            &info::stream_out_path(&dir),
            cols,
            rows,
            Some(command_line.clone()),
            Some(env.clone()),
        )
        .map_err(ApiError::Internal)?;
        let in_writer = StreamWriter::create(
            &info::stream_in_path(&dir),
            cols,
            rows,
            Some(command_line),
            None,
        )
        .map_err(ApiError::Internal)?;

        let name = request.name.unwrap_or_else(|| {
            request.command[0]
                .rsplit('/')
                .next()
                .unwrap_or("session")
                .to_string()
        });
        let session_info = SessionInfo {
            session_id: session_id.clone(),
            name,
            cmdline: request.command,
            cwd: cwd.to_string_lossy().into_owned(),
            env,
            cols,
            rows,
            term,
            started_at: chrono::Utc::now(),
            pid: pty.pid(),
            status: SessionStatus::Starting,
            exit_code: None,
        };
        info::store_info(&dir, &session_info).map_err(ApiError::Internal)?;

        let session = Arc::new(LiveSession {
            id: session_id.clone(),
            dir,
            pty: pty.clone(),
            info: Mutex::new(session_info.clone()),
            out_writer: Arc::new(StdMutex::new(out_writer)),
            in_writer: Mutex::new(in_writer),
            op_lock: Mutex::new(()),
        });
        self.live
            .write()
            .await
            .insert(session_id.clone(), session.clone());

        let (first_output_tx, first_output_rx) = oneshot::channel();
        let pump = spawn_output_pump(session.out_writer.clone(), reader, first_output_tx);
        Self::spawn_ready_task(session.clone(), first_output_rx);
        self.clone().spawn_exit_watcher(session, pump);

        info!(session_id = %session_id, "session created");
        Ok(session_info)
    }

    /// starting -> running on first output, or after the ready window.
    fn spawn_ready_task(session: Arc<LiveSession>, first_output: oneshot::Receiver<()>) {
        tokio::spawn(async move {
            tokio::select! {
                _ = first_output => {}
                _ = tokio::time::sleep(READY_WINDOW) => {}
            }
            let mut info = session.info.lock().await;
            if info.status == SessionStatus::Starting {
                info.status = SessionStatus::Running;
                if let Err(e) = info::store_info(&session.dir, &info) {
                    warn!(session_id = %session.id, error = %e, "persisting running status failed");
                }
            }
        });
    }

    fn spawn_exit_watcher(
        self: Arc<Self>,
        session: Arc<LiveSession>,
        pump: tokio::task::JoinHandle<()>,
    ) {
        tokio::spawn(async move {
            let code = session.pty.wait_exit().await;
            // The pump drains remaining PTY output into the stream file
            // before subscribers are told the session ended.
            let _ = pump.await;
            self.finish_session(&session, Some(code)).await;
        });
    }

    /// Records the exited state exactly once and tells the broadcaster.
    async fn finish_session(&self, session: &LiveSession, code: Option<i32>) {
        let transitioned = {
            let mut info = session.info.lock().await;
            let transitioned = info.mark_exited(code);
            if transitioned {
                if let Err(e) = info::store_info(&session.dir, &info) {
                    warn!(session_id = %session.id, error = %e, "persisting exit failed");
                }
            }
            transitioned
        };
        if transitioned {
            info!(session_id = %session.id, exit_code = ?code, "session exited");
            self.broadcaster.notify_exit(&session.id, code).await;
        }
    }

    pub async fn get_live(&self, session_id: &str) -> Option<Arc<LiveSession>> {
        self.live.read().await.get(session_id).cloned()
    }

    /// Session lookup, reconciling on-disk records whose pid is gone.
    pub async fn get(&self, session_id: &str) -> ApiResult<SessionListEntry> {
        if let Some(live) = self.get_live(session_id).await {
            let info = live.info().await;
            let last_modified = info::stream_last_modified(&live.dir);
            return Ok(SessionListEntry {
                info,
                last_modified,
                remote_name: None,
            });
        }

        let dir = self.session_dir(session_id);
        if !dir.join(INFO_FILE).exists() {
            return Err(ApiError::NotFound(format!("session {session_id}")));
        }
        let info = self.load_reconciled(&dir)?;
        let last_modified = info::stream_last_modified(&dir);
        Ok(SessionListEntry {
            info,
            last_modified,
            remote_name: None,
        })
    }

    fn load_reconciled(&self, dir: &std::path::Path) -> ApiResult<SessionInfo> {
        let mut info = info::load_info(dir).map_err(ApiError::Internal)?;
        if !info.status.is_exited() {
            let alive = info.pid.map(pid_alive).unwrap_or(false);
            if !alive {
                // The recorded process is gone: the entry is stale, exit
                // code unknown.
                info.mark_exited(None);
                if let Err(e) = info::store_info(dir, &info) {
                    warn!(path = %dir.display(), error = %e, "persisting reconciled exit failed");
                }
            }
        }
        Ok(info)
    }

    /// Scans the control directory; newest activity first.
    pub async fn list(&self) -> ApiResult<Vec<SessionListEntry>> {
        let live_ids: Vec<String> = self.live.read().await.keys().cloned().collect();
        let mut entries = Vec::new();

        let read_dir = match std::fs::read_dir(&self.control_path) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ApiError::Internal(e.into())),
        };

        for entry in read_dir.flatten() {
            let dir = entry.path();
            if !dir.is_dir() || !dir.join(INFO_FILE).exists() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let info = if live_ids.contains(&id) {
                match self.get_live(&id).await {
                    Some(live) => live.info().await,
                    None => continue,
                }
            } else {
                match self.load_reconciled(&dir) {
                    Ok(info) => info,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "skipping unreadable session");
                        continue;
                    }
                }
            };
            let last_modified = info::stream_last_modified(&dir);
            entries.push(SessionListEntry {
                info,
                last_modified,
                remote_name: None,
            });
        }

        entries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(entries)
    }

    /// Terminates a running session. `Gone` once it has already exited.
    pub async fn kill(&self, session_id: &str) -> ApiResult<()> {
        let Some(session) = self.get_live(session_id).await else {
            // Not spawned by this process; once the record exists on disk
            // the only honest answer is that the child cannot be signaled.
            self.get(session_id).await?;
            return Err(ApiError::Gone);
        };

        let _guard = session.op_lock.lock().await;
        if session.info.lock().await.status.is_exited() {
            return Err(ApiError::Gone);
        }

        session.pty.kill().await;
        let code = session.pty.wait_exit().await;
        self.finish_session(&session, Some(code)).await;
        Ok(())
    }

    /// Deletes the session directory. Refuses while the session runs.
    pub async fn cleanup(&self, session_id: &str) -> ApiResult<()> {
        let entry = self.get(session_id).await?;
        if !entry.info.status.is_exited() {
            return Err(ApiError::Conflict(format!(
                "session {session_id} is still running"
            )));
        }
        self.live.write().await.remove(session_id);
        std::fs::remove_dir_all(self.session_dir(session_id))
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("remove session dir: {e}")))?;
        debug!(session_id, "session directory removed");
        Ok(())
    }

    /// Removes every exited session; returns how many were deleted.
    pub async fn cleanup_exited(&self) -> ApiResult<usize> {
        let entries = self.list().await?;
        let mut cleaned = 0;
        for entry in entries {
            if entry.info.status.is_exited() {
                match self.cleanup(&entry.info.session_id).await {
                    Ok(()) => cleaned += 1,
                    Err(e) => {
                        warn!(session_id = %entry.info.session_id, error = %e, "cleanup failed")
                    }
                }
            }
        }
        Ok(cleaned)
    }

    /// Feeds input to the PTY and mirrors it into `stream-in`.
    pub async fn send_input(&self, session_id: &str, payload: &str) -> ApiResult<()> {
        let Some(session) = self.get_live(session_id).await else {
            self.get(session_id).await?;
            return Err(ApiError::Gone);
        };

        let _guard = session.op_lock.lock().await;
        if session.info.lock().await.status.is_exited() {
            return Err(ApiError::Gone);
        }

        let bytes = input_bytes(payload);
        if session.pty.write_input(&bytes).await.is_err() {
            // A write error means the child is gone even if the reaper has
            // not caught up yet.
            return Err(ApiError::Gone);
        }
        let mut in_writer = session.in_writer.lock().await;
        if let Err(e) = in_writer.append_input(&String::from_utf8_lossy(&bytes)) {
            warn!(session_id, error = %e, "input mirror append failed");
        }
        Ok(())
    }

    /// Resizes the PTY and records a resize event in the stream.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> ApiResult<()> {
        if cols == 0 || rows == 0 {
            return Err(ApiError::BadRequest("cols and rows must be positive".into()));
        }
        let Some(session) = self.get_live(session_id).await else {
            self.get(session_id).await?;
            return Err(ApiError::Gone);
        };

        let _guard = session.op_lock.lock().await;
        if session.info.lock().await.status.is_exited() {
            return Err(ApiError::Gone);
        }

        session
            .pty
            .resize(cols, rows)
            .await
            .map_err(ApiError::Internal)?;
        {
            let mut writer = session.out_writer.lock().expect("stream writer lock");
            if let Err(e) = writer.append_resize(cols, rows) {
                warn!(session_id, error = %e, "resize event append failed");
            }
        }
        let mut info = session.info.lock().await;
        info.cols = cols;
        info.rows = rows;
        if let Err(e) = info::store_info(&session.dir, &info) {
            warn!(session_id, error = %e, "persisting resize failed");
        }
        Ok(())
    }

    /// Kills every running session and records the exits; called on server
    /// shutdown so no `running` records survive the process.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<LiveSession>> =
            self.live.read().await.values().cloned().collect();
        for session in sessions {
            if session.info.lock().await.status.is_exited() {
                continue;
            }
            info!(session_id = %session.id, "terminating session for shutdown");
            session.pty.kill().await;
            let code = session.pty.wait_exit().await;
            self.finish_session(&session, Some(code)).await;
        }
    }
}

/// Pumps PTY output into the stream writer on a blocking task, carrying
/// incomplete UTF-8 sequences across chunk boundaries.
fn spawn_output_pump(
    writer: Arc<StdMutex<StreamWriter>>,
    mut reader: Box<dyn Read + Send>,
    first_output: oneshot::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();
        let mut first_output = Some(first_output);
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(tx) = first_output.take() {
                        let _ = tx.send(());
                    }
                    pending.extend_from_slice(&buf[..n]);
                    let valid = complete_utf8_prefix(&pending);
                    if valid == 0 {
                        continue;
                    }
                    let chunk = String::from_utf8_lossy(&pending[..valid]).into_owned();
                    pending.drain(..valid);
                    let mut writer = writer.lock().expect("stream writer lock");
                    if let Err(e) = writer.append_output(&chunk) {
                        error!(error = %e, "stream append failed, stopping pump");
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO is the normal end of a PTY whose child went away.
                Err(_) => break,
            }
        }
        if !pending.is_empty() {
            let chunk = String::from_utf8_lossy(&pending).into_owned();
            if let Ok(mut writer) = writer.lock() {
                let _ = writer.append_output(&chunk);
            }
        }
    })
}

/// Length of the longest prefix that does not end inside a UTF-8 sequence.
fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => match e.error_len() {
            // Invalid bytes in the middle are passed through (lossy).
            Some(_) => bytes.len(),
            // A truncated sequence at the end waits for the next chunk.
            None => e.valid_up_to(),
        },
    }
}

fn snapshot_env(term: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("TERM".to_string(), term.to_string());
    for var in ["SHELL", "LANG", "LC_ALL", "PATH", "USER", "HOME"] {
        if let Ok(value) = std::env::var(var) {
            env.insert(var.to_string(), value);
        }
    }
    env
}

/// Maps a special-key token to the bytes it sends; anything else is literal
/// text. Tokens match exactly or not at all.
pub fn input_bytes(payload: &str) -> Vec<u8> {
    match payload {
        "arrow_up" => b"\x1b[A".to_vec(),
        "arrow_down" => b"\x1b[B".to_vec(),
        "arrow_right" => b"\x1b[C".to_vec(),
        "arrow_left" => b"\x1b[D".to_vec(),
        "escape" => b"\x1b".to_vec(),
        "enter" | "ctrl_enter" => b"\r".to_vec(),
        "shift_enter" => b"\x1b\r".to_vec(),
        other => other.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_key_tokens() {
        assert_eq!(input_bytes("arrow_up"), b"\x1b[A");
        assert_eq!(input_bytes("arrow_down"), b"\x1b[B");
        assert_eq!(input_bytes("arrow_right"), b"\x1b[C");
        assert_eq!(input_bytes("arrow_left"), b"\x1b[D");
        assert_eq!(input_bytes("escape"), b"\x1b");
        assert_eq!(input_bytes("enter"), b"\r");
        assert_eq!(input_bytes("ctrl_enter"), b"\r");
        assert_eq!(input_bytes("shift_enter"), b"\x1b\r");
    }

    #[test]
    fn test_unknown_token_is_literal() {
        assert_eq!(input_bytes("arrow_upp"), b"arrow_upp");
        assert_eq!(input_bytes("ls -la\n"), b"ls -la\n");
    }

    #[test]
    fn test_complete_utf8_prefix_defers_truncated_tail() {
        let mut bytes = "héllo".as_bytes().to_vec();
        let full = bytes.len();
        assert_eq!(complete_utf8_prefix(&bytes), full);
        // Chop a multibyte character in half.
        bytes.extend_from_slice(&"é".as_bytes()[..1]);
        assert_eq!(complete_utf8_prefix(&bytes), full);
    }
}
