//! On-disk session metadata
//!
//! Each session directory holds `info.json` plus the stream files. The
//! metadata file is replaced atomically (temp file + rename) so concurrent
//! readers never observe a torn document.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const INFO_FILE: &str = "info.json";
pub const STREAM_OUT_FILE: &str = "stream-out";
pub const STREAM_IN_FILE: &str = "stream-in";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

impl SessionStatus {
    pub fn is_exited(self) -> bool {
        matches!(self, SessionStatus::Exited)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub name: String,
    pub cmdline: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub term: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub status: SessionStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl SessionInfo {
    /// Marks the session exited. The first transition wins: an already
    /// exited record keeps its status and code.
    pub fn mark_exited(&mut self, exit_code: Option<i32>) -> bool {
        if self.status.is_exited() {
            return false;
        }
        self.status = SessionStatus::Exited;
        self.exit_code = exit_code;
        true
    }
}

/// A session as returned by the list/get API, with fleet metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListEntry {
    #[serde(flatten)]
    pub info: SessionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
}

pub fn session_dir(control_path: &Path, session_id: &str) -> PathBuf {
    control_path.join(session_id)
}

pub fn info_path(session_dir: &Path) -> PathBuf {
    session_dir.join(INFO_FILE)
}

pub fn stream_out_path(session_dir: &Path) -> PathBuf {
    session_dir.join(STREAM_OUT_FILE)
}

pub fn stream_in_path(session_dir: &Path) -> PathBuf {
    session_dir.join(STREAM_IN_FILE)
}

pub fn load_info(session_dir: &Path) -> Result<SessionInfo> {
    let path = info_path(session_dir);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Writes `info.json` atomically within the session directory.
pub fn store_info(session_dir: &Path, info: &SessionInfo) -> Result<()> {
    let raw = serde_json::to_string_pretty(info)?;
    let temp = NamedTempFile::new_in(session_dir)
        .with_context(|| format!("temp file in {}", session_dir.display()))?;
    std::fs::write(temp.path(), raw)?;
    temp.persist(info_path(session_dir))
        .context("persist info.json")?;
    Ok(())
}

/// Modification time of the stream file, if it exists.
pub fn stream_last_modified(session_dir: &Path) -> Option<DateTime<Utc>> {
    let meta = std::fs::metadata(stream_out_path(session_dir)).ok()?;
    let modified = meta.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> SessionInfo {
        SessionInfo {
            session_id: id.to_string(),
            name: "test".into(),
            cmdline: vec!["sh".into()],
            cwd: "/tmp".into(),
            env: HashMap::new(),
            cols: 120,
            rows: 30,
            term: "xterm-256color".into(),
            started_at: Utc::now(),
            pid: Some(4242),
            status: SessionStatus::Running,
            exit_code: None,
        }
    }

    #[test]
    fn test_store_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let info = sample("abc123");
        store_info(dir.path(), &info).unwrap();
        let loaded = load_info(dir.path()).unwrap();
        assert_eq!(loaded, info);
    }

    #[test]
    fn test_info_json_uses_camel_case() {
        let json = serde_json::to_string(&sample("abc123")).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"startedAt\""));
        assert!(json.contains("\"exitCode\""));
        assert!(json.contains("\"status\":\"running\""));
    }

    #[test]
    fn test_mark_exited_is_final() {
        let mut info = sample("abc123");
        assert!(info.mark_exited(Some(3)));
        assert!(!info.mark_exited(Some(9)));
        assert_eq!(info.exit_code, Some(3));
        assert_eq!(info.status, SessionStatus::Exited);
    }
}
