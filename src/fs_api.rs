//! Filesystem browse/mkdir API
//!
//! Paths resolve with `~` expansion and canonicalization, and anything that
//! lands outside the server user's home directory is rejected.

use crate::config::expand_tilde;
use crate::error::{ApiError, ApiResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirListing {
    pub absolute_path: String,
    pub files: Vec<DirEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MkdirResult {
    pub path: String,
}

fn home_dir() -> ApiResult<PathBuf> {
    dirs::home_dir()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("cannot determine home directory")))
}

/// Resolves a user-supplied path and confines it to `root`.
fn resolve_confined(root: &Path, raw: &str) -> ApiResult<PathBuf> {
    let expanded = expand_tilde(raw);
    let canonical = expanded
        .canonicalize()
        .map_err(|_| ApiError::NotFound(format!("path {raw}")))?;
    let root = root
        .canonicalize()
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("canonicalize home: {e}")))?;
    if !canonical.starts_with(&root) {
        return Err(ApiError::BadRequest(format!(
            "path {raw} escapes the allowed root"
        )));
    }
    Ok(canonical)
}

/// Lists a directory under the server user's home.
pub fn browse(raw_path: &str) -> ApiResult<DirListing> {
    let home = home_dir()?;
    let path = resolve_confined(&home, raw_path)?;
    if !path.is_dir() {
        return Err(ApiError::BadRequest(format!(
            "{} is not a directory",
            path.display()
        )));
    }

    let mut files = Vec::new();
    let entries = std::fs::read_dir(&path)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("read dir: {e}")))?;
    for entry in entries.flatten() {
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        files.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            created: meta.created().ok().map(DateTime::<Utc>::from),
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            size: meta.len(),
            is_dir: meta.is_dir(),
        });
    }
    files.sort_by(|a, b| (b.is_dir, &a.name).cmp(&(a.is_dir, &b.name)));

    Ok(DirListing {
        absolute_path: path.to_string_lossy().into_owned(),
        files,
    })
}

/// Creates `name` under `parent`. The name must be a single path component.
pub fn mkdir(parent: &str, name: &str) -> ApiResult<MkdirResult> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ApiError::BadRequest(format!("invalid directory name {name:?}")));
    }
    let home = home_dir()?;
    let parent = resolve_confined(&home, parent)?;
    let target = parent.join(name);
    std::fs::create_dir(&target)
        .map_err(|e| ApiError::BadRequest(format!("cannot create {}: {e}", target.display())))?;
    let canonical = target
        .canonicalize()
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("canonicalize created dir: {e}")))?;
    Ok(MkdirResult {
        path: canonical.to_string_lossy().into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browse_rejects_escape() {
        // The repository root is outside any user's home.
        let result = browse("/");
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_browse_home_succeeds() {
        if dirs::home_dir().is_none() {
            return;
        }
        let listing = browse("~").unwrap();
        assert!(!listing.absolute_path.is_empty());
    }

    #[test]
    fn test_mkdir_rejects_bad_names() {
        for name in ["a/b", "a\\b", "..", "with..dots", ""] {
            assert!(matches!(mkdir("~", name), Err(ApiError::BadRequest(_))));
        }
    }

    #[test]
    fn test_browse_missing_path_is_not_found() {
        let result = browse("~/definitely-missing-vibetunnel-test-dir");
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }
}
