//! Remote registry and health loop
//!
//! HQ-side bookkeeping: which remotes exist, whether they answer, and which
//! session ids each one currently owns. The health loop snapshots the
//! registry before probing so no lock is held across network I/O.

use crate::error::{ApiError, ApiResult};
use crate::session::SessionListEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const HEALTH_INTERVAL: Duration = Duration::from_secs(15);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failures after which a remote is dropped.
const REMOVE_AFTER_FAILURES: u32 = 3;
/// Consecutive failures after which a remote counts as unhealthy.
const UNHEALTHY_AFTER_FAILURES: u32 = 2;

#[derive(Debug, Clone)]
pub struct RemoteRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: String,
    pub last_probe: Option<DateTime<Utc>>,
    pub failures: u32,
    pub session_ids: HashSet<String>,
}

impl RemoteRecord {
    pub fn is_healthy(&self) -> bool {
        self.failures < UNHEALTHY_AFTER_FAILURES
    }
}

/// Registration request body, as remotes post it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRemote {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: String,
}

/// One remote as reported by `GET /api/remotes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSummary {
    pub id: String,
    pub name: String,
    pub url: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe: Option<DateTime<Utc>>,
    pub session_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCleanupResult {
    pub remote_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaned: Option<u64>,
}

pub struct RemoteRegistry {
    remotes: RwLock<HashMap<String, RemoteRecord>>,
    client: reqwest::Client,
}

impl RemoteRegistry {
    pub fn new() -> anyhow::Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(Arc::new(Self {
            remotes: RwLock::new(HashMap::new()),
            client,
        }))
    }

    /// Adds a remote; duplicate ids and names are rejected.
    pub async fn register(&self, request: RegisterRemote) -> ApiResult<()> {
        let mut remotes = self.remotes.write().await;
        if remotes.contains_key(&request.id) {
            return Err(ApiError::Conflict(format!("remote id {} taken", request.id)));
        }
        if remotes.values().any(|r| r.name == request.name) {
            return Err(ApiError::Conflict(format!(
                "remote name {} taken",
                request.name
            )));
        }
        info!(id = %request.id, name = %request.name, url = %request.url, "remote registered");
        remotes.insert(
            request.id.clone(),
            RemoteRecord {
                id: request.id,
                name: request.name,
                url: request.url.trim_end_matches('/').to_string(),
                token: request.token,
                last_probe: None,
                failures: 0,
                session_ids: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Drops a remote and forgets its session ownership.
    pub async fn unregister(&self, remote_id: &str) -> ApiResult<()> {
        let mut remotes = self.remotes.write().await;
        match remotes.remove(remote_id) {
            Some(record) => {
                info!(id = %remote_id, name = %record.name, sessions = record.session_ids.len(),
                    "remote unregistered");
                Ok(())
            }
            None => Err(ApiError::NotFound(format!("remote {remote_id}"))),
        }
    }

    pub async fn list(&self) -> Vec<RemoteSummary> {
        let remotes = self.remotes.read().await;
        let mut summaries: Vec<RemoteSummary> = remotes
            .values()
            .map(|r| RemoteSummary {
                id: r.id.clone(),
                name: r.name.clone(),
                url: r.url.clone(),
                healthy: r.is_healthy(),
                last_probe: r.last_probe,
                session_count: r.session_ids.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub async fn remote_by_id(&self, remote_id: &str) -> Option<RemoteRecord> {
        self.remotes.read().await.get(remote_id).cloned()
    }

    /// The remote currently owning a session id, if any.
    pub async fn remote_for_session(&self, session_id: &str) -> Option<RemoteRecord> {
        let remotes = self.remotes.read().await;
        remotes
            .values()
            .find(|r| r.session_ids.contains(session_id))
            .cloned()
    }

    /// Replaces a remote's session-id set. Last report wins: ids claimed
    /// here are removed from every other remote.
    pub async fn update_sessions(&self, remote_id: &str, session_ids: HashSet<String>) {
        let mut remotes = self.remotes.write().await;
        for (id, record) in remotes.iter_mut() {
            if id != remote_id {
                record.session_ids.retain(|s| !session_ids.contains(s));
            }
        }
        if let Some(record) = remotes.get_mut(remote_id) {
            record.session_ids = session_ids;
            record.last_probe = Some(Utc::now());
            record.failures = 0;
        }
    }

    async fn record_failure(&self, remote_id: &str) {
        let mut remotes = self.remotes.write().await;
        let Some(record) = remotes.get_mut(remote_id) else {
            return;
        };
        record.failures += 1;
        if record.failures >= REMOVE_AFTER_FAILURES {
            let record = remotes.remove(remote_id).expect("record exists");
            warn!(id = %remote_id, name = %record.name, sessions = record.session_ids.len(),
                "remote removed after repeated probe failures");
        } else if record.failures >= UNHEALTHY_AFTER_FAILURES {
            warn!(id = %remote_id, name = %record.name, failures = record.failures,
                "remote marked unhealthy");
        }
    }

    /// Probes every remote once. Separated from the loop for tests.
    pub async fn probe_all(&self) {
        let snapshot: Vec<RemoteRecord> =
            self.remotes.read().await.values().cloned().collect();
        let probes = snapshot.into_iter().map(|record| async move {
            let result = self.probe(&record).await;
            (record.id.clone(), result)
        });
        for (remote_id, result) in futures::future::join_all(probes).await {
            match result {
                Ok(session_ids) => self.update_sessions(&remote_id, session_ids).await,
                Err(e) => {
                    debug!(id = %remote_id, error = %e, "probe failed");
                    self.record_failure(&remote_id).await;
                }
            }
        }
    }

    /// `GET /api/health`, falling back to `GET /api/sessions` on 404; a
    /// successful probe always refreshes the remote's session ids.
    async fn probe(&self, record: &RemoteRecord) -> anyhow::Result<HashSet<String>> {
        let health = self
            .client
            .get(format!("{}/api/health", record.url))
            .bearer_auth(&record.token)
            .send()
            .await?;

        if health.status() != reqwest::StatusCode::NOT_FOUND && !health.status().is_success() {
            anyhow::bail!("health returned {}", health.status());
        }

        let sessions = self
            .client
            .get(format!("{}/api/sessions", record.url))
            .bearer_auth(&record.token)
            .send()
            .await?
            .error_for_status()?;
        let entries: Vec<SessionListEntry> = sessions.json().await?;
        Ok(entries
            .into_iter()
            .map(|e| e.info.session_id)
            .collect())
    }

    pub fn spawn_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.probe_all().await;
            }
        })
    }

    /// Fetches every healthy remote's sessions in parallel (bounded by the
    /// probe timeout), tags them with the remote name, and appends them to
    /// the local list. Remotes that fail are elided.
    pub async fn aggregate_sessions(
        &self,
        mut local: Vec<SessionListEntry>,
    ) -> Vec<SessionListEntry> {
        let snapshot: Vec<RemoteRecord> =
            self.remotes.read().await.values().cloned().collect();
        let fetches = snapshot.into_iter().map(|record| async move {
            let result: anyhow::Result<Vec<SessionListEntry>> = async {
                let response = self
                    .client
                    .get(format!("{}/api/sessions", record.url))
                    .bearer_auth(&record.token)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(response.json().await?)
            }
            .await;
            (record.name, result)
        });

        for (remote_name, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(entries) => {
                    for mut entry in entries {
                        entry.remote_name = Some(remote_name.clone());
                        local.push(entry);
                    }
                }
                Err(e) => debug!(remote = %remote_name, error = %e, "aggregate fetch elided"),
            }
        }

        local.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        local
    }

    /// Fans `POST /api/cleanup-exited` out to every remote.
    pub async fn cleanup_exited_remotes(&self) -> Vec<RemoteCleanupResult> {
        let snapshot: Vec<RemoteRecord> =
            self.remotes.read().await.values().cloned().collect();
        let calls = snapshot.into_iter().map(|record| async move {
            let result = self
                .client
                .post(format!("{}/api/cleanup-exited", record.url))
                .bearer_auth(&record.token)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let cleaned = response
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| v.get("localCleaned").and_then(|n| n.as_u64()));
                    RemoteCleanupResult {
                        remote_name: record.name,
                        success: true,
                        cleaned,
                    }
                }
                _ => RemoteCleanupResult {
                    remote_name: record.name,
                    success: false,
                    cleaned: None,
                },
            }
        });
        futures::future::join_all(calls).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, name: &str) -> RegisterRemote {
        RegisterRemote {
            id: id.to_string(),
            name: name.to_string(),
            url: format!("http://{name}.example:4020/"),
            token: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let registry = RemoteRegistry::new().unwrap();
        registry.register(request("r1", "edge-1")).await.unwrap();

        let id_taken = registry.register(request("r1", "edge-2")).await;
        assert!(matches!(id_taken, Err(ApiError::Conflict(_))));

        let name_taken = registry.register(request("r2", "edge-1")).await;
        assert!(matches!(name_taken, Err(ApiError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_register_strips_trailing_slash() {
        let registry = RemoteRegistry::new().unwrap();
        registry.register(request("r1", "edge-1")).await.unwrap();
        let list = registry.list().await;
        assert_eq!(list[0].url, "http://edge-1.example:4020");
    }

    #[tokio::test]
    async fn test_session_ownership_moves_on_rereport() {
        let registry = RemoteRegistry::new().unwrap();
        registry.register(request("r1", "edge-1")).await.unwrap();
        registry.register(request("r2", "edge-2")).await.unwrap();

        registry
            .update_sessions("r1", HashSet::from(["s1".to_string(), "s2".to_string()]))
            .await;
        assert_eq!(
            registry.remote_for_session("s1").await.unwrap().id,
            "r1"
        );

        registry
            .update_sessions("r2", HashSet::from(["s1".to_string()]))
            .await;
        assert_eq!(
            registry.remote_for_session("s1").await.unwrap().id,
            "r2"
        );
        assert_eq!(
            registry.remote_for_session("s2").await.unwrap().id,
            "r1"
        );
    }

    #[tokio::test]
    async fn test_unregister_drops_sessions() {
        let registry = RemoteRegistry::new().unwrap();
        registry.register(request("r1", "edge-1")).await.unwrap();
        registry
            .update_sessions("r1", HashSet::from(["s1".to_string()]))
            .await;
        registry.unregister("r1").await.unwrap();
        assert!(registry.remote_for_session("s1").await.is_none());
        assert!(matches!(
            registry.unregister("r1").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_three_failures_remove_remote() {
        let registry = RemoteRegistry::new().unwrap();
        registry.register(request("r1", "edge-1")).await.unwrap();

        registry.record_failure("r1").await;
        assert_eq!(registry.list().await.len(), 1);
        assert!(registry.list().await[0].healthy);

        registry.record_failure("r1").await;
        assert_eq!(registry.list().await.len(), 1);
        assert!(!registry.list().await[0].healthy);

        registry.record_failure("r1").await;
        assert!(registry.list().await.is_empty());
    }
}
