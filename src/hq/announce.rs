//! Remote-side HQ registration
//!
//! A server started with `--hq-url` announces itself to the HQ at startup
//! and takes itself out of the fleet on shutdown. The HQ calls back with the
//! bearer token minted here, which the local auth layer accepts alongside
//! the configured Basic credentials.

use super::registry::RegisterRemote;
use crate::config::HqTarget;
use std::time::Duration;
use uuid::Uuid;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct HqAnnouncer {
    target: HqTarget,
    remote_id: String,
    token: String,
    advertised_url: String,
    client: reqwest::Client,
}

impl HqAnnouncer {
    pub fn new(target: HqTarget, advertised_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            target,
            remote_id: Uuid::new_v4().to_string(),
            token: Uuid::new_v4().simple().to_string(),
            advertised_url,
            client,
        })
    }

    /// The bearer token the HQ will present on proxied requests.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Registers with the HQ, retrying with exponential backoff until it
    /// succeeds. A conflict (name or id taken) is terminal.
    pub async fn register(&self) -> anyhow::Result<()> {
        let endpoint = format!(
            "{}/api/remotes/register",
            self.target.url.as_str().trim_end_matches('/')
        );
        let body = RegisterRemote {
            id: self.remote_id.clone(),
            name: self.target.name.clone(),
            url: self.advertised_url.clone(),
            token: self.token.clone(),
        };

        let mut backoff = INITIAL_BACKOFF;
        loop {
            let mut request = self.client.post(&endpoint).json(&body);
            if let Some(creds) = &self.target.credentials {
                request = request.basic_auth(&creds.username, Some(&creds.password));
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(hq = %endpoint, name = %self.target.name, "registered with HQ");
                    return Ok(());
                }
                Ok(response) if response.status() == reqwest::StatusCode::CONFLICT => {
                    anyhow::bail!(
                        "HQ rejected registration for {:?}: name or id already taken",
                        self.target.name
                    );
                }
                Ok(response) => {
                    tracing::warn!(status = %response.status(), "HQ registration rejected, retrying");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "HQ unreachable, retrying registration");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Best-effort removal from the fleet.
    pub async fn unregister(&self) {
        let endpoint = format!(
            "{}/api/remotes/{}",
            self.target.url.as_str().trim_end_matches('/'),
            self.remote_id
        );
        let mut request = self.client.delete(&endpoint);
        if let Some(creds) = &self.target.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(name = %self.target.name, "unregistered from HQ");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "HQ unregister rejected");
            }
            Err(e) => tracing::warn!(error = %e, "HQ unregister failed"),
        }
    }
}
