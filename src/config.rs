//! Server configuration
//!
//! Assembled from CLI flags with environment fallbacks for the auth pair.
//! Flags override env. The control root (session state directory) defaults to
//! `~/.vibetunnel/control` and is always configurable.

use anyhow::{anyhow, Context, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

pub const USERNAME_ENV: &str = "VIBETUNNEL_USERNAME";
pub const PASSWORD_ENV: &str = "VIBETUNNEL_PASSWORD";

/// Basic-auth credential pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// HQ registration settings for a remote server.
#[derive(Debug, Clone)]
pub struct HqTarget {
    /// Base URL of the HQ server.
    pub url: Url,
    /// Credentials the HQ expects on its registration endpoint.
    pub credentials: Option<Credentials>,
    /// Name this server registers under; unique within the fleet.
    pub name: String,
}

/// Fully-resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Auth required on the API when set.
    pub credentials: Option<Credentials>,
    /// Run as an HQ node: aggregate and proxy to registered remotes.
    pub hq_mode: bool,
    /// When set, register with this HQ at startup.
    pub hq: Option<HqTarget>,
    /// Per-session state lives under this directory.
    pub control_path: PathBuf,
    /// Optional static front-end directory.
    pub static_path: Option<PathBuf>,
}

impl ServerConfig {
    /// Validates cross-flag constraints and fills env fallbacks.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        bind: IpAddr,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        hq_mode: bool,
        hq_url: Option<String>,
        hq_username: Option<String>,
        hq_password: Option<String>,
        name: Option<String>,
        control_path: Option<PathBuf>,
        static_path: Option<PathBuf>,
    ) -> Result<Self> {
        let credentials = resolve_credentials(username, password)?;

        let hq = match hq_url {
            Some(raw) => {
                let url = Url::parse(&raw).with_context(|| format!("invalid --hq-url {raw}"))?;
                let name = name.ok_or_else(|| anyhow!("--hq-url requires --name"))?;
                let credentials = match (hq_username, hq_password) {
                    (Some(username), Some(password)) => Some(Credentials { username, password }),
                    (None, None) => None,
                    _ => {
                        return Err(anyhow!(
                            "--hq-username and --hq-password must be given together"
                        ))
                    }
                };
                Some(HqTarget {
                    url,
                    credentials,
                    name,
                })
            }
            None => None,
        };

        if hq_mode && hq.is_some() {
            return Err(anyhow!("--hq and --hq-url are mutually exclusive"));
        }

        let control_path = match control_path {
            Some(p) => p,
            None => default_control_path()?,
        };

        Ok(Self {
            bind,
            port,
            credentials,
            hq_mode,
            hq,
            control_path,
            static_path,
        })
    }
}

fn resolve_credentials(
    username: Option<String>,
    password: Option<String>,
) -> Result<Option<Credentials>> {
    let username = username.or_else(|| std::env::var(USERNAME_ENV).ok());
    let password = password.or_else(|| std::env::var(PASSWORD_ENV).ok());

    match (username, password) {
        (Some(username), Some(password)) => Ok(Some(Credentials { username, password })),
        (None, None) => Ok(None),
        _ => Err(anyhow!(
            "username and password must be configured together (flags or {USERNAME_ENV}/{PASSWORD_ENV})"
        )),
    }
}

/// `~/.vibetunnel/control`
pub fn default_control_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(home.join(".vibetunnel").join("control"))
}

/// Expands a leading `~` against the current user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
