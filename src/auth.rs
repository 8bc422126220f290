//! Basic + Bearer authentication
//!
//! When credentials are configured, every API request must carry either the
//! Basic pair or (on a federated remote) the bearer token minted at HQ
//! registration. The `/buffers` upgrade path is wired outside the
//! middleware; its handler calls into here before upgrading.

use crate::config::Credentials;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

#[derive(Clone, Default)]
pub struct AuthSettings {
    pub credentials: Option<Credentials>,
    /// Token handed to the HQ at registration time.
    pub bearer_token: Option<String>,
}

impl AuthSettings {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn required(&self) -> bool {
        self.credentials.is_some()
    }

    /// Checks the Authorization header; optionally a `token` query value
    /// (used by the WebSocket path, where clients cannot set headers).
    pub fn allows(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        let Some(credentials) = &self.credentials else {
            return true;
        };

        if let Some(raw) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            if let Some(encoded) = raw.strip_prefix("Basic ") {
                if check_basic(encoded, credentials) {
                    return true;
                }
            }
            if let Some(token) = raw.strip_prefix("Bearer ") {
                if self.token_matches(token) {
                    return true;
                }
            }
        }

        if let Some(token) = query_token {
            if self.token_matches(token) {
                return true;
            }
        }

        false
    }

    fn token_matches(&self, presented: &str) -> bool {
        self.bearer_token
            .as_deref()
            .map(|token| token == presented)
            .unwrap_or(false)
    }
}

fn check_basic(encoded: &str, credentials: &Credentials) -> bool {
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    match pair.split_once(':') {
        Some((user, pass)) => user == credentials.username && pass == credentials.password,
        None => false,
    }
}
