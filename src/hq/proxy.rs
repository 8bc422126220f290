//! Request proxying to owning remotes
//!
//! A session request arriving at HQ for a session some remote owns is
//! forwarded verbatim (method, path, query, body), with the remote's bearer
//! token injected. The upstream response streams back unchanged, SSE
//! included: 30 s to the first byte, no deadline once streaming.

use super::registry::RemoteRecord;
use crate::error::ApiError;
use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::Response;
use futures::TryStreamExt;
use std::time::Duration;
use tracing::{debug, warn};

pub const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PROXY_BODY: usize = 16 * 1024 * 1024;

/// Hop-by-hop headers that never cross the proxy.
const SKIPPED_HEADERS: [&str; 5] = [
    "host",
    "authorization",
    "connection",
    "transfer-encoding",
    "content-length",
];

/// Builds the streaming client: connect deadline only, so long-lived SSE
/// responses are never cut off mid-flight.
pub fn proxy_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

pub async fn forward(
    client: &reqwest::Client,
    remote: &RemoteRecord,
    request: Request,
) -> Result<Response, ApiError> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let target = format!("{}{}", remote.url, path_and_query);

    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
        .map_err(|_| ApiError::BadRequest("unsupported method".into()))?;

    let mut upstream = client.request(method, &target);
    for (name, value) in request.headers() {
        if SKIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        // The outbound client speaks a different http version of the header
        // types, so names and values cross as raw bytes.
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            upstream = upstream.header(name, value);
        }
    }
    upstream = upstream.bearer_auth(&remote.token);

    let body = axum::body::to_bytes(request.into_body(), MAX_PROXY_BODY)
        .await
        .map_err(|_| ApiError::BadRequest("request body too large".into()))?;
    if !body.is_empty() {
        upstream = upstream.body(body);
    }

    debug!(remote = %remote.name, target = %target, "proxying to remote");
    let response = match tokio::time::timeout(FIRST_BYTE_TIMEOUT, upstream.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(remote = %remote.name, error = %e, "proxy request failed");
            return Err(ApiError::UpstreamUnavailable(format!(
                "remote {} unreachable",
                remote.name
            )));
        }
        Err(_) => {
            warn!(remote = %remote.name, "proxy request timed out");
            return Err(ApiError::UpstreamUnavailable(format!(
                "remote {} timed out",
                remote.name
            )));
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if SKIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }

    let stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("assemble proxy response: {e}")))
}
