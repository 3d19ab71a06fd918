//! HTTP routes for the update server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use semver::Version;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{ReportAck, UpdateService};
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::model::{DeviceRecord, Release, Report, UpdateSession};
use crate::registry::Resolution;

/// Shared application state.
pub type AppState = Arc<UpdateService>;

/// Build the server router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", api_routes())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/resolve", get(resolve))
        .route("/packages/{hash}", get(get_package))
        .route("/reports", post(post_report))
        .route("/devices/{device_id}", get(get_device))
        .route("/sessions/{session_id}", get(get_session))
        .route("/channels/{channel}/releases", get(list_releases))
}

/// Serve `state` on `bind` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(
    state: AppState,
    bind: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Update server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Update server stopped");
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    device: String,
    current_version: String,
    channel: String,
    #[serde(default)]
    full: bool,
}

async fn resolve(
    State(svc): State<AppState>,
    Query(q): Query<ResolveQuery>,
) -> Result<Json<Resolution>> {
    let current = Version::parse(&q.current_version)?;
    svc.resolve(&q.device, &q.channel, &current, q.full)
        .map(Json)
}

async fn post_report(
    State(svc): State<AppState>,
    Json(report): Json<Report>,
) -> Result<Json<ReportAck>> {
    svc.report(report).await.map(Json)
}

async fn get_device(
    State(svc): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceRecord>> {
    svc.device(&device_id).map(Json)
}

async fn get_session(
    State(svc): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<UpdateSession>> {
    let session_id = Uuid::parse_str(&session_id)
        .map_err(|e| Error::validation(format!("invalid session id: {e}")))?;
    svc.session(&session_id).map(Json)
}

async fn list_releases(
    State(svc): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Json<Vec<Release>>> {
    svc.releases(&channel).map(Json)
}

async fn get_package(
    State(svc): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let hash: ContentHash = hash.parse()?;
    let size = svc.package_size(&hash)?;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, size));

    let Some(range) = range.filter(|_| size > 0) else {
        let bytes = svc.package(&hash)?;
        return Ok(package_response(StatusCode::OK, &hash, bytes, None));
    };

    let (start, end) = match range {
        ByteRange::Satisfiable { start, end } => (start, end),
        ByteRange::Unsatisfiable => return Ok(unsatisfiable(size)),
    };
    let bytes = match svc.package_range(&hash, start, end - start + 1) {
        Ok(bytes) => bytes,
        Err(Error::RangeNotSatisfiable { .. }) => return Ok(unsatisfiable(size)),
        Err(err) => return Err(err),
    };
    let last = start + bytes.len() as u64 - 1;
    let content_range = format!("bytes {start}-{last}/{size}");
    Ok(package_response(
        StatusCode::PARTIAL_CONTENT,
        &hash,
        bytes,
        Some(content_range),
    ))
}

fn package_response(
    status: StatusCode,
    hash: &ContentHash,
    bytes: Vec<u8>,
    content_range: Option<String>,
) -> Response {
    let mut response = (status, Body::from(bytes)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{hash}\"")) {
        headers.insert(header::ETAG, etag);
    }
    if let Some(value) = content_range.and_then(|r| HeaderValue::from_str(&r).ok()) {
        headers.insert(header::CONTENT_RANGE, value);
    }
    response
}

fn unsatisfiable(size: u64) -> Response {
    let mut response = Error::RangeNotSatisfiable {
        offset: size,
        len: 0,
        size,
    }
    .into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

/// A parsed single `Range` header against a known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    /// Inclusive byte range inside the artifact.
    Satisfiable { start: u64, end: u64 },
    /// Syntactically valid but outside the artifact.
    Unsatisfiable,
}

/// Parse `bytes=a-b`, `bytes=a-` or `bytes=-n`. Anything else, including
/// multiple ranges, is ignored and the whole artifact is served.
fn parse_range(value: &str, size: u64) -> Option<ByteRange> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (first, last) = spec.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let suffix: u64 = last.parse().ok()?;
        if suffix == 0 || size == 0 {
            return Some(ByteRange::Unsatisfiable);
        }
        return Some(ByteRange::Satisfiable {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let start: u64 = first.parse().ok()?;
    let end = if last.is_empty() {
        u64::MAX
    } else {
        let end: u64 = last.parse().ok()?;
        if end < start {
            return None;
        }
        end
    };
    if start >= size {
        return Some(ByteRange::Unsatisfiable);
    }
    Some(ByteRange::Satisfiable {
        start,
        end: end.min(size - 1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(
            parse_range("bytes=0-99", 1000),
            Some(ByteRange::Satisfiable { start: 0, end: 99 })
        );
        assert_eq!(
            parse_range("bytes=500-", 1000),
            Some(ByteRange::Satisfiable {
                start: 500,
                end: 999
            })
        );
        assert_eq!(
            parse_range("bytes=-100", 1000),
            Some(ByteRange::Satisfiable {
                start: 900,
                end: 999
            })
        );
        assert_eq!(
            parse_range("bytes=900-5000", 1000),
            Some(ByteRange::Satisfiable {
                start: 900,
                end: 999
            })
        );
    }

    #[test]
    fn test_parse_range_unsatisfiable() {
        assert_eq!(
            parse_range("bytes=1000-", 1000),
            Some(ByteRange::Unsatisfiable)
        );
        assert_eq!(parse_range("bytes=-0", 1000), Some(ByteRange::Unsatisfiable));
    }

    #[test]
    fn test_parse_range_ignored_forms() {
        assert_eq!(parse_range("items=0-1", 1000), None);
        assert_eq!(parse_range("bytes=0-1,5-6", 1000), None);
        assert_eq!(parse_range("bytes=9-1", 1000), None);
        assert_eq!(parse_range("bytes=abc-", 1000), None);
    }
}
