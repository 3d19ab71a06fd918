//! How the agent talks to the update server.
//!
//! [`HttpTransport`] speaks the `/v1` HTTP API. [`LocalTransport`] calls an
//! [`UpdateService`] in the same process, which is how a device co-located
//! with its package store fetches directly instead of through a proxy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use semver::Version;
use serde::Deserialize;

use crate::error::{error_code, Error, Result};
use crate::hash::ContentHash;
use crate::model::Report;
use crate::registry::Resolution;
use crate::server::{ReportAck, UpdateService};

/// Operations the agent needs from the server.
#[async_trait]
pub trait UpdateTransport: Send + Sync + std::fmt::Debug {
    /// Ask for the best update from `current` on `channel`.
    async fn resolve(
        &self,
        device_id: &str,
        channel: &str,
        current: &Version,
        force_full: bool,
    ) -> Result<Resolution>;

    /// Fetch up to `len` bytes of a package starting at `offset`. May return
    /// fewer bytes than asked for, never more.
    async fn fetch_range(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Deliver a state report.
    async fn report(&self, report: &Report) -> Result<ReportAck>;
}

/// In-process transport over an [`UpdateService`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    service: Arc<UpdateService>,
}

impl LocalTransport {
    /// Wrap a service.
    #[must_use]
    pub fn new(service: Arc<UpdateService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl UpdateTransport for LocalTransport {
    async fn resolve(
        &self,
        device_id: &str,
        channel: &str,
        current: &Version,
        force_full: bool,
    ) -> Result<Resolution> {
        self.service.resolve(device_id, channel, current, force_full)
    }

    async fn fetch_range(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.service.package_range(hash, offset, len)
    }

    async fn report(&self, report: &Report) -> Result<ReportAck> {
        self.service.report(report.clone()).await
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// HTTP transport against a remote update server.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Client for the server at `base_url` (e.g. `http://updates:8780`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("slotwise-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{path}", self.base_url)
    }

    /// Turn a non-success response into a crate error.
    async fn error_from(resp: reqwest::Response) -> Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let parsed: Option<ErrorBody> = serde_json::from_str(&body).ok();
        let (code, message) = parsed.map_or_else(
            || (String::new(), body.clone()),
            |b| (b.code, b.message),
        );

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Error::network(format!("server returned {status}: {message}"));
        }
        match code.as_str() {
            error_code::CHANNEL_UNKNOWN => Error::ChannelUnknown {
                channel: message
                    .split('\'')
                    .nth(1)
                    .unwrap_or_default()
                    .to_string(),
            },
            error_code::NOT_FOUND => Error::NotFound { what: message },
            error_code::VALIDATION_FAILED => Error::Validation(message),
            _ => Error::network(format!("server returned {status}: {message}")),
        }
    }
}

#[async_trait]
impl UpdateTransport for HttpTransport {
    async fn resolve(
        &self,
        device_id: &str,
        channel: &str,
        current: &Version,
        force_full: bool,
    ) -> Result<Resolution> {
        let current = current.to_string();
        let mut query = vec![
            ("device", device_id),
            ("current_version", current.as_str()),
            ("channel", channel),
        ];
        if force_full {
            query.push(("full", "true"));
        }
        let resp = self.http.get(self.url("/resolve")).query(&query).send().await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn fetch_range(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let last = offset.saturating_add(len - 1);
        let resp = self
            .http
            .get(self.url(&format!("/packages/{hash}")))
            .header(RANGE, format!("bytes={offset}-{last}"))
            .send()
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                let start = resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(content_range_start);
                if start != Some(offset) {
                    return Err(Error::network(format!(
                        "server answered range at {start:?}, asked for {offset}"
                    )));
                }
                Ok(resp.bytes().await?.to_vec())
            }
            // Server ignored the range and sent everything.
            StatusCode::OK => {
                let body = resp.bytes().await?;
                let size = body.len() as u64;
                if offset >= size {
                    return Err(Error::RangeNotSatisfiable { offset, len, size });
                }
                let start = usize::try_from(offset).map_err(|_| Error::internal("offset overflow"))?;
                let end = usize::try_from(offset.saturating_add(len).min(size))
                    .map_err(|_| Error::internal("range overflow"))?;
                Ok(body[start..end].to_vec())
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let size = resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("bytes */"))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                Err(Error::RangeNotSatisfiable { offset, len, size })
            }
            _ => Err(Self::error_from(resp).await),
        }
    }

    async fn report(&self, report: &Report) -> Result<ReportAck> {
        let resp = self.http.post(self.url("/reports")).json(report).send().await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        Ok(resp.json().await?)
    }
}

/// Start offset from `bytes a-b/size`.
fn content_range_start(value: &str) -> Option<u64> {
    let range = value.strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::store::MemoryPackageStore;

    #[test]
    fn test_content_range_start() {
        assert_eq!(content_range_start("bytes 100-199/1000"), Some(100));
        assert_eq!(content_range_start("bytes */1000"), None);
        assert_eq!(content_range_start("items 1-2/3"), None);
    }

    #[test]
    fn test_http_url_join() {
        let transport = HttpTransport::new("http://updates:8780/", Duration::from_secs(5)).unwrap();
        assert_eq!(transport.url("/resolve"), "http://updates:8780/v1/resolve");
    }

    #[tokio::test]
    async fn test_local_transport_fetch_and_unknown_channel() {
        let service = Arc::new(UpdateService::new(
            Arc::new(Registry::in_memory().unwrap()),
            Arc::new(MemoryPackageStore::new()),
            4,
            4,
        ));
        let hash = service.store().put_bytes(b"0123456789").unwrap();
        let transport = LocalTransport::new(Arc::clone(&service));

        assert_eq!(transport.fetch_range(&hash, 2, 100).await.unwrap(), b"2345");

        let err = transport
            .resolve("dev-1", "nightly", &Version::new(1, 0, 0), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelUnknown { .. }));
    }
}
