//! Local control API for a running agent.
//!
//! Bound to loopback by default. The device's application posts its health
//! verdict here during the confirmation window; operators trigger checks,
//! apply staged updates and read status.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{AgentHandle, AgentStatus, CheckOutcome};
use crate::error::{Error, Result};

/// Body of `POST /health`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthSignal {
    /// Whether the running version works.
    pub healthy: bool,
}

/// Body of `POST /cancel`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Whether a session was cancelled.
    pub cancelled: bool,
}

/// Build the control router.
pub fn router(handle: AgentHandle) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/check", post(check))
        .route("/apply", post(apply))
        .route("/cancel", post(cancel))
        .route("/health", post(health))
        .with_state(handle)
}

/// Serve the control API on `bind` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(
    handle: AgentHandle,
    bind: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Agent control API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status(State(handle): State<AgentHandle>) -> Json<AgentStatus> {
    Json(handle.status())
}

/// Starts a check in the background: `202` if started, `409` if a session
/// is already running.
async fn check(State(handle): State<AgentHandle>) -> Result<Response> {
    let Some(rx) = handle.start_check().await? else {
        return Ok(busy());
    };
    tokio::spawn(async move {
        match rx.await {
            Ok(Ok(outcome)) => info!(outcome = ?outcome, "Requested check finished"),
            Ok(Err(err)) => error!("Requested check failed: {err}"),
            Err(_) => error!("Agent stopped during requested check"),
        }
    });
    Ok((StatusCode::ACCEPTED, Json(handle.status())).into_response())
}

/// Applies the staged update and waits for the outcome.
async fn apply(State(handle): State<AgentHandle>) -> Result<Response> {
    match handle.apply().await? {
        CheckOutcome::Busy => Ok(busy()),
        completed @ CheckOutcome::Completed { .. } => Ok(Json(completed).into_response()),
    }
}

async fn cancel(State(handle): State<AgentHandle>) -> Result<Json<CancelResponse>> {
    let cancelled = handle.cancel().await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn health(
    State(handle): State<AgentHandle>,
    Json(signal): Json<HealthSignal>,
) -> Result<StatusCode> {
    handle.report_health(signal.healthy)?;
    Ok(StatusCode::ACCEPTED)
}

fn busy() -> Response {
    (StatusCode::CONFLICT, Json(CheckOutcome::Busy)).into_response()
}

/// Client for a running agent's control API, used by the `slotwise agent`
/// subcommands.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
}

/// Result of `POST /check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStarted {
    /// The check is running in the agent.
    Started(AgentStatus),
    /// A session was already running.
    Busy,
}

impl ControlClient {
    /// Client for the control API at `bind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(bind: SocketAddr, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: format!("http://{bind}"),
        })
    }

    /// `GET /status`.
    ///
    /// # Errors
    ///
    /// Returns a network error if the agent is not reachable.
    pub async fn status(&self) -> Result<AgentStatus> {
        let resp = self.http.get(self.url("/status")).send().await?;
        Self::json(resp).await
    }

    /// `POST /check`.
    ///
    /// # Errors
    ///
    /// Returns a network error if the agent is not reachable.
    pub async fn check(&self) -> Result<CheckStarted> {
        let resp = self.http.post(self.url("/check")).send().await?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(CheckStarted::Busy);
        }
        Self::json(resp).await.map(CheckStarted::Started)
    }

    /// `POST /apply`; waits for the update to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is staged or the agent is not reachable.
    pub async fn apply(&self) -> Result<CheckOutcome> {
        let resp = self.http.post(self.url("/apply")).send().await?;
        if resp.status() == StatusCode::CONFLICT {
            let body = resp.text().await.unwrap_or_default();
            return match serde_json::from_str::<CheckOutcome>(&body) {
                Ok(outcome) => Ok(outcome),
                Err(_) => Err(Self::rejected(StatusCode::CONFLICT, &body)),
            };
        }
        Self::json(resp).await
    }

    /// `POST /cancel`.
    ///
    /// # Errors
    ///
    /// Returns a network error if the agent is not reachable.
    pub async fn cancel(&self) -> Result<bool> {
        let resp = self.http.post(self.url("/cancel")).send().await?;
        Self::json::<CancelResponse>(resp).await.map(|r| r.cancelled)
    }

    /// `POST /health`.
    ///
    /// # Errors
    ///
    /// Returns a network error if the agent is not reachable.
    pub async fn health(&self, healthy: bool) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/health"))
            .json(&HealthSignal { healthy })
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::rejected(status, &body));
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::rejected(status, &body));
        }
        Ok(resp.json().await?)
    }

    fn rejected(status: StatusCode, body: &str) -> Error {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| body.to_string());
        if status.is_server_error() {
            Error::network(format!("agent returned {status}: {message}"))
        } else {
            Error::validation(format!("agent returned {status}: {message}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentOptions, Backoff, LocalTransport, NoopActivator};
    use crate::model::UpdateState;
    use crate::registry::Registry;
    use crate::server::UpdateService;
    use crate::store::MemoryPackageStore;
    use crate::trust::ReleaseSigner;
    use axum::body::Body;
    use axum::http::Request;
    use semver::Version;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn handle(dir: &tempfile::TempDir) -> AgentHandle {
        let registry = Arc::new(Registry::in_memory().unwrap());
        let service = Arc::new(UpdateService::new(
            registry,
            Arc::new(MemoryPackageStore::new()),
            4,
            1 << 20,
        ));
        let options = AgentOptions {
            device_id: "dev-1".to_string(),
            channel: "stable".to_string(),
            data_dir: dir.path().to_path_buf(),
            trusted_keys: ReleaseSigner::generate().trusted_keys(),
            download_chunk_bytes: 1024,
            backoff: Backoff {
                max_attempts: 1,
                base: Duration::from_millis(1),
                max: Duration::from_millis(1),
            },
            max_verify_attempts: 1,
            confirmation_window: Duration::from_secs(1),
            max_package_bytes: 1 << 20,
            auto_apply: true,
        };
        Agent::provision(&options, Version::new(1, 0, 0), b"factory").unwrap();
        let agent = Agent::open(
            options,
            Arc::new(LocalTransport::new(service)),
            Arc::new(NoopActivator),
        )
        .unwrap();
        agent.spawn().0
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_provisioned_version() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(handle(&dir));
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["device_id"], "dev-1");
        assert_eq!(body["current_version"], "1.0.0");
        assert_eq!(body["state"], "idle");
        assert_eq!(body["active_slot"], "a");
    }

    #[tokio::test]
    async fn test_apply_without_stage_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(handle(&dir));
        let response = app.oneshot(post("/apply")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_check_is_accepted_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle(&dir);
        let response = router(handle.clone()).oneshot(post("/check")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // The channel has no releases, so the session fails quickly.
        handle
            .wait_for_state(UpdateState::Failed, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(handle(&dir));

        let response = app
            .clone()
            .oneshot(
                Request::post("/health")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"healthy": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app.oneshot(post("/cancel")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["cancelled"], false);
    }
}
