//! The `/v1` update API, driven through the router without a socket.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use slotwise::model::{
    DeviceRecord, PackageKind, ReasonCode, Release, Report, SessionOutcome, UpdateSession,
    UpdateState,
};
use slotwise::registry::Resolution;
use slotwise::server::http::router;
use slotwise::server::ReportAck;
use tower::ServiceExt;
use uuid::Uuid;

use common::{image, v, Fleet, CHANNEL, DEVICE};

async fn send(fleet: &Fleet, request: Request<Body>) -> Response {
    router(std::sync::Arc::clone(&fleet.service))
        .oneshot(request)
        .await
        .unwrap()
}

async fn get(fleet: &Fleet, uri: &str) -> Response {
    send(fleet, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn error_code(response: Response) -> String {
    let body: serde_json::Value = body_json(response).await;
    body["code"].as_str().unwrap().to_string()
}

fn post_report(report: &Report) -> Request<Body> {
    Request::post("/v1/reports")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(report).unwrap()))
        .unwrap()
}

fn report(session_id: Uuid, outcome: SessionOutcome, reason: Option<ReasonCode>) -> Report {
    Report {
        session_id,
        device_id: DEVICE.to_string(),
        target_version: v("1.1.0"),
        package_hash: None,
        package_kind: Some(PackageKind::Full),
        state: match outcome {
            SessionOutcome::InProgress => UpdateState::Downloading,
            SessionOutcome::Success | SessionOutcome::RolledBack => UpdateState::Active,
            SessionOutcome::Failed => UpdateState::Failed,
        },
        outcome,
        reason,
        current_version: match outcome {
            SessionOutcome::Success => v("1.1.0"),
            _ => v("1.0.0"),
        },
        last_known_good_version: None,
    }
}

#[tokio::test]
async fn test_healthz() {
    let fleet = Fleet::new();
    let response = get(&fleet, "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_resolve_offers_delta_then_up_to_date() {
    let fleet = Fleet::new();
    fleet.publish("1.0.0");
    fleet.publish("1.1.0");

    let response = get(
        &fleet,
        "/v1/resolve?device=dev-1&channel=stable&current_version=1.0.0",
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let resolution: Resolution = body_json(response).await;
    let update = resolution.update().unwrap();
    assert_eq!(update.release.version, v("1.1.0"));
    assert_eq!(update.package.kind, PackageKind::Delta);

    let response = get(
        &fleet,
        "/v1/resolve?device=dev-1&channel=stable&current_version=1.0.0&full=true",
    )
    .await;
    let resolution: Resolution = body_json(response).await;
    assert_eq!(resolution.update().unwrap().package.kind, PackageKind::Full);

    let response = get(
        &fleet,
        "/v1/resolve?device=dev-1&channel=stable&current_version=1.1.0",
    )
    .await;
    let body: serde_json::Value = body_json(response).await;
    assert_eq!(body["status"], "up_to_date");
}

#[tokio::test]
async fn test_resolve_errors() {
    let fleet = Fleet::new();
    fleet.publish("1.0.0");

    let response = get(
        &fleet,
        "/v1/resolve?device=dev-1&channel=nightly&current_version=1.0.0",
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "CHANNEL_UNKNOWN");

    let response = get(
        &fleet,
        "/v1/resolve?device=dev-1&channel=stable&current_version=one",
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "VALIDATION_FAILED");

    let response = get(
        &fleet,
        "/v1/resolve?device=..bad&channel=stable&current_version=1.0.0",
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_package_download_whole_and_ranged() {
    let fleet = Fleet::new();
    let entry = fleet.publish("1.0.0");
    let hash = entry.full_package().unwrap().content_hash;
    let expected = image("1.0.0");
    let size = expected.len();

    let response = get(&fleet, &format!("/v1/packages/{hash}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(body_bytes(response).await, expected);

    let request = Request::get(format!("/v1/packages/{hash}"))
        .header(header::RANGE, "bytes=100-199")
        .body(Body::empty())
        .unwrap();
    let response = send(&fleet, request).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes 100-199/{size}").as_str()
    );
    assert_eq!(body_bytes(response).await, expected[100..200]);

    // Open-ended range resumes to the end.
    let request = Request::get(format!("/v1/packages/{hash}"))
        .header(header::RANGE, format!("bytes={}-", size - 10))
        .body(Body::empty())
        .unwrap();
    let response = send(&fleet, request).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_bytes(response).await, expected[size - 10..]);
}

#[tokio::test]
async fn test_package_range_past_end_is_unsatisfiable() {
    let fleet = Fleet::new();
    let entry = fleet.publish("1.0.0");
    let hash = entry.full_package().unwrap().content_hash;
    let size = image("1.0.0").len();

    let request = Request::get(format!("/v1/packages/{hash}"))
        .header(header::RANGE, format!("bytes={size}-"))
        .body(Body::empty())
        .unwrap();
    let response = send(&fleet, request).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes */{size}").as_str()
    );
    assert_eq!(error_code(response).await, "RANGE_NOT_SATISFIABLE");
}

#[tokio::test]
async fn test_unknown_package_is_not_found() {
    let fleet = Fleet::new();
    let hash = slotwise::ContentHash::of(b"never stored");
    let response = get(&fleet, &format!("/v1/packages/{hash}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "NOT_FOUND");

    let response = get(&fleet, "/v1/packages/not-a-hash").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_reports_update_device_and_session() {
    let fleet = Fleet::new();
    let session_id = Uuid::new_v4();

    let response = send(
        &fleet,
        post_report(&report(session_id, SessionOutcome::InProgress, None)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack: ReportAck = body_json(response).await;
    assert!(!ack.replayed);
    assert_eq!(ack.session.outcome, SessionOutcome::InProgress);

    let response = get(&fleet, &format!("/v1/devices/{DEVICE}")).await;
    let device: DeviceRecord = body_json(response).await;
    assert_eq!(device.update_status, UpdateState::Downloading);
    assert_eq!(device.current_version, v("1.0.0"));

    let response = send(
        &fleet,
        post_report(&report(session_id, SessionOutcome::Success, None)),
    )
    .await;
    let ack: ReportAck = body_json(response).await;
    assert!(!ack.replayed);

    let response = get(&fleet, &format!("/v1/sessions/{session_id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let session: UpdateSession = body_json(response).await;
    assert_eq!(session.outcome, SessionOutcome::Success);
    assert_eq!(session.package_kind, Some(PackageKind::Full));

    let response = get(&fleet, &format!("/v1/devices/{DEVICE}")).await;
    let device: DeviceRecord = body_json(response).await;
    assert_eq!(device.current_version, v("1.1.0"));
    assert_eq!(device.update_status, UpdateState::Active);

    // Replays of a finished session are acknowledged without effect.
    let response = send(
        &fleet,
        post_report(&report(
            session_id,
            SessionOutcome::Failed,
            Some(ReasonCode::NetworkFailure),
        )),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack: ReportAck = body_json(response).await;
    assert!(ack.replayed);
    assert_eq!(ack.session.outcome, SessionOutcome::Success);
}

#[tokio::test]
async fn test_malformed_reports_are_rejected() {
    let fleet = Fleet::new();

    let response = send(
        &fleet,
        post_report(&report(Uuid::new_v4(), SessionOutcome::Failed, None)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "VALIDATION_FAILED");

    let response = send(
        &fleet,
        post_report(&report(
            Uuid::new_v4(),
            SessionOutcome::Success,
            Some(ReasonCode::ApplyFailure),
        )),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::post("/v1/reports")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"device_id\":\"dev-1\"}"))
        .unwrap();
    let response = send(&fleet, request).await;
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_unknown_device_and_session() {
    let fleet = Fleet::new();

    let response = get(&fleet, "/v1/devices/ghost").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "NOT_FOUND");

    let response = get(&fleet, &format!("/v1/sessions/{}", Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&fleet, "/v1/sessions/not-a-uuid").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_list_releases_includes_retired() {
    let fleet = Fleet::new();
    fleet.publish("1.0.0");
    fleet.publish("1.1.0");
    fleet.registry.retire(CHANNEL, &v("1.1.0")).unwrap();

    let response = get(&fleet, "/v1/channels/stable/releases").await;
    assert_eq!(response.status(), StatusCode::OK);
    let releases: Vec<Release> = body_json(response).await;
    let listed: Vec<_> = releases
        .iter()
        .map(|r| (r.version.to_string(), r.available))
        .collect();
    assert!(listed.contains(&("1.0.0".to_string(), true)));
    assert!(listed.contains(&("1.1.0".to_string(), false)));

    let response = get(&fleet, "/v1/channels/nightly/releases").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "CHANNEL_UNKNOWN");
}
