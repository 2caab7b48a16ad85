use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;


use devpoll::api::router;
use devpoll::scheduler::TaskState;
use devpoll::session::{Script, ScriptedConnector};
use test_harness::{
    assert_eventually, device, expected_output, healthy_device, silent_device, slow_device,
    test_api, wait_for_terminal, TestApi, SECRET,
};

const STEP: Duration = Duration::from_secs(2);

fn two_routers() -> TestApi {
    let connector = ScriptedConnector::new()
        .with_target("10.0.0.1", healthy_device("R1", true))
        .with_target("10.0.0.2", healthy_device("R2", false));
    test_api(
        vec![
            device(1, "R1", "10.0.0.1", "core"),
            device(2, "R2", "10.0.0.2", "core"),
            device(3, "S1", "10.0.0.3", "access"),
        ],
        connector,
        true,
        100,
        STEP,
    )
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Option<String>, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let location = response
        .headers()
        .get(header::LOCATION)
        .map(|v| v.to_str().unwrap().to_string());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, location, json)
}

/// Submit a version request and return the status location.
async fn submit(app: &Router, uri: &str) -> String {
    let (status, location, body) = get(app, uri).await;
    assert_eq!(status, StatusCode::ACCEPTED, "body: {body}");
    let location = location.expect("202 carries a Location header");
    assert_eq!(location, format!("/status/{}", body["token"].as_str().unwrap()));
    location
}

#[tokio::test]
async fn test_list_devices() {
    let api = two_routers();
    let app = router(api.state);

    let (status, _, json) = get(&app, "/devices/").await;

    assert_eq!(status, StatusCode::OK);
    let urls: Vec<&str> = json["device"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(urls, vec!["/devices/1", "/devices/2", "/devices/3"]);
}

#[tokio::test]
async fn test_get_device() {
    let api = two_routers();
    let app = router(api.state);

    let (status, _, json) = get(&app, "/devices/2").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["self_url"], "/devices/2");
    assert_eq!(json["hostname"], "R2");
    assert_eq!(json["mgmt_ip"], "10.0.0.2");
    assert_eq!(json["role"], "core");
}

#[tokio::test]
async fn test_get_unknown_device_is_404() {
    let api = two_routers();
    let app = router(api.state);

    let (status, _, json) = get(&app, "/devices/99").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["status"], 404);
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn test_version_is_accepted_then_completed_then_gone() {
    let api = two_routers();
    let registry = api.registry.clone();
    let app = router(api.state);

    let location = submit(&app, "/devices/1/version").await;
    let token = location.trim_start_matches("/status/").parse().unwrap();
    wait_for_terminal(&registry, &token, Duration::from_secs(5)).await;

    let (status, _, json) = get(&app, &location).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["device"], "R1");
    assert_eq!(json["target"], "10.0.0.1");
    assert_eq!(json["version"], expected_output());

    // Result is handed out once.
    let (status, _, _) = get(&app, &location).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_status_is_202_while_session_runs() {
    let connector =
        ScriptedConnector::new().with_target("10.0.0.1", slow_device("R1", Duration::from_millis(300)));
    let api = test_api(
        vec![device(1, "R1", "10.0.0.1", "core")],
        connector,
        true,
        100,
        STEP,
    );
    let app = router(api.state);

    let location = submit(&app, "/devices/1/version").await;

    let (status, poll_location, json) = get(&app, &location).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(poll_location.as_deref(), Some(location.as_str()));
    assert!(json["state"] == "pending" || json["state"] == "running");

    let app_ref = &app;
    let location_ref = location.as_str();
    assert_eventually(
        || async move { get(app_ref, location_ref).await.0 == StatusCode::OK },
        Duration::from_secs(5),
        "session should finish",
    )
    .await;
}

#[tokio::test]
async fn test_results_are_repeatable_without_auto_delete() {
    let connector = ScriptedConnector::new().with_target("10.0.0.1", healthy_device("R1", false));
    let api = test_api(
        vec![device(1, "R1", "10.0.0.1", "core")],
        connector,
        false,
        100,
        STEP,
    );
    let registry = api.registry.clone();
    let app = router(api.state);

    let location = submit(&app, "/devices/1/version").await;
    let token = location.trim_start_matches("/status/").parse().unwrap();
    wait_for_terminal(&registry, &token, Duration::from_secs(5)).await;

    let (first, _, a) = get(&app, &location).await;
    let (second, _, b) = get(&app, &location).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(a, b);
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn test_failed_session_reports_error_body() {
    let bad_login = Script::new()
        .emit("Password: ")
        .expect(SECRET)
        .emit("\r\nPermission denied, please try again.\r\n");
    let connector = ScriptedConnector::new().with_target("10.0.0.1", bad_login);
    let api = test_api(
        vec![device(1, "R1", "10.0.0.1", "core")],
        connector,
        true,
        100,
        STEP,
    );
    let registry = api.registry.clone();
    let app = router(api.state);

    let location = submit(&app, "/devices/1/version").await;
    let token = location.trim_start_matches("/status/").parse().unwrap();
    wait_for_terminal(&registry, &token, Duration::from_secs(5)).await;

    let (status, _, json) = get(&app, &location).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["status"], 500);
    assert_eq!(json["error"], "authentication");
    assert!(json["message"].as_str().unwrap().contains("10.0.0.1"));
}

#[tokio::test]
async fn test_unreachable_device_fails_task() {
    let api = test_api(
        vec![device(1, "R1", "10.0.0.9", "core")],
        ScriptedConnector::new(),
        true,
        100,
        STEP,
    );
    let registry = api.registry.clone();
    let app = router(api.state);

    let location = submit(&app, "/devices/1/version").await;
    let token = location.trim_start_matches("/status/").parse().unwrap();
    wait_for_terminal(&registry, &token, Duration::from_secs(5)).await;

    let (status, _, json) = get(&app, &location).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "connect");
}

#[tokio::test]
async fn test_silent_device_fails_task_with_timeout() {
    let step = Duration::from_millis(100);
    let connector = ScriptedConnector::new().with_target("10.0.0.1", silent_device());
    let api = test_api(
        vec![device(1, "R1", "10.0.0.1", "core")],
        connector,
        true,
        100,
        step,
    );
    let registry = api.registry.clone();
    let app = router(api.state);

    let start = Instant::now();
    let location = submit(&app, "/devices/1/version").await;
    let token = location.trim_start_matches("/status/").parse().unwrap();
    let task = wait_for_terminal(&registry, &token, step + Duration::from_millis(500)).await;

    assert!(start.elapsed() >= step);
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(registry.count_in_state(TaskState::Running).await, 0);

    let (status, _, json) = get(&app, &location).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["status"], 500);
    assert_eq!(json["error"], "timeout");
}

#[tokio::test]
async fn test_version_for_unknown_device_creates_no_task() {
    let api = two_routers();
    let registry = api.registry.clone();
    let app = router(api.state);

    let (status, location, _) = get(&app, "/devices/42/version").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(location.is_none());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_unknown_token_is_404() {
    let api = two_routers();
    let app = router(api.state);

    let (status, _, _) = get(&app, "/status/0123456789abcdef0123456789abcdef").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = get(&app, "/status/not-a-token").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_role_version_collects_every_device() {
    let api = two_routers();
    let registry = api.registry.clone();
    let connector = api.connector.clone();
    let app = router(api.state);

    let location = submit(&app, "/devices/core/version").await;
    let token = location.trim_start_matches("/status/").parse().unwrap();
    wait_for_terminal(&registry, &token, Duration::from_secs(5)).await;

    let (status, _, json) = get(&app, &location).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["role"], "core");
    assert_eq!(json["devices"]["R1"], expected_output());
    assert_eq!(json["devices"]["R2"], expected_output());
    assert!(json["devices"].get("S1").is_none());
    assert_eq!(connector.connections(), 2);
}

#[tokio::test]
async fn test_role_without_devices_is_404() {
    let api = two_routers();
    let app = router(api.state);

    let (status, _, json) = get(&app, "/devices/edge/version").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn test_full_registry_is_503() {
    let connector =
        ScriptedConnector::new().with_target("10.0.0.1", slow_device("R1", Duration::from_secs(1)));
    let api = test_api(
        vec![device(1, "R1", "10.0.0.1", "core")],
        connector,
        true,
        1,
        STEP,
    );
    let app = router(api.state);

    submit(&app, "/devices/1/version").await;
    let (status, location, json) = get(&app, "/devices/1/version").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(location.is_none());
    assert_eq!(json["error"], "unavailable");
}

#[tokio::test]
async fn test_concurrent_pollers_get_result_once() {
    let api = two_routers();
    let registry = api.registry.clone();
    let app = router(api.state);

    let location = submit(&app, "/devices/2/version").await;
    let token = location.trim_start_matches("/status/").parse().unwrap();
    wait_for_terminal(&registry, &token, Duration::from_secs(5)).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let app = app.clone();
        let location = location.clone();
        handles.push(tokio::spawn(async move { get(&app, &location).await.0 }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::OK => ok += 1,
            StatusCode::NOT_FOUND => {}
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(ok, 1);
}
