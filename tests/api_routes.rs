use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use fleetd::adapters::mock::MockRuntime;
use fleetd::adapters::ports::PortRange;
use fleetd::adapters::registry::InMemoryRegistry;
use fleetd::api::facade::CloudApi;
use fleetd::api::routes::create_router;
use fleetd::core::controller::{ControllerSettings, FleetController};
use fleetd::core::domain::GroupSpec;

async fn setup() -> (Router, FleetController, MockRuntime) {
    let runtime = MockRuntime::new(PortRange::new(30000, 30010).unwrap());
    let group = GroupSpec {
        name_prefix: "lobby".into(),
        image: "lobby".into(),
        image_tag: "latest".into(),
        min_instances: 1,
        max_instances: 3,
        max_players_per_instance: 20,
        downscale_if_empty: true,
    };
    let controller = FleetController::new(
        vec![group],
        Arc::new(runtime.clone()),
        Arc::new(InMemoryRegistry::new()),
        ControllerSettings {
            registration_delay: Duration::ZERO,
            ..ControllerSettings::default()
        },
    );
    controller.start().await.unwrap();
    (create_router(CloudApi::new(controller.clone())), controller, runtime)
}

async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let resp = app
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn health_is_ok() {
    let (app, _, _) = setup().await;
    let (status, body) = call(app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn lists_running_instances() {
    let (app, controller, _) = setup().await;
    let (status, body) = call(app, "GET", "/api/instances").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!(controller.running_instance_names().await));
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn known_and_unknown_instances() {
    let (app, controller, _) = setup().await;
    let name = controller.running_instance_names().await.remove(0);

    let (status, body) = call(app.clone(), "GET", &format!("/api/instances/{name}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], name.as_str());
    assert_eq!(body["state"], "running");
    assert_eq!(body["group"], "lobby");

    let (status, body) = call(app, "GET", "/api/instances/lobby-nothere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("lobby-nothere"));
}

#[tokio::test]
async fn restart_swaps_the_instance() {
    let (app, controller, runtime) = setup().await;
    let name = controller.running_instance_names().await.remove(0);

    let (status, body) = call(app.clone(), "POST", &format!("/api/instances/{name}/restart")).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["name"], name.as_str());
    assert!(!controller.is_known(&name).await);
    assert_eq!(runtime.running_count(), 1);

    let (status, _) = call(app, "POST", "/api/instances/lobby-nothere/restart").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn groups_report_live_counts() {
    let (app, _, _) = setup().await;
    let (status, body) = call(app, "GET", "/api/groups").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name_prefix"], "lobby");
    assert_eq!(body[0]["live"], 1);
}

#[tokio::test]
async fn reconcile_endpoint_runs_a_tick() {
    let (app, _, _) = setup().await;
    let (status, body) = call(app, "POST", "/api/reconcile").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["skipped"], false);
    assert_eq!(body["created"], 0);
}

#[tokio::test]
async fn reconcile_conflicts_while_a_tick_runs() {
    let (app, controller, runtime) = setup().await;
    runtime.delete_externally(&controller.instances().await[0].container_id);
    runtime.set_create_delay(Duration::from_millis(200));

    let background = controller.clone();
    let tick = tokio::spawn(async move { background.reconcile().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = call(app, "POST", "/api/reconcile").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["skipped"], true);
    assert!(!tick.await.unwrap().skipped);
}
