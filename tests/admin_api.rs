//! Admin HTTP surface driven through the router without binding a socket.

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use extdb_sync::registry::DEFAULT_TARGET_NAME;
use extdb_sync::server::{router, AppState};
use extdb_sync::testing::Harness;
use serde_json::{json, Value};
use tower::ServiceExt;

const SECRET: &str = "cron-secret";
const BASE: &str = "/api/v1/internal/external-db-sync";

fn app(h: &Harness) -> Router {
    router(AppState::new(h.engine.clone(), SECRET, Duration::from_secs(5)))
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {SECRET}"));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("valid request")
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.expect("router is infallible");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("readable body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn test_health_needs_no_secret() {
    let h = Harness::new();
    let req = Request::get("/health").body(Body::empty()).unwrap();
    let (status, body) = send(app(&h), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_admin_routes_reject_missing_or_wrong_secret() {
    let h = Harness::new();

    let req = Request::get(format!("{BASE}/fusebox"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&h), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["ok"], false);

    let req = Request::post(format!("{BASE}/sequencer"))
        .header(header::AUTHORIZATION, "Bearer not-the-secret")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(&h), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.store.pending_count(), 0);
}

#[tokio::test]
async fn test_sequencer_then_poller_over_http() {
    let h = Harness::new();
    let (conn, target) = h.postgres_target("warehouse-db");
    let tenancy = h.tenancy_with_targets(&[("warehouse", &conn)]);
    let user = h.store.create_user(tenancy, "a@x.com", Some("Ada"));

    let (status, body) = send(
        app(&h),
        request(Method::POST, &format!("{BASE}/sequencer?maxDurationMs=1000"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["assigned"], 2);
    assert_eq!(body["stopped_by_fusebox"], false);

    let (status, body) = send(
        app(&h),
        request(
            Method::GET,
            &format!("{BASE}/poller?tenancyId={tenancy}"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["iterations"], 1);
    assert_eq!(body["targets_synced"], 2);
    assert_eq!(body["targets_failed"], 0);
    assert!(target.user(tenancy, user).is_some());
}

#[tokio::test]
async fn test_invalid_run_parameters() {
    let h = Harness::new();
    for uri in [
        format!("{BASE}/sequencer?maxDurationMs=0"),
        format!("{BASE}/poller?maxDurationMs=-1"),
        format!("{BASE}/poller?tenancyId=not-a-uuid"),
        format!("{BASE}/status"),
    ] {
        let (status, body) = send(app(&h), request(Method::GET, &uri, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["ok"], false);
    }

    let unknown = uuid::Uuid::new_v4();
    for uri in [
        format!("{BASE}/poller?tenancyId={unknown}"),
        format!("{BASE}/status?tenancyId={unknown}"),
    ] {
        let (status, _) = send(app(&h), request(Method::GET, &uri, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn test_fusebox_round_trip_over_http() {
    let h = Harness::new();

    let (status, body) = send(app(&h), request(Method::GET, &format!("{BASE}/fusebox"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "sequencer_enabled": true, "poller_enabled": true }));

    let (status, body) = send(
        app(&h),
        request(
            Method::POST,
            &format!("{BASE}/fusebox"),
            Some(json!({ "sequencer_enabled": false })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "sequencer_enabled": false, "poller_enabled": true }));

    let (_, body) = send(app(&h), request(Method::GET, &format!("{BASE}/fusebox"), None)).await;
    assert_eq!(body["sequencer_enabled"], false);

    let tenancy = h.tenancy_with_targets(&[]);
    h.store.create_user(tenancy, "a@x.com", None);
    let (_, body) = send(app(&h), request(Method::POST, &format!("{BASE}/sequencer"), None)).await;
    assert_eq!(body["stopped_by_fusebox"], true);
    assert_eq!(body["assigned"], 0);
}

#[tokio::test]
async fn test_status_over_http() {
    let h = Harness::new();
    let (conn, _) = h.postgres_target("warehouse-db");
    let tenancy = h.tenancy_with_targets(&[("warehouse", &conn)]);
    h.store.create_user(tenancy, "a@x.com", None);
    h.engine.run_sequencer(None).await.unwrap();

    let (status, body) = send(
        app(&h),
        request(Method::GET, &format!("{BASE}/status?tenancyId={tenancy}"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let targets = body["targets"].as_array().unwrap();
    assert_eq!(targets.len(), 2);
    assert!(!body.to_string().contains("secret"));
}

#[tokio::test]
async fn test_external_databases_override() {
    let h = Harness::new();
    let (conn, _) = h.postgres_target("warehouse-db");
    let tenancy = h.tenancy_with_targets(&[("warehouse", &conn)]);
    let uri = format!("/api/v1/internal/tenancies/{tenancy}/db-sync/external-databases");

    let (status, body) = send(app(&h), request(Method::GET, &uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["warehouse"]["type"], "postgres");
    assert_eq!(body[DEFAULT_TARGET_NAME]["type"], "clickhouse");

    let patch = json!({
        "warehouse": null,
        "analytics": { "type": "clickhouse", "connectionString": "http://ch:8123/db" },
        (DEFAULT_TARGET_NAME): { "type": "postgres", "connectionString": "postgres://evil/db" },
    });
    let (status, body) = send(app(&h), request(Method::PATCH, &uri, Some(patch))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("warehouse").is_none());
    assert_eq!(body["analytics"]["type"], "clickhouse");
    assert_eq!(body[DEFAULT_TARGET_NAME], json!({ "type": "clickhouse" }));

    let (_, body) = send(app(&h), request(Method::GET, &uri, None)).await;
    assert_eq!(body["analytics"]["connectionString"], "http://ch:8123/db");
    assert!(body.get("warehouse").is_none());

    let bad = json!({ "legacy": { "type": "mysql", "connectionString": "mysql://h/db" } });
    let (status, body) = send(app(&h), request(Method::PATCH, &uri, Some(bad))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);

    let missing = format!(
        "/api/v1/internal/tenancies/{}/db-sync/external-databases",
        uuid::Uuid::new_v4()
    );
    let (status, _) = send(app(&h), request(Method::GET, &missing, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_patches_keep_every_update() {
    let h = Harness::new();
    let tenancy = h.tenancy_with_targets(&[]);
    let uri = format!("/api/v1/internal/tenancies/{tenancy}/db-sync/external-databases");

    let patches = (0..4).map(|i| {
        let body = json!({
            (format!("replica-{i}")): { "type": "postgres", "connectionString": format!("postgres://h/db{i}") }
        });
        tokio::spawn(send(app(&h), request(Method::PATCH, &uri, Some(body))))
    });
    for handle in futures::future::join_all(patches).await {
        let (status, _) = handle.expect("patch task");
        assert_eq!(status, StatusCode::OK);
    }

    let (_, body) = send(app(&h), request(Method::GET, &uri, None)).await;
    for i in 0..4 {
        assert_eq!(body[format!("replica-{i}")]["type"], "postgres", "replica-{i}");
    }
}
