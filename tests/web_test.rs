//! Integration tests for the JSON API.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{member, members_payload, setup_community, COMMUNITY};
use skool_insight::config::Config;
use skool_insight::db::Database;
use skool_insight::web::{create_app, AppState};

fn test_app(db: Database) -> Router {
    let config = Config {
        database_path: PathBuf::from("unused"),
        web_host: "127.0.0.1".to_string(),
        web_port: 0,
        log_json: false,
    };
    create_app(AppState {
        db,
        config: Arc::new(config),
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    serde_json::from_slice(&bytes).expect("Body is not JSON")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (db, _temp_dir) = setup_community().await;
    let app = test_app(db);

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn tasks_endpoint_returns_a_plan() {
    let (db, _temp_dir) = setup_community().await;
    let app = test_app(db);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/tasks")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let plan = body_json(response).await;
    assert_eq!(plan["phase"], "primary");
    assert_eq!(plan["tasks"].as_array().unwrap().len(), 3);
    assert_eq!(plan["tasks"][0]["community"], COMMUNITY);
}

#[tokio::test]
async fn posting_a_result_records_and_extracts() {
    let (db, _temp_dir) = setup_community().await;
    let app = test_app(db.clone());

    let envelope = json!({
        "task": {
            "type": "members",
            "community": COMMUNITY,
            "page_param": 1,
        },
        "result": {
            "ok": true,
            "data": members_payload(vec![member("u1", "Ada")], 1),
        },
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/results")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(envelope.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["counts"]["users"], 1);

    let users = skool_insight::db::latest_users(db.pool(), COMMUNITY)
        .await
        .unwrap();
    assert_eq!(users.len(), 1);
}

#[tokio::test]
async fn unknown_fetch_type_is_rejected() {
    let (db, _temp_dir) = setup_community().await;
    let app = test_app(db);

    let envelope = json!({
        "task": {"type": "telepathy", "community": COMMUNITY},
        "result": {"ok": true, "data": {}},
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/results")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(envelope.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn settings_routes_roundtrip() {
    let (db, _temp_dir) = setup_community().await;
    let app = test_app(db);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/settings/stale_hours.members")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"value": "6"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/settings/stale_hours.members")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["value"], "6");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/settings/never_set")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn member_filter_route_returns_members() {
    let (db, _temp_dir) = setup_community().await;

    let env = common::envelope(
        skool_insight::db::FetchType::Members,
        COMMUNITY,
        members_payload(vec![member("u1", "Ada")], 1),
    );
    common::ingest(&db, &env, common::NOW).await;

    let app = test_app(db);
    let request = json!({"communitySlug": COMMUNITY});

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/members/filter")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["members"][0]["name"], "Ada");
}
