//! JSON API consumed by the browser extension and the local frontend.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::db::{self, Database};
use crate::extract::{self, FetchResultEnvelope};
use crate::filter::{self, MemberFilter};
use crate::planner;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
}

/// Start the web server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn serve(config: Config, db: Database) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.web_host, config.web_port)
        .parse()
        .context("Invalid web server address")?;

    let state = AppState {
        db,
        config: Arc::new(config),
    };

    let app = create_app(state);

    info!(addr = %addr, "Starting web server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind web server")?;

    axum::serve(listener, app).await.context("Web server error")?;

    Ok(())
}

/// Create the main application router.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", get(get_tasks))
        .route("/api/results", post(post_result))
        .route("/api/members/filter", post(filter_members))
        .route("/api/settings/:key", get(get_setting).put(put_setting))
        .route("/api/other-communities", get(other_communities))
        .route("/api/maintenance/reset", post(maintenance_reset))
        .route(
            "/api/maintenance/reset-failed-about",
            post(maintenance_reset_failed_about),
        )
        .route("/api/maintenance/reextract", post(maintenance_reextract))
        .route("/healthz", get(health))
        // The extension calls from a browser origin, so CORS stays open;
        // the server only binds loopback by default.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ========== Task planning ==========

async fn get_tasks(State(state): State<AppState>) -> Response {
    match planner::generate_plan(state.db.pool(), now()).await {
        Ok(plan) => Json(plan).into_response(),
        Err(e) => {
            tracing::error!("Failed to generate fetch plan: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Planner error").into_response()
        }
    }
}

// ========== Fetch results ==========

#[derive(Debug, Serialize)]
struct ResultResponse {
    fetch_id: i64,
    status: String,
    counts: extract::ExtractedCounts,
}

async fn post_result(
    State(state): State<AppState>,
    Json(envelope): Json<FetchResultEnvelope>,
) -> Response {
    let now = now();

    let record = match extract::record_result(state.db.pool(), &envelope, now).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Failed to record fetch result: {e:#}");
            return (StatusCode::BAD_REQUEST, "Unprocessable fetch result").into_response();
        }
    };

    let mut conn = match state.db.pool().acquire().await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to acquire connection: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };

    match extract::extract_record(&mut *conn, &record, now).await {
        Ok(counts) => Json(ResultResponse {
            fetch_id: record.id,
            status: record.status.clone(),
            counts,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(fetch_id = record.id, "Extraction failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Extraction error").into_response()
        }
    }
}

// ========== Member queries ==========

async fn filter_members(
    State(state): State<AppState>,
    Json(request): Json<MemberFilter>,
) -> Response {
    match filter::filter_members(state.db.pool(), &request, now()).await {
        Ok(members) => {
            let total = members.len();
            Json(json!({ "members": members, "total": total })).into_response()
        }
        Err(e) => {
            tracing::error!("Member filter failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Filter error").into_response()
        }
    }
}

// ========== Settings ==========

#[derive(Debug, Deserialize)]
struct SettingBody {
    value: String,
}

async fn get_setting(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match db::get_setting(state.db.pool(), &key).await {
        Ok(Some(value)) => Json(json!({ "key": key, "value": value })).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Setting not found").into_response(),
        Err(e) => {
            tracing::error!("Failed to fetch setting: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response()
        }
    }
}

async fn put_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<SettingBody>,
) -> Response {
    match db::set_setting(state.db.pool(), &key, &body.value).await {
        Ok(()) => Json(json!({ "key": key, "value": body.value })).into_response(),
        Err(e) => {
            tracing::error!("Failed to set setting: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response()
        }
    }
}

// ========== Discovered communities ==========

#[derive(Debug, Serialize)]
struct OtherCommunityView {
    slug: String,
    display_name: String,
    about_fetched: bool,
    shared_members: i64,
    first_seen_at: i64,
}

async fn other_communities(State(state): State<AppState>) -> Response {
    let pool = state.db.pool();

    let current = match db::current_community(pool).await {
        Ok(c) => c.unwrap_or_default(),
        Err(e) => {
            tracing::error!("Failed to read current community: {e:#}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };

    let shared = match db::shared_community_counts(pool, &current).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to compute shared member counts: {e:#}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };

    match db::list_other_communities(pool).await {
        Ok(rows) => {
            let views: Vec<OtherCommunityView> = rows
                .into_iter()
                .map(|c| OtherCommunityView {
                    shared_members: shared.get(&c.slug).copied().unwrap_or(0),
                    slug: c.slug,
                    display_name: c.display_name,
                    about_fetched: c.about_fetched,
                    first_seen_at: c.first_seen_at,
                })
                .collect();
            Json(views).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to list other communities: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response()
        }
    }
}

// ========== Maintenance ==========

async fn maintenance_reset(State(state): State<AppState>) -> Response {
    match db::reset_all(state.db.pool()).await {
        Ok(()) => Json(json!({ "reset": true })).into_response(),
        Err(e) => {
            tracing::error!("Reset failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Reset error").into_response()
        }
    }
}

async fn maintenance_reset_failed_about(State(state): State<AppState>) -> Response {
    match db::reset_failed_about(state.db.pool()).await {
        Ok(slugs) => Json(json!({ "reset_slugs": slugs })).into_response(),
        Err(e) => {
            tracing::error!("Reset of failed about fetches failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Reset error").into_response()
        }
    }
}

async fn maintenance_reextract(State(state): State<AppState>) -> Response {
    match extract::reextract_everything(state.db.pool(), now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            tracing::error!("Bulk re-extraction failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Re-extraction error").into_response()
        }
    }
}

// ========== Health ==========

async fn health(State(state): State<AppState>) -> Response {
    match db::get_setting(state.db.pool(), "current_community").await {
        Ok(_) => (StatusCode::OK, "OK").into_response(),
        Err(e) => {
            tracing::error!("Health check failed: {e:#}");
            (StatusCode::SERVICE_UNAVAILABLE, "Database unavailable").into_response()
        }
    }
}
