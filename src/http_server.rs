/// HTTP Server Module
///
/// Thin operational surface over the pipeline: health and status reads,
/// manual fetch/reward/recovery triggers, and integrity reports. Mutating
/// endpoints honor the optional admin bearer token.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::config::SharedConfig;
use crate::registry::CampaignWorkers;

#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub workers: CampaignWorkers,
}

/// Create and configure the HTTP server router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_endpoint))
        .route("/fetch", post(fetch_endpoint))
        .route("/ingest/history", get(fetch_history_endpoint))
        .route("/rewards/run", post(run_rewards_endpoint))
        .route("/rewards/history", get(reward_history_endpoint))
        .route("/rewards/authors/:author_id", get(author_rewards_endpoint))
        .route("/integrity", get(integrity_endpoint))
        .route("/recover/auto", post(auto_recover_endpoint))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

/// Bearer-token check for mutating endpoints; open when no token is set.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let admin_token = { state.config.read().await.admin_token.clone() };
    let Some(expected) = admin_token else {
        return Ok(());
    };

    let auth_header = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    match auth_header.strip_prefix("Bearer ") {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn days_param(params: &HashMap<String, String>, default: i64) -> i64 {
    params
        .get("days")
        .and_then(|d| d.parse().ok())
        .unwrap_or(default)
}

/// Health check endpoint
async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "ok",
        "service": "mention_rewards",
        "timestamp": Utc::now().to_rfc3339()
    })))
}

/// Combined component status
async fn status_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let ingest = state.workers.ingest.status().await;
    let rewards = state.workers.rewards.status().await;
    let recovery = state.workers.recovery.status().await;

    Ok(Json(serde_json::json!({
        "ingest": ingest,
        "rewards": rewards,
        "recovery": recovery,
    })))
}

/// Run one fetch cycle immediately
async fn fetch_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    authorize(&state, &headers).await?;

    log::info!("Manual fetch triggered via HTTP endpoint");
    match state.workers.ingest.fetch_now().await {
        Ok(report) => Ok(Json(serde_json::json!({
            "status": if report.success() { "success" } else { "partial" },
            "report": report,
        }))),
        Err(e) => {
            log::error!("Manual fetch failed: {:#}", e);
            Ok(Json(serde_json::json!({
                "status": "error",
                "error": format!("{:#}", e)
            })))
        }
    }
}

async fn fetch_history_endpoint(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let history = state
        .workers
        .ingest
        .fetch_history(days_param(&params, 7))
        .await;
    Ok(Json(serde_json::json!({ "history": history })))
}

/// Compute rewards for one UTC day (defaults to today)
async fn run_rewards_endpoint(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    authorize(&state, &headers).await?;

    let date = match params.get("date") {
        Some(raw) => raw
            .parse::<NaiveDate>()
            .map_err(|_| StatusCode::BAD_REQUEST)?,
        None => Utc::now().date_naive(),
    };

    log::info!("Manual reward calculation triggered for {}", date);
    match state.workers.rewards.calculate(date).await {
        Ok(outcome) => Ok(Json(serde_json::json!({
            "status": "success",
            "outcome": outcome,
        }))),
        Err(e) => {
            log::error!("Manual reward calculation failed: {:#}", e);
            Ok(Json(serde_json::json!({
                "status": "error",
                "error": format!("{:#}", e)
            })))
        }
    }
}

async fn reward_history_endpoint(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let history = state
        .workers
        .rewards
        .history(days_param(&params, 30))
        .await;
    Ok(Json(serde_json::json!({ "history": history })))
}

async fn author_rewards_endpoint(
    State(state): State<AppState>,
    Path(author_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let records = state
        .workers
        .rewards
        .records_for_author(&author_id, days_param(&params, 30))
        .await;
    Ok(Json(serde_json::json!({
        "author_id": author_id,
        "records": records,
    })))
}

async fn integrity_endpoint(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let report = state
        .workers
        .recovery
        .generate_integrity_report(days_param(&params, 7))
        .await;
    Ok(Json(serde_json::json!({ "report": report })))
}

async fn auto_recover_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    authorize(&state, &headers).await?;

    log::info!("Auto-recovery triggered via HTTP endpoint");
    let run = state.workers.recovery.auto_recover_all().await;
    Ok(Json(serde_json::json!({ "run": run })))
}

/// Start the HTTP server
pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .context("Failed to bind HTTP server")?;

    log::info!("HTTP server listening on port {}", port);

    axum::serve(listener, app)
        .await
        .context("HTTP server error")?;

    Ok(())
}
