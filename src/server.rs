//! Admin HTTP surface.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness, no auth |
//! | `GET`, `POST` | `/api/v1/internal/external-db-sync/sequencer` | Run the sequencer |
//! | `GET`, `POST` | `/api/v1/internal/external-db-sync/poller` | Run the poller |
//! | `GET`, `POST` | `/api/v1/internal/external-db-sync/fusebox` | Read or set the fusebox |
//! | `GET` | `/api/v1/internal/external-db-sync/status` | Replication status of a tenancy |
//! | `GET`, `PATCH` | `/api/v1/internal/tenancies/:id/db-sync/external-databases` | Target configuration |
//!
//! Every route except `/health` requires `Authorization: Bearer <cron_secret>`.
//! The trigger routes run a single pass unless `maxDurationMs` asks for a
//! bounded loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::engine::Engine;
use crate::fusebox::{update_flags, FuseboxFlags, FuseboxUpdate};
use crate::registry;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(e) => {
                error!("Admin request failed: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let error = match &self {
            ApiError::Internal(e) => format!("{e:#}"),
            other => other.to_string(),
        };
        (status, Json(ErrorBody { ok: false, error })).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    engine: Engine,
    cron_secret: Arc<str>,
    /// Cap on `maxDurationMs`.
    max_duration: Duration,
}

impl AppState {
    pub fn new(engine: Engine, cron_secret: &str, max_duration: Duration) -> Self {
        Self {
            engine,
            cron_secret: Arc::from(cron_secret),
            max_duration,
        }
    }
}

/// Query parameters of the trigger and status routes.
#[derive(Debug, Default, Deserialize)]
struct RunParams {
    #[serde(rename = "maxDurationMs")]
    max_duration_ms: Option<String>,
    #[serde(rename = "tenancyId")]
    tenancy_id: Option<String>,
}

impl RunParams {
    fn max_duration(&self, cap: Duration) -> Result<Option<Duration>, ApiError> {
        let Some(raw) = &self.max_duration_ms else {
            return Ok(None);
        };
        match raw.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms).min(cap))),
            _ => Err(ApiError::BadRequest(format!(
                "maxDurationMs must be a positive integer, got '{raw}'"
            ))),
        }
    }

    fn tenancy_id(&self) -> Result<Option<Uuid>, ApiError> {
        self.tenancy_id.as_deref().map(parse_tenancy_id).transpose()
    }
}

fn parse_tenancy_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::BadRequest(format!("Invalid tenancy id '{raw}'")))
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/api/v1/internal/external-db-sync/sequencer",
            get(run_sequencer).post(run_sequencer),
        )
        .route(
            "/api/v1/internal/external-db-sync/poller",
            get(run_poller).post(run_poller),
        )
        .route(
            "/api/v1/internal/external-db-sync/fusebox",
            get(get_fusebox).post(set_fusebox),
        )
        .route("/api/v1/internal/external-db-sync/status", get(get_status))
        .route(
            "/api/v1/internal/tenancies/:id/db-sync/external-databases",
            get(get_external_databases).patch(patch_external_databases),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_cron_secret,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(admin)
        .with_state(state)
}

/// Serve the admin API until ctrl-c.
pub async fn serve(engine: Engine, settings: &Settings) -> Result<()> {
    let state = AppState::new(engine, settings.require_cron_secret()?, settings.max_duration);
    let listener = tokio::net::TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen))?;
    info!("Admin API listening on {}", settings.listen);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await
        .context("Admin server failed")?;
    Ok(())
}

async fn require_cron_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if !bool::from(provided.as_bytes().ct_eq(state.cron_secret.as_bytes())) {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Debug, Serialize)]
struct SequencerResponse {
    ok: bool,
    iterations: u32,
    assigned: u64,
    stopped_by_fusebox: bool,
}

async fn run_sequencer(
    State(state): State<AppState>,
    Query(params): Query<RunParams>,
) -> Result<Json<SequencerResponse>, ApiError> {
    let max_duration = params.max_duration(state.max_duration)?;
    let report = state.engine.run_sequencer(max_duration).await?;
    Ok(Json(SequencerResponse {
        ok: true,
        iterations: report.iterations,
        assigned: report.assigned,
        stopped_by_fusebox: report.stopped_by_fusebox,
    }))
}

#[derive(Debug, Serialize)]
struct PollerResponse {
    ok: bool,
    iterations: u32,
    rows_applied: usize,
    targets_synced: usize,
    targets_failed: usize,
    throttled: bool,
    stopped_by_fusebox: bool,
}

async fn run_poller(
    State(state): State<AppState>,
    Query(params): Query<RunParams>,
) -> Result<Json<PollerResponse>, ApiError> {
    let max_duration = params.max_duration(state.max_duration)?;
    let tenancy_id = params.tenancy_id()?;
    if let Some(id) = tenancy_id {
        ensure_tenancy(&state, id).await?;
    }

    let run = state.engine.poll(tenancy_id, max_duration).await?;
    Ok(Json(PollerResponse {
        ok: true,
        iterations: run.iterations,
        rows_applied: run.rows_applied,
        targets_synced: run.last.targets_synced(),
        targets_failed: run.last.targets_failed(),
        throttled: run.last.throttled,
        stopped_by_fusebox: run.last.stopped_by_fusebox,
    }))
}

async fn get_fusebox(State(state): State<AppState>) -> Result<Json<FuseboxFlags>, ApiError> {
    Ok(Json(state.engine.fusebox().read_flags().await?))
}

async fn set_fusebox(
    State(state): State<AppState>,
    Json(update): Json<FuseboxUpdate>,
) -> Result<Json<FuseboxFlags>, ApiError> {
    let flags = update_flags(state.engine.fusebox(), update).await?;
    info!(
        sequencer_enabled = flags.sequencer_enabled,
        poller_enabled = flags.poller_enabled,
        "Fusebox set"
    );
    Ok(Json(flags))
}

async fn get_status(
    State(state): State<AppState>,
    Query(params): Query<RunParams>,
) -> Result<Response, ApiError> {
    let tenancy_id = params
        .tenancy_id()?
        .ok_or_else(|| ApiError::BadRequest("tenancyId is required".to_string()))?;
    match state.engine.tenancy_status(tenancy_id).await? {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(ApiError::NotFound(format!("Tenancy {tenancy_id} not found"))),
    }
}

async fn ensure_tenancy(state: &AppState, tenancy_id: Uuid) -> Result<Value, ApiError> {
    state
        .engine
        .tenants()
        .get_tenancy(tenancy_id)
        .await?
        .map(|t| t.external_databases)
        .ok_or_else(|| ApiError::NotFound(format!("Tenancy {tenancy_id} not found")))
}

async fn get_external_databases(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tenancy_id = parse_tenancy_id(&id)?;
    let stored = ensure_tenancy(&state, tenancy_id).await?;
    let view = registry::view(&stored).map_err(anyhow::Error::from)?;
    Ok(Json(view))
}

/// Attempts at merging a PATCH before giving up on concurrent writers.
const PATCH_ATTEMPTS: usize = 8;

async fn patch_external_databases(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let tenancy_id = parse_tenancy_id(&id)?;
    for attempt in 1..=PATCH_ATTEMPTS {
        let stored = ensure_tenancy(&state, tenancy_id).await?;
        let merged = registry::merge_override(&stored, &patch)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        let replaced = state
            .engine
            .tenants()
            .replace_external_databases(tenancy_id, &stored, merged.clone())
            .await?;
        if replaced {
            info!(tenancy_id = %tenancy_id, "External database configuration updated");
            return Ok(Json(merged));
        }
        debug!(tenancy_id = %tenancy_id, attempt, "Configuration changed concurrently, retrying merge");
    }
    Err(ApiError::Conflict(format!(
        "Configuration of tenancy {tenancy_id} kept changing, retry the request"
    )))
}
