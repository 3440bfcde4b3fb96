use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::cache::UsageCache;
use crate::error::{AppError, AppResult};
use crate::extractor::DashboardAuth;
use crate::keys::{ImportOutcome, KeyInfo, KeyService};
use crate::refresh::RefreshEngine;
use crate::usage::{AggregatedSnapshot, UsageResult};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/usage", get(get_usage))
        .route("/api/keys", get(list_keys).post(import_keys))
        .route("/api/keys/delete", post(delete_keys_bulk))
        .route("/api/keys/:id", delete(delete_key))
        .route("/api/keys/:id/refresh", post(refresh_key))
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UsageResponse {
    Ok {
        version: i64,
        data: AggregatedSnapshot,
    },
    Updating,
    Empty {
        error: Option<String>,
    },
}

/// Serve the aggregated snapshot, forcing a synchronous refresh when the
/// durable store advanced past our stamped generation. A consistent stale
/// snapshot beats an error, so freshness failures only log.
async fn get_usage(
    _auth: DashboardAuth,
    Extension(cache): Extension<Arc<UsageCache>>,
    Extension(engine): Extension<Arc<RefreshEngine>>,
) -> AppResult<Json<UsageResponse>> {
    if let Err(err) = engine.ensure_fresh().await {
        warn!(?err, "freshness check failed; serving cached state");
    }
    let response = match cache.read() {
        Some(data) => UsageResponse::Ok {
            version: cache.stamped_version(),
            data,
        },
        None if cache.is_updating() => UsageResponse::Updating,
        None => UsageResponse::Empty {
            error: cache.last_error(),
        },
    };
    Ok(Json(response))
}

async fn list_keys(
    _auth: DashboardAuth,
    Extension(keys): Extension<Arc<KeyService>>,
) -> AppResult<Json<Vec<KeyInfo>>> {
    Ok(Json(keys.list().await?))
}

#[derive(Deserialize)]
pub struct ImportRequest {
    pub secrets: Vec<String>,
}

async fn import_keys(
    _auth: DashboardAuth,
    Extension(keys): Extension<Arc<KeyService>>,
    Extension(engine): Extension<Arc<RefreshEngine>>,
    Json(payload): Json<ImportRequest>,
) -> AppResult<(StatusCode, Json<ImportOutcome>)> {
    if payload.secrets.is_empty() {
        return Err(AppError::BadRequest("no secrets provided".into()));
    }
    let outcome = keys
        .import(payload.secrets)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    if outcome.added > 0 {
        spawn_reconcile(engine);
    }
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<Uuid>,
}

#[derive(Serialize)]
pub struct DeleteOutcome {
    pub removed: usize,
}

async fn delete_key(
    _auth: DashboardAuth,
    Path(id): Path<Uuid>,
    Extension(keys): Extension<Arc<KeyService>>,
    Extension(engine): Extension<Arc<RefreshEngine>>,
) -> AppResult<StatusCode> {
    let removed = keys
        .delete(&[id])
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    if removed == 0 {
        return Err(AppError::NotFound);
    }
    spawn_reconcile(engine);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_keys_bulk(
    _auth: DashboardAuth,
    Extension(keys): Extension<Arc<KeyService>>,
    Extension(engine): Extension<Arc<RefreshEngine>>,
    Json(payload): Json<DeleteRequest>,
) -> AppResult<Json<DeleteOutcome>> {
    if payload.ids.is_empty() {
        return Err(AppError::BadRequest("no ids provided".into()));
    }
    let removed = keys
        .delete(&payload.ids)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    if removed > 0 {
        spawn_reconcile(engine);
    }
    Ok(Json(DeleteOutcome { removed }))
}

/// One-off synchronous check of a single key; leaves the shared snapshot
/// alone.
async fn refresh_key(
    _auth: DashboardAuth,
    Path(id): Path<Uuid>,
    Extension(keys): Extension<Arc<KeyService>>,
) -> AppResult<Json<UsageResult>> {
    match keys
        .refresh_single(id)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?
    {
        Some(result) => Ok(Json(result)),
        None => Err(AppError::NotFound),
    }
}

/// Key-set mutations settle through the normal reconciling refresh, off the
/// request's critical path.
fn spawn_reconcile(engine: Arc<RefreshEngine>) {
    tokio::spawn(async move {
        engine.refresh_scheduled().await;
    });
}
