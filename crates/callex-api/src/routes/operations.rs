//! Monitoring routes: ledger health, statistics and storage footprint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use callex_core::repository::StorageInfo;
use callex_ledger::application::operations;
use callex_ledger::application::timeout::with_timeout;
use callex_ledger::domain::operations::{HealthReport, LedgerStats};
use tracing::instrument;

use crate::error::ApiError;
use crate::state::AppState;

/// GET /health
///
/// Answers 503 when the backend is unreachable so load balancers can act on
/// the status code alone.
#[instrument(skip(state))]
async fn ledger_health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = operations::health_check(&*state.store, &state.config, state.clock.as_ref()).await;
    let status = if report.health.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

/// GET /stats
#[instrument(skip(state))]
async fn stats(State(state): State<AppState>) -> Result<Json<LedgerStats>, ApiError> {
    let stats = with_timeout(
        "ledger_stats",
        state.config.operation_timeout,
        operations::ledger_stats(&*state.store, state.clock.as_ref()),
    )
    .await?;
    Ok(Json(stats))
}

/// GET /storage
#[instrument(skip(state))]
async fn storage(State(state): State<AppState>) -> Result<Json<StorageInfo>, ApiError> {
    let info = with_timeout(
        "storage_info",
        state.config.operation_timeout,
        operations::storage_info(&*state.store),
    )
    .await?;
    Ok(Json(info))
}

/// Returns the router for ledger monitoring.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(ledger_health))
        .route("/stats", get(stats))
        .route("/storage", get(storage))
}
