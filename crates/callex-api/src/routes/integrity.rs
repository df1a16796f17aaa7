//! Routes for tamper and gap detection.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use callex_ledger::application::integrity::{self, ChainVerifyOptions};
use callex_ledger::application::timeout::with_timeout;
use callex_ledger::domain::integrity::{
    ChainIntegrityResult, IntegrityCriteria, IntegrityReport, IntegrityResult, SequenceGap,
};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Query string for the range routes.
///
/// `start` defaults to the first position, `end` to the latest.
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    /// First position to cover.
    pub start: Option<u64>,
    /// Last position to cover.
    pub end: Option<u64>,
}

/// Response body for GET /gaps.
#[derive(Debug, Serialize)]
pub struct GapsResponse {
    /// First position inspected.
    pub start_sequence: u64,
    /// Last position inspected.
    pub end_sequence: u64,
    /// Runs of missing positions in ascending order.
    pub gaps: Vec<SequenceGap>,
}

async fn resolve_range(query: &RangeQuery, state: &AppState) -> Result<(u64, u64), ApiError> {
    let start = query.start.unwrap_or(1);
    let end = match query.end {
        Some(end) => end,
        None => state.store.latest_sequence().await?,
    };
    Ok((start, end))
}

/// GET /events/{id}
#[instrument(skip(state))]
async fn verify_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<IntegrityResult>, ApiError> {
    let result = with_timeout(
        "verify_event",
        state.config.operation_timeout,
        integrity::verify_event(id, &*state.store),
    )
    .await?;
    Ok(Json(result))
}

/// GET /chain
///
/// Long ranges stop at the operation deadline and come back with
/// `resume_from` set instead of failing.
#[instrument(skip(state))]
async fn verify_chain(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<ChainIntegrityResult>, ApiError> {
    let (start, end) = resolve_range(&query, &state).await?;
    if end == 0 {
        return Ok(Json(ChainIntegrityResult::new(start, end)));
    }
    let options = ChainVerifyOptions::from_config(&state.config)
        .with_deadline(state.config.operation_timeout / 2);
    let result = with_timeout(
        "verify_chain",
        state.config.operation_timeout,
        integrity::verify_chain_with(start, end, &*state.store, &options),
    )
    .await?;
    if !result.is_complete() {
        warn!(
            checked = result.events_checked,
            "chain verification hit its deadline"
        );
    }
    Ok(Json(result))
}

/// GET /gaps
#[instrument(skip(state))]
async fn find_gaps(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<GapsResponse>, ApiError> {
    let (start, end) = resolve_range(&query, &state).await?;
    let gaps = if end == 0 {
        Vec::new()
    } else {
        with_timeout(
            "find_gaps",
            state.config.operation_timeout,
            integrity::find_gaps(start, end, &*state.store, &state.config),
        )
        .await?
    };
    Ok(Json(GapsResponse {
        start_sequence: start,
        end_sequence: end,
        gaps,
    }))
}

/// POST /report
#[instrument(skip(state, criteria))]
async fn report(
    State(state): State<AppState>,
    Json(criteria): Json<IntegrityCriteria>,
) -> Result<Json<IntegrityReport>, ApiError> {
    let report = with_timeout(
        "generate_integrity_report",
        state.config.operation_timeout,
        integrity::generate_integrity_report(
            criteria,
            &*state.store,
            &state.config,
            state.clock.as_ref(),
        ),
    )
    .await?;
    Ok(Json(report))
}

/// Returns the router for integrity verification.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events/{id}", get(verify_event))
        .route("/chain", get(verify_chain))
        .route("/gaps", get(find_gaps))
        .route("/report", post(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use callex_ledger::LedgerConfig;
    use callex_ledger::application::command_handlers::store_event;
    use callex_test_support::fixtures::call_event;
    use callex_test_support::{FixedClock, InMemoryLedgerStore};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app_with(store: InMemoryLedgerStore) -> Router {
        router().with_state(AppState::new(
            Arc::new(store),
            Arc::new(FixedClock::default()),
            LedgerConfig::default(),
        ))
    }

    async fn seeded(count: usize) -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        for _ in 0..count {
            store_event(call_event(), &store).await.unwrap();
        }
        store
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body_bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_chain_of_untouched_ledger_is_valid() {
        let store = seeded(4).await;

        let (status, json) = send(app_with(store), get("/chain")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["is_valid"], true);
        assert_eq!(json["events_checked"], 4);
        assert_eq!(json["end_sequence"], 4);
    }

    #[tokio::test]
    async fn test_tampered_event_is_reported() {
        // Arrange
        let store = seeded(3).await;
        store.tamper(2, |event| event.actor_id = "forged".into());
        let tampered = store.events()[1].id;

        // Act
        let (status, event_json) =
            send(app_with(store.clone()), get(&format!("/events/{tampered}"))).await;
        let (_, chain_json) = send(app_with(store), get("/chain?start=1&end=3")).await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(event_json["is_valid"], false);
        assert_eq!(event_json["hash_valid"], false);
        assert_eq!(chain_json["is_valid"], false);
        assert_eq!(chain_json["broken_at"], 2);
        assert_eq!(chain_json["errors"][0]["kind"], "hash_mismatch");
    }

    #[tokio::test]
    async fn test_inverted_range_is_rejected() {
        let (status, json) = send(app_with(seeded(3).await), get("/chain?start=3&end=1")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_gaps_are_listed() {
        let store = seeded(6).await;
        store.purge(3);
        store.purge(4);

        let (status, json) = send(app_with(store), get("/gaps")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["gaps"][0]["start"], 3);
        assert_eq!(json["gaps"][0]["end"], 4);
        assert_eq!(json["gaps"][0]["severity"], "low");
    }

    #[tokio::test]
    async fn test_gaps_at_start_of_requested_range_are_listed() {
        let store = seeded(6).await;
        store.purge(3);
        store.purge(4);

        let (status, json) = send(app_with(store), get("/gaps?start=3&end=6")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["gaps"].as_array().unwrap().len(), 1);
        assert_eq!(json["gaps"][0]["start"], 3);
        assert_eq!(json["gaps"][0]["end"], 4);
    }

    #[tokio::test]
    async fn test_empty_ledger_has_nothing_to_verify() {
        let (status, json) = send(app_with(InMemoryLedgerStore::new()), get("/gaps")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["gaps"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_report_defaults_to_full_ledger() {
        let request = Request::builder()
            .method("POST")
            .uri("/report")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let (status, json) = send(app_with(seeded(2).await), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "HEALTHY");
        assert_eq!(json["end_sequence"], 2);
    }

    #[tokio::test]
    async fn test_unknown_event_is_404() {
        let (status, _) = send(
            app_with(InMemoryLedgerStore::new()),
            get(&format!("/events/{}", Uuid::new_v4())),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
