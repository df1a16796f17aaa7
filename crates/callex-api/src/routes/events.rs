//! Routes for appending to and querying the ledger.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use callex_core::clock::Clock;
use callex_core::error::LedgerError;
use callex_core::event::{
    ActorType, AuditEvent, ComplianceFlags, EventResult, EventType, Metadata, Severity, TargetType,
};
use callex_core::filter::{EventFilter, EventPage, SortDirection, SortField};
use callex_ledger::LedgerConfig;
use callex_ledger::application::timeout::with_timeout;
use callex_ledger::application::{command_handlers, query_handlers};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Request body describing one event to append.
///
/// Omitted classifications fall back to the defaults of `event_type`.
#[derive(Debug, Deserialize)]
pub struct StoreEventRequest {
    /// What happened.
    pub event_type: EventType,
    /// Who did it.
    pub actor_id: String,
    /// What it was done to.
    pub target_id: String,
    /// Free-form verb, e.g. `route_call`.
    pub action: String,
    /// Overrides the type's default severity.
    pub severity: Option<Severity>,
    /// Outcome. Defaults to success.
    pub result: Option<EventResult>,
    /// Kind of actor. Defaults to user.
    pub actor_type: Option<ActorType>,
    /// Overrides the type's default target type.
    pub target_type: Option<TargetType>,
    /// Free-form context.
    #[serde(default)]
    pub metadata: Metadata,
    /// Regulatory classification.
    #[serde(default)]
    pub compliance_flags: ComplianceFlags,
}

impl StoreEventRequest {
    fn into_event(self, clock: &dyn Clock) -> Result<AuditEvent, LedgerError> {
        let mut event = AuditEvent::new(
            self.event_type,
            self.actor_id,
            self.target_id,
            self.action,
            clock,
        )?;
        if let Some(severity) = self.severity {
            event = event.with_severity(severity);
        }
        if let Some(result) = self.result {
            event = event.with_result(result);
        }
        if let Some(actor_type) = self.actor_type {
            event = event.with_actor_type(actor_type);
        }
        if let Some(target_type) = self.target_type {
            event = event.with_target_type(target_type);
        }
        event.metadata = self.metadata;
        event.compliance_flags = self.compliance_flags;
        event.validate()?;
        Ok(event)
    }
}

/// Request body for POST /batch.
#[derive(Debug, Deserialize)]
pub struct StoreBatchRequest {
    /// Events to append atomically, in order.
    pub events: Vec<StoreEventRequest>,
}

/// Response body for POST /batch.
#[derive(Debug, Serialize)]
pub struct StoreBatchResponse {
    /// The persisted events with their positions and hashes.
    pub events: Vec<AuditEvent>,
}

/// Request body for PUT /{id}/archive.
#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    /// New value of the retention marker.
    pub archived: bool,
}

/// Query string for GET /.
///
/// Set-valued parameters take comma-separated lists. Compliance flags are
/// given as `name` (must be set) or `name:false`.
#[derive(Debug, Default, Deserialize)]
pub struct FindEventsQuery {
    /// Event types to include.
    pub event_type: Option<String>,
    /// Severities to include.
    pub severity: Option<String>,
    /// Actor ids to include.
    pub actor_id: Option<String>,
    /// Target ids to include.
    pub target_id: Option<String>,
    /// Inclusive lower time bound.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper time bound.
    pub end_time: Option<DateTime<Utc>>,
    /// Required compliance flags.
    pub compliance_flag: Option<String>,
    /// Case-insensitive substring search.
    pub search: Option<String>,
    /// Restrict to archived or live events.
    pub archived: Option<bool>,
    /// Ordering column.
    pub sort_by: Option<SortField>,
    /// Ordering direction.
    pub sort_direction: Option<SortDirection>,
    /// Page size.
    pub limit: Option<usize>,
    /// Matching events to skip.
    pub offset: Option<usize>,
}

fn split_list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

fn parse_list<T>(raw: Option<&str>) -> Result<Vec<T>, LedgerError>
where
    T: FromStr<Err = LedgerError>,
{
    split_list(raw).map(str::parse).collect()
}

impl FindEventsQuery {
    /// Builds the filter this query describes.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` for an unknown event type,
    /// severity or malformed compliance flag.
    pub fn into_filter(self, config: &LedgerConfig) -> Result<EventFilter, LedgerError> {
        let mut filter = EventFilter::new().page(
            self.limit.unwrap_or(config.default_page_size),
            self.offset.unwrap_or(0),
        );
        filter.event_types = parse_list(self.event_type.as_deref())?;
        filter.severities = parse_list(self.severity.as_deref())?;
        filter.actor_ids = split_list(self.actor_id.as_deref()).map(str::to_owned).collect();
        filter.target_ids = split_list(self.target_id.as_deref()).map(str::to_owned).collect();
        filter.start_time = self.start_time;
        filter.end_time = self.end_time;
        for entry in split_list(self.compliance_flag.as_deref()) {
            let (flag, value) = match entry.split_once(':') {
                Some((flag, value)) => {
                    let value = value.parse::<bool>().map_err(|_| {
                        LedgerError::validation(format!(
                            "compliance flag {flag:?} must be true or false, got {value:?}"
                        ))
                    })?;
                    (flag, value)
                }
                None => (entry, true),
            };
            filter = filter.compliance_flag(flag, value);
        }
        filter.search = self.search;
        filter.archived = self.archived;
        filter.sort_by = self.sort_by.unwrap_or_default();
        filter.sort_direction = self.sort_direction.unwrap_or_default();
        Ok(filter)
    }
}

/// Query string for the projection routes.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    /// Page size.
    pub limit: Option<usize>,
    /// Matching events to skip.
    pub offset: Option<usize>,
}

impl PageQuery {
    fn resolve(&self, config: &LedgerConfig) -> (usize, usize) {
        (
            self.limit.unwrap_or(config.default_page_size),
            self.offset.unwrap_or(0),
        )
    }
}

/// Query string for GET /range.
#[derive(Debug, Deserialize)]
pub struct TimeRangeQuery {
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,
    /// Inclusive upper bound.
    pub end: DateTime<Utc>,
    /// Page size.
    pub limit: Option<usize>,
    /// Matching events to skip.
    pub offset: Option<usize>,
}

/// POST /
#[instrument(skip(state, request), fields(event_type = %request.event_type))]
async fn store_event(
    State(state): State<AppState>,
    Json(request): Json<StoreEventRequest>,
) -> Result<(StatusCode, Json<AuditEvent>), ApiError> {
    let event = request.into_event(state.clock.as_ref())?;
    let stored = with_timeout(
        "store_event",
        state.config.operation_timeout,
        command_handlers::store_event_with_retry(
            event,
            &*state.store,
            state.config.conflict_retries,
        ),
    )
    .await?;

    info!(id = %stored.id, sequence = stored.sequence_num, "event appended");

    Ok((StatusCode::CREATED, Json(stored)))
}

/// POST /batch
#[instrument(skip(state, request), fields(batch_size = request.events.len()))]
async fn store_batch(
    State(state): State<AppState>,
    Json(request): Json<StoreBatchRequest>,
) -> Result<(StatusCode, Json<StoreBatchResponse>), ApiError> {
    let events = request
        .events
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            item.into_event(state.clock.as_ref())
                .map_err(|error| error.at_index(index))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let stored = with_timeout(
        "store_events_batch",
        state.config.operation_timeout,
        command_handlers::store_events_batch(events, &*state.store),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(StoreBatchResponse { events: stored })))
}

/// GET /
#[instrument(skip(state, query))]
async fn find_events(
    State(state): State<AppState>,
    Query(query): Query<FindEventsQuery>,
) -> Result<Json<EventPage>, ApiError> {
    let filter = query.into_filter(&state.config)?;
    let page = with_timeout(
        "find_events",
        state.config.operation_timeout,
        query_handlers::find_events(&filter, &*state.store, &state.config),
    )
    .await?;
    Ok(Json(page))
}

/// GET /{id}
#[instrument(skip(state))]
async fn get_by_id(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AuditEvent>, ApiError> {
    let event = with_timeout(
        "get_event_by_id",
        state.config.operation_timeout,
        query_handlers::get_event_by_id(id, &*state.store),
    )
    .await?;
    Ok(Json(event))
}

/// GET /sequence/{sequence}
#[instrument(skip(state))]
async fn get_by_sequence(
    State(state): State<AppState>,
    Path(sequence): Path<u64>,
) -> Result<Json<AuditEvent>, ApiError> {
    let event = with_timeout(
        "get_event_by_sequence",
        state.config.operation_timeout,
        query_handlers::get_event_by_sequence(sequence, &*state.store),
    )
    .await?;
    Ok(Json(event))
}

/// PUT /{id}/archive
#[instrument(skip(state, request), fields(archived = request.archived))]
async fn archive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ArchiveRequest>,
) -> Result<StatusCode, ApiError> {
    with_timeout(
        "archive_event",
        state.config.operation_timeout,
        command_handlers::archive_event(id, request.archived, &*state.store),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /actors/{actor_id}
#[instrument(skip(state, page))]
async fn by_actor(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<EventPage>, ApiError> {
    let (limit, offset) = page.resolve(&state.config);
    let page = with_timeout(
        "find_by_actor",
        state.config.operation_timeout,
        query_handlers::find_by_actor(&actor_id, limit, offset, &*state.store, &state.config),
    )
    .await?;
    Ok(Json(page))
}

/// GET /targets/{target_id}
#[instrument(skip(state, page))]
async fn by_target(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<EventPage>, ApiError> {
    let (limit, offset) = page.resolve(&state.config);
    let page = with_timeout(
        "find_by_target",
        state.config.operation_timeout,
        query_handlers::find_by_target(&target_id, limit, offset, &*state.store, &state.config),
    )
    .await?;
    Ok(Json(page))
}

/// GET /compliance/{flag}
#[instrument(skip(state, page))]
async fn by_compliance_flag(
    State(state): State<AppState>,
    Path(flag): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<EventPage>, ApiError> {
    let (limit, offset) = page.resolve(&state.config);
    let page = with_timeout(
        "find_by_compliance_flag",
        state.config.operation_timeout,
        query_handlers::find_by_compliance_flag(&flag, limit, offset, &*state.store, &state.config),
    )
    .await?;
    Ok(Json(page))
}

/// GET /range
#[instrument(skip(state, query), fields(start = %query.start, end = %query.end))]
async fn by_time_range(
    State(state): State<AppState>,
    Query(query): Query<TimeRangeQuery>,
) -> Result<Json<EventPage>, ApiError> {
    let page = with_timeout(
        "find_by_time_range",
        state.config.operation_timeout,
        query_handlers::find_by_time_range(
            query.start,
            query.end,
            query.limit.unwrap_or(state.config.default_page_size),
            query.offset.unwrap_or(0),
            &*state.store,
            &state.config,
        ),
    )
    .await?;
    Ok(Json(page))
}

/// Returns the router for the event log.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(store_event).get(find_events))
        .route("/batch", post(store_batch))
        .route("/range", get(by_time_range))
        .route("/sequence/{sequence}", get(get_by_sequence))
        .route("/actors/{actor_id}", get(by_actor))
        .route("/targets/{target_id}", get(by_target))
        .route("/compliance/{flag}", get(by_compliance_flag))
        .route("/{id}", get(get_by_id))
        .route("/{id}/archive", put(archive))
}
