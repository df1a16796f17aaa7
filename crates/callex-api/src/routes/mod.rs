//! Route modules, one per ledger concern.

use axum::Router;

use crate::state::AppState;

pub mod events;
pub mod health;
pub mod integrity;
pub mod operations;

/// Assembles every route under its public prefix.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/api/v1/events", events::router())
        .nest("/api/v1/integrity", integrity::router())
        .nest("/api/v1/ledger", operations::router())
        .with_state(state)
}
