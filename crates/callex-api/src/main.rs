//! Call-exchange audit ledger API server entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use callex_api::config::AppConfig;
use callex_api::error::AppError;
use callex_api::routes;
use callex_api::state::AppState;
use callex_core::clock::SystemClock;
use callex_event_store::PgLedgerStore;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize tracing subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting call-exchange audit ledger API server");

    let config = AppConfig::from_env()?;

    // Create database connection pool and bring the schema up to date.
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    let state = AppState::new(
        Arc::new(PgLedgerStore::new(pool)),
        Arc::new(SystemClock),
        config.ledger.clone(),
    );

    // TODO: restrict CORS to the monitoring dashboard origin once it has a fixed host.
    let app = routes::app(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| AppError::Config(format!("invalid HOST:PORT combination: {e}")))?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
