//! Environment configuration for the API server.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use callex_ledger::LedgerConfig;

use crate::error::AppError;

/// Server settings read at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Interface to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Upper bound of the connection pool.
    pub max_connections: u32,
    /// Ledger tuning.
    pub ledger: LedgerConfig,
}

impl AppConfig {
    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `DATABASE_URL` is missing or any
    /// variable fails to parse.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of
    /// a variable if it is set.
    ///
    /// # Errors
    ///
    /// Same as [`AppConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let database_url = lookup("DATABASE_URL").ok_or_else(|| {
            AppError::Config("DATABASE_URL environment variable must be set".to_string())
        })?;
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_or(&lookup, "PORT", 3000)?;
        let max_connections = parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?;

        let mut ledger = LedgerConfig::default();
        if let Some(timeout_ms) = parse_opt::<u64>(&lookup, "LEDGER_OPERATION_TIMEOUT_MS")? {
            ledger = ledger.with_operation_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(chunk) = parse_opt(&lookup, "LEDGER_VERIFY_CHUNK_SIZE")? {
            ledger = ledger.with_verify_chunk_size(chunk);
        }
        if let Some(sample) = parse_opt(&lookup, "LEDGER_HEALTH_SAMPLE_SIZE")? {
            ledger = ledger.with_health_sample_size(sample);
        }

        Ok(Self {
            database_url,
            host,
            port,
            max_connections,
            ledger,
        })
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| AppError::Config(format!("{key} must be a valid number: {e}")))
        })
        .transpose()
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}
