//! Shared application state.

use std::sync::Arc;

use callex_core::clock::Clock;
use callex_core::repository::LedgerStore;
use callex_ledger::LedgerConfig;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Ledger storage backend.
    pub store: Arc<dyn LedgerStore>,
    /// Source of event timestamps and report times.
    pub clock: Arc<dyn Clock>,
    /// Ledger tuning.
    pub config: LedgerConfig,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, config: LedgerConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }
}
