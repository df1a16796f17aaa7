//! Ledger tuning knobs.

use std::time::Duration;

use callex_core::filter::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

/// Runtime configuration for ledger services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Events loaded per round-trip during chain verification.
    pub verify_chunk_size: u64,
    /// Deadline applied to a single ledger operation.
    pub operation_timeout: Duration,
    /// Trailing positions inspected for gaps by the health check.
    pub health_sample_size: u64,
    /// Extra attempts after a sequence conflict.
    pub conflict_retries: u32,
    /// Page size used when a query does not ask for one.
    pub default_page_size: usize,
    /// Largest page size a query may ask for.
    pub max_page_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            verify_chunk_size: 1000,
            operation_timeout: Duration::from_secs(30),
            health_sample_size: 1000,
            conflict_retries: 3,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

impl LedgerConfig {
    /// Sets the verification chunk size. Zero is clamped to one.
    #[must_use]
    pub fn with_verify_chunk_size(mut self, size: u64) -> Self {
        self.verify_chunk_size = size.max(1);
        self
    }

    /// Sets the per-operation deadline.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets the health check gap sample size.
    #[must_use]
    pub fn with_health_sample_size(mut self, size: u64) -> Self {
        self.health_sample_size = size.max(1);
        self
    }

    /// Sets how many times a conflicting store is retried.
    #[must_use]
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Sets the default and maximum page sizes. The default is clamped to
    /// the maximum.
    #[must_use]
    pub fn with_page_sizes(mut self, default_size: usize, max_size: usize) -> Self {
        self.max_page_size = max_size.max(1);
        self.default_page_size = default_size.clamp(1, self.max_page_size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.verify_chunk_size, 1000);
        assert_eq!(config.operation_timeout, Duration::from_secs(30));
        assert_eq!(config.conflict_retries, 3);
        assert_eq!(config.default_page_size, 50);
        assert_eq!(config.max_page_size, 1000);
    }

    #[test]
    fn test_setters_clamp_degenerate_values() {
        let config = LedgerConfig::default()
            .with_verify_chunk_size(0)
            .with_health_sample_size(0)
            .with_page_sizes(500, 100);

        assert_eq!(config.verify_chunk_size, 1);
        assert_eq!(config.health_sample_size, 1);
        assert_eq!(config.max_page_size, 100);
        assert_eq!(config.default_page_size, 100);
    }
}
