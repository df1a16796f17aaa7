//! Sequence allocation.
//!
//! Positions start at 1. [`GENESIS_SEQUENCE`] is what `latest` reports on an
//! empty ledger. The ceiling is `i64::MAX` so every position fits a signed
//! 64-bit column; the allocator fails at the ceiling instead of wrapping.

use async_trait::async_trait;

use crate::error::LedgerError;

/// Reported by `latest` before anything has been allocated.
pub const GENESIS_SEQUENCE: u64 = 0;

/// Highest position the ledger will ever hand out.
#[allow(clippy::cast_sign_loss)]
pub const MAX_SEQUENCE: u64 = i64::MAX as u64;

/// Exclusive issuer of ledger positions.
///
/// Implementations must never return the same value twice. Storage
/// transactions implement this trait so allocation happens inside the same
/// atomic unit as the insert.
#[async_trait]
pub trait SequenceAllocator: Send {
    /// Returns the next unused position.
    async fn next(&mut self) -> Result<u64, LedgerError>;

    /// Returns the highest position handed out so far.
    async fn latest(&mut self) -> Result<u64, LedgerError>;
}

/// In-process counter for single-writer deployments and in-memory stores.
///
/// Callers guarantee exclusivity by holding the counter behind a mutex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceCounter {
    current: u64,
}

impl SequenceCounter {
    /// Creates a counter that resumes after `latest`.
    #[must_use]
    pub fn resume_after(latest: u64) -> Self {
        Self { current: latest }
    }

    /// Hands out the next position.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::SequenceExhausted` at [`MAX_SEQUENCE`].
    pub fn advance(&mut self) -> Result<u64, LedgerError> {
        match self.current.checked_add(1) {
            Some(next) if next <= MAX_SEQUENCE => {
                self.current = next;
                Ok(next)
            }
            _ => Err(LedgerError::SequenceExhausted {
                latest: self.current,
            }),
        }
    }

    /// Moves the counter forward to `sequence` if it is ahead. Never moves it
    /// backwards.
    pub fn observe(&mut self, sequence: u64) {
        self.current = self.current.max(sequence);
    }

    /// The highest position handed out or observed.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current
    }
}

#[async_trait]
impl SequenceAllocator for SequenceCounter {
    async fn next(&mut self) -> Result<u64, LedgerError> {
        self.advance()
    }

    async fn latest(&mut self) -> Result<u64, LedgerError> {
        Ok(self.current)
    }
}
