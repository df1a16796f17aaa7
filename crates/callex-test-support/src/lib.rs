//! Shared test stores, clocks and fixtures for the call-exchange audit ledger.

mod clock;
mod failing;
pub mod fixtures;
mod store;

pub use clock::{FixedClock, SteppingClock, fixture_time};
pub use failing::FailingLedgerStore;
pub use store::InMemoryLedgerStore;
