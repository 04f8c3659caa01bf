//! In-memory backends for tally.
//!
//! Used by the test suite and by the single-process `all` role. Nothing here
//! survives a restart.

pub mod balance;
pub mod ledger;
pub mod queue;

pub use balance::InMemoryBalanceStore;
pub use ledger::InMemoryLedgerStore;
pub use queue::InMemoryTaskQueue;
