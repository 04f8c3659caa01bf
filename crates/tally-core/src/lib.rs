//! Core types and traits for tally storage backends.
//!
//! This crate provides the `BalanceStore`, `LedgerStore` and `TaskQueue`
//! traits and all associated types, enabling pluggable implementations in
//! separate crates.

pub mod balance;
pub mod error;
pub mod ledger;
pub mod models;
pub mod queue;
pub mod task;

// Re-export key types at crate root for convenience
pub use balance::{AccountLock, Application, BalanceStore, BalanceUpdate};
pub use error::{QueueError, StoreError};
pub use ledger::LedgerStore;
pub use models::{fits_money_scale, Account, NewAccount, TransactionKind, TransactionRecord, MONEY_SCALE};
pub use queue::{Delivery, QueueDepth, TaskQueue};
pub use task::{
    dead_letter_queue, AccountCreationPayload, Task, TaskKind, TransactionPayload, ACCOUNT_CREATION_QUEUE,
    TRANSACTION_QUEUE,
};
