//! PostgreSQL balance and ledger backends for tally.
//!
//! Both stores draw blocking `postgres` clients from a small pool so that
//! locks on different accounts proceed concurrently. Must not be called from
//! inside an async runtime; the HTTP layer goes through `spawn_blocking`.

use std::str::FromStr;

use postgres::error::SqlState;
use rust_decimal::Decimal;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use tally_core::StoreError;

pub mod balance;
pub mod ledger;
pub mod pool;

pub use balance::PostgresBalanceStore;
pub use ledger::PostgresLedgerStore;
pub use pool::ClientPool;

pub(crate) fn store_err(e: postgres::Error) -> StoreError {
    if e.is_closed() {
        return StoreError::Unavailable(format!("PostgreSQL connection closed: {}", e));
    }
    match e.code() {
        Some(code) if *code == SqlState::LOCK_NOT_AVAILABLE => StoreError::LockTimeout(e.to_string()),
        Some(code)
            if *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW
                || *code == SqlState::CONNECTION_FAILURE
                || *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED =>
        {
            StoreError::Unavailable(e.to_string())
        }
        Some(code) if *code == SqlState::CHECK_VIOLATION => StoreError::Corrupt(e.to_string()),
        // Errors without a SQLSTATE come from the client side (I/O, TLS).
        None => StoreError::Unavailable(e.to_string()),
        _ => StoreError::Other(e.to_string()),
    }
}

pub(crate) fn is_unique_violation(e: &postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

pub(crate) fn ts_to_str(ts: OffsetDateTime) -> Result<String, StoreError> {
    ts.format(&Rfc3339)
        .map_err(|e| StoreError::Corrupt(format!("unformattable timestamp: {}", e)))
}

pub(crate) fn str_to_ts(s: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp {}: {}", s, e)))
}

pub(crate) fn str_to_decimal(s: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(s).map_err(|e| StoreError::Corrupt(format!("invalid decimal {}: {}", s, e)))
}

#[cfg(test)]
pub(crate) fn test_url() -> Option<String> {
    std::env::var("TALLY_POSTGRES_URL").ok()
}
