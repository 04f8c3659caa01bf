//! SQLite backends for tally.
//!
//! Durable single-node storage: each store owns one connection to the
//! database file (several stores may share a file). Cross-process
//! writers serialize through `BEGIN IMMEDIATE` and wait at most the
//! configured busy timeout.

use std::{str::FromStr, time::Duration};

use rusqlite::{Connection, ErrorCode};
use rust_decimal::Decimal;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use tally_core::StoreError;

pub mod balance;
pub mod ledger;
pub mod queue;

pub use balance::SqliteBalanceStore;
pub use ledger::SqliteLedgerStore;
pub use queue::SqliteTaskQueue;

pub(crate) fn open(path: &str, busy_timeout: Duration) -> Result<Connection, rusqlite::Error> {
    let conn = if path == ":memory:" {
        Connection::open_in_memory()
    } else {
        Connection::open(path)
    }?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub(crate) fn store_err(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StoreError::Unavailable(format!("database busy: {}", e))
        }
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::SystemIoFailure) | Some(ErrorCode::DiskFull) => {
            StoreError::Unavailable(e.to_string())
        }
        Some(ErrorCode::ConstraintViolation) => StoreError::Corrupt(e.to_string()),
        _ => StoreError::Other(e.to_string()),
    }
}

pub(crate) fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
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
