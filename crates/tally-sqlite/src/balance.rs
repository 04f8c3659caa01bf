use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use time::OffsetDateTime;

use tally_core::{Account, AccountLock, Application, BalanceStore, NewAccount, StoreError};

use crate::{is_busy, open, store_err, str_to_decimal, str_to_ts, ts_to_str};

const SELECT_ACCOUNT: &str = "SELECT id, name, balance, created_at, updated_at FROM accounts WHERE id = ?1";

pub struct SqliteBalanceStore {
    conn: Mutex<Connection>,
}

impl SqliteBalanceStore {
    pub fn new(path: &str, lock_timeout: Duration) -> Result<Self, StoreError> {
        let conn = open(path, lock_timeout).map_err(store_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                balance TEXT NOT NULL CHECK (CAST(balance AS REAL) >= 0),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS balance_applications (
                reference_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id),
                previous_balance TEXT NOT NULL,
                new_balance TEXT NOT NULL
            );
            ",
        )
        .map_err(store_err)?;
        Ok(())
    }
}

fn read_account(conn: &Connection, id: &str) -> Result<Option<Account>, StoreError> {
    let row = conn
        .query_row(SELECT_ACCOUNT, params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .optional()
        .map_err(store_err)?;

    match row {
        Some((id, name, balance, created_at, updated_at)) => Ok(Some(Account {
            id,
            name,
            balance: str_to_decimal(&balance)?,
            created_at: str_to_ts(&created_at)?,
            updated_at: str_to_ts(&updated_at)?,
        })),
        None => Ok(None),
    }
}

impl BalanceStore for SqliteBalanceStore {
    fn create(&self, account: NewAccount) -> Result<Account, StoreError> {
        let account = account.into_account(OffsetDateTime::now_utc());
        let conn = self.conn.lock().unwrap();
        let inserted = conn
            .execute(
                "INSERT INTO accounts (id, name, balance, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO NOTHING",
                params![
                    account.id,
                    account.name,
                    account.balance.to_string(),
                    ts_to_str(account.created_at)?,
                    ts_to_str(account.updated_at)?,
                ],
            )
            .map_err(store_err)?;
        if inserted == 0 {
            return Err(StoreError::DuplicateAccount(account.id));
        }
        tracing::debug!(account_id = %account.id, "SQLite account created");
        Ok(account)
    }

    fn get(&self, id: &str) -> Result<Account, StoreError> {
        let conn = self.conn.lock().unwrap();
        read_account(&conn, id)?.ok_or_else(|| StoreError::AccountNotFound(id.to_string()))
    }

    fn lock_account(&self, id: &str) -> Result<Box<dyn AccountLock + '_>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| {
            if is_busy(&e) {
                StoreError::LockTimeout(id.to_string())
            } else {
                store_err(e)
            }
        })?;

        let account = match read_account(&conn, id) {
            Ok(Some(account)) => account,
            Ok(None) => {
                rollback(&conn);
                return Err(StoreError::AccountNotFound(id.to_string()));
            }
            Err(e) => {
                rollback(&conn);
                return Err(e);
            }
        };
        tracing::debug!(account_id = id, "SQLite account locked");
        Ok(Box::new(SqliteAccountLock {
            conn,
            account,
            staged: None,
            finished: false,
        }))
    }
}

fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        tracing::warn!(error = %e, "SQLite rollback failed");
    }
}

struct SqliteAccountLock<'a> {
    conn: MutexGuard<'a, Connection>,
    account: Account,
    staged: Option<(Decimal, Option<String>)>,
    finished: bool,
}

impl AccountLock for SqliteAccountLock<'_> {
    fn account(&self) -> &Account {
        &self.account
    }

    fn find_application(&mut self, reference_id: &str) -> Result<Option<Application>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT previous_balance, new_balance FROM balance_applications
                 WHERE reference_id = ?1 AND account_id = ?2",
                params![reference_id, self.account.id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(store_err)?;
        match row {
            Some((previous, new)) => Ok(Some(Application {
                previous_balance: str_to_decimal(&previous)?,
                new_balance: str_to_decimal(&new)?,
            })),
            None => Ok(None),
        }
    }

    fn write_balance(&mut self, new_balance: Decimal, reference_id: Option<&str>) -> Result<(), StoreError> {
        self.staged = Some((new_balance, reference_id.map(str::to_string)));
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<Account, StoreError> {
        let mut account = self.account.clone();
        if let Some((new_balance, reference_id)) = self.staged.take() {
            let now = OffsetDateTime::now_utc();
            self.conn
                .execute(
                    "UPDATE accounts SET balance = ?1, updated_at = ?2 WHERE id = ?3",
                    params![new_balance.to_string(), ts_to_str(now)?, account.id],
                )
                .map_err(store_err)?;
            if let Some(reference_id) = reference_id {
                self.conn
                    .execute(
                        "INSERT INTO balance_applications (reference_id, account_id, previous_balance, new_balance)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            reference_id,
                            account.id,
                            account.balance.to_string(),
                            new_balance.to_string()
                        ],
                    )
                    .map_err(store_err)?;
            }
            account.balance = new_balance;
            account.updated_at = now;
        }
        self.conn.execute_batch("COMMIT").map_err(store_err)?;
        self.finished = true;
        tracing::debug!(account_id = %account.id, "SQLite account lock committed");
        Ok(account)
    }
}

impl Drop for SqliteAccountLock<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        rollback(&self.conn);
        tracing::debug!(account_id = %self.account.id, "SQLite account lock released without commit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tally_core::TransactionKind;

    fn store() -> SqliteBalanceStore {
        let store = SqliteBalanceStore::new(":memory:", Duration::from_millis(200)).unwrap();
        store
            .create(NewAccount {
                id: "a".into(),
                name: "Alice".into(),
                opening_balance: dec!(100.00),
            })
            .unwrap();
        store
    }

    #[test]
    fn test_sqlite_create_and_get() {
        let store = store();
        let account = store.get("a").unwrap();
        assert_eq!(account.balance, dec!(100.00));
        assert_eq!(account.name, "Alice");
        assert!(matches!(store.get("b"), Err(StoreError::AccountNotFound(_))));

        let err = store
            .create(NewAccount { id: "a".into(), name: "X".into(), opening_balance: dec!(0) })
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAccount(_)));
    }

    #[test]
    fn test_sqlite_update_balance() {
        let store = store();
        let update = store.update_balance("a", dec!(50.00), TransactionKind::Credit).unwrap();
        assert_eq!(update.previous_balance, dec!(100.00));
        assert_eq!(update.new_balance, dec!(150.00));
        assert_eq!(store.get("a").unwrap().balance, dec!(150.00));
    }

    #[test]
    fn test_sqlite_overdraft_rolls_back() {
        let store = store();
        let err = store.update_balance("a", dec!(100.01), TransactionKind::Debit).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientFunds { .. }));
        assert_eq!(store.get("a").unwrap().balance, dec!(100.00));
        // connection is usable again after the rollback
        store.update_balance("a", dec!(100.00), TransactionKind::Debit).unwrap();
        assert_eq!(store.get("a").unwrap().balance, dec!(0.00));
    }

    #[test]
    fn test_sqlite_missing_account_releases_transaction() {
        let store = store();
        assert!(matches!(
            store.update_balance("nope", dec!(1), TransactionKind::Credit),
            Err(StoreError::AccountNotFound(_))
        ));
        store.update_balance("a", dec!(1), TransactionKind::Credit).unwrap();
    }

    #[test]
    fn test_sqlite_update_once() {
        let store = store();
        store.update_balance_once("a", dec!(60.00), TransactionKind::Debit, "r1").unwrap();
        let replay = store.update_balance_once("a", dec!(60.00), TransactionKind::Debit, "r1").unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.new_balance, dec!(40.00));
        assert_eq!(store.get("a").unwrap().balance, dec!(40.00));
    }

    #[test]
    fn test_sqlite_balance_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balances.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteBalanceStore::new(path, Duration::from_millis(200)).unwrap();
            store
                .create(NewAccount { id: "a".into(), name: "A".into(), opening_balance: dec!(5.50) })
                .unwrap();
            store.update_balance("a", dec!(4.50), TransactionKind::Credit).unwrap();
        }
        let store = SqliteBalanceStore::new(path, Duration::from_millis(200)).unwrap();
        assert_eq!(store.get("a").unwrap().balance, dec!(10.00));
    }
}
