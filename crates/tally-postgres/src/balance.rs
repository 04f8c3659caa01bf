use std::time::Duration;

use postgres::Client;
use rust_decimal::Decimal;
use time::OffsetDateTime;

use tally_core::{Account, AccountLock, Application, BalanceStore, NewAccount, StoreError};

use crate::{
    is_unique_violation,
    pool::{ClientPool, PooledClient},
    store_err, str_to_decimal, str_to_ts, ts_to_str,
};

pub struct PostgresBalanceStore {
    pool: ClientPool,
    lock_timeout: Duration,
}

impl PostgresBalanceStore {
    pub fn new(url: &str, lock_timeout: Duration) -> Result<Self, StoreError> {
        let store = Self {
            pool: ClientPool::connect(url)?,
            lock_timeout,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let mut client = self.pool.get()?;
        client
            .batch_execute(
                "
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                balance TEXT NOT NULL CHECK (balance::numeric >= 0),
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

fn row_to_account(row: &postgres::Row) -> Result<Account, StoreError> {
    Ok(Account {
        id: row.get(0),
        name: row.get(1),
        balance: str_to_decimal(row.get(2))?,
        created_at: str_to_ts(row.get(3))?,
        updated_at: str_to_ts(row.get(4))?,
    })
}

impl BalanceStore for PostgresBalanceStore {
    fn create(&self, account: NewAccount) -> Result<Account, StoreError> {
        let account = account.into_account(OffsetDateTime::now_utc());
        let mut client = self.pool.get()?;
        client
            .execute(
                "INSERT INTO accounts (id, name, balance, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &account.id,
                    &account.name,
                    &account.balance.to_string(),
                    &ts_to_str(account.created_at)?,
                    &ts_to_str(account.updated_at)?,
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateAccount(account.id.clone())
                } else {
                    store_err(e)
                }
            })?;
        tracing::debug!(account_id = %account.id, "PostgreSQL account created");
        Ok(account)
    }

    fn get(&self, id: &str) -> Result<Account, StoreError> {
        let mut client = self.pool.get()?;
        let row = client
            .query_opt(
                "SELECT id, name, balance, created_at, updated_at FROM accounts WHERE id = $1",
                &[&id],
            )
            .map_err(store_err)?
            .ok_or_else(|| StoreError::AccountNotFound(id.to_string()))?;
        row_to_account(&row)
    }

    fn lock_account(&self, id: &str) -> Result<Box<dyn AccountLock + '_>, StoreError> {
        let mut client = self.pool.get()?;
        client.batch_execute("BEGIN").map_err(store_err)?;

        match select_for_update(&mut client, id, self.lock_timeout) {
            Ok(account) => {
                tracing::debug!(account_id = id, "PostgreSQL account locked");
                Ok(Box::new(PostgresAccountLock {
                    client,
                    account,
                    staged: None,
                    finished: false,
                }))
            }
            Err(e) => {
                rollback(&mut client);
                Err(e)
            }
        }
    }
}

fn select_for_update(client: &mut Client, id: &str, lock_timeout: Duration) -> Result<Account, StoreError> {
    client
        .batch_execute(&format!("SET LOCAL lock_timeout = '{}ms'", lock_timeout.as_millis()))
        .map_err(store_err)?;
    let row = client
        .query_opt(
            "SELECT id, name, balance, created_at, updated_at FROM accounts
             WHERE id = $1 FOR UPDATE",
            &[&id],
        )
        .map_err(|e| match store_err(e) {
            StoreError::LockTimeout(_) => StoreError::LockTimeout(id.to_string()),
            other => other,
        })?
        .ok_or_else(|| StoreError::AccountNotFound(id.to_string()))?;
    row_to_account(&row)
}

/// Ends the open transaction; a client that cannot roll back is not reused.
fn rollback(client: &mut PooledClient<'_>) {
    if let Err(e) = client.batch_execute("ROLLBACK") {
        tracing::warn!(error = %e, "PostgreSQL rollback failed, discarding connection");
        client.discard();
    }
}

struct PostgresAccountLock<'a> {
    client: PooledClient<'a>,
    account: Account,
    staged: Option<(Decimal, Option<String>)>,
    finished: bool,
}

impl AccountLock for PostgresAccountLock<'_> {
    fn account(&self) -> &Account {
        &self.account
    }

    fn find_application(&mut self, reference_id: &str) -> Result<Option<Application>, StoreError> {
        let account_id = self.account.id.clone();
        let row = self
            .client
            .query_opt(
                "SELECT previous_balance, new_balance FROM balance_applications
                 WHERE reference_id = $1 AND account_id = $2",
                &[&reference_id, &account_id],
            )
            .map_err(store_err)?;
        match row {
            Some(row) => Ok(Some(Application {
                previous_balance: str_to_decimal(row.get(0))?,
                new_balance: str_to_decimal(row.get(1))?,
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
            self.client
                .execute(
                    "UPDATE accounts SET balance = $1, updated_at = $2 WHERE id = $3",
                    &[&new_balance.to_string(), &ts_to_str(now)?, &account.id],
                )
                .map_err(store_err)?;
            if let Some(reference_id) = reference_id {
                self.client
                    .execute(
                        "INSERT INTO balance_applications (reference_id, account_id, previous_balance, new_balance)
                         VALUES ($1, $2, $3, $4)",
                        &[
                            &reference_id,
                            &account.id,
                            &account.balance.to_string(),
                            &new_balance.to_string(),
                        ],
                    )
                    .map_err(store_err)?;
            }
            account.balance = new_balance;
            account.updated_at = now;
        }
        self.client.batch_execute("COMMIT").map_err(store_err)?;
        self.finished = true;
        tracing::debug!(account_id = %account.id, "PostgreSQL account lock committed");
        Ok(account)
    }
}

impl Drop for PostgresAccountLock<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        rollback(&mut self.client);
        tracing::debug!(account_id = %self.account.id, "PostgreSQL account lock released without commit");
    }
}
