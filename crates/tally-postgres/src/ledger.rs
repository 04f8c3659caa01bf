use std::str::FromStr;

use tally_core::{LedgerStore, StoreError, TransactionKind, TransactionRecord};

use crate::{pool::ClientPool, store_err, str_to_decimal, str_to_ts, ts_to_str};

const SELECT_RECORD: &str = "SELECT id, account_id, reference_id, amount, kind, previous_balance, new_balance, timestamp
     FROM transactions";

pub struct PostgresLedgerStore {
    pool: ClientPool,
}

impl PostgresLedgerStore {
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let store = Self {
            pool: ClientPool::connect(url)?,
        };
        let mut client = store.pool.get()?;
        client
            .batch_execute(
                "
            CREATE TABLE IF NOT EXISTS transactions (
                seq BIGSERIAL PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                account_id TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                kind TEXT NOT NULL,
                previous_balance TEXT NOT NULL,
                new_balance TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                ts_nanos BIGINT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pg_transactions_account
                ON transactions(account_id);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_pg_transactions_reference
                ON transactions(reference_id);
            ",
            )
            .map_err(store_err)?;
        drop(client);
        Ok(store)
    }
}

fn row_to_record(row: &postgres::Row) -> Result<TransactionRecord, StoreError> {
    Ok(TransactionRecord {
        id: row.get(0),
        account_id: row.get(1),
        reference_id: row.get(2),
        amount: str_to_decimal(row.get(3))?,
        kind: TransactionKind::from_str(row.get(4))?,
        previous_balance: str_to_decimal(row.get(5))?,
        new_balance: str_to_decimal(row.get(6))?,
        timestamp: str_to_ts(row.get(7))?,
    })
}

impl LedgerStore for PostgresLedgerStore {
    fn append(&self, record: &TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let mut client = self.pool.get()?;
        let inserted = client
            .execute(
                "INSERT INTO transactions
                    (id, account_id, reference_id, amount, kind, previous_balance, new_balance, timestamp, ts_nanos)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (reference_id) DO NOTHING",
                &[
                    &record.id,
                    &record.account_id,
                    &record.reference_id,
                    &record.amount.to_string(),
                    &record.kind.as_str(),
                    &record.previous_balance.to_string(),
                    &record.new_balance.to_string(),
                    &ts_to_str(record.timestamp)?,
                    &(record.timestamp.unix_timestamp_nanos() as i64),
                ],
            )
            .map_err(store_err)?;
        if inserted == 0 {
            return Err(StoreError::DuplicateReference(record.reference_id.clone()));
        }
        Ok(record.clone())
    }

    fn list_by_account(&self, account_id: &str) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut client = self.pool.get()?;
        let rows = client
            .query(
                &format!(
                    "{} WHERE account_id = $1 ORDER BY ts_nanos DESC, seq DESC",
                    SELECT_RECORD
                ),
                &[&account_id],
            )
            .map_err(store_err)?;
        rows.iter().map(row_to_record).collect()
    }

    fn get_by_reference(&self, reference_id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let mut client = self.pool.get()?;
        let row = client
            .query_opt(
                &format!("{} WHERE reference_id = $1", SELECT_RECORD),
                &[&reference_id],
            )
            .map_err(store_err)?;
        row.as_ref().map(row_to_record).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_url;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    #[test]
    fn test_pg_append_duplicate_and_list() {
        let Some(url) = test_url() else { return };
        let ledger = PostgresLedgerStore::new(&url).unwrap();
        let account = uuid::Uuid::new_v4().to_string();
        let reference = uuid::Uuid::new_v4().to_string();
        let now = OffsetDateTime::now_utc();

        let record = TransactionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account.clone(),
            reference_id: reference.clone(),
            amount: dec!(50.00),
            kind: TransactionKind::Credit,
            previous_balance: dec!(100.00),
            new_balance: dec!(150.00),
            timestamp: now,
        };
        ledger.append(&record).unwrap();

        let mut duplicate = record.clone();
        duplicate.id = uuid::Uuid::new_v4().to_string();
        duplicate.amount = dec!(1.00);
        assert!(matches!(
            ledger.append(&duplicate),
            Err(StoreError::DuplicateReference(_))
        ));

        let mut later = record.clone();
        later.id = uuid::Uuid::new_v4().to_string();
        later.reference_id = uuid::Uuid::new_v4().to_string();
        later.timestamp = now + time::Duration::seconds(1);
        ledger.append(&later).unwrap();

        let listed = ledger.list_by_account(&account).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].reference_id, later.reference_id);
        assert_eq!(
            ledger.get_by_reference(&reference).unwrap().unwrap().amount,
            dec!(50.00)
        );
    }
}
