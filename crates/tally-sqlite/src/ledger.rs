use std::{str::FromStr, sync::Mutex, time::Duration};

use rusqlite::{params, Connection, OptionalExtension, Row};

use tally_core::{LedgerStore, StoreError, TransactionKind, TransactionRecord};

use crate::{open, store_err, str_to_decimal, str_to_ts, ts_to_str};

const SELECT_RECORD: &str = "SELECT id, account_id, reference_id, amount, kind, previous_balance, new_balance, timestamp
     FROM transactions";

pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    pub fn new(path: &str, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = open(path, busy_timeout).map_err(store_err)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS transactions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                account_id TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                kind TEXT NOT NULL,
                previous_balance TEXT NOT NULL,
                new_balance TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                ts_nanos INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_reference ON transactions(reference_id);
            ",
        )
        .map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

type RawRecord = (String, String, String, String, String, String, String, String);

fn raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn to_record(raw: RawRecord) -> Result<TransactionRecord, StoreError> {
    let (id, account_id, reference_id, amount, kind, previous_balance, new_balance, timestamp) = raw;
    Ok(TransactionRecord {
        id,
        account_id,
        reference_id,
        amount: str_to_decimal(&amount)?,
        kind: TransactionKind::from_str(&kind)?,
        previous_balance: str_to_decimal(&previous_balance)?,
        new_balance: str_to_decimal(&new_balance)?,
        timestamp: str_to_ts(&timestamp)?,
    })
}

impl LedgerStore for SqliteLedgerStore {
    fn append(&self, record: &TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn
            .execute(
                "INSERT INTO transactions
                    (id, account_id, reference_id, amount, kind, previous_balance, new_balance, timestamp, ts_nanos)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (reference_id) DO NOTHING",
                params![
                    record.id,
                    record.account_id,
                    record.reference_id,
                    record.amount.to_string(),
                    record.kind.as_str(),
                    record.previous_balance.to_string(),
                    record.new_balance.to_string(),
                    ts_to_str(record.timestamp)?,
                    record.timestamp.unix_timestamp_nanos() as i64,
                ],
            )
            .map_err(store_err)?;
        if inserted == 0 {
            return Err(StoreError::DuplicateReference(record.reference_id.clone()));
        }
        Ok(record.clone())
    }

    fn list_by_account(&self, account_id: &str) -> Result<Vec<TransactionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE account_id = ?1 ORDER BY ts_nanos DESC, seq DESC",
                SELECT_RECORD
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![account_id], raw_record)
            .map_err(store_err)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(to_record(row.map_err(store_err)?)?);
        }
        Ok(records)
    }

    fn get_by_reference(&self, reference_id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("{} WHERE reference_id = ?1", SELECT_RECORD),
                params![reference_id],
                raw_record,
            )
            .optional()
            .map_err(store_err)?;
        raw.map(to_record).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn record(reference: &str, account: &str, at: OffsetDateTime) -> TransactionRecord {
        TransactionRecord {
            id: format!("tx-{}", reference),
            account_id: account.to_string(),
            reference_id: reference.to_string(),
            amount: dec!(50.00),
            kind: TransactionKind::Credit,
            previous_balance: dec!(100.00),
            new_balance: dec!(150.00),
            timestamp: at,
        }
    }

    #[test]
    fn test_sqlite_append_and_lookup() {
        let ledger = SqliteLedgerStore::new(":memory:", Duration::from_millis(200)).unwrap();
        let now = OffsetDateTime::now_utc();
        ledger.append(&record("r1", "a", now)).unwrap();

        let stored = ledger.get_by_reference("r1").unwrap().unwrap();
        assert_eq!(stored.amount, dec!(50.00));
        assert_eq!(stored.kind, TransactionKind::Credit);
        assert_eq!(stored.previous_balance, dec!(100.00));
        assert_eq!(stored.new_balance, dec!(150.00));
        assert!(ledger.get_by_reference("missing").unwrap().is_none());
    }

    #[test]
    fn test_sqlite_duplicate_reference() {
        let ledger = SqliteLedgerStore::new(":memory:", Duration::from_millis(200)).unwrap();
        let now = OffsetDateTime::now_utc();
        ledger.append(&record("r1", "a", now)).unwrap();

        let mut again = record("r1", "a", now);
        again.id = "tx-other".into();
        again.amount = dec!(1.00);
        let err = ledger.append(&again).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateReference(r) if r == "r1"));
        assert_eq!(ledger.get_by_reference("r1").unwrap().unwrap().amount, dec!(50.00));
        assert_eq!(ledger.list_by_account("a").unwrap().len(), 1);
    }

    #[test]
    fn test_sqlite_list_newest_first() {
        let ledger = SqliteLedgerStore::new(":memory:", Duration::from_millis(200)).unwrap();
        let t0 = OffsetDateTime::now_utc();
        ledger.append(&record("r1", "a", t0)).unwrap();
        ledger.append(&record("r2", "a", t0 + time::Duration::seconds(2))).unwrap();
        ledger.append(&record("r3", "b", t0)).unwrap();
        ledger.append(&record("r4", "a", t0)).unwrap();

        let refs: Vec<_> = ledger
            .list_by_account("a")
            .unwrap()
            .into_iter()
            .map(|r| r.reference_id)
            .collect();
        assert_eq!(refs, vec!["r2", "r4", "r1"]);
        assert!(ledger.list_by_account("nobody").unwrap().is_empty());
    }
}
