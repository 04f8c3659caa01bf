use crate::{error::StoreError, models::TransactionRecord};

/// Append-only transaction history.
pub trait LedgerStore: Send + Sync {
    /// Appends `record`. Fails with `DuplicateReference` if a record with the
    /// same `reference_id` exists; the stored record is left untouched.
    fn append(&self, record: &TransactionRecord) -> Result<TransactionRecord, StoreError>;

    /// All records for `account_id`, newest first.
    fn list_by_account(&self, account_id: &str) -> Result<Vec<TransactionRecord>, StoreError>;

    fn get_by_reference(&self, reference_id: &str) -> Result<Option<TransactionRecord>, StoreError>;
}
