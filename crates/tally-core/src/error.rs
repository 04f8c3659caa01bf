use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("account already exists: {0}")]
    DuplicateAccount(String),
    #[error("insufficient funds in {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account_id: String,
        balance: Decimal,
        requested: Decimal,
    },
    #[error("amount {0} is not a whole number of cents")]
    InvalidAmount(Decimal),
    #[error("duplicate reference: {0}")]
    DuplicateReference(String),
    #[error("timed out waiting for lock on account {0}")]
    LockTimeout(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt data: {0}")]
    Corrupt(String),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Whether retrying the same request later may succeed.
    ///
    /// Missing accounts, overdrafts and duplicates are decided by the data
    /// and are permanent; lock timeouts and connectivity failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout(_) | StoreError::Unavailable(_) | StoreError::Other(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to encode task: {0}")]
    Encode(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("unknown delivery {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },
    #[error("{0}")]
    Other(String),
}
