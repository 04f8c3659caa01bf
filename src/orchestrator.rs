//! Task handlers run by the consumer loop.
//!
//! A transaction task goes through two separate commits: MUTATE on the
//! balance store, then APPEND on the ledger store keyed by the task's
//! reference id. A duplicate APPEND is the idempotent replay of an earlier
//! delivery and counts as success. A delivery whose reference is already in
//! the ledger is acknowledged without touching the balance. Unless replay
//! guarding is enabled, a redelivery after a failed APPEND reaches MUTATE
//! again and applies the balance change twice.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use tally_core::{
    fits_money_scale, Account, AccountCreationPayload, BalanceStore, BalanceUpdate, LedgerStore, NewAccount, StoreError, Task,
    TaskKind, TransactionPayload, TransactionRecord,
};

/// How the consumer resolves a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done; remove from the queue.
    Ack,
    /// Failed for a reason that may go away; deliver again.
    Requeue,
    /// Failed for good; discard without redelivery.
    Drop,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
            Disposition::Drop => "drop",
        }
    }
}

pub trait TaskHandler: Send + Sync {
    fn handle(&self, body: &[u8]) -> Disposition;
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("malformed task: {0}")]
    Malformed(String),
    #[error("unexpected task type {0:?}")]
    WrongKind(TaskKind),
    #[error("invalid amount {0}")]
    InvalidAmount(Decimal),
    #[error("ledger lookup failed: {0}")]
    Lookup(StoreError),
    #[error("balance update failed: {0}")]
    Mutate(StoreError),
    #[error("ledger append failed: {0}")]
    Append(StoreError),
    #[error("account creation failed: {0}")]
    Create(StoreError),
}

impl TaskError {
    pub fn disposition(&self) -> Disposition {
        match self {
            TaskError::Malformed(_) | TaskError::WrongKind(_) | TaskError::InvalidAmount(_) => Disposition::Drop,
            TaskError::Mutate(e) | TaskError::Create(e) if !e.is_transient() => Disposition::Drop,
            TaskError::Mutate(_) | TaskError::Create(_) => Disposition::Requeue,
            TaskError::Lookup(_) => Disposition::Requeue,
            // The balance already moved; the record must eventually land.
            TaskError::Append(_) => Disposition::Requeue,
        }
    }
}

fn decode(body: &[u8], expected: TaskKind) -> Result<Task, TaskError> {
    let task = Task::decode(body).map_err(|e| TaskError::Malformed(e.to_string()))?;
    if task.kind != expected {
        return Err(TaskError::WrongKind(task.kind));
    }
    Ok(task)
}

/// Applies `process_transaction` tasks.
pub struct TransactionProcessor {
    balances: Arc<dyn BalanceStore>,
    ledger: Arc<dyn LedgerStore>,
    guard_replays: bool,
}

impl TransactionProcessor {
    pub fn new(balances: Arc<dyn BalanceStore>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            balances,
            ledger,
            guard_replays: false,
        }
    }

    /// Records each reference id with the balance it changed, so MUTATE is
    /// applied at most once per reference.
    pub fn with_replay_guard(mut self, enabled: bool) -> Self {
        self.guard_replays = enabled;
        self
    }

    pub fn process(&self, body: &[u8]) -> Result<TransactionRecord, TaskError> {
        let task = decode(body, TaskKind::ProcessTransaction)?;
        let payload: TransactionPayload = task.payload().map_err(|e| TaskError::Malformed(e.to_string()))?;
        if payload.account_id.trim().is_empty() || payload.reference_id.trim().is_empty() {
            return Err(TaskError::Malformed("empty account_id or reference_id".to_string()));
        }
        if payload.amount <= Decimal::ZERO || !fits_money_scale(payload.amount) {
            return Err(TaskError::InvalidAmount(payload.amount));
        }

        if let Some(existing) = self
            .ledger
            .get_by_reference(&payload.reference_id)
            .map_err(TaskError::Lookup)?
        {
            tracing::info!(
                task_id = %task.id,
                reference_id = %payload.reference_id,
                "Ledger already holds this reference, skipping balance update"
            );
            return Ok(existing);
        }

        let update = self.mutate(&payload).map_err(TaskError::Mutate)?;
        if update.replayed {
            tracing::info!(
                task_id = %task.id,
                reference_id = %payload.reference_id,
                account_id = %payload.account_id,
                "Balance change already applied, skipping to ledger append"
            );
        }

        let record = TransactionRecord {
            id: Uuid::new_v4().to_string(),
            account_id: payload.account_id.clone(),
            reference_id: payload.reference_id.clone(),
            amount: payload.amount,
            kind: payload.kind,
            previous_balance: update.previous_balance,
            new_balance: update.new_balance,
            timestamp: OffsetDateTime::now_utc(),
        };
        self.append(record)
    }

    fn mutate(&self, payload: &TransactionPayload) -> Result<BalanceUpdate, StoreError> {
        if self.guard_replays {
            self.balances.update_balance_once(
                &payload.account_id,
                payload.amount,
                payload.kind,
                &payload.reference_id,
            )
        } else {
            self.balances
                .update_balance(&payload.account_id, payload.amount, payload.kind)
        }
    }

    fn append(&self, record: TransactionRecord) -> Result<TransactionRecord, TaskError> {
        match self.ledger.append(&record) {
            Ok(stored) => Ok(stored),
            Err(StoreError::DuplicateReference(reference_id)) => {
                tracing::info!(%reference_id, "Ledger already holds this reference, treating as success");
                let existing = self
                    .ledger
                    .get_by_reference(&reference_id)
                    .map_err(TaskError::Append)?;
                Ok(existing.unwrap_or(record))
            }
            Err(e) => Err(TaskError::Append(e)),
        }
    }
}

impl TaskHandler for TransactionProcessor {
    fn handle(&self, body: &[u8]) -> Disposition {
        match self.process(body) {
            Ok(record) => {
                tracing::info!(
                    reference_id = %record.reference_id,
                    account_id = %record.account_id,
                    amount = %record.amount,
                    kind = record.kind.as_str(),
                    previous_balance = %record.previous_balance,
                    new_balance = %record.new_balance,
                    "Transaction applied"
                );
                Disposition::Ack
            }
            Err(e) => {
                let disposition = e.disposition();
                match disposition {
                    Disposition::Requeue => tracing::warn!(error = %e, "Transaction failed, requeueing"),
                    _ => tracing::warn!(error = %e, "Transaction rejected, dropping"),
                }
                disposition
            }
        }
    }
}

/// Applies `create_account` tasks.
pub struct AccountProcessor {
    balances: Arc<dyn BalanceStore>,
}

impl AccountProcessor {
    pub fn new(balances: Arc<dyn BalanceStore>) -> Self {
        Self { balances }
    }

    pub fn process(&self, body: &[u8]) -> Result<Account, TaskError> {
        let task = decode(body, TaskKind::CreateAccount)?;
        let payload: AccountCreationPayload = task.payload().map_err(|e| TaskError::Malformed(e.to_string()))?;
        if payload.name.trim().is_empty() {
            return Err(TaskError::Malformed("empty name".to_string()));
        }
        if payload.initial_amount < Decimal::ZERO || !fits_money_scale(payload.initial_amount) {
            return Err(TaskError::InvalidAmount(payload.initial_amount));
        }

        // Tasks without an assigned id fall back to the task id so that a
        // redelivery still maps to the same account.
        let id = payload.account_id.unwrap_or_else(|| task.id.clone());
        let account = NewAccount {
            id: id.clone(),
            name: payload.name,
            opening_balance: payload.initial_amount,
        };
        match self.balances.create(account) {
            Ok(account) => Ok(account),
            Err(StoreError::DuplicateAccount(_)) => {
                tracing::info!(task_id = %task.id, account_id = %id, "Account already created by an earlier delivery");
                self.balances.get(&id).map_err(TaskError::Create)
            }
            Err(e) => Err(TaskError::Create(e)),
        }
    }
}

impl TaskHandler for AccountProcessor {
    fn handle(&self, body: &[u8]) -> Disposition {
        match self.process(body) {
            Ok(account) => {
                tracing::info!(account_id = %account.id, balance = %account.balance, "Account created");
                Disposition::Ack
            }
            Err(e) => {
                let disposition = e.disposition();
                tracing::warn!(error = %e, disposition = disposition.as_str(), "Account creation failed");
                disposition
            }
        }
    }
}
