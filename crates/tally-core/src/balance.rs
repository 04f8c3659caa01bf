use rust_decimal::Decimal;

use crate::{
    error::StoreError,
    models::{fits_money_scale, Account, NewAccount, TransactionKind},
};

/// Balances produced by a reference id already applied to an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
}

/// Result of a committed (or replayed) balance mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub account: Account,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    /// True when the reference had already been applied and nothing was written.
    pub replayed: bool,
}

/// Exclusive scope over one account row.
///
/// While a lock is held no other scope can be opened on the same account.
/// Dropping the lock without calling `commit` rolls back any staged write
/// and releases it.
pub trait AccountLock {
    fn account(&self) -> &Account;

    /// Looks up a prior application of `reference_id` on this account.
    fn find_application(&mut self, reference_id: &str) -> Result<Option<Application>, StoreError>;

    /// Stages a new balance, optionally recording the reference it applies.
    fn write_balance(&mut self, new_balance: Decimal, reference_id: Option<&str>) -> Result<(), StoreError>;

    /// Persists the staged write and releases the lock.
    fn commit(self: Box<Self>) -> Result<Account, StoreError>;
}

/// Authoritative account balances.
///
/// `update_balance` and `update_balance_once` are the only paths that change
/// a balance; both run read, validate and write inside one `AccountLock`.
pub trait BalanceStore: Send + Sync {
    fn create(&self, account: NewAccount) -> Result<Account, StoreError>;
    fn get(&self, id: &str) -> Result<Account, StoreError>;

    /// Opens an exclusive scope on `id`, waiting at most the store's lock
    /// timeout for a competing scope to finish.
    fn lock_account(&self, id: &str) -> Result<Box<dyn AccountLock + '_>, StoreError>;

    fn update_balance(&self, id: &str, amount: Decimal, kind: TransactionKind) -> Result<BalanceUpdate, StoreError> {
        apply(self.lock_account(id)?, amount, kind, None)
    }

    /// Like `update_balance`, but applies each `reference_id` at most once.
    fn update_balance_once(
        &self,
        id: &str,
        amount: Decimal,
        kind: TransactionKind,
        reference_id: &str,
    ) -> Result<BalanceUpdate, StoreError> {
        apply(self.lock_account(id)?, amount, kind, Some(reference_id))
    }
}

fn apply(
    mut lock: Box<dyn AccountLock + '_>,
    amount: Decimal,
    kind: TransactionKind,
    reference_id: Option<&str>,
) -> Result<BalanceUpdate, StoreError> {
    if let Some(reference_id) = reference_id {
        if let Some(prior) = lock.find_application(reference_id)? {
            return Ok(BalanceUpdate {
                account: lock.account().clone(),
                previous_balance: prior.previous_balance,
                new_balance: prior.new_balance,
                replayed: true,
            });
        }
    }

    if !fits_money_scale(amount) {
        return Err(StoreError::InvalidAmount(amount));
    }
    let previous_balance = lock.account().balance;
    let new_balance = kind.apply(&lock.account().id, previous_balance, amount)?;
    lock.write_balance(new_balance, reference_id)?;
    let account = lock.commit()?;

    Ok(BalanceUpdate {
        account,
        previous_balance,
        new_balance,
        replayed: false,
    })
}
