use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, RwLock},
    time::Duration,
};

use rust_decimal::Decimal;
use time::OffsetDateTime;

use tally_core::{Account, AccountLock, Application, BalanceStore, NewAccount, StoreError};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

struct RowState {
    account: Account,
    locked: bool,
    applications: HashMap<String, Application>,
}

/// One account row. `locked` is the exclusive-scope flag; waiters park on
/// `released` until it clears.
struct Row {
    state: Mutex<RowState>,
    released: Condvar,
}

/// Balance store keeping every account in process memory.
///
/// Each row has its own lock, so mutations on different accounts never
/// wait for each other.
pub struct InMemoryBalanceStore {
    rows: RwLock<HashMap<String, Arc<Row>>>,
    lock_timeout: Duration,
}

impl Default for InMemoryBalanceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            lock_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row(&self, id: &str) -> Result<Arc<Row>, StoreError> {
        self.rows
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::AccountNotFound(id.to_string()))
    }
}

impl BalanceStore for InMemoryBalanceStore {
    fn create(&self, account: NewAccount) -> Result<Account, StoreError> {
        let mut rows = self.rows.write().unwrap();
        if rows.contains_key(&account.id) {
            return Err(StoreError::DuplicateAccount(account.id));
        }
        let account = account.into_account(OffsetDateTime::now_utc());
        rows.insert(
            account.id.clone(),
            Arc::new(Row {
                state: Mutex::new(RowState {
                    account: account.clone(),
                    locked: false,
                    applications: HashMap::new(),
                }),
                released: Condvar::new(),
            }),
        );
        tracing::debug!(account_id = %account.id, "Account created");
        Ok(account)
    }

    fn get(&self, id: &str) -> Result<Account, StoreError> {
        let row = self.row(id)?;
        let state = row.state.lock().unwrap();
        Ok(state.account.clone())
    }

    fn lock_account(&self, id: &str) -> Result<Box<dyn AccountLock + '_>, StoreError> {
        let row = self.row(id)?;
        let snapshot = {
            let guard = row.state.lock().unwrap();
            let (mut guard, wait) = row
                .released
                .wait_timeout_while(guard, self.lock_timeout, |state| state.locked)
                .unwrap();
            if wait.timed_out() && guard.locked {
                return Err(StoreError::LockTimeout(id.to_string()));
            }
            guard.locked = true;
            guard.account.clone()
        };

        Ok(Box::new(MemoryAccountLock {
            row,
            snapshot,
            staged: None,
            released: false,
        }))
    }
}

struct MemoryAccountLock {
    row: Arc<Row>,
    snapshot: Account,
    staged: Option<(Decimal, Option<String>)>,
    released: bool,
}

impl MemoryAccountLock {
    fn release(&mut self, state: &mut RowState) {
        state.locked = false;
        self.released = true;
        self.row.released.notify_all();
    }
}

impl AccountLock for MemoryAccountLock {
    fn account(&self) -> &Account {
        &self.snapshot
    }

    fn find_application(&mut self, reference_id: &str) -> Result<Option<Application>, StoreError> {
        let state = self.row.state.lock().unwrap();
        Ok(state.applications.get(reference_id).cloned())
    }

    fn write_balance(&mut self, new_balance: Decimal, reference_id: Option<&str>) -> Result<(), StoreError> {
        if new_balance < Decimal::ZERO {
            return Err(StoreError::Corrupt(format!(
                "refusing negative balance {} for {}",
                new_balance, self.snapshot.id
            )));
        }
        self.staged = Some((new_balance, reference_id.map(str::to_string)));
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<Account, StoreError> {
        let row = self.row.clone();
        let mut state = row.state.lock().unwrap();
        if let Some((new_balance, reference_id)) = self.staged.take() {
            let previous_balance = state.account.balance;
            state.account.balance = new_balance;
            state.account.updated_at = OffsetDateTime::now_utc();
            if let Some(reference_id) = reference_id {
                state.applications.insert(
                    reference_id,
                    Application {
                        previous_balance,
                        new_balance,
                    },
                );
            }
        }
        let account = state.account.clone();
        self.release(&mut state);
        Ok(account)
    }
}

impl Drop for MemoryAccountLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let row = self.row.clone();
        let mut state = match row.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.release(&mut state);
        tracing::debug!(account_id = %self.snapshot.id, "Account lock rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::thread;
    use tally_core::TransactionKind;

    fn store_with(id: &str, balance: Decimal) -> InMemoryBalanceStore {
        let store = InMemoryBalanceStore::new();
        store
            .create(NewAccount {
                id: id.to_string(),
                name: "Alice".to_string(),
                opening_balance: balance,
            })
            .unwrap();
        store
    }

    #[test]
    fn test_create_and_get() {
        let store = store_with("a", dec!(100.00));
        let account = store.get("a").unwrap();
        assert_eq!(account.balance, dec!(100.00));
        assert_eq!(account.name, "Alice");
        assert!(matches!(store.get("missing"), Err(StoreError::AccountNotFound(_))));
    }

    #[test]
    fn test_duplicate_account() {
        let store = store_with("a", dec!(1));
        let err = store
            .create(NewAccount {
                id: "a".into(),
                name: "Other".into(),
                opening_balance: dec!(5),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAccount(_)));
        assert_eq!(store.get("a").unwrap().name, "Alice");
    }

    #[test]
    fn test_credit_and_debit() {
        let store = store_with("a", dec!(100.00));
        let update = store.update_balance("a", dec!(50.00), TransactionKind::Credit).unwrap();
        assert_eq!(update.previous_balance, dec!(100.00));
        assert_eq!(update.new_balance, dec!(150.00));
        assert_eq!(update.account.balance, dec!(150.00));

        store.update_balance("a", dec!(150.00), TransactionKind::Debit).unwrap();
        assert_eq!(store.get("a").unwrap().balance, dec!(0.00));
    }

    #[test]
    fn test_overdraft_leaves_balance_unchanged() {
        let store = store_with("a", dec!(100.00));
        let err = store.update_balance("a", dec!(100.01), TransactionKind::Debit).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientFunds { .. }));
        assert_eq!(store.get("a").unwrap().balance, dec!(100.00));
        // the failed attempt must have released the row
        store.update_balance("a", dec!(1), TransactionKind::Debit).unwrap();
    }

    #[test]
    fn test_sub_cent_amount_rejected() {
        let store = store_with("a", dec!(0.01));
        let err = store.update_balance("a", dec!(0.005), TransactionKind::Debit).unwrap_err();
        assert!(matches!(err, StoreError::InvalidAmount(_)));
        assert!(!err.is_transient());
        assert_eq!(store.get("a").unwrap().balance, dec!(0.01));
        store.update_balance("a", dec!(0.010), TransactionKind::Debit).unwrap();
        assert_eq!(store.get("a").unwrap().balance, dec!(0.00));
    }

    #[test]
    fn test_missing_account_update() {
        let store = InMemoryBalanceStore::new();
        let err = store.update_balance("nope", dec!(1), TransactionKind::Credit).unwrap_err();
        assert!(matches!(err, StoreError::AccountNotFound(_)));
    }

    #[test]
    fn test_lock_timeout() {
        let store = InMemoryBalanceStore::with_lock_timeout(Duration::from_millis(20));
        store
            .create(NewAccount { id: "a".into(), name: "A".into(), opening_balance: dec!(1) })
            .unwrap();
        let _held = store.lock_account("a").unwrap();
        let err = store.update_balance("a", dec!(1), TransactionKind::Credit).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_different_accounts_do_not_block() {
        let store = InMemoryBalanceStore::with_lock_timeout(Duration::from_millis(20));
        for id in ["a", "b"] {
            store
                .create(NewAccount { id: id.into(), name: id.into(), opening_balance: dec!(1) })
                .unwrap();
        }
        let _held = store.lock_account("a").unwrap();
        store.update_balance("b", dec!(1), TransactionKind::Credit).unwrap();
        assert_eq!(store.get("b").unwrap().balance, dec!(2));
    }

    #[test]
    fn test_dropped_lock_rolls_back() {
        let store = store_with("a", dec!(10));
        {
            let mut lock = store.lock_account("a").unwrap();
            lock.write_balance(dec!(999), None).unwrap();
        }
        assert_eq!(store.get("a").unwrap().balance, dec!(10));
    }

    #[test]
    fn test_update_once_replays() {
        let store = store_with("a", dec!(100.00));
        let first = store
            .update_balance_once("a", dec!(30.00), TransactionKind::Debit, "ref-1")
            .unwrap();
        assert!(!first.replayed);
        let second = store
            .update_balance_once("a", dec!(30.00), TransactionKind::Debit, "ref-1")
            .unwrap();
        assert!(second.replayed);
        assert_eq!(second.previous_balance, dec!(100.00));
        assert_eq!(second.new_balance, dec!(70.00));
        assert_eq!(store.get("a").unwrap().balance, dec!(70.00));
    }

    #[test]
    fn test_concurrent_debits_never_overdraw() {
        let store = Arc::new(store_with("a", dec!(100.00)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || store.update_balance("a", dec!(30.00), TransactionKind::Debit).is_ok())
            })
            .collect();
        let succeeded = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(succeeded, 3);
        assert_eq!(store.get("a").unwrap().balance, dec!(10.00));
    }
}
