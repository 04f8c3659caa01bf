use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use tally_core::{LedgerStore, StoreError, TransactionRecord};

#[derive(Default)]
struct LedgerState {
    records: Vec<TransactionRecord>,
    by_reference: HashMap<String, usize>,
    by_account: BTreeMap<String, Vec<usize>>,
}

/// Ledger store holding records in insertion order with a unique index on
/// `reference_id` and a per-account index.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    inner: RwLock<LedgerState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn append(&self, record: &TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let mut state = self.inner.write().unwrap();
        if state.by_reference.contains_key(&record.reference_id) {
            return Err(StoreError::DuplicateReference(record.reference_id.clone()));
        }
        let position = state.records.len();
        state.records.push(record.clone());
        state.by_reference.insert(record.reference_id.clone(), position);
        state
            .by_account
            .entry(record.account_id.clone())
            .or_default()
            .push(position);
        Ok(record.clone())
    }

    fn list_by_account(&self, account_id: &str) -> Result<Vec<TransactionRecord>, StoreError> {
        let state = self.inner.read().unwrap();
        let mut result: Vec<(usize, TransactionRecord)> = state
            .by_account
            .get(account_id)
            .map(|positions| {
                positions
                    .iter()
                    .map(|p| (*p, state.records[*p].clone()))
                    .collect()
            })
            .unwrap_or_default();
        result.sort_by(|(pa, a), (pb, b)| b.timestamp.cmp(&a.timestamp).then(pb.cmp(pa)));
        Ok(result.into_iter().map(|(_, r)| r).collect())
    }

    fn get_by_reference(&self, reference_id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let state = self.inner.read().unwrap();
        Ok(state
            .by_reference
            .get(reference_id)
            .map(|p| state.records[*p].clone()))
    }
}
