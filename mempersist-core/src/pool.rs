/*!
Transaction pool port.

The persistence engine never owns the pool. It is handed a [`TransactionPool`]
for each capture or reload, which keeps the pool injectable and lets tests
substitute a fake. [`MemoryPool`] is a minimal reference implementation: it
only enforces "no duplicates" and "parents must already be present", leaving
real admission policy to the node.
*/

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use bytes::Bytes;

use crate::error::{AdmissionError, PoolError};
use crate::record::{EntryMetadata, PoolState, TransactionRecord, TxId};

/// A read-consistent copy of the pool taken at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolView {
    pub state: PoolState,
    /// Entries in no particular order
    pub entries: Vec<TransactionRecord>,
    pub fee_deltas: BTreeMap<TxId, i64>,
}

/// Interface the persistence engine needs from an in-memory pool
///
/// Implementations must make [`enumerate`](TransactionPool::enumerate) return
/// one coherent view (hold a read lock for the copy, or equivalent) and must
/// release any lock before returning.
#[cfg_attr(test, mockall::automock)]
pub trait TransactionPool {
    /// Copy out every entry plus fee deltas and the chain-state marker
    fn enumerate(&self) -> Result<PoolView, PoolError>;

    /// Submit a reloaded transaction through the normal admission rules
    fn admit(&self, payload: &Bytes, meta: &EntryMetadata) -> Result<(), AdmissionError>;

    /// Whether a transaction is currently pooled
    fn contains(&self, txid: &TxId) -> bool;

    /// The chain position the pool is currently synced to
    fn chain_state(&self) -> PoolState;

    /// Add to the operator fee delta of a transaction, pooled or not
    fn prioritise(&self, _txid: &TxId, _delta: i64) {}
}

#[derive(Debug, Default)]
struct PoolInner {
    state: PoolState,
    entries: HashMap<TxId, TransactionRecord>,
    fee_deltas: BTreeMap<TxId, i64>,
}

/// Thread-safe in-memory pool used by the CLI and the test-suite
#[derive(Debug, Default)]
pub struct MemoryPool {
    inner: RwLock<PoolInner>,
}

impl MemoryPool {
    pub fn new(state: PoolState) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                state,
                ..PoolInner::default()
            }),
        }
    }

    /// Insert a transaction under the same rules as reload admission
    pub fn insert(&self, record: TransactionRecord) -> Result<(), AdmissionError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| AdmissionError::Rejected("pool lock poisoned".to_string()))?;

        let txid = record.txid();
        if inner.entries.contains_key(&txid) {
            return Err(AdmissionError::AlreadyInPool);
        }
        if record
            .meta
            .parents
            .iter()
            .any(|parent| !inner.entries.contains_key(parent))
        {
            return Err(AdmissionError::MissingInputs);
        }
        inner.entries.insert(txid, record);
        Ok(())
    }

    /// Drop a transaction, e.g. once it has been mined
    pub fn remove(&self, txid: &TxId) -> Option<TransactionRecord> {
        self.inner
            .write()
            .ok()
            .and_then(|mut inner| inner.entries.remove(txid))
    }

    pub fn set_chain_state(&self, state: PoolState) {
        if let Ok(mut inner) = self.inner.write() {
            inner.state = state;
        }
    }

    pub fn fee_delta(&self, txid: &TxId) -> i64 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.fee_deltas.get(txid).copied())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pooled txids, sorted
    pub fn txids(&self) -> Vec<TxId> {
        let mut ids: Vec<TxId> = self
            .inner
            .read()
            .map(|inner| inner.entries.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl TransactionPool for MemoryPool {
    fn enumerate(&self) -> Result<PoolView, PoolError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| PoolError("pool lock poisoned".to_string()))?;

        let entries = inner
            .entries
            .values()
            .map(|record| {
                let mut record = record.clone();
                record.meta.fee_delta = inner.fee_deltas.get(&record.txid()).copied().unwrap_or(0);
                record
            })
            .collect();

        Ok(PoolView {
            state: inner.state,
            entries,
            fee_deltas: inner.fee_deltas.clone(),
        })
    }

    fn admit(&self, payload: &Bytes, meta: &EntryMetadata) -> Result<(), AdmissionError> {
        self.insert(TransactionRecord::new(payload.clone(), meta.clone()))
    }

    fn contains(&self, txid: &TxId) -> bool {
        self.inner
            .read()
            .map(|inner| inner.entries.contains_key(txid))
            .unwrap_or(false)
    }

    fn chain_state(&self) -> PoolState {
        self.inner
            .read()
            .map(|inner| inner.state)
            .unwrap_or_default()
    }

    fn prioritise(&self, txid: &TxId, delta: i64) {
        if let Ok(mut inner) = self.inner.write() {
            let entry = inner.fee_deltas.entry(*txid).or_insert(0);
            *entry = entry.saturating_add(delta);
            if *entry == 0 {
                inner.fee_deltas.remove(txid);
            }
        }
    }
}
