/*!
Startup loader: reads the mempool file and feeds its records back into the
pool through normal admission.

Reloading is additive. Transactions already in the pool stay as they are and
are only counted. Fee deltas recorded with a transaction are reapplied even
when the transaction itself is not re-admitted.

Records are tried in stored order, so a parent is always attempted before any
child; a record whose parent did not make it back into the pool is skipped
rather than failing the whole load.
*/

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::codec;
use crate::error::LoadError;
use crate::pool::TransactionPool;
use crate::record::{Snapshot, TxId};
use crate::storage::StorageAdapter;

/// Parameters for one reload
#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Records that arrived earlier than `now - expiry` are dropped
    pub expiry: Duration,
    pub now: DateTime<Utc>,
}

impl RestoreOptions {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Oldest arrival time still kept; nothing expires if the window reaches
    /// past the representable range
    fn cutoff(&self) -> DateTime<Utc> {
        self.now
            .checked_sub_signed(self.expiry)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Outcome counters of one reload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub admitted: u64,
    pub failed: u64,
    pub expired: u64,
    pub already_present: u64,
    pub missing_dependency: u64,
    pub deltas_applied: u64,
}

impl LoadStats {
    pub fn skipped(&self) -> u64 {
        self.failed + self.expired + self.already_present + self.missing_dependency
    }
}

/// Read and decode the mempool file at `path`
///
/// A missing file is [`LoadError::NotFound`], which callers treat as a cold
/// start rather than a failure.
pub fn load<S>(storage: &S, path: &Path) -> Result<Snapshot, LoadError>
where
    S: StorageAdapter + ?Sized,
{
    let data = storage.read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LoadError::NotFound(path.to_path_buf())
        } else {
            LoadError::Io(e)
        }
    })?;

    let snapshot = codec::decode(&data)?;
    debug!(
        "Decoded {} mempool records ({} bytes) from {}",
        snapshot.records.len(),
        data.len(),
        path.display()
    );
    Ok(snapshot)
}

/// Re-admit the records of `snapshot` into `pool`
pub fn restore<P>(pool: &P, snapshot: Snapshot, options: &RestoreOptions) -> LoadStats
where
    P: TransactionPool + ?Sized,
{
    let current = pool.chain_state();
    if current != snapshot.state {
        info!(
            "Mempool file was written at height {} (tip {}), pool is at height {}; admission will filter stale entries",
            snapshot.state.height, snapshot.state.tip, current.height
        );
    }

    let cutoff = options.cutoff();
    let mut stats = LoadStats::default();
    let mut admitted: HashSet<TxId> = HashSet::with_capacity(snapshot.records.len());

    for record in snapshot.records {
        let txid = record.txid();

        // The operator's delta outlives the record, whatever happens to it below
        if record.meta.fee_delta != 0 {
            pool.prioritise(&txid, record.meta.fee_delta);
            stats.deltas_applied += 1;
        }

        if pool.contains(&txid) {
            stats.already_present += 1;
            continue;
        }

        if record.meta.entry_time < cutoff {
            debug!("Skipping expired transaction {}", txid);
            stats.expired += 1;
            continue;
        }

        let missing = record
            .meta
            .parents
            .iter()
            .find(|parent| !admitted.contains(*parent) && !pool.contains(parent));
        if let Some(parent) = missing {
            debug!("Skipping {}: parent {} is not in the pool", txid, parent);
            stats.missing_dependency += 1;
            continue;
        }

        match pool.admit(&record.payload, &record.meta) {
            Ok(()) => {
                admitted.insert(txid);
                stats.admitted += 1;
            }
            Err(e) => {
                debug!("Pool rejected reloaded transaction {}: {}", txid, e);
                stats.failed += 1;
            }
        }
    }

    for (txid, delta) in &snapshot.fee_deltas {
        pool.prioritise(txid, *delta);
        stats.deltas_applied += 1;
    }

    info!(
        "Imported mempool transactions from disk: {} succeeded, {} failed, {} expired, {} already there, {} missing dependency",
        stats.admitted, stats.failed, stats.expired, stats.already_present, stats.missing_dependency
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::compression::NoCompression;
    use crate::error::{AdmissionError, FormatError};
    use crate::pool::{MemoryPool, MockTransactionPool};
    use crate::record::{EntryMetadata, Hash256, PoolState, TransactionRecord};
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;
    use mockall::predicate::eq;
    use std::path::PathBuf;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_100_000, 0).unwrap()
    }

    fn tx(payload: &str, age_hours: i64, parents: &[&TransactionRecord]) -> TransactionRecord {
        let meta = EntryMetadata::new(
            Hash256::of_payload(payload.as_bytes()),
            now() - Duration::hours(age_hours),
            1_000,
            120,
        )
        .with_parents(parents.iter().map(|p| p.txid()).collect());
        TransactionRecord::new(payload.as_bytes().to_vec(), meta)
    }

    fn snapshot_of(records: Vec<TransactionRecord>) -> Snapshot {
        let mut snapshot = Snapshot::new(PoolState::default(), now());
        snapshot.records = records;
        snapshot
    }

    fn options() -> RestoreOptions {
        RestoreOptions::new(Duration::hours(336)).at(now())
    }

    #[test]
    fn test_load_missing_file_is_not_found() {
        let storage = MemoryStorage::new();
        let path = PathBuf::from("/node/mempool.dat");
        assert!(matches!(load(&storage, &path), Err(LoadError::NotFound(p)) if p == path));
    }

    #[test]
    fn test_load_corrupt_file() {
        let storage = MemoryStorage::new();
        let path = PathBuf::from("/node/mempool.dat");
        storage.put(&path, b"garbage that is not a mempool file at all, really".to_vec());

        assert!(matches!(
            load(&storage, &path),
            Err(LoadError::Corrupt(FormatError::BadMagic))
        ));
    }

    #[test]
    fn test_load_decodes_file() {
        let storage = MemoryStorage::new();
        let path = PathBuf::from("/node/mempool.dat");
        let snapshot = snapshot_of(vec![tx("a", 1, &[])]);
        storage.put(&path, encode(&snapshot, &NoCompression).unwrap().to_vec());

        assert_eq!(load(&storage, &path).unwrap(), snapshot);
    }

    #[test]
    fn test_parent_admitted_before_child() {
        let parent = tx("parent", 2, &[]);
        let child = tx("child", 1, &[&parent]);
        let pool = MemoryPool::default();

        // MemoryPool rejects a child whose parent is absent, so success proves order
        let stats = restore(&pool, snapshot_of(vec![parent, child]), &options());
        assert_eq!(stats.admitted, 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_child_skipped_when_parent_absent() {
        let parent = tx("parent", 2, &[]);
        let child = tx("child", 1, &[&parent]);
        let pool = MemoryPool::default();

        let stats = restore(&pool, snapshot_of(vec![child.clone()]), &options());
        assert_eq!(stats.missing_dependency, 1);
        assert_eq!(stats.admitted, 0);
        assert!(!pool.contains(&child.txid()));
    }

    #[test]
    fn test_parent_already_in_pool_satisfies_dependency() {
        let parent = tx("parent", 2, &[]);
        let child = tx("child", 1, &[&parent]);
        let pool = MemoryPool::default();
        pool.insert(parent.clone()).unwrap();

        let stats = restore(&pool, snapshot_of(vec![parent, child]), &options());
        assert_eq!(stats.already_present, 1);
        assert_eq!(stats.admitted, 1);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_expired_records_and_their_children_are_skipped() {
        let old = tx("old", 400, &[]);
        let child = tx("child-of-old", 1, &[&old]);
        let fresh = tx("fresh", 1, &[]);
        let pool = MemoryPool::default();

        let stats = restore(&pool, snapshot_of(vec![old, child, fresh]), &options());
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.missing_dependency, 1);
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.skipped(), 2);
    }

    #[test]
    fn test_fee_deltas_are_reapplied() {
        let mut prioritised = tx("prioritised", 1, &[]);
        prioritised.meta.fee_delta = 700;
        let txid = prioritised.txid();
        let detached = Hash256([5u8; 32]);

        let mut snapshot = snapshot_of(vec![prioritised]);
        snapshot.fee_deltas.insert(detached, -300);

        let pool = MemoryPool::default();
        let stats = restore(&pool, snapshot, &options());
        assert_eq!(stats.deltas_applied, 2);
        assert_eq!(pool.fee_delta(&txid), 700);
        assert_eq!(pool.fee_delta(&detached), -300);
    }

    #[test]
    fn test_admission_failure_does_not_abort_load() {
        let a = tx("a", 1, &[]);
        let b = tx("b", 1, &[]);
        let a_id = a.txid();

        let mut pool = MockTransactionPool::new();
        pool.expect_chain_state().returning(PoolState::default);
        pool.expect_contains().returning(|_| false);
        pool.expect_admit()
            .withf(move |_, meta| meta.txid == a_id)
            .times(1)
            .returning(|_, _| Err(AdmissionError::Rejected("fee too low".to_string())));
        pool.expect_admit()
            .withf(move |_, meta| meta.txid != a_id)
            .times(1)
            .returning(|_, _| Ok(()));

        let stats = restore(&pool, snapshot_of(vec![a, b]), &options());
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.admitted, 1);
    }

    #[test]
    fn test_skipped_records_keep_their_fee_deltas() {
        let mut expired = tx("expired", 400, &[]);
        expired.meta.fee_delta = 5_000;
        let absent_parent = tx("absent-parent", 2, &[]);
        let mut orphan = tx("orphan", 1, &[&absent_parent]);
        orphan.meta.fee_delta = -40;
        let mut present = tx("present", 1, &[]);
        present.meta.fee_delta = 900;

        let pool = MemoryPool::default();
        pool.insert(present.clone()).unwrap();

        let ids = [expired.txid(), orphan.txid(), present.txid()];
        let stats = restore(&pool, snapshot_of(vec![expired, orphan, present]), &options());

        assert_eq!(stats.expired, 1);
        assert_eq!(stats.missing_dependency, 1);
        assert_eq!(stats.already_present, 1);
        assert_eq!(stats.admitted, 0);
        assert_eq!(stats.deltas_applied, 3);
        assert_eq!(pool.fee_delta(&ids[0]), 5_000);
        assert_eq!(pool.fee_delta(&ids[1]), -40);
        assert_eq!(pool.fee_delta(&ids[2]), 900);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_rejected_record_keeps_its_fee_delta() {
        let mut rejected = tx("rejected", 1, &[]);
        rejected.meta.fee_delta = 1_234;
        let txid = rejected.txid();

        let mut pool = MockTransactionPool::new();
        pool.expect_chain_state().returning(PoolState::default);
        pool.expect_contains().returning(|_| false);
        pool.expect_prioritise()
            .with(eq(txid), eq(1_234))
            .times(1)
            .return_const(());
        pool.expect_admit()
            .times(1)
            .returning(|_, _| Err(AdmissionError::MissingInputs));

        let stats = restore(&pool, snapshot_of(vec![rejected]), &options());
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.deltas_applied, 1);
    }

    #[test]
    fn test_expiry_window_beyond_time_range_expires_nothing() {
        let ancient = tx("ancient", 24 * 365 * 50, &[]);
        let pool = MemoryPool::default();

        // Larger than any DateTime can step back from now
        let options = RestoreOptions::new(Duration::milliseconds(i64::MAX)).at(now());
        let stats = restore(&pool, snapshot_of(vec![ancient]), &options);
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.admitted, 1);
    }
}
