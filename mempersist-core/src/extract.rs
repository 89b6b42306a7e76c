/*!
Pool snapshot extraction.

Copies the pool through a single [`TransactionPool::enumerate`] call and
orders the copy so that every transaction follows the in-pool transactions it
spends from. All ordering work happens after the pool has released its lock,
so admission and eviction are blocked only for the duration of the copy.
*/

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::PoolError;
use crate::pool::{PoolView, TransactionPool};
use crate::record::{whole_seconds, Snapshot, TransactionRecord, TxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    Active,
    Done,
}

/// Capture the pool as a dependency-ordered snapshot stamped with the current time
pub fn capture<P>(pool: &P) -> Result<Snapshot, PoolError>
where
    P: TransactionPool + ?Sized,
{
    capture_at(pool, Utc::now())
}

/// Capture the pool, stamping the snapshot with `captured_at`
pub fn capture_at<P>(pool: &P, captured_at: DateTime<Utc>) -> Result<Snapshot, PoolError>
where
    P: TransactionPool + ?Sized,
{
    let PoolView {
        state,
        mut entries,
        mut fee_deltas,
    } = pool.enumerate()?;

    // The file keeps whole seconds; pools may track finer arrival times
    for record in &mut entries {
        record.meta.entry_time = whole_seconds(record.meta.entry_time);
    }
    let records = dependency_order(entries);

    // Deltas of pooled transactions travel with their record
    for record in &records {
        fee_deltas.remove(&record.txid());
    }

    let mut snapshot = Snapshot::new(state, captured_at);
    snapshot.records = records;
    snapshot.fee_deltas = fee_deltas;

    debug!(
        "Captured {} pool transactions and {} detached fee deltas at height {}",
        snapshot.records.len(),
        snapshot.fee_deltas.len(),
        snapshot.state.height
    );
    Ok(snapshot)
}

/// Sort records so parents precede children and fill in ancestor/descendant counts
///
/// The base order is (arrival time, txid). Parent edges pointing outside the
/// given set are dropped, since they are not in-pool dependencies.
pub fn dependency_order(mut entries: Vec<TransactionRecord>) -> Vec<TransactionRecord> {
    entries.sort_by(|a, b| {
        a.meta
            .entry_time
            .cmp(&b.meta.entry_time)
            .then_with(|| a.txid().cmp(&b.txid()))
    });

    let index: HashMap<TxId, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, record)| (record.txid(), i))
        .collect();

    let mut parent_idx: Vec<Vec<usize>> = Vec::with_capacity(entries.len());
    for record in &mut entries {
        let own = record.txid();
        record
            .meta
            .parents
            .retain(|parent| *parent != own && index.contains_key(parent));
        record.meta.parents.sort();
        record.meta.parents.dedup();

        let mut parents: Vec<usize> = record.meta.parents.iter().map(|p| index[p]).collect();
        parents.sort_unstable();
        parent_idx.push(parents);
    }

    let order = topological_order(&parent_idx);

    // Ancestor sets built in topological order, so parents are always complete
    let mut ancestors: Vec<HashSet<usize>> = vec![HashSet::new(); entries.len()];
    let mut descendant_count = vec![0u32; entries.len()];
    for &node in &order {
        let mut set = HashSet::new();
        for &parent in &parent_idx[node] {
            set.insert(parent);
            set.extend(ancestors[parent].iter().copied());
        }
        for &ancestor in &set {
            descendant_count[ancestor] += 1;
        }
        ancestors[node] = set;
    }

    let mut slots: Vec<Option<TransactionRecord>> = entries.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|node| {
            let mut record = slots[node].take()?;
            record.meta.ancestor_count = ancestors[node].len() as u32;
            record.meta.descendant_count = descendant_count[node];
            Some(record)
        })
        .collect()
}

/// Depth-first post-order over parent edges, roots visited in base order
fn topological_order(parents: &[Vec<usize>]) -> Vec<usize> {
    let mut visit = vec![Visit::New; parents.len()];
    let mut order = Vec::with_capacity(parents.len());

    for root in 0..parents.len() {
        if visit[root] != Visit::New {
            continue;
        }
        visit[root] = Visit::Active;
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            match parents[node].get(next) {
                Some(&parent) => {
                    frame.1 += 1;
                    // An Active parent means a cycle; the edge is ignored
                    if visit[parent] == Visit::New {
                        visit[parent] = Visit::Active;
                        stack.push((parent, 0));
                    }
                }
                None => {
                    visit[node] = Visit::Done;
                    order.push(node);
                    stack.pop();
                }
            }
        }
    }

    order
}

/// Whether every record's in-set parents appear before it
pub fn is_dependency_ordered(records: &[TransactionRecord]) -> bool {
    let in_set: HashSet<TxId> = records.iter().map(TransactionRecord::txid).collect();
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        let ready = record
            .meta
            .parents
            .iter()
            .filter(|parent| in_set.contains(*parent))
            .all(|parent| seen.contains(parent));
        if !ready {
            return false;
        }
        seen.insert(record.txid());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryPool, MockTransactionPool};
    use crate::record::{EntryMetadata, Hash256, PoolState};
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tx(payload: &str, arrived: i64, parents: &[&TransactionRecord]) -> TransactionRecord {
        let meta = EntryMetadata::new(Hash256::of_payload(payload.as_bytes()), at(arrived), 2_000, 150)
            .with_parents(parents.iter().map(|p| p.txid()).collect());
        TransactionRecord::new(payload.as_bytes().to_vec(), meta)
    }

    #[test]
    fn test_parent_precedes_child_even_when_child_arrived_first() {
        let parent = tx("parent", 10, &[]);
        // Out-of-order arrival timestamps, e.g. after a reorg re-add
        let child = tx("child", 5, &[&parent]);

        let ordered = dependency_order(vec![child.clone(), parent.clone()]);
        let ids: Vec<TxId> = ordered.iter().map(TransactionRecord::txid).collect();
        assert_eq!(ids, vec![parent.txid(), child.txid()]);
        assert!(is_dependency_ordered(&ordered));
    }

    #[test]
    fn test_independent_transactions_keep_arrival_order() {
        let a = tx("a", 3, &[]);
        let b = tx("b", 1, &[]);
        let c = tx("c", 2, &[]);

        let ordered = dependency_order(vec![a.clone(), b.clone(), c.clone()]);
        let ids: Vec<TxId> = ordered.iter().map(TransactionRecord::txid).collect();
        assert_eq!(ids, vec![b.txid(), c.txid(), a.txid()]);
    }

    #[test]
    fn test_ancestor_and_descendant_counts() {
        // a <- b <- c, and a <- d
        let a = tx("a", 0, &[]);
        let b = tx("b", 1, &[&a]);
        let c = tx("c", 2, &[&b]);
        let d = tx("d", 3, &[&a]);

        let ordered = dependency_order(vec![d, c, b, a.clone()]);
        let by_id: HashMap<TxId, &TransactionRecord> =
            ordered.iter().map(|r| (r.txid(), r)).collect();

        let root = by_id[&a.txid()];
        assert_eq!(root.meta.ancestor_count, 0);
        assert_eq!(root.meta.descendant_count, 3);

        let leaf = ordered
            .iter()
            .find(|r| r.payload.as_ref() == b"c")
            .unwrap();
        assert_eq!(leaf.meta.ancestor_count, 2);
        assert_eq!(leaf.meta.descendant_count, 0);
        assert!(is_dependency_ordered(&ordered));
    }

    #[test]
    fn test_parents_outside_pool_are_dropped() {
        let confirmed = tx("confirmed", 0, &[]);
        let spender = tx("spender", 1, &[&confirmed]);

        let ordered = dependency_order(vec![spender]);
        assert!(ordered[0].meta.parents.is_empty());
        assert_eq!(ordered[0].meta.ancestor_count, 0);
    }

    #[test]
    fn test_cycle_does_not_hang() {
        let mut a = tx("a", 0, &[]);
        let b = tx("b", 1, &[&a]);
        a.meta.parents.push(b.txid());

        let ordered = dependency_order(vec![a, b]);
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn test_capture_moves_pooled_deltas_onto_records() {
        let pool = MemoryPool::new(PoolState {
            tip: Hash256([9u8; 32]),
            height: 201,
        });
        let parent = tx("parent", 0, &[]);
        let child = tx("child", 1, &[&parent]);
        pool.insert(parent.clone()).unwrap();
        pool.insert(child).unwrap();
        pool.prioritise(&parent.txid(), 1_000);
        let detached = Hash256([3u8; 32]);
        pool.prioritise(&detached, 42);

        let now = at(100) + Duration::milliseconds(750);
        let snapshot = capture_at(&pool, now).unwrap();

        assert_eq!(snapshot.state.height, 201);
        assert_eq!(snapshot.captured_at, at(100));
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.records[0].txid(), parent.txid());
        assert_eq!(snapshot.records[0].meta.fee_delta, 1_000);
        assert_eq!(snapshot.fee_deltas.len(), 1);
        assert_eq!(snapshot.fee_deltas.get(&detached), Some(&42));
    }

    #[test]
    fn test_capture_truncates_fine_grained_arrival_times() {
        let mut record = tx("precise", 0, &[]);
        record.meta.entry_time = at(7) + Duration::microseconds(123_456);
        let mut pool = MockTransactionPool::new();
        pool.expect_enumerate().return_once(move || {
            Ok(PoolView {
                state: PoolState::default(),
                entries: vec![record],
                fee_deltas: Default::default(),
            })
        });

        let snapshot = capture_at(&pool, at(10)).unwrap();
        assert_eq!(snapshot.records[0].meta.entry_time, at(7));
        let encoded = crate::codec::encode(&snapshot, &crate::compression::NoCompression::new());
        assert!(encoded.is_ok());
    }

    #[test]
    fn test_capture_propagates_pool_failure() {
        let mut pool = MockTransactionPool::new();
        pool.expect_enumerate()
            .returning(|| Err(PoolError("shutting down".to_string())));

        let err = capture(&pool).unwrap_err();
        assert!(err.to_string().contains("shutting down"));
    }
}
