/*!
Snapshot data model: transaction records, the pool-state marker and the
snapshot container that is written to disk.
*/

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

/// Current on-disk format version
pub const FORMAT_VERSION: u16 = 1;

/// A 32-byte hash, used for both transaction ids and block hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

pub type TxId = Hash256;
pub type BlockHash = Hash256;

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Double SHA-256 of a serialized transaction.
    pub fn of_payload(payload: &[u8]) -> Self {
        let first = Sha256::digest(payload);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        Hash256(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

/// Chain position the pool was last synced to.
///
/// Reloaded entries are only plausible relative to this tip; admission rules
/// make the final call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolState {
    pub tip: BlockHash,
    pub height: u64,
}

/// Entry-time metadata kept alongside each transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub txid: TxId,
    /// Arrival time, whole seconds
    pub entry_time: DateTime<Utc>,
    /// Fee rate in satoshis per 1000 virtual bytes
    pub fee_rate: u64,
    /// Virtual size in bytes
    pub size: u32,
    /// Operator-assigned fee adjustment (prioritisation)
    pub fee_delta: i64,
    pub ancestor_count: u32,
    pub descendant_count: u32,
    /// In-pool transactions this one spends outputs of
    pub parents: Vec<TxId>,
}

impl EntryMetadata {
    /// Metadata for a transaction with no in-pool parents.
    pub fn new(txid: TxId, entry_time: DateTime<Utc>, fee_rate: u64, size: u32) -> Self {
        Self {
            txid,
            entry_time: whole_seconds(entry_time),
            fee_rate,
            size,
            fee_delta: 0,
            ancestor_count: 0,
            descendant_count: 0,
            parents: Vec::new(),
        }
    }

    pub fn with_parents(mut self, parents: Vec<TxId>) -> Self {
        self.parents = parents;
        self
    }

    pub fn with_fee_delta(mut self, fee_delta: i64) -> Self {
        self.fee_delta = fee_delta;
        self
    }
}

/// One pooled transaction as captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Serialized transaction, opaque to the persistence layer
    pub payload: Bytes,
    pub meta: EntryMetadata,
}

impl TransactionRecord {
    pub fn new(payload: impl Into<Bytes>, meta: EntryMetadata) -> Self {
        Self {
            payload: payload.into(),
            meta,
        }
    }

    pub fn txid(&self) -> TxId {
        self.meta.txid
    }
}

/// Everything written to the mempool file by one dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u16,
    pub state: PoolState,
    pub captured_at: DateTime<Utc>,
    /// Records in dependency order: parents always precede children
    pub records: Vec<TransactionRecord>,
    /// Fee deltas set by the operator, including for txids not in the pool
    pub fee_deltas: BTreeMap<TxId, i64>,
}

impl Snapshot {
    pub fn new(state: PoolState, captured_at: DateTime<Utc>) -> Self {
        Self {
            version: FORMAT_VERSION,
            state,
            captured_at: whole_seconds(captured_at),
            records: Vec::new(),
            fee_deltas: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total payload bytes across all records
    pub fn payload_bytes(&self) -> usize {
        self.records.iter().map(|r| r.payload.len()).sum()
    }
}

/// Truncate a timestamp to the whole-second precision stored on disk.
pub fn whole_seconds(time: DateTime<Utc>) -> DateTime<Utc> {
    from_unix_seconds(time.timestamp()).unwrap_or(time)
}

/// Build a UTC timestamp from Unix seconds, `None` when out of range.
pub fn from_unix_seconds(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
