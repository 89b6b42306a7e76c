/*!
Persistence controller: decides when the pool is loaded and dumped.

The controller is the only component that knows about the `persist_mempool`
setting. It drives the extractor, codec and writer for a dump, and the loader
at startup. Dumps are serialized by a mutex; an on-demand dump that finds the
lock held is rejected instead of queued, while the shutdown dump waits.
*/

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec;
use crate::compression::CompressionAdapter;
use crate::config::PersistConfig;
use crate::error::{DumpError, LoadError};
use crate::extract;
use crate::loader::{self, LoadStats, RestoreOptions};
#[cfg(feature = "metrics")]
use crate::observability::{DumpTimer, PersistMetrics};
use crate::pool::TransactionPool;
use crate::storage::{AtomicFileWriter, StorageAdapter};

/// What a successful dump wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpStats {
    pub transactions: usize,
    pub fee_deltas: usize,
    pub bytes: usize,
    pub path: PathBuf,
}

/// Coordinates loading the pool at startup and dumping it to disk
///
/// # Example
/// ```rust,no_run
/// use mempersist_core::{create_default_controller, MemoryPool, PersistConfig, PoolState};
///
/// let config = PersistConfig::new("/var/lib/node");
/// let controller = create_default_controller(config);
/// let pool = MemoryPool::new(PoolState::default());
///
/// controller.startup(&pool);
/// let stats = controller.dump_now(&pool)?;
/// println!("wrote {} transactions", stats.transactions);
/// controller.shutdown(&pool);
/// # Ok::<(), mempersist_core::DumpError>(())
/// ```
pub struct PersistenceController<S, C>
where
    S: StorageAdapter,
    C: CompressionAdapter,
{
    config: PersistConfig,
    storage: S,
    compressor: C,
    dump_lock: Mutex<()>,
    loaded: AtomicBool,
}

impl<S, C> PersistenceController<S, C>
where
    S: StorageAdapter,
    C: CompressionAdapter,
{
    pub fn new(config: PersistConfig, storage: S, compressor: C) -> Self {
        Self {
            config,
            storage,
            compressor,
            dump_lock: Mutex::new(()),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    /// Whether startup loading and shutdown dumping are enabled
    pub fn persist_mempool(&self) -> bool {
        self.config.persist_mempool
    }

    /// Whether [`startup`](Self::startup) has finished, whatever its outcome
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Load the mempool file into `pool` if persistence is enabled
    ///
    /// Never fails: a missing file is a cold start and a damaged one is
    /// logged and ignored. Returns the load statistics when a file was read.
    pub fn startup<P>(&self, pool: &P) -> Option<LoadStats>
    where
        P: TransactionPool + ?Sized,
    {
        let stats = if self.config.persist_mempool {
            self.warn_on_stale_temp();
            match self.load(pool) {
                Ok(stats) => Some(stats),
                Err(LoadError::NotFound(path)) => {
                    info!("No mempool file at {}, starting with an empty pool", path.display());
                    None
                }
                Err(e) => {
                    warn!("Failed to load mempool from disk, starting with an empty pool: {}", e);
                    None
                }
            }
        } else {
            debug!("Mempool persistence disabled, not loading {}", self.config.mempool_path().display());
            None
        };

        self.loaded.store(true, Ordering::Release);
        stats
    }

    /// Read the mempool file and re-admit its records, regardless of the flag
    pub fn load<P>(&self, pool: &P) -> Result<LoadStats, LoadError>
    where
        P: TransactionPool + ?Sized,
    {
        let path = self.config.mempool_path();
        let snapshot = loader::load(&self.storage, &path)?;
        let options = RestoreOptions::new(self.config.expiry());
        let stats = loader::restore(pool, snapshot, &options);

        #[cfg(feature = "metrics")]
        if let Some(metrics) = PersistMetrics::global() {
            metrics.record_load(stats.admitted, stats.skipped());
        }

        Ok(stats)
    }

    /// Dump the pool at shutdown if persistence is enabled
    ///
    /// Waits for an in-flight on-demand dump to finish first. Failures are
    /// logged and never prevent the process from exiting.
    pub fn shutdown<P>(&self, pool: &P) -> Option<DumpStats>
    where
        P: TransactionPool + ?Sized,
    {
        if !self.config.persist_mempool {
            debug!("Mempool persistence disabled, not dumping");
            return None;
        }

        let guard = self.dump_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.dump_locked(pool, &guard) {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Dump the pool now, independent of the `persist_mempool` setting
    ///
    /// # Errors
    /// * `DumpError::InProgress` - another dump holds the lock
    /// * `DumpError::Pool` - the pool could not be enumerated
    /// * `DumpError::Encode` - the snapshot could not be encoded
    /// * `DumpError::Io` - the file could not be written or renamed
    pub fn dump_now<P>(&self, pool: &P) -> Result<DumpStats, DumpError>
    where
        P: TransactionPool + ?Sized,
    {
        let guard = match self.dump_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("Rejecting on-demand dump, another dump is running");
                return Err(DumpError::InProgress);
            }
        };
        self.dump_locked(pool, &guard)
    }

    // The guard is taken by reference to make the locking requirement explicit.
    fn dump_locked<P>(&self, pool: &P, _guard: &MutexGuard<'_, ()>) -> Result<DumpStats, DumpError>
    where
        P: TransactionPool + ?Sized,
    {
        #[cfg(feature = "metrics")]
        let timer = DumpTimer::start();

        let result = self.write_snapshot(pool);

        #[cfg(feature = "metrics")]
        match &result {
            Ok(stats) => timer.finish(stats.bytes),
            Err(_) => timer.finish_with_error(),
        }

        result
    }

    fn write_snapshot<P>(&self, pool: &P) -> Result<DumpStats, DumpError>
    where
        P: TransactionPool + ?Sized,
    {
        let path = self.config.mempool_path();
        let snapshot = extract::capture(pool)?;
        let image = codec::encode(&snapshot, &self.compressor)?;
        self.storage.publish(&image, &path)?;

        let stats = DumpStats {
            transactions: snapshot.len(),
            fee_deltas: snapshot.fee_deltas.len(),
            bytes: image.len(),
            path,
        };
        info!(
            "Dumped mempool: {} transactions, {} fee deltas, {} bytes ({}) to {}",
            stats.transactions,
            stats.fee_deltas,
            stats.bytes,
            self.compressor.algorithm_name(),
            stats.path.display()
        );
        Ok(stats)
    }

    fn warn_on_stale_temp(&self) {
        let temp = self.config.temp_path();
        if self.storage.exists(&temp) {
            warn!(
                "Found leftover {} from an interrupted dump; it is ignored and will be overwritten",
                temp.display()
            );
        }
    }
}

/// Controller on the local filesystem with compression taken from `config`
pub fn create_default_controller(
    config: PersistConfig,
) -> PersistenceController<AtomicFileWriter, Box<dyn CompressionAdapter>> {
    let compressor = config.compression.adapter();
    PersistenceController::new(config, AtomicFileWriter::new(), compressor)
}
