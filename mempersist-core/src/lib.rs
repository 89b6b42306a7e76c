/*!
# Mempool Persistence Core

Saves a node's pool of unconfirmed transactions to disk and restores it on
the next start, so a restart does not throw away what the node had already
validated and relayed.

- Dependency-ordered snapshot of the pool, taken under a single read section
- Versioned binary file with a SHA-256 trailer and optional gzip body
- Crash-safe publish: write `<path>.new`, sync, rename over `<path>`
- Reload through normal admission, skipping expired and orphaned records
- Load at startup and dump at shutdown behind `persist_mempool`, plus an
  on-demand dump that reports structured errors

## Architecture

The pool is an injected [`TransactionPool`]; the engine never owns one.
Storage and compression are adapters behind [`StorageAdapter`] and
[`CompressionAdapter`], so the controller can be tested without a
filesystem.

## Usage

```rust,no_run
use mempersist_core::{create_default_controller, MemoryPool, PersistConfig, PoolState};

let config = PersistConfig::new("/var/lib/node/regtest");
let controller = create_default_controller(config);
let pool = MemoryPool::new(PoolState::default());

// Node start
controller.startup(&pool);

// Operator request
match controller.dump_now(&pool) {
    Ok(stats) => println!("dumped {} transactions", stats.transactions),
    Err(e) => eprintln!("{}", serde_json::to_string(&e.to_rpc()).unwrap()),
}

// Node stop
controller.shutdown(&pool);
```
*/

pub mod codec;
pub mod compression;
pub mod config;
pub mod controller;
pub mod error;
pub mod extract;
pub mod loader;
pub mod observability;
pub mod pool;
pub mod record;
pub mod storage;


pub use codec::{decode, encode};
pub use compression::{CompressionAdapter, CompressionKind, GzipCompressor, NoCompression};
pub use config::PersistConfig;
pub use controller::{create_default_controller, DumpStats, PersistenceController};
pub use error::{
    AdmissionError, DumpError, DumpErrorKind, FormatError, IoError, IoStage, LoadError,
    PersistError, PoolError, Result, RpcError, RPC_MISC_ERROR,
};
pub use extract::{capture, dependency_order};
pub use loader::{LoadStats, RestoreOptions};
pub use pool::{MemoryPool, PoolView, TransactionPool};
pub use record::{
    BlockHash, EntryMetadata, Hash256, PoolState, Snapshot, TransactionRecord, TxId,
    FORMAT_VERSION,
};
pub use storage::{AtomicFileWriter, StorageAdapter};
