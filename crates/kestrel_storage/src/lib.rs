//! MVCC LSM storage engine.
//!
//! Write path: WAL → active memtable → (flush) → L0 SST
//! Read path:  memtable → frozen flushables → L0 SSTs → L1..Ln SSTs,
//! merged into a single iterator carrying both point and range keys.
//!
//! The engine is versioned by a global sequence number. Batches commit
//! atomically by publishing a new visible sequence; snapshots and iterators
//! pin the visible sequence at creation.

pub mod ballast;
pub mod batch;
pub mod block_cache;
pub mod bloom;
pub mod checkpoint;
pub mod compaction;
pub mod engine;
pub mod iterator;
pub mod keys;
pub mod memtable;
pub mod metrics;
pub mod snapshot;
pub mod sst;
pub mod value;
pub mod version;
pub mod wal;

pub use engine::{Engine, EngineConfig};
pub use iterator::{IterKeyTypeFilter, IterOptions, MvccScanResult};
pub use keys::{EngineKey, KeyKind};
pub use value::MvccValue;
