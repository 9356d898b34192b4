//! Engine metrics.
//!
//! Plain atomic counters assembled into a snapshot struct by
//! `Engine::metrics()`; no registry wiring.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::block_cache::BlockCacheSnapshot;
use crate::compaction::CompactionStats;

/// Live counters owned by the engine.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub flushes_completed: AtomicU64,
    pub write_stall_count: AtomicU64,
    pub write_stall_duration_ms: AtomicU64,
    pub disk_slow_count: AtomicU64,
    pub corruption_count: AtomicU64,
    pub iterators_opened: AtomicU64,
    pub batches_committed: AtomicU64,
    pub ingests_completed: AtomicU64,
    pub excises_completed: AtomicU64,
}

impl EngineCounters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, v: u64) {
        counter.fetch_add(v, Ordering::Relaxed);
    }
}

/// Shape of one LSM level.
#[derive(Debug, Clone, Default)]
pub struct LevelMetrics {
    pub file_count: usize,
    pub bytes: u64,
}

/// Point-in-time engine metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    pub levels: Vec<LevelMetrics>,
    pub memtable_bytes: u64,
    pub flushable_count: usize,
    pub wal_queued_bytes: u64,
    pub flushes_completed: u64,
    pub write_stall_count: u64,
    pub write_stall_duration_ms: u64,
    pub disk_slow_count: u64,
    pub corruption_count: u64,
    pub iterators_opened: u64,
    pub batches_committed: u64,
    pub ingests_completed: u64,
    pub excises_completed: u64,
    pub block_cache: BlockCacheSnapshot,
    pub compaction: CompactionStats,
    pub visible_seq: u64,
    /// Effective compaction concurrency range `[lower, upper]`.
    pub compaction_concurrency: (usize, usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_helpers() {
        let c = EngineCounters::default();
        EngineCounters::inc(&c.flushes_completed);
        EngineCounters::add(&c.write_stall_duration_ms, 25);
        assert_eq!(c.flushes_completed.load(Ordering::Relaxed), 1);
        assert_eq!(c.write_stall_duration_ms.load(Ordering::Relaxed), 25);
    }
}
