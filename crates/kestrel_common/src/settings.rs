//! Cluster settings registry.
//!
//! A `Settings` handle is passed explicitly into every component
//! constructor. Components that need to react to changes register a
//! subscription; there is no polling and no process-global state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Supported SST compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Snappy,
    Minlz,
    None,
    Zstd,
    Fastest,
    Fast,
    Balanced,
    Good,
}

impl CompressionAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "snappy" => Some(Self::Snappy),
            "minlz" => Some(Self::Minlz),
            "none" => Some(Self::None),
            "zstd" => Some(Self::Zstd),
            "fastest" => Some(Self::Fastest),
            "fast" => Some(Self::Fast),
            "balanced" => Some(Self::Balanced),
            "good" => Some(Self::Good),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Snappy => "snappy",
            Self::Minlz => "minlz",
            Self::None => "none",
            Self::Zstd => "zstd",
            Self::Fastest => "fastest",
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Good => "good",
        }
    }
}

/// A boolean cluster setting.
#[derive(Debug)]
pub struct BoolSetting {
    name: &'static str,
    value: AtomicBool,
}

impl BoolSetting {
    pub fn get(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A u64 cluster setting.
#[derive(Debug)]
pub struct U64Setting {
    name: &'static str,
    value: AtomicU64,
}

impl U64Setting {
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

type ChangeCallback = Box<dyn Fn(&Settings, &str) + Send + Sync>;

/// The cluster settings registry.
///
/// All recognized settings are created at construction; `set_*` updates a
/// value and fires registered change callbacks with the setting name.
pub struct Settings {
    bools: HashMap<&'static str, Arc<BoolSetting>>,
    u64s: HashMap<&'static str, Arc<U64Setting>>,
    compression: RwLock<CompressionAlgorithm>,
    compression_backup_storage: RwLock<CompressionAlgorithm>,
    compression_backup_transport: RwLock<CompressionAlgorithm>,
    subscribers: RwLock<Vec<ChangeCallback>>,
}

// Recognized setting names.
pub const INGEST_SPLIT_ENABLED: &str = "storage.ingest_split.enabled";
pub const DELETE_COMPACTION_EXCISE_ENABLED: &str = "storage.delete_compaction_excise.enabled";
pub const INGEST_AS_FLUSHABLE_ENABLED: &str = "storage.ingest_as_flushable.enabled";
pub const BLOCK_LOAD_NODE_MAX_ACTIVE: &str = "storage.block_load.node_max_active";
pub const COMPACTION_CONCURRENCY: &str = "storage.compaction_concurrency";
pub const MAX_COMPACTION_CONCURRENCY: &str = "storage.max_compaction_concurrency";
pub const VALUE_SEPARATION_ENABLED: &str = "storage.value_separation.enabled";
pub const VALUE_SEPARATION_MINIMUM_SIZE: &str = "storage.value_separation.minimum_size";
pub const VALUE_SEPARATION_MAX_REFERENCE_DEPTH: &str =
    "storage.value_separation.max_reference_depth";
pub const VALUE_SEPARATION_REWRITE_MINIMUM_AGE: &str =
    "storage.value_separation.rewrite_minimum_age";
pub const VALUE_SEPARATION_GARBAGE_THRESHOLD: &str =
    "storage.value_separation.compaction_garbage_threshold";
pub const SSTABLE_COMPRESSION_ALGORITHM: &str = "storage.sstable.compression_algorithm";
pub const GC_TTL_STRICT_ENFORCEMENT: &str = "kv.gc_ttl.strict_enforcement.enabled";
pub const RANGEFEED_ENABLED: &str = "kv.rangefeed.enabled";
pub const CLOSED_TS_TARGET_DURATION_MS: &str = "kv.closed_timestamp.target_duration_ms";
pub const CLOSED_TS_LEAD_FOR_GLOBAL_READS_MS: &str =
    "kv.closed_timestamp.lead_for_global_reads_override_ms";
pub const LEADERLESS_UNAVAILABLE_THRESHOLD_MS: &str =
    "kv.replica_raft.leaderless_unavailable_threshold_ms";
pub const ADMISSION_TICK_INTERVAL_MS: &str = "admission.tick_interval_ms";
pub const ADMISSION_KV_SLOTS: &str = "admission.kv_slot_count";
pub const ADMISSION_SQL_KV_BURST_TOKENS: &str = "admission.sql_kv_response_burst_tokens";
pub const ADMISSION_SQL_SQL_BURST_TOKENS: &str = "admission.sql_sql_response_burst_tokens";

impl Settings {
    pub fn new() -> Arc<Self> {
        let mut bools = HashMap::new();
        let mut u64s = HashMap::new();

        let mut reg_bool = |name: &'static str, default: bool| {
            bools.insert(
                name,
                Arc::new(BoolSetting {
                    name,
                    value: AtomicBool::new(default),
                }),
            );
        };
        reg_bool(INGEST_SPLIT_ENABLED, true);
        reg_bool(DELETE_COMPACTION_EXCISE_ENABLED, true);
        reg_bool(INGEST_AS_FLUSHABLE_ENABLED, true);
        reg_bool(VALUE_SEPARATION_ENABLED, true);
        reg_bool(GC_TTL_STRICT_ENFORCEMENT, true);
        reg_bool(RANGEFEED_ENABLED, false);

        let mut reg_u64 = |name: &'static str, default: u64| {
            u64s.insert(
                name,
                Arc::new(U64Setting {
                    name,
                    value: AtomicU64::new(default),
                }),
            );
        };
        reg_u64(BLOCK_LOAD_NODE_MAX_ACTIVE, 256);
        reg_u64(COMPACTION_CONCURRENCY, 1);
        reg_u64(MAX_COMPACTION_CONCURRENCY, 4);
        reg_u64(VALUE_SEPARATION_MINIMUM_SIZE, 1024);
        reg_u64(VALUE_SEPARATION_MAX_REFERENCE_DEPTH, 10);
        reg_u64(VALUE_SEPARATION_REWRITE_MINIMUM_AGE, 300_000);
        reg_u64(VALUE_SEPARATION_GARBAGE_THRESHOLD, 50);
        reg_u64(CLOSED_TS_TARGET_DURATION_MS, 3_000);
        reg_u64(CLOSED_TS_LEAD_FOR_GLOBAL_READS_MS, 0);
        reg_u64(LEADERLESS_UNAVAILABLE_THRESHOLD_MS, 60_000);
        reg_u64(ADMISSION_TICK_INTERVAL_MS, 250);
        reg_u64(ADMISSION_KV_SLOTS, 0); // 0 = derive from CPU count
        reg_u64(ADMISSION_SQL_KV_BURST_TOKENS, 100_000);
        reg_u64(ADMISSION_SQL_SQL_BURST_TOKENS, 100_000);

        Arc::new(Self {
            bools,
            u64s,
            compression: RwLock::new(CompressionAlgorithm::Snappy),
            compression_backup_storage: RwLock::new(CompressionAlgorithm::Fastest),
            compression_backup_transport: RwLock::new(CompressionAlgorithm::Fastest),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    /// Typed handle for a boolean setting. Panics on unknown names, which are
    /// programming errors (all names are `const`s in this module).
    pub fn bool_setting(&self, name: &'static str) -> Arc<BoolSetting> {
        self.bools
            .get(name)
            .unwrap_or_else(|| panic!("unknown bool setting {name}"))
            .clone()
    }

    /// Typed handle for a u64 setting.
    pub fn u64_setting(&self, name: &'static str) -> Arc<U64Setting> {
        self.u64s
            .get(name)
            .unwrap_or_else(|| panic!("unknown u64 setting {name}"))
            .clone()
    }

    pub fn get_bool(&self, name: &'static str) -> bool {
        self.bool_setting(name).get()
    }

    pub fn get_u64(&self, name: &'static str) -> u64 {
        self.u64_setting(name).get()
    }

    pub fn compression_algorithm(&self) -> CompressionAlgorithm {
        *self.compression.read()
    }

    pub fn compression_algorithm_backup_storage(&self) -> CompressionAlgorithm {
        *self.compression_backup_storage.read()
    }

    pub fn compression_algorithm_backup_transport(&self) -> CompressionAlgorithm {
        *self.compression_backup_transport.read()
    }

    pub fn set_bool(self: &Arc<Self>, name: &'static str, value: bool) {
        if let Some(s) = self.bools.get(name) {
            s.value.store(value, Ordering::Release);
            self.notify(name);
        }
    }

    pub fn set_u64(self: &Arc<Self>, name: &'static str, value: u64) {
        if let Some(s) = self.u64s.get(name) {
            s.value.store(value, Ordering::Release);
            self.notify(name);
        }
    }

    pub fn set_compression_algorithm(self: &Arc<Self>, algo: CompressionAlgorithm) {
        *self.compression.write() = algo;
        self.notify(SSTABLE_COMPRESSION_ALGORITHM);
    }

    /// Register a change callback. Fired with the setting name after every
    /// update, on the updating thread.
    pub fn subscribe(&self, cb: impl Fn(&Settings, &str) + Send + Sync + 'static) {
        self.subscribers.write().push(Box::new(cb));
    }

    fn notify(&self, name: &str) {
        let subs = self.subscribers.read();
        for cb in subs.iter() {
            cb(self, name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::new();
        assert!(s.get_bool(INGEST_SPLIT_ENABLED));
        assert!(s.get_bool(GC_TTL_STRICT_ENFORCEMENT));
        assert!(!s.get_bool(RANGEFEED_ENABLED));
        assert_eq!(s.get_u64(COMPACTION_CONCURRENCY), 1);
        assert_eq!(s.compression_algorithm(), CompressionAlgorithm::Snappy);
    }

    #[test]
    fn test_set_and_get() {
        let s = Settings::new();
        s.set_bool(RANGEFEED_ENABLED, true);
        assert!(s.get_bool(RANGEFEED_ENABLED));
        s.set_u64(MAX_COMPACTION_CONCURRENCY, 9);
        assert_eq!(s.get_u64(MAX_COMPACTION_CONCURRENCY), 9);
    }

    #[test]
    fn test_typed_handle_observes_updates() {
        let s = Settings::new();
        let handle = s.u64_setting(CLOSED_TS_TARGET_DURATION_MS);
        assert_eq!(handle.get(), 3_000);
        s.set_u64(CLOSED_TS_TARGET_DURATION_MS, 500);
        assert_eq!(handle.get(), 500);
    }

    #[test]
    fn test_subscription_fires_on_change() {
        let s = Settings::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        s.subscribe(move |settings, name| {
            if name == LEADERLESS_UNAVAILABLE_THRESHOLD_MS {
                fired2.fetch_add(1, Ordering::SeqCst);
                assert_eq!(settings.get_u64(LEADERLESS_UNAVAILABLE_THRESHOLD_MS), 0);
            }
        });
        s.set_u64(LEADERLESS_UNAVAILABLE_THRESHOLD_MS, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Unrelated settings also notify; the filter above ignores them.
        s.set_bool(RANGEFEED_ENABLED, true);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_compression_parse_round_trip() {
        for name in ["snappy", "minlz", "none", "zstd", "fastest", "fast", "balanced", "good"] {
            let algo = CompressionAlgorithm::parse(name).unwrap();
            assert_eq!(algo.name(), name);
        }
        assert!(CompressionAlgorithm::parse("lz77").is_none());
    }
}
