//! The storage engine.
//!
//! Coordinates the WAL, memtables, sstable levels, block cache, snapshots
//! and compaction into one MVCC key-value store. Batches commit atomically
//! under a single commit mutex: WAL append, memtable apply, then one
//! visible-sequence bump.
//!
//! Failure policy: corruption of a local file writes a do-not-restart
//! marker and surfaces a fatal error; corruption of remote/external files
//! is logged and tolerated. A WAL fsync above the fatal disk-stall
//! threshold is fatal; slower-than-threshold fsyncs only count a metric.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use kestrel_common::error::{KestrelError, KestrelResult, StorageError};
use kestrel_common::settings::{self, Settings};
use kestrel_common::types::{Span, Timestamp, TxnId};

use crate::ballast::Ballast;
use crate::batch::{Batch, BatchOp};
use crate::block_cache::BlockCache;
use crate::checkpoint::write_checkpoint;
use crate::compaction::{concurrency_range, CompactionConfig, Compactor};
use crate::iterator::{
    encode_intent_meta, mvcc_get, mvcc_scan, EngineIter, IterOptions, MvccGetResult,
    MvccScanResult,
};
use crate::keys::{user_key_lower_bound, EngineKey};
use crate::memtable::{MemTable, PointKind, RangeKeyRecord, RangeTombstone};
use crate::metrics::{EngineCounters, EngineMetrics, LevelMetrics};
use crate::snapshot::{ReadView, SnapshotState};
use crate::sst::{next_file_id, FileLocality, SstFile, SstHandle, SstWriter};
use crate::value::MvccValue;
use crate::version::check_and_ratchet;
use crate::wal::{SyncMode, WalReader, WalRecord, WalWriter};

/// Marker file written on local corruption or fatal disk stall; its
/// presence refuses subsequent opens until an operator removes it.
pub const DO_NOT_START_MARKER: &str = "DO_NOT_AUTO_START";

/// Engine configuration.
#[derive(Clone)]
pub struct EngineConfig {
    pub memtable_budget_bytes: u64,
    pub block_cache_bytes: usize,
    pub compaction: CompactionConfig,
    /// Sync the WAL on batch commits that request it.
    pub wal_sync: bool,
    /// Fsync latency counted as a disk-slow event.
    pub disk_slow_threshold_ms: u64,
    /// Fsync latency treated as fatal. Zero disables.
    pub fatal_disk_stall_threshold_ms: u64,
    /// Whether a shared (remote object store) backend is configured;
    /// disables lazy flushable ingestion.
    pub shared_storage: bool,
    /// Size of the emergency ballast file. Zero disables.
    pub ballast_bytes: u64,
    /// Permit adopting a non-empty directory without a min-version file.
    pub bootstrapping: bool,
    pub settings: Arc<Settings>,
}

impl EngineConfig {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            memtable_budget_bytes: 64 * 1024 * 1024,
            block_cache_bytes: 128 * 1024 * 1024,
            compaction: CompactionConfig::default(),
            wal_sync: true,
            disk_slow_threshold_ms: 500,
            fatal_disk_stall_threshold_ms: 0,
            shared_storage: false,
            ballast_bytes: 0,
            bootstrapping: true,
            settings,
        }
    }

    pub fn for_testing() -> Self {
        let mut cfg = Self::new(Settings::new());
        cfg.memtable_budget_bytes = 1024 * 1024;
        cfg.block_cache_bytes = 4 * 1024 * 1024;
        cfg.wal_sync = false;
        cfg
    }
}

/// An entry in the flush pipeline: a frozen memtable, or an sstable that
/// was lazily ingested because it overlapped the memtable.
#[derive(Clone)]
enum Flushable {
    Mem(Arc<MemTable>),
    Ingested(SstHandle),
}

pub struct Engine {
    config: EngineConfig,
    data_dir: PathBuf,

    active_memtable: RwLock<Arc<MemTable>>,
    /// Newest first.
    frozen: RwLock<Vec<Flushable>>,
    /// L0 newest first; L1+ sorted by min key.
    levels: RwLock<Vec<Vec<SstHandle>>>,

    cache: Arc<BlockCache>,
    compactor: Compactor,
    wal: WalWriter,

    next_seq: AtomicU64,
    visible_seq: AtomicU64,
    commit_mu: Mutex<()>,
    flush_mu: Mutex<()>,

    snapshots: Mutex<Vec<Weak<SnapshotState>>>,
    counters: EngineCounters,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn open(data_dir: &Path, config: EngineConfig) -> KestrelResult<Self> {
        fs::create_dir_all(data_dir)?;

        let marker = data_dir.join(DO_NOT_START_MARKER);
        if marker.exists() {
            return Err(StorageError::Corruption {
                path: marker.display().to_string(),
                detail: "do-not-start marker present; manual intervention required".into(),
            }
            .into());
        }

        let store_is_empty = Self::dir_has_no_engine_data(data_dir)?;
        check_and_ratchet(data_dir, store_is_empty, config.bootstrapping)?;

        if config.ballast_bytes > 0 {
            Ballast::ensure(data_dir, config.ballast_bytes)?;
        }

        let cache = Arc::new(BlockCache::new(config.block_cache_bytes));
        let compactor = Compactor::new(config.compaction.clone(), data_dir);

        let max_levels = config.compaction.max_levels as usize;
        let mut levels: Vec<Vec<SstHandle>> = (0..max_levels).map(|_| Vec::new()).collect();
        let mut max_seq_seen = 0u64;
        for handle in Self::recover_sst_files(data_dir)? {
            max_seq_seen = max_seq_seen.max(handle.meta.max_seq);
            let lvl = (handle.meta.level as usize).min(max_levels - 1);
            levels[lvl].push(handle);
        }
        levels[0].sort_by(|a, b| b.meta.max_seq.cmp(&a.meta.max_seq));
        for level in levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.meta.min_key.cmp(&b.meta.min_key));
        }

        let wal_sync_mode = if config.wal_sync {
            SyncMode::FDataSync
        } else {
            SyncMode::None
        };
        let wal = WalWriter::open_with_options(
            data_dir,
            wal_sync_mode,
            64 * 1024 * 1024,
            8,
            config.disk_slow_threshold_ms,
        )?;

        // Replay the WAL into a fresh memtable. Replayed operations keep
        // their original sequence numbers; duplicates with flushed sstables
        // are harmless because reads de-duplicate by sequence.
        let memtable = Arc::new(MemTable::new());
        for record in WalReader::new(data_dir).read_all()? {
            match record {
                WalRecord::Batch { first_seq, ops } => {
                    let mut seq = first_seq;
                    for op in ops {
                        Self::apply_op_to_memtable(&memtable, op, seq)
                            .map_err(|_| StorageError::Wal("replay into frozen memtable".into()))?;
                        max_seq_seen = max_seq_seen.max(seq);
                        seq += 1;
                    }
                }
                WalRecord::FlushMarker { through_seq } => {
                    max_seq_seen = max_seq_seen.max(through_seq);
                }
            }
        }

        Ok(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            active_memtable: RwLock::new(memtable),
            frozen: RwLock::new(Vec::new()),
            levels: RwLock::new(levels),
            cache,
            compactor,
            wal,
            next_seq: AtomicU64::new(max_seq_seen + 1),
            visible_seq: AtomicU64::new(max_seq_seen),
            commit_mu: Mutex::new(()),
            flush_mu: Mutex::new(()),
            snapshots: Mutex::new(Vec::new()),
            counters: EngineCounters::default(),
        })
    }

    fn dir_has_no_engine_data(dir: &Path) -> Result<bool, StorageError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".sst") || name.ends_with(".wal") {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn recover_sst_files(dir: &Path) -> Result<Vec<SstHandle>, StorageError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sst") {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            // Filenames: sst_L{level}_{seq}.sst
            let level = stem
                .strip_prefix("sst_L")
                .and_then(|s| s.split('_').next())
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(0);
            let file_id = next_file_id();
            let file = SstFile::new(path.clone(), file_id, FileLocality::Local);
            match file.reader() {
                Ok(reader) => {
                    let bounds = reader.key_bounds(None)?;
                    let (min_key, max_key) = bounds.unwrap_or_default();
                    let mut max_seq = 0;
                    for e in reader.scan(&[], None, u64::MAX, None)? {
                        max_seq = max_seq.max(e.seq);
                    }
                    let rb = reader.range_block();
                    for d in &rb.range_dels {
                        max_seq = max_seq.max(d.seq);
                    }
                    for rk in &rb.range_keys {
                        max_seq = max_seq.max(rk.seq);
                    }
                    let meta = crate::sst::SstMeta {
                        file_id,
                        path: path.clone(),
                        level,
                        min_key,
                        max_key,
                        entry_count: reader.entry_count(),
                        file_size: fs::metadata(&path)?.len(),
                        max_seq,
                        locality: FileLocality::Local,
                    };
                    out.push(SstHandle::new(file, meta));
                }
                Err(e) => {
                    tracing::warn!("failed to recover sstable {:?}: {}", path, e);
                }
            }
        }
        Ok(out)
    }

    // ── Error policy ────────────────────────────────────────────────────

    /// Apply the corruption policy to an error flowing out of a read or
    /// write path: local corruption writes the do-not-start marker.
    fn observe_error(&self, e: KestrelError) -> KestrelError {
        if let KestrelError::Storage(StorageError::Corruption { path, .. }) = &e {
            EngineCounters::inc(&self.counters.corruption_count);
            if path.starts_with(&self.data_dir.display().to_string()) {
                self.write_do_not_start_marker("local corruption");
            } else {
                tracing::warn!(path, "corruption in remote/shared storage; continuing");
            }
        }
        e
    }

    fn write_do_not_start_marker(&self, reason: &str) {
        let marker = self.data_dir.join(DO_NOT_START_MARKER);
        if let Err(e) = fs::write(&marker, reason) {
            tracing::error!("failed to write do-not-start marker: {e}");
        }
        tracing::error!(reason, "engine entering do-not-start state");
    }

    // ── Write path ──────────────────────────────────────────────────────

    pub fn new_batch(&self) -> Batch<'_> {
        Batch::new(self, true)
    }

    pub fn new_unindexed_batch(&self) -> Batch<'_> {
        Batch::new(self, false)
    }

    pub fn new_write_batch(&self) -> Batch<'_> {
        Batch::new(self, false)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> KestrelResult<()> {
        let mut b = self.new_write_batch();
        b.put(key, value)?;
        b.commit(false)
    }

    pub fn delete(&self, key: &[u8]) -> KestrelResult<()> {
        let mut b = self.new_write_batch();
        b.delete(key)?;
        b.commit(false)
    }

    pub fn single_delete(&self, key: &[u8]) -> KestrelResult<()> {
        let mut b = self.new_write_batch();
        b.single_delete(key)?;
        b.commit(false)
    }

    pub fn merge(&self, key: &[u8], operand: &[u8]) -> KestrelResult<()> {
        let mut b = self.new_write_batch();
        b.merge(key, operand)?;
        b.commit(false)
    }

    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> KestrelResult<()> {
        let mut b = self.new_write_batch();
        b.delete_range(start, end)?;
        b.commit(false)
    }

    pub fn range_key_set(
        &self,
        start: &[u8],
        end: &[u8],
        ts: Timestamp,
        value: &[u8],
    ) -> KestrelResult<()> {
        let mut b = self.new_write_batch();
        b.range_key_set(start, end, ts.wall, ts.logical, value)?;
        b.commit(false)
    }

    pub fn range_key_unset(&self, start: &[u8], end: &[u8], ts: Timestamp) -> KestrelResult<()> {
        let mut b = self.new_write_batch();
        b.range_key_unset(start, end, ts.wall, ts.logical)?;
        b.commit(false)
    }

    /// Commit a batch of operations atomically. Called by [`Batch::commit`].
    pub(crate) fn apply_batch(&self, ops: Vec<BatchOp>, sync: bool) -> KestrelResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.maybe_stall_writes()?;

        let _commit = self.commit_mu.lock();
        let n = ops.len() as u64;
        let first_seq = self.next_seq.fetch_add(n, Ordering::SeqCst);

        self.wal.append(
            &WalRecord::Batch {
                first_seq,
                ops: ops.clone(),
            },
            sync && self.config.wal_sync,
        )?;
        self.check_fatal_disk_stall()?;

        let memtable = self.active_memtable.read().clone();
        let mut seq = first_seq;
        for op in ops {
            Self::apply_op_to_memtable(&memtable, op, seq)
                .map_err(|_| KestrelError::internal("E-ENGINE-001", "active memtable frozen"))?;
            seq += 1;
        }

        // Single visible bump publishes the whole batch.
        self.visible_seq.store(first_seq + n - 1, Ordering::Release);
        EngineCounters::inc(&self.counters.batches_committed);
        drop(_commit);

        self.maybe_trigger_flush()?;
        Ok(())
    }

    fn apply_op_to_memtable(
        memtable: &MemTable,
        op: BatchOp,
        seq: u64,
    ) -> Result<(), crate::memtable::FrozenError> {
        match op {
            BatchOp::Put { key, value } => memtable.apply_point(key, seq, PointKind::Set, value),
            BatchOp::Delete { key } => memtable.apply_point(key, seq, PointKind::Delete, Vec::new()),
            BatchOp::SingleDelete { key } => {
                memtable.apply_point(key, seq, PointKind::SingleDelete, Vec::new())
            }
            BatchOp::Merge { key, operand } => {
                memtable.apply_point(key, seq, PointKind::Merge, operand)
            }
            BatchOp::DeleteRange { start, end } => {
                memtable.apply_range_del(RangeTombstone { start, end, seq })
            }
            BatchOp::RangeKeySet {
                start,
                end,
                ts_wall,
                ts_logical,
                value,
            } => memtable.apply_range_key(RangeKeyRecord {
                start,
                end,
                ts_wall,
                ts_logical,
                seq,
                unset: false,
                value,
            }),
            BatchOp::RangeKeyUnset {
                start,
                end,
                ts_wall,
                ts_logical,
            } => memtable.apply_range_key(RangeKeyRecord {
                start,
                end,
                ts_wall,
                ts_logical,
                seq,
                unset: true,
                value: Vec::new(),
            }),
        }
    }

    fn check_fatal_disk_stall(&self) -> KestrelResult<()> {
        let last = self.wal.last_fsync_ms();
        if last >= self.config.disk_slow_threshold_ms && last > 0 {
            EngineCounters::inc(&self.counters.disk_slow_count);
        }
        let fatal = self.config.fatal_disk_stall_threshold_ms;
        if fatal > 0 && last >= fatal {
            self.write_do_not_start_marker("fatal disk stall");
            return Err(StorageError::FatalDiskStall { stalled_ms: last }.into());
        }
        Ok(())
    }

    /// Writes stall while L0 is over the stall trigger; an inline
    /// compaction clears the backlog and the stall duration is recorded.
    fn maybe_stall_writes(&self) -> KestrelResult<()> {
        let l0_count = self.levels.read()[0].len();
        if !self.compactor.should_stall_writes(l0_count) {
            return Ok(());
        }
        EngineCounters::inc(&self.counters.write_stall_count);
        let start = Instant::now();
        let result = self.compact();
        EngineCounters::add(
            &self.counters.write_stall_duration_ms,
            start.elapsed().as_millis() as u64,
        );
        result
    }

    // ── Flush ───────────────────────────────────────────────────────────

    fn maybe_trigger_flush(&self) -> KestrelResult<()> {
        let over = {
            let active = self.active_memtable.read();
            active.approx_bytes() >= self.config.memtable_budget_bytes
        };
        if over {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush the active memtable (and any queued flushables) to L0.
    pub fn flush(&self) -> KestrelResult<()> {
        let _flush = self.flush_mu.lock();
        self.pin_snapshots()?;

        let frozen_mem = {
            let mut active = self.active_memtable.write();
            let old = active.clone();
            if old.is_empty() && self.frozen.read().is_empty() {
                return Ok(());
            }
            old.freeze();
            *active = Arc::new(MemTable::new());
            old
        };
        if !frozen_mem.is_empty() {
            self.frozen.write().insert(0, Flushable::Mem(frozen_mem));
        }

        let work: Vec<Flushable> = std::mem::take(&mut *self.frozen.write());
        // Oldest first so L0 max_seq ordering matches arrival.
        for flushable in work.into_iter().rev() {
            match flushable {
                Flushable::Mem(mt) => {
                    let handle = self.write_memtable_to_sst(&mt)?;
                    if let Some(h) = handle {
                        self.levels.write()[0].insert(0, h);
                    }
                }
                Flushable::Ingested(mut handle) => {
                    handle.meta.level = 0;
                    self.levels.write()[0].insert(0, handle);
                }
            }
        }

        let through_seq = self.visible_seq.load(Ordering::Acquire);
        self.wal
            .append(&WalRecord::FlushMarker { through_seq }, false)?;
        self.wal.flush()?;
        EngineCounters::inc(&self.counters.flushes_completed);

        self.maybe_trigger_compaction()?;
        Ok(())
    }

    fn write_memtable_to_sst(&self, mt: &MemTable) -> KestrelResult<Option<SstHandle>> {
        let points = mt.drain_sorted();
        let range_dels = mt.all_range_dels();
        let range_keys = mt.all_range_keys();
        if points.is_empty() && range_dels.is_empty() && range_keys.is_empty() {
            return Ok(None);
        }
        let file_seq = next_file_id();
        let path = self.data_dir.join(format!("sst_L0_{file_seq:06}.sst"));
        let mut writer = SstWriter::new(&path, points.len())?;
        for (key, versions) in &points {
            // Versions are newest-first in the memtable; the sstable wants
            // (key asc, seq desc), which matches.
            for v in versions {
                writer.add(key, v.seq, v.kind, &v.value)?;
            }
        }
        for d in range_dels {
            writer.add_range_del(d);
        }
        for rk in range_keys {
            writer.add_range_key(rk);
        }
        let meta = writer.finish(0, FileLocality::Local)?;
        let file = SstFile::new(meta.path.clone(), meta.file_id, FileLocality::Local);
        Ok(Some(SstHandle::new(file, meta)))
    }

    // ── Compaction ──────────────────────────────────────────────────────

    fn maybe_trigger_compaction(&self) -> KestrelResult<()> {
        let l0_count = self.levels.read()[0].len();
        if self.compactor.should_compact_l0(l0_count) {
            self.compact()?;
        }
        Ok(())
    }

    /// Run one L0→L1 compaction.
    pub fn compact(&self) -> KestrelResult<()> {
        self.pin_snapshots()?;
        let (l0, l1) = {
            let levels = self.levels.read();
            (levels[0].clone(), levels.get(1).cloned().unwrap_or_default())
        };
        if l0.is_empty() {
            return Ok(());
        }
        let result = self
            .compactor
            .compact_l0_to_l1(&l0, &l1, self.oldest_pinned_seq(), Some(&self.cache))
            .map_err(|e| self.observe_error(e.into()))?;

        let mut levels = self.levels.write();
        let consumed_ids: Vec<u64> = result.consumed.iter().map(|h| h.meta.file_id).collect();
        levels[0].retain(|h| !consumed_ids.contains(&h.meta.file_id));
        if levels.len() > 1 {
            levels[1].retain(|h| !consumed_ids.contains(&h.meta.file_id));
            levels[1].extend(result.produced);
            levels[1].sort_by(|a, b| a.meta.min_key.cmp(&b.meta.min_key));
        }
        let live: Vec<Vec<SstHandle>> = levels.clone();
        drop(levels);

        // Mark files obsolete only when no surviving handle (including
        // virtual splits) shares them. Snapshots holding clones keep the
        // bytes alive until they close.
        for consumed in &result.consumed {
            let shared = live
                .iter()
                .flatten()
                .any(|h| Arc::ptr_eq(&h.file, &consumed.file));
            if !shared {
                consumed.file.mark_obsolete();
                self.cache.evict_file(consumed.meta.file_id);
            }
        }
        Ok(())
    }

    /// Synchronous compaction restricted to files overlapping
    /// `[start, end)` of encoded keys.
    pub fn compact_range(&self, start: &[u8], end: &[u8]) -> KestrelResult<()> {
        self.pin_snapshots()?;
        let (l0, l1) = {
            let levels = self.levels.read();
            let l0: Vec<SstHandle> = levels[0]
                .iter()
                .filter(|h| h.meta.overlaps(start, end))
                .cloned()
                .collect();
            let l1: Vec<SstHandle> = levels
                .get(1)
                .map(|l| {
                    l.iter()
                        .filter(|h| h.meta.overlaps(start, end))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (l0, l1)
        };
        if l0.is_empty() && l1.is_empty() {
            return Ok(());
        }
        let result = self
            .compactor
            .compact_l0_to_l1(&l0, &l1, self.oldest_pinned_seq(), Some(&self.cache))
            .map_err(|e| self.observe_error(e.into()))?;

        let mut levels = self.levels.write();
        let consumed_ids: Vec<u64> = result.consumed.iter().map(|h| h.meta.file_id).collect();
        for level in levels.iter_mut() {
            level.retain(|h| !consumed_ids.contains(&h.meta.file_id));
        }
        if levels.len() > 1 {
            levels[1].extend(result.produced);
            levels[1].sort_by(|a, b| a.meta.min_key.cmp(&b.meta.min_key));
        }
        let live: Vec<Vec<SstHandle>> = levels.clone();
        drop(levels);
        for consumed in &result.consumed {
            let shared = live
                .iter()
                .flatten()
                .any(|h| Arc::ptr_eq(&h.file, &consumed.file));
            if !shared {
                consumed.file.mark_obsolete();
                self.cache.evict_file(consumed.meta.file_id);
            }
        }
        Ok(())
    }

    // ── Ingest / excise ─────────────────────────────────────────────────

    /// Atomically add pre-built sstables.
    pub fn ingest(&self, paths: &[PathBuf]) -> KestrelResult<()> {
        self.ingest_with_locality(paths, FileLocality::Local)
    }

    /// Single atomic step: ingest files and remove all existing data in
    /// `excise_span` (a user-key span). `shared` and `external` files are
    /// recorded with their locality for disk accounting.
    pub fn ingest_and_excise(
        &self,
        paths: &[PathBuf],
        shared: &[PathBuf],
        external: &[PathBuf],
        excise_span: &Span,
    ) -> KestrelResult<()> {
        let _commit = self.commit_mu.lock();
        self.excise_locked(excise_span)?;
        drop(_commit);
        self.ingest_with_locality(paths, FileLocality::Local)?;
        self.ingest_with_locality(shared, FileLocality::Remote)?;
        self.ingest_with_locality(external, FileLocality::External)?;
        EngineCounters::inc(&self.counters.excises_completed);
        Ok(())
    }

    /// Atomic removal of a user-key span.
    pub fn excise(&self, span: &Span) -> KestrelResult<()> {
        let _commit = self.commit_mu.lock();
        self.excise_locked(span)?;
        EngineCounters::inc(&self.counters.excises_completed);
        Ok(())
    }

    fn excise_locked(&self, span: &Span) -> KestrelResult<()> {
        self.pin_snapshots()?;
        let start = user_key_lower_bound(&span.start);
        let end = user_key_lower_bound(&span.end);

        // A combined rangedel + rangekey-del effect at the encoded bounds:
        // one range tombstone plus an unset for every live range key the
        // span touches, committed as a single batch so WAL replay
        // reconstructs the same state.
        let mut ops = vec![BatchOp::DeleteRange {
            start: start.clone(),
            end: end.clone(),
        }];
        let view = self.view_at(self.visible_seq.load(Ordering::Acquire));
        for rk in view.collect_range_keys()? {
            if !rk.unset && rk.start < span.end && span.start < rk.end {
                ops.push(BatchOp::RangeKeyUnset {
                    start: span.start.clone().max(rk.start.clone()),
                    end: span.end.clone().min(rk.end.clone()),
                    ts_wall: rk.ts_wall,
                    ts_logical: rk.ts_logical,
                });
            }
        }
        let n = ops.len() as u64;
        let first_seq = self.next_seq.fetch_add(n, Ordering::SeqCst);
        self.wal.append(
            &WalRecord::Batch {
                first_seq,
                ops: ops.clone(),
            },
            self.config.wal_sync,
        )?;
        let memtable = self.active_memtable.read().clone();
        let mut seq = first_seq;
        for op in ops {
            Self::apply_op_to_memtable(&memtable, op, seq)
                .map_err(|_| KestrelError::internal("E-ENGINE-002", "active memtable frozen"))?;
            seq += 1;
        }
        self.visible_seq.store(first_seq + n - 1, Ordering::Release);

        // Delete-only compaction: drop or clip files under the span.
        let partial = self
            .config
            .settings
            .get_bool(settings::DELETE_COMPACTION_EXCISE_ENABLED);
        let mut levels = self.levels.write();
        let mut removed_all: Vec<SstHandle> = Vec::new();
        for level in levels.iter_mut() {
            let (kept, removed) =
                self.compactor
                    .delete_only_compaction(level, &start, &end, partial);
            *level = kept;
            removed_all.extend(removed);
        }
        let live: Vec<Vec<SstHandle>> = levels.clone();
        drop(levels);
        for handle in &removed_all {
            let shared = live
                .iter()
                .flatten()
                .any(|h| Arc::ptr_eq(&h.file, &handle.file));
            if !shared {
                handle.file.mark_obsolete();
                self.cache.evict_file(handle.meta.file_id);
            }
        }
        Ok(())
    }

    fn ingest_with_locality(
        &self,
        paths: &[PathBuf],
        locality: FileLocality,
    ) -> KestrelResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let _commit = self.commit_mu.lock();
        for path in paths {
            let file_id = next_file_id();
            let file = SstFile::new(path.clone(), file_id, locality);
            let reader = match file.reader() {
                Ok(r) => r,
                Err(e) => return Err(self.observe_error(e.into())),
            };
            let bounds = reader.key_bounds(Some(&self.cache))?;
            let (min_key, max_key) = match bounds {
                Some(b) => b,
                None => continue,
            };
            let assigned_seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let meta = crate::sst::SstMeta {
                file_id,
                path: path.clone(),
                level: 0,
                min_key: min_key.clone(),
                max_key: max_key.clone(),
                entry_count: reader.entry_count(),
                file_size: fs::metadata(path)?.len(),
                max_seq: assigned_seq,
                locality,
            };
            let mut handle = SstHandle::new(file, meta);
            handle.assigned_seq = Some(assigned_seq);

            let placed = self.place_ingested(handle, &min_key, &max_key)?;
            if let Some(level) = placed {
                tracing::debug!(?path, level, "ingested sstable");
            }
            self.visible_seq.store(assigned_seq, Ordering::Release);
            EngineCounters::inc(&self.counters.ingests_completed);
        }
        Ok(())
    }

    /// Place an ingested sstable: lazily as a flushable when it overlaps
    /// the memtable (setting-gated, never on shared storage); otherwise at
    /// the lowest level whose files it does not overlap, virtually
    /// splitting a single spanning file when ingest-split is enabled.
    fn place_ingested(
        &self,
        mut handle: SstHandle,
        min_key: &[u8],
        max_key: &[u8],
    ) -> KestrelResult<Option<u32>> {
        let overlaps_memtable = {
            let active = self.active_memtable.read();
            !active
                .scan(min_key, Some(&upper_inclusive(max_key)), u64::MAX)
                .is_empty()
        };
        let flushable_ok = self
            .config
            .settings
            .get_bool(settings::INGEST_AS_FLUSHABLE_ENABLED)
            && !self.config.shared_storage;
        if overlaps_memtable && flushable_ok {
            self.frozen.write().insert(0, Flushable::Ingested(handle));
            return Ok(None);
        }
        if overlaps_memtable {
            // No lazy path available: force the memtable out first.
            self.flush()?;
        }

        let ingest_split = self.config.settings.get_bool(settings::INGEST_SPLIT_ENABLED);
        let mut levels = self.levels.write();
        // Deepest level first: land as low as possible.
        for lvl in (0..levels.len()).rev() {
            let overlapping: Vec<usize> = levels[lvl]
                .iter()
                .enumerate()
                .filter(|(_, h)| h.meta.overlaps(min_key, &upper_inclusive(max_key)))
                .map(|(i, _)| i)
                .collect();
            // Shallower levels must also be clear, or their newer data
            // would be shadowed by lookup order.
            let shallower_clear = levels[..lvl]
                .iter()
                .flatten()
                .all(|h| !h.meta.overlaps(min_key, &upper_inclusive(max_key)));
            if !shallower_clear {
                continue;
            }
            if overlapping.is_empty() {
                handle.meta.level = lvl as u32;
                levels[lvl].push(handle);
                if lvl > 0 {
                    levels[lvl].sort_by(|a, b| a.meta.min_key.cmp(&b.meta.min_key));
                }
                return Ok(Some(lvl as u32));
            }
            if ingest_split && lvl > 0 && overlapping.len() == 1 {
                let idx = overlapping[0];
                let existing = levels[lvl][idx].clone();
                // Only split when the destination span is empty in the
                // existing file.
                let occupied = !existing
                    .scan(min_key, Some(&upper_inclusive(max_key)), u64::MAX, Some(&self.cache))?
                    .is_empty();
                if !occupied {
                    let (lo, hi) = existing.coverage();
                    let mut left = existing.clone();
                    left.bounds = Some((lo.clone(), min_key.to_vec()));
                    let mut right = existing.clone();
                    right.bounds = Some((upper_inclusive(max_key), upper_inclusive(&hi)));
                    levels[lvl].remove(idx);
                    levels[lvl].push(left);
                    levels[lvl].push(right);
                    handle.meta.level = lvl as u32;
                    levels[lvl].push(handle);
                    levels[lvl].sort_by(|a, b| a.coverage().0.cmp(&b.coverage().0));
                    return Ok(Some(lvl as u32));
                }
            }
        }
        // Fall back to L0.
        handle.meta.level = 0;
        levels[0].insert(0, handle);
        Ok(Some(0))
    }

    // ── Snapshots & views ───────────────────────────────────────────────

    /// Assemble a view of the current state at `seq`.
    fn view_at(&self, seq: u64) -> ReadView {
        let mut memtables = vec![self.active_memtable.read().clone()];
        let mut flushables = Vec::new();
        for f in self.frozen.read().iter() {
            match f {
                Flushable::Mem(mt) => memtables.push(mt.clone()),
                Flushable::Ingested(h) => flushables.push(h.clone()),
            }
        }
        ReadView {
            seq,
            memtables,
            flushables,
            levels: self.levels.read().clone(),
            cache: self.cache.clone(),
        }
    }

    /// View of the latest committed state.
    pub fn current_view(&self) -> ReadView {
        self.view_at(self.visible_seq.load(Ordering::Acquire))
    }

    /// Create a point-in-time snapshot bounded by `spans` (whole keyspace
    /// when empty). Cheap until background work forces pinning.
    pub fn new_snapshot(&self, spans: Vec<Span>) -> EngineSnapshot<'_> {
        let state = SnapshotState::new(self.visible_seq.load(Ordering::Acquire), spans);
        self.snapshots.lock().push(Arc::downgrade(&state));
        EngineSnapshot {
            engine: self,
            state,
        }
    }

    /// Materialize views for all cheap snapshots before history-destroying
    /// background work.
    fn pin_snapshots(&self) -> KestrelResult<()> {
        let mut snaps = self.snapshots.lock();
        snaps.retain(|w| w.strong_count() > 0);
        for weak in snaps.iter() {
            if let Some(state) = weak.upgrade() {
                if !state.is_pinned() {
                    state.pin(self.view_at(state.seq));
                }
            }
        }
        Ok(())
    }

    /// Smallest sequence any live snapshot reads at.
    fn oldest_pinned_seq(&self) -> u64 {
        let mut snaps = self.snapshots.lock();
        snaps.retain(|w| w.strong_count() > 0);
        snaps
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|s| s.seq)
            .min()
            .unwrap_or(u64::MAX)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn get(&self, key: &[u8]) -> KestrelResult<Option<Vec<u8>>> {
        if key.is_empty() {
            return Err(StorageError::EmptyKey.into());
        }
        self.current_view()
            .get_point(key)
            .map_err(|e| self.observe_error(e))
    }

    pub fn iter(&self, opts: IterOptions) -> KestrelResult<EngineIter> {
        EngineCounters::inc(&self.counters.iterators_opened);
        EngineIter::new(&self.current_view(), opts).map_err(|e| self.observe_error(e))
    }

    // ── MVCC convenience layer ──────────────────────────────────────────

    pub fn mvcc_put(&self, user_key: &[u8], ts: Timestamp, value: &[u8]) -> KestrelResult<()> {
        let key = EngineKey::mvcc(user_key.to_vec(), ts).encode();
        self.put(&key, &MvccValue::value(value.to_vec()).encode())
    }

    pub fn mvcc_delete(&self, user_key: &[u8], ts: Timestamp) -> KestrelResult<()> {
        let key = EngineKey::mvcc(user_key.to_vec(), ts).encode();
        self.put(&key, &MvccValue::tombstone().encode())
    }

    /// Write an MVCC range tombstone over `[start, end)` at `ts`.
    pub fn mvcc_delete_range(
        &self,
        start: &[u8],
        end: &[u8],
        ts: Timestamp,
    ) -> KestrelResult<()> {
        self.range_key_set(start, end, ts, &[])
    }

    pub fn mvcc_get(&self, user_key: &[u8], ts: Timestamp) -> KestrelResult<MvccGetResult> {
        mvcc_get(&self.current_view(), user_key, ts).map_err(|e| self.observe_error(e))
    }

    pub fn mvcc_scan(
        &self,
        lower_user: &[u8],
        upper_user: &[u8],
        ts: Timestamp,
    ) -> KestrelResult<MvccScanResult> {
        mvcc_scan(&self.current_view(), lower_user, upper_user, ts)
            .map_err(|e| self.observe_error(e))
    }

    /// Leave an intent record for `txn_id` at `user_key`.
    pub fn mvcc_put_intent(&self, user_key: &[u8], txn_id: TxnId) -> KestrelResult<()> {
        let key = EngineKey::bare(user_key.to_vec()).encode();
        self.put(&key, &encode_intent_meta(txn_id))
    }

    /// Remove the intent record at `user_key`.
    pub fn mvcc_clear_intent(&self, user_key: &[u8]) -> KestrelResult<()> {
        let key = EngineKey::bare(user_key.to_vec()).encode();
        self.delete(&key)
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// `(total, remote, external)` byte estimates for files overlapping the
    /// encoded key range.
    pub fn approximate_disk_bytes(&self, start: &[u8], end: &[u8]) -> (u64, u64, u64) {
        let levels = self.levels.read();
        let mut total = 0;
        let mut remote = 0;
        let mut external = 0;
        for h in levels.iter().flatten() {
            if h.meta.overlaps(start, end) {
                total += h.meta.file_size;
                match h.meta.locality {
                    FileLocality::Local => {}
                    FileLocality::Remote => remote += h.meta.file_size,
                    FileLocality::External => external += h.meta.file_size,
                }
            }
        }
        (total, remote, external)
    }

    pub fn metrics(&self) -> EngineMetrics {
        let levels = self.levels.read();
        let level_metrics: Vec<LevelMetrics> = levels
            .iter()
            .map(|l| LevelMetrics {
                file_count: l.len(),
                bytes: l.iter().map(|h| h.meta.file_size).sum(),
            })
            .collect();
        drop(levels);

        let cpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let env_override = std::env::var("KESTREL_COMPACTION_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok());
        let setting_max = self
            .config
            .settings
            .get_u64(settings::MAX_COMPACTION_CONCURRENCY) as usize;
        // The compaction_concurrency setting is the configured lower bound;
        // it floors the range rather than forcing a fixed value.
        let lower = self.config.settings.get_u64(settings::COMPACTION_CONCURRENCY) as usize;

        EngineMetrics {
            levels: level_metrics,
            memtable_bytes: self.active_memtable.read().approx_bytes(),
            flushable_count: self.frozen.read().len(),
            wal_queued_bytes: self.wal.queued_bytes(),
            flushes_completed: self.counters.flushes_completed.load(Ordering::Relaxed),
            write_stall_count: self.counters.write_stall_count.load(Ordering::Relaxed),
            write_stall_duration_ms: self
                .counters
                .write_stall_duration_ms
                .load(Ordering::Relaxed),
            disk_slow_count: self.counters.disk_slow_count.load(Ordering::Relaxed)
                + self.wal.disk_slow_events(),
            corruption_count: self.counters.corruption_count.load(Ordering::Relaxed),
            iterators_opened: self.counters.iterators_opened.load(Ordering::Relaxed),
            batches_committed: self.counters.batches_committed.load(Ordering::Relaxed),
            ingests_completed: self.counters.ingests_completed.load(Ordering::Relaxed),
            excises_completed: self.counters.excises_completed.load(Ordering::Relaxed),
            block_cache: self.cache.snapshot(),
            compaction: self.compactor.stats(),
            visible_seq: self.visible_seq.load(Ordering::Acquire),
            compaction_concurrency: concurrency_range(lower, cpu, env_override, setting_max, None),
        }
    }

    /// Write a checkpoint of the engine to `target`, restricted to `spans`
    /// (whole keyspace when empty).
    pub fn checkpoint(&self, target: &Path, spans: &[Span]) -> KestrelResult<()> {
        // Flush first so the checkpoint is fully file-backed.
        self.flush()?;
        let levels = self.levels.read();
        let sst_paths: Vec<PathBuf> = levels
            .iter()
            .flatten()
            .filter(|h| {
                if spans.is_empty() {
                    return true;
                }
                spans.iter().any(|s| {
                    let lo = user_key_lower_bound(&s.start);
                    let hi = user_key_lower_bound(&s.end);
                    h.meta.overlaps(&lo, &hi)
                })
            })
            .map(|h| h.meta.path.clone())
            .collect();
        drop(levels);
        let wal_paths: Vec<PathBuf> = fs::read_dir(&self.data_dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("wal"))
            .collect();
        write_checkpoint(target, spans, &sst_paths, &wal_paths)?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.config.settings
    }

    /// Flush and quiesce before process exit.
    pub fn close(&self) -> KestrelResult<()> {
        self.flush()?;
        self.wal.flush()?;
        Ok(())
    }
}

/// Exclusive bound just above an inclusive max key.
fn upper_inclusive(max_key: &[u8]) -> Vec<u8> {
    let mut k = max_key.to_vec();
    k.push(0);
    k
}

/// A point-in-time snapshot handle.
pub struct EngineSnapshot<'a> {
    engine: &'a Engine,
    state: Arc<SnapshotState>,
}

impl<'a> EngineSnapshot<'a> {
    fn view(&self) -> ReadView {
        if let Some(pinned) = self.state.pinned.lock().clone() {
            return pinned;
        }
        self.engine.view_at(self.state.seq)
    }

    pub fn is_pinned(&self) -> bool {
        self.state.is_pinned()
    }

    pub fn seq(&self) -> u64 {
        self.state.seq
    }

    pub fn get(&self, key: &[u8]) -> KestrelResult<Option<Vec<u8>>> {
        if let Some(user_key) = EngineKey::decode_user_key(key) {
            self.state.check_covers(&user_key)?;
        }
        self.view().get_point(key)
    }

    pub fn mvcc_get(&self, user_key: &[u8], ts: Timestamp) -> KestrelResult<MvccGetResult> {
        self.state.check_covers(user_key)?;
        mvcc_get(&self.view(), user_key, ts)
    }

    pub fn mvcc_scan(
        &self,
        lower_user: &[u8],
        upper_user: &[u8],
        ts: Timestamp,
    ) -> KestrelResult<MvccScanResult> {
        self.state.check_covers(lower_user)?;
        mvcc_scan(&self.view(), lower_user, upper_user, ts)
    }

    pub fn iter(&self, opts: IterOptions) -> KestrelResult<EngineIter> {
        EngineIter::new(&self.view(), opts)
    }
}
