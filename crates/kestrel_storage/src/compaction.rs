//! Leveled compaction.
//!
//! L0 holds freshly flushed, overlapping sstables; L1+ hold non-overlapping
//! files. Compaction merges L0 into L1, dropping versions that are both
//! shadowed and unreachable by any pinned snapshot, annihilating
//! single-delete pairs, and dropping point entries covered by range
//! tombstones. Delete-only compactions triggered by an excise drop fully
//! covered files outright and may clip partially covered files when
//! partial excise is enabled.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use kestrel_common::error::StorageError;
use kestrel_common::types::Span;

use crate::block_cache::BlockCache;
use crate::memtable::PointKind;
use crate::sst::{FileLocality, SstFile, SstHandle, SstPointEntry, SstRangeBlock, SstWriter};

/// Compaction configuration.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// L0 file count that triggers compaction.
    pub l0_compaction_trigger: usize,
    /// L0 file count that stalls writes until compaction catches up.
    pub l0_stall_trigger: usize,
    /// Lower bound of the compaction concurrency range.
    pub concurrency_lower: usize,
    pub max_levels: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            l0_compaction_trigger: 4,
            l0_stall_trigger: 12,
            concurrency_lower: 1,
            max_levels: 7,
        }
    }
}

/// Compute the effective compaction concurrency range `[lower, upper]`.
///
/// `upper = max(lower, min(cpu - 1, env_override, cluster_setting))`, with
/// zero/absent inputs treated as unbounded. A forced override pins both
/// ends.
pub fn concurrency_range(
    lower: usize,
    cpu_count: usize,
    env_override: Option<usize>,
    cluster_setting: usize,
    forced: Option<usize>,
) -> (usize, usize) {
    if let Some(f) = forced {
        let f = f.max(1);
        return (f, f);
    }
    let lower = lower.max(1);
    let mut upper = cpu_count.saturating_sub(1).max(1);
    if let Some(e) = env_override {
        if e > 0 {
            upper = upper.min(e);
        }
    }
    if cluster_setting > 0 {
        upper = upper.min(cluster_setting);
    }
    (lower, upper.max(lower))
}

/// Result of one compaction run.
pub struct CompactionResult {
    pub consumed: Vec<SstHandle>,
    pub produced: Vec<SstHandle>,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Compaction statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    pub runs_completed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub files_consumed: u64,
    pub files_produced: u64,
    pub files_excised: u64,
    pub files_partially_excised: u64,
}

pub struct Compactor {
    config: CompactionConfig,
    data_dir: PathBuf,
    next_output_seq: AtomicU64,
    stats_runs: AtomicU64,
    stats_bytes_read: AtomicU64,
    stats_bytes_written: AtomicU64,
    stats_files_consumed: AtomicU64,
    stats_files_produced: AtomicU64,
    stats_files_excised: AtomicU64,
    stats_files_partially_excised: AtomicU64,
}

impl Compactor {
    pub fn new(config: CompactionConfig, data_dir: &Path) -> Self {
        Self {
            config,
            data_dir: data_dir.to_path_buf(),
            next_output_seq: AtomicU64::new(1),
            stats_runs: AtomicU64::new(0),
            stats_bytes_read: AtomicU64::new(0),
            stats_bytes_written: AtomicU64::new(0),
            stats_files_consumed: AtomicU64::new(0),
            stats_files_produced: AtomicU64::new(0),
            stats_files_excised: AtomicU64::new(0),
            stats_files_partially_excised: AtomicU64::new(0),
        }
    }

    pub fn should_compact_l0(&self, l0_count: usize) -> bool {
        l0_count >= self.config.l0_compaction_trigger
    }

    pub fn should_stall_writes(&self, l0_count: usize) -> bool {
        l0_count >= self.config.l0_stall_trigger
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Merge the given L0 files and overlapping L1 files into new L1 files.
    ///
    /// `oldest_pinned_seq` is the smallest sequence any live snapshot reads
    /// at (`u64::MAX` when none): versions above it are all kept; below it
    /// only the newest version per key survives.
    pub fn compact_l0_to_l1(
        &self,
        l0_files: &[SstHandle],
        l1_files: &[SstHandle],
        oldest_pinned_seq: u64,
        cache: Option<&BlockCache>,
    ) -> Result<CompactionResult, StorageError> {
        let mut all_entries: Vec<SstPointEntry> = Vec::new();
        let mut merged_ranges = SstRangeBlock::default();
        let mut bytes_read = 0u64;

        let mut l0_min: Option<Vec<u8>> = None;
        let mut l0_max: Option<Vec<u8>> = None;
        for h in l0_files {
            let (lo, hi) = h.coverage();
            l0_min = Some(l0_min.map_or(lo.clone(), |m: Vec<u8>| m.min(lo)));
            l0_max = Some(l0_max.map_or(hi.clone(), |m: Vec<u8>| m.max(hi)));
        }
        let l0_min = l0_min.unwrap_or_default();
        let l0_max = l0_max.unwrap_or_default();

        let mut consumed: Vec<SstHandle> = Vec::new();
        for h in l0_files {
            all_entries.extend(h.scan(&[], None, u64::MAX, cache)?);
            let rb = h.range_block()?;
            merged_ranges.range_dels.extend(rb.range_dels);
            merged_ranges.range_keys.extend(rb.range_keys);
            bytes_read += h.meta.file_size;
            consumed.push(h.clone());
        }
        for h in l1_files {
            let (lo, hi) = h.coverage();
            if hi >= l0_min && lo <= l0_max {
                all_entries.extend(h.scan(&[], None, u64::MAX, cache)?);
                let rb = h.range_block()?;
                merged_ranges.range_dels.extend(rb.range_dels);
                merged_ranges.range_keys.extend(rb.range_keys);
                bytes_read += h.meta.file_size;
                consumed.push(h.clone());
            }
        }

        // (key asc, seq desc).
        all_entries.sort_by(|a, b| a.key.cmp(&b.key).then(b.seq.cmp(&a.seq)));

        let kept = Self::collect_survivors(all_entries, &merged_ranges, oldest_pinned_seq);

        let mut produced = Vec::new();
        let mut bytes_written = 0u64;
        if !kept.is_empty() || !merged_ranges.range_dels.is_empty() || !merged_ranges.range_keys.is_empty()
        {
            let out_seq = self.next_output_seq.fetch_add(1, Ordering::Relaxed);
            let out_path = self.data_dir.join(format!("sst_L1_{out_seq:06}.sst"));
            let mut writer = SstWriter::new(&out_path, kept.len())?;
            for e in &kept {
                writer.add(&e.key, e.seq, e.kind, &e.value)?;
            }
            for d in &merged_ranges.range_dels {
                writer.add_range_del(d.clone());
            }
            for rk in &merged_ranges.range_keys {
                writer.add_range_key(rk.clone());
            }
            let meta = writer.finish(1, FileLocality::Local)?;
            bytes_written += meta.file_size;
            let file = SstFile::new(meta.path.clone(), meta.file_id, FileLocality::Local);
            produced.push(SstHandle::new(file, meta));
        }

        self.stats_runs.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.stats_bytes_written
            .fetch_add(bytes_written, Ordering::Relaxed);
        self.stats_files_consumed
            .fetch_add(consumed.len() as u64, Ordering::Relaxed);
        self.stats_files_produced
            .fetch_add(produced.len() as u64, Ordering::Relaxed);

        Ok(CompactionResult {
            consumed,
            produced,
            bytes_read,
            bytes_written,
        })
    }

    /// Version-retention policy: keep everything a snapshot might read,
    /// collapse the rest to the newest visible version per key, drop
    /// range-del-covered entries and annihilated single-delete pairs.
    fn collect_survivors(
        sorted: Vec<SstPointEntry>,
        ranges: &SstRangeBlock,
        oldest_pinned_seq: u64,
    ) -> Vec<SstPointEntry> {
        let mut out: Vec<SstPointEntry> = Vec::with_capacity(sorted.len());
        let mut i = 0;
        while i < sorted.len() {
            // Collect this key's versions (already newest first).
            let key = sorted[i].key.clone();
            let mut versions: Vec<SstPointEntry> = Vec::new();
            while i < sorted.len() && sorted[i].key == key {
                versions.push(sorted[i].clone());
                i += 1;
            }
            versions.dedup_by(|a, b| a.seq == b.seq);

            // Drop entries covered by a range tombstone, unless a snapshot
            // still reads below the tombstone.
            versions.retain(|v| {
                !ranges.range_dels.iter().any(|d| {
                    d.covers(&v.key, v.seq) && d.seq <= oldest_pinned_seq
                })
            });

            // Single-delete annihilation: a single delete and the version
            // directly below it cancel out once unpinned.
            let mut j = 0;
            while j + 1 < versions.len() {
                if versions[j].kind == PointKind::SingleDelete
                    && versions[j + 1].kind == PointKind::Set
                    && versions[j].seq <= oldest_pinned_seq
                {
                    versions.drain(j..j + 2);
                } else {
                    j += 1;
                }
            }

            // Keep all pinned versions plus the newest unpinned one.
            let mut kept_unpinned = false;
            for v in versions {
                if v.seq > oldest_pinned_seq {
                    out.push(v);
                } else if !kept_unpinned {
                    kept_unpinned = true;
                    out.push(v);
                }
            }
        }
        out
    }

    /// Delete-only compaction for an excised span: drop files whose whole
    /// coverage lies inside the span; when `partial_enabled`, clip files the
    /// span only partially covers. Returns `(kept, removed)`.
    pub fn delete_only_compaction(
        &self,
        handles: &[SstHandle],
        excise_start: &[u8],
        excise_end: &[u8],
        partial_enabled: bool,
    ) -> (Vec<SstHandle>, Vec<SstHandle>) {
        let mut kept = Vec::new();
        let mut removed = Vec::new();
        let span = Span::new(excise_start.to_vec(), excise_end.to_vec());
        for h in handles {
            let (lo, hi) = h.coverage();
            let covered_fully = span.contains_key(&lo) && span.contains_key(&hi);
            let overlaps = lo.as_slice() < excise_end && excise_start <= hi.as_slice();
            if covered_fully {
                self.stats_files_excised.fetch_add(1, Ordering::Relaxed);
                removed.push(h.clone());
            } else if overlaps && partial_enabled {
                // Clip the handle to the parts outside the span. Virtual: the
                // file is shared, only the bounds shrink.
                self.stats_files_partially_excised
                    .fetch_add(1, Ordering::Relaxed);
                if lo.as_slice() < excise_start {
                    let mut left = h.clone();
                    left.bounds = Some((lo.clone(), excise_start.to_vec()));
                    kept.push(left);
                }
                if hi.as_slice() >= excise_end {
                    let mut right = h.clone();
                    let mut hi_excl = hi.clone();
                    hi_excl.push(0);
                    right.bounds = Some((excise_end.to_vec(), hi_excl));
                    kept.push(right);
                }
            } else {
                kept.push(h.clone());
            }
        }
        (kept, removed)
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            runs_completed: self.stats_runs.load(Ordering::Relaxed),
            bytes_read: self.stats_bytes_read.load(Ordering::Relaxed),
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            files_consumed: self.stats_files_consumed.load(Ordering::Relaxed),
            files_produced: self.stats_files_produced.load(Ordering::Relaxed),
            files_excised: self.stats_files_excised.load(Ordering::Relaxed),
            files_partially_excised: self.stats_files_partially_excised.load(Ordering::Relaxed),
        }
    }
}
