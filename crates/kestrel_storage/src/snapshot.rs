//! Consistent read views and snapshots.
//!
//! A [`ReadView`] captures everything a read needs: the visible sequence,
//! the live memtables, and the sstable handles per level. Iterators own a
//! view for their whole lifetime.
//!
//! A [`Snapshot`] starts cheap: it records only the visible sequence and
//! its bounding spans, reading through the engine's current structures.
//! Before background work (flush, compaction, excise) invalidates history,
//! the engine pins every cheap snapshot by materializing a full view;
//! after which the snapshot reads only from its pinned files and memtables.

use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_common::error::{KestrelResult, StorageError};
use kestrel_common::types::Span;

use crate::block_cache::BlockCache;
use crate::memtable::{MemTable, PointKind, RangeKeyRecord, RangeTombstone};
use crate::sst::SstHandle;

/// A single version of a point key, merged across memtables and sstables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRec {
    pub seq: u64,
    pub kind: PointKind,
    pub value: Vec<u8>,
}

/// A consistent view of engine state for reads at `seq`.
#[derive(Clone)]
pub struct ReadView {
    pub seq: u64,
    /// Newest first: active memtable, then frozen memtables.
    pub memtables: Vec<Arc<MemTable>>,
    /// Lazily ingested sstables queued in the flush pipeline, newest first.
    pub flushables: Vec<SstHandle>,
    /// Sstables per level; L0 newest first, L1+ sorted by key.
    pub levels: Vec<Vec<SstHandle>>,
    pub cache: Arc<BlockCache>,
}

impl ReadView {
    /// All versions (newest first) of every key in `[lower, upper)` visible
    /// at this view's sequence, sorted by key.
    pub fn collect_point_versions(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> KestrelResult<Vec<(Vec<u8>, Vec<VersionRec>)>> {
        use std::collections::BTreeMap;
        let mut merged: BTreeMap<Vec<u8>, Vec<VersionRec>> = BTreeMap::new();

        for mt in &self.memtables {
            for (key, versions) in mt.scan(lower, upper, self.seq) {
                let recs = merged.entry(key).or_default();
                for v in versions {
                    recs.push(VersionRec {
                        seq: v.seq,
                        kind: v.kind,
                        value: v.value,
                    });
                }
            }
        }
        for handle in self.flushables.iter().chain(self.levels.iter().flatten()) {
            for e in handle.scan(lower, upper, self.seq, Some(&self.cache))? {
                merged.entry(e.key).or_default().push(VersionRec {
                    seq: e.seq,
                    kind: e.kind,
                    value: e.value,
                });
            }
        }

        let mut out: Vec<(Vec<u8>, Vec<VersionRec>)> = merged.into_iter().collect();
        for (_, versions) in out.iter_mut() {
            versions.sort_by(|a, b| b.seq.cmp(&a.seq));
            versions.dedup_by(|a, b| a.seq == b.seq);
        }
        Ok(out)
    }

    /// All range tombstones visible at this view's sequence.
    pub fn collect_range_dels(&self) -> KestrelResult<Vec<RangeTombstone>> {
        let mut out = Vec::new();
        for mt in &self.memtables {
            out.extend(mt.range_dels(self.seq));
        }
        for handle in self.flushables.iter().chain(self.levels.iter().flatten()) {
            let rb = handle.range_block()?;
            out.extend(rb.range_dels.into_iter().filter(|d| d.seq <= self.seq));
        }
        Ok(out)
    }

    /// All range key records visible at this view's sequence.
    pub fn collect_range_keys(&self) -> KestrelResult<Vec<RangeKeyRecord>> {
        let mut out = Vec::new();
        for mt in &self.memtables {
            out.extend(mt.range_keys(self.seq));
        }
        for handle in self.flushables.iter().chain(self.levels.iter().flatten()) {
            let rb = handle.range_block()?;
            out.extend(rb.range_keys.into_iter().filter(|r| r.seq <= self.seq));
        }
        Ok(out)
    }

    /// Resolve the visible state of one encoded key: apply range-tombstone
    /// masking, single deletes, and merge-operand folding.
    pub fn get_point(&self, key: &[u8]) -> KestrelResult<Option<Vec<u8>>> {
        // Merge operands can be spread over several versions and sources, so
        // gather every visible version of the key rather than the newest.
        let upper = upper_bound_exclusive(key);
        let mut versions: Vec<VersionRec> = Vec::new();
        for mt in &self.memtables {
            for (_, vs) in mt.scan(key, Some(&upper), self.seq) {
                for v in vs {
                    versions.push(VersionRec {
                        seq: v.seq,
                        kind: v.kind,
                        value: v.value,
                    });
                }
            }
        }
        for handle in self.flushables.iter().chain(self.levels.iter().flatten()) {
            for e in handle.scan(key, Some(&upper), self.seq, Some(&self.cache))? {
                versions.push(VersionRec {
                    seq: e.seq,
                    kind: e.kind,
                    value: e.value,
                });
            }
        }
        versions.sort_by(|a, b| b.seq.cmp(&a.seq));
        versions.dedup_by(|a, b| a.seq == b.seq);

        let dels = self.collect_range_dels()?;
        versions.retain(|v| !dels.iter().any(|d| d.covers(key, v.seq)));
        Ok(resolve_versions(&versions))
    }
}

/// Exclusive upper bound immediately after a single encoded key.
fn upper_bound_exclusive(key: &[u8]) -> Vec<u8> {
    let mut k = key.to_vec();
    k.push(0);
    k
}

/// Fold a newest-first version list into the visible value, resolving merge
/// operands against the newest non-merge base.
pub fn resolve_versions(versions: &[VersionRec]) -> Option<Vec<u8>> {
    let mut operands: Vec<&[u8]> = Vec::new();
    for v in versions {
        match v.kind {
            PointKind::Merge => operands.push(&v.value),
            PointKind::Set => {
                let mut out = v.value.clone();
                for op in operands.iter().rev() {
                    out.extend_from_slice(op);
                }
                return Some(out);
            }
            PointKind::Delete | PointKind::SingleDelete => {
                if operands.is_empty() {
                    return None;
                }
                let mut out = Vec::new();
                for op in operands.iter().rev() {
                    out.extend_from_slice(op);
                }
                return Some(out);
            }
        }
    }
    if operands.is_empty() {
        None
    } else {
        let mut out = Vec::new();
        for op in operands.iter().rev() {
            out.extend_from_slice(op);
        }
        Some(out)
    }
}

/// Shared state of one snapshot.
pub struct SnapshotState {
    pub seq: u64,
    /// Bounding spans over user keys; empty means the whole keyspace.
    pub spans: Vec<Span>,
    /// Materialized view once background work demanded pinning.
    pub pinned: Mutex<Option<ReadView>>,
}

impl SnapshotState {
    pub fn new(seq: u64, spans: Vec<Span>) -> Arc<Self> {
        Arc::new(Self {
            seq,
            spans,
            pinned: Mutex::new(None),
        })
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.lock().is_some()
    }

    /// Pin to the given view (idempotent).
    pub fn pin(&self, view: ReadView) {
        let mut pinned = self.pinned.lock();
        if pinned.is_none() {
            *pinned = Some(view);
        }
    }

    /// Whether the snapshot covers `user_key`.
    pub fn covers(&self, user_key: &[u8]) -> bool {
        self.spans.is_empty() || self.spans.iter().any(|s| s.contains_key(user_key))
    }

    pub fn check_covers(&self, user_key: &[u8]) -> KestrelResult<()> {
        if self.covers(user_key) {
            Ok(())
        } else {
            Err(StorageError::SnapshotSpanMismatch.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(seq: u64, kind: PointKind, value: &[u8]) -> VersionRec {
        VersionRec {
            seq,
            kind,
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_resolve_plain_set() {
        let versions = vec![rec(5, PointKind::Set, b"new"), rec(1, PointKind::Set, b"old")];
        assert_eq!(resolve_versions(&versions), Some(b"new".to_vec()));
    }

    #[test]
    fn test_resolve_tombstone_hides() {
        let versions = vec![
            rec(5, PointKind::Delete, b""),
            rec(1, PointKind::Set, b"old"),
        ];
        assert_eq!(resolve_versions(&versions), None);
    }

    #[test]
    fn test_resolve_merge_operands_fold_onto_base() {
        let versions = vec![
            rec(7, PointKind::Merge, b"+c"),
            rec(6, PointKind::Merge, b"+b"),
            rec(5, PointKind::Set, b"a"),
        ];
        assert_eq!(resolve_versions(&versions), Some(b"a+b+c".to_vec()));
    }

    #[test]
    fn test_resolve_merge_without_base() {
        let versions = vec![
            rec(7, PointKind::Merge, b"y"),
            rec(6, PointKind::Merge, b"x"),
        ];
        assert_eq!(resolve_versions(&versions), Some(b"xy".to_vec()));
    }

    #[test]
    fn test_resolve_merge_over_tombstone() {
        let versions = vec![
            rec(7, PointKind::Merge, b"x"),
            rec(6, PointKind::Delete, b""),
            rec(5, PointKind::Set, b"gone"),
        ];
        assert_eq!(resolve_versions(&versions), Some(b"x".to_vec()));
    }

    #[test]
    fn test_snapshot_span_cover() {
        let snap = SnapshotState::new(9, vec![Span::new(b"b".to_vec(), b"m".to_vec())]);
        assert!(snap.covers(b"c"));
        assert!(!snap.covers(b"z"));
        assert!(snap.check_covers(b"z").is_err());

        let unbounded = SnapshotState::new(9, vec![]);
        assert!(unbounded.covers(b"anything"));
    }

    #[test]
    fn test_snapshot_pin_idempotent() {
        let snap = SnapshotState::new(3, vec![]);
        assert!(!snap.is_pinned());
        let view = ReadView {
            seq: 3,
            memtables: vec![Arc::new(MemTable::new())],
            flushables: vec![],
            levels: vec![vec![]],
            cache: Arc::new(BlockCache::new(1024)),
        };
        snap.pin(view.clone());
        assert!(snap.is_pinned());
        // Second pin keeps the first view.
        let view2 = ReadView { seq: 99, ..view };
        snap.pin(view2);
        assert_eq!(snap.pinned.lock().as_ref().unwrap().seq, 3);
    }
}
