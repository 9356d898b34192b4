//! Sorted in-memory write buffer.
//!
//! All writes land in the active memtable first. When the memtable exceeds
//! its budget it is frozen and queued for flush to an L0 sstable. Unlike a
//! last-write-wins map, every write keeps its engine sequence number so
//! snapshots pinned at an older sequence continue to read the versions they
//! saw at creation.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

/// Kind of a point mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum PointKind {
    Set = 1,
    Delete = 2,
    SingleDelete = 3,
    Merge = 4,
}

/// One version of a point key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointVersion {
    pub seq: u64,
    pub kind: PointKind,
    pub value: Vec<u8>,
}

/// A range tombstone over `[start, end)` of encoded keys.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RangeTombstone {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub seq: u64,
}

impl RangeTombstone {
    pub fn covers(&self, key: &[u8], seq: u64) -> bool {
        seq < self.seq && key >= self.start.as_slice() && key < self.end.as_slice()
    }
}

/// A range key record over `[start, end)` of user keys. `unset` records
/// remove earlier range keys with the same suffix timestamp.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RangeKeyRecord {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    /// MVCC suffix of the range key, as raw (wall, logical).
    pub ts_wall: u64,
    pub ts_logical: u32,
    pub seq: u64,
    pub unset: bool,
    pub value: Vec<u8>,
}

/// Sorted in-memory write buffer. Point versions are kept per encoded key,
/// newest sequence first.
pub struct MemTable {
    points: RwLock<BTreeMap<Vec<u8>, Vec<PointVersion>>>,
    range_dels: RwLock<Vec<RangeTombstone>>,
    range_keys: RwLock<Vec<RangeKeyRecord>>,
    approx_bytes: AtomicU64,
    entry_count: AtomicU64,
    frozen: AtomicBool,
}

/// Error returned on writes to a frozen memtable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenError;

impl std::fmt::Display for FrozenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memtable is frozen")
    }
}

impl std::error::Error for FrozenError {}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            points: RwLock::new(BTreeMap::new()),
            range_dels: RwLock::new(Vec::new()),
            range_keys: RwLock::new(Vec::new()),
            approx_bytes: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    fn check_writable(&self) -> Result<(), FrozenError> {
        if self.frozen.load(Ordering::Acquire) {
            Err(FrozenError)
        } else {
            Ok(())
        }
    }

    /// Record a point mutation under `seq`.
    pub fn apply_point(
        &self,
        key: Vec<u8>,
        seq: u64,
        kind: PointKind,
        value: Vec<u8>,
    ) -> Result<(), FrozenError> {
        self.check_writable()?;
        let size = key.len() + value.len() + std::mem::size_of::<PointVersion>();
        let mut points = self.points.write();
        let versions = points.entry(key).or_default();
        if versions.is_empty() {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        // Newest first; seqs are assigned monotonically so push-front holds.
        versions.insert(0, PointVersion { seq, kind, value });
        self.approx_bytes.fetch_add(size as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn apply_range_del(&self, del: RangeTombstone) -> Result<(), FrozenError> {
        self.check_writable()?;
        let size = del.start.len() + del.end.len() + 8;
        self.range_dels.write().push(del);
        self.approx_bytes.fetch_add(size as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn apply_range_key(&self, rk: RangeKeyRecord) -> Result<(), FrozenError> {
        self.check_writable()?;
        let size = rk.start.len() + rk.end.len() + rk.value.len() + 16;
        self.range_keys.write().push(rk);
        self.approx_bytes.fetch_add(size as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Latest version of `key` visible at `max_seq`, if any.
    pub fn get(&self, key: &[u8], max_seq: u64) -> Option<PointVersion> {
        let points = self.points.read();
        points
            .get(key)?
            .iter()
            .find(|v| v.seq <= max_seq)
            .cloned()
    }

    /// All visible versions of all keys in `[lower, upper)` at `max_seq`.
    /// Returns entries in key order; per key, versions newest first.
    pub fn scan(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
        max_seq: u64,
    ) -> Vec<(Vec<u8>, Vec<PointVersion>)> {
        let points = self.points.read();
        let range: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<PointVersion>)>> = match upper {
            Some(u) => Box::new(points.range::<Vec<u8>, _>((
                Bound::Included(&lower.to_vec()),
                Bound::Excluded(&u.to_vec()),
            ))),
            None => Box::new(points.range::<Vec<u8>, _>((
                Bound::Included(&lower.to_vec()),
                Bound::Unbounded,
            ))),
        };
        let mut out = Vec::new();
        for (k, versions) in range {
            let visible: Vec<PointVersion> = versions
                .iter()
                .filter(|v| v.seq <= max_seq)
                .cloned()
                .collect();
            if !visible.is_empty() {
                out.push((k.clone(), visible));
            }
        }
        out
    }

    /// Range tombstones visible at `max_seq`.
    pub fn range_dels(&self, max_seq: u64) -> Vec<RangeTombstone> {
        self.range_dels
            .read()
            .iter()
            .filter(|d| d.seq <= max_seq)
            .cloned()
            .collect()
    }

    /// Range key records visible at `max_seq`.
    pub fn range_keys(&self, max_seq: u64) -> Vec<RangeKeyRecord> {
        self.range_keys
            .read()
            .iter()
            .filter(|r| r.seq <= max_seq)
            .cloned()
            .collect()
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn approx_bytes(&self) -> u64 {
        self.approx_bytes.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count.load(Ordering::Relaxed) == 0
            && self.range_dels.read().is_empty()
            && self.range_keys.read().is_empty()
    }

    /// All point entries in key order, every version, for flush.
    pub fn drain_sorted(&self) -> Vec<(Vec<u8>, Vec<PointVersion>)> {
        let points = self.points.read();
        points
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// All range tombstones, for flush.
    pub fn all_range_dels(&self) -> Vec<RangeTombstone> {
        self.range_dels.read().clone()
    }

    /// All range key records, for flush.
    pub fn all_range_keys(&self) -> Vec<RangeKeyRecord> {
        self.range_keys.read().clone()
    }
}
