//! Engine iterators and MVCC reads.
//!
//! An [`EngineIter`] delivers point keys and range keys in one stream over
//! a pinned [`ReadView`]. Stepping onto a position whose set of covering
//! range keys differs from the previous position raises the
//! `range_key_changed` flag. Iterators may be created with a prefix bloom
//! hint for point lookups or with a key-type filter.
//!
//! The MVCC layer reads "as of" a timestamp: for each user key the highest
//! version `v ≤ T` wins unless it is a tombstone or masked by an MVCC range
//! tombstone; locks discovered along the way are surfaced as intents so the
//! caller can enter conflict resolution.

use kestrel_common::error::KestrelResult;
use kestrel_common::types::{Timestamp, TxnId};

use crate::keys::{user_key_lower_bound, EngineKey, KeyKind};
use crate::memtable::RangeKeyRecord;
use crate::snapshot::{resolve_versions, ReadView};
use crate::value::MvccValue;

/// Which key types an iterator yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterKeyTypeFilter {
    PointsOnly,
    RangesOnly,
    PointsAndRanges,
}

/// Iterator construction options. Bounds are encoded engine keys.
#[derive(Debug, Clone)]
pub struct IterOptions {
    pub lower_bound: Vec<u8>,
    pub upper_bound: Option<Vec<u8>>,
    pub key_types: IterKeyTypeFilter,
    /// Restrict the iterator to versions of a single user key and consult
    /// per-table bloom filters before reading blocks.
    pub prefix_hint: Option<Vec<u8>>,
}

impl IterOptions {
    pub fn span(lower: Vec<u8>, upper: Vec<u8>) -> Self {
        Self {
            lower_bound: lower,
            upper_bound: Some(upper),
            key_types: IterKeyTypeFilter::PointsAndRanges,
            prefix_hint: None,
        }
    }

    pub fn prefix(user_key: &[u8]) -> Self {
        Self {
            lower_bound: user_key_lower_bound(user_key),
            upper_bound: Some(crate::keys::user_key_upper_bound(user_key)),
            key_types: IterKeyTypeFilter::PointsAndRanges,
            prefix_hint: Some(user_key.to_vec()),
        }
    }
}

/// An active range key fragment over `[start, end)` of user keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeKeyFragment {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub ts: Timestamp,
    pub value: Vec<u8>,
}

impl RangeKeyFragment {
    pub fn covers(&self, user_key: &[u8]) -> bool {
        user_key >= self.start.as_slice() && user_key < self.end.as_slice()
    }
}

/// Subtract unset records from set records, producing live fragments.
/// An unset cancels a set with the same suffix timestamp and a newer
/// sequence over the overlapping portion of their spans.
pub fn build_range_key_fragments(records: &[RangeKeyRecord]) -> Vec<RangeKeyFragment> {
    let mut fragments: Vec<RangeKeyFragment> = Vec::new();
    for rec in records.iter().filter(|r| !r.unset) {
        let mut pieces = vec![(rec.start.clone(), rec.end.clone())];
        for unset in records.iter().filter(|r| {
            r.unset && r.seq > rec.seq && r.ts_wall == rec.ts_wall && r.ts_logical == rec.ts_logical
        }) {
            let mut next = Vec::new();
            for (s, e) in pieces {
                if unset.start.as_slice() >= e.as_slice() || unset.end.as_slice() <= s.as_slice() {
                    next.push((s, e));
                    continue;
                }
                if s < unset.start {
                    next.push((s.clone(), unset.start.clone()));
                }
                if unset.end < e {
                    next.push((unset.end.clone(), e.clone()));
                }
            }
            pieces = next;
        }
        for (s, e) in pieces {
            fragments.push(RangeKeyFragment {
                start: s,
                end: e,
                ts: Timestamp::new(rec.ts_wall, rec.ts_logical),
                value: rec.value.clone(),
            });
        }
    }
    fragments.sort_by(|a, b| a.start.cmp(&b.start).then(b.ts.cmp(&a.ts)));
    fragments
}

/// One materialized iterator position.
#[derive(Debug, Clone)]
struct IterItem {
    encoded_key: Vec<u8>,
    user_key: Vec<u8>,
    value: Vec<u8>,
}

/// A unified point + range key iterator over a pinned view.
pub struct EngineIter {
    items: Vec<IterItem>,
    fragments: Vec<RangeKeyFragment>,
    key_types: IterKeyTypeFilter,
    pos: usize,
    started: bool,
    prev_cover: Vec<usize>,
    range_key_changed: bool,
}

impl EngineIter {
    pub fn new(view: &ReadView, opts: IterOptions) -> KestrelResult<Self> {
        // Prefix-hinted iterators skip sstables whose bloom filter rules the
        // user key out.
        let view = match &opts.prefix_hint {
            Some(user_key) => {
                let mut filtered = view.clone();
                for level in filtered.levels.iter_mut() {
                    level.retain(|h| {
                        h.file
                            .reader()
                            .map(|r| r.may_contain_user_key(user_key))
                            .unwrap_or(true)
                    });
                }
                filtered
            }
            None => view.clone(),
        };

        let mut items = Vec::new();
        if opts.key_types != IterKeyTypeFilter::RangesOnly {
            let dels = view.collect_range_dels()?;
            let points =
                view.collect_point_versions(&opts.lower_bound, opts.upper_bound.as_deref())?;
            for (encoded_key, mut versions) in points {
                versions.retain(|v| !dels.iter().any(|d| d.covers(&encoded_key, v.seq)));
                if let Some(value) = resolve_versions(&versions) {
                    let user_key = EngineKey::decode_user_key(&encoded_key).unwrap_or_default();
                    items.push(IterItem {
                        encoded_key,
                        user_key,
                        value,
                    });
                }
            }
        }

        let fragments = if opts.key_types == IterKeyTypeFilter::PointsOnly {
            Vec::new()
        } else {
            let records = view.collect_range_keys()?;
            let mut fragments = build_range_key_fragments(&records);
            // Clip fragments to the iterator bounds, in user-key space.
            if let Some(lower_user) = EngineKey::decode_user_key(&opts.lower_bound)
                .or_else(|| Some(opts.lower_bound.clone()))
            {
                fragments.retain(|f| f.end.as_slice() > lower_user.as_slice());
            }
            fragments
        };

        Ok(Self {
            items,
            fragments,
            key_types: opts.key_types,
            pos: 0,
            started: false,
            prev_cover: Vec::new(),
            range_key_changed: false,
        })
    }

    pub fn seek_first(&mut self) {
        self.pos = 0;
        self.started = true;
        self.update_cover();
    }

    pub fn next(&mut self) {
        if !self.started {
            self.seek_first();
            return;
        }
        self.pos += 1;
        self.update_cover();
    }

    pub fn valid(&self) -> bool {
        self.started && self.pos < self.items.len()
    }

    pub fn key(&self) -> &[u8] {
        &self.items[self.pos].encoded_key
    }

    pub fn user_key(&self) -> &[u8] {
        &self.items[self.pos].user_key
    }

    pub fn value(&self) -> &[u8] {
        &self.items[self.pos].value
    }

    /// True when the set of range keys covering the current position differs
    /// from the previous position.
    pub fn range_key_changed(&self) -> bool {
        self.range_key_changed
    }

    /// Range key fragments covering the current position.
    pub fn current_range_keys(&self) -> Vec<&RangeKeyFragment> {
        if !self.valid() || self.key_types == IterKeyTypeFilter::PointsOnly {
            return Vec::new();
        }
        let user_key = self.user_key();
        self.fragments.iter().filter(|f| f.covers(user_key)).collect()
    }

    /// All live range key fragments within the iterator bounds.
    pub fn range_key_fragments(&self) -> &[RangeKeyFragment] {
        &self.fragments
    }

    fn update_cover(&mut self) {
        if !self.valid() {
            self.range_key_changed = false;
            return;
        }
        let user_key = self.items[self.pos].user_key.clone();
        let cover: Vec<usize> = self
            .fragments
            .iter()
            .enumerate()
            .filter(|(_, f)| f.covers(&user_key))
            .map(|(i, _)| i)
            .collect();
        self.range_key_changed = cover != self.prev_cover;
        self.prev_cover = cover;
    }
}

// ── MVCC reads ──────────────────────────────────────────────────────────────

/// Intent metadata stored under a bare engine key.
pub fn encode_intent_meta(txn_id: TxnId) -> Vec<u8> {
    txn_id.0.to_le_bytes().to_vec()
}

pub fn decode_intent_meta(raw: &[u8]) -> Option<TxnId> {
    Some(TxnId(u64::from_le_bytes(raw.get(0..8)?.try_into().ok()?)))
}

/// Result of an MVCC scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MvccScanResult {
    /// `(user key, value bytes)` in key order.
    pub kvs: Vec<(Vec<u8>, Vec<u8>)>,
    /// Locks encountered; the caller enters conflict resolution.
    pub intents: Vec<(Vec<u8>, TxnId)>,
}

/// Scan `[lower_user, upper_user)` as of `read_ts` over the view.
pub fn mvcc_scan(
    view: &ReadView,
    lower_user: &[u8],
    upper_user: &[u8],
    read_ts: Timestamp,
) -> KestrelResult<MvccScanResult> {
    let lower = user_key_lower_bound(lower_user);
    let upper = user_key_lower_bound(upper_user);
    let dels = view.collect_range_dels()?;
    let fragments = build_range_key_fragments(&view.collect_range_keys()?);
    let points = view.collect_point_versions(&lower, Some(&upper))?;

    let mut result = MvccScanResult::default();
    let mut current_user: Option<Vec<u8>> = None;
    let mut chosen: Option<(Timestamp, MvccValue)> = None;
    let mut intent: Option<TxnId> = None;

    let mut flush_user =
        |user: &Option<Vec<u8>>,
         chosen: &mut Option<(Timestamp, MvccValue)>,
         intent: &mut Option<TxnId>,
         result: &mut MvccScanResult| {
            let Some(user_key) = user else {
                return;
            };
            if let Some(txn) = intent.take() {
                result.intents.push((user_key.clone(), txn));
                chosen.take();
                return;
            }
            if let Some((version_ts, value)) = chosen.take() {
                if value.is_tombstone {
                    return;
                }
                // An MVCC range tombstone at or below the read timestamp and
                // above the version hides it.
                let masked = fragments
                    .iter()
                    .any(|f| f.covers(user_key) && f.ts <= read_ts && f.ts > version_ts);
                if !masked {
                    result.kvs.push((user_key.clone(), value.data));
                }
            }
        };

    for (encoded_key, mut versions) in points {
        let Some(decoded) = EngineKey::decode(&encoded_key) else {
            continue;
        };
        if current_user.as_deref() != Some(decoded.user_key.as_slice()) {
            flush_user(&current_user, &mut chosen, &mut intent, &mut result);
            current_user = Some(decoded.user_key.clone());
            chosen = None;
            intent = None;
        }
        versions.retain(|v| !dels.iter().any(|d| d.covers(&encoded_key, v.seq)));
        match decoded.kind {
            KeyKind::Bare => {
                if let Some(raw) = resolve_versions(&versions) {
                    intent = decode_intent_meta(&raw);
                }
            }
            KeyKind::Mvcc { ts, .. } => {
                if ts <= read_ts && chosen.is_none() {
                    if let Some(raw) = resolve_versions(&versions) {
                        if let Some(value) = MvccValue::decode(&raw) {
                            chosen = Some((ts, value));
                        }
                    }
                }
            }
            KeyKind::Lock { .. } => {}
        }
    }
    flush_user(&current_user, &mut chosen, &mut intent, &mut result);
    Ok(result)
}

/// Point MVCC read of `user_key` as of `read_ts`.
pub fn mvcc_get(
    view: &ReadView,
    user_key: &[u8],
    read_ts: Timestamp,
) -> KestrelResult<MvccGetResult> {
    let mut upper = user_key.to_vec();
    upper.push(0);
    let scan = mvcc_scan(view, user_key, &upper, read_ts)?;
    if let Some((_, txn)) = scan.intents.into_iter().next() {
        return Ok(MvccGetResult::Intent(txn));
    }
    match scan.kvs.into_iter().next() {
        Some((_, value)) => Ok(MvccGetResult::Value(value)),
        None => Ok(MvccGetResult::NotFound),
    }
}

/// Outcome of a point MVCC read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MvccGetResult {
    Value(Vec<u8>),
    Intent(TxnId),
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::RangeKeyRecord;

    fn rk(start: &[u8], end: &[u8], wall: u64, seq: u64, unset: bool) -> RangeKeyRecord {
        RangeKeyRecord {
            start: start.to_vec(),
            end: end.to_vec(),
            ts_wall: wall,
            ts_logical: 0,
            seq,
            unset,
            value: Vec::new(),
        }
    }

    #[test]
    fn test_fragments_simple_set() {
        let frags = build_range_key_fragments(&[rk(b"a", b"m", 10, 1, false)]);
        assert_eq!(frags.len(), 1);
        assert!(frags[0].covers(b"c"));
        assert!(!frags[0].covers(b"m"));
    }

    #[test]
    fn test_fragments_unset_full_cover() {
        let frags = build_range_key_fragments(&[
            rk(b"a", b"m", 10, 1, false),
            rk(b"a", b"m", 10, 2, true),
        ]);
        assert!(frags.is_empty());
    }

    #[test]
    fn test_fragments_unset_partial_split() {
        let frags = build_range_key_fragments(&[
            rk(b"a", b"z", 10, 1, false),
            rk(b"f", b"m", 10, 2, true),
        ]);
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].start, b"a");
        assert_eq!(frags[0].end, b"f");
        assert_eq!(frags[1].start, b"m");
        assert_eq!(frags[1].end, b"z");
    }

    #[test]
    fn test_fragments_unset_different_suffix_ignored() {
        let frags = build_range_key_fragments(&[
            rk(b"a", b"z", 10, 1, false),
            rk(b"a", b"z", 11, 2, true),
        ]);
        assert_eq!(frags.len(), 1);
    }

    #[test]
    fn test_fragments_unset_older_seq_ignored() {
        let frags = build_range_key_fragments(&[
            rk(b"a", b"z", 10, 5, false),
            rk(b"a", b"z", 10, 2, true),
        ]);
        assert_eq!(frags.len(), 1);
    }

    #[test]
    fn test_intent_meta_round_trip() {
        let raw = encode_intent_meta(TxnId(42));
        assert_eq!(decode_intent_meta(&raw), Some(TxnId(42)));
        assert_eq!(decode_intent_meta(&[1, 2]), None);
    }
}
