//! Engine key encoding.
//!
//! An engine key is a user key plus an optional version suffix, packed into
//! a single byte string whose plain lexicographic order equals the semantic
//! order `(key asc, version desc)`:
//!
//! ```text
//!   [escaped user key] [0x00 0x01 sentinel] [suffix bytes] [suffix-len byte]
//! ```
//!
//! The user key is escaped order-preservingly (each `0x00` becomes
//! `0x00 0xFF`) so the two-byte sentinel unambiguously terminates it for any
//! binary key. The trailing suffix-len byte counts the sentinel plus the
//! suffix, so the decoder can strip the suffix without scanning. Distinct
//! suffix lengths distinguish key kinds:
//!
//!   2  - bare key (no version; intent/metadata position)
//!   14 - MVCC version: inverted wall (8) + inverted logical (4)
//!   15 - MVCC version with a trailing synthetic marker byte
//!   18 - lock-table key: txn id (8) + strength (1) + reserved (7)
//!
//! Version components are stored bitwise-inverted big-endian so that newer
//! versions sort before older ones under byte comparison.

use kestrel_common::types::{Timestamp, TxnId};

/// Escape byte within user keys.
const ESCAPE: u8 = 0x00;
/// Escaped form of a literal 0x00 inside a user key.
const ESCAPED_00: u8 = 0xFF;
/// Second sentinel byte, terminating the escaped user key.
const TERMINATOR: u8 = 0x01;

const SUFFIX_LEN_BARE: u8 = 2;
const SUFFIX_LEN_MVCC: u8 = 14;
const SUFFIX_LEN_MVCC_SYNTHETIC: u8 = 15;
const SUFFIX_LEN_LOCK: u8 = 18;

/// Synthetic marker byte appended to synthetic MVCC versions.
const SYNTHETIC_MARKER: u8 = 0x01;

/// Lock strength recorded in lock-table keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockStrength {
    Shared = 1,
    Exclusive = 2,
    Intent = 3,
}

impl LockStrength {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(LockStrength::Shared),
            2 => Some(LockStrength::Exclusive),
            3 => Some(LockStrength::Intent),
            _ => None,
        }
    }
}

/// Discriminates the kinds of engine keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    /// A bare key with no version. Sorts before all versions of the same key.
    Bare,
    /// An MVCC version.
    Mvcc { ts: Timestamp, synthetic: bool },
    /// A lock-table record.
    Lock { txn_id: TxnId, strength: LockStrength },
}

/// A decoded engine key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineKey {
    pub user_key: Vec<u8>,
    pub kind: KeyKind,
}

fn escape_into(user_key: &[u8], buf: &mut Vec<u8>) {
    for &b in user_key {
        buf.push(b);
        if b == ESCAPE {
            buf.push(ESCAPED_00);
        }
    }
    buf.push(ESCAPE);
    buf.push(TERMINATOR);
}

fn unescape(escaped: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut i = 0;
    while i < escaped.len() {
        let b = escaped[i];
        if b == ESCAPE {
            if i + 1 >= escaped.len() || escaped[i + 1] != ESCAPED_00 {
                return None;
            }
            out.push(ESCAPE);
            i += 2;
        } else {
            out.push(b);
            i += 1;
        }
    }
    Some(out)
}

impl EngineKey {
    pub fn bare(user_key: impl Into<Vec<u8>>) -> Self {
        Self {
            user_key: user_key.into(),
            kind: KeyKind::Bare,
        }
    }

    pub fn mvcc(user_key: impl Into<Vec<u8>>, ts: Timestamp) -> Self {
        Self {
            user_key: user_key.into(),
            kind: KeyKind::Mvcc {
                ts,
                synthetic: false,
            },
        }
    }

    pub fn mvcc_synthetic(user_key: impl Into<Vec<u8>>, ts: Timestamp) -> Self {
        Self {
            user_key: user_key.into(),
            kind: KeyKind::Mvcc {
                ts,
                synthetic: true,
            },
        }
    }

    pub fn lock(user_key: impl Into<Vec<u8>>, txn_id: TxnId, strength: LockStrength) -> Self {
        Self {
            user_key: user_key.into(),
            kind: KeyKind::Lock { txn_id, strength },
        }
    }

    /// Encode into the byte form whose lexicographic order matches the
    /// semantic order.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.user_key.len() + 20);
        escape_into(&self.user_key, &mut buf);
        match &self.kind {
            KeyKind::Bare => {
                buf.push(SUFFIX_LEN_BARE);
            }
            KeyKind::Mvcc { ts, synthetic } => {
                buf.extend_from_slice(&(!ts.wall).to_be_bytes());
                buf.extend_from_slice(&(!ts.logical).to_be_bytes());
                if *synthetic {
                    buf.push(SYNTHETIC_MARKER);
                    buf.push(SUFFIX_LEN_MVCC_SYNTHETIC);
                } else {
                    buf.push(SUFFIX_LEN_MVCC);
                }
            }
            KeyKind::Lock { txn_id, strength } => {
                buf.extend_from_slice(&txn_id.0.to_be_bytes());
                buf.push(*strength as u8);
                buf.extend_from_slice(&[0u8; 7]);
                buf.push(SUFFIX_LEN_LOCK);
            }
        }
        buf
    }

    /// Split an encoded key into (escaped user key, suffix bytes). The
    /// suffix excludes the sentinel and the trailing length byte.
    fn split(encoded: &[u8]) -> Option<(&[u8], &[u8])> {
        let total = encoded.len();
        if total < 3 {
            return None;
        }
        let suffix_len = encoded[total - 1] as usize;
        // suffix_len counts the two sentinel bytes plus the suffix.
        if suffix_len < 2 || total < suffix_len + 1 {
            return None;
        }
        let key_end = total - 1 - (suffix_len - 2);
        let sentinel_at = key_end - 2;
        if encoded[sentinel_at] != ESCAPE || encoded[sentinel_at + 1] != TERMINATOR {
            return None;
        }
        Some((&encoded[..sentinel_at], &encoded[key_end..total - 1]))
    }

    /// Decode an encoded engine key. Returns `None` on malformed input.
    pub fn decode(encoded: &[u8]) -> Option<Self> {
        let (escaped, suffix) = Self::split(encoded)?;
        let user_key = unescape(escaped)?;
        let suffix_len = *encoded.last()?;

        let kind = match suffix_len {
            SUFFIX_LEN_BARE => KeyKind::Bare,
            SUFFIX_LEN_MVCC => {
                let wall = !u64::from_be_bytes(suffix.get(0..8)?.try_into().ok()?);
                let logical = !u32::from_be_bytes(suffix.get(8..12)?.try_into().ok()?);
                KeyKind::Mvcc {
                    ts: Timestamp::new(wall, logical),
                    synthetic: false,
                }
            }
            SUFFIX_LEN_MVCC_SYNTHETIC => {
                let wall = !u64::from_be_bytes(suffix.get(0..8)?.try_into().ok()?);
                let logical = !u32::from_be_bytes(suffix.get(8..12)?.try_into().ok()?);
                if *suffix.get(12)? != SYNTHETIC_MARKER {
                    return None;
                }
                KeyKind::Mvcc {
                    ts: Timestamp::new(wall, logical),
                    synthetic: true,
                }
            }
            SUFFIX_LEN_LOCK => {
                let txn_id = TxnId(u64::from_be_bytes(suffix.get(0..8)?.try_into().ok()?));
                let strength = LockStrength::from_byte(*suffix.get(8)?)?;
                KeyKind::Lock { txn_id, strength }
            }
            _ => return None,
        };
        Some(Self { user_key, kind })
    }

    /// Whether the encoded key is a lock-table record. Cheap: inspects only
    /// the trailing suffix-len byte.
    pub fn encoded_is_lock(encoded: &[u8]) -> bool {
        encoded.last() == Some(&SUFFIX_LEN_LOCK)
    }

    /// The user key portion of an encoded engine key, without kind decode.
    pub fn decode_user_key(encoded: &[u8]) -> Option<Vec<u8>> {
        let (escaped, _) = Self::split(encoded)?;
        unescape(escaped)
    }

    /// The MVCC timestamp of an encoded key, if it is an MVCC key.
    pub fn decode_mvcc_timestamp(encoded: &[u8]) -> Option<Timestamp> {
        match Self::decode(encoded)?.kind {
            KeyKind::Mvcc { ts, .. } => Some(ts),
            _ => None,
        }
    }
}

/// Inclusive lower bound over every encoded form of `user_key`.
pub fn user_key_lower_bound(user_key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + 2);
    escape_into(user_key, &mut buf);
    // Strip the terminator: [escaped key] 0x00 is a prefix of every encoded
    // form and sorts at or below all of them.
    buf.pop();
    buf
}

/// Exclusive upper bound over every encoded form of `user_key`: larger than
/// any suffix of `user_key` and no larger than any strictly greater user
/// key's encodings.
pub fn user_key_upper_bound(user_key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + 2);
    escape_into(user_key, &mut buf);
    // Bump the terminator: [escaped key] 0x00 0x02 sorts above every
    // `[escaped key] 0x00 0x01 …` encoding, and below the next user key's
    // escaped form (whose next byte after the shared prefix is ≥ 0x02 or
    // 0x00 0xFF).
    let last = buf.len() - 1;
    buf[last] = TERMINATOR + 1;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: u64, logical: u32) -> Timestamp {
        Timestamp::new(wall, logical)
    }

    #[test]
    fn test_round_trip_bare() {
        let k = EngineKey::bare(b"table/1/row".to_vec());
        assert_eq!(EngineKey::decode(&k.encode()), Some(k));
    }

    #[test]
    fn test_round_trip_mvcc() {
        let k = EngineKey::mvcc(b"a".to_vec(), ts(1_700_000_000_000, 7));
        assert_eq!(EngineKey::decode(&k.encode()), Some(k));
    }

    #[test]
    fn test_round_trip_key_with_nul_bytes() {
        let k = EngineKey::mvcc(b"a\x00b\x00\x00c".to_vec(), ts(33, 1));
        assert_eq!(EngineKey::decode(&k.encode()), Some(k));
    }

    #[test]
    fn test_round_trip_mvcc_synthetic() {
        let k = EngineKey::mvcc_synthetic(b"a".to_vec(), ts(42, 0));
        let decoded = EngineKey::decode(&k.encode()).unwrap();
        assert_eq!(decoded, k);
        match decoded.kind {
            KeyKind::Mvcc { synthetic, .. } => assert!(synthetic),
            other => panic!("expected Mvcc, got {other:?}"),
        }
    }

    #[test]
    fn test_round_trip_lock() {
        let k = EngineKey::lock(b"a".to_vec(), TxnId(99), LockStrength::Intent);
        assert_eq!(EngineKey::decode(&k.encode()), Some(k));
    }

    #[test]
    fn test_versions_sort_descending() {
        let old = EngineKey::mvcc(b"k".to_vec(), ts(10, 0)).encode();
        let new = EngineKey::mvcc(b"k".to_vec(), ts(20, 0)).encode();
        let newer_logical = EngineKey::mvcc(b"k".to_vec(), ts(20, 5)).encode();
        assert!(new < old, "newer version must sort first");
        assert!(newer_logical < new);
    }

    #[test]
    fn test_keys_sort_ascending_across_users() {
        let a_new = EngineKey::mvcc(b"a".to_vec(), ts(100, 0)).encode();
        let a_old = EngineKey::mvcc(b"a".to_vec(), ts(1, 0)).encode();
        let b_any = EngineKey::mvcc(b"b".to_vec(), ts(50, 0)).encode();
        assert!(a_new < a_old);
        assert!(a_old < b_any);
    }

    #[test]
    fn test_nul_extension_sorts_after_base_key() {
        // "k" < "k\x00" < "k\x01" must hold for every version combination.
        let base = EngineKey::mvcc(b"k".to_vec(), ts(1, 0)).encode();
        let nul_ext = EngineKey::mvcc(b"k\x00".to_vec(), ts(1 << 50, 9)).encode();
        let one_ext = EngineKey::mvcc(b"k\x01".to_vec(), ts(3, 0)).encode();
        assert!(base < nul_ext);
        assert!(nul_ext < one_ext);
    }

    #[test]
    fn test_bare_sorts_before_versions() {
        let bare = EngineKey::bare(b"k".to_vec()).encode();
        let versioned = EngineKey::mvcc(b"k".to_vec(), ts(1_000_000, 0)).encode();
        assert!(bare < versioned);
    }

    #[test]
    fn test_encoded_comparator_equals_semantic() {
        // Semantic order: (key asc, ts desc). Enumerate a grid and check the
        // encoded order matches.
        let mut semantic: Vec<(Vec<u8>, Timestamp)> = Vec::new();
        for key in [b"aa".to_vec(), b"ab".to_vec(), b"b".to_vec()] {
            for t in [ts(30, 2), ts(30, 0), ts(7, 9), ts(1, 0)] {
                semantic.push((key.clone(), t));
            }
        }
        let mut encoded: Vec<Vec<u8>> = semantic
            .iter()
            .map(|(k, t)| EngineKey::mvcc(k.clone(), *t).encode())
            .collect();
        encoded.sort();
        let decoded: Vec<(Vec<u8>, Timestamp)> = encoded
            .iter()
            .map(|e| {
                let d = EngineKey::decode(e).unwrap();
                match d.kind {
                    KeyKind::Mvcc { ts, .. } => (d.user_key, ts),
                    other => panic!("unexpected kind {other:?}"),
                }
            })
            .collect();
        assert_eq!(decoded, semantic);
    }

    #[test]
    fn test_lock_detection_without_decode() {
        let lock = EngineKey::lock(b"k".to_vec(), TxnId(1), LockStrength::Exclusive).encode();
        let mvcc = EngineKey::mvcc(b"k".to_vec(), ts(5, 0)).encode();
        assert!(EngineKey::encoded_is_lock(&lock));
        assert!(!EngineKey::encoded_is_lock(&mvcc));
    }

    #[test]
    fn test_decode_user_key_fast_path() {
        let k = EngineKey::mvcc(b"hello".to_vec(), ts(9, 9)).encode();
        assert_eq!(EngineKey::decode_user_key(&k), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(EngineKey::decode(&[]).is_none());
        assert!(EngineKey::decode(&[0x01]).is_none());
        // Wrong sentinel bytes.
        let mut k = EngineKey::mvcc(b"xy".to_vec(), ts(5, 0)).encode();
        k[2] = 0x07;
        assert!(EngineKey::decode(&k).is_none());
        // Unknown suffix length.
        let mut k2 = EngineKey::bare(b"k".to_vec()).encode();
        *k2.last_mut().unwrap() = 99;
        assert!(EngineKey::decode(&k2).is_none());
    }

    #[test]
    fn test_randomized_keys_round_trip_and_order() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut semantic: Vec<(Vec<u8>, Timestamp)> = Vec::new();
        for _ in 0..500 {
            // Arbitrary binary keys, biased toward 0x00 and 0xFF to stress
            // the escape scheme.
            let len = rng.gen_range(1..=12);
            let key: Vec<u8> = (0..len)
                .map(|_| match rng.gen_range(0..4u8) {
                    0 => 0x00,
                    1 => 0xFF,
                    _ => rng.gen(),
                })
                .collect();
            let t = ts(rng.gen_range(0..1u64 << 48), rng.gen_range(0..1u32 << 16));
            semantic.push((key, t));
        }
        semantic.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        semantic.dedup();

        let mut encoded: Vec<Vec<u8>> = semantic
            .iter()
            .map(|(k, t)| EngineKey::mvcc(k.clone(), *t).encode())
            .collect();
        encoded.sort();
        for (e, (key, t)) in encoded.iter().zip(&semantic) {
            let decoded = EngineKey::decode(e).expect("random key must decode");
            assert_eq!(&decoded.user_key, key);
            match decoded.kind {
                KeyKind::Mvcc { ts, .. } => assert_eq!(ts, *t),
                other => panic!("unexpected kind {other:?}"),
            }
        }
    }

    #[test]
    fn test_user_key_bounds_cover_all_versions() {
        for user_key in [b"k".to_vec(), b"k\x00".to_vec(), b"".to_vec()] {
            let lower = user_key_lower_bound(&user_key);
            let upper = user_key_upper_bound(&user_key);
            for t in [ts(0, 1), ts(5, 0), ts(1 << 40, 3)] {
                let e = EngineKey::mvcc(user_key.clone(), t).encode();
                assert!(e >= lower && e < upper, "version {t} outside bounds");
            }
            let bare = EngineKey::bare(user_key.clone()).encode();
            assert!(bare >= lower && bare < upper);
        }
        // Bounds of adjacent keys do not overlap.
        assert!(user_key_upper_bound(b"k") <= user_key_lower_bound(b"k\x00"));
    }
}
