//! Bloom filter for sstable negative-lookup elimination.
//!
//! Every sstable carries a filter over the user keys it contains. Point
//! lookups consult the filter first and skip the file on a definite miss.
//! Iterators created with a prefix hint use the same filter per table.

use std::hash::Hasher;

/// Double-hashed bloom filter (Kirsch–Mitzenmacher scheme).
#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: usize,
    num_probes: u32,
}

impl BloomFilter {
    /// Size the filter for `expected_keys` at the given false-positive rate.
    pub fn new(expected_keys: usize, fp_rate: f64) -> Self {
        let n = expected_keys.max(1);
        let p = fp_rate.clamp(1e-10, 1.0);

        // m = -n ln(p) / (ln 2)^2, k = (m/n) ln 2
        let num_bits = ((-(n as f64) * p.ln()) / (2.0_f64.ln().powi(2))).ceil() as usize;
        let num_bits = num_bits.max(64);
        let num_probes = ((num_bits as f64 / n as f64) * 2.0_f64.ln()).ceil() as u32;
        let num_probes = num_probes.clamp(1, 30);

        Self {
            words: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_probes,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_probes {
            let idx = self.probe_index(h1, h2, i);
            self.words[idx / 64] |= 1u64 << (idx % 64);
        }
    }

    /// Returns `false` only when the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_probes {
            let idx = self.probe_index(h1, h2, i);
            if self.words[idx / 64] & (1u64 << (idx % 64)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.words.len() * 8);
        buf.extend_from_slice(&(self.num_bits as u32).to_le_bytes());
        buf.extend_from_slice(&self.num_probes.to_le_bytes());
        buf.extend_from_slice(&(self.words.len() as u32).to_le_bytes());
        for w in &self.words {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        let num_bits = u32::from_le_bytes(data[0..4].try_into().ok()?) as usize;
        let num_probes = u32::from_le_bytes(data[4..8].try_into().ok()?);
        let word_count = u32::from_le_bytes(data[8..12].try_into().ok()?) as usize;
        if data.len() < 12 + word_count * 8 {
            return None;
        }
        let mut words = Vec::with_capacity(word_count);
        for i in 0..word_count {
            let off = 12 + i * 8;
            words.push(u64::from_le_bytes(data[off..off + 8].try_into().ok()?));
        }
        Some(Self {
            words,
            num_bits,
            num_probes,
        })
    }

    fn probe_index(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    let mut a = Fnv1a::new(0xcbf29ce484222325);
    a.write(key);
    let mut b = Fnv1a::new(0x517cc1b727220a95);
    b.write(key);
    (a.finish(), b.finish())
}

struct Fnv1a {
    state: u64,
}

impl Fnv1a {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl Hasher for Fnv1a {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state ^= b as u64;
            self.state = self.state.wrapping_mul(0x100000001b3);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_keys_found() {
        let mut bf = BloomFilter::new(1000, 0.01);
        bf.insert(b"alpha");
        bf.insert(b"beta");
        assert!(bf.may_contain(b"alpha"));
        assert!(bf.may_contain(b"beta"));
    }

    #[test]
    fn test_empty_filter_rejects() {
        let bf = BloomFilter::new(100, 0.01);
        assert!(!bf.may_contain(b"anything"));
    }

    #[test]
    fn test_false_positive_rate_bounded() {
        let n = 10_000u64;
        let mut bf = BloomFilter::new(n as usize, 0.01);
        for i in 0..n {
            bf.insert(&i.to_le_bytes());
        }
        for i in 0..n {
            assert!(bf.may_contain(&i.to_le_bytes()));
        }
        let mut false_positives = 0;
        for i in n..2 * n {
            if bf.may_contain(&i.to_le_bytes()) {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / n as f64;
        assert!(rate < 0.03, "false-positive rate too high: {rate:.4}");
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut bf = BloomFilter::new(64, 0.01);
        bf.insert(b"k1");
        bf.insert(b"k2");
        let restored = BloomFilter::from_bytes(&bf.to_bytes()).unwrap();
        assert!(restored.may_contain(b"k1"));
        assert!(restored.may_contain(b"k2"));
        assert_eq!(restored.num_bits, bf.num_bits);
        assert_eq!(restored.num_probes, bf.num_probes);
    }

    #[test]
    fn test_from_bytes_rejects_truncated() {
        let bf = BloomFilter::new(64, 0.01);
        let mut bytes = bf.to_bytes();
        bytes.truncate(10);
        assert!(BloomFilter::from_bytes(&bytes).is_none());
    }
}
