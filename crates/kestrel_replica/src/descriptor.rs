//! Range descriptors and span configuration.

use serde::{Deserialize, Serialize};

use kestrel_common::types::{NodeId, RangeId, ReplicaId, Span};

/// One member of a range's replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub replica_id: ReplicaId,
}

/// Addressing and membership state of a range. The start key is immutable
/// over the range's lifetime; the end key moves on splits and merges, each
/// of which bumps the generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Vec<u8>,
    /// Right-exclusive.
    pub end_key: Vec<u8>,
    pub generation: u64,
    pub replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: ReplicaId,
}

impl RangeDescriptor {
    pub fn new(range_id: RangeId, start_key: Vec<u8>, end_key: Vec<u8>) -> Self {
        Self {
            range_id,
            start_key,
            end_key,
            generation: 1,
            replicas: Vec::new(),
            next_replica_id: ReplicaId(1),
        }
    }

    pub fn span(&self) -> Span {
        Span::new(self.start_key.clone(), self.end_key.clone())
    }

    pub fn contains_span(&self, span: &Span) -> bool {
        self.span().contains_span(span)
    }

    pub fn add_replica(&mut self, node_id: NodeId) -> ReplicaDescriptor {
        let rd = ReplicaDescriptor {
            node_id,
            replica_id: self.next_replica_id,
        };
        self.next_replica_id = ReplicaId(self.next_replica_id.0 + 1);
        self.replicas.push(rd);
        self.generation += 1;
        rd
    }

    pub fn remove_replica(&mut self, replica_id: ReplicaId) -> bool {
        let before = self.replicas.len();
        self.replicas.retain(|r| r.replica_id != replica_id);
        if self.replicas.len() != before {
            self.generation += 1;
            true
        } else {
            false
        }
    }

    pub fn contains_replica(&self, replica_id: ReplicaId) -> bool {
        self.replicas.iter().any(|r| r.replica_id == replica_id)
    }
}

/// Per-range configuration applied asynchronously by the span-config
/// subscriber; may lag the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanConfig {
    pub range_max_bytes: u64,
    pub range_min_bytes: u64,
    pub gc_ttl_seconds: u64,
    pub num_replicas: u32,
    pub constraints: Vec<String>,
    pub rangefeed_enabled: bool,
    pub exclude_from_backup: bool,
    pub global_reads: bool,
}

impl Default for SpanConfig {
    fn default() -> Self {
        Self {
            range_max_bytes: 512 * 1024 * 1024,
            range_min_bytes: 128 * 1024 * 1024,
            gc_ttl_seconds: 4 * 3600,
            num_replicas: 3,
            constraints: Vec::new(),
            rangefeed_enabled: false,
            exclude_from_backup: false,
            global_reads: false,
        }
    }
}

impl SpanConfig {
    /// Whether switching to `next` should requeue the range in the
    /// replicate/split/merge/gc queues.
    pub fn is_significant_change(&self, next: &SpanConfig) -> bool {
        self.range_max_bytes != next.range_max_bytes
            || self.range_min_bytes != next.range_min_bytes
            || self.gc_ttl_seconds != next.gc_ttl_seconds
            || self.num_replicas != next.num_replicas
            || self.constraints != next.constraints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_span_containment() {
        let desc = RangeDescriptor::new(RangeId(1), b"c".to_vec(), b"p".to_vec());
        assert!(desc.contains_span(&Span::new(b"d".to_vec(), b"m".to_vec())));
        assert!(desc.contains_span(&Span::point(b"c".to_vec())));
        assert!(!desc.contains_span(&Span::new(b"a".to_vec(), b"d".to_vec())));
        assert!(!desc.contains_span(&Span::point(b"p".to_vec())));
    }

    #[test]
    fn test_membership_bumps_generation() {
        let mut desc = RangeDescriptor::new(RangeId(1), b"a".to_vec(), b"z".to_vec());
        let g0 = desc.generation;
        let rd = desc.add_replica(NodeId(1));
        assert_eq!(rd.replica_id, ReplicaId(1));
        assert!(desc.generation > g0);
        assert!(desc.contains_replica(ReplicaId(1)));

        let g1 = desc.generation;
        assert!(desc.remove_replica(ReplicaId(1)));
        assert!(desc.generation > g1);
        assert!(!desc.remove_replica(ReplicaId(1)));
    }

    #[test]
    fn test_replica_ids_never_reused() {
        let mut desc = RangeDescriptor::new(RangeId(1), b"a".to_vec(), b"z".to_vec());
        let r1 = desc.add_replica(NodeId(1));
        desc.remove_replica(r1.replica_id);
        let r2 = desc.add_replica(NodeId(2));
        assert!(r2.replica_id.0 > r1.replica_id.0);
    }

    #[test]
    fn test_span_config_significance() {
        let a = SpanConfig::default();
        let mut b = a.clone();
        assert!(!a.is_significant_change(&b));
        b.rangefeed_enabled = true;
        assert!(!a.is_significant_change(&b), "rangefeed flag is not significant");
        b.num_replicas = 5;
        assert!(a.is_significant_change(&b));
        let mut c = a.clone();
        c.gc_ttl_seconds = 60;
        assert!(a.is_significant_change(&c));
    }
}
