//! The store: owner of all replicas on one engine.
//!
//! Replicas live in an arena keyed by range id; back-references go through
//! ids, never through ownership cycles: the store owns replicas and
//! replicas borrow the engine.

use std::sync::Arc;

use dashmap::DashMap;

use kestrel_common::error::{KestrelResult, RoutingError};
use kestrel_common::hlc::Clock;
use kestrel_common::settings::Settings;
use kestrel_common::types::{NodeId, RangeId, ReplicaId, StoreId};
use kestrel_raft::Consensus;
use kestrel_storage::Engine;

use crate::batch::{BatchRequest, BatchResponse};
use crate::closed_ts::SideTransport;
use crate::descriptor::{RangeDescriptor, SpanConfig};
use crate::merge::MergeOutcome;
use crate::replica::{DestroyStatus, Replica};

pub struct Store {
    pub store_id: StoreId,
    pub node_id: NodeId,
    engine: Arc<Engine>,
    consensus: Arc<dyn Consensus>,
    clock: Arc<Clock>,
    settings: Arc<Settings>,
    side_transport: Arc<SideTransport>,
    replicas: DashMap<u64, Arc<Replica>>,
    next_range_id: std::sync::atomic::AtomicU64,
}

impl Store {
    pub fn new(
        store_id: StoreId,
        node_id: NodeId,
        engine: Arc<Engine>,
        consensus: Arc<dyn Consensus>,
        clock: Arc<Clock>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store_id,
            node_id,
            engine,
            consensus,
            clock,
            settings,
            side_transport: Arc::new(SideTransport::new()),
            replicas: DashMap::new(),
            next_range_id: std::sync::atomic::AtomicU64::new(2),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn side_transport(&self) -> &Arc<SideTransport> {
        &self.side_transport
    }

    /// Create (and register) an initialized replica for a descriptor.
    pub fn create_replica(
        self: &Arc<Self>,
        mut desc: RangeDescriptor,
        span_conf: SpanConfig,
    ) -> Arc<Replica> {
        let rd = desc.add_replica(self.node_id);
        let replica = Replica::new(
            desc,
            rd.replica_id,
            span_conf,
            self.engine.clone(),
            self.consensus.clone(),
            self.clock.clone(),
            self.settings.clone(),
            self.side_transport.clone(),
        );
        self.replicas.insert(replica.range_id.0, replica.clone());
        replica
    }

    pub fn get_replica(&self, range_id: RangeId) -> Option<Arc<Replica>> {
        self.replicas.get(&range_id.0).map(|r| r.clone())
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn visit_replicas(&self, mut f: impl FnMut(&Arc<Replica>)) {
        for r in self.replicas.iter() {
            f(&r);
        }
    }

    /// Route a batch to its replica.
    pub async fn send(&self, batch: BatchRequest) -> KestrelResult<BatchResponse> {
        let Some(replica) = self.get_replica(batch.range_id) else {
            return Err(RoutingError::RangeNotFound(batch.range_id).into());
        };
        replica.send(batch).await
    }

    /// Split a range at `split_key`. The left-hand side keeps its range id
    /// and start key; the right-hand side gets a fresh range id. Both
    /// generations bump.
    pub fn split_range(
        self: &Arc<Self>,
        range_id: RangeId,
        split_key: Vec<u8>,
    ) -> KestrelResult<(Arc<Replica>, Arc<Replica>)> {
        let Some(lhs) = self.get_replica(range_id) else {
            return Err(RoutingError::RangeNotFound(range_id).into());
        };
        let (mut lhs_desc, span_conf) = lhs.desc_and_span_config();
        if !lhs_desc.span().contains_key(&split_key) {
            return Err(RoutingError::RangeKeyMismatch {
                range_id,
                generation: lhs_desc.generation,
            }
            .into());
        }

        let rhs_id = RangeId(
            self.next_range_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        let rhs_desc = RangeDescriptor {
            range_id: rhs_id,
            start_key: split_key.clone(),
            end_key: lhs_desc.end_key.clone(),
            generation: lhs_desc.generation + 1,
            replicas: Vec::new(),
            next_replica_id: ReplicaId(1),
        };

        lhs_desc.end_key = split_key;
        lhs_desc.generation += 1;
        lhs.set_descriptor(lhs_desc);

        let rhs = self.create_replica(rhs_desc, span_conf);
        Ok((lhs, rhs))
    }

    /// Merge `rhs` back into `lhs` (they must be adjacent, lhs left of
    /// rhs). The right-hand replica is subsumed and destroyed.
    pub fn merge_ranges(
        self: &Arc<Self>,
        lhs_id: RangeId,
        rhs_id: RangeId,
    ) -> KestrelResult<Arc<Replica>> {
        let Some(lhs) = self.get_replica(lhs_id) else {
            return Err(RoutingError::RangeNotFound(lhs_id).into());
        };
        let Some(rhs) = self.get_replica(rhs_id) else {
            return Err(RoutingError::RangeNotFound(rhs_id).into());
        };
        let mut lhs_desc = lhs.desc();
        let rhs_desc = rhs.desc();
        if lhs_desc.end_key != rhs_desc.start_key {
            return Err(RoutingError::RangeKeyMismatch {
                range_id: rhs_id,
                generation: rhs_desc.generation,
            }
            .into());
        }

        rhs.finish_merge(MergeOutcome::Committed);
        lhs_desc.end_key = rhs_desc.end_key;
        lhs_desc.generation = lhs_desc.generation.max(rhs_desc.generation) + 1;
        lhs.set_descriptor(lhs_desc);

        self.remove_replica(rhs_id);
        Ok(lhs)
    }

    /// Destroy and unregister a replica.
    pub fn remove_replica(&self, range_id: RangeId) {
        if let Some((_, replica)) = self.replicas.remove(&range_id.0) {
            replica.set_destroy_status(DestroyStatus::Removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::hlc::ManualClock;
    use kestrel_raft::LocalConsensus;
    use kestrel_storage::EngineConfig;
    use tempfile::TempDir;

    fn make_store(dir: &TempDir) -> (Arc<Store>, Arc<LocalConsensus>) {
        let settings = Settings::new();
        let mut cfg = EngineConfig::for_testing();
        cfg.settings = settings.clone();
        let engine = Arc::new(Engine::open(dir.path(), cfg).unwrap());
        let consensus = LocalConsensus::new();
        let clock = Arc::new(Clock::new(ManualClock::new(1_000_000_000)));
        let store = Store::new(
            StoreId(1),
            NodeId(1),
            engine,
            consensus.clone(),
            clock,
            settings,
        );
        (store, consensus)
    }

    fn desc(range_id: u64, start: &[u8], end: &[u8]) -> RangeDescriptor {
        RangeDescriptor::new(RangeId(range_id), start.to_vec(), end.to_vec())
    }

    #[test]
    fn test_create_and_lookup_replica() {
        let dir = TempDir::new().unwrap();
        let (store, _) = make_store(&dir);
        let replica = store.create_replica(desc(1, b"a", b"z"), SpanConfig::default());
        assert_eq!(store.replica_count(), 1);
        assert_eq!(
            store.get_replica(RangeId(1)).unwrap().range_id,
            replica.range_id
        );
        assert!(store.get_replica(RangeId(9)).is_none());
    }

    #[test]
    fn test_split_creates_adjacent_ranges() {
        let dir = TempDir::new().unwrap();
        let (store, _) = make_store(&dir);
        store.create_replica(desc(1, b"a", b"z"), SpanConfig::default());
        let (lhs, rhs) = store.split_range(RangeId(1), b"m".to_vec()).unwrap();

        let lhs_desc = lhs.desc();
        let rhs_desc = rhs.desc();
        assert_eq!(lhs_desc.start_key, b"a".to_vec());
        assert_eq!(lhs_desc.end_key, b"m".to_vec());
        assert_eq!(rhs_desc.start_key, b"m".to_vec());
        assert_eq!(rhs_desc.end_key, b"z".to_vec());
        assert_ne!(lhs_desc.range_id, rhs_desc.range_id);
        assert_eq!(store.replica_count(), 2);
        // The split bumped the left generation.
        assert!(lhs_desc.generation > 1);
    }

    #[test]
    fn test_split_outside_bounds_rejected() {
        let dir = TempDir::new().unwrap();
        let (store, _) = make_store(&dir);
        store.create_replica(desc(1, b"a", b"m"), SpanConfig::default());
        let err = store.split_range(RangeId(1), b"q".to_vec()).unwrap_err();
        assert!(matches!(
            err,
            kestrel_common::error::KestrelError::Routing(RoutingError::RangeKeyMismatch { .. })
        ));
    }

    #[test]
    fn test_merge_subsumes_rhs() {
        let dir = TempDir::new().unwrap();
        let (store, _) = make_store(&dir);
        store.create_replica(desc(1, b"a", b"z"), SpanConfig::default());
        let (_lhs, rhs) = store.split_range(RangeId(1), b"m".to_vec()).unwrap();
        let rhs_id = rhs.desc().range_id;

        let merged = store.merge_ranges(RangeId(1), rhs_id).unwrap();
        assert_eq!(merged.desc().end_key, b"z".to_vec());
        assert_eq!(store.replica_count(), 1);
        assert_eq!(rhs.destroy_status(), DestroyStatus::Removed);
    }

    #[test]
    fn test_merge_non_adjacent_rejected() {
        let dir = TempDir::new().unwrap();
        let (store, _) = make_store(&dir);
        store.create_replica(desc(1, b"a", b"f"), SpanConfig::default());
        store.create_replica(desc(10, b"m", b"z"), SpanConfig::default());
        assert!(store.merge_ranges(RangeId(1), RangeId(10)).is_err());
    }

    #[tokio::test]
    async fn test_send_routes_to_replica() {
        let dir = TempDir::new().unwrap();
        let (store, _) = make_store(&dir);
        store.create_replica(desc(1, b"a", b"z"), SpanConfig::default());
        let err = store
            .send(BatchRequest::reads(
                RangeId(42),
                kestrel_common::types::Timestamp::from_wall(1),
                vec![],
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            kestrel_common::error::KestrelError::Routing(RoutingError::RangeNotFound(_))
        ));
    }
}
