//! End-to-end replica scenarios: writes under lease, MVCC reads, stale
//! max-lease-index reproposal, and the merge gate.

use std::sync::Arc;
use std::time::Duration;

use kestrel_common::error::{GateError, KestrelError, RoutingError};
use kestrel_common::hlc::{Clock, ManualClock};
use kestrel_common::settings::Settings;
use kestrel_common::types::{NodeId, RangeId, ReplicaId, StoreId, Timestamp};
use kestrel_raft::LocalConsensus;
use kestrel_replica::batch::{BatchRequest, Request, ResponseValue};
use kestrel_replica::descriptor::{RangeDescriptor, SpanConfig};
use kestrel_replica::merge::MergeOutcome;
use kestrel_replica::proposal::ReplicatedWrite;
use kestrel_replica::replica::Replica;
use kestrel_replica::store::Store;
use kestrel_storage::{Engine, EngineConfig};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    store: Arc<Store>,
    consensus: Arc<LocalConsensus>,
    clock: ManualClock,
}

const SECOND: u64 = 1_000_000_000;

fn ts(wall: u64) -> Timestamp {
    Timestamp::from_wall(wall)
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = TempDir::new().unwrap();
        let settings = Settings::new();
        let mut cfg = EngineConfig::for_testing();
        cfg.settings = settings.clone();
        let engine = Arc::new(Engine::open(dir.path(), cfg).unwrap());
        let consensus = LocalConsensus::new();
        let manual = ManualClock::new(1_000 * SECOND);
        let clock = Arc::new(Clock::new(manual.clone()));
        let store = Store::new(
            StoreId(1),
            NodeId(1),
            engine,
            consensus.clone(),
            clock,
            settings,
        );
        Self {
            _dir: dir,
            store,
            consensus,
            clock: manual,
        }
    }

    async fn leased_replica(&self, start: &[u8], end: &[u8]) -> Arc<Replica> {
        let desc = RangeDescriptor::new(RangeId(1), start.to_vec(), end.to_vec());
        let replica = self
            .store
            .create_replica(desc, SpanConfig::default());
        replica.install_apply_hook(&self.consensus);

        let lease_batch = BatchRequest::reads(
            RangeId(1),
            ts(1_000 * SECOND),
            vec![Request::RequestLease {
                holder: replica.replica_id,
            }],
        );
        replica.send(lease_batch).await.unwrap();
        assert!(replica.lease().is_some());
        replica
    }
}

fn put(key: &[u8], value: &[u8]) -> Request {
    Request::Put {
        key: key.to_vec(),
        value: value.to_vec(),
    }
}

fn scan(start: &[u8], end: &[u8]) -> Request {
    Request::Scan {
        start: start.to_vec(),
        end: end.to_vec(),
    }
}

fn write_batch(ts_wall: u64, requests: Vec<Request>) -> BatchRequest {
    BatchRequest {
        range_id: RangeId(1),
        ts: ts(ts_wall),
        txn: None,
        consistency: kestrel_replica::batch::ReadConsistency::Consistent,
        admin: false,
        requests,
    }
}

fn scan_kvs(resp: &kestrel_replica::batch::BatchResponse) -> Vec<(Vec<u8>, Vec<u8>)> {
    match &resp.responses[0] {
        ResponseValue::Scan { kvs } => kvs.clone(),
        other => panic!("expected scan response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_write_then_read_under_lease() {
    let h = Harness::new();
    let replica = h.leased_replica(b"a", b"z").await;

    replica
        .send(write_batch(1_010 * SECOND, vec![put(b"a", b"1")]))
        .await
        .unwrap();

    h.clock.advance(20 * SECOND);
    let resp = replica
        .send(write_batch(1_015 * SECOND, vec![scan(b"a", b"b")]))
        .await
        .unwrap();
    assert_eq!(scan_kvs(&resp), vec![(b"a".to_vec(), b"1".to_vec())]);
}

#[tokio::test]
async fn test_shadowed_version_reads() {
    let h = Harness::new();
    let replica = h.leased_replica(b"a", b"z").await;

    replica
        .send(write_batch(1_010 * SECOND, vec![put(b"a", b"1")]))
        .await
        .unwrap();
    h.clock.advance(20 * SECOND);
    replica
        .send(write_batch(1_020 * SECOND, vec![put(b"a", b"2")]))
        .await
        .unwrap();
    h.clock.advance(20 * SECOND);

    let low = replica
        .send(write_batch(1_015 * SECOND, vec![scan(b"a", b"b")]))
        .await
        .unwrap();
    assert_eq!(scan_kvs(&low)[0].1, b"1".to_vec());

    let high = replica
        .send(write_batch(1_025 * SECOND, vec![scan(b"a", b"b")]))
        .await
        .unwrap();
    assert_eq!(scan_kvs(&high)[0].1, b"2".to_vec());
}

#[tokio::test]
async fn test_range_key_tombstone_hides_older_writes() {
    let h = Harness::new();
    let replica = h.leased_replica(b"a", b"z").await;

    replica
        .send(write_batch(1_010 * SECOND, vec![put(b"a", b"1")]))
        .await
        .unwrap();
    replica
        .send(write_batch(
            1_015 * SECOND,
            vec![Request::DeleteRange {
                start: b"a".to_vec(),
                end: b"y".to_vec(),
            }],
        ))
        .await
        .unwrap();
    h.clock.advance(30 * SECOND);

    let after = replica
        .send(write_batch(1_020 * SECOND, vec![scan(b"a", b"y")]))
        .await
        .unwrap();
    assert!(scan_kvs(&after).is_empty());

    let before = replica
        .send(write_batch(1_012 * SECOND, vec![scan(b"a", b"y")]))
        .await
        .unwrap();
    assert_eq!(scan_kvs(&before)[0].1, b"1".to_vec());
}

#[tokio::test]
async fn test_span_outside_range_rejected() {
    let h = Harness::new();
    let replica = h.leased_replica(b"c", b"m").await;
    let err = replica
        .send(write_batch(1_010 * SECOND, vec![put(b"z", b"v")]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Routing(RoutingError::RangeKeyMismatch { .. })
    ));
}

#[tokio::test]
async fn test_lease_sequence_monotonic_across_transfers() {
    let h = Harness::new();
    let replica = h.leased_replica(b"a", b"z").await;
    let seq0 = replica.lease().unwrap().sequence;

    replica
        .send(write_batch(
            1_010 * SECOND,
            vec![Request::TransferLease {
                target: ReplicaId(9),
            }],
        ))
        .await
        .unwrap();
    let lease1 = replica.lease().unwrap();
    assert!(lease1.sequence > seq0);
    assert_eq!(lease1.holder, ReplicaId(9));

    // The local replica no longer holds the lease.
    let err = replica
        .send(write_batch(1_011 * SECOND, vec![put(b"a", b"v")]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Routing(RoutingError::NotLeaseholder { .. })
    ));
}

#[tokio::test]
async fn test_reproposal_under_stale_mli() {
    // Three identical log copies with equal MLIs while the applied MLI has
    // already reached them: exactly one reproposal applies with side
    // effects, the duplicates are no-ops, and the in-memory MLI advances.
    let h = Harness::new();
    let replica = h.leased_replica(b"a", b"z").await;

    // Stage the target write without proposing it.
    let (cmds, rx) = replica.stage_proposal(vec![ReplicatedWrite::PutValue {
        user_key: b"k".to_vec(),
        ts: ts(1_010 * SECOND),
        value: b"exactly-once".to_vec(),
    }]);
    assert_eq!(cmds.len(), 1);
    let stale_cmd = cmds.into_iter().next().unwrap();

    // Advance the applied MLI past the staged command with another write.
    replica
        .send(write_batch(1_011 * SECOND, vec![put(b"other", b"x")]))
        .await
        .unwrap();
    assert!(replica.lease_applied_index() >= stale_cmd.max_lease_index);

    // Simulated network retry: the same entry reaches apply three times.
    replica.apply_raw_entry(&stale_cmd).unwrap();
    replica.apply_raw_entry(&stale_cmd).unwrap();
    replica.apply_raw_entry(&stale_cmd).unwrap();

    // The write has not landed yet (all copies were no-ops).
    let mid = replica
        .send(write_batch(1_020 * SECOND, vec![scan(b"k", b"k\x00")]))
        .await
        .unwrap();
    assert!(scan_kvs(&mid).is_empty());

    // Exactly one superseding copy is pending; flushing it applies the
    // write once and completes the client.
    replica.flush_reproposals().await.unwrap();
    assert_eq!(rx.await.unwrap(), Ok(()));

    let after = replica
        .send(write_batch(1_021 * SECOND, vec![scan(b"k", b"k\x00")]))
        .await
        .unwrap();
    assert_eq!(scan_kvs(&after).len(), 1);
    assert!(replica.lease_applied_index() > stale_cmd.max_lease_index);
}

#[tokio::test]
async fn test_merge_gate_blocks_then_aborts() {
    let h = Harness::new();
    let replica = h.leased_replica(b"a", b"z").await;
    replica.begin_merge();

    // Abort shortly after; the gated write must then succeed.
    let r2 = replica.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        r2.finish_merge(MergeOutcome::Aborted);
    });
    replica
        .send(write_batch(1_010 * SECOND, vec![put(b"a", b"v")]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_merge_gate_commit_returns_range_not_found() {
    let h = Harness::new();
    let replica = h.leased_replica(b"a", b"z").await;
    replica.begin_merge();

    let r2 = replica.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        r2.finish_merge(MergeOutcome::Committed);
    });
    let err = replica
        .send(write_batch(1_010 * SECOND, vec![put(b"a", b"v")]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Routing(RoutingError::RangeNotFound(_))
    ));
}

#[tokio::test]
async fn test_merge_gate_times_out_with_typed_error() {
    let h = Harness::new();
    let replica = h.leased_replica(b"a", b"z").await;
    replica.begin_merge();

    let err = replica
        .send(write_batch(1_010 * SECOND, vec![put(b"a", b"v")]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Gate(GateError::MergeInProgress(_))
    ));
}

#[tokio::test]
async fn test_follower_read_covered_by_closed_timestamp() {
    let h = Harness::new();
    // A replica without a lease.
    let desc = RangeDescriptor::new(RangeId(1), b"a".to_vec(), b"z".to_vec());
    let replica = h.store.create_replica(desc, SpanConfig::default());
    replica.install_apply_hook(&h.consensus);

    // The side transport reports a closed timestamp from the leaseholder.
    h.store
        .side_transport()
        .publish(RangeId(1), ts(1_005 * SECOND), 10);

    let covered = replica
        .send(write_batch(1_004 * SECOND, vec![scan(b"a", b"m")]))
        .await;
    assert!(covered.is_ok(), "follower read under closed ts: {covered:?}");

    let uncovered = replica
        .send(write_batch(1_006 * SECOND, vec![scan(b"a", b"m")]))
        .await
        .unwrap_err();
    assert!(matches!(
        uncovered,
        KestrelError::Routing(RoutingError::NotLeaseholder { .. })
    ));
}

#[tokio::test]
async fn test_gc_threshold_gate() {
    let h = Harness::new();
    let replica = h.leased_replica(b"a", b"z").await;
    replica.gc_thresholds().set_persisted(ts(900 * SECOND));

    let err = replica
        .send(write_batch(850 * SECOND, vec![scan(b"a", b"m")]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Gate(GateError::BatchTimestampBeforeGc { .. })
    ));

    // Admin requests are held to the lax threshold.
    let mut admin = write_batch(900 * SECOND, vec![scan(b"a", b"m")]);
    admin.admin = true;
    replica.send(admin).await.unwrap();
}

#[tokio::test]
async fn test_quiescence_and_unquiesce_on_traffic() {
    let h = Harness::new();
    let replica = h.leased_replica(b"a", b"z").await;
    assert!(!replica.is_quiescent());
    replica.tick(true, true);
    assert!(replica.is_quiescent(), "leader with caught-up followers");

    replica
        .send(write_batch(1_010 * SECOND, vec![put(b"a", b"v")]))
        .await
        .unwrap();
    assert!(!replica.is_quiescent(), "traffic unquiesces");
}
