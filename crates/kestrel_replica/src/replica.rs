//! The per-range replica.
//!
//! `send` runs the ordered admission gates (initialization, destroy
//! status, span-in-range, lease, GC threshold, merge), then acquires
//! latches and evaluates: reads against the engine at the batch timestamp,
//! writes through the proposal buffer and consensus into the apply loop.
//!
//! Locking: `raft_mu` is strictly outer to `mu`. Read-only commands hold
//! `read_only_cmd_mu` in read mode; command application takes it in write
//! mode to quiesce concurrent readers during state transitions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use kestrel_common::error::{
    ConcurrencyError, GateError, KestrelError, KestrelResult, RoutingError,
};
use kestrel_common::hlc::Clock;
use kestrel_common::settings::{self, Settings};
use kestrel_common::types::{LeaseSequence, RangeId, ReplicaId, Timestamp};
use kestrel_concurrency::{AbortSpan, LatchManager, LockTable};
use kestrel_raft::types::RangeCommand;
use kestrel_raft::{Consensus, LocalConsensus};
use kestrel_storage::iterator::MvccGetResult;
use kestrel_storage::Engine;

use crate::apply::{apply_command, ApplyOutcome, ApplyState};
use crate::batch::{BatchRequest, BatchResponse, ReadConsistency, Request, ResponseValue};
use crate::closed_ts::{
    refresh_policy, target_closed_timestamp, ClosedTimestampTracker, ClosedTsPolicy, SideTransport,
};
use crate::descriptor::{RangeDescriptor, SpanConfig};
use crate::gc::GcThresholds;
use crate::leaderless::LeaderlessWatcher;
use crate::lease::{Lease, LeaseStatus};
use crate::merge::{MergeOutcome, MergeState};
use crate::proposal::{ProposalBuffer, ProposalRegistry, ReplicatedWrite};

/// How long a gated request waits for an in-progress merge before giving
/// up with a typed error.
const MERGE_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Ticks without raft traffic before a follower supporting a fortified
/// leader falls asleep.
const QUIESCE_AFTER_TICKS: u64 = 6;

/// Duration of an expiration-based lease, in nanoseconds.
const LEASE_DURATION_NANOS: u64 = 3_600_000_000_000;

/// Replica destroy status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyStatus {
    Alive,
    /// A merge committed; the replica is about to be destroyed.
    MergePending,
    Removed,
    Corrupt,
}

struct HardState {
    desc: RangeDescriptor,
    span_conf: SpanConfig,
    lease: Option<Lease>,
    destroy: DestroyStatus,
    /// Leases proposed below this timestamp are revoked.
    min_lease_proposed_ts: Timestamp,
    initialized: bool,
}

/// Read-only bundle returned by [`Replica::get_range_info`].
#[derive(Debug, Clone)]
pub struct RangeInfo {
    pub desc: RangeDescriptor,
    pub lease: Option<Lease>,
    pub closed_ts_policy: ClosedTsPolicy,
    pub closed_timestamp: Option<Timestamp>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("range_id", &self.range_id)
            .field("replica_id", &self.replica_id)
            .finish_non_exhaustive()
    }
}

pub struct Replica {
    pub range_id: RangeId,
    pub replica_id: ReplicaId,

    engine: Arc<Engine>,
    consensus: Arc<dyn Consensus>,
    clock: Arc<Clock>,
    settings: Arc<Settings>,

    raft_mu: Mutex<()>,
    mu: RwLock<HardState>,
    read_only_cmd_mu: RwLock<()>,

    latches: Arc<LatchManager>,
    locks: Arc<LockTable>,
    abort_span: AbortSpan,

    registry: ProposalRegistry,
    prop_buf: ProposalBuffer,
    apply_state: ApplyState,
    pending_reproposals: Mutex<Vec<RangeCommand>>,

    closed_ts: ClosedTimestampTracker,
    policy: Mutex<ClosedTsPolicy>,
    side_transport: Arc<SideTransport>,
    gc: GcThresholds,
    merge: MergeState,
    leaderless: Arc<LeaderlessWatcher>,

    quiescent: AtomicBool,
    ticks_without_traffic: AtomicU64,
}

impl Replica {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        desc: RangeDescriptor,
        replica_id: ReplicaId,
        span_conf: SpanConfig,
        engine: Arc<Engine>,
        consensus: Arc<dyn Consensus>,
        clock: Arc<Clock>,
        settings: Arc<Settings>,
        side_transport: Arc<SideTransport>,
    ) -> Arc<Self> {
        let initialized = !desc.end_key.is_empty();
        let leaderless = LeaderlessWatcher::new(&settings);
        Arc::new(Self {
            range_id: desc.range_id,
            replica_id,
            engine,
            consensus,
            clock,
            settings,
            raft_mu: Mutex::new(()),
            mu: RwLock::new(HardState {
                desc,
                span_conf,
                lease: None,
                destroy: DestroyStatus::Alive,
                min_lease_proposed_ts: Timestamp::MIN,
                initialized,
            }),
            read_only_cmd_mu: RwLock::new(()),
            latches: Arc::new(LatchManager::new()),
            locks: Arc::new(LockTable::new()),
            abort_span: AbortSpan::new(),
            registry: ProposalRegistry::new(),
            prop_buf: ProposalBuffer::new(),
            apply_state: ApplyState::new(),
            pending_reproposals: Mutex::new(Vec::new()),
            closed_ts: ClosedTimestampTracker::new(),
            policy: Mutex::new(ClosedTsPolicy::LagBySetting),
            side_transport,
            gc: GcThresholds::new(),
            merge: MergeState::new(),
            leaderless,
            quiescent: AtomicBool::new(false),
            ticks_without_traffic: AtomicU64::new(0),
        })
    }

    /// Register this replica's apply hook with a local consensus instance.
    pub fn install_apply_hook(self: &Arc<Self>, consensus: &LocalConsensus) {
        let weak = Arc::downgrade(self);
        consensus.register(
            self.range_id,
            Arc::new(move |data: &[u8]| match weak.upgrade() {
                Some(replica) => replica.handle_apply(data),
                None => Err("replica destroyed".to_string()),
            }),
        );
    }

    /// Apply one committed log entry. Invoked by the consensus layer.
    pub fn handle_apply(&self, data: &[u8]) -> Result<(), String> {
        let _raft = self.raft_mu.lock();
        // Quiesce concurrent readers while replica state transitions.
        let _cmd_block = self.read_only_cmd_mu.write();
        self.unquiesce();

        let Some(cmd) = RangeCommand::decode(data) else {
            return Err("undecodable range command".to_string());
        };
        let current_lease_seq = self
            .mu
            .read()
            .lease
            .as_ref()
            .map(|l| l.sequence.0)
            .unwrap_or(0);

        let outcome = apply_command(
            &cmd,
            &self.apply_state,
            &self.registry,
            &self.prop_buf,
            current_lease_seq,
            |writes| self.apply_writes(writes),
        );
        match outcome {
            ApplyOutcome::Applied { mli } => {
                if let Some(ct) = cmd.closed_timestamp {
                    let seq = LeaseSequence(cmd.lease_seq);
                    if self.closed_ts.try_publish(ct, mli, seq) {
                        self.side_transport.publish(self.range_id, ct, mli);
                    }
                }
            }
            ApplyOutcome::NoOp { reproposal: Some(r) } => {
                self.pending_reproposals.lock().push(r);
            }
            ApplyOutcome::NoOp { reproposal: None } | ApplyOutcome::RejectedLease => {}
        }
        Ok(())
    }

    fn apply_writes(&self, writes: &[ReplicatedWrite]) -> Result<(), String> {
        for w in writes {
            let result = match w {
                ReplicatedWrite::PutValue {
                    user_key,
                    ts,
                    value,
                } => self.engine.mvcc_put(user_key, *ts, value),
                ReplicatedWrite::DeleteValue { user_key, ts } => {
                    self.engine.mvcc_delete(user_key, *ts)
                }
                ReplicatedWrite::RangeTombstone { start, end, ts } => {
                    self.engine.mvcc_delete_range(start, end, *ts)
                }
                ReplicatedWrite::SetLease { lease } => {
                    let mut mu = self.mu.write();
                    mu.lease = Some(lease.clone());
                    Ok(())
                }
            };
            if let Err(e) = result {
                return Err(format!("apply write: {e}"));
            }
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn desc(&self) -> RangeDescriptor {
        self.mu.read().desc.clone()
    }

    pub fn desc_and_span_config(&self) -> (RangeDescriptor, SpanConfig) {
        let mu = self.mu.read();
        (mu.desc.clone(), mu.span_conf.clone())
    }

    pub fn get_range_info(&self) -> RangeInfo {
        let mu = self.mu.read();
        RangeInfo {
            desc: mu.desc.clone(),
            lease: mu.lease.clone(),
            closed_ts_policy: *self.policy.lock(),
            closed_timestamp: self.closed_ts.closed().map(|(ts, _)| ts),
        }
    }

    pub fn lease(&self) -> Option<Lease> {
        self.mu.read().lease.clone()
    }

    pub fn applied_index(&self) -> u64 {
        self.apply_state.applied_index()
    }

    pub fn lease_applied_index(&self) -> u64 {
        self.apply_state.lease_applied_index()
    }

    pub fn destroy_status(&self) -> DestroyStatus {
        self.mu.read().destroy
    }

    pub fn gc_thresholds(&self) -> &GcThresholds {
        &self.gc
    }

    pub fn abort_span(&self) -> &AbortSpan {
        &self.abort_span
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn leaderless_watcher(&self) -> &Arc<LeaderlessWatcher> {
        &self.leaderless
    }

    /// Update the span config. Returns whether the change is significant
    /// (triggers requeueing in the replicate/split/merge/gc queues).
    pub fn set_span_config(&self, conf: SpanConfig) -> bool {
        let mut mu = self.mu.write();
        let significant = mu.span_conf.is_significant_change(&conf);
        mu.span_conf = conf;
        significant
    }

    /// Recompute the closed-timestamp policy from node round-trip times.
    pub fn refresh_policy(
        &self,
        latencies: &std::collections::HashMap<kestrel_common::types::NodeId, u64>,
    ) {
        let global_reads = self.mu.read().span_conf.global_reads;
        *self.policy.lock() = refresh_policy(global_reads, latencies);
    }

    /// Install a new descriptor (split/merge/rebalance). Waiting lock-table
    /// queues drain with a retry hint.
    pub fn set_descriptor(&self, desc: RangeDescriptor) {
        let mut mu = self.mu.write();
        mu.desc = desc;
        mu.initialized = !mu.desc.end_key.is_empty();
        drop(mu);
        self.locks.notify_boundary_change();
    }

    pub fn set_destroy_status(&self, status: DestroyStatus) {
        self.mu.write().destroy = status;
    }

    // ── Merge protocol ──────────────────────────────────────────────────

    /// Install the merge gate: requests block until the merge resolves.
    pub fn begin_merge(&self) {
        self.merge.begin_merge();
    }

    /// Resolve the in-progress merge. On commit the destroy status flips
    /// to merge-pending before waiters wake, so they observe "range not
    /// found".
    pub fn finish_merge(&self, outcome: MergeOutcome) {
        if outcome == MergeOutcome::Committed {
            self.mu.write().destroy = DestroyStatus::MergePending;
        }
        self.merge.complete(outcome);
    }

    /// Block until an in-progress merge resolves. An inconsistent read
    /// racing a just-committed merge may observe a short stale window; the
    /// gate only closes it for consistent traffic.
    pub async fn watch_for_merge(&self) -> Option<MergeOutcome> {
        let mut rx = self.merge.subscribe()?;
        if *rx.borrow() != MergeOutcome::Pending {
            return Some(*rx.borrow());
        }
        match tokio::time::timeout(MERGE_WAIT_TIMEOUT, rx.changed()).await {
            Ok(Ok(())) => Some(*rx.borrow()),
            _ => Some(MergeOutcome::Pending),
        }
    }

    // ── Quiescence ──────────────────────────────────────────────────────

    /// Raft tick. Quiesced replicas skip ticking entirely.
    pub fn tick(&self, is_leader: bool, followers_caught_up: bool) {
        if self.quiescent.load(Ordering::Acquire) {
            return;
        }
        let ticks = self.ticks_without_traffic.fetch_add(1, Ordering::AcqRel) + 1;
        if is_leader && followers_caught_up {
            self.quiescent.store(true, Ordering::Release);
        } else if !is_leader && ticks >= QUIESCE_AFTER_TICKS {
            // Follower of a fortified leader falls asleep.
            self.quiescent.store(true, Ordering::Release);
        }
    }

    pub fn unquiesce(&self) {
        self.quiescent.store(false, Ordering::Release);
        self.ticks_without_traffic.store(0, Ordering::Release);
    }

    pub fn is_quiescent(&self) -> bool {
        self.quiescent.load(Ordering::Acquire)
    }

    // ── Request path ────────────────────────────────────────────────────

    /// Serve a batch. Runs the ordered gates, then evaluates.
    pub async fn send(self: &Arc<Self>, batch: BatchRequest) -> KestrelResult<BatchResponse> {
        self.unquiesce();
        let now = self.clock.now();

        // Gate 1: initialization.
        {
            let mu = self.mu.read();
            if !mu.initialized {
                return Err(KestrelError::internal(
                    "E-REPLICA-UNINIT",
                    format!("uninitialized replica {} served a batch", self.range_id),
                ));
            }
            // Gate 2: destroy status.
            match mu.destroy {
                DestroyStatus::Alive => {}
                DestroyStatus::MergePending | DestroyStatus::Removed => {
                    return Err(RoutingError::RangeNotFound(self.range_id).into());
                }
                DestroyStatus::Corrupt => {
                    return Err(GateError::ReplicaUnavailable {
                        range_id: self.range_id,
                        replica_id: self.replica_id,
                        reason: "replica marked corrupt".into(),
                    }
                    .into());
                }
            }
        }

        // Cached unavailability from the leaderless watcher.
        if self.leaderless.is_unavailable() {
            return Err(GateError::ReplicaUnavailable {
                range_id: self.range_id,
                replica_id: self.replica_id,
                reason: "leaderless for longer than the configured threshold".into(),
            }
            .into());
        }

        // Gate 3: span-in-range.
        if let Some(span) = batch.span() {
            let mu = self.mu.read();
            if !mu.desc.contains_span(&span) {
                return Err(RoutingError::RangeKeyMismatch {
                    range_id: self.range_id,
                    generation: mu.desc.generation,
                }
                .into());
            }
        }

        // Gate 4: lease.
        if !batch.skips_lease_check() && batch.consistency == ReadConsistency::Consistent {
            self.check_lease(&batch, now)?;
        }

        // Gate 5: GC threshold.
        if batch.is_read_only() {
            let (ttl, excluded) = {
                let mu = self.mu.read();
                (
                    mu.span_conf.gc_ttl_seconds,
                    mu.span_conf.exclude_from_backup,
                )
            };
            let strict =
                self.settings.get_bool(settings::GC_TTL_STRICT_ENFORCEMENT) && !batch.admin;
            self.gc
                .check_request(batch.ts, now, ttl, strict, excluded)?;
        }

        // Gate 6: merge.
        if self.merge.in_progress() && !batch.is_subsume() && !batch.is_descriptor_refresh() {
            match self.watch_for_merge().await {
                Some(MergeOutcome::Committed) => {
                    return Err(RoutingError::RangeNotFound(self.range_id).into());
                }
                Some(MergeOutcome::Aborted) | None => {}
                Some(MergeOutcome::Pending) => {
                    return Err(GateError::MergeInProgress(self.range_id).into());
                }
            }
        }

        // Latches for the duration of evaluation plus proposal.
        let _latches = self.latches.acquire(batch.latch_spans(), batch.ts);

        // Abort span.
        if let Some(txn) = &batch.txn {
            self.abort_span.check(txn.txn_id)?;
        }

        if batch.is_read_only() {
            self.evaluate_reads(&batch)
        } else {
            self.evaluate_writes(batch, now).await
        }
    }

    fn check_lease(&self, batch: &BatchRequest, now: Timestamp) -> KestrelResult<()> {
        let mu = self.mu.read();
        let status = match &mu.lease {
            None => LeaseStatus::None,
            Some(lease) => lease.status(now, batch.ts, mu.min_lease_proposed_ts, None),
        };
        let holder = mu.lease.as_ref().map(|l| l.holder);
        let is_holder = holder == Some(self.replica_id);
        drop(mu);

        if status == LeaseStatus::Valid && is_holder {
            return Ok(());
        }
        // Follower reads: a read fully below the closed timestamp is
        // servable without the lease.
        if batch.is_read_only() {
            let covered = self.closed_ts.covers(batch.ts)
                || self
                    .side_transport
                    .latest(self.range_id)
                    .map(|(ts, _)| batch.ts <= ts)
                    .unwrap_or(false);
            if covered {
                return Ok(());
            }
        }
        Err(RoutingError::NotLeaseholder {
            range_id: self.range_id,
            leaseholder_hint: holder.filter(|h| *h != self.replica_id),
        }
        .into())
    }

    fn evaluate_reads(&self, batch: &BatchRequest) -> KestrelResult<BatchResponse> {
        let _read_guard = self.read_only_cmd_mu.read();
        let mut responses = Vec::with_capacity(batch.requests.len());
        for req in &batch.requests {
            match req {
                Request::Get { key } => match self.engine.mvcc_get(key, batch.ts)? {
                    MvccGetResult::Value(v) => {
                        responses.push(ResponseValue::Get { value: Some(v) })
                    }
                    MvccGetResult::NotFound => {
                        responses.push(ResponseValue::Get { value: None })
                    }
                    MvccGetResult::Intent(holder) => {
                        self.locks.discover_intent(key, holder, batch.ts);
                        return Err(ConcurrencyError::WriteIntent { holder }.into());
                    }
                },
                Request::Scan { start, end } => {
                    let result = self.engine.mvcc_scan(start, end, batch.ts)?;
                    if let Some((key, holder)) = result.intents.first() {
                        self.locks.discover_intent(key, *holder, batch.ts);
                        return Err(ConcurrencyError::WriteIntent { holder: *holder }.into());
                    }
                    responses.push(ResponseValue::Scan { kvs: result.kvs });
                }
                Request::RefreshRangeDescriptor => {
                    responses.push(ResponseValue::RefreshRangeDescriptor);
                }
                other => {
                    return Err(KestrelError::internal(
                        "E-REPLICA-EVAL",
                        format!("write request {other:?} on read-only path"),
                    ));
                }
            }
        }
        Ok(BatchResponse { responses })
    }

    async fn evaluate_writes(
        self: &Arc<Self>,
        batch: BatchRequest,
        now: Timestamp,
    ) -> KestrelResult<BatchResponse> {
        let mut writes = Vec::new();
        let mut responses = Vec::with_capacity(batch.requests.len());
        for req in &batch.requests {
            match req {
                Request::Put { key, value } => {
                    writes.push(ReplicatedWrite::PutValue {
                        user_key: key.clone(),
                        ts: batch.ts,
                        value: value.clone(),
                    });
                    responses.push(ResponseValue::Put);
                }
                Request::Delete { key } => {
                    writes.push(ReplicatedWrite::DeleteValue {
                        user_key: key.clone(),
                        ts: batch.ts,
                    });
                    responses.push(ResponseValue::Delete);
                }
                Request::DeleteRange { start, end } => {
                    writes.push(ReplicatedWrite::RangeTombstone {
                        start: start.clone(),
                        end: end.clone(),
                        ts: batch.ts,
                    });
                    responses.push(ResponseValue::DeleteRange);
                }
                Request::Subsume => {
                    self.begin_merge();
                    responses.push(ResponseValue::Subsume);
                }
                Request::RequestLease { holder } => {
                    let lease = self.next_lease(*holder, now);
                    writes.push(ReplicatedWrite::SetLease { lease });
                    responses.push(ResponseValue::Lease);
                }
                Request::TransferLease { target } => {
                    // Revoke the local lease before handing it off.
                    self.mu.write().min_lease_proposed_ts = now;
                    let lease = self.next_lease(*target, now);
                    writes.push(ReplicatedWrite::SetLease { lease });
                    responses.push(ResponseValue::Lease);
                }
                Request::Get { .. } | Request::Scan { .. } | Request::RefreshRangeDescriptor => {
                    return Err(KestrelError::internal(
                        "E-REPLICA-EVAL",
                        "read request on write path",
                    ));
                }
            }
        }

        if writes.is_empty() {
            return Ok(BatchResponse { responses });
        }

        let (lease_seq, target_duration) = {
            let mu = self.mu.read();
            (
                mu.lease.as_ref().map(|l| l.sequence.0).unwrap_or(0),
                self.settings.get_u64(settings::CLOSED_TS_TARGET_DURATION_MS) * 1_000_000,
            )
        };
        let closed_target = target_closed_timestamp(now, *self.policy.lock(), target_duration);

        let (_command_id, rx) = self.prop_buf.add(&writes, lease_seq, Some(closed_target));
        for cmd in self.prop_buf.flush(&self.registry) {
            self.consensus
                .propose(self.range_id, cmd.encode())
                .await
                .map_err(|e| KestrelError::retryable(e.to_string(), self.range_id.0))?;
        }
        self.flush_reproposals().await?;

        match rx.await {
            Ok(Ok(())) => Ok(BatchResponse { responses }),
            Ok(Err(e)) => Err(KestrelError::retryable(e, self.range_id.0)),
            Err(_) => Err(KestrelError::AmbiguousResult(
                "proposal dropped before completion".into(),
            )),
        }
    }

    fn next_lease(&self, holder: ReplicaId, now: Timestamp) -> Lease {
        let mu = self.mu.read();
        let expiration = Timestamp::from_wall(now.wall + LEASE_DURATION_NANOS);
        match &mu.lease {
            Some(cur) => cur.next(holder, now, Some(expiration)),
            None => Lease::expiration_based(holder, LeaseSequence(1), now, expiration),
        }
    }

    /// Re-propose superseding copies produced by the apply loop.
    pub async fn flush_reproposals(self: &Arc<Self>) -> KestrelResult<()> {
        loop {
            let pending = std::mem::take(&mut *self.pending_reproposals.lock());
            if pending.is_empty() {
                return Ok(());
            }
            for cmd in pending {
                self.consensus
                    .propose(self.range_id, cmd.encode())
                    .await
                    .map_err(|e| KestrelError::retryable(e.to_string(), self.range_id.0))?;
            }
        }
    }

    /// Feed a raw encoded command straight into the apply path, bypassing
    /// the proposal buffer. Exercises duplicate-entry handling.
    pub fn apply_raw_entry(&self, cmd: &RangeCommand) -> Result<(), String> {
        self.handle_apply(&cmd.encode())
    }

    /// Buffer a set of writes and return the flushed commands without
    /// proposing them. The caller decides how (and how often) the commands
    /// reach the log.
    pub fn stage_proposal(
        &self,
        writes: Vec<ReplicatedWrite>,
    ) -> (
        Vec<RangeCommand>,
        tokio::sync::oneshot::Receiver<Result<(), String>>,
    ) {
        let lease_seq = self
            .mu
            .read()
            .lease
            .as_ref()
            .map(|l| l.sequence.0)
            .unwrap_or(0);
        let (_id, rx) = self.prop_buf.add(&writes, lease_seq, None);
        (self.prop_buf.flush(&self.registry), rx)
    }
}
