//! Consensus substrate for the range store.
//!
//! - `Consensus`: the trait replicas propose through
//! - `LocalConsensus`: synchronous in-order apply for single-replica
//!   deployments and deterministic tests
//! - `RangeGroup`: multi-node in-process openraft cluster
//! - `GroupConsensus`: `Consensus` backed by per-range `RangeGroup`s

pub mod network;
pub mod store;
pub mod types;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use openraft::{BasicNode, Config, Raft};
use parking_lot::RwLock;

use kestrel_common::types::RangeId;

use crate::network::{RaftRouter, RouterNetworkFactory};
use crate::store::{ApplyFn, LogStore, StateMachine};
use crate::types::{RangeRequest, TypeConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("not leader for range {0}")]
    NotLeader(RangeId),
    #[error("proposal failed: {0}")]
    ProposalFailed(String),
    #[error("membership change failed: {0}")]
    MembershipFailed(String),
    #[error("node {0} not found")]
    NodeNotFound(u64),
}

/// The interface replicas sequence writes through.
#[async_trait]
pub trait Consensus: Send + Sync + 'static {
    /// Append an encoded command to the range's log. Resolves once the
    /// entry is committed and applied locally.
    async fn propose(&self, range: RangeId, data: Vec<u8>) -> Result<(), ConsensusError>;
    async fn is_leader(&self, range: RangeId) -> bool;
}

/// Synchronous consensus for single-replica ranges: proposals apply
/// immediately, in proposal order, through the registered callback.
#[derive(Default)]
pub struct LocalConsensus {
    apply_fns: DashMap<u64, ApplyFn>,
    applied_index: AtomicU64,
}

impl LocalConsensus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, range: RangeId, apply_fn: ApplyFn) {
        self.apply_fns.insert(range.0, apply_fn);
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    /// Feed an already-encoded entry straight to the apply path. Tests use
    /// this to simulate duplicate log entries from network retries.
    pub fn apply_raw(&self, range: RangeId, data: &[u8]) -> Result<(), ConsensusError> {
        let Some(cb) = self.apply_fns.get(&range.0) else {
            return Err(ConsensusError::NotLeader(range));
        };
        self.applied_index.fetch_add(1, Ordering::AcqRel);
        cb(data).map_err(ConsensusError::ProposalFailed)
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn propose(&self, range: RangeId, data: Vec<u8>) -> Result<(), ConsensusError> {
        self.apply_raw(range, &data)
    }

    async fn is_leader(&self, _range: RangeId) -> bool {
        true
    }
}

// ── RangeGroup - multi-node in-process raft ────────────────────────────────

/// Multi-node raft group using the in-process router for RPCs.
pub struct RangeGroup {
    router: Arc<RaftRouter>,
    node_ids: Vec<u64>,
    config: Arc<Config>,
    apply_fn: Option<ApplyFn>,
    state_machines: BTreeMap<u64, StateMachine>,
}

impl RangeGroup {
    pub async fn new_cluster(node_ids: Vec<u64>) -> Result<Self, ConsensusError> {
        Self::new_cluster_with_callback(node_ids, None).await
    }

    pub async fn new_cluster_with_callback(
        node_ids: Vec<u64>,
        apply_fn: Option<ApplyFn>,
    ) -> Result<Self, ConsensusError> {
        if node_ids.is_empty() {
            return Err(ConsensusError::ProposalFailed(
                "node_ids must not be empty".into(),
            ));
        }
        let config = Arc::new(
            Config {
                heartbeat_interval: 50,
                election_timeout_min: 150,
                election_timeout_max: 300,
                ..Default::default()
            }
            .validate()
            .map_err(|e| ConsensusError::ProposalFailed(format!("config: {e}")))?,
        );
        let router = RaftRouter::new();
        let mut members: BTreeMap<u64, BasicNode> = BTreeMap::new();
        for &id in &node_ids {
            members.insert(id, BasicNode::new(format!("node-{id}").as_str()));
        }
        let mut state_machines = BTreeMap::new();
        for &node_id in &node_ids {
            let sm = match &apply_fn {
                Some(cb) => StateMachine::with_apply_fn(cb.clone()),
                None => StateMachine::new(),
            };
            state_machines.insert(node_id, sm.clone());
            let raft = Raft::new(
                node_id,
                config.clone(),
                RouterNetworkFactory::new(router.clone()),
                LogStore::new(),
                sm,
            )
            .await
            .map_err(|e| ConsensusError::ProposalFailed(format!("node {node_id} init: {e}")))?;
            router.add_node(node_id, raft);
        }
        if let Some(raft) = router.get_node(node_ids[0]) {
            raft.initialize(members)
                .await
                .map_err(|e| ConsensusError::ProposalFailed(format!("bootstrap: {e}")))?;
        }
        Ok(Self {
            router,
            node_ids,
            config,
            apply_fn,
            state_machines,
        })
    }

    /// Wait for leader election, polling up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<u64, ConsensusError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for &id in &self.node_ids {
                if let Some(raft) = self.router.get_node(id) {
                    if let Some(leader) = raft.metrics().borrow().current_leader {
                        return Ok(leader);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConsensusError::ProposalFailed(
                    "leader election timed out".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn current_leader(&self) -> Option<u64> {
        for &id in &self.node_ids {
            if let Some(raft) = self.router.get_node(id) {
                if let Some(leader) = raft.metrics().borrow().current_leader {
                    return Some(leader);
                }
            }
        }
        None
    }

    /// Propose a command; routes to whichever node accepts the write.
    pub async fn propose(&self, data: Vec<u8>) -> Result<(), ConsensusError> {
        self.propose_req(RangeRequest::Command { data }).await
    }

    pub async fn propose_noop(&self) -> Result<(), ConsensusError> {
        self.propose_req(RangeRequest::Noop).await
    }

    async fn propose_req(&self, req: RangeRequest) -> Result<(), ConsensusError> {
        let mut last_err = ConsensusError::ProposalFailed("no nodes available".into());
        for &id in &self.node_ids {
            if let Some(raft) = self.router.get_node(id) {
                match raft.client_write(req.clone()).await {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        last_err = ConsensusError::ProposalFailed(format!("node {id}: {e}"));
                    }
                }
            }
        }
        Err(last_err)
    }

    pub fn get_node(&self, node_id: u64) -> Option<Raft<TypeConfig>> {
        self.router.get_node(node_id)
    }

    /// Commands applied on a node's state machine.
    pub fn applied_commands(&self, node_id: u64) -> u64 {
        self.state_machines
            .get(&node_id)
            .map(|sm| sm.applied_commands())
            .unwrap_or(0)
    }

    /// Simulate a partition: the node stops receiving RPCs.
    pub fn partition_node(&self, node_id: u64) {
        self.router.remove_node(node_id);
    }

    /// Reconnect a previously partitioned node with fresh storage; raft
    /// re-replicates its state.
    pub async fn reconnect_node(&self, node_id: u64) -> Result<(), ConsensusError> {
        if self.router.get_node(node_id).is_some() {
            return Ok(());
        }
        let sm = match &self.apply_fn {
            Some(cb) => StateMachine::with_apply_fn(cb.clone()),
            None => StateMachine::new(),
        };
        let raft = Raft::new(
            node_id,
            self.config.clone(),
            RouterNetworkFactory::new(self.router.clone()),
            LogStore::new(),
            sm,
        )
        .await
        .map_err(|e| ConsensusError::ProposalFailed(format!("reconnect: {e}")))?;
        self.router.add_node(node_id, raft);
        Ok(())
    }

    pub async fn add_voter(&self, node_id: u64, addr: &str) -> Result<(), ConsensusError> {
        let leader_id = self.wait_for_leader(Duration::from_secs(2)).await?;
        let raft = self
            .router
            .get_node(leader_id)
            .ok_or(ConsensusError::NodeNotFound(leader_id))?;
        raft.add_learner(node_id, BasicNode::new(addr), true)
            .await
            .map_err(|e| ConsensusError::MembershipFailed(format!("{e}")))?;
        let members: Vec<u64> = self
            .node_ids
            .iter()
            .copied()
            .chain(std::iter::once(node_id))
            .collect();
        raft.change_membership(members, false)
            .await
            .map_err(|e| ConsensusError::MembershipFailed(format!("{e}")))?;
        Ok(())
    }

    pub async fn remove_voter(&self, node_id: u64) -> Result<(), ConsensusError> {
        let leader_id = self.wait_for_leader(Duration::from_secs(2)).await?;
        let raft = self
            .router
            .get_node(leader_id)
            .ok_or(ConsensusError::NodeNotFound(leader_id))?;
        let remaining: Vec<u64> = self
            .node_ids
            .iter()
            .copied()
            .filter(|&id| id != node_id)
            .collect();
        raft.change_membership(remaining, false)
            .await
            .map_err(|e| ConsensusError::MembershipFailed(format!("{e}")))?;
        Ok(())
    }

    pub async fn shutdown(self) -> Result<(), ConsensusError> {
        for id in self.node_ids.clone() {
            if let Some(raft) = self.router.get_node(id) {
                raft.shutdown()
                    .await
                    .map_err(|e| ConsensusError::ProposalFailed(format!("shutdown {id}: {e}")))?;
            }
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.node_ids.len()
    }

    pub fn node_ids(&self) -> &[u64] {
        &self.node_ids
    }
}

// ── GroupConsensus - Consensus over per-range groups ────────────────────────

struct GroupHandle {
    group: tokio::sync::Mutex<RangeGroup>,
}

/// `Consensus` backed by one `RangeGroup` per range.
#[derive(Default)]
pub struct GroupConsensus {
    groups: RwLock<BTreeMap<u64, Arc<GroupHandle>>>,
}

impl GroupConsensus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_range(&self, range: RangeId, group: RangeGroup) {
        self.groups.write().insert(
            range.0,
            Arc::new(GroupHandle {
                group: tokio::sync::Mutex::new(group),
            }),
        );
    }

    fn get_group(&self, range: RangeId) -> Result<Arc<GroupHandle>, ConsensusError> {
        self.groups
            .read()
            .get(&range.0)
            .cloned()
            .ok_or(ConsensusError::NotLeader(range))
    }
}

#[async_trait]
impl Consensus for GroupConsensus {
    async fn propose(&self, range: RangeId, data: Vec<u8>) -> Result<(), ConsensusError> {
        let h = self.get_group(range)?;
        let g = h.group.lock().await;
        g.propose(data).await
    }

    async fn is_leader(&self, range: RangeId) -> bool {
        let Ok(h) = self.get_group(range) else {
            return false;
        };
        let g = h.group.lock().await;
        g.current_leader().await.is_some()
    }
}
