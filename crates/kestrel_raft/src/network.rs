//! In-process network for openraft.
//!
//! RPCs are dispatched directly to the target node's `Raft` handle through
//! a shared router. No sockets: deterministic, zero-latency, and easy to
//! partition in tests by removing a node from the router.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use openraft::error::{RPCError, RaftError, ReplicationClosed, StreamingError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;
use openraft::{BasicNode, Raft, Vote};
use parking_lot::RwLock;

use crate::types::TypeConfig;

/// Shared registry mapping node id → raft handle.
#[derive(Default)]
pub struct RaftRouter {
    nodes: RwLock<BTreeMap<u64, Raft<TypeConfig>>>,
}

impl RaftRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_node(&self, id: u64, raft: Raft<TypeConfig>) {
        self.nodes.write().insert(id, raft);
    }

    /// Remove a node, e.g. to simulate a partition.
    pub fn remove_node(&self, id: u64) {
        self.nodes.write().remove(&id);
    }

    pub fn get_node(&self, id: u64) -> Option<Raft<TypeConfig>> {
        self.nodes.read().get(&id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

/// Factory producing in-process connections through the router.
pub struct RouterNetworkFactory {
    router: Arc<RaftRouter>,
}

impl RouterNetworkFactory {
    pub fn new(router: Arc<RaftRouter>) -> Self {
        Self { router }
    }
}

impl RaftNetworkFactory<TypeConfig> for RouterNetworkFactory {
    type Network = RouterConnection;

    async fn new_client(&mut self, target: u64, _node: &BasicNode) -> Self::Network {
        RouterConnection {
            target,
            router: self.router.clone(),
        }
    }
}

/// Connection to one target node.
pub struct RouterConnection {
    target: u64,
    router: Arc<RaftRouter>,
}

impl RouterConnection {
    #[allow(clippy::result_large_err)]
    fn get_target(&self) -> Result<Raft<TypeConfig>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.router.get_node(self.target).ok_or_else(|| {
            RPCError::Unreachable(Unreachable::new(&io::Error::new(
                io::ErrorKind::NotConnected,
                format!("node {} not in router", self.target),
            )))
        })
    }
}

impl RaftNetwork<TypeConfig> for RouterConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let raft = self.get_target()?;
        raft.append_entries(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(openraft::error::RemoteError::new(self.target, e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let raft = self.get_target()?;
        raft.vote(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(openraft::error::RemoteError::new(self.target, e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: openraft::raft::InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        openraft::raft::InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, openraft::error::InstallSnapshotError>>,
    > {
        let raft = self.router.get_node(self.target).ok_or_else(|| {
            RPCError::Unreachable(Unreachable::new(&io::Error::new(
                io::ErrorKind::NotConnected,
                format!("node {} not in router", self.target),
            )))
        })?;
        raft.install_snapshot(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(openraft::error::RemoteError::new(self.target, e)))
    }

    async fn full_snapshot(
        &mut self,
        _vote: Vote<u64>,
        _snapshot: Snapshot<TypeConfig>,
        _cancel: impl std::future::Future<Output = ReplicationClosed> + Send + 'static,
        _option: RPCOption,
    ) -> Result<SnapshotResponse<u64>, StreamingError<TypeConfig, openraft::error::Fatal<u64>>>
    {
        Err(StreamingError::Unreachable(Unreachable::new(
            &io::Error::new(
                io::ErrorKind::Unsupported,
                "full_snapshot unsupported in-process; chunked install_snapshot is used",
            ),
        )))
    }
}
