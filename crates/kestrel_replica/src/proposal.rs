//! Proposals and the proposal buffer.
//!
//! Evaluation produces a [`ProposalData`] carrying the replicated writes
//! and a completion channel. The buffer assigns each flushed proposal a
//! max-lease-index (MLI) and records it in the registry; the apply loop
//! consults the registry when entries commit. At most one superseding copy
//! of a proposal is ever in flight, and the MLI recorded in the registry
//! is the maximum across all log copies of the command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use kestrel_common::types::Timestamp;
use kestrel_raft::types::RangeCommand;

/// A single replicated write applied below raft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicatedWrite {
    PutValue {
        user_key: Vec<u8>,
        ts: Timestamp,
        value: Vec<u8>,
    },
    DeleteValue {
        user_key: Vec<u8>,
        ts: Timestamp,
    },
    RangeTombstone {
        start: Vec<u8>,
        end: Vec<u8>,
        ts: Timestamp,
    },
    /// Lease installation, sequenced through the log like any write.
    SetLease {
        lease: crate::lease::Lease,
    },
}

pub fn encode_writes(writes: &[ReplicatedWrite]) -> Vec<u8> {
    bincode::serialize(writes).expect("replicated writes are always serializable")
}

pub fn decode_writes(raw: &[u8]) -> Option<Vec<ReplicatedWrite>> {
    bincode::deserialize(raw).ok()
}

/// Completion result delivered to the waiting client.
pub type ProposalResult = Result<(), String>;

/// An in-flight proposal tracked by the registry.
pub struct InflightProposal {
    pub max_lease_index: u64,
    pub lease_seq: u64,
    pub closed_timestamp: Option<Timestamp>,
    pub payload: Vec<u8>,
    done: Option<oneshot::Sender<ProposalResult>>,
}

/// Registry of proposals awaiting application, keyed by command id.
#[derive(Default)]
pub struct ProposalRegistry {
    inner: Mutex<HashMap<u64, InflightProposal>>,
}

impl ProposalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, command_id: u64, proposal: InflightProposal) {
        self.inner.lock().insert(command_id, proposal);
    }

    /// Signal the waiting client and drop the proposal.
    pub fn finish(&self, command_id: u64, result: ProposalResult) {
        if let Some(mut p) = self.inner.lock().remove(&command_id) {
            if let Some(done) = p.done.take() {
                let _ = done.send(result);
            }
        }
    }

    /// The registered MLI for a command, if still in flight.
    pub fn inflight_mli(&self, command_id: u64) -> Option<u64> {
        self.inner.lock().get(&command_id).map(|p| p.max_lease_index)
    }

    /// Supersede the in-flight copy with a new MLI, returning the command
    /// to re-propose. Only valid while the command is still registered.
    pub fn repropose(&self, command_id: u64, new_mli: u64) -> Option<RangeCommand> {
        let mut inner = self.inner.lock();
        let p = inner.get_mut(&command_id)?;
        p.max_lease_index = new_mli;
        Some(RangeCommand {
            command_id,
            max_lease_index: new_mli,
            lease_seq: p.lease_seq,
            closed_timestamp: p.closed_timestamp,
            payload: p.payload.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Assigns command ids and max-lease-indexes; batches proposals between
/// flushes.
pub struct ProposalBuffer {
    next_command_id: AtomicU64,
    next_mli: AtomicU64,
    pending: Mutex<Vec<PendingProposal>>,
}

struct PendingProposal {
    command_id: u64,
    lease_seq: u64,
    closed_timestamp: Option<Timestamp>,
    payload: Vec<u8>,
    done: oneshot::Sender<ProposalResult>,
}

impl Default for ProposalBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProposalBuffer {
    pub fn new() -> Self {
        Self {
            next_command_id: AtomicU64::new(1),
            next_mli: AtomicU64::new(1),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue a proposal; the returned receiver resolves when the command
    /// applies (or is rejected).
    pub fn add(
        &self,
        writes: &[ReplicatedWrite],
        lease_seq: u64,
        closed_timestamp: Option<Timestamp>,
    ) -> (u64, oneshot::Receiver<ProposalResult>) {
        let command_id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push(PendingProposal {
            command_id,
            lease_seq,
            closed_timestamp,
            payload: encode_writes(writes),
            done: tx,
        });
        (command_id, rx)
    }

    /// Allocate a fresh MLI (used for reproposals).
    pub fn alloc_mli(&self) -> u64 {
        self.next_mli.fetch_add(1, Ordering::Relaxed)
    }

    pub fn last_assigned_mli(&self) -> u64 {
        self.next_mli.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Assign MLIs to all pending proposals, register them, and return the
    /// encoded commands in assignment order.
    pub fn flush(&self, registry: &ProposalRegistry) -> Vec<RangeCommand> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut out = Vec::with_capacity(pending.len());
        for p in pending {
            let mli = self.alloc_mli();
            let cmd = RangeCommand {
                command_id: p.command_id,
                max_lease_index: mli,
                lease_seq: p.lease_seq,
                closed_timestamp: p.closed_timestamp,
                payload: p.payload.clone(),
            };
            registry.insert(
                p.command_id,
                InflightProposal {
                    max_lease_index: mli,
                    lease_seq: p.lease_seq,
                    closed_timestamp: p.closed_timestamp,
                    payload: p.payload,
                    done: Some(p.done),
                },
            );
            out.push(cmd);
        }
        out
    }
}
