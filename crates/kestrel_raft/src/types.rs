//! Openraft type configuration and the replicated command envelope.

use std::io::Cursor;

use openraft::BasicNode;
use serde::{Deserialize, Serialize};

use kestrel_common::types::Timestamp;

/// Application request proposed to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RangeRequest {
    /// An encoded [`RangeCommand`].
    Command { data: Vec<u8> },
    /// No-op entry for leader confirmation.
    Noop,
}

/// Application response returned after apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RangeResponse {
    Ok,
    Noop,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = RangeRequest,
        R            = RangeResponse,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// The command envelope written to the replicated log. The max-lease-index
/// enforces at-most-once side-effectful application under reproposals; the
/// lease sequence rejects commands proposed under a superseded lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeCommand {
    /// Identifies the proposal across all of its log copies.
    pub command_id: u64,
    pub max_lease_index: u64,
    pub lease_seq: u64,
    /// Closed-timestamp update carried by the command, if any.
    pub closed_timestamp: Option<Timestamp>,
    /// The serialized write payload evaluated below raft.
    pub payload: Vec<u8>,
}

impl RangeCommand {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("RangeCommand is always serializable")
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        bincode::deserialize(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let cmd = RangeCommand {
            command_id: 7,
            max_lease_index: 42,
            lease_seq: 3,
            closed_timestamp: Some(Timestamp::new(100, 2)),
            payload: b"write".to_vec(),
        };
        assert_eq!(RangeCommand::decode(&cmd.encode()), Some(cmd));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(RangeCommand::decode(b"\xFF\xFF").is_none());
    }
}
