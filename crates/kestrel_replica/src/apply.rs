//! The apply loop.
//!
//! Committed entries flow through [`apply_command`], which enforces the
//! at-most-once invariant: a command applies with side effects only when
//! its max-lease-index (MLI) exceeds the lease-applied index recorded in
//! the replica state. Stale copies apply as no-ops; when the stale copy is
//! the one the registry still tracks, the command is reproposed with a
//! fresh MLI ("type 2" reproposal). Commands proposed under a superseded
//! lease are rejected without side effects.

use std::sync::atomic::{AtomicU64, Ordering};

use kestrel_raft::types::RangeCommand;

use crate::proposal::{decode_writes, ProposalBuffer, ProposalRegistry, ReplicatedWrite};

/// Shared applied-state counters.
#[derive(Default)]
pub struct ApplyState {
    /// Count of applied log entries (including no-ops).
    pub applied_index: AtomicU64,
    /// MLI of the newest command applied with side effects.
    pub lease_applied_index: AtomicU64,
}

impl ApplyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    pub fn lease_applied_index(&self) -> u64 {
        self.lease_applied_index.load(Ordering::Acquire)
    }
}

/// Outcome of applying one committed entry.
#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Side effects were performed under this MLI.
    Applied { mli: u64 },
    /// The entry was stale; if the in-memory proposal matched its MLI, a
    /// superseding copy was produced for re-proposal.
    NoOp { reproposal: Option<RangeCommand> },
    /// Proposed under a lease sequence that is no longer current.
    RejectedLease,
}

/// Apply one committed command. `apply_writes` performs the engine side
/// effects; it runs exactly once per command id across all log copies.
pub fn apply_command(
    cmd: &RangeCommand,
    state: &ApplyState,
    registry: &ProposalRegistry,
    buffer: &ProposalBuffer,
    current_lease_seq: u64,
    apply_writes: impl FnOnce(&[ReplicatedWrite]) -> Result<(), String>,
) -> ApplyOutcome {
    state.applied_index.fetch_add(1, Ordering::AcqRel);

    if cmd.lease_seq != current_lease_seq {
        registry.finish(
            cmd.command_id,
            Err(format!(
                "proposed under lease sequence {} but current is {current_lease_seq}",
                cmd.lease_seq
            )),
        );
        return ApplyOutcome::RejectedLease;
    }

    let applied_mli = state.lease_applied_index.load(Ordering::Acquire);
    if cmd.max_lease_index > applied_mli {
        let Some(writes) = decode_writes(&cmd.payload) else {
            registry.finish(cmd.command_id, Err("undecodable command payload".into()));
            return ApplyOutcome::NoOp { reproposal: None };
        };
        match apply_writes(&writes) {
            Ok(()) => {
                state
                    .lease_applied_index
                    .store(cmd.max_lease_index, Ordering::Release);
                registry.finish(cmd.command_id, Ok(()));
                ApplyOutcome::Applied {
                    mli: cmd.max_lease_index,
                }
            }
            Err(e) => {
                // The entry is consumed either way; the client learns the
                // evaluation error.
                state
                    .lease_applied_index
                    .store(cmd.max_lease_index, Ordering::Release);
                registry.finish(cmd.command_id, Err(e));
                ApplyOutcome::Applied {
                    mli: cmd.max_lease_index,
                }
            }
        }
    } else {
        // Stale MLI. If the registry still tracks this command at exactly
        // this MLI, ours is the newest copy and a superseding reproposal is
        // required; otherwise a newer copy is already in flight (or the
        // command already applied) and nothing is done.
        match registry.inflight_mli(cmd.command_id) {
            Some(inflight) if inflight == cmd.max_lease_index => {
                let new_mli = buffer.alloc_mli();
                let reproposal = registry.repropose(cmd.command_id, new_mli);
                ApplyOutcome::NoOp { reproposal }
            }
            _ => ApplyOutcome::NoOp { reproposal: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::Timestamp;
    use parking_lot::Mutex;

    fn write() -> Vec<ReplicatedWrite> {
        vec![ReplicatedWrite::PutValue {
            user_key: b"k".to_vec(),
            ts: Timestamp::from_wall(5),
            value: b"v".to_vec(),
        }]
    }

    struct Fixture {
        state: ApplyState,
        registry: ProposalRegistry,
        buffer: ProposalBuffer,
        side_effects: Mutex<u64>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                state: ApplyState::new(),
                registry: ProposalRegistry::new(),
                buffer: ProposalBuffer::new(),
                side_effects: Mutex::new(0),
            }
        }

        fn apply(&self, cmd: &RangeCommand, lease_seq: u64) -> ApplyOutcome {
            apply_command(
                cmd,
                &self.state,
                &self.registry,
                &self.buffer,
                lease_seq,
                |_| {
                    *self.side_effects.lock() += 1;
                    Ok(())
                },
            )
        }

        fn propose(&self, lease_seq: u64) -> (u64, RangeCommand) {
            let (id, _rx) = self.buffer.add(&write(), lease_seq, None);
            let cmds = self.buffer.flush(&self.registry);
            (id, cmds.into_iter().last().unwrap())
        }
    }

    #[test]
    fn test_fresh_command_applies_once() {
        let f = Fixture::new();
        let (_, cmd) = f.propose(1);
        let outcome = f.apply(&cmd, 1);
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        assert_eq!(*f.side_effects.lock(), 1);
        assert_eq!(f.state.lease_applied_index(), cmd.max_lease_index);
    }

    #[test]
    fn test_duplicate_entry_is_noop() {
        let f = Fixture::new();
        let (_, cmd) = f.propose(1);
        f.apply(&cmd, 1);
        // The registry entry was consumed by the success; the duplicate is
        // a pure no-op.
        let outcome = f.apply(&cmd, 1);
        assert_eq!(outcome, ApplyOutcome::NoOp { reproposal: None });
        assert_eq!(*f.side_effects.lock(), 1, "side effects exactly once");
    }

    #[test]
    fn test_stale_copy_triggers_single_reproposal() {
        // Three identical copies with equal MLIs, all stale with respect to
        // the applied state: exactly one reproposal comes out, and only the
        // reproposed copy applies with side effects.
        let f = Fixture::new();
        let (_, cmd) = f.propose(1);
        // Force the applied MLI to the command's MLI so every copy is stale.
        f.state
            .lease_applied_index
            .store(cmd.max_lease_index, Ordering::Release);

        let o1 = f.apply(&cmd, 1);
        let repro = match o1 {
            ApplyOutcome::NoOp {
                reproposal: Some(r),
            } => r,
            other => panic!("expected reproposal, got {other:?}"),
        };
        assert!(repro.max_lease_index > cmd.max_lease_index);

        // Remaining duplicates observe a newer in-flight MLI and do nothing.
        assert_eq!(f.apply(&cmd, 1), ApplyOutcome::NoOp { reproposal: None });
        assert_eq!(f.apply(&cmd, 1), ApplyOutcome::NoOp { reproposal: None });

        // The superseding copy applies with side effects exactly once.
        let outcome = f.apply(&repro, 1);
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        assert_eq!(*f.side_effects.lock(), 1);
        assert_eq!(f.state.lease_applied_index(), repro.max_lease_index);
    }

    #[test]
    fn test_lease_mismatch_rejected_without_side_effects() {
        let f = Fixture::new();
        let (id, cmd) = f.propose(3);
        let outcome = f.apply(&cmd, 4);
        assert_eq!(outcome, ApplyOutcome::RejectedLease);
        assert_eq!(*f.side_effects.lock(), 0);
        assert!(f.registry.inflight_mli(id).is_none(), "client signaled");
    }

    #[test]
    fn test_applied_index_counts_noops() {
        let f = Fixture::new();
        let (_, cmd) = f.propose(1);
        f.apply(&cmd, 1);
        f.apply(&cmd, 1);
        assert_eq!(f.state.applied_index(), 2);
    }
}
