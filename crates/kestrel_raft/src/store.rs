//! In-memory log store and state machine for openraft.
//!
//! The state machine forwards applied `Command` entries to a registered
//! apply callback; the replica's apply loop lives behind that callback and
//! performs the max-lease-index checks before touching the engine.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogStorage, RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftLogReader, RaftSnapshotBuilder,
    SnapshotMeta, StorageError, StoredMembership, Vote,
};
use parking_lot::Mutex;

use crate::types::{RangeRequest, RangeResponse, TypeConfig};

/// Callback invoked for every applied `Command` entry. The payload is the
/// encoded [`crate::types::RangeCommand`].
pub type ApplyFn = Arc<dyn Fn(&[u8]) -> Result<(), String> + Send + Sync>;

// ── Log store ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct LogStoreInner {
    last_purged_log_id: Option<LogId<u64>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<u64>>,
    vote: Option<Vote<u64>>,
}

/// In-memory raft log.
#[derive(Clone, Default)]
pub struct LogStore {
    inner: Arc<Mutex<LogStoreInner>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let inner = self.inner.lock();
        Ok(inner.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        let inner = self.inner.lock();
        let last = inner
            .log
            .iter()
            .next_back()
            .map(|(_, e)| e.log_id)
            .or(inner.last_purged_log_id);
        Ok(LogState {
            last_purged_log_id: inner.last_purged_log_id,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<u64>>,
    ) -> Result<(), StorageError<u64>> {
        self.inner.lock().committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<u64>>, StorageError<u64>> {
        Ok(self.inner.lock().committed)
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        self.inner.lock().vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(self.inner.lock().vote)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        {
            let mut inner = self.inner.lock();
            for entry in entries {
                inner.log.insert(entry.log_id.index, entry);
            }
        }
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let mut inner = self.inner.lock();
        let keys: Vec<u64> = inner
            .log
            .range(log_id.index..)
            .map(|(k, _)| *k)
            .collect();
        for k in keys {
            inner.log.remove(&k);
        }
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let mut inner = self.inner.lock();
        inner.last_purged_log_id = Some(log_id);
        let keys: Vec<u64> = inner
            .log
            .range(..=log_id.index)
            .map(|(k, _)| *k)
            .collect();
        for k in keys {
            inner.log.remove(&k);
        }
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

// ── State machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<u64, BasicNode>,
    data: Vec<u8>,
}

#[derive(Default)]
struct StateMachineInner {
    last_applied: Option<LogId<u64>>,
    membership: StoredMembership<u64, BasicNode>,
    snapshot_idx: u64,
    current_snapshot: Option<StoredSnapshot>,
    /// Count of applied `Command` entries, exported for tests.
    applied_commands: u64,
}

/// State machine that dispatches applied commands to a callback.
#[derive(Clone)]
pub struct StateMachine {
    inner: Arc<Mutex<StateMachineInner>>,
    apply_fn: Option<ApplyFn>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateMachineInner::default())),
            apply_fn: None,
        }
    }

    pub fn with_apply_fn(apply_fn: ApplyFn) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateMachineInner::default())),
            apply_fn: Some(apply_fn),
        }
    }

    pub fn applied_commands(&self) -> u64 {
        self.inner.lock().applied_commands
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let mut inner = self.inner.lock();
        inner.snapshot_idx += 1;
        let snapshot_id = format!(
            "{}-{}",
            inner
                .last_applied
                .map(|l| l.index.to_string())
                .unwrap_or_else(|| "0".to_string()),
            inner.snapshot_idx
        );
        let meta = SnapshotMeta {
            last_log_id: inner.last_applied,
            last_membership: inner.membership.clone(),
            snapshot_id,
        };
        let data = Vec::new();
        inner.current_snapshot = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        let inner = self.inner.lock();
        Ok((inner.last_applied, inner.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<RangeResponse>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();
        for entry in entries {
            {
                let mut inner = self.inner.lock();
                inner.last_applied = Some(entry.log_id);
            }
            match entry.payload {
                EntryPayload::Blank => responses.push(RangeResponse::Noop),
                EntryPayload::Normal(RangeRequest::Noop) => responses.push(RangeResponse::Noop),
                EntryPayload::Normal(RangeRequest::Command { data }) => {
                    if let Some(cb) = &self.apply_fn {
                        if let Err(e) = cb(&data) {
                            tracing::error!("apply callback failed: {e}");
                        }
                    }
                    self.inner.lock().applied_commands += 1;
                    responses.push(RangeResponse::Ok);
                }
                EntryPayload::Membership(m) => {
                    let mut inner = self.inner.lock();
                    inner.membership = StoredMembership::new(Some(entry.log_id), m);
                    responses.push(RangeResponse::Ok);
                }
            }
        }
        Ok(responses)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let mut inner = self.inner.lock();
        inner.last_applied = meta.last_log_id;
        inner.membership = meta.last_membership.clone();
        inner.current_snapshot = Some(StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        let inner = self.inner.lock();
        Ok(inner.current_snapshot.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }
}
