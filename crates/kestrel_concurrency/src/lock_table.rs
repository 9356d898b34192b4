//! In-memory lock table.
//!
//! Maps keys to their holding transaction, strength, and a FIFO queue of
//! waiters. Releasing a lock hands it to the head-of-line waiter directly,
//! so arrival order is grant order. Persisted intents discovered during
//! evaluation are pulled in on demand and queue requests like any
//! in-memory lock.
//!
//! Deadlock detection needs no separate graph: a blocked transaction
//! waits on exactly one key, and that key names its holder, so the
//! wait-for relation is already encoded in the table. Detection walks the
//! `waiter -> key -> holder` chain from the transaction that just
//! blocked; revisiting a transaction on the walk is a cycle, and the
//! youngest transaction in the cycle (smallest amount of work to redo) is
//! aborted. A range boundary change drains all waiters with a retry hint.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use kestrel_common::error::ConcurrencyError;
use kestrel_common::types::{Timestamp, TxnId, TxnPriority};

/// Strength of a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrength {
    Shared,
    Exclusive,
}

/// Why a waiter woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeReason {
    Pending,
    /// The lock was handed to this waiter; it is now the holder.
    Granted,
    /// This waiter was chosen as the deadlock victim.
    Deadlocked,
    /// The range boundary changed; retry against the new range.
    BoundaryChanged,
    TimedOut,
}

/// One queued request for a lock.
struct Waiter {
    txn_id: TxnId,
    priority: TxnPriority,
    ts: Timestamp,
    reason: Mutex<WakeReason>,
    wake: Condvar,
}

impl Waiter {
    fn new(txn_id: TxnId, priority: TxnPriority, ts: Timestamp) -> Arc<Self> {
        Arc::new(Self {
            txn_id,
            priority,
            ts,
            reason: Mutex::new(WakeReason::Pending),
            wake: Condvar::new(),
        })
    }

    fn wake_with(&self, reason: WakeReason) {
        let mut r = self.reason.lock();
        if *r == WakeReason::Pending {
            *r = reason;
            self.wake.notify_one();
        }
    }
}

struct LockState {
    holder: TxnId,
    strength: LockStrength,
    priority: TxnPriority,
    ts: Timestamp,
    /// Whether the lock was pulled in from a persisted intent rather than
    /// acquired by an in-memory request.
    discovered: bool,
    /// FIFO: the front waiter receives the lock when the holder releases.
    waiters: VecDeque<Arc<Waiter>>,
}

/// Outcome of a push against a conflicting lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The holder was aborted and the lock handed down the queue.
    Aborted(TxnId),
    /// The holder won; the pusher keeps waiting.
    Blocked(TxnId),
}

struct TableState {
    locks: HashMap<Vec<u8>, LockState>,
    /// The key each blocked transaction is queued on. Together with
    /// `locks[key].holder` this is the wait-for relation.
    waiting_on: HashMap<TxnId, Vec<u8>>,
}

impl TableState {
    /// Walk the wait-for chain starting at `start`. Returns the cycle as a
    /// transaction list when the walk revisits one.
    fn find_cycle_from(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut path: Vec<TxnId> = Vec::new();
        let mut txn = start;
        loop {
            if let Some(pos) = path.iter().position(|t| *t == txn) {
                return Some(path[pos..].to_vec());
            }
            path.push(txn);
            let key = self.waiting_on.get(&txn)?;
            let lock = self.locks.get(key)?;
            txn = lock.holder;
        }
    }

    /// Victim policy: abort the youngest (highest id) transaction in the
    /// cycle.
    fn choose_victim(cycle: &[TxnId]) -> TxnId {
        debug_assert!(!cycle.is_empty(), "choose_victim on empty cycle");
        cycle.iter().max_by_key(|t| t.0).copied().unwrap_or(TxnId(0))
    }

    /// Remove `txn` from the queue it waits in, if any.
    fn dequeue(&mut self, txn: TxnId) {
        if let Some(key) = self.waiting_on.remove(&txn) {
            if let Some(lock) = self.locks.get_mut(&key) {
                lock.waiters.retain(|w| w.txn_id != txn);
            }
        }
    }

    /// Wake `victim` as the deadlock victim and remove it from its queue.
    fn abort_waiter(&mut self, victim: TxnId) {
        let Some(key) = self.waiting_on.get(&victim).cloned() else {
            return;
        };
        if let Some(lock) = self.locks.get(&key) {
            if let Some(w) = lock.waiters.iter().find(|w| w.txn_id == victim) {
                w.wake_with(WakeReason::Deadlocked);
            }
        }
        self.dequeue(victim);
    }

    /// Hand a released lock at `key` to its head-of-line waiter. Skips
    /// waiters that were already woken (timed out or aborted) but not yet
    /// dequeued.
    fn grant_next(&mut self, key: &[u8]) {
        let Some(lock) = self.locks.get_mut(key) else {
            return;
        };
        while let Some(next) = lock.waiters.pop_front() {
            let mut reason = next.reason.lock();
            if *reason != WakeReason::Pending {
                continue;
            }
            lock.holder = next.txn_id;
            lock.strength = LockStrength::Exclusive;
            lock.priority = next.priority;
            lock.ts = next.ts;
            lock.discovered = false;
            *reason = WakeReason::Granted;
            next.wake.notify_one();
            drop(reason);
            self.waiting_on.remove(&next.txn_id);
            return;
        }
        // No live waiter: the lock is simply gone.
        self.locks.remove(key);
    }
}

/// Per-range lock table.
pub struct LockTable {
    state: Mutex<TableState>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                locks: HashMap::new(),
                waiting_on: HashMap::new(),
            }),
        }
    }

    /// Acquire an exclusive lock on `key`, queueing FIFO behind the current
    /// holder for up to `timeout`. When queueing closes a wait-for cycle,
    /// the youngest transaction in the cycle is aborted.
    pub fn acquire(
        &self,
        key: &[u8],
        txn_id: TxnId,
        priority: TxnPriority,
        ts: Timestamp,
        timeout: Duration,
    ) -> Result<(), ConcurrencyError> {
        let waiter = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let waiter = match state.locks.entry(key.to_vec()) {
                Entry::Vacant(slot) => {
                    slot.insert(LockState {
                        holder: txn_id,
                        strength: LockStrength::Exclusive,
                        priority,
                        ts,
                        discovered: false,
                        waiters: VecDeque::new(),
                    });
                    return Ok(());
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if existing.holder == txn_id {
                        existing.strength = LockStrength::Exclusive;
                        return Ok(());
                    }
                    let waiter = Waiter::new(txn_id, priority, ts);
                    existing.waiters.push_back(waiter.clone());
                    state.waiting_on.insert(txn_id, key.to_vec());
                    waiter
                }
            };

            // Our new edge may have closed a cycle.
            if let Some(cycle) = state.find_cycle_from(txn_id) {
                let victim = TableState::choose_victim(&cycle);
                if victim == txn_id {
                    state.dequeue(txn_id);
                    return Err(ConcurrencyError::Deadlock { victim });
                }
                // Another transaction in the cycle is cheaper to redo:
                // wake it as the victim and keep waiting ourselves.
                tracing::warn!(?victim, "deadlock cycle detected; aborting victim");
                state.abort_waiter(victim);
            }
            waiter
        };

        let deadline = Instant::now() + timeout;
        let mut reason = waiter.reason.lock();
        loop {
            match *reason {
                WakeReason::Pending => {}
                WakeReason::Granted => return Ok(()),
                WakeReason::Deadlocked => {
                    return Err(ConcurrencyError::Deadlock { victim: txn_id })
                }
                WakeReason::BoundaryChanged => {
                    return Err(ConcurrencyError::RangeBoundaryChanged)
                }
                WakeReason::TimedOut => {
                    return Err(ConcurrencyError::LockWaitTimeout {
                        waited_ms: timeout.as_millis() as u64,
                    })
                }
            }
            let now = Instant::now();
            if now >= deadline {
                // Rendezvous with a concurrent grant: re-check under the
                // table lock before declaring the timeout.
                drop(reason);
                let mut state = self.state.lock();
                reason = waiter.reason.lock();
                if *reason == WakeReason::Granted {
                    return Ok(());
                }
                *reason = WakeReason::TimedOut;
                drop(reason);
                state.dequeue(txn_id);
                return Err(ConcurrencyError::LockWaitTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            waiter.wake.wait_for(&mut reason, deadline - now);
        }
    }

    /// Non-blocking acquisition attempt. Returns the conflicting holder on
    /// failure.
    pub fn try_acquire(
        &self,
        key: &[u8],
        txn_id: TxnId,
        priority: TxnPriority,
        ts: Timestamp,
    ) -> Result<(), TxnId> {
        let mut state = self.state.lock();
        match state.locks.entry(key.to_vec()) {
            Entry::Vacant(slot) => {
                slot.insert(LockState {
                    holder: txn_id,
                    strength: LockStrength::Exclusive,
                    priority,
                    ts,
                    discovered: false,
                    waiters: VecDeque::new(),
                });
                Ok(())
            }
            Entry::Occupied(slot) if slot.get().holder == txn_id => Ok(()),
            Entry::Occupied(slot) => Err(slot.get().holder),
        }
    }

    /// Pull in a persisted intent found by evaluation, so subsequent
    /// requests queue on it like any in-memory lock.
    pub fn discover_intent(&self, key: &[u8], holder: TxnId, ts: Timestamp) {
        let mut state = self.state.lock();
        state.locks.entry(key.to_vec()).or_insert(LockState {
            holder,
            strength: LockStrength::Exclusive,
            priority: TxnPriority::default(),
            ts,
            discovered: true,
            waiters: VecDeque::new(),
        });
    }

    /// Whether `key` currently carries a discovered (persisted) lock.
    pub fn is_discovered(&self, key: &[u8]) -> bool {
        self.state
            .lock()
            .locks
            .get(key)
            .map(|l| l.discovered)
            .unwrap_or(false)
    }

    /// Push the holder of `key`: higher-priority pushers abort the holder;
    /// equal priority falls back to timestamp age (older pusher wins). An
    /// aborted holder's lock goes to the head-of-line waiter.
    pub fn push(
        &self,
        key: &[u8],
        pusher_priority: TxnPriority,
        pusher_ts: Timestamp,
    ) -> Option<PushOutcome> {
        let mut state = self.state.lock();
        let (holder, holder_priority, holder_ts) = {
            let lock = state.locks.get(key)?;
            (lock.holder, lock.priority, lock.ts)
        };
        let wins = pusher_priority > holder_priority
            || (pusher_priority == holder_priority && pusher_ts < holder_ts);
        if wins {
            state.grant_next(key);
            Some(PushOutcome::Aborted(holder))
        } else {
            Some(PushOutcome::Blocked(holder))
        }
    }

    /// Release one key held by `txn_id`; the head-of-line waiter becomes
    /// the holder.
    pub fn release(&self, key: &[u8], txn_id: TxnId) {
        let mut state = self.state.lock();
        let held = state
            .locks
            .get(key)
            .map(|l| l.holder == txn_id)
            .unwrap_or(false);
        if held {
            state.grant_next(key);
        }
    }

    /// Release every lock held by `txn_id` (commit or abort), handing each
    /// to its next waiter. Any queue entry for `txn_id` is dropped too.
    pub fn release_all(&self, txn_id: TxnId) {
        let mut state = self.state.lock();
        state.dequeue(txn_id);
        let held: Vec<Vec<u8>> = state
            .locks
            .iter()
            .filter(|(_, l)| l.holder == txn_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in held {
            state.grant_next(&key);
        }
    }

    /// Signal a range boundary change: all waiters return with a retry
    /// hint pointing them at the new range.
    pub fn notify_boundary_change(&self) {
        let mut state = self.state.lock();
        for lock in state.locks.values_mut() {
            for w in lock.waiters.drain(..) {
                w.wake_with(WakeReason::BoundaryChanged);
            }
        }
        state.waiting_on.clear();
    }

    pub fn holder_of(&self, key: &[u8]) -> Option<TxnId> {
        self.state.lock().locks.get(key).map(|l| l.holder)
    }

    pub fn lock_count(&self) -> usize {
        self.state.lock().locks.len()
    }

    pub fn waiter_count(&self, key: &[u8]) -> usize {
        self.state
            .lock()
            .locks
            .get(key)
            .map(|l| l.waiters.len())
            .unwrap_or(0)
    }

    /// The key `txn_id` is currently queued on, if any.
    pub fn waiting_on(&self, txn_id: TxnId) -> Option<Vec<u8>> {
        self.state.lock().waiting_on.get(&txn_id).cloned()
    }
}
