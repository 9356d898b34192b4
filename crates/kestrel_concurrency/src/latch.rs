//! Span latch manager.
//!
//! A request declares the key spans it will touch and its access mode,
//! then waits until no conflicting latch is held. Read-read does not
//! conflict; any overlap involving a write does. Latches are held for the
//! duration of one request evaluation and are released unconditionally by
//! the RAII guard. The manager is purely in-memory: a crash releases
//! everything implicitly.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use kestrel_common::types::{Span, Timestamp};

/// Access mode a latch is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchAccess {
    Read,
    Write,
}

#[derive(Debug, Clone)]
struct Latch {
    id: u64,
    span: Span,
    access: LatchAccess,
    /// Request timestamp, recorded for diagnostics.
    ts: Timestamp,
}

#[derive(Default)]
struct LatchSet {
    held: Vec<Latch>,
    next_id: u64,
}

impl LatchSet {
    fn conflicts(&self, span: &Span, access: LatchAccess) -> bool {
        self.held.iter().any(|l| {
            (l.access == LatchAccess::Write || access == LatchAccess::Write)
                && l.span.overlaps(span)
        })
    }
}

/// Per-range latch manager.
pub struct LatchManager {
    state: Mutex<LatchSet>,
    released: Condvar,
}

impl Default for LatchManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LatchManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchSet::default()),
            released: Condvar::new(),
        }
    }

    /// Acquire latches over `spans`, blocking until no conflicting latch is
    /// held. Returns a guard that releases them on drop.
    pub fn acquire(
        self: &Arc<Self>,
        spans: Vec<(Span, LatchAccess)>,
        ts: Timestamp,
    ) -> LatchGuard {
        let mut state = self.state.lock();
        loop {
            let blocked = spans
                .iter()
                .any(|(span, access)| state.conflicts(span, *access));
            if !blocked {
                break;
            }
            self.released.wait(&mut state);
        }
        let mut ids = Vec::with_capacity(spans.len());
        for (span, access) in spans {
            let id = state.next_id;
            state.next_id += 1;
            state.held.push(Latch {
                id,
                span,
                access,
                ts,
            });
            ids.push(id);
        }
        LatchGuard {
            manager: self.clone(),
            ids,
        }
    }

    /// Non-blocking variant: `None` when a conflicting latch is held.
    pub fn try_acquire(
        self: &Arc<Self>,
        spans: Vec<(Span, LatchAccess)>,
        ts: Timestamp,
    ) -> Option<LatchGuard> {
        let mut state = self.state.lock();
        if spans
            .iter()
            .any(|(span, access)| state.conflicts(span, *access))
        {
            return None;
        }
        let mut ids = Vec::with_capacity(spans.len());
        for (span, access) in spans {
            let id = state.next_id;
            state.next_id += 1;
            state.held.push(Latch {
                id,
                span,
                access,
                ts,
            });
            ids.push(id);
        }
        Some(LatchGuard {
            manager: self.clone(),
            ids,
        })
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    fn release(&self, ids: &[u64]) {
        let mut state = self.state.lock();
        state.held.retain(|l| !ids.contains(&l.id));
        drop(state);
        self.released.notify_all();
    }
}

/// RAII guard over a set of held latches.
pub struct LatchGuard {
    manager: Arc<LatchManager>,
    ids: Vec<u64>,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.manager.release(&self.ids);
    }
}
