//! Per-class work queues.
//!
//! When instantaneous admission fails, work enqueues here and waits for
//! the granter loop. The granter calls `granted` with the grant chain id;
//! the queue hands the tokens to its head-of-line waiter and reports how
//! many were taken; returning 0 declines the grant (the head item was
//! canceled in the meantime).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use kestrel_common::error::AdmissionError;

use crate::store_granter::StoreRequester;

#[derive(Debug, PartialEq, Eq)]
enum WaitOutcome {
    Pending,
    Granted,
    Canceled,
}

struct WaitSlot {
    tokens: i64,
    outcome: Mutex<WaitOutcome>,
    cond: Condvar,
}

struct QueueState {
    waiting: VecDeque<Arc<WaitSlot>>,
}

/// A FIFO admission queue for one work class.
pub struct WorkQueue {
    class_name: &'static str,
    capacity: usize,
    state: Mutex<QueueState>,
    admitted: AtomicU64,
    canceled: AtomicU64,
}

impl WorkQueue {
    pub fn new(class_name: &'static str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            class_name,
            capacity,
            state: Mutex::new(QueueState {
                waiting: VecDeque::new(),
            }),
            admitted: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
        })
    }

    /// Enqueue and block until granted, the timeout elapses, or the queue
    /// is full.
    pub fn enqueue_and_wait(&self, tokens: i64, timeout: Duration) -> Result<(), AdmissionError> {
        let slot = {
            let mut state = self.state.lock();
            if state.waiting.len() >= self.capacity {
                tracing::warn!(
                    class = self.class_name,
                    capacity = self.capacity,
                    "admission queue full"
                );
                return Err(AdmissionError::QueueFull {
                    class: self.class_name,
                });
            }
            let slot = Arc::new(WaitSlot {
                tokens,
                outcome: Mutex::new(WaitOutcome::Pending),
                cond: Condvar::new(),
            });
            state.waiting.push_back(slot.clone());
            slot
        };

        let deadline = Instant::now() + timeout;
        let mut outcome = slot.outcome.lock();
        while *outcome == WaitOutcome::Pending {
            if Instant::now() >= deadline {
                *outcome = WaitOutcome::Canceled;
                drop(outcome);
                self.remove(&slot);
                self.canceled.fetch_add(1, Ordering::Relaxed);
                return Err(AdmissionError::Canceled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            slot.cond.wait_for(&mut outcome, remaining);
        }
        match *outcome {
            WaitOutcome::Granted => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            _ => {
                self.canceled.fetch_add(1, Ordering::Relaxed);
                Err(AdmissionError::Canceled)
            }
        }
    }

    fn remove(&self, slot: &Arc<WaitSlot>) {
        let mut state = self.state.lock();
        state.waiting.retain(|s| !Arc::ptr_eq(s, slot));
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn canceled_count(&self) -> u64 {
        self.canceled.load(Ordering::Relaxed)
    }
}

impl StoreRequester for WorkQueue {
    fn has_waiting_requests(&self) -> bool {
        !self.state.lock().waiting.is_empty()
    }

    fn granted(&self, _grant_chain_id: u64) -> i64 {
        // Pop until a live waiter is found; canceled entries decline.
        loop {
            let slot = {
                let mut state = self.state.lock();
                match state.waiting.pop_front() {
                    Some(s) => s,
                    None => return 0,
                }
            };
            let mut outcome = slot.outcome.lock();
            if *outcome == WaitOutcome::Pending {
                *outcome = WaitOutcome::Granted;
                slot.cond.notify_one();
                return slot.tokens;
            }
            // Head-of-line item was canceled; try the next one.
        }
    }
}
