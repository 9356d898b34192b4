//! Merge watcher.
//!
//! On discovering a deletion intent on the local range-descriptor key, the
//! replica installs a merge-complete channel and blocks most requests on
//! it. When the merge transaction commits, the replica flips its destroy
//! status to merge-pending before the channel closes, so unblocked
//! requests observe "range not found"; on abort the channel closes with no
//! state change and requests proceed.

use parking_lot::Mutex;
use tokio::sync::watch;

/// Outcome of an in-progress merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Pending,
    Committed,
    Aborted,
}

pub struct MergeState {
    inner: Mutex<Option<watch::Sender<MergeOutcome>>>,
}

impl Default for MergeState {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Install the merge-complete channel. Idempotent while a merge is in
    /// progress.
    pub fn begin_merge(&self) {
        let mut inner = self.inner.lock();
        if inner.is_none() {
            let (tx, _rx) = watch::channel(MergeOutcome::Pending);
            *inner = Some(tx);
        }
    }

    pub fn in_progress(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Subscribe to the merge outcome; `None` when no merge is in
    /// progress.
    pub fn subscribe(&self) -> Option<watch::Receiver<MergeOutcome>> {
        self.inner.lock().as_ref().map(|tx| tx.subscribe())
    }

    /// Resolve the merge. The caller must update the replica's destroy
    /// status (on commit) before calling this, so waiters observe the new
    /// state when they wake.
    pub fn complete(&self, outcome: MergeOutcome) {
        let mut inner = self.inner.lock();
        if let Some(tx) = inner.take() {
            let _ = tx.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_observe_commit() {
        let merge = MergeState::new();
        merge.begin_merge();
        assert!(merge.in_progress());

        let mut rx = merge.subscribe().unwrap();
        let waiter = tokio::spawn(async move {
            rx.changed().await.unwrap();
            *rx.borrow()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        merge.complete(MergeOutcome::Committed);
        assert_eq!(waiter.await.unwrap(), MergeOutcome::Committed);
        assert!(!merge.in_progress());
    }

    #[tokio::test]
    async fn test_waiters_observe_abort() {
        let merge = MergeState::new();
        merge.begin_merge();
        let mut rx = merge.subscribe().unwrap();
        merge.complete(MergeOutcome::Aborted);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), MergeOutcome::Aborted);
    }

    #[test]
    fn test_no_merge_no_channel() {
        let merge = MergeState::new();
        assert!(!merge.in_progress());
        assert!(merge.subscribe().is_none());
        // Completing without a merge is a no-op.
        merge.complete(MergeOutcome::Aborted);
    }

    #[test]
    fn test_begin_merge_idempotent() {
        let merge = MergeState::new();
        merge.begin_merge();
        let rx1 = merge.subscribe().unwrap();
        merge.begin_merge();
        let rx2 = merge.subscribe().unwrap();
        assert_eq!(*rx1.borrow(), *rx2.borrow());
    }
}
