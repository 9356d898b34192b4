//! Abort span: a per-range cache of aborted transactions.
//!
//! Evaluation checks the cache before acting on behalf of a transaction;
//! a hit forces the transaction to restart at or above the recorded
//! priority floor, preventing anomalous reads after an abort. The replica
//! persists entries under range-local keys and reloads them at startup,
//! so the cache survives restarts.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::error::ConcurrencyError;
use kestrel_common::types::{TxnId, TxnPriority};

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    Pushed,
    Deadlock,
    Timeout,
}

/// One abort span entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortEntry {
    pub txn_id: TxnId,
    pub reason: AbortReason,
    /// The restarted transaction must run at or above this priority.
    pub priority_floor: TxnPriority,
}

/// Per-range abort cache.
pub struct AbortSpan {
    entries: Mutex<HashMap<TxnId, AbortEntry>>,
}

impl Default for AbortSpan {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSpan {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, txn_id: TxnId, reason: AbortReason, priority_floor: TxnPriority) {
        self.entries.lock().insert(
            txn_id,
            AbortEntry {
                txn_id,
                reason,
                priority_floor,
            },
        );
    }

    /// Evaluation-time check: errors when the transaction was aborted here.
    pub fn check(&self, txn_id: TxnId) -> Result<(), ConcurrencyError> {
        if self.entries.lock().contains_key(&txn_id) {
            Err(ConcurrencyError::TxnAborted { txn_id })
        } else {
            Ok(())
        }
    }

    pub fn get(&self, txn_id: TxnId) -> Option<AbortEntry> {
        self.entries.lock().get(&txn_id).cloned()
    }

    /// Drop an entry once the transaction record is garbage collected.
    pub fn clear(&self, txn_id: TxnId) {
        self.entries.lock().remove(&txn_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Export all entries for persistence.
    pub fn to_records(&self) -> Vec<AbortEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// Rebuild from persisted records.
    pub fn from_records(records: Vec<AbortEntry>) -> Self {
        let span = Self::new();
        {
            let mut entries = span.entries.lock();
            for r in records {
                entries.insert(r.txn_id, r);
            }
        }
        span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_forces_restart() {
        let span = AbortSpan::new();
        span.record(TxnId(7), AbortReason::Pushed, TxnPriority(10));
        let err = span.check(TxnId(7)).unwrap_err();
        assert!(matches!(err, ConcurrencyError::TxnAborted { txn_id: TxnId(7) }));
        assert_eq!(span.get(TxnId(7)).unwrap().priority_floor, TxnPriority(10));
    }

    #[test]
    fn test_miss_passes() {
        let span = AbortSpan::new();
        assert!(span.check(TxnId(1)).is_ok());
    }

    #[test]
    fn test_clear_removes_entry() {
        let span = AbortSpan::new();
        span.record(TxnId(7), AbortReason::Deadlock, TxnPriority(0));
        span.clear(TxnId(7));
        assert!(span.check(TxnId(7)).is_ok());
        assert!(span.is_empty());
    }

    #[test]
    fn test_persistence_round_trip() {
        let span = AbortSpan::new();
        span.record(TxnId(1), AbortReason::Pushed, TxnPriority(5));
        span.record(TxnId(2), AbortReason::Timeout, TxnPriority(0));
        let records = span.to_records();
        let restored = AbortSpan::from_records(records);
        assert_eq!(restored.len(), 2);
        assert!(restored.check(TxnId(1)).is_err());
        assert!(restored.check(TxnId(2)).is_err());
        assert!(restored.check(TxnId(3)).is_ok());
    }
}
