//! GC threshold enforcement.
//!
//! Reads below the range's GC threshold cannot be served: the versions
//! they would need may already be gone. The effective threshold is the
//! maximum of the persisted threshold and the threshold implied by the TTL,
//! clamped so it never passes a cached protected timestamp.

use parking_lot::Mutex;

use kestrel_common::error::GateError;
use kestrel_common::types::Timestamp;

pub struct GcThresholds {
    /// Threshold recorded in the replicated range state.
    persisted: Mutex<Timestamp>,
    /// Cached protected timestamps the threshold must not pass.
    protected: Mutex<Vec<Timestamp>>,
}

impl Default for GcThresholds {
    fn default() -> Self {
        Self::new()
    }
}

impl GcThresholds {
    pub fn new() -> Self {
        Self {
            persisted: Mutex::new(Timestamp::MIN),
            protected: Mutex::new(Vec::new()),
        }
    }

    pub fn set_persisted(&self, ts: Timestamp) {
        let mut cur = self.persisted.lock();
        cur.forward(ts);
    }

    pub fn protect(&self, ts: Timestamp) {
        self.protected.lock().push(ts);
    }

    pub fn release_protection(&self, ts: Timestamp) {
        let mut protected = self.protected.lock();
        if let Some(pos) = protected.iter().position(|p| *p == ts) {
            protected.remove(pos);
        }
    }

    /// threshold = max(persisted, implied), where the TTL-implied threshold
    /// `now - ttl` is clamped below the oldest protected timestamp.
    pub fn effective(&self, now: Timestamp, ttl_seconds: u64) -> Timestamp {
        let persisted = *self.persisted.lock();
        let mut implied =
            Timestamp::from_wall(now.wall.saturating_sub(ttl_seconds * 1_000_000_000));
        if let Some(min_protected) = self.protected.lock().iter().min() {
            if implied >= *min_protected {
                implied = min_protected.prev();
            }
        }
        persisted.max(implied)
    }

    /// Gate a request timestamp against the threshold. Strict mode rejects
    /// `ts <= threshold`; lax mode (admin or opt-out ranges) rejects only
    /// `ts < threshold`.
    pub fn check_request(
        &self,
        request_ts: Timestamp,
        now: Timestamp,
        ttl_seconds: u64,
        strict: bool,
        excluded_from_backup: bool,
    ) -> Result<(), GateError> {
        let threshold = self.effective(now, ttl_seconds);
        let rejected = if strict {
            request_ts <= threshold
        } else {
            request_ts < threshold
        };
        if rejected {
            Err(GateError::BatchTimestampBeforeGc {
                request_ts,
                threshold,
                excluded_from_backup,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: u64) -> Timestamp {
        Timestamp::from_wall(wall)
    }

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn test_effective_from_ttl() {
        let gc = GcThresholds::new();
        // now = 100s, ttl = 10s → implied threshold 90s.
        assert_eq!(gc.effective(ts(100 * SEC), 10), ts(90 * SEC));
    }

    #[test]
    fn test_persisted_wins_when_higher() {
        let gc = GcThresholds::new();
        gc.set_persisted(ts(95 * SEC));
        assert_eq!(gc.effective(ts(100 * SEC), 10), ts(95 * SEC));
    }

    #[test]
    fn test_persisted_never_regresses() {
        let gc = GcThresholds::new();
        gc.set_persisted(ts(50));
        gc.set_persisted(ts(40));
        assert_eq!(gc.effective(ts(60), u64::MAX / SEC), ts(50));
    }

    #[test]
    fn test_protected_timestamp_pins_threshold() {
        let gc = GcThresholds::new();
        gc.protect(ts(85 * SEC));
        // Implied would be 90s but protection pins it just below 85s.
        let eff = gc.effective(ts(100 * SEC), 10);
        assert!(eff < ts(85 * SEC));
        gc.release_protection(ts(85 * SEC));
        assert_eq!(gc.effective(ts(100 * SEC), 10), ts(90 * SEC));
    }

    #[test]
    fn test_strict_rejects_at_threshold() {
        let gc = GcThresholds::new();
        gc.set_persisted(ts(90 * SEC));
        let err = gc
            .check_request(ts(90 * SEC), ts(100 * SEC), 1000, true, false)
            .unwrap_err();
        assert!(matches!(err, GateError::BatchTimestampBeforeGc { .. }));
        // Lax mode admits a read exactly at the threshold.
        gc.check_request(ts(90 * SEC), ts(100 * SEC), 1000, false, false)
            .unwrap();
    }

    #[test]
    fn test_reads_above_threshold_pass() {
        let gc = GcThresholds::new();
        gc.set_persisted(ts(90 * SEC));
        gc.check_request(ts(91 * SEC), ts(100 * SEC), 1000, true, false)
            .unwrap();
    }

    #[test]
    fn test_backup_exclusion_flag_carried() {
        let gc = GcThresholds::new();
        gc.set_persisted(ts(90 * SEC));
        let err = gc
            .check_request(ts(10 * SEC), ts(100 * SEC), 1000, true, true)
            .unwrap_err();
        match err {
            GateError::BatchTimestampBeforeGc {
                excluded_from_backup,
                ..
            } => assert!(excluded_from_backup),
            other => panic!("unexpected {other:?}"),
        }
    }
}
