//! Store IO and disk-bandwidth token granter.
//!
//! Two IO buckets per store, regular and elastic: every admission deducts
//! from both, regular work blocks only on the regular bucket, and elastic
//! work blocks when either bucket (or the disk-write bucket) is empty.
//! Snapshot ingests bypass L0 and consume only disk-write tokens, without
//! the write-amplification model.
//!
//! Buckets run on burst tokens refilled by `set_available_tokens`:
//! negative balances from over-admission carry forward, and on the last
//! tick of an adjustment interval the elastic bucket is clamped into
//! `[0, regular]` and the disk-write bucket to `>= 0` (dropping pending
//! negative accounting, at the cost of one tick of mild over-admission).
//!
//! Grant ordering is regular → snapshot-ingest → elastic. Requester
//! callbacks run while the granter mutex is held; requesters must not take
//! locks that can close back on the granter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use kestrel_common::types::{StoreWorkType, WorkClass, NUM_STORE_WORK_TYPES, NUM_WORK_CLASSES};

use crate::linear_model::TokensLinearModel;

/// Actual byte counts reported after replicated work completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreWorkDoneInfo {
    pub write_bytes: i64,
    pub ingested_bytes: i64,
}

/// Cumulative device-level byte counters sampled per interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// The requester side of the store granter.
pub trait StoreRequester: Send + Sync {
    fn has_waiting_requests(&self) -> bool;
    /// Take tokens for the head-of-line request; returning 0 declines.
    fn granted(&self, grant_chain_id: u64) -> i64;
}

struct StoreState {
    available_io_tokens: [i64; NUM_WORK_CLASSES],
    elastic_io_tokens_used_by_elastic: i64,
    disk_write_tokens: i64,
    disk_write_tokens_already_deducted: i64,
    disk_read_tokens_already_deducted: i64,
    prev_observed_writes: u64,
    prev_observed_reads: u64,
    disk_tokens_used: [i64; NUM_STORE_WORK_TYPES],
    exhausted_start: [Option<Instant>; NUM_WORK_CLASSES],
    starting_io_tokens: i64,
    l0_write_lm: TokensLinearModel,
    l0_ingest_lm: TokensLinearModel,
    ingest_lm: TokensLinearModel,
    write_amp_lm: TokensLinearModel,
}

pub struct StoreTokenGranter {
    mu: Mutex<StoreState>,
    requesters: Mutex<[Option<Arc<dyn StoreRequester>>; NUM_STORE_WORK_TYPES]>,
    io_tokens_exhausted_micros: [AtomicU64; NUM_WORK_CLASSES],
    tokens_taken: AtomicU64,
    tokens_returned: AtomicU64,
}

impl Default for StoreTokenGranter {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreTokenGranter {
    pub fn new() -> Self {
        Self {
            mu: Mutex::new(StoreState {
                available_io_tokens: [0; NUM_WORK_CLASSES],
                elastic_io_tokens_used_by_elastic: 0,
                disk_write_tokens: 0,
                disk_write_tokens_already_deducted: 0,
                disk_read_tokens_already_deducted: 0,
                prev_observed_writes: 0,
                prev_observed_reads: 0,
                disk_tokens_used: [0; NUM_STORE_WORK_TYPES],
                exhausted_start: [None; NUM_WORK_CLASSES],
                starting_io_tokens: 0,
                l0_write_lm: TokensLinearModel::default(),
                l0_ingest_lm: TokensLinearModel::default(),
                ingest_lm: TokensLinearModel::default(),
                write_amp_lm: TokensLinearModel::default(),
            }),
            requesters: Mutex::new([None, None, None]),
            io_tokens_exhausted_micros: [AtomicU64::new(0), AtomicU64::new(0)],
            tokens_taken: AtomicU64::new(0),
            tokens_returned: AtomicU64::new(0),
        }
    }

    pub fn set_requester(&self, wt: StoreWorkType, requester: Arc<dyn StoreRequester>) {
        self.requesters.lock()[wt.index()] = Some(requester);
    }

    pub fn set_linear_models(
        &self,
        l0_write_lm: TokensLinearModel,
        l0_ingest_lm: TokensLinearModel,
        ingest_lm: TokensLinearModel,
        write_amp_lm: TokensLinearModel,
    ) {
        let mut mu = self.mu.lock();
        mu.l0_write_lm = l0_write_lm;
        mu.l0_ingest_lm = l0_ingest_lm;
        mu.ingest_lm = ingest_lm;
        mu.write_amp_lm = write_amp_lm;
    }

    // ── Admission ───────────────────────────────────────────────────────

    pub fn try_get(&self, wt: StoreWorkType, count: i64) -> bool {
        let mut mu = self.mu.lock();
        self.try_get_locked(&mut mu, wt, count)
    }

    fn try_get_locked(&self, mu: &mut StoreState, wt: StoreWorkType, count: i64) -> bool {
        // Snapshot ingests skip the write-amp model: their sstables land
        // below L0 and incur no extra amplification.
        let disk_write_tokens = if wt == StoreWorkType::SnapshotIngest {
            count
        } else {
            mu.write_amp_lm.apply(count)
        };
        match wt {
            StoreWorkType::Regular => {
                if mu.available_io_tokens[WorkClass::Regular.index()] > 0 {
                    self.subtract_io_tokens_locked(mu, count, count, false);
                    mu.disk_write_tokens -= disk_write_tokens;
                    mu.disk_write_tokens_already_deducted += disk_write_tokens;
                    mu.disk_tokens_used[wt.index()] += disk_write_tokens;
                    return true;
                }
            }
            StoreWorkType::Elastic => {
                if mu.disk_write_tokens > 0
                    && mu.available_io_tokens[WorkClass::Regular.index()] > 0
                    && mu.available_io_tokens[WorkClass::Elastic.index()] > 0
                {
                    self.subtract_io_tokens_locked(mu, count, count, false);
                    mu.elastic_io_tokens_used_by_elastic += count;
                    mu.disk_write_tokens -= disk_write_tokens;
                    mu.disk_write_tokens_already_deducted += disk_write_tokens;
                    mu.disk_tokens_used[wt.index()] += disk_write_tokens;
                    return true;
                }
            }
            StoreWorkType::SnapshotIngest => {
                if mu.disk_write_tokens > 0 {
                    mu.disk_write_tokens -= disk_write_tokens;
                    mu.disk_write_tokens_already_deducted += disk_write_tokens;
                    mu.disk_tokens_used[wt.index()] += disk_write_tokens;
                    return true;
                }
            }
        }
        false
    }

    pub fn return_grant(&self, wt: StoreWorkType, count: i64) {
        {
            let mut mu = self.mu.lock();
            self.subtract_for_work_type_locked(&mut mu, wt, -count);
        }
        // Tokens came back: try granting to waiters.
        self.try_grant();
    }

    pub fn took_without_permission(&self, wt: StoreWorkType, count: i64) {
        let mut mu = self.mu.lock();
        self.subtract_for_work_type_locked(&mut mu, wt, count);
    }

    fn subtract_for_work_type_locked(&self, mu: &mut StoreState, wt: StoreWorkType, count: i64) {
        if wt != StoreWorkType::SnapshotIngest {
            self.subtract_io_tokens_locked(mu, count, count, false);
        }
        if wt == StoreWorkType::Elastic {
            mu.elastic_io_tokens_used_by_elastic += count;
        }
        let disk_count = if wt == StoreWorkType::SnapshotIngest {
            count
        } else {
            mu.write_amp_lm.apply(count)
        };
        mu.disk_write_tokens -= disk_count;
        mu.disk_write_tokens_already_deducted += disk_count;
        mu.disk_tokens_used[wt.index()] += disk_count;
    }

    /// Subtract from both IO buckets (negative adds). Exhaustion metrics
    /// are stamped on the zero-crossing transitions.
    fn subtract_io_tokens_locked(
        &self,
        mu: &mut StoreState,
        count: i64,
        elastic_count: i64,
        setting_available: bool,
    ) {
        self.subtract_for_class_locked(mu, WorkClass::Regular, count, setting_available);
        self.subtract_for_class_locked(mu, WorkClass::Elastic, elastic_count, setting_available);
        if !setting_available {
            if count > 0 {
                self.tokens_taken.fetch_add(count as u64, Ordering::Relaxed);
            } else {
                self.tokens_returned
                    .fetch_add((-count) as u64, Ordering::Relaxed);
            }
        }
    }

    fn subtract_for_class_locked(
        &self,
        mu: &mut StoreState,
        wc: WorkClass,
        count: i64,
        setting_available: bool,
    ) {
        let idx = wc.index();
        let avail = mu.available_io_tokens[idx];
        mu.available_io_tokens[idx] -= count;
        if count > 0 && avail > 0 && mu.available_io_tokens[idx] <= 0 {
            mu.exhausted_start[idx] = Some(Instant::now());
        } else if count < 0 && avail <= 0 && (mu.available_io_tokens[idx] > 0 || setting_available)
        {
            if let Some(start) = mu.exhausted_start[idx] {
                self.io_tokens_exhausted_micros[idx]
                    .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
            }
            mu.exhausted_start[idx] = if mu.available_io_tokens[idx] <= 0 {
                Some(Instant::now())
            } else {
                None
            };
        }
    }

    // ── Completion corrections ──────────────────────────────────────────

    /// Late correction once actual LSM byte counts are known. Applies the
    /// L0-write/L0-ingest models against the original estimate and the
    /// write-amp model against the disk bucket; on an exhausted →
    /// non-exhausted transition the granter may admit another waiter.
    pub fn store_replicated_work_admitted(
        &self,
        wt: StoreWorkType,
        original_tokens: i64,
        info: StoreWorkDoneInfo,
        can_grant_another: bool,
    ) -> i64 {
        let additional = {
            let mut mu = self.mu.lock();
            let wc = wt.work_class();
            let exhausted = |mu: &StoreState| {
                mu.available_io_tokens[WorkClass::Regular.index()] <= 0
                    || (wc == WorkClass::Elastic
                        && (mu.disk_write_tokens <= 0
                            || mu.available_io_tokens[WorkClass::Elastic.index()] <= 0))
            };
            let was_exhausted = exhausted(&mu);

            let actual_l0_write = mu.l0_write_lm.apply(info.write_bytes);
            let actual_l0_ingest = mu.l0_ingest_lm.apply(info.ingested_bytes);
            let actual_l0 = actual_l0_write + actual_l0_ingest;
            let additional_l0 = actual_l0 - original_tokens;
            self.subtract_io_tokens_locked(&mut mu, additional_l0, additional_l0, false);
            if wt == StoreWorkType::Elastic {
                mu.elastic_io_tokens_used_by_elastic += additional_l0;
            }

            let ingest_into_lsm = mu.ingest_lm.apply(info.ingested_bytes);
            let total_into_lsm = actual_l0_write + ingest_into_lsm;
            let actual_disk = mu.write_amp_lm.apply(total_into_lsm);
            let original_disk = mu.write_amp_lm.apply(original_tokens);
            let additional_disk = actual_disk - original_disk;
            mu.disk_write_tokens -= additional_disk;
            mu.disk_tokens_used[wt.index()] += additional_disk;

            if can_grant_another && additional_l0 < 0 && was_exhausted && !exhausted(&mu) {
                drop(mu);
                self.try_grant();
            }
            additional_l0
        };
        additional
    }

    /// Account for reads and writes observed on the device in excess of
    /// tokens already deducted; the overshoot comes out of the write
    /// bucket, and the deducted counters reset for the next interval.
    pub fn adjust_disk_token_error(&self, stats: DiskStats) {
        let mut mu = self.mu.lock();
        let int_writes = stats.bytes_written.wrapping_sub(mu.prev_observed_writes) as i64;
        let int_reads = stats.bytes_read.wrapping_sub(mu.prev_observed_reads) as i64;

        let write_error = int_writes - mu.disk_write_tokens_already_deducted;
        if write_error > 0 {
            mu.disk_write_tokens -= write_error;
        }
        let read_error = int_reads - mu.disk_read_tokens_already_deducted;
        if read_error > 0 {
            mu.disk_write_tokens -= read_error;
        }
        mu.disk_write_tokens_already_deducted = 0;
        mu.disk_read_tokens_already_deducted = 0;
        mu.prev_observed_writes = stats.bytes_written;
        mu.prev_observed_reads = stats.bytes_read;
    }

    // ── Refill ──────────────────────────────────────────────────────────

    /// Periodic tick: add tokens up to the capacities, remembering
    /// over-allocation as negative balances. On the last tick of the
    /// interval the elastic bucket clamps into `[0, regular]` and the
    /// disk-write bucket to `>= 0`.
    #[allow(clippy::too_many_arguments)]
    pub fn set_available_tokens(
        &self,
        io_tokens: i64,
        elastic_io_tokens: i64,
        disk_write_tokens: i64,
        disk_read_tokens: i64,
        io_token_capacity: i64,
        elastic_io_token_capacity: i64,
        disk_write_tokens_capacity: i64,
        last_tick: bool,
    ) -> (i64, i64) {
        let granted_any = {
            let mut mu = self.mu.lock();
            let io_tokens_used =
                mu.starting_io_tokens - mu.available_io_tokens[WorkClass::Regular.index()];
            let io_tokens_used_by_elastic = mu.elastic_io_tokens_used_by_elastic;
            mu.elastic_io_tokens_used_by_elastic = 0;

            self.subtract_io_tokens_locked(&mut mu, -io_tokens, -elastic_io_tokens, true);
            let reg = WorkClass::Regular.index();
            let ela = WorkClass::Elastic.index();
            if mu.available_io_tokens[reg] > io_token_capacity {
                mu.available_io_tokens[reg] = io_token_capacity;
            }
            if mu.available_io_tokens[ela] > elastic_io_token_capacity {
                mu.available_io_tokens[ela] = elastic_io_token_capacity;
            }
            // The elastic bucket can run deeply negative because regular
            // work deducts from it without blocking. Deficits reset on the
            // last tick rather than accumulating forever.
            if last_tick {
                mu.available_io_tokens[ela] = mu.available_io_tokens[ela].max(0);
                mu.available_io_tokens[ela] =
                    mu.available_io_tokens[ela].min(mu.available_io_tokens[reg]);
                mu.disk_write_tokens = mu.disk_write_tokens.max(0);
            }
            mu.starting_io_tokens = mu.available_io_tokens[reg];

            mu.disk_write_tokens += disk_write_tokens;
            if mu.disk_write_tokens > disk_write_tokens_capacity {
                mu.disk_write_tokens = disk_write_tokens_capacity;
            }
            // Read tokens are only consumed by the error accounting loop;
            // they act as burst capacity for the interval.
            mu.disk_read_tokens_already_deducted += disk_read_tokens;

            (io_tokens_used, io_tokens_used_by_elastic)
        };
        // Fresh tokens may unblock waiters.
        self.try_grant();
        granted_any
    }

    /// Disk tokens consumed per work type since the last call.
    pub fn disk_tokens_used_and_reset(&self) -> [i64; NUM_STORE_WORK_TYPES] {
        let mut mu = self.mu.lock();
        let used = mu.disk_tokens_used;
        mu.disk_tokens_used = [0; NUM_STORE_WORK_TYPES];
        used
    }

    // ── Granting ────────────────────────────────────────────────────────

    fn requester_has_waiting(&self) -> bool {
        let requesters = self.requesters.lock();
        requesters
            .iter()
            .flatten()
            .any(|r| r.has_waiting_requests())
    }

    /// Grant to as many waiting requests as tokens allow.
    pub fn try_grant(&self) {
        while self.requester_has_waiting() && self.try_grant_one() {}
    }

    /// Priority order: regular, then snapshot ingest (rebalance and
    /// up-replication outrank other background writes), then elastic.
    fn try_grant_one(&self) -> bool {
        let requesters = self.requesters.lock();
        for wt in [
            StoreWorkType::Regular,
            StoreWorkType::SnapshotIngest,
            StoreWorkType::Elastic,
        ] {
            let Some(req) = requesters[wt.index()].as_ref() else {
                continue;
            };
            if !req.has_waiting_requests() {
                continue;
            }
            let mut mu = self.mu.lock();
            if self.try_get_locked(&mut mu, wt, 1) {
                drop(mu);
                let took = req.granted(0);
                if took == 0 {
                    // Declined: the head-of-line item changed.
                    let mut mu = self.mu.lock();
                    self.subtract_for_work_type_locked(&mut mu, wt, -1);
                    continue;
                }
                if took > 1 {
                    let mut mu = self.mu.lock();
                    self.subtract_for_work_type_locked(&mut mu, wt, took - 1);
                }
                return true;
            } else {
                // No tokens for this class; lower classes cannot do better.
                return false;
            }
        }
        false
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn available_io_tokens(&self, wc: WorkClass) -> i64 {
        self.mu.lock().available_io_tokens[wc.index()]
    }

    pub fn available_disk_write_tokens(&self) -> i64 {
        self.mu.lock().disk_write_tokens
    }

    pub fn exhausted_micros(&self, wc: WorkClass) -> u64 {
        self.io_tokens_exhausted_micros[wc.index()].load(Ordering::Relaxed)
    }

    pub fn tokens_taken(&self) -> u64 {
        self.tokens_taken.load(Ordering::Relaxed)
    }

    pub fn tokens_returned(&self) -> u64 {
        self.tokens_returned.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn granter_with_tokens(io: i64, elastic: i64, disk: i64) -> StoreTokenGranter {
        let g = StoreTokenGranter::new();
        g.set_available_tokens(io, elastic, disk, 0, io, elastic, disk, false);
        g
    }

    #[test]
    fn test_regular_deducts_both_buckets() {
        let g = granter_with_tokens(100, 50, 1000);
        assert!(g.try_get(StoreWorkType::Regular, 30));
        assert_eq!(g.available_io_tokens(WorkClass::Regular), 70);
        assert_eq!(g.available_io_tokens(WorkClass::Elastic), 20);
    }

    #[test]
    fn test_regular_blocks_only_on_regular_bucket() {
        let g = granter_with_tokens(100, 50, 1000);
        // Drain elastic deeply negative via regular work.
        assert!(g.try_get(StoreWorkType::Regular, 80));
        assert!(g.try_get(StoreWorkType::Regular, 15));
        assert!(g.available_io_tokens(WorkClass::Elastic) < 0);
        // Regular still admits while its own bucket is positive.
        assert!(g.try_get(StoreWorkType::Regular, 3));
        // Elastic is blocked by its own bucket.
        assert!(!g.try_get(StoreWorkType::Elastic, 1));
    }

    #[test]
    fn test_elastic_blocks_on_any_empty_bucket() {
        let g = granter_with_tokens(0, 100, 1000);
        assert!(
            !g.try_get(StoreWorkType::Elastic, 1),
            "regular bucket empty blocks elastic"
        );
        let g = granter_with_tokens(100, 0, 1000);
        assert!(!g.try_get(StoreWorkType::Elastic, 1));
        let g = granter_with_tokens(100, 100, 0);
        assert!(!g.try_get(StoreWorkType::Elastic, 1));
        let g = granter_with_tokens(100, 100, 1000);
        assert!(g.try_get(StoreWorkType::Elastic, 1));
    }

    #[test]
    fn test_snapshot_ingest_uses_only_disk_tokens() {
        let g = granter_with_tokens(0, 0, 500);
        assert!(g.try_get(StoreWorkType::SnapshotIngest, 200));
        assert_eq!(g.available_disk_write_tokens(), 300);
        assert_eq!(g.available_io_tokens(WorkClass::Regular), 0);
    }

    #[test]
    fn test_write_amp_model_applied_at_admission() {
        let g = granter_with_tokens(1000, 1000, 1000);
        g.set_linear_models(
            TokensLinearModel::default(),
            TokensLinearModel::default(),
            TokensLinearModel::default(),
            TokensLinearModel::new(10.0, 1),
        );
        assert!(g.try_get(StoreWorkType::Regular, 50));
        // Disk bucket pays 10*50+1 = 501; IO bucket pays 50.
        assert_eq!(g.available_disk_write_tokens(), 1000 - 501);
        assert_eq!(g.available_io_tokens(WorkClass::Regular), 950);
    }

    #[test]
    fn test_snapshot_ingest_skips_write_amp() {
        let g = granter_with_tokens(1000, 1000, 1000);
        g.set_linear_models(
            TokensLinearModel::default(),
            TokensLinearModel::default(),
            TokensLinearModel::default(),
            TokensLinearModel::new(10.0, 1),
        );
        assert!(g.try_get(StoreWorkType::SnapshotIngest, 50));
        assert_eq!(g.available_disk_write_tokens(), 950);
    }

    #[test]
    fn test_negative_balance_carries_into_refill() {
        let g = granter_with_tokens(10, 10, 100);
        assert!(g.try_get(StoreWorkType::Regular, 50)); // burst overshoot
        assert_eq!(g.available_io_tokens(WorkClass::Regular), -40);
        // Refill remembers the deficit.
        g.set_available_tokens(30, 30, 0, 0, 1000, 1000, 1000, false);
        assert_eq!(g.available_io_tokens(WorkClass::Regular), -10);
    }

    #[test]
    fn test_last_tick_clamps_elastic_and_disk() {
        let g = granter_with_tokens(10, 10, 100);
        assert!(g.try_get(StoreWorkType::Regular, 60));
        assert!(g.available_io_tokens(WorkClass::Elastic) < 0);
        assert!(g.available_disk_write_tokens() < 100);

        g.set_available_tokens(100, 0, 0, 0, 1000, 1000, 1000, true);
        let ela = g.available_io_tokens(WorkClass::Elastic);
        let reg = g.available_io_tokens(WorkClass::Regular);
        assert!(ela >= 0, "elastic floor at 0 on last tick");
        assert!(ela <= reg, "elastic no higher than regular");
        assert!(g.available_disk_write_tokens() >= 0);
    }

    #[test]
    fn test_late_correction_debits_underestimate() {
        let g = granter_with_tokens(1000, 1000, 10_000);
        assert!(g.try_get(StoreWorkType::Regular, 100));
        let before = g.available_io_tokens(WorkClass::Regular);
        // The work actually wrote 300 bytes: 200 extra tokens are debited.
        let additional = g.store_replicated_work_admitted(
            StoreWorkType::Regular,
            100,
            StoreWorkDoneInfo {
                write_bytes: 300,
                ingested_bytes: 0,
            },
            true,
        );
        assert_eq!(additional, 200);
        assert_eq!(g.available_io_tokens(WorkClass::Regular), before - 200);
    }

    #[test]
    fn test_late_correction_credits_overestimate() {
        let g = granter_with_tokens(1000, 1000, 10_000);
        assert!(g.try_get(StoreWorkType::Regular, 500));
        let additional = g.store_replicated_work_admitted(
            StoreWorkType::Regular,
            500,
            StoreWorkDoneInfo {
                write_bytes: 100,
                ingested_bytes: 0,
            },
            true,
        );
        assert_eq!(additional, -400);
        assert_eq!(g.available_io_tokens(WorkClass::Regular), 900);
    }

    #[test]
    fn test_disk_error_accounting_subtracts_overshoot() {
        let g = granter_with_tokens(1000, 1000, 1000);
        assert!(g.try_get(StoreWorkType::Regular, 100));
        // Device observed 250 written + 60 read; 100 write tokens were
        // deducted, no read tokens allocated → error = 150 + 60.
        g.adjust_disk_token_error(DiskStats {
            bytes_read: 60,
            bytes_written: 250,
        });
        assert_eq!(g.available_disk_write_tokens(), 1000 - 100 - 150 - 60);
        // Counters reset: an identical next interval observes deltas only.
        g.adjust_disk_token_error(DiskStats {
            bytes_read: 60,
            bytes_written: 250,
        });
        assert_eq!(g.available_disk_write_tokens(), 1000 - 100 - 150 - 60);
    }

    #[test]
    fn test_token_conservation_without_ticks() {
        let g = granter_with_tokens(1000, 1000, 10_000);
        let initial = g.available_io_tokens(WorkClass::Regular);
        assert!(g.try_get(StoreWorkType::Regular, 100));
        g.took_without_permission(StoreWorkType::Regular, 70);
        g.return_grant(StoreWorkType::Regular, 30);
        let taken = g.tokens_taken() as i64;
        let returned = g.tokens_returned() as i64;
        assert_eq!(
            initial - g.available_io_tokens(WorkClass::Regular),
            taken - returned
        );
    }

    #[test]
    fn test_exhaustion_micros_accumulate() {
        let g = granter_with_tokens(10, 10, 100);
        assert!(g.try_get(StoreWorkType::Regular, 10));
        assert!(g.available_io_tokens(WorkClass::Regular) <= 0);
        std::thread::sleep(std::time::Duration::from_millis(15));
        g.return_grant(StoreWorkType::Regular, 10);
        assert!(g.exhausted_micros(WorkClass::Regular) >= 10_000);
    }

    // A queue that records grants.
    struct RecordingQueue {
        waiting: PlMutex<i64>,
        admitted: PlMutex<Vec<&'static str>>,
        label: &'static str,
    }

    impl RecordingQueue {
        fn new(label: &'static str, waiting: i64) -> Arc<Self> {
            Arc::new(Self {
                waiting: PlMutex::new(waiting),
                admitted: PlMutex::new(Vec::new()),
                label,
            })
        }
    }

    impl StoreRequester for RecordingQueue {
        fn has_waiting_requests(&self) -> bool {
            *self.waiting.lock() > 0
        }

        fn granted(&self, _chain: u64) -> i64 {
            let mut w = self.waiting.lock();
            if *w == 0 {
                return 0;
            }
            *w -= 1;
            self.admitted.lock().push(self.label);
            1
        }
    }

    #[test]
    fn test_elastic_starvation_avoidance_scenario() {
        // Regular bucket at 0, elastic at +100: the regular request queues,
        // the elastic request is blocked (regular bucket ≤ 0). After a tick
        // replenishes both, the regular admits first.
        let g = StoreTokenGranter::new();
        g.set_available_tokens(0, 100, 1000, 0, 1000, 1000, 1000, false);
        assert!(!g.try_get(StoreWorkType::Regular, 1), "regular queues");
        assert!(!g.try_get(StoreWorkType::Elastic, 1), "elastic blocked");

        let regular = RecordingQueue::new("regular", 1);
        let elastic = RecordingQueue::new("elastic", 1);
        g.set_requester(StoreWorkType::Regular, regular.clone());
        g.set_requester(StoreWorkType::Elastic, elastic.clone());

        // The tick replenishes both buckets and drives the grant loop,
        // which serves the regular waiter before the elastic one.
        g.set_available_tokens(10, 10, 1000, 0, 1000, 1000, 1000, false);
        assert_eq!(*regular.admitted.lock(), vec!["regular"]);
        assert_eq!(*elastic.admitted.lock(), vec!["elastic"]);
    }

    #[test]
    fn test_grant_priority_regular_snapshot_elastic() {
        let g = StoreTokenGranter::new();
        let regular = RecordingQueue::new("regular", 1);
        let snapshot = RecordingQueue::new("snapshot", 1);
        let elastic = RecordingQueue::new("elastic", 1);
        g.set_requester(StoreWorkType::Regular, regular.clone());
        g.set_requester(StoreWorkType::SnapshotIngest, snapshot.clone());
        g.set_requester(StoreWorkType::Elastic, elastic.clone());

        // Plenty of everything: all three admit, regular first.
        g.set_available_tokens(100, 100, 1000, 0, 1000, 1000, 1000, false);
        assert_eq!(regular.admitted.lock().len(), 1);
        assert_eq!(snapshot.admitted.lock().len(), 1);
        assert_eq!(elastic.admitted.lock().len(), 1);
    }

    #[test]
    fn test_declined_grant_returns_tokens() {
        struct Decliner {
            waiting_polls: PlMutex<i64>,
        }
        impl StoreRequester for Decliner {
            fn has_waiting_requests(&self) -> bool {
                let mut w = self.waiting_polls.lock();
                if *w > 0 {
                    *w -= 1;
                    true
                } else {
                    false
                }
            }
            fn granted(&self, _chain: u64) -> i64 {
                0
            }
        }
        let g = StoreTokenGranter::new();
        g.set_requester(
            StoreWorkType::Regular,
            Arc::new(Decliner {
                waiting_polls: PlMutex::new(2),
            }),
        );
        g.set_available_tokens(100, 100, 1000, 0, 1000, 1000, 1000, false);
        // Declined grants return their token; the bucket is unchanged.
        assert_eq!(g.available_io_tokens(WorkClass::Regular), 100);
    }
}
