//! Closed timestamps.
//!
//! A closed timestamp is a promise that no future write to the range will
//! carry a timestamp at or below it, enabling follower reads. Updates
//! arrive through raft commands and through an out-of-band side transport.
//! Published values are monotonic under a lease; across lease changes a
//! new holder must not publish below a predecessor's value for the same
//! lease-applied index.

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::Mutex;

use kestrel_common::types::{LeaseSequence, NodeId, RangeId, Timestamp};

/// Closed-timestamp policy for a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedTsPolicy {
    /// Trail the present by the configured target duration.
    LagBySetting,
    /// Lead the present so global reads never block; the bucket reflects
    /// observed round-trip latencies to the farthest replica.
    LeadForGlobalReads(LatencyBucket),
}

/// Coarse latency buckets for the lead-for-global-reads policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LatencyBucket {
    Under50Ms,
    Under150Ms,
    Under400Ms,
    Over400Ms,
}

impl LatencyBucket {
    pub fn from_rtt_ms(rtt_ms: u64) -> Self {
        match rtt_ms {
            0..=49 => LatencyBucket::Under50Ms,
            50..=149 => LatencyBucket::Under150Ms,
            150..=399 => LatencyBucket::Under400Ms,
            _ => LatencyBucket::Over400Ms,
        }
    }

    /// Lead applied to the present for this bucket, in nanoseconds.
    pub fn lead_nanos(self) -> u64 {
        match self {
            LatencyBucket::Under50Ms => 150_000_000,
            LatencyBucket::Under150Ms => 450_000_000,
            LatencyBucket::Under400Ms => 1_200_000_000,
            LatencyBucket::Over400Ms => 2_400_000_000,
        }
    }
}

/// Recompute the policy bucket from a node → round-trip-time map. The
/// slowest replica dictates the bucket; an empty map keeps the lag policy.
pub fn refresh_policy(global_reads: bool, latencies: &HashMap<NodeId, u64>) -> ClosedTsPolicy {
    if !global_reads {
        return ClosedTsPolicy::LagBySetting;
    }
    let max_rtt = latencies.values().copied().max().unwrap_or(0);
    ClosedTsPolicy::LeadForGlobalReads(LatencyBucket::from_rtt_ms(max_rtt))
}

/// The target closed timestamp for new writes under a policy.
pub fn target_closed_timestamp(
    now: Timestamp,
    policy: ClosedTsPolicy,
    target_duration_nanos: u64,
) -> Timestamp {
    match policy {
        ClosedTsPolicy::LagBySetting => {
            Timestamp::from_wall(now.wall.saturating_sub(target_duration_nanos))
        }
        ClosedTsPolicy::LeadForGlobalReads(bucket) => {
            Timestamp::from_wall(now.wall + bucket.lead_nanos())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Published {
    ts: Timestamp,
    lease_applied_index: u64,
    lease_seq: LeaseSequence,
}

/// Per-range closed-timestamp tracker.
pub struct ClosedTimestampTracker {
    published: Mutex<Option<Published>>,
}

impl Default for ClosedTimestampTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ClosedTimestampTracker {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(None),
        }
    }

    /// Publish `(ts, lai)` under `lease_seq`. Returns whether the update
    /// was accepted.
    ///
    /// Same lease: the timestamp must not regress. New lease: the holder
    /// must not publish below the predecessor's value unless it has also
    /// advanced past the predecessor's lease-applied index.
    pub fn try_publish(
        &self,
        ts: Timestamp,
        lease_applied_index: u64,
        lease_seq: LeaseSequence,
    ) -> bool {
        let mut published = self.published.lock();
        match *published {
            None => {
                *published = Some(Published {
                    ts,
                    lease_applied_index,
                    lease_seq,
                });
                true
            }
            Some(cur) => {
                let accept = if lease_seq == cur.lease_seq {
                    ts >= cur.ts
                } else if lease_seq > cur.lease_seq {
                    ts >= cur.ts || lease_applied_index > cur.lease_applied_index
                } else {
                    false
                };
                if accept {
                    *published = Some(Published {
                        ts: ts.max(cur.ts),
                        lease_applied_index: lease_applied_index.max(cur.lease_applied_index),
                        lease_seq,
                    });
                }
                accept
            }
        }
    }

    /// Highest published closed timestamp.
    pub fn closed(&self) -> Option<(Timestamp, u64)> {
        self.published
            .lock()
            .map(|p| (p.ts, p.lease_applied_index))
    }

    /// Whether a read at `ts` is covered for follower reads.
    pub fn covers(&self, ts: Timestamp) -> bool {
        self.published.lock().map(|p| ts <= p.ts).unwrap_or(false)
    }
}

/// Out-of-band closed-timestamp transport: carries `(ts, lai)` updates
/// faster than raft for quiesced ranges.
#[derive(Default)]
pub struct SideTransport {
    updates: DashMap<u64, (Timestamp, u64)>,
}

impl SideTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, range: RangeId, ts: Timestamp, lease_applied_index: u64) {
        self.updates
            .entry(range.0)
            .and_modify(|cur| {
                if ts > cur.0 {
                    *cur = (ts, lease_applied_index);
                }
            })
            .or_insert((ts, lease_applied_index));
    }

    pub fn latest(&self, range: RangeId) -> Option<(Timestamp, u64)> {
        self.updates.get(&range.0).map(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: u64) -> Timestamp {
        Timestamp::from_wall(wall)
    }

    #[test]
    fn test_monotonic_under_same_lease() {
        let tracker = ClosedTimestampTracker::new();
        assert!(tracker.try_publish(ts(10), 1, LeaseSequence(1)));
        assert!(tracker.try_publish(ts(20), 2, LeaseSequence(1)));
        assert!(!tracker.try_publish(ts(15), 3, LeaseSequence(1)), "regression rejected");
        assert_eq!(tracker.closed(), Some((ts(20), 2)));
    }

    #[test]
    fn test_new_lease_respects_predecessor() {
        let tracker = ClosedTimestampTracker::new();
        assert!(tracker.try_publish(ts(50), 10, LeaseSequence(1)));
        // New leaseholder at the same applied index cannot go backwards.
        assert!(!tracker.try_publish(ts(40), 10, LeaseSequence(2)));
        // But advancing both is fine.
        assert!(tracker.try_publish(ts(60), 11, LeaseSequence(2)));
    }

    #[test]
    fn test_stale_lease_rejected() {
        let tracker = ClosedTimestampTracker::new();
        assert!(tracker.try_publish(ts(50), 10, LeaseSequence(5)));
        assert!(!tracker.try_publish(ts(100), 20, LeaseSequence(4)));
    }

    #[test]
    fn test_covers() {
        let tracker = ClosedTimestampTracker::new();
        assert!(!tracker.covers(ts(1)));
        tracker.try_publish(ts(30), 1, LeaseSequence(1));
        assert!(tracker.covers(ts(30)));
        assert!(tracker.covers(ts(29)));
        assert!(!tracker.covers(ts(31)));
    }

    #[test]
    fn test_policy_refresh_buckets() {
        let mut latencies = HashMap::new();
        assert_eq!(refresh_policy(false, &latencies), ClosedTsPolicy::LagBySetting);

        latencies.insert(NodeId(1), 20);
        latencies.insert(NodeId(2), 180);
        assert_eq!(
            refresh_policy(true, &latencies),
            ClosedTsPolicy::LeadForGlobalReads(LatencyBucket::Under400Ms)
        );
        latencies.insert(NodeId(3), 500);
        assert_eq!(
            refresh_policy(true, &latencies),
            ClosedTsPolicy::LeadForGlobalReads(LatencyBucket::Over400Ms)
        );
    }

    #[test]
    fn test_target_lag_and_lead() {
        let now = ts(10_000);
        assert_eq!(
            target_closed_timestamp(now, ClosedTsPolicy::LagBySetting, 3_000),
            ts(7_000)
        );
        let lead = target_closed_timestamp(
            now,
            ClosedTsPolicy::LeadForGlobalReads(LatencyBucket::Under50Ms),
            3_000,
        );
        assert!(lead > now);
    }

    #[test]
    fn test_side_transport_keeps_max() {
        let st = SideTransport::new();
        st.publish(RangeId(1), ts(10), 5);
        st.publish(RangeId(1), ts(8), 6);
        assert_eq!(st.latest(RangeId(1)), Some((ts(10), 5)));
        st.publish(RangeId(1), ts(20), 7);
        assert_eq!(st.latest(RangeId(1)), Some((ts(20), 7)));
        assert!(st.latest(RangeId(2)).is_none());
    }
}
