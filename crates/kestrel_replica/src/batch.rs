//! Batch requests and responses.
//!
//! A batch is a sequence of KV requests addressed to a single range,
//! executed atomically with respect to latching.

use serde::{Deserialize, Serialize};

use kestrel_common::types::{RangeId, ReplicaId, Span, Timestamp, TxnId, TxnPriority};
use kestrel_concurrency::latch::LatchAccess;

/// Read consistency demanded by a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    Consistent,
    /// Bypasses the lease check; may observe a short stale window around
    /// merges.
    Inconsistent,
}

/// One KV request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Get {
        key: Vec<u8>,
    },
    Scan {
        start: Vec<u8>,
        end: Vec<u8>,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
    },
    /// MVCC range tombstone over `[start, end)`.
    DeleteRange {
        start: Vec<u8>,
        end: Vec<u8>,
    },
    /// Merge-protocol request freezing the right-hand range.
    Subsume,
    /// Refresh of the local range-descriptor key issued by the active
    /// merge transaction; exempt from the merge gate.
    RefreshRangeDescriptor,
    RequestLease {
        holder: ReplicaId,
    },
    TransferLease {
        target: ReplicaId,
    },
}

impl Request {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Request::Put { .. }
                | Request::Delete { .. }
                | Request::DeleteRange { .. }
                | Request::Subsume
                | Request::RequestLease { .. }
                | Request::TransferLease { .. }
        )
    }

    /// Key span this request touches, or `None` for range-wide protocol
    /// requests.
    pub fn span(&self) -> Option<Span> {
        match self {
            Request::Get { key } | Request::Put { key, .. } | Request::Delete { key } => {
                Some(Span::point(key.clone()))
            }
            Request::Scan { start, end } | Request::DeleteRange { start, end } => {
                Some(Span::new(start.clone(), end.clone()))
            }
            Request::Subsume
            | Request::RefreshRangeDescriptor
            | Request::RequestLease { .. }
            | Request::TransferLease { .. } => None,
        }
    }

    fn latch_access(&self) -> LatchAccess {
        if self.is_write() {
            LatchAccess::Write
        } else {
            LatchAccess::Read
        }
    }
}

/// Transaction metadata attached to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTxnMeta {
    pub txn_id: TxnId,
    pub priority: TxnPriority,
}

/// A batch of requests addressed to one range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub range_id: RangeId,
    pub ts: Timestamp,
    pub txn: Option<BatchTxnMeta>,
    pub consistency: ReadConsistency,
    /// Administrative batches bypass strict GC-threshold enforcement.
    pub admin: bool,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    pub fn reads(range_id: RangeId, ts: Timestamp, requests: Vec<Request>) -> Self {
        Self {
            range_id,
            ts,
            txn: None,
            consistency: ReadConsistency::Consistent,
            admin: false,
            requests,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.requests.iter().all(|r| !r.is_write())
    }

    /// A single lease request/transfer skips the lease check (it is the
    /// mechanism that establishes the lease in the first place).
    pub fn skips_lease_check(&self) -> bool {
        self.requests.len() == 1
            && matches!(
                self.requests[0],
                Request::RequestLease { .. } | Request::TransferLease { .. }
            )
    }

    pub fn is_subsume(&self) -> bool {
        self.requests.iter().any(|r| matches!(r, Request::Subsume))
    }

    pub fn is_descriptor_refresh(&self) -> bool {
        self.requests
            .iter()
            .any(|r| matches!(r, Request::RefreshRangeDescriptor))
    }

    /// Covering span of all addressed requests; `None` when the batch only
    /// contains range-wide protocol requests.
    pub fn span(&self) -> Option<Span> {
        let mut start: Option<Vec<u8>> = None;
        let mut end: Option<Vec<u8>> = None;
        for r in &self.requests {
            let Some(s) = r.span() else {
                continue;
            };
            let s_end = if s.is_point() {
                let mut e = s.start.clone();
                e.push(0);
                e
            } else {
                s.end.clone()
            };
            start = Some(match start {
                None => s.start.clone(),
                Some(cur) => cur.min(s.start.clone()),
            });
            end = Some(match end {
                None => s_end,
                Some(cur) => cur.max(s_end),
            });
        }
        Some(Span::new(start?, end?))
    }

    /// Latch spans declared by the batch.
    pub fn latch_spans(&self) -> Vec<(Span, LatchAccess)> {
        self.requests
            .iter()
            .filter_map(|r| r.span().map(|s| (s, r.latch_access())))
            .collect()
    }
}

/// Response to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseValue {
    Get { value: Option<Vec<u8>> },
    Scan { kvs: Vec<(Vec<u8>, Vec<u8>)> },
    Put,
    Delete,
    DeleteRange,
    Subsume,
    RefreshRangeDescriptor,
    Lease,
}

/// Response to a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub responses: Vec<ResponseValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: u64) -> Timestamp {
        Timestamp::from_wall(wall)
    }

    #[test]
    fn test_read_only_detection() {
        let b = BatchRequest::reads(
            RangeId(1),
            ts(5),
            vec![
                Request::Get { key: b"a".to_vec() },
                Request::Scan {
                    start: b"a".to_vec(),
                    end: b"m".to_vec(),
                },
            ],
        );
        assert!(b.is_read_only());

        let mut w = b.clone();
        w.requests.push(Request::Put {
            key: b"a".to_vec(),
            value: b"v".to_vec(),
        });
        assert!(!w.is_read_only());
    }

    #[test]
    fn test_covering_span() {
        let b = BatchRequest::reads(
            RangeId(1),
            ts(5),
            vec![
                Request::Get { key: b"m".to_vec() },
                Request::Scan {
                    start: b"a".to_vec(),
                    end: b"c".to_vec(),
                },
            ],
        );
        let span = b.span().unwrap();
        assert_eq!(span.start, b"a".to_vec());
        assert!(span.end > b"m".to_vec());
    }

    #[test]
    fn test_skips_lease_check_only_for_single_lease_request() {
        let lease_only = BatchRequest::reads(
            RangeId(1),
            ts(5),
            vec![Request::RequestLease {
                holder: ReplicaId(1),
            }],
        );
        assert!(lease_only.skips_lease_check());

        let mixed = BatchRequest::reads(
            RangeId(1),
            ts(5),
            vec![
                Request::RequestLease {
                    holder: ReplicaId(1),
                },
                Request::Get { key: b"a".to_vec() },
            ],
        );
        assert!(!mixed.skips_lease_check());
    }

    #[test]
    fn test_latch_spans_access_modes() {
        let b = BatchRequest::reads(
            RangeId(1),
            ts(5),
            vec![
                Request::Get { key: b"a".to_vec() },
                Request::Put {
                    key: b"b".to_vec(),
                    value: b"v".to_vec(),
                },
            ],
        );
        let spans = b.latch_spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].1, LatchAccess::Read);
        assert_eq!(spans[1].1, LatchAccess::Write);
    }

    #[test]
    fn test_protocol_requests_have_no_span() {
        let b = BatchRequest::reads(RangeId(1), ts(5), vec![Request::Subsume]);
        assert!(b.span().is_none());
        assert!(b.is_subsume());
    }
}
