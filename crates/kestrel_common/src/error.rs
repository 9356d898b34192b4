use thiserror::Error;

use crate::types::{LeaseSequence, RangeId, ReplicaId, Timestamp, TxnId};

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification driving retry/escalation decisions.
///
/// - `Routing`   - request reached the wrong replica; client re-routes using
///                 the state carried in the error
/// - `Retryable` - ambiguous result, write-too-old, serialization restart;
///                 surfaced to the transaction layer
/// - `Resource`  - admission overload, memory budget, queue full; client
///                 retries with back-off
/// - `Gate`      - GC threshold, merge in progress, replica unavailable;
///                 retry semantics depend on the gate
/// - `Fatal`     - corruption, fatal disk stall, state divergence; the
///                 process must stop after persisting a do-not-restart marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Routing,
    Retryable,
    Resource,
    Gate,
    Fatal,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    /// Retryable error surfaced to the transaction layer.
    #[error("Retryable: {reason} (range={range_id})")]
    Retryable { reason: String, range_id: u64 },

    /// The outcome of a proposal could not be determined (e.g. the replica
    /// lost leadership while the command was in flight).
    #[error("Ambiguous result: {0}")]
    AmbiguousResult(String),

    /// Internal invariant violation. Should never occur.
    #[error("Internal [{error_code}]: {message}")]
    Internal {
        error_code: &'static str,
        message: String,
    },
}

/// Errors that send the client back to routing with updated state.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("not leaseholder for range {range_id}; suspected leaseholder {leaseholder_hint:?}")]
    NotLeaseholder {
        range_id: RangeId,
        leaseholder_hint: Option<ReplicaId>,
    },

    #[error("range key mismatch: request span outside range {range_id} bounds")]
    RangeKeyMismatch {
        range_id: RangeId,
        /// Current descriptor generation, so the client can refresh its cache.
        generation: u64,
    },

    #[error("range {0} not found on this store")]
    RangeNotFound(RangeId),
}

/// Errors produced by the replica's admission gates.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("batch timestamp {request_ts} must be after replica GC threshold {threshold}{}", if *.excluded_from_backup { " (data excluded from backup)" } else { "" })]
    BatchTimestampBeforeGc {
        request_ts: Timestamp,
        threshold: Timestamp,
        excluded_from_backup: bool,
    },

    #[error("merge in progress on range {0}; retry after merge completes")]
    MergeInProgress(RangeId),

    #[error("replica {replica_id} of range {range_id} unavailable: {reason}")]
    ReplicaUnavailable {
        range_id: RangeId,
        replica_id: ReplicaId,
        reason: String,
    },

    #[error("cannot use lease with sequence {proposed} after observing sequence {observed}")]
    LeaseSequenceSkew {
        proposed: LeaseSequence,
        observed: LeaseSequence,
    },
}

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("empty key")]
    EmptyKey,

    #[error("key not found")]
    KeyNotFound,

    #[error("batch already committed")]
    BatchCommitted,

    #[error("snapshot does not cover requested span")]
    SnapshotSpanMismatch,

    #[error(
        "store version {found_major}.{found_minor}.{found_patch} is older than the minimum \
         supported {min_major}.{min_minor}.{min_patch}"
    )]
    VersionTooOld {
        found_major: u32,
        found_minor: u32,
        found_patch: u32,
        min_major: u32,
        min_minor: u32,
        min_patch: u32,
    },

    #[error("min-version file missing from non-empty store at {dir}")]
    MissingVersionFile { dir: String },

    #[error("corruption in {path}: {detail}")]
    Corruption { path: String, detail: String },

    #[error("disk stall exceeded fatal threshold ({stalled_ms}ms)")]
    FatalDiskStall { stalled_ms: u64 },

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Admission control errors.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("admission queue full for work class {class}")]
    QueueFull { class: &'static str },

    #[error("admission wait canceled")]
    Canceled,
}

/// Concurrency manager errors.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    #[error("deadlock detected; transaction {victim} chosen as victim")]
    Deadlock { victim: TxnId },

    #[error("transaction {txn_id} aborted (abort span hit)")]
    TxnAborted { txn_id: TxnId },

    #[error("lock wait timed out on key after {waited_ms}ms")]
    LockWaitTimeout { waited_ms: u64 },

    #[error("range boundary changed while waiting; retry against the new range")]
    RangeBoundaryChanged,

    #[error("write conflict: intent held by transaction {holder}")]
    WriteIntent { holder: TxnId },
}

// ── Classification & helpers ─────────────────────────────────────────────────

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Routing(_) => ErrorKind::Routing,

            KestrelError::Gate(_) => ErrorKind::Gate,

            KestrelError::Retryable { .. } => ErrorKind::Retryable,
            KestrelError::AmbiguousResult(_) => ErrorKind::Retryable,
            KestrelError::Concurrency(ConcurrencyError::Deadlock { .. }) => ErrorKind::Retryable,
            KestrelError::Concurrency(ConcurrencyError::TxnAborted { .. }) => ErrorKind::Retryable,
            KestrelError::Concurrency(ConcurrencyError::WriteIntent { .. }) => ErrorKind::Retryable,
            KestrelError::Concurrency(ConcurrencyError::RangeBoundaryChanged) => {
                ErrorKind::Retryable
            }

            KestrelError::Admission(_) => ErrorKind::Resource,
            KestrelError::Concurrency(ConcurrencyError::LockWaitTimeout { .. }) => {
                ErrorKind::Resource
            }

            KestrelError::Storage(StorageError::Corruption { .. }) => ErrorKind::Fatal,
            KestrelError::Storage(StorageError::FatalDiskStall { .. }) => ErrorKind::Fatal,
            KestrelError::Internal { .. } => ErrorKind::Fatal,

            // Remaining storage errors are surfaced to the caller as
            // retryable-with-backoff resource conditions or plain retryables
            // depending on variant.
            KestrelError::Storage(StorageError::EmptyKey) => ErrorKind::Retryable,
            KestrelError::Storage(_) => ErrorKind::Retryable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Construct a retryable error carrying the originating range.
    pub fn retryable(reason: impl Into<String>, range_id: u64) -> Self {
        KestrelError::Retryable {
            reason: reason.into(),
            range_id,
        }
    }

    /// Construct an internal invariant-violation error.
    pub fn internal(error_code: &'static str, message: impl Into<String>) -> Self {
        KestrelError::Internal {
            error_code,
            message: message.into(),
        }
    }

    /// Add context to an error, preserving its classification. Structured
    /// variants get the context prepended to their reason/message; others
    /// are wrapped as `Internal` (last resort).
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            KestrelError::Retryable { reason, range_id } => KestrelError::Retryable {
                reason: format!("{ctx}: {reason}"),
                range_id,
            },
            KestrelError::AmbiguousResult(msg) => {
                KestrelError::AmbiguousResult(format!("{ctx}: {msg}"))
            }
            KestrelError::Internal {
                error_code,
                message,
            } => KestrelError::Internal {
                error_code,
                message: format!("{ctx}: {message}"),
            },
            other => other,
        }
    }

    /// Emit a structured log entry for fatal errors. Must be called before a
    /// fatal error is allowed to take the process down.
    pub fn log_if_fatal(&self) {
        if self.is_fatal() {
            tracing::error!(
                component = self.component(),
                error_category = "Fatal",
                "FATAL: {self}"
            );
        }
    }

    fn component(&self) -> &'static str {
        match self {
            KestrelError::Routing(_) | KestrelError::Gate(_) => "replica",
            KestrelError::Storage(_) => "storage",
            KestrelError::Admission(_) => "admission",
            KestrelError::Concurrency(_) => "concurrency",
            KestrelError::Retryable { .. } | KestrelError::AmbiguousResult(_) => "replica",
            KestrelError::Internal { .. } => "internal",
        }
    }
}

impl From<std::io::Error> for KestrelError {
    fn from(e: std::io::Error) -> Self {
        KestrelError::Storage(StorageError::Io(e))
    }
}

/// Add context to a Result, preserving error classification.
/// Usage: `some_result.ctx("stage=apply, range=42")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> Result<T, KestrelError>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, KestrelError>;
}

impl<T, E: Into<KestrelError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> Result<T, KestrelError> {
        self.map_err(|e| e.into().with_context(context))
    }
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, KestrelError> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod classification {
    use super::*;

    #[test]
    fn test_routing_errors_classify_as_routing() {
        let e = KestrelError::Routing(RoutingError::RangeNotFound(RangeId(7)));
        assert_eq!(e.kind(), ErrorKind::Routing);

        let e = KestrelError::Routing(RoutingError::NotLeaseholder {
            range_id: RangeId(1),
            leaseholder_hint: Some(ReplicaId(3)),
        });
        assert_eq!(e.kind(), ErrorKind::Routing);
        assert!(e.to_string().contains("not leaseholder"));
    }

    #[test]
    fn test_gate_errors_classify_as_gate() {
        let e = KestrelError::Gate(GateError::MergeInProgress(RangeId(9)));
        assert_eq!(e.kind(), ErrorKind::Gate);

        let e = KestrelError::Gate(GateError::BatchTimestampBeforeGc {
            request_ts: Timestamp::new(5, 0),
            threshold: Timestamp::new(10, 0),
            excluded_from_backup: true,
        });
        assert_eq!(e.kind(), ErrorKind::Gate);
        assert!(e.to_string().contains("excluded from backup"));
    }

    #[test]
    fn test_gc_error_without_backup_flag() {
        let e = GateError::BatchTimestampBeforeGc {
            request_ts: Timestamp::new(5, 0),
            threshold: Timestamp::new(10, 0),
            excluded_from_backup: false,
        };
        assert!(!e.to_string().contains("excluded from backup"));
    }

    #[test]
    fn test_admission_is_resource() {
        let e = KestrelError::Admission(AdmissionError::QueueFull { class: "regular" });
        assert_eq!(e.kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_deadlock_is_retryable() {
        let e = KestrelError::Concurrency(ConcurrencyError::Deadlock { victim: TxnId(4) });
        assert_eq!(e.kind(), ErrorKind::Retryable);
        assert!(e.is_retryable());
    }

    #[test]
    fn test_corruption_is_fatal() {
        let e = KestrelError::Storage(StorageError::Corruption {
            path: "/data/000001.sst".into(),
            detail: "block checksum mismatch".into(),
        });
        assert_eq!(e.kind(), ErrorKind::Fatal);
        assert!(e.is_fatal());
    }

    #[test]
    fn test_disk_stall_is_fatal() {
        let e = KestrelError::Storage(StorageError::FatalDiskStall { stalled_ms: 30_000 });
        assert!(e.is_fatal());
    }

    #[test]
    fn test_ambiguous_result_is_retryable() {
        let e = KestrelError::AmbiguousResult("leadership lost mid-proposal".into());
        assert_eq!(e.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn test_version_too_old_display() {
        let e = StorageError::VersionTooOld {
            found_major: 23,
            found_minor: 1,
            found_patch: 0,
            min_major: 24,
            min_minor: 1,
            min_patch: 0,
        };
        let s = e.to_string();
        assert!(s.contains("23.1.0"));
        assert!(s.contains("24.1.0"));
    }

    #[test]
    fn test_with_context_preserves_kind() {
        let e = KestrelError::retryable("lease changed", 3);
        let e2 = e.with_context("stage=evaluate");
        assert_eq!(e2.kind(), ErrorKind::Retryable);
        assert!(e2.to_string().contains("stage=evaluate"));
        assert!(e2.to_string().contains("lease changed"));
    }

    #[test]
    fn test_ctx_trait() {
        let r: Result<(), StorageError> = Err(StorageError::EmptyKey);
        let err = r.ctx("op=put").unwrap_err();
        // EmptyKey is a typed storage variant; context must not reclassify it.
        assert!(matches!(err, KestrelError::Storage(StorageError::EmptyKey)));
    }

    #[test]
    fn test_ctx_ok_passthrough() {
        let r: Result<u32, StorageError> = Ok(7);
        assert_eq!(r.ctx("unused").unwrap(), 7);
    }

    #[test]
    fn test_internal_constructor() {
        let e = KestrelError::internal("E-APPLY-001", "applied index regressed");
        assert!(e.is_fatal());
        assert!(e.to_string().contains("E-APPLY-001"));
    }

    #[test]
    fn test_lease_sequence_skew_display() {
        let e = GateError::LeaseSequenceSkew {
            proposed: LeaseSequence(4),
            observed: LeaseSequence(6),
        };
        let s = e.to_string();
        assert!(s.contains('4'));
        assert!(s.contains('6'));
    }
}
