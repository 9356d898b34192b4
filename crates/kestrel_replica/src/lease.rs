//! Range leases.
//!
//! One lease per range at a time, ordered by a strictly increasing
//! sequence. Status is computed from the clock, the request timestamp, the
//! replica's minimum proposed timestamp (revocation), and the stasis
//! window just before expiration.

use serde::{Deserialize, Serialize};

use kestrel_common::types::{LeaseSequence, ReplicaId, Timestamp};

/// Stasis window before expiration during which a lease must not serve new
/// requests (guards against clock skew at handoff), in nanoseconds.
pub const LEASE_STASIS_NANOS: u64 = 100_000_000;

/// A range lease: either epoch-based (node liveness) or expiration-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: ReplicaId,
    pub sequence: LeaseSequence,
    pub start: Timestamp,
    /// Expiration for expiration-based leases; `None` for epoch leases.
    pub expiration: Option<Timestamp>,
    /// Liveness epoch for epoch leases.
    pub epoch: Option<u64>,
    /// Timestamp the lease was proposed at.
    pub proposed_ts: Timestamp,
}

/// Lease validity as seen by one replica at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// No lease exists.
    None,
    Valid,
    Expired,
    /// Inside the stasis window: technically live but unusable.
    Unusable,
    /// Revoked: proposed before the replica's minimum proposed timestamp.
    Proscribed,
}

impl Lease {
    pub fn expiration_based(
        holder: ReplicaId,
        sequence: LeaseSequence,
        start: Timestamp,
        expiration: Timestamp,
    ) -> Self {
        Self {
            holder,
            sequence,
            start,
            expiration: Some(expiration),
            epoch: None,
            proposed_ts: start,
        }
    }

    pub fn epoch_based(
        holder: ReplicaId,
        sequence: LeaseSequence,
        start: Timestamp,
        epoch: u64,
    ) -> Self {
        Self {
            holder,
            sequence,
            start,
            expiration: None,
            epoch: Some(epoch),
            proposed_ts: start,
        }
    }

    /// The successor lease for a (possibly different) holder. The sequence
    /// increases by exactly one.
    pub fn next(&self, holder: ReplicaId, start: Timestamp, expiration: Option<Timestamp>) -> Self {
        Self {
            holder,
            sequence: LeaseSequence(self.sequence.0 + 1),
            start,
            expiration,
            epoch: self.epoch,
            proposed_ts: start,
        }
    }

    /// Compute the lease status for a request at `request_ts` evaluated at
    /// wall time `now`. `min_proposed_ts` is the replica's revocation
    /// floor; `live_epoch` is the liveness epoch for epoch leases.
    pub fn status(
        &self,
        now: Timestamp,
        request_ts: Timestamp,
        min_proposed_ts: Timestamp,
        live_epoch: Option<u64>,
    ) -> LeaseStatus {
        if self.proposed_ts < min_proposed_ts {
            return LeaseStatus::Proscribed;
        }
        match (self.expiration, self.epoch) {
            (Some(exp), _) => {
                if now >= exp {
                    return LeaseStatus::Expired;
                }
                let stasis = Timestamp::new(exp.wall.saturating_sub(LEASE_STASIS_NANOS), exp.logical);
                if request_ts >= stasis {
                    return LeaseStatus::Unusable;
                }
                LeaseStatus::Valid
            }
            (None, Some(epoch)) => match live_epoch {
                Some(live) if live == epoch => LeaseStatus::Valid,
                Some(_) => LeaseStatus::Expired,
                None => LeaseStatus::Expired,
            },
            (None, None) => LeaseStatus::None,
        }
    }
}
