//! Per-range replica state machine.
//!
//! A replica owns a contiguous keyspace, holds a lease, sequences writes
//! through consensus, applies committed entries to the local engine under
//! the max-lease-index invariants, and serves reads under lease or as
//! follower reads below the closed timestamp.

pub mod apply;
pub mod batch;
pub mod closed_ts;
pub mod descriptor;
pub mod gc;
pub mod leaderless;
pub mod lease;
pub mod merge;
pub mod proposal;
pub mod replica;
pub mod store;

pub use batch::{BatchRequest, BatchResponse, Request, ResponseValue};
pub use descriptor::{RangeDescriptor, ReplicaDescriptor, SpanConfig};
pub use replica::Replica;
pub use store::Store;
