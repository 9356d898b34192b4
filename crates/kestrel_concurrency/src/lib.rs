//! Per-range concurrency manager: span latches, the lock table with FIFO
//! waiter queues and built-in deadlock detection, and the abort span.

pub mod abort_span;
pub mod latch;
pub mod lock_table;

pub use abort_span::AbortSpan;
pub use latch::{LatchAccess, LatchGuard, LatchManager};
pub use lock_table::LockTable;
