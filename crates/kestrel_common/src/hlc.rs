//! Hybrid-logical clock.
//!
//! Produces [`Timestamp`]s that are totally ordered and compatible with
//! physical time: the wall component tracks the local monotonic-adjusted
//! clock, the logical component breaks ties within one wall tick and
//! captures causality carried by timestamps received from other nodes.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::types::Timestamp;

/// Source of wall time in nanoseconds. Injectable for tests.
pub trait WallClock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

/// System wall clock.
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests. Clones share the same
/// underlying reading, so a test can advance time on a clock it handed to
/// a component.
#[derive(Clone)]
pub struct ManualClock {
    nanos: std::sync::Arc<Mutex<u64>>,
}

impl ManualClock {
    pub fn new(nanos: u64) -> Self {
        Self {
            nanos: std::sync::Arc::new(Mutex::new(nanos)),
        }
    }

    pub fn set(&self, nanos: u64) {
        let mut n = self.nanos.lock();
        if nanos > *n {
            *n = nanos;
        }
    }

    pub fn advance(&self, delta: u64) {
        *self.nanos.lock() += delta;
    }
}

impl WallClock for ManualClock {
    fn now_nanos(&self) -> u64 {
        *self.nanos.lock()
    }
}

/// Hybrid-logical clock. `now()` never returns the same or an earlier
/// timestamp twice; `update()` folds in timestamps observed from remote
/// nodes so causally later events get later timestamps.
pub struct Clock {
    wall: Box<dyn WallClock>,
    state: Mutex<Timestamp>,
}

impl Clock {
    pub fn new(wall: impl WallClock + 'static) -> Self {
        Self {
            wall: Box::new(wall),
            state: Mutex::new(Timestamp::MIN),
        }
    }

    pub fn system() -> Self {
        Self::new(SystemWallClock)
    }

    /// Current timestamp, strictly greater than any previously returned.
    pub fn now(&self) -> Timestamp {
        let physical = self.wall.now_nanos();
        let mut state = self.state.lock();
        if physical > state.wall {
            *state = Timestamp::from_wall(physical);
        } else {
            *state = state.next();
        }
        *state
    }

    /// Fold in a timestamp received from another node.
    pub fn update(&self, observed: Timestamp) {
        let mut state = self.state.lock();
        state.forward(observed);
    }

    /// Physical wall reading without advancing the logical component.
    pub fn physical_now(&self) -> u64 {
        self.wall.now_nanos()
    }
}
