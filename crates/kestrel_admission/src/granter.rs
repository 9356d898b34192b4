//! CPU-bound granters.
//!
//! The slot granter paces KV work with integer slots tracking soft CPU
//! capacity; exhaustion duration accumulates whenever `used >= total`. The
//! token granter paces SQL KV-response and SQL-response work with burst
//! tokens and stops granting entirely while the CPU overload indicator
//! reports overload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Result of an instantaneous admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantResult {
    Success,
    /// The local resource is exhausted; the requester should enqueue.
    FailLocal,
    /// A resource shared with higher-priority work is the blocker; granting
    /// here would invert priorities.
    FailDueToSharedResource,
}

/// Reports whether the CPU is overloaded (e.g. runnable goroutine style
/// signal from the scheduler).
pub trait CpuOverloadIndicator: Send + Sync {
    fn is_overloaded(&self) -> bool;
}

/// Static indicator for tests and for wiring defaults.
pub struct StaticOverload {
    overloaded: std::sync::atomic::AtomicBool,
}

impl StaticOverload {
    pub fn new(overloaded: bool) -> Arc<Self> {
        Arc::new(Self {
            overloaded: std::sync::atomic::AtomicBool::new(overloaded),
        })
    }

    pub fn set(&self, overloaded: bool) {
        self.overloaded.store(overloaded, Ordering::Release);
    }
}

impl CpuOverloadIndicator for StaticOverload {
    fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Acquire)
    }
}

struct SlotState {
    total: i64,
    used: i64,
    /// Set when `used >= total` transitioned from below.
    exhausted_start: Option<Instant>,
}

/// Integer-slot granter for KV CPU work.
pub struct SlotGranter {
    state: Mutex<SlotState>,
    exhausted_micros: AtomicU64,
}

impl SlotGranter {
    pub fn new(total_slots: i64) -> Self {
        Self {
            state: Mutex::new(SlotState {
                total: total_slots.max(1),
                used: 0,
                exhausted_start: None,
            }),
            exhausted_micros: AtomicU64::new(0),
        }
    }

    pub fn try_get(&self, count: i64) -> GrantResult {
        let mut state = self.state.lock();
        if state.used + count <= state.total {
            state.used += count;
            if state.used >= state.total && state.exhausted_start.is_none() {
                state.exhausted_start = Some(Instant::now());
            }
            GrantResult::Success
        } else {
            GrantResult::FailLocal
        }
    }

    pub fn return_grant(&self, count: i64) {
        let mut state = self.state.lock();
        let was_exhausted = state.used >= state.total;
        state.used = (state.used - count).max(0);
        if was_exhausted && state.used < state.total {
            if let Some(start) = state.exhausted_start.take() {
                self.exhausted_micros
                    .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
            }
        }
    }

    /// Record work that proceeded without asking first (e.g. high-priority
    /// internal work).
    pub fn took_without_permission(&self, count: i64) {
        let mut state = self.state.lock();
        let was_exhausted = state.used >= state.total;
        state.used += count;
        if !was_exhausted && state.used >= state.total {
            state.exhausted_start = Some(Instant::now());
        }
    }

    /// Adjust the soft capacity; exhaustion bookkeeping follows the
    /// transition.
    pub fn set_total_slots(&self, total: i64) {
        let mut state = self.state.lock();
        let was_exhausted = state.used >= state.total;
        state.total = total.max(1);
        let now_exhausted = state.used >= state.total;
        match (was_exhausted, now_exhausted) {
            (false, true) => state.exhausted_start = Some(Instant::now()),
            (true, false) => {
                if let Some(start) = state.exhausted_start.take() {
                    self.exhausted_micros
                        .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }

    pub fn used_slots(&self) -> i64 {
        self.state.lock().used
    }

    pub fn total_slots(&self) -> i64 {
        self.state.lock().total
    }

    pub fn exhausted_micros(&self) -> u64 {
        self.exhausted_micros.load(Ordering::Relaxed)
    }
}

struct TokenState {
    available: i64,
    burst: i64,
}

/// Burst-token granter for CPU-bound non-KV work.
pub struct TokenGranter {
    state: Mutex<TokenState>,
    cpu_overload: Arc<dyn CpuOverloadIndicator>,
    tokens_taken: AtomicU64,
    tokens_returned: AtomicU64,
}

impl TokenGranter {
    pub fn new(burst_tokens: i64, cpu_overload: Arc<dyn CpuOverloadIndicator>) -> Self {
        Self {
            state: Mutex::new(TokenState {
                available: burst_tokens,
                burst: burst_tokens,
            }),
            cpu_overload,
            tokens_taken: AtomicU64::new(0),
            tokens_returned: AtomicU64::new(0),
        }
    }

    pub fn try_get(&self, count: i64) -> GrantResult {
        if self.cpu_overload.is_overloaded() {
            return GrantResult::FailDueToSharedResource;
        }
        let mut state = self.state.lock();
        if state.available > 0 {
            state.available -= count;
            self.tokens_taken.fetch_add(count as u64, Ordering::Relaxed);
            GrantResult::Success
        } else {
            GrantResult::FailLocal
        }
    }

    pub fn return_grant(&self, count: i64) {
        let mut state = self.state.lock();
        state.available = (state.available + count).min(state.burst);
        self.tokens_returned
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn took_without_permission(&self, count: i64) {
        self.state.lock().available -= count;
        self.tokens_taken.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Periodic refill to the burst cap.
    pub fn refill(&self) {
        let mut state = self.state.lock();
        state.available = state.burst;
    }

    pub fn available(&self) -> i64 {
        self.state.lock().available
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
    use std::time::Duration;

    #[test]
    fn test_slots_grant_until_full() {
        let g = SlotGranter::new(2);
        assert_eq!(g.try_get(1), GrantResult::Success);
        assert_eq!(g.try_get(1), GrantResult::Success);
        assert_eq!(g.try_get(1), GrantResult::FailLocal);
        g.return_grant(1);
        assert_eq!(g.try_get(1), GrantResult::Success);
    }

    #[test]
    fn test_slot_exhaustion_duration_accumulates() {
        let g = SlotGranter::new(1);
        assert_eq!(g.try_get(1), GrantResult::Success);
        std::thread::sleep(Duration::from_millis(20));
        g.return_grant(1);
        assert!(g.exhausted_micros() >= 10_000, "{}", g.exhausted_micros());
        // No further accumulation while unexhausted.
        let before = g.exhausted_micros();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(g.exhausted_micros(), before);
    }

    #[test]
    fn test_took_without_permission_overcommits() {
        let g = SlotGranter::new(1);
        g.took_without_permission(3);
        assert_eq!(g.used_slots(), 3);
        assert_eq!(g.try_get(1), GrantResult::FailLocal);
        g.return_grant(3);
        assert_eq!(g.try_get(1), GrantResult::Success);
    }

    #[test]
    fn test_set_total_slots_tracks_exhaustion() {
        let g = SlotGranter::new(4);
        g.took_without_permission(3);
        g.set_total_slots(2);
        std::thread::sleep(Duration::from_millis(15));
        g.set_total_slots(8);
        assert!(g.exhausted_micros() > 0);
    }

    #[test]
    fn test_token_granter_burst() {
        let overload = StaticOverload::new(false);
        let g = TokenGranter::new(10, overload);
        // Burst semantics: admission succeeds while the balance is positive,
        // even if the request overshoots.
        assert_eq!(g.try_get(25), GrantResult::Success);
        assert_eq!(g.try_get(1), GrantResult::FailLocal);
        g.refill();
        assert_eq!(g.try_get(1), GrantResult::Success);
    }

    #[test]
    fn test_token_granter_blocked_by_cpu_overload() {
        let overload = StaticOverload::new(true);
        let g = TokenGranter::new(10, overload.clone());
        assert_eq!(g.try_get(1), GrantResult::FailDueToSharedResource);
        overload.set(false);
        assert_eq!(g.try_get(1), GrantResult::Success);
    }

    #[test]
    fn test_token_conservation() {
        let overload = StaticOverload::new(false);
        let g = TokenGranter::new(100, overload);
        let initial = g.available();
        g.try_get(30);
        g.took_without_permission(20);
        g.return_grant(10);
        let granted = g.tokens_taken() as i64;
        let returned = g.tokens_returned() as i64;
        assert_eq!(initial - g.available(), granted - returned);
    }
}
