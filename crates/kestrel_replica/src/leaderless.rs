//! Leaderless watcher.
//!
//! Tracks how long a replica has gone without knowing of a raft leader.
//! Past the configured threshold the replica marks itself unavailable and
//! serves a cached error until a leader is observed again. A threshold of
//! zero disables the watcher; toggling to zero resets any replica
//! currently marked unavailable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use kestrel_common::settings::{self, Settings};

pub struct LeaderlessWatcher {
    threshold_ms: Arc<kestrel_common::settings::U64Setting>,
    leaderless_since: Mutex<Option<Instant>>,
    unavailable: AtomicBool,
}

impl LeaderlessWatcher {
    pub fn new(settings: &Arc<Settings>) -> Arc<Self> {
        let watcher = Arc::new(Self {
            threshold_ms: settings.u64_setting(settings::LEADERLESS_UNAVAILABLE_THRESHOLD_MS),
            leaderless_since: Mutex::new(None),
            unavailable: AtomicBool::new(false),
        });
        // Disabling the watcher mid-flight resets unavailable replicas.
        let w = Arc::downgrade(&watcher);
        settings.subscribe(move |s, name| {
            if name == settings::LEADERLESS_UNAVAILABLE_THRESHOLD_MS
                && s.get_u64(settings::LEADERLESS_UNAVAILABLE_THRESHOLD_MS) == 0
            {
                if let Some(watcher) = w.upgrade() {
                    watcher.reset();
                }
            }
        });
        watcher
    }

    /// Update the watcher with the current leadership observation.
    pub fn refresh(&self, has_leader: bool, now: Instant) {
        if has_leader {
            self.reset();
            return;
        }
        let threshold = self.threshold_ms.get();
        if threshold == 0 {
            return;
        }
        let mut since = self.leaderless_since.lock();
        let start = *since.get_or_insert(now);
        if now.duration_since(start).as_millis() as u64 >= threshold {
            if !self.unavailable.swap(true, Ordering::AcqRel) {
                tracing::warn!("replica leaderless past threshold; marking unavailable");
            }
        }
    }

    pub fn reset(&self) {
        *self.leaderless_since.lock() = None;
        self.unavailable.store(false, Ordering::Release);
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings_with_threshold(ms: u64) -> Arc<Settings> {
        let s = Settings::new();
        s.set_u64(settings::LEADERLESS_UNAVAILABLE_THRESHOLD_MS, ms);
        s
    }

    #[test]
    fn test_marks_unavailable_past_threshold() {
        let s = settings_with_threshold(100);
        let w = LeaderlessWatcher::new(&s);
        let t0 = Instant::now();
        w.refresh(false, t0);
        assert!(!w.is_unavailable());
        w.refresh(false, t0 + Duration::from_millis(150));
        assert!(w.is_unavailable());
    }

    #[test]
    fn test_observing_leader_resets() {
        let s = settings_with_threshold(100);
        let w = LeaderlessWatcher::new(&s);
        let t0 = Instant::now();
        w.refresh(false, t0);
        w.refresh(false, t0 + Duration::from_millis(150));
        assert!(w.is_unavailable());
        w.refresh(true, t0 + Duration::from_millis(200));
        assert!(!w.is_unavailable());
        // The leaderless timer restarts from scratch.
        w.refresh(false, t0 + Duration::from_millis(210));
        assert!(!w.is_unavailable());
    }

    #[test]
    fn test_zero_threshold_disables() {
        let s = settings_with_threshold(0);
        let w = LeaderlessWatcher::new(&s);
        let t0 = Instant::now();
        w.refresh(false, t0);
        w.refresh(false, t0 + Duration::from_secs(3600));
        assert!(!w.is_unavailable());
    }

    #[test]
    fn test_toggling_to_zero_resets_unavailable() {
        let s = settings_with_threshold(100);
        let w = LeaderlessWatcher::new(&s);
        let t0 = Instant::now();
        w.refresh(false, t0);
        w.refresh(false, t0 + Duration::from_millis(150));
        assert!(w.is_unavailable());
        s.set_u64(settings::LEADERLESS_UNAVAILABLE_THRESHOLD_MS, 0);
        assert!(!w.is_unavailable(), "disable must reset unavailable state");
    }
}
