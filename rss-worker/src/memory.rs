//! Global memory governor: one `AtomicI64` byte counter plus a `Notify` for
//! waiters, directly generalizing the `QueryGuard`/atomic-counter admission
//! pattern from the teacher's `distributed_scheduler.rs` into a byte budget
//! instead of a query-slot budget.

use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Notify;

pub struct MemoryGovernor {
    used: AtomicI64,
    threshold: i64,
    low_water: i64,
    notify: Notify,
}

impl MemoryGovernor {
    pub fn new(threshold: u64, low_water_pct: f64) -> Self {
        let threshold = threshold as i64;
        Self {
            used: AtomicI64::new(0),
            threshold,
            low_water: (threshold as f64 * low_water_pct) as i64,
            notify: Notify::new(),
        }
    }

    /// Reserve `bytes` if doing so would not push resident usage past the
    /// threshold. Returns `false` (and reserves nothing) when over budget —
    /// the caller should reply `BackpressureError` per §5.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let bytes = bytes as i64;
        let prev = self.used.fetch_add(bytes, Ordering::SeqCst);
        if prev + bytes > self.threshold {
            self.used.fetch_sub(bytes, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    /// Release `bytes` previously reserved, e.g. once a flush has persisted
    /// them to DFS and they're no longer resident in memory. Wakes waiters
    /// if usage drops back to or below the low-water mark.
    pub fn release(&self, bytes: u64) {
        let bytes = bytes as i64;
        let after = self.used.fetch_sub(bytes, Ordering::SeqCst) - bytes;
        if after <= self.low_water {
            self.notify.notify_waiters();
        }
    }

    pub fn used_bytes(&self) -> i64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn is_under_pressure(&self) -> bool {
        self.used_bytes() > self.low_water
    }

    /// Resolves the next time usage drops to or below the low-water mark.
    /// Used by a background task to log pressure relief; not on the
    /// `SendBlock` hot path, which only needs `try_reserve`.
    pub async fn notified_below_low_water(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_within_threshold_succeeds() {
        let gov = MemoryGovernor::new(100, 0.75);
        assert!(gov.try_reserve(50));
        assert_eq!(gov.used_bytes(), 50);
    }

    #[test]
    fn reserve_past_threshold_is_rejected_and_not_committed() {
        let gov = MemoryGovernor::new(100, 0.75);
        assert!(gov.try_reserve(90));
        assert!(!gov.try_reserve(20));
        assert_eq!(gov.used_bytes(), 90);
    }

    #[test]
    fn release_drops_usage_and_clears_pressure() {
        let gov = MemoryGovernor::new(100, 0.5);
        gov.try_reserve(80);
        assert!(gov.is_under_pressure());
        gov.release(60);
        assert_eq!(gov.used_bytes(), 20);
        assert!(!gov.is_under_pressure());
    }
}
