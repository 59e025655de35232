//! # Wake References
//!
//! A wake reference keeps the device out of low-power states. One is held
//! across every firmware-facing mutation so a concurrent firmware reset or
//! runtime suspend cannot observe half-applied state.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Counts live wake references
#[derive(Debug, Default)]
pub struct WakeRefTracker {
    active: AtomicU32,
    acquired: AtomicU64,
}

impl WakeRefTracker {
    /// Create a tracker with no references held
    pub const fn new() -> Self {
        Self {
            active: AtomicU32::new(0),
            acquired: AtomicU64::new(0),
        }
    }

    /// Take a reference, released when the guard drops
    pub fn acquire(&self) -> WakeRef<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        WakeRef { tracker: self }
    }

    /// References currently held
    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// References taken since creation
    pub fn total_acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }
}

/// RAII wake reference
#[derive(Debug)]
#[must_use = "the device may sleep as soon as the wake reference drops"]
pub struct WakeRef<'a> {
    tracker: &'a WakeRefTracker,
}

impl Drop for WakeRef<'_> {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases() {
        let t = WakeRefTracker::new();
        {
            let _a = t.acquire();
            let _b = t.acquire();
            assert_eq!(t.active(), 2);
        }
        assert_eq!(t.active(), 0);
        assert_eq!(t.total_acquired(), 2);
    }
}
