//! # Delayed Work
//!
//! Deadline queue for the deferred schedule-disable. Time comes from the
//! host clock in milliseconds; the owner polls [`DelayedWork::expired`].

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::types::ContextId;

/// One pending deadline per context
#[derive(Debug, Default)]
pub struct DelayedWork {
    by_deadline: BTreeSet<(u64, ContextId)>,
    by_context: HashMap<ContextId, u64>,
}

impl DelayedWork {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer of `ctx`
    pub fn schedule(&mut self, ctx: ContextId, deadline: u64) {
        self.cancel(ctx);
        self.by_deadline.insert((deadline, ctx));
        self.by_context.insert(ctx, deadline);
    }

    /// Disarm, returns whether a timer was armed
    pub fn cancel(&mut self, ctx: ContextId) -> bool {
        match self.by_context.remove(&ctx) {
            Some(deadline) => {
                self.by_deadline.remove(&(deadline, ctx));
                true
            }
            None => false,
        }
    }

    /// Whether `ctx` has an armed timer
    pub fn is_armed(&self, ctx: ContextId) -> bool {
        self.by_context.contains_key(&ctx)
    }

    /// Pop every timer due at `now`, earliest first
    pub fn expired(&mut self, now: u64) -> Vec<ContextId> {
        let mut due = Vec::new();
        while let Some(&(deadline, ctx)) = self.by_deadline.first() {
            if deadline > now {
                break;
            }
            self.by_deadline.remove(&(deadline, ctx));
            self.by_context.remove(&ctx);
            due.push(ctx);
        }
        due
    }

    /// Earliest deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.by_deadline.first().map(|&(d, _)| d)
    }

    /// Armed timers
    pub fn len(&self) -> usize {
        self.by_context.len()
    }

    /// Whether nothing is armed
    pub fn is_empty(&self) -> bool {
        self.by_context.is_empty()
    }

    /// Disarm everything
    pub fn clear(&mut self) {
        self.by_deadline.clear();
        self.by_context.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_order() {
        let mut t = DelayedWork::new();
        let a = ContextId::new(1, 0);
        let b = ContextId::new(2, 0);
        t.schedule(a, 50);
        t.schedule(b, 20);
        assert_eq!(t.next_deadline(), Some(20));
        assert!(t.expired(10).is_empty());
        assert_eq!(t.expired(60), vec![b, a]);
        assert!(t.is_empty());
    }

    #[test]
    fn test_rearm_and_cancel() {
        let mut t = DelayedWork::new();
        let a = ContextId::new(1, 0);
        t.schedule(a, 10);
        t.schedule(a, 100);
        assert_eq!(t.len(), 1);
        assert!(t.expired(50).is_empty());
        assert!(t.cancel(a));
        assert!(!t.cancel(a));
        assert!(!t.is_armed(a));
    }
}
