//! # Lifecycle Telemetry
//!
//! Observers receive context lifecycle events after the submission backend
//! has released its locks. [`BusynessTracker`] is the in-tree observer: it
//! accumulates how long each context had scheduling enabled.

use hashbrown::HashMap;
use spin::Mutex;

use crate::types::ContextId;

/// Lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Context created
    Created(ContextId),
    /// Registered with firmware under an id
    Registered(ContextId, u16),
    /// Scheduling enabled (acknowledged)
    Enabled(ContextId),
    /// Scheduling disabled (acknowledged)
    Disabled(ContextId),
    /// Firmware registration dropped
    Deregistered(ContextId),
    /// Context freed
    Destroyed(ContextId),
    /// Context banned
    Banned(ContextId),
    /// Id taken from an idle context
    IdStolen {
        /// Previous holder
        from: ContextId,
        /// New holder
        to: ContextId,
        /// The id
        guc_id: u16,
    },
    /// Firmware reset handled
    Reset,
}

/// Consumer of lifecycle events
pub trait LifecycleObserver: Send + Sync {
    /// Called once per event, `now_ms` from the host clock
    fn on_event(&self, event: &LifecycleEvent, now_ms: u64);
}

// =============================================================================
// BUSYNESS
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Busyness {
    total_ms: u64,
    enabled_since: Option<u64>,
}

impl Busyness {
    fn stop(&mut self, now: u64) {
        if let Some(start) = self.enabled_since.take() {
            self.total_ms += now.saturating_sub(start);
        }
    }
}

/// Accumulates enabled time per context
#[derive(Debug, Default)]
pub struct BusynessTracker {
    contexts: Mutex<HashMap<ContextId, Busyness>>,
}

impl BusynessTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Enabled time of `ctx` up to `now`
    pub fn busy_ms(&self, ctx: ContextId, now: u64) -> u64 {
        self.contexts
            .lock()
            .get(&ctx)
            .map(|b| b.total_ms + b.enabled_since.map_or(0, |s| now.saturating_sub(s)))
            .unwrap_or(0)
    }

    /// Contexts currently tracked
    pub fn tracked(&self) -> usize {
        self.contexts.lock().len()
    }
}

impl LifecycleObserver for BusynessTracker {
    fn on_event(&self, event: &LifecycleEvent, now: u64) {
        let mut map = self.contexts.lock();
        match *event {
            LifecycleEvent::Enabled(ctx) => {
                let b = map.entry(ctx).or_default();
                if b.enabled_since.is_none() {
                    b.enabled_since = Some(now);
                }
            }
            LifecycleEvent::Disabled(ctx) | LifecycleEvent::Deregistered(ctx) => {
                if let Some(b) = map.get_mut(&ctx) {
                    b.stop(now);
                }
            }
            LifecycleEvent::Destroyed(ctx) => {
                map.remove(&ctx);
            }
            LifecycleEvent::Reset => {
                for b in map.values_mut() {
                    b.stop(now);
                }
            }
            _ => {}
        }
    }
}
