//! # Completion Fences
//!
//! Each request carries a fence that is signalled when it retires or failed
//! with a reason. The first resolution wins; later attempts are ignored.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

const PENDING: u32 = 0;
const SIGNALED: u32 = 1;
const ERROR_BASE: u32 = 16;

/// Why a fence failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FenceError {
    /// Context was banned
    Banned = 0,
    /// Request was cancelled
    Cancelled = 1,
    /// Request was running on an engine that hung
    Guilty = 2,
    /// Firmware reset the context
    ContextReset = 3,
    /// Device is wedged
    Wedged = 4,
}

impl FenceError {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Banned,
            1 => Self::Cancelled,
            2 => Self::Guilty,
            3 => Self::ContextReset,
            _ => Self::Wedged,
        }
    }
}

impl fmt::Display for FenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Banned => write!(f, "context banned"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Guilty => write!(f, "guilty of engine hang"),
            Self::ContextReset => write!(f, "context reset by firmware"),
            Self::Wedged => write!(f, "device wedged"),
        }
    }
}

/// Observable fence state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// Not resolved yet
    Pending,
    /// Completed successfully
    Signaled,
    /// Failed
    Failed(FenceError),
}

/// Shared completion fence
#[derive(Debug, Clone, Default)]
pub struct Fence {
    state: Arc<AtomicU32>,
}

impl Fence {
    /// Create a pending fence
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, value: u32) -> bool {
        self.state
            .compare_exchange(PENDING, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark complete, returns false if already resolved
    pub fn signal(&self) -> bool {
        self.resolve(SIGNALED)
    }

    /// Mark failed, returns false if already resolved
    pub fn fail(&self, err: FenceError) -> bool {
        self.resolve(ERROR_BASE + err as u32)
    }

    /// Current state
    pub fn status(&self) -> FenceStatus {
        match self.state.load(Ordering::Acquire) {
            PENDING => FenceStatus::Pending,
            SIGNALED => FenceStatus::Signaled,
            v => FenceStatus::Failed(FenceError::from_raw(v - ERROR_BASE)),
        }
    }

    /// Whether the fence resolved either way
    pub fn is_resolved(&self) -> bool {
        self.status() != FenceStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_resolution_wins() {
        let f = Fence::new();
        let g = f.clone();
        assert_eq!(f.status(), FenceStatus::Pending);
        assert!(g.fail(FenceError::Guilty));
        assert!(!f.signal());
        assert_eq!(f.status(), FenceStatus::Failed(FenceError::Guilty));
        assert!(f.is_resolved());
    }

    #[test]
    fn test_signal() {
        let f = Fence::new();
        assert!(f.signal());
        assert_eq!(f.status(), FenceStatus::Signaled);
    }
}
