//! # Engines and Priorities
//!
//! Engine classes as the firmware numbers them, and the four GuC priority
//! levels that requests are folded into.

// =============================================================================
// ENGINE CLASS
// =============================================================================

/// Engine class as encoded in registration messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EngineClass {
    /// 3D / render
    Render = 0,
    /// Video decode
    Video = 1,
    /// Video enhancement
    VideoEnhance = 2,
    /// Blitter / copy
    Copy = 3,
    /// Compute
    Compute = 4,
}

impl EngineClass {
    /// Decode a class from its firmware number
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Render),
            1 => Some(Self::Video),
            2 => Some(Self::VideoEnhance),
            3 => Some(Self::Copy),
            4 => Some(Self::Compute),
            _ => None,
        }
    }

    /// Firmware number of this class
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

/// Highest engine instance number within a class
pub const MAX_ENGINE_INSTANCE: usize = 7;

/// Number of engine classes
pub const MAX_ENGINE_CLASS: usize = 5;

// =============================================================================
// GUC PRIORITY
// =============================================================================

/// Firmware scheduling priority, lower value runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum GucPriority {
    /// Kernel high (display-critical work)
    KmdHigh = 0,
    /// Boosted user work
    High = 1,
    /// Kernel normal, default for priority 0
    KmdNormal = 2,
    /// Deprioritised user work
    Normal = 3,
}

/// Number of GuC priority levels
pub const GUC_PRIORITY_COUNT: usize = 4;

/// Request priority at and above which work runs at `KmdHigh`
pub const DISPLAY_PRIORITY: i32 = 1024;

impl GucPriority {
    /// Fold a request priority into a GuC level
    pub fn from_request(prio: i32) -> Self {
        if prio >= DISPLAY_PRIORITY {
            Self::KmdHigh
        } else if prio > 0 {
            Self::High
        } else if prio == 0 {
            Self::KmdNormal
        } else {
            Self::Normal
        }
    }

    /// Level from index, clamping out-of-range values to `Normal`
    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => Self::KmdHigh,
            1 => Self::High,
            2 => Self::KmdNormal,
            _ => Self::Normal,
        }
    }

    /// Index into per-level tables
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Firmware encoding
    pub const fn raw(self) -> u32 {
        self as u32
    }
}
