//! # Core Types
//!
//! Identifiers shared by every part of the submission backend.

use core::fmt;

use helix_guc_abi::EngineClass;

// =============================================================================
// CONTEXT ID
// =============================================================================

/// Arena handle of a scheduling context
///
/// The generation makes a stale handle to a freed slot harmless: lookups with
/// an outdated generation fail instead of reaching the slot's new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId {
    index: u32,
    generation: u32,
}

impl ContextId {
    /// Create a handle
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}.{}", self.index, self.generation)
    }
}

// =============================================================================
// GUC ID
// =============================================================================

/// Which part of the id space an id came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdPartition {
    /// Single-context pool
    Single,
    /// Contiguous multi-context region
    Multi,
}

/// A firmware context id held by a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GucId {
    /// Id (the parent's id for a parallel group)
    pub id: u16,
    /// Contexts covered, children use `id + 1 + n`
    pub width: u8,
    /// Source partition
    pub partition: IdPartition,
}

impl GucId {
    /// Single-context id
    pub const fn single(id: u16) -> Self {
        Self {
            id,
            width: 1,
            partition: IdPartition::Single,
        }
    }

    /// Id of child `idx`
    pub const fn child(&self, idx: usize) -> u16 {
        self.id + 1 + idx as u16
    }
}

impl fmt::Display for GucId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            IdPartition::Single => write!(f, "{}", self.id),
            IdPartition::Multi => write!(f, "{}+{}", self.id, self.width - 1),
        }
    }
}

// =============================================================================
// ENGINE MASK
// =============================================================================

/// Physical engines, one bit per (class, instance)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EngineMask(pub u64);

impl EngineMask {
    /// No engines
    pub const EMPTY: Self = Self(0);
    /// Every engine
    pub const ALL: Self = Self(u64::MAX);

    const INSTANCES_PER_CLASS: u32 = 8;

    /// Mask of a single engine
    pub const fn engine(class: EngineClass, instance: u8) -> Self {
        Self(1 << (class as u32 * Self::INSTANCES_PER_CLASS + (instance as u32 & 7)))
    }

    /// Union
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether any engine is shared
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the mask is empty
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_mask() {
        let rcs0 = EngineMask::engine(EngineClass::Render, 0);
        let vcs1 = EngineMask::engine(EngineClass::Video, 1);
        assert_eq!(vcs1.0, 1 << 9);
        let both = rcs0.union(vcs1);
        assert!(both.intersects(rcs0));
        assert!(!rcs0.intersects(vcs1));
        assert!(EngineMask::EMPTY.is_empty());
    }

    #[test]
    fn test_guc_id_children() {
        let id = GucId {
            id: 16,
            width: 3,
            partition: IdPartition::Multi,
        };
        assert_eq!(id.child(0), 17);
        assert_eq!(id.child(1), 18);
        assert_eq!(GucId::single(5).width, 1);
    }
}
