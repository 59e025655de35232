//! # GuC ID Allocation
//!
//! The firmware id space is split in two:
//!
//! ```text
//! 0                  num >> shift                              num
//! ├──── multi-context ────┼────────────── single-context ───────────┤
//!   power-of-two aligned      lowest free id first,
//!   regions for parallel      stolen from idle contexts
//!   groups                    when exhausted
//! ```
//!
//! [`IdTable`] bundles the allocator with id ownership, the firmware lookup
//! table (ids currently registered with the GuC) and the idle LRU list. It is
//! protected by the id-table lock.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::{HashMap, HashSet};

use crate::types::{ContextId, GucId, IdPartition};

// =============================================================================
// BITMAP
// =============================================================================

const BITS: usize = u64::BITS as usize;

/// Fixed-size bitmap
#[derive(Debug, Clone)]
pub struct IdBitmap {
    words: Vec<u64>,
    len: usize,
}

impl IdBitmap {
    /// All-clear bitmap of `len` bits
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(BITS)],
            len,
        }
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitmap has no bits
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Test a bit
    pub fn test(&self, bit: usize) -> bool {
        bit < self.len && self.words[bit / BITS] & (1 << (bit % BITS)) != 0
    }

    /// Set a bit
    pub fn set(&mut self, bit: usize) {
        if bit < self.len {
            self.words[bit / BITS] |= 1 << (bit % BITS);
        }
    }

    /// Clear a bit
    pub fn clear(&mut self, bit: usize) {
        if bit < self.len {
            self.words[bit / BITS] &= !(1 << (bit % BITS));
        }
    }

    /// First clear bit in `[start, end)`
    pub fn next_zero(&self, start: usize, end: usize) -> Option<usize> {
        let end = end.min(self.len);
        let mut bit = start;
        while bit < end {
            let word = self.words[bit / BITS] | ((1u64 << (bit % BITS)) - 1);
            if word != u64::MAX {
                let found = (bit / BITS) * BITS + (!word).trailing_zeros() as usize;
                return (found < end).then_some(found);
            }
            bit = (bit / BITS + 1) * BITS;
        }
        None
    }

    /// First clear region of `1 << order` bits aligned to its size in
    /// `[start, end)`, `start` must be aligned
    pub fn find_free_region(&self, start: usize, end: usize, order: u32) -> Option<usize> {
        let size = 1usize << order;
        let end = end.min(self.len);
        let mut pos = start;
        while pos + size <= end {
            if (pos..pos + size).all(|b| !self.test(b)) {
                return Some(pos);
            }
            pos += size;
        }
        None
    }
}

// =============================================================================
// ALLOCATOR
// =============================================================================

/// Allocation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdError {
    /// Single pool is full
    Exhausted,
    /// No aligned region free in the multi-context reservation
    NoSpace,
}

/// Bitmap allocator over the partitioned id space
#[derive(Debug, Clone)]
pub struct GucIdAllocator {
    bitmap: IdBitmap,
    multi_ids: usize,
    used_single: u32,
    used_multi: u32,
}

impl GucIdAllocator {
    /// Allocator over `num_ids`, the first `multi_ids` reserved
    pub fn new(num_ids: u32, multi_ids: u32) -> Self {
        Self {
            bitmap: IdBitmap::new(num_ids as usize),
            multi_ids: multi_ids as usize,
            used_single: 0,
            used_multi: 0,
        }
    }

    fn region_order(width: u8) -> u32 {
        (width.max(1) as u32).next_power_of_two().trailing_zeros()
    }

    /// Allocate one single id, or a contiguous region for a parallel group
    pub fn allocate(&mut self, is_parallel: bool, width: u8) -> Result<GucId, IdError> {
        if is_parallel {
            let order = Self::region_order(width);
            let base = self
                .bitmap
                .find_free_region(0, self.multi_ids, order)
                .ok_or(IdError::NoSpace)?;
            for b in base..base + (1 << order) {
                self.bitmap.set(b);
            }
            self.used_multi += 1;
            Ok(GucId {
                id: base as u16,
                width,
                partition: IdPartition::Multi,
            })
        } else {
            let id = self
                .bitmap
                .next_zero(self.multi_ids, self.bitmap.len())
                .ok_or(IdError::Exhausted)?;
            self.bitmap.set(id);
            self.used_single += 1;
            Ok(GucId::single(id as u16))
        }
    }

    /// Return an id (or region) to the pool
    pub fn release(&mut self, id: GucId) {
        match id.partition {
            IdPartition::Single => {
                if self.bitmap.test(id.id as usize) {
                    self.bitmap.clear(id.id as usize);
                    self.used_single -= 1;
                }
            }
            IdPartition::Multi => {
                let base = id.id as usize;
                if self.bitmap.test(base) {
                    for b in base..base + (1 << Self::region_order(id.width)) {
                        self.bitmap.clear(b);
                    }
                    self.used_multi -= 1;
                }
            }
        }
    }

    /// Whether an id is currently allocated
    pub fn is_allocated(&self, id: u16) -> bool {
        self.bitmap.test(id as usize)
    }

    /// Single ids in use
    pub fn used_single(&self) -> u32 {
        self.used_single
    }

    /// Parallel groups holding a region
    pub fn used_multi(&self) -> u32 {
        self.used_multi
    }
}

// =============================================================================
// ID TABLE
// =============================================================================

/// Id ownership, firmware registrations and the idle list
#[derive(Debug)]
pub struct IdTable {
    alloc: GucIdAllocator,
    /// Id → context currently holding it
    owners: HashMap<u16, ContextId>,
    /// Id → context the firmware has registered under it
    registered: HashMap<u16, ContextId>,
    /// Ids with a DEREGISTER_CONTEXT awaiting its reply
    deregistering: HashSet<u16>,
    /// Unpinned single-id holders, least recently used first
    idle: VecDeque<ContextId>,
}

impl IdTable {
    /// Empty table
    pub fn new(num_ids: u32, multi_ids: u32) -> Self {
        Self {
            alloc: GucIdAllocator::new(num_ids, multi_ids),
            owners: HashMap::new(),
            registered: HashMap::new(),
            deregistering: HashSet::new(),
            idle: VecDeque::new(),
        }
    }

    /// Allocate an id for `ctx`
    pub fn allocate(
        &mut self,
        ctx: ContextId,
        is_parallel: bool,
        width: u8,
    ) -> Result<GucId, IdError> {
        let id = self.alloc.allocate(is_parallel, width)?;
        self.owners.insert(id.id, ctx);
        Ok(id)
    }

    /// Give a held id to a new owner; the old owner must be told separately
    pub fn transfer(&mut self, id: u16, to: ContextId) -> Option<ContextId> {
        self.owners.insert(id, to)
    }

    /// Release an id held by `ctx`
    pub fn release(&mut self, ctx: ContextId, id: GucId) {
        if self.owners.get(&id.id) == Some(&ctx) {
            self.owners.remove(&id.id);
            self.alloc.release(id);
        }
        self.remove_idle(ctx);
    }

    /// Context holding an id
    pub fn owner(&self, id: u16) -> Option<ContextId> {
        self.owners.get(&id).copied()
    }

    /// Context the firmware knows under an id
    pub fn lookup(&self, id: u16) -> Option<ContextId> {
        self.registered.get(&id).copied()
    }

    /// Record a firmware registration
    pub fn set_registered(&mut self, id: u16, ctx: ContextId) {
        self.registered.insert(id, ctx);
    }

    /// Drop a firmware registration
    pub fn clear_registered(&mut self, id: u16) -> Option<ContextId> {
        self.deregistering.remove(&id);
        self.registered.remove(&id)
    }

    /// Record a DEREGISTER_CONTEXT sent for `id`; false if one is already
    /// waiting for its reply
    pub fn begin_deregister(&mut self, id: u16) -> bool {
        self.deregistering.insert(id)
    }

    /// Whether a DEREGISTER_CONTEXT for `id` awaits its reply
    pub fn deregister_pending(&self, id: u16) -> bool {
        self.deregistering.contains(&id)
    }

    /// Every firmware registration
    pub fn registered(&self) -> impl Iterator<Item = (u16, ContextId)> + '_ {
        self.registered.iter().map(|(&id, &ctx)| (id, ctx))
    }

    /// Forget every firmware registration
    pub fn clear_all_registered(&mut self) {
        self.registered.clear();
        self.deregistering.clear();
    }

    /// Append a context to the idle list
    pub fn push_idle(&mut self, ctx: ContextId) {
        if !self.idle.contains(&ctx) {
            self.idle.push_back(ctx);
        }
    }

    /// Remove a context from the idle list
    pub fn remove_idle(&mut self, ctx: ContextId) -> bool {
        if let Some(pos) = self.idle.iter().position(|&c| c == ctx) {
            self.idle.remove(pos);
            true
        } else {
            false
        }
    }

    /// Idle contexts, least recently used first
    pub fn idle(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.idle.iter().copied()
    }

    /// Take the least recently used idle context accepted by `stealable`
    pub fn steal_one(&mut self, mut stealable: impl FnMut(ContextId) -> bool) -> Option<ContextId> {
        let pos = self.idle.iter().position(|&c| stealable(c))?;
        self.idle.remove(pos)
    }

    /// Single ids in use
    pub fn used_single(&self) -> u32 {
        self.alloc.used_single()
    }

    /// Underlying allocator
    pub fn allocator(&self) -> &GucIdAllocator {
        &self.alloc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_next_zero() {
        let mut b = IdBitmap::new(130);
        for i in 0..70 {
            b.set(i);
        }
        assert_eq!(b.next_zero(0, 130), Some(70));
        assert_eq!(b.next_zero(71, 130), Some(71));
        b.clear(3);
        assert_eq!(b.next_zero(0, 130), Some(3));
        for i in 70..130 {
            b.set(i);
        }
        assert_eq!(b.next_zero(4, 130), None);
        assert_eq!(b.next_zero(0, 3), None);
    }

    #[test]
    fn test_bitmap_region() {
        let mut b = IdBitmap::new(16);
        b.set(1);
        assert_eq!(b.find_free_region(0, 16, 2), Some(4));
        assert_eq!(b.find_free_region(0, 16, 0), Some(0));
        b.set(9);
        assert_eq!(b.find_free_region(0, 16, 3), None);
    }

    #[test]
    fn test_single_pool_lowest_first() {
        let mut a = GucIdAllocator::new(32, 8);
        assert_eq!(a.allocate(false, 1).unwrap().id, 8);
        assert_eq!(a.allocate(false, 1).unwrap().id, 9);
        a.release(GucId::single(8));
        assert_eq!(a.allocate(false, 1).unwrap().id, 8);
        assert_eq!(a.used_single(), 2);
    }

    #[test]
    fn test_single_exhaustion() {
        let mut a = GucIdAllocator::new(10, 8);
        assert!(a.allocate(false, 1).is_ok());
        assert!(a.allocate(false, 1).is_ok());
        assert_eq!(a.allocate(false, 1), Err(IdError::Exhausted));
    }

    #[test]
    fn test_multi_regions_aligned() {
        let mut a = GucIdAllocator::new(64, 16);
        let g1 = a.allocate(true, 3).unwrap();
        assert_eq!((g1.id, g1.width, g1.partition), (0, 3, IdPartition::Multi));
        let g2 = a.allocate(true, 2).unwrap();
        assert_eq!(g2.id, 4);
        let g3 = a.allocate(true, 5).unwrap();
        assert_eq!(g3.id, 8);
        assert_eq!(a.allocate(true, 2).unwrap().id, 6);
        assert_eq!(a.allocate(true, 2), Err(IdError::NoSpace));
        a.release(g1);
        assert!(!a.is_allocated(3));
        assert_eq!(a.allocate(true, 4).unwrap().id, 0);
        // single pool is untouched
        assert_eq!(a.allocate(false, 1).unwrap().id, 16);
    }

    #[test]
    fn test_ids_unique() {
        let mut a = GucIdAllocator::new(256, 16);
        let mut seen = hashbrown::HashSet::new();
        while let Ok(id) = a.allocate(false, 1) {
            assert!(seen.insert(id.id));
        }
        assert_eq!(seen.len(), 240);
    }

    #[test]
    fn test_table_steal_lru() {
        let mut t = IdTable::new(32, 8);
        let a = ContextId::new(1, 0);
        let b = ContextId::new(2, 0);
        let c = ContextId::new(3, 0);
        let id = t.allocate(a, false, 1).unwrap();
        t.push_idle(a);
        t.push_idle(b);
        t.push_idle(a);
        assert_eq!(t.idle().count(), 2);
        assert_eq!(t.steal_one(|ctx| ctx != a), Some(b));
        assert_eq!(t.steal_one(|_| true), Some(a));
        assert_eq!(t.steal_one(|_| true), None);
        assert_eq!(t.transfer(id.id, c), Some(a));
        assert_eq!(t.owner(id.id), Some(c));
        // the previous owner can no longer release it
        t.release(a, id);
        assert!(t.allocator().is_allocated(id.id));
        t.release(c, id);
        assert!(!t.allocator().is_allocated(id.id));
    }

    #[test]
    fn test_deregister_tracked_until_cleared() {
        let mut t = IdTable::new(32, 8);
        let a = ContextId::new(1, 0);
        t.set_registered(5, a);
        assert!(t.begin_deregister(5));
        assert!(!t.begin_deregister(5));
        assert!(t.deregister_pending(5));
        assert_eq!(t.clear_registered(5), Some(a));
        assert!(!t.deregister_pending(5));

        t.set_registered(6, a);
        t.begin_deregister(6);
        t.clear_all_registered();
        assert!(!t.deregister_pending(6));
        assert_eq!(t.lookup(6), None);
    }
}
