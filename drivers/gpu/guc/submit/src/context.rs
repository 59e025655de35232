//! # Scheduling Contexts
//!
//! Contexts live in an arena and are addressed by [`ContextId`]. A parallel
//! group is a parent plus children; children only hold the parent's id, the
//! parent owns the scratch page and the group's GuC id region.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use helix_guc_abi::engine::GUC_PRIORITY_COUNT;
use helix_guc_abi::{EngineClass, GucPriority, PolicyKlvs};
use spin::{Mutex, RwLock};

use crate::request::Request;
use crate::state::ContextState;
use crate::types::{ContextId, EngineMask, GucId};
use crate::wq::{ParentScratch, WorkQueue};

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Immutable description of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextDesc {
    /// Engine class
    pub class: EngineClass,
    /// Logical engines the firmware may place the context on
    pub logical_mask: u32,
    /// Physical engines, used to find guilty contexts on reset
    pub engines: EngineMask,
    /// Hardware context pointer
    pub lrca: u64,
    /// Kernel-owned context
    pub kernel: bool,
}

/// Description of a parallel group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelDesc {
    /// Parent context
    pub parent: ContextDesc,
    /// Children in submission order
    pub children: Vec<ContextDesc>,
    /// GGTT address of the parent scratch page
    pub scratch_addr: u64,
}

/// Scheduling policy values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextPolicy {
    /// Execution quantum (µs)
    pub exec_quantum_us: u32,
    /// Preemption timeout (µs)
    pub preempt_timeout_us: u32,
    /// Preempt to idle
    pub preempt_to_idle: bool,
}

// =============================================================================
// MUTABLE STATE
// =============================================================================

/// State guarded by the per-context lock
#[derive(Debug)]
pub(crate) struct ContextInner {
    pub(crate) state: ContextState,
    pub(crate) guc_id: Option<GucId>,
    pub(crate) pin_count: u32,
    pub(crate) prio: GucPriority,
    pub(crate) prio_count: [u32; GUC_PRIORITY_COUNT],
    pub(crate) policy: ContextPolicy,
    /// Requests submitted and not yet retired or failed
    pub(crate) outstanding: u32,
    /// Requests held back until the context may run again
    pub(crate) fenced: VecDeque<Request>,
    /// Requests handed to the firmware, oldest first
    pub(crate) inflight: VecDeque<Request>,
    pub(crate) ring_tail: u32,
    pub(crate) wq: WorkQueue,
    pub(crate) guilty_count: u32,
    /// Blocks to drop once the pending disable is acknowledged
    pub(crate) unblock_on_disable: u16,
    /// Tail moved while the context could not be scheduled
    pub(crate) kick_pending: bool,
}

impl ContextInner {
    fn new(policy: ContextPolicy) -> Self {
        Self {
            state: ContextState::new(),
            guc_id: None,
            pin_count: 0,
            prio: GucPriority::KmdNormal,
            prio_count: [0; GUC_PRIORITY_COUNT],
            policy,
            outstanding: 0,
            fenced: VecDeque::new(),
            inflight: VecDeque::new(),
            ring_tail: 0,
            wq: WorkQueue::new(),
            guilty_count: 0,
            unblock_on_disable: 0,
            kick_pending: false,
        }
    }

    fn recompute_prio(&mut self) -> bool {
        let new = self
            .prio_count
            .iter()
            .position(|&c| c > 0)
            .map(GucPriority::from_index)
            .unwrap_or(self.prio);
        let changed = new != self.prio;
        self.prio = new;
        if changed {
            self.state.set_policy_required();
        }
        changed
    }

    /// Account a new request, returns whether the context priority changed
    pub(crate) fn account_request(&mut self, prio: GucPriority) -> bool {
        self.prio_count[prio.index()] += 1;
        self.outstanding += 1;
        self.recompute_prio()
    }

    /// Drop a finished request from the books
    pub(crate) fn release_request(&mut self, prio: GucPriority) {
        let slot = &mut self.prio_count[prio.index()];
        *slot = slot.saturating_sub(1);
        self.outstanding = self.outstanding.saturating_sub(1);
        self.recompute_prio();
    }

    /// Hold a request back, keeping submission order
    pub(crate) fn fence_request(&mut self, req: Request) {
        let pos = self
            .fenced
            .iter()
            .position(|f| f.seqno() > req.seqno())
            .unwrap_or(self.fenced.len());
        self.fenced.insert(pos, req);
    }

    /// Policy KLVs for the current priority
    pub(crate) fn policy_klvs(&self) -> PolicyKlvs {
        PolicyKlvs {
            execution_quantum_us: self.policy.exec_quantum_us,
            preemption_timeout_us: self.policy.preempt_timeout_us,
            priority: self.prio.raw(),
            preempt_to_idle: self.policy.preempt_to_idle,
        }
    }

    /// Unpinned with nothing left to run
    pub(crate) fn drained(&self) -> bool {
        self.pin_count == 0 && self.outstanding == 0
    }

    /// Drop the blocks held until a disable landed
    pub(crate) fn release_disable_blocks(&mut self, id: ContextId) {
        for _ in 0..mem::take(&mut self.unblock_on_disable) {
            if let Err(e) = self.state.unblock() {
                log::warn!("guc: {}: {}", id, e);
            }
        }
    }

    /// Work is on the firmware's books but nothing will schedule it
    pub(crate) fn needs_enable(&self) -> bool {
        !self.inflight.is_empty()
            && self.guc_id.is_some()
            && !self.state.enabled()
            && !self.state.pending_enable()
            && !self.state.must_fence()
            && !self.state.banned()
    }

    /// Whether the id can be handed to another context
    pub(crate) fn stealable(&self) -> bool {
        self.pin_count == 0
            && self.outstanding == 0
            && self.state.is_idle()
            && !self.state.destroyed()
            && self.guc_id.is_some()
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// A scheduling context
#[derive(Debug)]
pub struct Context {
    id: ContextId,
    desc: ContextDesc,
    parent: Option<ContextId>,
    child_index: Option<u8>,
    children: Vec<ContextId>,
    scratch: Option<Arc<ParentScratch>>,
    refcount: AtomicU32,
    /// Creator reference dropped
    released: AtomicBool,
    pub(crate) inner: Mutex<ContextInner>,
}

impl Context {
    pub(crate) fn new(id: ContextId, desc: ContextDesc, policy: ContextPolicy) -> Self {
        Self {
            id,
            desc,
            parent: None,
            child_index: None,
            children: Vec::new(),
            scratch: None,
            refcount: AtomicU32::new(1),
            released: AtomicBool::new(false),
            inner: Mutex::new(ContextInner::new(policy)),
        }
    }

    pub(crate) fn new_parent(
        id: ContextId,
        desc: ContextDesc,
        policy: ContextPolicy,
        children: Vec<ContextId>,
        scratch: Arc<ParentScratch>,
    ) -> Self {
        Self {
            children,
            scratch: Some(scratch),
            ..Self::new(id, desc, policy)
        }
    }

    pub(crate) fn new_child(
        id: ContextId,
        desc: ContextDesc,
        policy: ContextPolicy,
        parent: ContextId,
        index: u8,
    ) -> Self {
        Self {
            parent: Some(parent),
            child_index: Some(index),
            ..Self::new(id, desc, policy)
        }
    }

    /// Handle
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Descriptor
    pub fn desc(&self) -> &ContextDesc {
        &self.desc
    }

    /// Parent of a child context
    pub fn parent(&self) -> Option<ContextId> {
        self.parent
    }

    /// Position among the parent's children
    pub fn child_index(&self) -> Option<usize> {
        self.child_index.map(usize::from)
    }

    /// Children of a parent context
    pub fn children(&self) -> &[ContextId] {
        &self.children
    }

    /// Parent of a parallel group
    pub fn is_parent(&self) -> bool {
        !self.children.is_empty()
    }

    /// Member of a parallel group
    pub fn is_parallel(&self) -> bool {
        self.is_parent() || self.parent.is_some()
    }

    /// Contexts in the group (1 for single contexts)
    pub fn width(&self) -> u8 {
        (self.children.len() + 1) as u8
    }

    /// Scratch page of a parent
    pub fn scratch(&self) -> Option<&Arc<ParentScratch>> {
        self.scratch.as_ref()
    }

    /// Take a reference
    pub(crate) fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference unless it is the last one
    pub(crate) fn put_unless_last(&self) -> bool {
        let mut cur = self.refcount.load(Ordering::Acquire);
        loop {
            if cur <= 1 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drop a reference, returns true if it was the last; the caller must
    /// hold the id-table lock
    pub(crate) fn put_locked(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            log::error!("guc: {} reference count underflow", self.id);
            self.refcount.store(0, Ordering::Release);
            return false;
        }
        prev == 1
    }

    /// Give up the creator reference once, returns false if already done
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    /// Current reference count
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Point-in-time view
    pub fn snapshot(&self) -> ContextSnapshot {
        let inner = self.inner.lock();
        ContextSnapshot {
            id: self.id,
            state: inner.state,
            guc_id: inner.guc_id,
            pin_count: inner.pin_count,
            refcount: self.refcount(),
            prio: inner.prio,
            outstanding: inner.outstanding,
            fenced: inner.fenced.len(),
            inflight: inner.inflight.len(),
            guilty_count: inner.guilty_count,
            parent: self.parent,
            children: self.children.len(),
        }
    }
}

/// Copy of a context's observable state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSnapshot {
    /// Handle
    pub id: ContextId,
    /// State flags
    pub state: ContextState,
    /// Held id
    pub guc_id: Option<GucId>,
    /// Pins
    pub pin_count: u32,
    /// References
    pub refcount: u32,
    /// GuC priority
    pub prio: GucPriority,
    /// Requests not retired
    pub outstanding: u32,
    /// Held-back requests
    pub fenced: usize,
    /// Requests owned by firmware
    pub inflight: usize,
    /// Times found guilty
    pub guilty_count: u32,
    /// Parent, for children
    pub parent: Option<ContextId>,
    /// Children, for parents
    pub children: usize,
}

// =============================================================================
// ARENA
// =============================================================================

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    ctx: Option<Arc<Context>>,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Slots {
    fn reserve(&mut self) -> ContextId {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        ContextId::new(index, self.slots[index as usize].generation)
    }
}

/// Arena of live contexts
#[derive(Debug, Default)]
pub struct ContextArena {
    slots: RwLock<Slots>,
}

impl ContextArena {
    /// Empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `n` contexts built from their freshly reserved ids
    pub(crate) fn insert_group(
        &self,
        n: usize,
        build: impl FnOnce(&[ContextId]) -> Vec<Context>,
    ) -> Vec<ContextId> {
        let mut slots = self.slots.write();
        let ids: Vec<ContextId> = (0..n).map(|_| slots.reserve()).collect();
        for ctx in build(&ids) {
            let index = ctx.id().index() as usize;
            slots.slots[index].ctx = Some(Arc::new(ctx));
        }
        ids
    }

    /// Look up a live context
    pub fn get(&self, id: ContextId) -> Option<Arc<Context>> {
        let slots = self.slots.read();
        let slot = slots.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.ctx.clone()
    }

    /// Free a slot, invalidating its id
    pub(crate) fn remove(&self, id: ContextId) -> Option<Arc<Context>> {
        let mut slots = self.slots.write();
        let slot = slots.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let ctx = slot.ctx.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(id.index());
        Some(ctx)
    }

    /// Every live context
    pub fn all(&self) -> Vec<Arc<Context>> {
        self.slots
            .read()
            .slots
            .iter()
            .filter_map(|s| s.ctx.clone())
            .collect()
    }

    /// Live contexts
    pub fn len(&self) -> usize {
        self.slots.read().slots.iter().filter(|s| s.ctx.is_some()).count()
    }

    /// Whether no context is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn desc() -> ContextDesc {
        ContextDesc {
            class: EngineClass::Render,
            logical_mask: 1,
            engines: EngineMask::engine(EngineClass::Render, 0),
            lrca: 0x1000,
            kernel: false,
        }
    }

    fn policy() -> ContextPolicy {
        ContextPolicy {
            exec_quantum_us: 1000,
            preempt_timeout_us: 640_000,
            preempt_to_idle: false,
        }
    }

    #[test]
    fn test_arena_generation() {
        let arena = ContextArena::new();
        let ids = arena.insert_group(1, |ids| vec![Context::new(ids[0], desc(), policy())]);
        let a = ids[0];
        assert!(arena.get(a).is_some());
        assert!(arena.remove(a).is_some());
        assert!(arena.get(a).is_none());
        let b = arena.insert_group(1, |ids| vec![Context::new(ids[0], desc(), policy())])[0];
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert!(arena.get(a).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_refcount_last_put() {
        let ctx = Context::new(ContextId::new(0, 0), desc(), policy());
        ctx.get();
        assert!(ctx.put_unless_last());
        assert!(!ctx.put_unless_last());
        assert!(ctx.put_locked());
        assert_eq!(ctx.refcount(), 0);
    }

    #[test]
    fn test_priority_tracking() {
        let ctx = Context::new(ContextId::new(0, 0), desc(), policy());
        let mut inner = ctx.inner.lock();
        inner.state.mark_registered().unwrap();
        inner.state.clear_policy_required();
        assert!(inner.account_request(GucPriority::High));
        assert!(inner.state.policy_required());
        assert!(!inner.account_request(GucPriority::Normal));
        assert_eq!(inner.prio, GucPriority::High);
        inner.release_request(GucPriority::High);
        assert_eq!(inner.prio, GucPriority::Normal);
        assert_eq!(inner.policy_klvs().priority, 3);
        inner.release_request(GucPriority::Normal);
        assert_eq!(inner.outstanding, 0);
        // no requests left: priority stays where it was
        assert_eq!(inner.prio, GucPriority::Normal);
    }

    #[test]
    fn test_disable_blocks_out_of_sync() {
        let ctx = Context::new(ContextId::new(0, 0), desc(), policy());
        let mut inner = ctx.inner.lock();
        inner.state.block();
        // one more than was taken: the extra is reported, not applied
        inner.unblock_on_disable = 2;
        inner.release_disable_blocks(ctx.id());
        assert_eq!(inner.state.blocked(), 0);
        assert_eq!(inner.unblock_on_disable, 0);
    }

    #[test]
    fn test_drained_needs_unpin_and_no_work() {
        let ctx = Context::new(ContextId::new(0, 0), desc(), policy());
        let mut inner = ctx.inner.lock();
        assert!(inner.drained());
        inner.account_request(GucPriority::Normal);
        assert!(!inner.drained());
        inner.release_request(GucPriority::Normal);
        inner.pin_count = 1;
        assert!(!inner.drained());
    }
}
