//! # Requests and the Priority Queue
//!
//! Requests wait in a priority queue until the dispatcher hands them to the
//! firmware. Ordering is strict across priority levels and FIFO within a
//! level. A context's own requests never overtake each other: queueing a
//! request raises that context's lower-priority queued requests to its level.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::cmp::Reverse;
use core::ops::Bound;

use arrayvec::ArrayVec;
use helix_guc_abi::engine::MAX_ENGINE_INSTANCE;
use helix_guc_abi::GucPriority;

use crate::error::{Result, SubmitError};
use crate::fence::Fence;
use crate::types::{ContextId, EngineMask};

// =============================================================================
// REQUEST
// =============================================================================

/// A unit of GPU work for one context
#[derive(Debug)]
pub struct Request {
    seqno: u64,
    context: ContextId,
    priority: i32,
    guc_prio: GucPriority,
    engines: EngineMask,
    /// Ring tail in bytes after this request
    tail: u32,
    /// Ring tails of each child, parallel contexts only
    child_tails: ArrayVec<u32, MAX_ENGINE_INSTANCE>,
    fence: Fence,
}

impl Request {
    /// New request; higher `priority` runs first
    pub fn new(context: ContextId, priority: i32, tail: u32) -> Self {
        Self {
            seqno: 0,
            context,
            priority,
            guc_prio: GucPriority::from_request(priority),
            engines: EngineMask::EMPTY,
            tail,
            child_tails: ArrayVec::new(),
            fence: Fence::new(),
        }
    }

    /// Engines the request may execute on
    pub fn on_engines(mut self, engines: EngineMask) -> Self {
        self.engines = engines;
        self
    }

    /// Per-child ring tails for a parallel submission
    pub fn with_child_tails(mut self, tails: &[u32]) -> Result<Self> {
        self.child_tails.clear();
        self.child_tails
            .try_extend_from_slice(tails)
            .map_err(|_| SubmitError::InvalidParameter)?;
        Ok(self)
    }

    /// Submission order, assigned on submit
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub(crate) fn set_seqno(&mut self, seqno: u64) {
        self.seqno = seqno;
    }

    /// Owning context
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Effective priority (raised by later requests of the same context)
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// GuC priority bucket accounted at submission
    pub fn guc_priority(&self) -> GucPriority {
        self.guc_prio
    }

    /// Execution engines
    pub fn engines(&self) -> EngineMask {
        self.engines
    }

    /// Ring tail in bytes
    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Child ring tails in bytes
    pub fn child_tails(&self) -> &[u32] {
        &self.child_tails
    }

    /// Completion fence
    pub fn fence(&self) -> &Fence {
        &self.fence
    }
}

// =============================================================================
// PRIORITY QUEUE
// =============================================================================

/// Priority-ordered queue of runnable requests
#[derive(Debug, Default)]
pub struct PriorityQueue {
    levels: BTreeMap<Reverse<i32>, VecDeque<Request>>,
    len: usize,
}

impl PriorityQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued requests
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Queue a request behind everything at its level
    pub fn push(&mut self, mut req: Request) {
        let prio = req.priority;
        let ctx = req.context;

        let mut raised = Vec::new();
        for (_, q) in self
            .levels
            .range_mut((Bound::Excluded(Reverse(prio)), Bound::Unbounded))
        {
            let mut i = 0;
            while i < q.len() {
                if q[i].context == ctx {
                    if let Some(r) = q.remove(i) {
                        raised.push(r);
                    }
                } else {
                    i += 1;
                }
            }
        }
        if !raised.is_empty() {
            self.levels.retain(|_, q| !q.is_empty());
            raised.sort_by_key(|r| r.seqno);
        }

        let level = self.levels.entry(Reverse(prio)).or_default();
        for mut r in raised {
            r.priority = prio;
            level.push_back(r);
        }
        req.priority = prio;
        level.push_back(req);
        self.len += 1;
    }

    /// Put requests back at the front of their levels, keeping their order
    pub fn unwind(&mut self, reqs: Vec<Request>) {
        for req in reqs.into_iter().rev() {
            self.levels
                .entry(Reverse(req.priority))
                .or_default()
                .push_front(req);
            self.len += 1;
        }
    }

    /// Highest-priority request
    pub fn peek(&self) -> Option<&Request> {
        self.levels.values().next().and_then(|q| q.front())
    }

    /// Remove the highest-priority request
    pub fn pop(&mut self) -> Option<Request> {
        self.pop_if(|_| true)
    }

    /// Remove the highest-priority request if `pred` accepts it
    pub fn pop_if(&mut self, pred: impl FnOnce(&Request) -> bool) -> Option<Request> {
        let mut entry = self.levels.first_entry()?;
        if !entry.get().front().is_some_and(pred) {
            return None;
        }
        let req = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        if req.is_some() {
            self.len -= 1;
        }
        req
    }

    /// Remove a request by sequence number
    pub fn remove(&mut self, seqno: u64) -> Option<Request> {
        let mut found = None;
        for q in self.levels.values_mut() {
            if let Some(pos) = q.iter().position(|r| r.seqno == seqno) {
                found = q.remove(pos);
                break;
            }
        }
        if found.is_some() {
            self.len -= 1;
            self.levels.retain(|_, q| !q.is_empty());
        }
        found
    }

    /// Remove every request of a context, oldest first
    pub fn drain_context(&mut self, ctx: ContextId) -> Vec<Request> {
        let mut out = Vec::new();
        for q in self.levels.values_mut() {
            let mut i = 0;
            while i < q.len() {
                if q[i].context == ctx {
                    if let Some(r) = q.remove(i) {
                        out.push(r);
                    }
                } else {
                    i += 1;
                }
            }
        }
        self.len -= out.len();
        self.levels.retain(|_, q| !q.is_empty());
        out.sort_by_key(|r| r.seqno);
        out
    }

    /// Remove everything, highest priority first
    pub fn drain(&mut self) -> Vec<Request> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(r) = self.pop() {
            out.push(r);
        }
        out
    }

    /// Whether any request of `ctx` is queued
    pub fn contains_context(&self, ctx: ContextId) -> bool {
        self.levels
            .values()
            .any(|q| q.iter().any(|r| r.context == ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(ctx: u32, prio: i32, seqno: u64) -> Request {
        let mut r = Request::new(ContextId::new(ctx, 0), prio, 0);
        r.set_seqno(seqno);
        r
    }

    fn order(q: &mut PriorityQueue) -> Vec<u64> {
        q.drain().iter().map(|r| r.seqno()).collect()
    }

    #[test]
    fn test_strict_priority_fifo_within_level() {
        let mut q = PriorityQueue::new();
        q.push(req(1, 0, 1));
        q.push(req(2, 5, 2));
        q.push(req(3, 5, 3));
        q.push(req(4, 2, 4));
        assert_eq!(q.len(), 4);
        assert_eq!(order(&mut q), vec![2, 3, 4, 1]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_context_order_preserved() {
        let mut q = PriorityQueue::new();
        q.push(req(1, 0, 1));
        q.push(req(2, 3, 2));
        q.push(req(1, 5, 3));
        // ctx1's first request is raised with its later one
        let drained = q.drain();
        let seq: Vec<u64> = drained.iter().map(|r| r.seqno()).collect();
        assert_eq!(seq, vec![1, 3, 2]);
        assert_eq!(drained[0].priority(), 5);
        assert_eq!(drained[0].guc_priority(), GucPriority::KmdNormal);
    }

    #[test]
    fn test_unwind_goes_to_front() {
        let mut q = PriorityQueue::new();
        q.push(req(2, 0, 10));
        q.unwind(vec![req(1, 0, 1), req(1, 0, 2)]);
        assert_eq!(order(&mut q), vec![1, 2, 10]);
    }

    #[test]
    fn test_pop_if_and_remove() {
        let mut q = PriorityQueue::new();
        q.push(req(1, 0, 1));
        q.push(req(2, 0, 2));
        assert!(q.pop_if(|r| r.context() == ContextId::new(2, 0)).is_none());
        assert_eq!(q.remove(2).map(|r| r.seqno()), Some(2));
        assert!(q.remove(2).is_none());
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek().map(|r| r.seqno()), Some(1));
    }

    #[test]
    fn test_drain_context() {
        let mut q = PriorityQueue::new();
        q.push(req(1, 0, 1));
        q.push(req(2, 9, 2));
        q.push(req(1, -1, 3));
        let gone = q.drain_context(ContextId::new(1, 0));
        assert_eq!(gone.iter().map(|r| r.seqno()).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(q.len(), 1);
        assert!(!q.contains_context(ContextId::new(1, 0)));
    }

    #[test]
    fn test_child_tails_bounded() {
        let r = Request::new(ContextId::new(0, 0), 0, 0);
        assert!(r.with_child_tails(&[0; MAX_ENGINE_INSTANCE + 1]).is_err());
    }
}
