//! # Dispatcher
//!
//! Moves requests from the priority queue to the firmware. Each batch (one
//! or more requests of a single context) passes three stages:
//!
//! ```text
//! Register ──▶ MoveTail ──▶ AddRequest
//!    │            │             │
//!    └────────────┴─────────────┴──▶ busy: stash (batch, stage), stop
//! ```
//!
//! A busy transport or a full work queue stashes the batch together with the
//! stage it reached. The next pass resumes exactly there, so a tail is never
//! moved twice and a request is never lost. A closed transport suspends
//! submission, requeues the batch and asks the host for a device reset.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use helix_guc_abi::action::SCHED_CONTEXT_MODE_DONE_LEN;
use helix_guc_abi::engine::MAX_ENGINE_INSTANCE;
use helix_guc_abi::message;
use helix_guc_abi::wq::multi_lrc_item;

use crate::context::{Context, ContextInner};
use crate::error::ProtocolError;
use crate::fence::FenceError;
use crate::registration::RegisterOutcome;
use crate::request::{PriorityQueue, Request};
use crate::submission::{bump, Deferred, GucSubmission, ResetReason, SubmissionHost};
use crate::transport::{CommandTransport, TransportError};
use crate::types::ContextId;
use crate::wq::WqError;

// =============================================================================
// TYPES
// =============================================================================

/// Stage a batch reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Registering the context
    Register,
    /// Publishing the new ring tail (work-queue item for parallel contexts)
    MoveTail,
    /// Telling the firmware about the work
    AddRequest,
}

/// Why a dispatch pass stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Queue drained
    Idle,
    /// Transport or work queue full; call again when space frees up
    Stalled(Stage),
    /// A firmware reset is being handled
    Paused,
    /// Transport closed, waiting for a device reset
    Disabled,
}

/// Requests of one context dispatched together; empty for a kick
#[derive(Debug)]
pub(crate) struct Batch {
    pub(crate) ctx: ContextId,
    pub(crate) requests: Vec<Request>,
}

#[derive(Debug)]
pub(crate) struct Stalled {
    pub(crate) batch: Batch,
    pub(crate) stage: Stage,
}

/// State guarded by the dispatch lock
#[derive(Debug)]
pub(crate) struct DispatchState {
    pub(crate) queue: PriorityQueue,
    /// Contexts whose moved tail still has to be announced
    pub(crate) kicks: VecDeque<ContextId>,
    pub(crate) stalled: Option<Stalled>,
    pub(crate) paused: bool,
}

impl DispatchState {
    pub(crate) fn new() -> Self {
        Self {
            queue: PriorityQueue::new(),
            kicks: VecDeque::new(),
            stalled: None,
            paused: false,
        }
    }

    /// Pull one request out of the stashed batch; the flag says whether its
    /// tail was already published
    pub(crate) fn take_stalled(&mut self, ctx: ContextId, seqno: u64) -> Option<(Request, bool)> {
        let stalled = self.stalled.as_mut().filter(|s| s.batch.ctx == ctx)?;
        let pos = stalled
            .batch
            .requests
            .iter()
            .position(|r| r.seqno() == seqno)?;
        let moved = stalled.stage == Stage::AddRequest;
        Some((stalled.batch.requests.remove(pos), moved))
    }

    /// Drop the stashed batch if it belongs to `ctx`
    pub(crate) fn take_stalled_context(&mut self, ctx: ContextId) -> Option<Vec<Request>> {
        if self.stalled.as_ref()?.batch.ctx != ctx {
            return None;
        }
        self.stalled.take().map(|s| s.batch.requests)
    }
}

enum Step {
    Next,
    Done,
    Busy,
    Closed,
}

impl From<TransportError> for Step {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Busy | TransportError::Stopped => Step::Busy,
            TransportError::Closed => Step::Closed,
        }
    }
}

enum BatchResult {
    Done,
    Stall(Batch, Stage),
    Closed(Batch),
}

// =============================================================================
// DISPATCH
// =============================================================================

impl<T: CommandTransport, H: SubmissionHost> GucSubmission<T, H> {
    /// Run one dispatch pass
    pub fn dispatch(&self) -> DispatchOutcome {
        let mut d = Deferred::default();
        let outcome = {
            let mut ds = self.dispatch.lock();
            if ds.paused {
                return DispatchOutcome::Paused;
            }
            if self.submission_disabled() {
                return DispatchOutcome::Disabled;
            }
            let _wake = self.wakeref.acquire();
            self.process_destroyed(&mut d);
            self.dispatch_locked(&mut ds, &mut d)
        };
        self.flush(d);
        outcome
    }

    fn dispatch_locked(&self, ds: &mut DispatchState, d: &mut Deferred) -> DispatchOutcome {
        loop {
            let (batch, stage) = match ds.stalled.take() {
                Some(s) => (s.batch, s.stage),
                None => match self.next_batch(ds, d) {
                    Some(batch) => (batch, Stage::Register),
                    None => return DispatchOutcome::Idle,
                },
            };
            match self.run_batch(batch, stage, d) {
                BatchResult::Done => {}
                BatchResult::Stall(batch, stage) => {
                    bump(&self.stats.stalls);
                    log::trace!("guc: dispatch of {} stalled at {:?}", batch.ctx, stage);
                    ds.stalled = Some(Stalled { batch, stage });
                    return DispatchOutcome::Stalled(stage);
                }
                BatchResult::Closed(batch) => {
                    ds.queue.unwind(batch.requests);
                    self.disable_submission(d);
                    return DispatchOutcome::Disabled;
                }
            }
        }
    }

    /// Pop the next batch: pending kicks first, then the queue head merged
    /// with the same context's following requests
    fn next_batch(&self, ds: &mut DispatchState, d: &mut Deferred) -> Option<Batch> {
        while let Some(ctx) = ds.kicks.pop_front() {
            if self.arena.get(ctx).is_some() {
                return Some(Batch {
                    ctx,
                    requests: Vec::new(),
                });
            }
        }
        loop {
            let req = ds.queue.pop()?;
            let id = req.context();
            let Some(ctx) = self.arena.get(id) else {
                req.fence().fail(FenceError::Cancelled);
                continue;
            };
            {
                let mut inner = ctx.inner.lock();
                if inner.state.banned() {
                    self.fail_request_locked(&ctx, &mut inner, req, FenceError::Banned, d);
                    continue;
                }
                if inner.state.must_fence() {
                    inner.fence_request(req);
                    continue;
                }
            }
            let mut requests = alloc::vec![req];
            if !ctx.is_parent() {
                while let Some(next) = ds.queue.pop_if(|r| r.context() == id) {
                    requests.push(next);
                }
            }
            return Some(Batch { ctx: id, requests });
        }
    }

    fn run_batch(&self, mut batch: Batch, mut stage: Stage, d: &mut Deferred) -> BatchResult {
        let Some(ctx) = self.arena.get(batch.ctx) else {
            for req in batch.requests {
                req.fence().fail(FenceError::Cancelled);
            }
            return BatchResult::Done;
        };
        loop {
            let step = match stage {
                Stage::Register => self.stage_register(&ctx, &mut batch, d),
                Stage::MoveTail => self.stage_move_tail(&ctx, &mut batch, d),
                Stage::AddRequest => self.stage_add_request(&ctx, &mut batch),
            };
            match step {
                Step::Next => match stage {
                    Stage::Register => stage = Stage::MoveTail,
                    Stage::MoveTail => stage = Stage::AddRequest,
                    Stage::AddRequest => return BatchResult::Done,
                },
                Step::Done => return BatchResult::Done,
                Step::Busy => return BatchResult::Stall(batch, stage),
                Step::Closed => return BatchResult::Closed(batch),
            }
        }
    }

    fn fail_batch(
        &self,
        ctx: &Arc<Context>,
        inner: &mut ContextInner,
        batch: &mut Batch,
        err: FenceError,
        d: &mut Deferred,
    ) {
        for req in batch.requests.drain(..) {
            self.fail_request_locked(ctx, inner, req, err, d);
        }
    }

    // -------------------------------------------------------------------------
    // Stages
    // -------------------------------------------------------------------------

    fn stage_register(&self, ctx: &Arc<Context>, batch: &mut Batch, d: &mut Deferred) -> Step {
        {
            let mut inner = ctx.inner.lock();
            if inner.state.banned() {
                self.fail_batch(ctx, &mut inner, batch, FenceError::Banned, d);
                return Step::Done;
            }
        }
        match self.try_register(ctx, d) {
            RegisterOutcome::Ready => Step::Next,
            RegisterOutcome::Waiting => {
                let mut inner = ctx.inner.lock();
                for req in batch.requests.drain(..) {
                    inner.fence_request(req);
                }
                Step::Done
            }
            RegisterOutcome::Busy => Step::Busy,
            RegisterOutcome::Closed => Step::Closed,
            RegisterOutcome::Invalid => {
                let mut inner = ctx.inner.lock();
                self.fail_batch(ctx, &mut inner, batch, FenceError::Cancelled, d);
                Step::Done
            }
        }
    }

    fn stage_move_tail(&self, ctx: &Arc<Context>, batch: &mut Batch, d: &mut Deferred) -> Step {
        let Some(last) = batch.requests.last() else {
            return Step::Next;
        };
        let tail = last.tail();
        let child_qw: ArrayVec<u32, MAX_ENGINE_INSTANCE> =
            last.child_tails().iter().map(|&t| t / 8).collect();

        let mut inner = ctx.inner.lock();
        let Some(scratch) = ctx.scratch() else {
            inner.ring_tail = tail;
            return Step::Next;
        };
        let Some(gid) = inner.guc_id else {
            self.fail_batch(ctx, &mut inner, batch, FenceError::Cancelled, d);
            return Step::Done;
        };
        let item = match multi_lrc_item(ctx.desc().lrca, gid.id, tail / 8, &child_qw) {
            Ok(item) => item,
            Err(e) => {
                log::error!("guc: bad work item for {}: {}", ctx.id(), e);
                self.fail_batch(ctx, &mut inner, batch, FenceError::Cancelled, d);
                return Step::Done;
            }
        };
        match inner.wq.append(scratch, &item) {
            Ok(()) => {
                inner.ring_tail = tail;
                Step::Next
            }
            Err(WqError::Busy) => Step::Busy,
            Err(WqError::Status(status)) => {
                let err = ProtocolError::WorkQueueStatus {
                    context: ctx.id(),
                    status,
                };
                log::error!("guc: {}", err);
                bump(&self.stats.protocol_violations);
                self.fail_batch(ctx, &mut inner, batch, FenceError::Cancelled, d);
                d.device_reset = Some(ResetReason::WorkQueueError);
                Step::Done
            }
            Err(WqError::TooLarge) => {
                log::error!("guc: work item of {} exceeds the ring", ctx.id());
                self.fail_batch(ctx, &mut inner, batch, FenceError::Cancelled, d);
                Step::Done
            }
        }
    }

    fn stage_add_request(&self, ctx: &Arc<Context>, batch: &mut Batch) -> Step {
        let mut inner = ctx.inner.lock();
        let Some(gid) = inner.guc_id else {
            return Step::Done;
        };
        if !inner.state.registered() || inner.state.must_fence() || inner.state.banned() {
            // tail moved, announced once the context may run again
            if !batch.requests.is_empty() {
                inner.inflight.extend(batch.requests.drain(..));
                inner.kick_pending = true;
            }
            return Step::Done;
        }
        if inner.state.policy_required() {
            if let Err(e) = self.send_policies(gid, &mut inner) {
                return e.into();
            }
        }
        if batch.requests.is_empty() && !inner.kick_pending {
            return Step::Done;
        }

        if inner.state.enabled() {
            if let Err(e) = self.ct.send(&message::sched_context(gid.id), 0) {
                return e.into();
            }
        } else if !inner.state.pending_enable() {
            let msg = message::sched_context_mode_set(gid.id, true);
            if let Err(e) = self.ct.send(&msg, SCHED_CONTEXT_MODE_DONE_LEN) {
                return e.into();
            }
            if let Err(e) = inner.state.begin_enable() {
                log::warn!("guc: {}: {}", ctx.id(), e);
            }
            ctx.get();
            log::trace!("guc: enabling {}", ctx.id());
        }

        let n = batch.requests.len() as u64;
        inner.kick_pending = false;
        inner.inflight.extend(batch.requests.drain(..));
        self.stats.dispatched.fetch_add(n, core::sync::atomic::Ordering::Relaxed);
        Step::Done
    }

    /// Requeue fenced requests once nothing holds the context back
    ///
    /// Requests the firmware already owns are announced again when the
    /// context was disabled under them.
    pub(crate) fn release_fenced(
        &self,
        ctx: &Context,
        inner: &mut ContextInner,
        ds: &mut DispatchState,
        d: &mut Deferred,
    ) {
        if inner.state.must_fence() || inner.state.banned() {
            return;
        }
        if inner.needs_enable() {
            inner.kick_pending = true;
        }
        let released = inner.fenced.len();
        for req in inner.fenced.drain(..) {
            ds.queue.push(req);
        }
        if inner.kick_pending && !ds.kicks.contains(&ctx.id()) {
            ds.kicks.push_back(ctx.id());
        }
        if released > 0 || inner.kick_pending {
            d.kick_dispatch = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{parallel_context, pinned_context, submission};
    use crate::FenceStatus;
    use helix_guc_abi::action::Action;

    #[test]
    fn test_priority_order() {
        let h = submission(64);
        let ctxs: Vec<ContextId> = (0..4).map(|_| pinned_context(&h)).collect();
        let prios = [0, 5, 5, 2];
        let mut seqnos = Vec::new();
        for (&c, &p) in ctxs.iter().zip(prios.iter()) {
            seqnos.push(h.submit(c, p, 0x40));
        }
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Idle);

        // registration order is dispatch order
        let registered: Vec<u32> = h
            .guc
            .transport()
            .sent()
            .iter()
            .filter(|m| m[0] == Action::RegisterContext.raw())
            .map(|m| m[1])
            .collect();
        let gid = |c: ContextId| h.guc.context_snapshot(c).unwrap().guc_id.unwrap().id as u32;
        assert_eq!(
            registered,
            vec![gid(ctxs[1]), gid(ctxs[2]), gid(ctxs[3]), gid(ctxs[0])]
        );
    }

    #[test]
    fn test_same_context_requests_merge() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        h.submit(ctx, 0, 0x40);
        h.submit(ctx, 0, 0x80);
        h.submit(ctx, 0, 0xc0);
        h.guc.dispatch();
        let enables = h
            .actions()
            .iter()
            .filter(|&&a| a == Action::SchedContextModeSet.raw())
            .count();
        assert_eq!(enables, 1);
        assert_eq!(h.guc.context_snapshot(ctx).unwrap().inflight, 3);
        assert_eq!(h.guc.stats().dispatched, 3);
    }

    #[test]
    fn test_enabled_context_gets_sched_kick() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        h.submit(ctx, 0, 0x40);
        h.guc.dispatch();
        h.deliver_replies();
        h.guc.transport().clear();
        h.submit(ctx, 0, 0x80);
        h.guc.dispatch();
        assert_eq!(h.actions(), vec![Action::SchedContext.raw()]);
    }

    #[test]
    fn test_busy_at_register_resumes() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        let seqno = h.submit(ctx, 0, 0x40);
        h.guc.transport().push_busy(1);
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Stalled(Stage::Register));
        assert!(h.guc.transport().sent().is_empty());
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Idle);
        assert_eq!(
            h.actions(),
            vec![
                Action::RegisterContext.raw(),
                Action::UpdateContextPolicies.raw(),
                Action::SchedContextModeSet.raw(),
            ]
        );
        h.deliver_replies();
        h.guc.retire_request(ctx, seqno).unwrap();
        assert_eq!(h.guc.stats().stalls, 1);
    }

    #[test]
    fn test_busy_at_add_request_does_not_resend_earlier_stages() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        h.submit(ctx, 0, 0x40);
        // register and policy go out, the enable bounces
        h.guc.transport().push_busy_after(2, 1);
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Stalled(Stage::AddRequest));
        assert_eq!(
            h.actions(),
            vec![
                Action::RegisterContext.raw(),
                Action::UpdateContextPolicies.raw()
            ]
        );
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Idle);
        assert_eq!(
            h.actions(),
            vec![
                Action::RegisterContext.raw(),
                Action::UpdateContextPolicies.raw(),
                Action::SchedContextModeSet.raw(),
            ]
        );
    }

    #[test]
    fn test_busy_at_move_tail_appends_once() {
        let h = submission(64);
        let parent = parallel_context(&h, 2);
        h.guc.context_pin(parent).unwrap();
        let scratch_ctx = h.guc.arena.get(parent).unwrap();
        let scratch = scratch_ctx.scratch().unwrap().clone();

        // fill the ring up to the last item that fits
        let seq = h.submit_parallel(parent, 0x40, &[0x40, 0x40]);
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Idle);
        assert_eq!(scratch.consume().len(), 1);
        h.deliver_replies();
        h.guc.retire_request(parent, seq).unwrap();

        // firmware stops consuming: the ring fills and the dispatcher stalls
        let item_bytes = helix_guc_abi::wq::multi_lrc_item_bytes(2) as u32;
        let fit = (scratch.wq_size() - 4 - scratch.tail()) / item_bytes;
        for _ in 0..fit {
            h.submit_parallel(parent, 0x80, &[0x80, 0x80]);
            assert_eq!(h.guc.dispatch(), DispatchOutcome::Idle);
        }
        h.submit_parallel(parent, 0xc0, &[0xc0, 0xc0]);
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Stalled(Stage::MoveTail));
        let before = scratch_ctx.inner.lock().wq.appended();
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Stalled(Stage::MoveTail));

        // firmware catches up, exactly one new item lands
        scratch.consume();
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Idle);
        assert_eq!(scratch_ctx.inner.lock().wq.appended(), before + 1);
        let items = scratch.consume();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_parallel_requests_never_merge() {
        let h = submission(64);
        let parent = parallel_context(&h, 1);
        h.guc.context_pin(parent).unwrap();
        h.submit_parallel(parent, 0x40, &[0x40]);
        h.submit_parallel(parent, 0x80, &[0x80]);
        h.guc.dispatch();
        let scratch = h.guc.arena.get(parent).unwrap().scratch().unwrap().clone();
        assert_eq!(scratch.consume().len(), 2);
    }

    #[test]
    fn test_closed_transport_disables_submission() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        h.submit(ctx, 0, 0x40);
        h.guc.transport().close();
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Disabled);
        assert!(h.guc.submission_disabled());
        assert_eq!(
            h.guc.host().reset_requests(),
            vec![ResetReason::TransportClosed]
        );
        // request requeued, not lost
        assert_eq!(h.guc.queued(), 1);
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Disabled);
        assert_eq!(h.guc.host().reset_requests().len(), 1);
    }

    #[test]
    fn test_ban_fails_queued_requests() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        let other = pinned_context(&h);
        let seqno = h.submit(ctx, 0, 0x40);
        h.submit(other, 0, 0x40);
        h.guc.ban(ctx).unwrap();
        assert_eq!(
            h.fence(seqno).status(),
            FenceStatus::Failed(FenceError::Banned)
        );
        h.guc.dispatch();
        assert_eq!(h.guc.context_snapshot(other).unwrap().inflight, 1);
        assert_eq!(h.guc.context_snapshot(ctx).unwrap().outstanding, 0);
        assert_eq!(h.guc.stats().failed, 1);
    }
}
