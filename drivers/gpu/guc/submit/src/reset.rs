//! # Reset Coordination
//!
//! A firmware reset runs in three phases:
//!
//! 1. [`reset_prepare`](GucSubmission::reset_prepare): pause dispatch, stop
//!    the transport and scrub every context, completing each owed reply as
//!    if it had arrived. The outstanding-reply counter ends at zero.
//! 2. [`reset`](GucSubmission::reset): drop all firmware registrations,
//!    unwind in-flight work back to the queue and fail the guilty request of
//!    each stalled engine.
//! 3. [`reset_finish`](GucSubmission::reset_finish): restart the transport,
//!    resend global policies and resume dispatch. Contexts re-register
//!    lazily on their next dispatch.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::dispatch::DispatchState;
use crate::error::{Result, SubmitError};
use crate::fence::FenceError;
use crate::request::Request;
use crate::submission::{bump, Deferred, GucSubmission, SubmissionHost};
use crate::telemetry::LifecycleEvent;
use crate::transport::CommandTransport;
use crate::types::{ContextId, EngineMask};

/// Reset phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetPhase {
    /// Normal operation
    Running = 0,
    /// Dispatch paused, replies scrubbed
    Prepare = 1,
    /// Firmware state being discarded
    InProgress = 2,
    /// Restarting
    Finish = 3,
}

impl ResetPhase {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Prepare,
            2 => Self::InProgress,
            3 => Self::Finish,
            _ => Self::Running,
        }
    }
}

impl<T: CommandTransport, H: SubmissionHost> GucSubmission<T, H> {
    /// Current reset phase
    pub fn reset_phase(&self) -> ResetPhase {
        ResetPhase::from_raw(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: ResetPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Pause dispatch and resolve every reply the firmware still owes
    pub fn reset_prepare(&self) {
        log::info!("guc: reset prepare");
        self.set_phase(ResetPhase::Prepare);
        let mut d = Deferred::default();
        {
            let mut ds = self.dispatch.lock();
            ds.paused = true;
            self.ct.stop();
            self.timers.lock().clear();
            let resolved = self.scrub_locked(&mut ds, &mut d);
            let left = self.ct.clear_outstanding();
            if left != 0 {
                log::warn!("guc: {} replies unaccounted for after scrubbing", left);
            }
            log::debug!("guc: scrubbed {} lost replies", resolved);
        }
        self.flush(d);
    }

    fn scrub_locked(&self, ds: &mut DispatchState, d: &mut Deferred) -> u32 {
        let mut resolved = 0;
        let mut ids = self.ids.lock();
        for ctx in self.arena.all() {
            if ctx.parent().is_some() {
                continue;
            }
            let mut inner = ctx.inner.lock();
            if inner.state.destroyed() {
                // deregistration reply lost with the firmware
                self.ct.ack();
                resolved += 1;
                drop(inner);
                self.free_locked(&mut ids, &ctx, d);
                continue;
            }
            let done = inner.state.scrub();
            for _ in 0..done.count() {
                self.ct.ack();
            }
            resolved += done.count();
            if done.enable || done.disable {
                d.puts.push(ctx.clone());
            }
            if done.disable {
                inner.release_disable_blocks(ctx.id());
            }
            if done.disable || done.deregister_wait {
                self.release_fenced(&ctx, &mut inner, ds, d);
            }
        }
        resolved
    }

    /// Discard firmware state; requests running on `stalled` engines are
    /// guilty
    pub fn reset(&self, stalled: EngineMask) {
        log::info!("guc: reset, stalled engines {:#x}", stalled.0);
        self.set_phase(ResetPhase::InProgress);
        let mut d = Deferred::default();
        {
            let mut ds = self.dispatch.lock();
            let pending: Vec<ContextId> = self.destroyed.lock().drain(..).collect();
            {
                let mut ids = self.ids.lock();
                for id in pending {
                    if let Some(ctx) = self.arena.get(id) {
                        self.free_locked(&mut ids, &ctx, &mut d);
                    }
                }
                ids.clear_all_registered();
            }

            if let Some(stalled_batch) = ds.stalled.take() {
                ds.queue.unwind(stalled_batch.batch.requests);
            }
            ds.kicks.clear();

            for ctx in self.arena.all() {
                if ctx.parent().is_some() {
                    continue;
                }
                let engines = self.group_engines(&ctx);
                let mut inner = ctx.inner.lock();
                if inner.state.registered() {
                    d.events.push(LifecycleEvent::Deregistered(ctx.id()));
                }
                inner.state.clear_firmware_state();
                inner.kick_pending = false;
                inner.release_disable_blocks(ctx.id());
                if let Some(scratch) = ctx.scratch() {
                    scratch.reset();
                    inner.wq.reset();
                }

                let mut inflight: Vec<Request> = inner.inflight.drain(..).collect();
                if inner.state.banned() {
                    inflight.extend(inner.fenced.drain(..));
                    inflight.extend(ds.queue.drain_context(ctx.id()));
                    for req in inflight {
                        self.fail_request_locked(&ctx, &mut inner, req, FenceError::Banned, &mut d);
                    }
                    continue;
                }
                if !inflight.is_empty() && engines.intersects(stalled) {
                    let guilty = inflight.remove(0);
                    inner.guilty_count += 1;
                    log::warn!("guc: request {} of {} is guilty", guilty.seqno(), ctx.id());
                    self.fail_request_locked(&ctx, &mut inner, guilty, FenceError::Guilty, &mut d);
                }
                ds.queue.unwind(inflight);
                self.release_fenced(&ctx, &mut inner, &mut ds, &mut d);
            }
        }
        bump(&self.stats.resets);
        self.flush(d);
    }

    /// Restart the transport and resume dispatch
    pub fn reset_finish(&self) -> Result<()> {
        self.set_phase(ResetPhase::Finish);
        self.ct.start();
        self.submission_disabled.store(false, Ordering::Release);
        let res = self.apply_global_policy();
        if let Err(SubmitError::TransportClosed) = res {
            let mut d = Deferred::default();
            self.disable_submission(&mut d);
            self.flush(d);
        }
        self.dispatch.lock().paused = false;
        self.set_phase(ResetPhase::Running);
        self.notify(&[LifecycleEvent::Reset]);
        self.host.schedule_dispatch();
        log::info!("guc: reset complete");
        res
    }

    /// Fail every request; submission stays disabled until the next reset
    pub fn wedge(&self) {
        log::error!("guc: wedged, failing all work");
        self.submission_disabled.store(true, Ordering::Release);
        let mut d = Deferred::default();
        {
            let mut ds = self.dispatch.lock();
            let mut doomed = ds.queue.drain();
            if let Some(stalled) = ds.stalled.take() {
                doomed.extend(stalled.batch.requests);
            }
            ds.kicks.clear();
            for req in doomed {
                match self.arena.get(req.context()) {
                    Some(ctx) => {
                        let mut inner = ctx.inner.lock();
                        self.fail_request_locked(&ctx, &mut inner, req, FenceError::Wedged, &mut d);
                    }
                    None => {
                        req.fence().fail(FenceError::Wedged);
                    }
                }
            }
            for ctx in self.arena.all() {
                let mut inner = ctx.inner.lock();
                let mut reqs: Vec<Request> = inner.fenced.drain(..).collect();
                reqs.extend(inner.inflight.drain(..));
                inner.kick_pending = false;
                for req in reqs {
                    self.fail_request_locked(&ctx, &mut inner, req, FenceError::Wedged, &mut d);
                }
            }
        }
        self.flush(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pinned_context, submission};
    use crate::{DispatchOutcome, FenceStatus};
    use helix_guc_abi::action::Action;
    use helix_guc_abi::EngineClass;

    #[test]
    fn test_scrub_settles_every_pending_reply() {
        let h = submission(64);
        let disabling = pinned_context(&h);
        let s = h.submit(disabling, 0, 0x40);
        h.guc.dispatch();
        h.deliver_replies();
        h.guc.retire_request(disabling, s).unwrap();
        h.guc.context_block(disabling).unwrap();
        assert!(h.guc.context_snapshot(disabling).unwrap().state.pending_disable());

        let enabling = pinned_context(&h);
        h.submit(enabling, 0, 0x40);
        h.guc.dispatch();
        assert_eq!(h.guc.outstanding_acks(), 2);
        // creation + pin + outstanding request + pending enable
        assert_eq!(h.guc.context_snapshot(enabling).unwrap().refcount, 4);

        h.guc.reset_prepare();
        assert_eq!(h.guc.outstanding_acks(), 0);
        assert_eq!(h.guc.reset_phase(), ResetPhase::Prepare);
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Paused);
        assert_eq!(h.guc.context_snapshot(enabling).unwrap().refcount, 3);
        let snap = h.guc.context_snapshot(disabling).unwrap();
        assert!(snap.state.is_idle());
        assert_eq!(snap.refcount, 2);

        h.guc.reset(EngineMask::EMPTY);
        h.guc.reset_finish().unwrap();
        assert_eq!(h.guc.reset_phase(), ResetPhase::Running);
        assert_eq!(h.guc.stats().resets, 1);

        // re-registered lazily
        h.guc.transport().clear();
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Idle);
        assert_eq!(h.actions()[0], Action::RegisterContext.raw());
        assert_eq!(h.guc.context_snapshot(enabling).unwrap().inflight, 1);
    }

    #[test]
    fn test_guilty_request_on_stalled_engine() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        let a = h.submit(ctx, 0, 0x40);
        let b = h.submit(ctx, 0, 0x80);
        h.guc.dispatch();
        h.deliver_replies();

        h.guc.reset_prepare();
        h.guc.reset(EngineMask::engine(EngineClass::Render, 0));
        h.guc.reset_finish().unwrap();

        assert_eq!(h.fence(a).status(), FenceStatus::Failed(FenceError::Guilty));
        assert_eq!(h.fence(b).status(), FenceStatus::Pending);
        assert_eq!(h.guc.queued(), 1);
        let snap = h.guc.context_snapshot(ctx).unwrap();
        assert_eq!(snap.guilty_count, 1);
        assert!(!snap.state.registered());
    }

    #[test]
    fn test_innocent_requests_replayed_in_order() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        h.submit(ctx, 0, 0x40);
        h.submit(ctx, 0, 0x80);
        h.guc.dispatch();
        h.guc.reset_prepare();
        h.guc.reset(EngineMask::engine(EngineClass::Copy, 0));
        h.guc.reset_finish().unwrap();
        assert_eq!(h.guc.queued(), 2);
        h.guc.dispatch();
        assert_eq!(h.guc.context_snapshot(ctx).unwrap().inflight, 2);
    }

    #[test]
    fn test_destroyed_context_freed_by_reset() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        let s = h.submit(ctx, 0, 0x40);
        h.guc.dispatch();
        h.deliver_replies();
        h.guc.retire_request(ctx, s).unwrap();
        h.guc.context_unpin(ctx).unwrap();
        let gid = h.gid(ctx);
        h.guc.context_destroy(ctx).unwrap();
        // waiting on the destroyed list
        assert!(h.guc.context_snapshot(ctx).is_ok());

        h.guc.reset_prepare();
        h.guc.reset(EngineMask::EMPTY);
        h.guc.reset_finish().unwrap();
        assert!(h.guc.context_snapshot(ctx).is_err());
        assert_eq!(h.guc.guc_id_owner(gid), None);
        assert_eq!(h.guc.outstanding_acks(), 0);
    }

    #[test]
    fn test_wedge_fails_everything() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        let a = h.submit(ctx, 0, 0x40);
        h.guc.dispatch();
        let b = h.submit(ctx, 0, 0x80);
        h.guc.wedge();
        assert_eq!(h.fence(a).status(), FenceStatus::Failed(FenceError::Wedged));
        assert_eq!(h.fence(b).status(), FenceStatus::Failed(FenceError::Wedged));
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Disabled);
        assert_eq!(h.guc.context_snapshot(ctx).unwrap().outstanding, 0);
    }

    #[test]
    fn test_replies_dropped_while_resetting() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        h.submit(ctx, 0, 0x40);
        h.guc.dispatch();
        h.guc.reset_prepare();
        // the enable reply arrives late
        h.deliver_replies();
        assert_eq!(h.guc.stats().protocol_violations, 0);
        assert_eq!(h.guc.outstanding_acks(), 0);
        h.guc.reset(EngineMask::EMPTY);
        h.guc.reset_finish().unwrap();
    }
}
