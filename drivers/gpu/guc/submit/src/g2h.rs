//! # G2H Handling
//!
//! Applies firmware notifications to host state. Every acknowledgement must
//! match a pending transition; anything else is a protocol violation that is
//! logged, counted and returned without touching state.

use alloc::sync::Arc;
use alloc::vec::Vec;

use helix_guc_abi::G2hMessage;

use crate::context::Context;
use crate::dispatch::DispatchState;
use crate::error::{ProtocolError, Result, SubmitError};
use crate::fence::FenceError;
use crate::request::Request;
use crate::reset::ResetPhase;
use crate::submission::{bump, Deferred, GucSubmission, ResetReason, SubmissionHost};
use crate::telemetry::LifecycleEvent;
use crate::transport::CommandTransport;

type ProtocolResult = core::result::Result<(), ProtocolError>;

impl<T: CommandTransport, H: SubmissionHost> GucSubmission<T, H> {
    /// Process one G2H message, action word first
    pub fn process_g2h(&self, msg: &[u32]) -> Result<()> {
        let parsed = match G2hMessage::parse(msg) {
            Ok(m) => m,
            Err(e) => {
                let err = SubmitError::from(e);
                self.protocol_violation(&err);
                return Err(err);
            }
        };
        if matches!(self.reset_phase(), ResetPhase::Prepare | ResetPhase::InProgress) {
            log::debug!("guc: {:?} dropped during reset", parsed);
            return Ok(());
        }

        let mut d = Deferred::default();
        let res = {
            let mut ds = self.dispatch.lock();
            match parsed {
                G2hMessage::SchedDone { guc_id, enabled } => {
                    self.handle_sched_done(&mut ds, guc_id, enabled, &mut d)
                }
                G2hMessage::DeregisterDone { guc_id } => {
                    self.handle_deregister_done(&mut ds, guc_id, &mut d)
                }
                G2hMessage::ContextReset { guc_id } => {
                    self.handle_context_reset(&mut ds, guc_id, &mut d)
                }
                G2hMessage::EngineFailure {
                    class,
                    instance,
                    reason,
                } => {
                    log::error!(
                        "guc: engine {}:{} reset failed, reason {:#x}",
                        class,
                        instance,
                        reason
                    );
                    d.capture = Some(None);
                    d.device_reset = Some(ResetReason::EngineFailure {
                        class,
                        instance,
                        reason,
                    });
                    Ok(())
                }
                G2hMessage::ErrorCapture { status } => {
                    log::info!("guc: engine state captured, status {:#x}", status);
                    Ok(())
                }
            }
        };
        self.flush(d);
        res.map_err(|e| {
            let err = SubmitError::from(e);
            self.protocol_violation(&err);
            err
        })
    }

    fn protocol_violation(&self, err: &SubmitError) {
        bump(&self.stats.protocol_violations);
        log::error!("guc: {}", err);
    }

    fn registered_context(&self, guc_id: u16) -> core::result::Result<Arc<Context>, ProtocolError> {
        let id = self
            .ids
            .lock()
            .lookup(guc_id)
            .ok_or(ProtocolError::UnknownId(guc_id))?;
        self.arena.get(id).ok_or(ProtocolError::UnknownId(guc_id))
    }

    fn handle_sched_done(
        &self,
        ds: &mut DispatchState,
        guc_id: u16,
        enabled: bool,
        d: &mut Deferred,
    ) -> ProtocolResult {
        let ctx = self.registered_context(guc_id)?;
        let unexpected = ProtocolError::UnexpectedSchedDone { guc_id, enabled };
        {
            let mut inner = ctx.inner.lock();
            if enabled {
                inner.state.finish_enable().map_err(|_| unexpected)?;
                d.events.push(LifecycleEvent::Enabled(ctx.id()));
                let unwanted = inner.state.banned()
                    || (inner.state.closed() && inner.outstanding == 0)
                    || inner.state.blocked() > 0
                    || inner.unblock_on_disable > 0;
                if unwanted {
                    d.disables.push(ctx.id());
                } else if inner.drained() {
                    let deadline = self.host.now_ms() + self.config.sched_disable_delay_ms;
                    self.timers.lock().schedule(ctx.id(), deadline);
                }
            } else {
                inner.state.finish_disable().map_err(|_| unexpected)?;
                d.events.push(LifecycleEvent::Disabled(ctx.id()));
                inner.release_disable_blocks(ctx.id());
                self.release_fenced(&ctx, &mut inner, ds, d);
            }
        }
        self.ct.ack();
        // reference taken when the mode-set went out
        d.puts.push(ctx);
        Ok(())
    }

    fn handle_deregister_done(
        &self,
        ds: &mut DispatchState,
        guc_id: u16,
        d: &mut Deferred,
    ) -> ProtocolResult {
        let mut ids = self.ids.lock();
        let prev = ids
            .clear_registered(guc_id)
            .ok_or(ProtocolError::UnexpectedDeregisterDone(guc_id))?;

        if let Some(prev_ctx) = self.arena.get(prev) {
            let destroyed = prev_ctx.inner.lock().state.destroyed();
            d.events.push(LifecycleEvent::Deregistered(prev));
            if destroyed {
                self.free_locked(&mut ids, &prev_ctx, d);
            }
        }

        // a new owner may be waiting for the id
        if let Some(owner) = ids.owner(guc_id).filter(|&o| o != prev) {
            if let Some(owner_ctx) = self.arena.get(owner) {
                let mut inner = owner_ctx.inner.lock();
                if inner.state.finish_wait_for_deregister().is_ok() {
                    log::trace!("guc: {} may register guc id {}", owner, guc_id);
                    self.release_fenced(&owner_ctx, &mut inner, ds, d);
                    d.kick_dispatch = true;
                }
            }
        }
        drop(ids);
        self.ct.ack();
        Ok(())
    }

    fn handle_context_reset(
        &self,
        ds: &mut DispatchState,
        guc_id: u16,
        d: &mut Deferred,
    ) -> ProtocolResult {
        let ctx = self.registered_context(guc_id)?;
        bump(&self.stats.context_resets);
        log::warn!("guc: firmware reset {} (guc id {})", ctx.id(), guc_id);
        {
            let mut inner = ctx.inner.lock();
            inner.guilty_count += 1;
            if inner.state.banned() {
                let doomed: Vec<Request> = inner.inflight.drain(..).collect();
                for req in doomed {
                    self.fail_request_locked(&ctx, &mut inner, req, FenceError::Banned, d);
                }
            } else {
                if let Some(req) = inner.inflight.pop_front() {
                    self.fail_request_locked(&ctx, &mut inner, req, FenceError::ContextReset, d);
                }
                let rest: Vec<Request> = inner.inflight.drain(..).collect();
                if !rest.is_empty() {
                    ds.queue.unwind(rest);
                    d.kick_dispatch = true;
                }
            }
        }
        d.capture = Some(Some(ctx.id()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{pinned_context, submission, submission_with};
    use crate::{
        ContextId, FenceError, FenceStatus, ProtocolError, ResetReason, SubmissionConfig,
        SubmitError,
    };
    use helix_guc_abi::action::Action;

    #[test]
    fn test_malformed_message() {
        let h = submission(64);
        let err = h.guc.process_g2h(&[0x1003, 5]).unwrap_err();
        assert!(matches!(
            err,
            SubmitError::ProtocolViolation(ProtocolError::Malformed(_))
        ));
        assert!(h.guc.process_g2h(&[]).is_err());
        assert_eq!(h.guc.stats().protocol_violations, 2);
    }

    #[test]
    fn test_unknown_id() {
        let h = submission(64);
        assert_eq!(
            h.guc.process_g2h(&[Action::SchedContextModeDone.raw(), 9, 1]),
            Err(SubmitError::ProtocolViolation(ProtocolError::UnknownId(9)))
        );
    }

    #[test]
    fn test_unexpected_ack_leaves_state_alone() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        h.submit(ctx, 0, 0x40);
        h.guc.dispatch();
        let gid = h.gid(ctx);
        // a disable ack while an enable is pending
        let res = h
            .guc
            .process_g2h(&[Action::SchedContextModeDone.raw(), gid as u32, 0]);
        assert_eq!(
            res,
            Err(SubmitError::ProtocolViolation(
                ProtocolError::UnexpectedSchedDone {
                    guc_id: gid,
                    enabled: false
                }
            ))
        );
        assert!(h.guc.context_snapshot(ctx).unwrap().state.pending_enable());
        assert_eq!(h.guc.outstanding_acks(), 1);
        h.deliver_replies();
        assert!(h.guc.context_snapshot(ctx).unwrap().state.enabled());
        assert_eq!(h.guc.outstanding_acks(), 0);
    }

    #[test]
    fn test_context_reset_fails_head_and_requeues_rest() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        let a = h.submit(ctx, 0, 0x40);
        let b = h.submit(ctx, 0, 0x80);
        h.guc.dispatch();
        h.deliver_replies();
        let gid = h.gid(ctx);
        h.guc
            .process_g2h(&[Action::ContextResetNotification.raw(), gid as u32])
            .unwrap();
        assert_eq!(h.fence(a).status(), FenceStatus::Failed(FenceError::ContextReset));
        assert_eq!(h.fence(b).status(), FenceStatus::Pending);
        assert_eq!(h.guc.queued(), 1);
        assert_eq!(h.guc.host().captures(), vec![Some(ctx)]);
        let snap = h.guc.context_snapshot(ctx).unwrap();
        assert_eq!(snap.guilty_count, 1);
        assert_eq!(snap.outstanding, 1);
    }

    #[test]
    fn test_engine_failure_requests_reset() {
        let h = submission(64);
        h.guc
            .process_g2h(&[Action::EngineFailureNotification.raw(), 0, 1, 0x20])
            .unwrap();
        assert_eq!(
            h.guc.host().reset_requests(),
            vec![ResetReason::EngineFailure {
                class: 0,
                instance: 1,
                reason: 0x20
            }]
        );
        assert_eq!(h.guc.host().captures(), vec![None]);
    }

    #[test]
    fn test_stolen_id_converges_to_one_owner() {
        let config = SubmissionConfig::builder()
            .num_guc_ids(2)
            .sched_disable_gucid_threshold(2)
            .build()
            .unwrap();
        let h = submission_with(config);

        // two contexts run, go idle and get disabled
        let mut old: Vec<ContextId> = Vec::new();
        for _ in 0..2 {
            let c = pinned_context(&h);
            let s = h.submit(c, 0, 0x40);
            h.guc.dispatch();
            h.deliver_replies();
            h.guc.retire_request(c, s).unwrap();
            h.guc.context_unpin(c).unwrap();
            old.push(c);
        }
        h.guc.host().advance(100);
        h.guc.run_timers();
        h.deliver_replies();
        assert!(h.guc.context_snapshot(old[0]).unwrap().state.is_idle());
        let stolen = h.gid(old[0]);

        // a third context takes the least recently used id
        let c = pinned_context(&h);
        assert_eq!(h.gid(c), stolen);
        assert_eq!(h.guc.context_snapshot(old[0]).unwrap().guc_id, None);
        assert_eq!(h.guc.stats().id_steals, 1);

        let s = h.submit(c, 0, 0x40);
        h.guc.transport().clear();
        h.guc.dispatch();
        // firmware still knows the old owner: deregister first
        assert_eq!(h.actions(), vec![Action::DeregisterContext.raw()]);
        assert!(h
            .guc
            .context_snapshot(c)
            .unwrap()
            .state
            .wait_for_deregister_to_register());
        h.deliver_replies();
        h.guc.dispatch();
        h.deliver_replies();

        assert_eq!(h.guc.guc_id_owner(stolen), Some(c));
        assert_eq!(h.guc.guc_id_registrant(stolen), Some(c));
        assert!(h.guc.context_snapshot(c).unwrap().state.enabled());
        assert!(!h.guc.context_snapshot(old[0]).unwrap().state.registered());
        assert_eq!(h.guc.outstanding_acks(), 0);
        h.guc.retire_request(c, s).unwrap();
    }

    #[test]
    fn test_destroyed_waiter_leaves_one_deregistration() {
        let config = SubmissionConfig::builder()
            .num_guc_ids(2)
            .sched_disable_gucid_threshold(2)
            .build()
            .unwrap();
        let h = submission_with(config);
        let mut old: Vec<ContextId> = Vec::new();
        for _ in 0..2 {
            let c = pinned_context(&h);
            let s = h.submit(c, 0, 0x40);
            h.guc.dispatch();
            h.deliver_replies();
            h.guc.retire_request(c, s).unwrap();
            h.guc.context_unpin(c).unwrap();
            old.push(c);
        }
        h.guc.host().advance(100);
        h.guc.run_timers();
        h.deliver_replies();
        let stolen = h.gid(old[0]);

        // the thief starts deregistering the old owner, then goes away
        let thief = pinned_context(&h);
        let s = h.submit(thief, 0, 0x40);
        h.guc.transport().clear();
        h.guc.dispatch();
        assert_eq!(h.actions(), vec![Action::DeregisterContext.raw()]);
        h.guc.cancel_request(thief, s).unwrap();
        h.guc.context_unpin(thief).unwrap();
        h.guc.context_destroy(thief).unwrap();
        assert!(h.guc.context_snapshot(thief).is_err());

        // the next holder joins the deregistration already on its way
        let next = pinned_context(&h);
        assert_eq!(h.gid(next), stolen);
        let s = h.submit(next, 0, 0x40);
        h.guc.dispatch();
        assert_eq!(h.actions(), vec![Action::DeregisterContext.raw()]);
        assert!(h
            .guc
            .context_snapshot(next)
            .unwrap()
            .state
            .wait_for_deregister_to_register());

        h.deliver_replies();
        h.guc.dispatch();
        h.deliver_replies();
        let deregisters = h
            .actions()
            .iter()
            .filter(|&&a| a == Action::DeregisterContext.raw())
            .count();
        assert_eq!(deregisters, 1);
        assert_eq!(h.guc.guc_id_registrant(stolen), Some(next));
        assert!(h.guc.context_snapshot(next).unwrap().state.enabled());
        assert_eq!(h.guc.stats().protocol_violations, 0);
        assert_eq!(h.guc.outstanding_acks(), 0);
        h.guc.retire_request(next, s).unwrap();
    }
}
