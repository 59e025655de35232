//! # Registration Protocol
//!
//! A context must be registered with the firmware before it can be enabled.
//! Registration is fire-and-forget: the firmware reports a bad registration
//! through a notification, not a reply. Deregistration and schedule-disable
//! are acknowledged, and every acknowledgement owed keeps a reference on the
//! context so it cannot be freed under a message in flight.
//!
//! When an id is taken from an idle context the firmware may still know the
//! previous owner under it. The new owner then deregisters the id first and
//! registers only after the firmware confirms.

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use helix_guc_abi::action::{Action, DEREGISTER_CONTEXT_DONE_LEN, SCHED_CONTEXT_MODE_DONE_LEN};
use helix_guc_abi::message::{self, RegisterDesc, RegisterFlags, MAX_GROUP_WIDTH};
use helix_guc_abi::{AbiError, H2gMessage};

use crate::context::{Context, ContextInner};
use crate::submission::{bump, Deferred, GucSubmission, SubmissionHost};
use crate::telemetry::LifecycleEvent;
use crate::transport::{CommandTransport, TransportError};
use crate::types::GucId;

/// Result of trying to get a context registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegisterOutcome {
    /// Registered, possibly just now
    Ready,
    /// Waiting for the id's previous owner to deregister
    Waiting,
    /// Transport out of space, nothing changed
    Busy,
    /// Transport closed
    Closed,
    /// Context cannot be registered at all
    Invalid,
}

impl From<TransportError> for RegisterOutcome {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Busy | TransportError::Stopped => Self::Busy,
            TransportError::Closed => Self::Closed,
        }
    }
}

impl<T: CommandTransport, H: SubmissionHost> GucSubmission<T, H> {
    /// Build the registration message of a context or parallel group
    pub(crate) fn register_message(
        &self,
        ctx: &Context,
        gid: GucId,
    ) -> core::result::Result<H2gMessage, AbiError> {
        let mut lrcas: ArrayVec<u64, MAX_GROUP_WIDTH> = ArrayVec::new();
        lrcas.push(ctx.desc().lrca);
        for &child in ctx.children() {
            let lrca = self.arena.get(child).map_or(0, |c| c.desc().lrca);
            if lrcas.try_push(lrca).is_err() {
                return Err(AbiError::BadValue {
                    action: Action::RegisterContextMultiLrc.raw(),
                    value: ctx.children().len() as u32,
                });
            }
        }
        let (wq_desc_addr, wq_base_addr, wq_size) = ctx
            .scratch()
            .map_or((0, 0, 0), |s| (s.wq_desc_addr(), s.wq_base_addr(), s.wq_size()));
        let flags = if ctx.desc().kernel {
            RegisterFlags::KMD
        } else {
            RegisterFlags::empty()
        };
        message::register_context(&RegisterDesc {
            guc_id: gid.id,
            flags,
            class: ctx.desc().class,
            submit_mask: ctx.desc().logical_mask,
            wq_desc_addr,
            wq_base_addr,
            wq_size,
            lrcas: &lrcas,
        })
    }

    /// Make sure the firmware knows `ctx` under its current id
    pub(crate) fn try_register(&self, ctx: &Arc<Context>, d: &mut Deferred) -> RegisterOutcome {
        let mut ids = self.ids.lock();
        let mut inner = ctx.inner.lock();
        if inner.state.registered() {
            return RegisterOutcome::Ready;
        }
        if inner.state.wait_for_deregister_to_register() {
            return RegisterOutcome::Waiting;
        }
        let Some(gid) = inner.guc_id else {
            log::error!("guc: {} dispatched without a guc id", ctx.id());
            return RegisterOutcome::Invalid;
        };

        match ids.lookup(gid.id) {
            Some(prev) if prev == ctx.id() => {
                // id came back to us before anyone else registered it
                if let Err(e) = inner.state.mark_registered() {
                    log::warn!("guc: {}: {}", ctx.id(), e);
                }
                return RegisterOutcome::Ready;
            }
            Some(prev) if ids.deregister_pending(gid.id) => {
                // an earlier owner already asked, its reply releases us too
                if let Err(e) = inner.state.begin_wait_for_deregister() {
                    log::warn!("guc: {}: {}", ctx.id(), e);
                }
                log::debug!(
                    "guc: {} joins the deregistration of {} ({})",
                    ctx.id(),
                    prev,
                    gid
                );
                return RegisterOutcome::Waiting;
            }
            Some(prev) => {
                let msg = message::deregister_context(gid.id);
                return match self.ct.send(&msg, DEREGISTER_CONTEXT_DONE_LEN) {
                    Ok(()) => {
                        ids.begin_deregister(gid.id);
                        if let Err(e) = inner.state.begin_wait_for_deregister() {
                            log::warn!("guc: {}: {}", ctx.id(), e);
                        }
                        log::debug!(
                            "guc: {} waits for {} to release {}",
                            ctx.id(),
                            prev,
                            gid
                        );
                        RegisterOutcome::Waiting
                    }
                    Err(e) => e.into(),
                };
            }
            None => {}
        }

        let msg = match self.register_message(ctx, gid) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("guc: cannot register {}: {}", ctx.id(), e);
                return RegisterOutcome::Invalid;
            }
        };
        if let Some(scratch) = ctx.scratch() {
            scratch.reset();
            inner.wq.reset();
        }
        match self.ct.send(&msg, 0) {
            Ok(()) => {
                if let Err(e) = inner.state.mark_registered() {
                    log::warn!("guc: {}: {}", ctx.id(), e);
                }
                ids.set_registered(gid.id, ctx.id());
                bump(&self.stats.registrations);
                log::trace!("guc: registered {} as {}", ctx.id(), gid);
                d.events.push(LifecycleEvent::Registered(ctx.id(), gid.id));
                RegisterOutcome::Ready
            }
            Err(e) => e.into(),
        }
    }

    /// Send the context's scheduling policies
    pub(crate) fn send_policies(
        &self,
        gid: GucId,
        inner: &mut ContextInner,
    ) -> core::result::Result<(), TransportError> {
        let msg = message::update_context_policies(gid.id, &inner.policy_klvs());
        self.ct.send(&msg, 0)?;
        inner.state.clear_policy_required();
        Ok(())
    }

    /// Disable scheduling of `ctx` if it is enabled and nothing is pending
    ///
    /// A busy transport re-arms the context's timer for a retry.
    pub(crate) fn sched_disable(&self, ctx: &Arc<Context>, d: &mut Deferred) {
        let _wake = self.wakeref.acquire();
        let mut inner = ctx.inner.lock();
        if !inner.state.can_disable() {
            return;
        }
        let Some(gid) = inner.guc_id else {
            return;
        };
        let msg = message::sched_context_mode_set(gid.id, false);
        match self.ct.send(&msg, SCHED_CONTEXT_MODE_DONE_LEN) {
            Ok(()) => {
                if let Err(e) = inner.state.begin_disable() {
                    log::warn!("guc: {}: {}", ctx.id(), e);
                }
                ctx.get();
                log::trace!("guc: disabling {}", ctx.id());
            }
            Err(TransportError::Busy) => {
                let retry = self.host.now_ms() + 1;
                self.timers.lock().schedule(ctx.id(), retry);
                log::debug!("guc: disable of {} deferred, transport busy", ctx.id());
            }
            Err(TransportError::Stopped) => {
                log::trace!("guc: disable of {} dropped, reset pending", ctx.id());
            }
            Err(TransportError::Closed) => {
                drop(inner);
                self.disable_submission(d);
            }
        }
    }

    /// Deregister contexts whose last reference dropped
    ///
    /// An enabled context is disabled first; the acknowledgement drops the
    /// reference the disable took and puts it back on the list.
    pub(crate) fn process_destroyed(&self, d: &mut Deferred) {
        loop {
            let Some(id) = self.destroyed.lock().pop_front() else {
                break;
            };
            let Some(ctx) = self.arena.get(id) else {
                continue;
            };
            let _wake = self.wakeref.acquire();
            let mut ids = self.ids.lock();
            let mut inner = ctx.inner.lock();
            if inner.state.destroyed() || inner.state.awaiting_ack() {
                continue;
            }
            let registered = inner
                .guc_id
                .filter(|g| ids.lookup(g.id) == Some(id));
            let Some(gid) = registered else {
                drop(inner);
                self.free_locked(&mut ids, &ctx, d);
                continue;
            };

            let (msg, reply, disabling) = if inner.state.can_disable() {
                (
                    message::sched_context_mode_set(gid.id, false),
                    SCHED_CONTEXT_MODE_DONE_LEN,
                    true,
                )
            } else {
                (
                    message::deregister_context(gid.id),
                    DEREGISTER_CONTEXT_DONE_LEN,
                    false,
                )
            };
            match self.ct.send(&msg, reply) {
                Ok(()) if disabling => {
                    if let Err(e) = inner.state.begin_disable() {
                        log::warn!("guc: {}: {}", id, e);
                    }
                    ctx.get();
                }
                Ok(()) => {
                    ids.begin_deregister(gid.id);
                    if let Err(e) = inner.state.mark_destroyed() {
                        log::warn!("guc: {}: {}", id, e);
                    }
                    log::trace!("guc: deregistering {}", id);
                }
                Err(TransportError::Busy) | Err(TransportError::Stopped) => {
                    drop(inner);
                    drop(ids);
                    self.destroyed.lock().push_front(id);
                    break;
                }
                Err(TransportError::Closed) => {
                    drop(inner);
                    self.free_locked(&mut ids, &ctx, d);
                    drop(ids);
                    self.disable_submission(d);
                }
            }
        }
    }
}
