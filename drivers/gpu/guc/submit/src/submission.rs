//! # GuC Submission Backend
//!
//! [`GucSubmission`] owns every piece of shared state: the id table, the
//! context arena, the dispatch queue, the delayed-disable timers and the list
//! of contexts waiting for deregistration. The host integrates it through
//! [`SubmissionHost`] (clock, completion polling, back-off, device reset) and
//! a [`CommandTransport`].
//!
//! Work that must not run under a lock (dropping references, notifying
//! observers, sending a schedule-disable) is collected into a [`Deferred`]
//! batch and flushed once the locks are released.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use helix_guc_abi::engine::MAX_ENGINE_INSTANCE;
use helix_guc_abi::message;
use spin::{Mutex, RwLock};

use crate::config::SubmissionConfig;
use crate::context::{
    Context, ContextArena, ContextDesc, ContextInner, ContextPolicy, ContextSnapshot, ParallelDesc,
};
use crate::dispatch::DispatchState;
use crate::error::{Result, SubmitError};
use crate::fence::FenceError;
use crate::id::{IdError, IdTable};
use crate::request::Request;
use crate::reset::ResetPhase;
use crate::state::{StateError, Transition};
use crate::telemetry::{LifecycleEvent, LifecycleObserver};
use crate::timer::DelayedWork;
use crate::transport::{CommandTransport, GucCt};
use crate::types::{ContextId, EngineMask, GucId};
use crate::wakeref::WakeRefTracker;
use crate::wq::ParentScratch;

// =============================================================================
// HOST INTERFACE
// =============================================================================

/// Why the backend asks the host for a full device reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The command transport closed
    TransportClosed,
    /// Firmware could not recover an engine
    EngineFailure {
        /// Engine class
        class: u32,
        /// Engine instance
        instance: u32,
        /// Firmware reason code
        reason: u32,
    },
    /// A parallel work queue reported an error status
    WorkQueueError,
}

/// Services the embedding driver provides
///
/// Callbacks are invoked with no backend lock held, but they must not call
/// back into the backend synchronously.
pub trait SubmissionHost: Send + Sync {
    /// Monotonic clock in milliseconds
    fn now_ms(&self) -> u64;

    /// Retire whatever requests have completed, freeing pins and ids
    fn retire_completed(&self);

    /// Sleep before the next id-allocation attempt
    fn backoff(&self, ms: u64);

    /// Arrange for [`GucSubmission::dispatch`] to run soon
    fn schedule_dispatch(&self);

    /// The device needs a full reset
    fn request_device_reset(&self, reason: ResetReason);

    /// Capture engine state for a hang report
    fn capture_error_state(&self, ctx: Option<ContextId>);
}

// =============================================================================
// STATISTICS
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct SubmissionStats {
    pub(crate) submitted: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) retired: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) stalls: AtomicU64,
    pub(crate) registrations: AtomicU64,
    pub(crate) id_steals: AtomicU64,
    pub(crate) bans: AtomicU64,
    pub(crate) context_resets: AtomicU64,
    pub(crate) resets: AtomicU64,
    pub(crate) protocol_violations: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests accepted by `submit_request`
    pub submitted: u64,
    /// Requests handed to the firmware
    pub dispatched: u64,
    /// Requests retired successfully
    pub retired: u64,
    /// Requests whose fence failed
    pub failed: u64,
    /// Dispatch passes that stopped on a busy transport
    pub stalls: u64,
    /// Registrations sent
    pub registrations: u64,
    /// Ids taken from idle contexts
    pub id_steals: u64,
    /// Contexts banned
    pub bans: u64,
    /// Firmware context-reset notifications
    pub context_resets: u64,
    /// Firmware resets handled
    pub resets: u64,
    /// Unexpected or malformed firmware messages
    pub protocol_violations: u64,
}

// =============================================================================
// DEFERRED WORK
// =============================================================================

/// Side effects collected under locks and applied after they are dropped
#[derive(Default)]
pub(crate) struct Deferred {
    pub(crate) puts: Vec<Arc<Context>>,
    pub(crate) disables: Vec<ContextId>,
    pub(crate) events: Vec<LifecycleEvent>,
    pub(crate) kick_dispatch: bool,
    pub(crate) device_reset: Option<ResetReason>,
    pub(crate) capture: Option<Option<ContextId>>,
}

impl Deferred {
    fn has_work(&self) -> bool {
        !self.puts.is_empty() || !self.disables.is_empty()
    }
}

// =============================================================================
// SUBMISSION BACKEND
// =============================================================================

/// The GuC submission backend
pub struct GucSubmission<T, H> {
    pub(crate) config: SubmissionConfig,
    pub(crate) ct: GucCt<T>,
    pub(crate) host: H,
    pub(crate) dispatch: Mutex<DispatchState>,
    pub(crate) ids: Mutex<IdTable>,
    pub(crate) arena: ContextArena,
    pub(crate) timers: Mutex<DelayedWork>,
    pub(crate) destroyed: Mutex<VecDeque<ContextId>>,
    pub(crate) wakeref: WakeRefTracker,
    observers: RwLock<Vec<Arc<dyn LifecycleObserver>>>,
    pub(crate) phase: AtomicU8,
    pub(crate) submission_disabled: AtomicBool,
    next_seqno: AtomicU64,
    pub(crate) stats: SubmissionStats,
}

impl<T: CommandTransport, H: SubmissionHost> GucSubmission<T, H> {
    /// Create a backend; nothing is sent until [`init`](Self::init)
    pub fn new(config: SubmissionConfig, transport: T, host: H) -> Result<Self> {
        config.validate()?;
        let ids = IdTable::new(config.num_guc_ids, config.multi_lrc_ids());
        log::debug!(
            "guc: submission backend with {} ids ({} reserved for parallel contexts)",
            config.num_guc_ids,
            config.multi_lrc_ids()
        );
        Ok(Self {
            config,
            ct: GucCt::new(transport),
            host,
            dispatch: Mutex::new(DispatchState::new()),
            ids: Mutex::new(ids),
            arena: ContextArena::new(),
            timers: Mutex::new(DelayedWork::new()),
            destroyed: Mutex::new(VecDeque::new()),
            wakeref: WakeRefTracker::new(),
            observers: RwLock::new(Vec::new()),
            phase: AtomicU8::new(ResetPhase::Running as u8),
            submission_disabled: AtomicBool::new(false),
            next_seqno: AtomicU64::new(1),
            stats: SubmissionStats::default(),
        })
    }

    /// Send the global scheduling policies
    pub fn init(&self) -> Result<()> {
        self.apply_global_policy()?;
        log::info!("guc: submission enabled");
        Ok(())
    }

    pub(crate) fn apply_global_policy(&self) -> Result<()> {
        let _wake = self.wakeref.acquire();
        let msg = message::global_sched_policy_change(self.config.render_compute_yield);
        self.ct.send_blocking(&msg).map_err(|e| {
            log::error!("guc: global policy update failed: {}", e);
            SubmitError::from(e)
        })
    }

    /// Fail all work and free every context
    pub fn teardown(&self) -> usize {
        self.wedge();
        let mut d = Deferred::default();
        let mut freed = 0;
        {
            let mut ids = self.ids.lock();
            for ctx in self.arena.all() {
                if ctx.parent().is_some() {
                    continue;
                }
                self.free_locked(&mut ids, &ctx, &mut d);
                freed += 1;
            }
        }
        self.timers.lock().clear();
        self.destroyed.lock().clear();
        self.ct.clear_outstanding();
        self.flush(d);
        log::info!("guc: submission torn down, {} contexts freed", freed);
        freed
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Configuration in use
    pub fn config(&self) -> &SubmissionConfig {
        &self.config
    }

    /// The wrapped transport
    pub fn transport(&self) -> &T {
        self.ct.inner()
    }

    /// The host services
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Register a lifecycle observer
    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.write().push(observer);
    }

    /// Counters
    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.stats;
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            submitted: get(&s.submitted),
            dispatched: get(&s.dispatched),
            retired: get(&s.retired),
            failed: get(&s.failed),
            stalls: get(&s.stalls),
            registrations: get(&s.registrations),
            id_steals: get(&s.id_steals),
            bans: get(&s.bans),
            context_resets: get(&s.context_resets),
            resets: get(&s.resets),
            protocol_violations: get(&s.protocol_violations),
        }
    }

    /// Replies the firmware still owes
    pub fn outstanding_acks(&self) -> i32 {
        self.ct.outstanding()
    }

    /// Whether submission was suspended by a closed transport
    pub fn submission_disabled(&self) -> bool {
        self.submission_disabled.load(Ordering::Acquire)
    }

    /// No wakeref held and no reply owed
    pub fn is_idle(&self) -> bool {
        self.wakeref.active() == 0 && self.ct.outstanding() == 0
    }

    /// Requests waiting in the priority queue
    pub fn queued(&self) -> usize {
        self.dispatch.lock().queue.len()
    }

    /// Live contexts (children included)
    pub fn context_count(&self) -> usize {
        self.arena.len()
    }

    /// Observable state of a context
    pub fn context_snapshot(&self, id: ContextId) -> Result<ContextSnapshot> {
        Ok(self.lookup(id)?.snapshot())
    }

    /// Context holding a GuC id
    pub fn guc_id_owner(&self, guc_id: u16) -> Option<ContextId> {
        self.ids.lock().owner(guc_id)
    }

    /// Context the firmware knows under a GuC id
    pub fn guc_id_registrant(&self, guc_id: u16) -> Option<ContextId> {
        self.ids.lock().lookup(guc_id)
    }

    /// Delayed-disable deadline of a context, if armed
    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.timers.lock().next_deadline()
    }

    pub(crate) fn lookup(&self, id: ContextId) -> Result<Arc<Context>> {
        self.arena.get(id).ok_or(SubmitError::InvalidContext(id))
    }

    fn default_policy(&self) -> ContextPolicy {
        ContextPolicy {
            exec_quantum_us: self.config.exec_quantum_us,
            preempt_timeout_us: self.config.preempt_timeout_us,
            preempt_to_idle: self.config.preempt_to_idle,
        }
    }

    // -------------------------------------------------------------------------
    // Context lifetime
    // -------------------------------------------------------------------------

    /// Create a single context
    pub fn create_context(&self, desc: ContextDesc) -> Result<ContextId> {
        let policy = self.default_policy();
        let ids = self
            .arena
            .insert_group(1, |ids| vec![Context::new(ids[0], desc, policy)]);
        let id = ids[0];
        log::trace!("guc: created {}", id);
        self.notify(&[LifecycleEvent::Created(id)]);
        Ok(id)
    }

    /// Create a parallel group, returns the parent
    pub fn create_parallel(&self, desc: ParallelDesc) -> Result<ContextId> {
        let n = desc.children.len();
        if n == 0 || n > MAX_ENGINE_INSTANCE {
            return Err(SubmitError::InvalidParameter);
        }
        if desc.children.iter().any(|c| c.class != desc.parent.class) {
            return Err(SubmitError::InvalidParameter);
        }
        let policy = self.default_policy();
        let scratch = Arc::new(ParentScratch::new(desc.scratch_addr, self.config.wq_size));
        let ParallelDesc {
            parent, children, ..
        } = desc;
        let ids = self.arena.insert_group(n + 1, move |ids| {
            let mut group = Vec::with_capacity(ids.len());
            group.push(Context::new_parent(
                ids[0],
                parent,
                policy,
                ids[1..].to_vec(),
                scratch,
            ));
            for (i, child) in children.into_iter().enumerate() {
                group.push(Context::new_child(ids[i + 1], child, policy, ids[0], i as u8));
            }
            group
        });
        let events: Vec<LifecycleEvent> = ids.iter().map(|&i| LifecycleEvent::Created(i)).collect();
        log::debug!("guc: created parallel group {} with {} children", ids[0], n);
        self.notify(&events);
        Ok(ids[0])
    }

    /// Mark a context closed; it is disabled as soon as possible
    pub fn context_close(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        {
            let mut inner = ctx.inner.lock();
            if !inner.state.close() {
                return Ok(());
            }
        }
        self.timers.lock().cancel(id);
        let mut d = Deferred::default();
        self.sched_disable(&ctx, &mut d);
        self.flush(d);
        Ok(())
    }

    /// Drop the creator's reference
    pub fn context_destroy(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        if ctx.parent().is_some() {
            return Err(SubmitError::InvalidParameter);
        }
        if !ctx.mark_released() {
            return Err(SubmitError::InvalidContext(id));
        }
        ctx.inner.lock().state.close();
        let mut d = Deferred::default();
        d.puts.push(ctx);
        self.flush(d);
        Ok(())
    }

    /// Change a context's scheduling policy, sent before its next dispatch
    pub fn set_context_policy(&self, id: ContextId, policy: ContextPolicy) -> Result<()> {
        let ctx = self.lookup(id)?;
        let mut ds = self.dispatch.lock();
        let mut inner = ctx.inner.lock();
        inner.policy = policy;
        inner.state.set_policy_required();
        if inner.state.registered() && !ds.kicks.contains(&id) {
            ds.kicks.push_back(id);
            drop(inner);
            drop(ds);
            self.host.schedule_dispatch();
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pinning
    // -------------------------------------------------------------------------

    /// Pin a context, obtaining a GuC id
    ///
    /// When the id space is exhausted the host is asked to retire completed
    /// work and back off before each retry.
    pub fn context_pin(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        if ctx.parent().is_some() {
            return Err(SubmitError::InvalidParameter);
        }
        let attempts = self.config.id_attempts();
        for attempt in 0..attempts {
            match self.pin_guc_id(&ctx) {
                Err(SubmitError::IdExhausted) if attempt + 1 < attempts => {
                    let delay = self.config.id_retry_backoff_ms[attempt];
                    log::debug!(
                        "guc: no id for {}, retry {} after {} ms",
                        id,
                        attempt + 1,
                        delay
                    );
                    self.host.retire_completed();
                    self.host.backoff(delay);
                }
                Err(SubmitError::IdExhausted) => {
                    log::warn!("guc: no id for {} after {} attempts", id, attempts);
                    return Err(SubmitError::IdExhausted);
                }
                other => return other,
            }
        }
        Err(SubmitError::IdExhausted)
    }

    fn pin_guc_id(&self, ctx: &Arc<Context>) -> Result<()> {
        let mut d = Deferred::default();
        {
            let mut ids = self.ids.lock();
            {
                let mut inner = ctx.inner.lock();
                if inner.state.banned() {
                    return Err(SubmitError::Banned);
                }
                if inner.state.closed() {
                    return Err(SubmitError::InvalidContext(ctx.id()));
                }
                if inner.guc_id.is_some() {
                    inner.pin_count += 1;
                    ctx.get();
                    ids.remove_idle(ctx.id());
                    return Ok(());
                }
            }

            let gid = match ids.allocate(ctx.id(), ctx.is_parent(), ctx.width()) {
                Ok(gid) => gid,
                Err(IdError::Exhausted) if !ctx.is_parallel() => {
                    match self.steal_id(&mut ids, ctx, &mut d) {
                        Some(gid) => gid,
                        None => return Err(SubmitError::IdExhausted),
                    }
                }
                Err(_) => return Err(SubmitError::IdExhausted),
            };

            let mut inner = ctx.inner.lock();
            inner.guc_id = Some(gid);
            inner.pin_count += 1;
            ctx.get();
            log::trace!("guc: {} pinned with {}", ctx.id(), gid);
        }
        self.flush(d);
        Ok(())
    }

    /// Take the id of the least recently used idle context
    fn steal_id(&self, ids: &mut IdTable, ctx: &Arc<Context>, d: &mut Deferred) -> Option<GucId> {
        let arena = &self.arena;
        let victim_id = ids.steal_one(|cid| {
            arena
                .get(cid)
                .map_or(false, |v| !v.is_parallel() && v.inner.lock().stealable())
        })?;
        let victim = self.arena.get(victim_id)?;
        let gid = {
            let mut v = victim.inner.lock();
            let gid = v.guc_id.take()?;
            v.state.mark_unregistered();
            gid
        };
        ids.transfer(gid.id, ctx.id());
        bump(&self.stats.id_steals);
        log::debug!("guc: {} stole {} from {}", ctx.id(), gid, victim_id);
        d.events.push(LifecycleEvent::IdStolen {
            from: victim_id,
            to: ctx.id(),
            guc_id: gid.id,
        });
        Some(gid)
    }

    /// Drop a pin; the last pin starts the delayed schedule-disable
    pub fn context_unpin(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        let mut disable_now = false;
        {
            let mut ids = self.ids.lock();
            let mut inner = ctx.inner.lock();
            if inner.pin_count == 0 {
                return Err(SubmitError::InvalidState(StateError {
                    transition: Transition::Unpin,
                    state: inner.state,
                }));
            }
            inner.pin_count -= 1;
            if inner.pin_count == 0 {
                if !ctx.is_parallel() && inner.guc_id.is_some() {
                    ids.push_idle(id);
                }
                disable_now = self.arm_idle_disable(&ids, id, &inner);
            }
        }
        let mut d = Deferred::default();
        if disable_now {
            self.sched_disable(&ctx, &mut d);
        }
        d.puts.push(ctx);
        self.flush(d);
        Ok(())
    }

    /// Start the idle disable of a drained context; true when it has to go
    /// out right away
    fn arm_idle_disable(&self, ids: &IdTable, id: ContextId, inner: &ContextInner) -> bool {
        if !inner.drained() || !inner.state.can_disable() {
            return false;
        }
        let pressure = ids.used_single() > self.config.sched_disable_threshold();
        if pressure || inner.state.closed() || self.config.sched_disable_delay_ms == 0 {
            return true;
        }
        let deadline = self.host.now_ms() + self.config.sched_disable_delay_ms;
        self.timers.lock().schedule(id, deadline);
        false
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Queue a request on a pinned context, returns its sequence number
    pub fn submit_request(&self, req: Request) -> Result<u64> {
        let ctx = self.lookup(req.context())?;
        if ctx.parent().is_some() {
            return Err(SubmitError::InvalidParameter);
        }
        if ctx.is_parent() && req.child_tails().len() != ctx.children().len() {
            return Err(SubmitError::InvalidParameter);
        }
        let mut req = req;
        let seqno = self.next_seqno.fetch_add(1, Ordering::Relaxed);
        req.set_seqno(seqno);
        {
            let mut ds = self.dispatch.lock();
            let mut inner = ctx.inner.lock();
            if inner.state.banned() {
                req.fence().fail(FenceError::Banned);
                bump(&self.stats.failed);
                return Err(SubmitError::Banned);
            }
            if inner.pin_count == 0 || inner.state.closed() {
                return Err(SubmitError::InvalidState(StateError {
                    transition: Transition::Submit,
                    state: inner.state,
                }));
            }
            self.timers.lock().cancel(ctx.id());
            if inner.outstanding == 0 {
                ctx.get();
            }
            inner.account_request(req.guc_priority());
            if inner.state.must_fence() {
                log::trace!("guc: {} fenced request {}", ctx.id(), seqno);
                inner.fence_request(req);
            } else {
                ds.queue.push(req);
            }
        }
        bump(&self.stats.submitted);
        self.host.schedule_dispatch();
        Ok(seqno)
    }

    /// The request completed on the GPU
    ///
    /// Retiring the last request of an unpinned context starts its idle
    /// disable.
    pub fn retire_request(&self, id: ContextId, seqno: u64) -> Result<()> {
        let ctx = self.lookup(id)?;
        let mut d = Deferred::default();
        let mut disable_now = false;
        {
            let ids = self.ids.lock();
            let mut inner = ctx.inner.lock();
            let pos = inner
                .inflight
                .iter()
                .position(|r| r.seqno() == seqno)
                .ok_or(SubmitError::NotFound)?;
            let req = inner.inflight.remove(pos).ok_or(SubmitError::NotFound)?;
            req.fence().signal();
            inner.release_request(req.guc_priority());
            if inner.outstanding == 0 {
                d.puts.push(ctx.clone());
                disable_now = self.arm_idle_disable(&ids, id, &inner);
            }
        }
        bump(&self.stats.retired);
        if disable_now {
            self.sched_disable(&ctx, &mut d);
        }
        self.flush(d);
        Ok(())
    }

    /// Cancel a request
    ///
    /// Queued and fenced requests fail immediately. A request already owned
    /// by the firmware fails too, and the context is blocked until a
    /// schedule-disable has taken it off the hardware.
    pub fn cancel_request(&self, id: ContextId, seqno: u64) -> Result<()> {
        let ctx = self.lookup(id)?;
        let mut d = Deferred::default();
        let mut need_disable = false;
        {
            let mut ds = self.dispatch.lock();
            let queued = match ds.queue.remove(seqno) {
                Some(req) => Some((req, false)),
                None => ds.take_stalled(id, seqno),
            };
            let mut inner = ctx.inner.lock();
            let found = queued
                .or_else(|| {
                    let pos = inner.fenced.iter().position(|r| r.seqno() == seqno)?;
                    inner.fenced.remove(pos).map(|r| (r, false))
                })
                .or_else(|| {
                    let pos = inner.inflight.iter().position(|r| r.seqno() == seqno)?;
                    inner.inflight.remove(pos).map(|r| (r, true))
                });
            let Some((req, running)) = found else {
                return Err(SubmitError::NotFound);
            };
            self.fail_request_locked(&ctx, &mut inner, req, FenceError::Cancelled, &mut d);

            if running {
                inner.state.block();
                if inner.state.can_disable() {
                    inner.unblock_on_disable += 1;
                    need_disable = true;
                } else if inner.state.awaiting_ack() {
                    // an enable turns into a disable when it is acknowledged
                    inner.unblock_on_disable += 1;
                } else if let Err(e) = inner.state.unblock() {
                    // not scheduled on the firmware, nothing to take off
                    log::warn!("guc: {}: {}", id, e);
                }
                log::debug!("guc: cancelled running request {} of {}", seqno, id);
            }
        }
        if need_disable {
            self.sched_disable(&ctx, &mut d);
        }
        self.flush(d);
        Ok(())
    }

    pub(crate) fn fail_request_locked(
        &self,
        ctx: &Arc<Context>,
        inner: &mut ContextInner,
        req: Request,
        err: FenceError,
        d: &mut Deferred,
    ) {
        req.fence().fail(err);
        inner.release_request(req.guc_priority());
        bump(&self.stats.failed);
        if inner.outstanding == 0 {
            d.puts.push(ctx.clone());
        }
    }

    // -------------------------------------------------------------------------
    // Ban / block
    // -------------------------------------------------------------------------

    /// Ban a context: fail all of its work and take it off the hardware
    ///
    /// Banning twice has the same effect as banning once.
    pub fn ban(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        let mut d = Deferred::default();
        {
            let mut ds = self.dispatch.lock();
            let mut inner = ctx.inner.lock();
            if !inner.state.ban() {
                return Ok(());
            }
            bump(&self.stats.bans);
            log::warn!("guc: banning {}", id);
            d.events.push(LifecycleEvent::Banned(id));

            let mut doomed = ds.queue.drain_context(id);
            if let Some(batch) = ds.take_stalled_context(id) {
                doomed.extend(batch);
            }
            doomed.extend(inner.fenced.drain(..));
            doomed.extend(inner.inflight.drain(..));
            for req in doomed {
                self.fail_request_locked(&ctx, &mut inner, req, FenceError::Banned, &mut d);
            }

            // shortest preemption timeout so the disable lands quickly
            if let (true, Some(gid)) = (inner.state.can_disable(), inner.guc_id) {
                let mut klvs = inner.policy_klvs();
                klvs.preemption_timeout_us = 1;
                let msg = message::update_context_policies(gid.id, &klvs);
                if let Err(e) = self.ct.send(&msg, 0) {
                    log::debug!("guc: ban policy for {} not sent: {}", id, e);
                }
                inner.state.set_policy_required();
            }
        }
        self.timers.lock().cancel(id);
        self.sched_disable(&ctx, &mut d);
        self.flush(d);
        Ok(())
    }

    /// Enter a blocked section; new work is fenced and the context is
    /// disabled on the firmware
    pub fn context_block(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        let depth = ctx.inner.lock().state.block();
        log::trace!("guc: {} blocked ({})", id, depth);
        let mut d = Deferred::default();
        self.sched_disable(&ctx, &mut d);
        self.flush(d);
        Ok(())
    }

    /// Whether a blocked context has left the hardware
    pub fn context_is_quiesced(&self, id: ContextId) -> Result<bool> {
        let ctx = self.lookup(id)?;
        let inner = ctx.inner.lock();
        Ok(inner.state.is_idle())
    }

    /// Leave a blocked section; the last unblock releases fenced work
    pub fn context_unblock(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        let mut d = Deferred::default();
        {
            let mut ds = self.dispatch.lock();
            let mut inner = ctx.inner.lock();
            if inner.state.unblock()? == 0 {
                self.release_fenced(&ctx, &mut inner, &mut ds, &mut d);
            }
        }
        self.flush(d);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reference counting and destruction
    // -------------------------------------------------------------------------

    pub(crate) fn put(&self, ctx: &Arc<Context>, d: &mut Deferred) {
        if ctx.put_unless_last() {
            return;
        }
        let mut ids = self.ids.lock();
        if !ctx.put_locked() {
            return;
        }
        self.destroy_locked(&mut ids, ctx, d);
    }

    /// Last reference dropped
    fn destroy_locked(&self, ids: &mut IdTable, ctx: &Arc<Context>, d: &mut Deferred) {
        let registered_here = {
            let inner = ctx.inner.lock();
            inner
                .guc_id
                .map_or(false, |g| ids.lookup(g.id) == Some(ctx.id()))
        };
        self.timers.lock().cancel(ctx.id());
        ids.remove_idle(ctx.id());

        if registered_here && !self.submission_disabled() && self.ct.is_enabled() {
            log::trace!("guc: {} queued for deregistration", ctx.id());
            self.destroyed.lock().push_back(ctx.id());
            d.kick_dispatch = true;
        } else {
            self.free_locked(ids, ctx, d);
        }
    }

    /// Release the id and drop the group from the arena
    pub(crate) fn free_locked(&self, ids: &mut IdTable, ctx: &Arc<Context>, d: &mut Deferred) {
        {
            let mut inner = ctx.inner.lock();
            if let Some(gid) = inner.guc_id.take() {
                if ids.lookup(gid.id) == Some(ctx.id()) {
                    ids.clear_registered(gid.id);
                }
                ids.release(ctx.id(), gid);
            }
            ids.remove_idle(ctx.id());
        }
        self.timers.lock().cancel(ctx.id());
        for &child in ctx.children() {
            self.arena.remove(child);
            d.events.push(LifecycleEvent::Destroyed(child));
        }
        self.arena.remove(ctx.id());
        d.events.push(LifecycleEvent::Destroyed(ctx.id()));
        log::trace!("guc: freed {}", ctx.id());
    }

    /// Suspend submission after the transport closed
    pub(crate) fn disable_submission(&self, d: &mut Deferred) {
        if !self.submission_disabled.swap(true, Ordering::AcqRel) {
            log::error!("guc: transport closed, submission disabled until reset");
            d.device_reset = Some(ResetReason::TransportClosed);
        }
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    /// Run expired delayed disables and pending deregistrations
    pub fn run_timers(&self) {
        let now = self.host.now_ms();
        let due = self.timers.lock().expired(now);
        let mut d = Deferred::default();
        for id in due {
            let Some(ctx) = self.arena.get(id) else {
                continue;
            };
            let wanted = {
                let inner = ctx.inner.lock();
                inner.drained()
                    || inner.state.banned()
                    || inner.state.blocked() > 0
                    || inner.unblock_on_disable > 0
            };
            if wanted {
                self.sched_disable(&ctx, &mut d);
            }
        }
        self.process_destroyed(&mut d);
        self.flush(d);
    }

    // -------------------------------------------------------------------------
    // Deferred work
    // -------------------------------------------------------------------------

    pub(crate) fn notify(&self, events: &[LifecycleEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read();
        if observers.is_empty() {
            return;
        }
        let now = self.host.now_ms();
        for event in events {
            for o in observers.iter() {
                o.on_event(event, now);
            }
        }
    }

    /// Apply deferred work; no backend lock may be held
    pub(crate) fn flush(&self, mut d: Deferred) {
        while d.has_work() {
            let disables = mem::take(&mut d.disables);
            let puts = mem::take(&mut d.puts);
            for id in disables {
                if let Some(ctx) = self.arena.get(id) {
                    self.sched_disable(&ctx, &mut d);
                }
            }
            for ctx in puts {
                self.put(&ctx, &mut d);
            }
        }
        self.notify(&d.events);
        if let Some(ctx) = d.capture {
            self.host.capture_error_state(ctx);
        }
        if let Some(reason) = d.device_reset {
            self.host.request_device_reset(reason);
        }
        if d.kick_dispatch {
            self.host.schedule_dispatch();
        }
    }

    // -------------------------------------------------------------------------
    // Parallel command streams
    // -------------------------------------------------------------------------

    fn group_semaphores(&self, parent: &Context) -> Result<crate::rendezvous::GroupSemaphores> {
        let scratch = parent.scratch().ok_or(SubmitError::InvalidParameter)?;
        Ok(crate::rendezvous::GroupSemaphores {
            go: scratch.go_addr(),
            join_base: scratch.join_addr(0),
            join_stride: helix_guc_abi::scratch::SEMAPHORE_STRIDE as u64,
            children: parent.children().len(),
        })
    }

    /// Commands a group member emits before its batch
    pub fn emit_bb_start(
        &self,
        id: ContextId,
        batch: u64,
    ) -> Result<Vec<helix_guc_abi::cs::CsOp>> {
        let ctx = self.lookup(id)?;
        match (ctx.parent(), ctx.child_index()) {
            (Some(parent), Some(idx)) => {
                let parent = self.lookup(parent)?;
                let sem = self.group_semaphores(&parent)?;
                Ok(crate::rendezvous::child_bb_start(&sem, idx, batch))
            }
            _ => {
                let sem = self.group_semaphores(&ctx)?;
                Ok(crate::rendezvous::parent_bb_start(&sem, batch))
            }
        }
    }

    /// Commands a group member emits after its batch
    pub fn emit_fini(&self, id: ContextId) -> Result<Vec<helix_guc_abi::cs::CsOp>> {
        let ctx = self.lookup(id)?;
        match (ctx.parent(), ctx.child_index()) {
            (Some(parent), Some(idx)) => {
                let parent = self.lookup(parent)?;
                let sem = self.group_semaphores(&parent)?;
                Ok(crate::rendezvous::child_fini(&sem, idx))
            }
            _ => {
                let sem = self.group_semaphores(&ctx)?;
                Ok(crate::rendezvous::parent_fini(&sem))
            }
        }
    }

    /// Engines a context (and its children) may run on
    pub(crate) fn group_engines(&self, ctx: &Context) -> EngineMask {
        ctx.children()
            .iter()
            .filter_map(|&c| self.arena.get(c))
            .fold(ctx.desc().engines, |m, c| m.union(c.desc().engines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        desc, event_log, parallel_context, pinned_context, submission, submission_with,
    };
    use crate::{DispatchOutcome, FenceStatus};
    use helix_guc_abi::action::Action;

    /// Pinned context whose first request ran and was acknowledged
    fn enabled_context(h: &crate::testing::Harness) -> (ContextId, u64) {
        let ctx = pinned_context(h);
        let seqno = h.submit(ctx, 0, 0x40);
        h.guc.dispatch();
        h.deliver_replies();
        (ctx, seqno)
    }

    #[test]
    fn test_pin_exhaustion_backs_off() {
        let config = SubmissionConfig::builder().num_guc_ids(2).build().unwrap();
        let h = submission_with(config);
        pinned_context(&h);
        pinned_context(&h);
        let ctx = h.guc.create_context(desc()).unwrap();
        assert_eq!(h.guc.context_pin(ctx), Err(SubmitError::IdExhausted));
        assert_eq!(h.guc.host().backoffs(), vec![0, 10, 20]);
        assert_eq!(h.guc.host().retire_calls(), 3);
        assert_eq!(h.guc.context_snapshot(ctx).unwrap().guc_id, None);
    }

    #[test]
    fn test_pinned_ids_unique() {
        let h = submission(64);
        let mut seen: Vec<u16> = (0..20).map(|_| h.gid(pinned_context(&h))).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 20);
        assert!(seen.iter().all(|&g| g as u32 >= h.guc.config().multi_lrc_ids()));
    }

    #[test]
    fn test_submit_needs_pin() {
        let h = submission(64);
        let ctx = h.guc.create_context(desc()).unwrap();
        let res = h.guc.submit_request(Request::new(ctx, 0, 0x40));
        assert!(matches!(res, Err(SubmitError::InvalidState(_))));

        let parent = parallel_context(&h, 1);
        let child = h.guc.arena.get(parent).unwrap().children()[0];
        assert_eq!(
            h.guc.submit_request(Request::new(child, 0, 0x40)),
            Err(SubmitError::InvalidParameter)
        );
    }

    #[test]
    fn test_idle_disable_after_delay() {
        let h = submission(64);
        let (ctx, seqno) = enabled_context(&h);
        h.guc.retire_request(ctx, seqno).unwrap();
        h.guc.context_unpin(ctx).unwrap();
        assert_eq!(h.guc.next_timer_deadline(), Some(34));

        h.guc.transport().clear();
        h.guc.run_timers();
        assert!(h.actions().is_empty());
        h.guc.host().advance(34);
        h.guc.run_timers();
        assert_eq!(h.actions(), vec![Action::SchedContextModeSet.raw()]);
        h.deliver_replies();
        assert!(h.guc.context_snapshot(ctx).unwrap().state.is_idle());
        assert!(h.guc.is_idle());
    }

    #[test]
    fn test_new_work_cancels_delayed_disable() {
        let h = submission(64);
        let (ctx, seqno) = enabled_context(&h);
        h.guc.retire_request(ctx, seqno).unwrap();
        h.guc.context_unpin(ctx).unwrap();
        assert!(h.guc.next_timer_deadline().is_some());
        h.guc.context_pin(ctx).unwrap();
        h.submit(ctx, 0, 0x80);
        assert_eq!(h.guc.next_timer_deadline(), None);
    }

    #[test]
    fn test_unpin_under_pressure_disables_now() {
        let config = SubmissionConfig::builder()
            .num_guc_ids(64)
            .sched_disable_gucid_threshold(0)
            .build()
            .unwrap();
        let h = submission_with(config);
        let (ctx, seqno) = enabled_context(&h);
        h.guc.retire_request(ctx, seqno).unwrap();
        h.guc.transport().clear();
        h.guc.context_unpin(ctx).unwrap();
        assert_eq!(h.actions(), vec![Action::SchedContextModeSet.raw()]);
        assert!(h.guc.context_snapshot(ctx).unwrap().state.pending_disable());
        assert_eq!(h.guc.next_timer_deadline(), None);
    }

    #[test]
    fn test_ban_twice_is_ban_once() {
        let h = submission(64);
        let (ctx, seqno) = enabled_context(&h);
        h.guc.transport().clear();
        h.guc.ban(ctx).unwrap();
        assert_eq!(
            h.actions(),
            vec![
                Action::UpdateContextPolicies.raw(),
                Action::SchedContextModeSet.raw()
            ]
        );
        assert_eq!(h.fence(seqno).status(), FenceStatus::Failed(FenceError::Banned));

        h.guc.ban(ctx).unwrap();
        assert_eq!(h.actions().len(), 2);
        assert_eq!(h.guc.stats().bans, 1);
        assert_eq!(h.guc.stats().failed, 1);
        assert_eq!(
            h.guc.submit_request(Request::new(ctx, 0, 0x80)),
            Err(SubmitError::Banned)
        );
    }

    #[test]
    fn test_cancel_queued_request() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        let seqno = h.submit(ctx, 0, 0x40);
        h.guc.cancel_request(ctx, seqno).unwrap();
        assert_eq!(h.fence(seqno).status(), FenceStatus::Failed(FenceError::Cancelled));
        assert_eq!(h.guc.queued(), 0);
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Idle);
        assert!(h.guc.transport().sent().is_empty());
        assert_eq!(h.guc.cancel_request(ctx, seqno), Err(SubmitError::NotFound));
    }

    #[test]
    fn test_cancel_running_request_blocks_until_disabled() {
        let h = submission(64);
        let (ctx, seqno) = enabled_context(&h);
        h.guc.cancel_request(ctx, seqno).unwrap();
        assert_eq!(h.fence(seqno).status(), FenceStatus::Failed(FenceError::Cancelled));
        let snap = h.guc.context_snapshot(ctx).unwrap();
        assert_eq!(snap.state.blocked(), 1);
        assert!(snap.state.pending_disable());

        // held back while the firmware takes the context off
        h.submit(ctx, 0, 0x80);
        assert_eq!(h.guc.context_snapshot(ctx).unwrap().fenced, 1);
        h.deliver_replies();
        let snap = h.guc.context_snapshot(ctx).unwrap();
        assert_eq!(snap.state.blocked(), 0);
        assert_eq!(snap.fenced, 0);
        assert_eq!(h.guc.queued(), 1);

        h.guc.transport().clear();
        h.guc.dispatch();
        assert_eq!(h.actions(), vec![Action::SchedContextModeSet.raw()]);
    }

    #[test]
    fn test_block_fences_until_unblock() {
        let h = submission(64);
        let (ctx, _) = enabled_context(&h);
        h.guc.context_block(ctx).unwrap();
        assert!(!h.guc.context_is_quiesced(ctx).unwrap());
        h.deliver_replies();
        assert!(h.guc.context_is_quiesced(ctx).unwrap());

        let seqno = h.submit(ctx, 0, 0x80);
        assert_eq!(h.guc.queued(), 0);
        h.guc.context_unblock(ctx).unwrap();
        assert_eq!(h.guc.queued(), 1);
        assert_eq!(h.fence(seqno).status(), FenceStatus::Pending);
        assert!(h.guc.context_unblock(ctx).is_err());
    }

    #[test]
    fn test_policy_change_sent_on_next_dispatch() {
        let h = submission(64);
        let (ctx, _) = enabled_context(&h);
        h.guc.transport().clear();
        h.guc
            .set_context_policy(
                ctx,
                ContextPolicy {
                    exec_quantum_us: 500,
                    preempt_timeout_us: 1000,
                    preempt_to_idle: false,
                },
            )
            .unwrap();
        assert_eq!(h.guc.dispatch(), DispatchOutcome::Idle);
        assert_eq!(h.actions(), vec![Action::UpdateContextPolicies.raw()]);
    }

    #[test]
    fn test_destroy_twice_rejected() {
        let h = submission(64);
        let ctx = h.guc.create_context(desc()).unwrap();
        h.guc.context_pin(ctx).unwrap();
        h.guc.context_destroy(ctx).unwrap();
        // still pinned, so still alive
        assert!(h.guc.context_snapshot(ctx).unwrap().state.closed());
        assert_eq!(h.guc.context_destroy(ctx), Err(SubmitError::InvalidContext(ctx)));
        h.guc.context_unpin(ctx).unwrap();
        assert_eq!(h.guc.context_count(), 0);
    }

    #[test]
    fn test_parallel_group_shape() {
        let h = submission(64);
        let too_wide = ParallelDesc {
            parent: desc(),
            children: vec![desc(); MAX_ENGINE_INSTANCE + 1],
            scratch_addr: 0x10_0000,
        };
        assert_eq!(h.guc.create_parallel(too_wide), Err(SubmitError::InvalidParameter));

        let parent = parallel_context(&h, 3);
        assert_eq!(h.guc.context_count(), 4);
        h.guc.context_pin(parent).unwrap();
        let gid = h.guc.context_snapshot(parent).unwrap().guc_id.unwrap();
        assert_eq!(gid.width, 4);
        assert!((gid.id as u32) < h.guc.config().multi_lrc_ids());

        let child = h.guc.arena.get(parent).unwrap().children()[0];
        assert!(!h.guc.emit_bb_start(parent, 0x5000).unwrap().is_empty());
        assert!(!h.guc.emit_bb_start(child, 0x6000).unwrap().is_empty());
        assert!(!h.guc.emit_fini(child).unwrap().is_empty());
        let single = pinned_context(&h);
        assert_eq!(h.guc.emit_fini(single), Err(SubmitError::InvalidParameter));
    }

    #[test]
    fn test_observer_sees_lifecycle() {
        let h = submission(64);
        let log = event_log(&h);
        let (ctx, seqno) = enabled_context(&h);
        let gid = h.gid(ctx);
        assert_eq!(
            log.events(),
            vec![
                LifecycleEvent::Created(ctx),
                LifecycleEvent::Registered(ctx, gid),
                LifecycleEvent::Enabled(ctx),
            ]
        );
        h.guc.retire_request(ctx, seqno).unwrap();
        assert_eq!(h.fence(seqno).status(), FenceStatus::Signaled);
    }

    #[test]
    fn test_teardown_fails_and_frees_everything() {
        let h = submission(64);
        let (ctx, seqno) = enabled_context(&h);
        let other = pinned_context(&h);
        let queued = h.submit(other, 0, 0x40);
        assert_eq!(h.guc.teardown(), 2);
        assert_eq!(h.guc.context_count(), 0);
        assert_eq!(h.fence(seqno).status(), FenceStatus::Failed(FenceError::Wedged));
        assert_eq!(h.fence(queued).status(), FenceStatus::Failed(FenceError::Wedged));
        assert!(h.guc.context_snapshot(ctx).is_err());
        assert_eq!(h.guc.outstanding_acks(), 0);
    }

    #[test]
    fn test_unblock_reenables_work_in_flight() {
        let h = submission(64);
        let (ctx, seqno) = enabled_context(&h);
        h.guc.context_block(ctx).unwrap();
        h.deliver_replies();
        assert!(h.guc.context_is_quiesced(ctx).unwrap());

        h.guc.context_unblock(ctx).unwrap();
        h.guc.transport().clear();
        h.guc.dispatch();
        assert_eq!(h.actions(), vec![Action::SchedContextModeSet.raw()]);
        h.deliver_replies();
        let snap = h.guc.context_snapshot(ctx).unwrap();
        assert!(snap.state.enabled());
        assert_eq!(snap.inflight, 1);

        h.guc.retire_request(ctx, seqno).unwrap();
        assert_eq!(h.fence(seqno).status(), FenceStatus::Signaled);
        assert_eq!(h.guc.outstanding_acks(), 0);
    }

    #[test]
    fn test_cancel_running_request_keeps_the_rest_running() {
        let h = submission(64);
        let ctx = pinned_context(&h);
        let a = h.submit(ctx, 0, 0x40);
        let b = h.submit(ctx, 0, 0x80);
        h.guc.dispatch();
        h.deliver_replies();

        h.guc.cancel_request(ctx, a).unwrap();
        h.deliver_replies();
        let snap = h.guc.context_snapshot(ctx).unwrap();
        assert_eq!(snap.state.blocked(), 0);
        assert!(!snap.state.enabled());

        h.guc.transport().clear();
        h.guc.dispatch();
        assert_eq!(h.actions(), vec![Action::SchedContextModeSet.raw()]);
        h.deliver_replies();
        assert!(h.guc.context_snapshot(ctx).unwrap().state.enabled());
        h.guc.retire_request(ctx, b).unwrap();
        assert_eq!(h.fence(a).status(), FenceStatus::Failed(FenceError::Cancelled));
        assert_eq!(h.fence(b).status(), FenceStatus::Signaled);
    }

    #[test]
    fn test_unpin_with_work_in_flight_stays_enabled() {
        let h = submission(64);
        let (ctx, seqno) = enabled_context(&h);
        h.guc.context_unpin(ctx).unwrap();
        assert_eq!(h.guc.next_timer_deadline(), None);

        h.guc.transport().clear();
        h.guc.host().advance(100);
        h.guc.run_timers();
        assert!(h.actions().is_empty());
        assert!(h.guc.context_snapshot(ctx).unwrap().state.enabled());

        // the last retirement starts the idle disable
        h.guc.retire_request(ctx, seqno).unwrap();
        assert_eq!(h.guc.next_timer_deadline(), Some(134));
        h.guc.host().advance(34);
        h.guc.run_timers();
        assert_eq!(h.actions(), vec![Action::SchedContextModeSet.raw()]);
        h.deliver_replies();
        assert!(h.guc.context_snapshot(ctx).unwrap().state.is_idle());
        assert!(h.guc.is_idle());
    }
}
