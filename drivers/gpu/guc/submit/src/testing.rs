//! # Test Doubles
//!
//! A scripted [`CommandTransport`] that answers mode-set and deregister
//! messages like the firmware would, a [`SubmissionHost`] with a manual
//! clock, and a [`Harness`] bundling both with a backend.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hashbrown::HashMap;
use helix_guc_abi::action::Action;
use helix_guc_abi::EngineClass;
use spin::Mutex;

use crate::config::SubmissionConfig;
use crate::context::{ContextDesc, ParallelDesc};
use crate::fence::Fence;
use crate::request::Request;
use crate::submission::{GucSubmission, ResetReason, SubmissionHost};
use crate::telemetry::{LifecycleEvent, LifecycleObserver};
use crate::transport::{CommandTransport, TransportError};
use crate::types::{ContextId, EngineMask};

// =============================================================================
// TRANSPORT
// =============================================================================

#[derive(Debug, Default)]
struct MockState {
    /// Upcoming send results, `false` bounces with `Busy`
    script: VecDeque<bool>,
    sent: Vec<Vec<u32>>,
    blocking: Vec<Vec<u32>>,
    replies: VecDeque<Vec<u32>>,
}

/// Transport that records messages and queues firmware replies
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    closed: AtomicBool,
}

impl MockTransport {
    /// Open transport with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounce the next `n` sends
    pub fn push_busy(&self, n: usize) {
        let mut s = self.state.lock();
        s.script.extend(core::iter::repeat(false).take(n));
    }

    /// Let `ok` sends through, then bounce `busy`
    pub fn push_busy_after(&self, ok: usize, busy: usize) {
        let mut s = self.state.lock();
        s.script.extend(core::iter::repeat(true).take(ok));
        s.script.extend(core::iter::repeat(false).take(busy));
    }

    /// Close the channel for good
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Non-blocking messages accepted so far
    pub fn sent(&self) -> Vec<Vec<u32>> {
        self.state.lock().sent.clone()
    }

    /// Blocking messages accepted so far
    pub fn sent_blocking(&self) -> Vec<Vec<u32>> {
        self.state.lock().blocking.clone()
    }

    /// Forget recorded messages, replies stay queued
    pub fn clear(&self) {
        let mut s = self.state.lock();
        s.sent.clear();
        s.blocking.clear();
    }

    /// Next firmware reply
    pub fn pop_reply(&self) -> Option<Vec<u32>> {
        self.state.lock().replies.pop_front()
    }

    /// Replies waiting to be delivered
    pub fn pending_replies(&self) -> usize {
        self.state.lock().replies.len()
    }

    fn reply_to(action: &[u32]) -> Option<Vec<u32>> {
        let (&head, rest) = action.split_first()?;
        match Action::from_raw(head).ok() {
            Some(Action::SchedContextModeSet) if rest.len() >= 2 => {
                Some(vec![Action::SchedContextModeDone.raw(), rest[0], rest[1]])
            }
            Some(Action::DeregisterContext) if !rest.is_empty() => {
                Some(vec![Action::DeregisterContextDone.raw(), rest[0]])
            }
            _ => None,
        }
    }
}

impl CommandTransport for MockTransport {
    fn send_nb(&self, action: &[u32], _g2h_len: u32) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut s = self.state.lock();
        if !s.script.pop_front().unwrap_or(true) {
            return Err(TransportError::Busy);
        }
        s.sent.push(action.to_vec());
        if let Some(reply) = Self::reply_to(action) {
            s.replies.push_back(reply);
        }
        Ok(())
    }

    fn send_blocking(&self, action: &[u32]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.state.lock().blocking.push(action.to_vec());
        Ok(())
    }
}

// =============================================================================
// HOST
// =============================================================================

/// Host with a manual clock that records every callback
#[derive(Debug, Default)]
pub struct MockHost {
    now: AtomicU64,
    dispatch_requests: AtomicU64,
    retire_calls: AtomicU64,
    backoffs: Mutex<Vec<u64>>,
    resets: Mutex<Vec<ResetReason>>,
    captures: Mutex<Vec<Option<ContextId>>>,
}

impl MockHost {
    /// Clock at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }

    /// Times `schedule_dispatch` was called
    pub fn dispatch_requests(&self) -> u64 {
        self.dispatch_requests.load(Ordering::Acquire)
    }

    /// Times `retire_completed` was called
    pub fn retire_calls(&self) -> u64 {
        self.retire_calls.load(Ordering::Acquire)
    }

    /// Back-off delays requested, in order
    pub fn backoffs(&self) -> Vec<u64> {
        self.backoffs.lock().clone()
    }

    /// Device resets requested, in order
    pub fn reset_requests(&self) -> Vec<ResetReason> {
        self.resets.lock().clone()
    }

    /// Error captures requested, in order
    pub fn captures(&self) -> Vec<Option<ContextId>> {
        self.captures.lock().clone()
    }
}

impl SubmissionHost for MockHost {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn retire_completed(&self) {
        self.retire_calls.fetch_add(1, Ordering::AcqRel);
    }

    fn backoff(&self, ms: u64) {
        self.backoffs.lock().push(ms);
    }

    fn schedule_dispatch(&self) {
        self.dispatch_requests.fetch_add(1, Ordering::AcqRel);
    }

    fn request_device_reset(&self, reason: ResetReason) {
        self.resets.lock().push(reason);
    }

    fn capture_error_state(&self, ctx: Option<ContextId>) {
        self.captures.lock().push(ctx);
    }
}

/// Observer that keeps every event
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl EventLog {
    /// Events seen so far
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }
}

impl LifecycleObserver for EventLog {
    fn on_event(&self, event: &LifecycleEvent, _now_ms: u64) {
        self.events.lock().push(*event);
    }
}

// =============================================================================
// HARNESS
// =============================================================================

/// Backend wired to the mocks, with the fences of submitted requests
pub struct Harness {
    /// Backend under test
    pub guc: GucSubmission<MockTransport, MockHost>,
    fences: Mutex<HashMap<u64, Fence>>,
}

impl Harness {
    /// Submit a request, panics if the backend refuses it
    pub fn submit(&self, ctx: ContextId, prio: i32, tail: u32) -> u64 {
        self.submit_request(Request::new(ctx, prio, tail))
    }

    /// Submit a parallel request with per-child tails
    pub fn submit_parallel(&self, parent: ContextId, tail: u32, child_tails: &[u32]) -> u64 {
        let req = Request::new(parent, 0, tail)
            .with_child_tails(child_tails)
            .expect("too many child tails");
        self.submit_request(req)
    }

    fn submit_request(&self, req: Request) -> u64 {
        let fence = req.fence().clone();
        let seqno = self.guc.submit_request(req).expect("submit refused");
        self.fences.lock().insert(seqno, fence);
        seqno
    }

    /// Fence of a submitted request
    pub fn fence(&self, seqno: u64) -> Fence {
        self.fences
            .lock()
            .get(&seqno)
            .cloned()
            .expect("unknown sequence number")
    }

    /// Action word of every message sent
    pub fn actions(&self) -> Vec<u32> {
        self.guc.transport().sent().iter().map(|m| m[0]).collect()
    }

    /// Feed every queued firmware reply back into the backend
    pub fn deliver_replies(&self) {
        while let Some(reply) = self.guc.transport().pop_reply() {
            if let Err(e) = self.guc.process_g2h(&reply) {
                panic!("reply {:x?} rejected: {}", reply, e);
            }
        }
    }

    /// GuC id of a pinned context
    pub fn gid(&self, ctx: ContextId) -> u16 {
        self.guc
            .context_snapshot(ctx)
            .expect("no such context")
            .guc_id
            .expect("context holds no id")
            .id
    }
}

/// Backend with `num_ids` ids and default settings otherwise
pub fn submission(num_ids: u32) -> Harness {
    let config = SubmissionConfig::builder()
        .num_guc_ids(num_ids)
        .build()
        .expect("bad config");
    submission_with(config)
}

/// Backend with a custom configuration
pub fn submission_with(config: SubmissionConfig) -> Harness {
    let guc = GucSubmission::new(config, MockTransport::new(), MockHost::new())
        .expect("backend rejected config");
    guc.init().expect("init failed");
    Harness {
        guc,
        fences: Mutex::new(HashMap::new()),
    }
}

/// Render context on instance 0
pub fn desc() -> ContextDesc {
    ContextDesc {
        class: EngineClass::Render,
        logical_mask: 1,
        engines: EngineMask::engine(EngineClass::Render, 0),
        lrca: 0x1000,
        kernel: false,
    }
}

/// Create and pin a single context
pub fn pinned_context(h: &Harness) -> ContextId {
    let ctx = h.guc.create_context(desc()).expect("create failed");
    h.guc.context_pin(ctx).expect("pin failed");
    ctx
}

/// Create an unpinned parallel group with `children` children
pub fn parallel_context(h: &Harness, children: usize) -> ContextId {
    let kids = (0..children)
        .map(|i| ContextDesc {
            logical_mask: 1 << (i + 1),
            engines: EngineMask::engine(EngineClass::Render, (i + 1) as u8),
            lrca: 0x2000 + 0x1000 * i as u64,
            ..desc()
        })
        .collect();
    h.guc
        .create_parallel(ParallelDesc {
            parent: desc(),
            children: kids,
            scratch_addr: 0x10_0000,
        })
        .expect("create failed")
}

/// Shared event log already attached to `h`
pub fn event_log(h: &Harness) -> Arc<EventLog> {
    let log = Arc::new(EventLog::default());
    h.guc.add_observer(log.clone());
    log
}
