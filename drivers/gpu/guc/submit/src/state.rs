//! # Context State Machine
//!
//! A context's scheduling state is a set of orthogonal flags plus a
//! saturating `blocked` depth. Every change goes through a named transition
//! that checks its precondition; the per-context lock serialises them.
//!
//! | From                         | Transition                  | To                               |
//! |------------------------------|-----------------------------|----------------------------------|
//! | registered, idle             | `begin_enable`              | pending_enable                   |
//! | pending_enable               | `finish_enable`             | enabled                          |
//! | enabled, nothing pending     | `begin_disable`             | pending_disable                  |
//! | pending_disable              | `finish_disable`            | idle                             |
//! | unregistered                 | `mark_registered`           | registered, policy_required      |
//! | unregistered, id stolen      | `begin_wait_for_deregister` | wait_for_deregister_to_register  |
//! | wait_for_deregister          | `finish_wait_for_deregister`| unregistered (registers lazily)  |
//! | any                          | `ban`                       | banned                           |
//! | registered                   | `mark_destroyed`            | destroyed (terminal)             |
//! | any                          | `close`                     | closed                           |
//! | any                          | `block` / `unblock`         | blocked ± 1                      |
//!
//! `pending_enable` and `pending_disable` are never set together.

use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert;

/// Deepest `blocked` nesting tracked; further blocks saturate
pub const BLOCKED_MAX: u16 = 4095;

const_assert!(BLOCKED_MAX < u16::MAX);

/// Named state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Send enable
    BeginEnable,
    /// Enable acknowledged
    FinishEnable,
    /// Enable could not be sent
    AbortEnable,
    /// Send disable
    BeginDisable,
    /// Disable acknowledged
    FinishDisable,
    /// Disable could not be sent
    AbortDisable,
    /// Registration accepted
    Register,
    /// Stolen id still registered to its previous owner
    BeginWaitForDeregister,
    /// Previous owner's deregistration acknowledged
    FinishWaitForDeregister,
    /// Deregistration sent for a dead context
    Destroy,
    /// Leave a blocked section
    Unblock,
    /// Drop a pin
    Unpin,
    /// Queue a request
    Submit,
}

/// A transition was attempted from a state that does not allow it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateError {
    /// What was attempted
    pub transition: Transition,
    /// State at the time
    pub state: ContextState,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal {:?} from {}", self.transition, self.state)
    }
}

/// Acknowledgements a scrub resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scrubbed {
    /// A pending enable was completed
    pub enable: bool,
    /// A pending disable was completed
    pub disable: bool,
    /// A wait for deregistration was completed
    pub deregister_wait: bool,
}

impl Scrubbed {
    /// Number of lost replies resolved
    pub fn count(&self) -> u32 {
        self.enable as u32 + self.disable as u32 + self.deregister_wait as u32
    }
}

// =============================================================================
// CONTEXT STATE
// =============================================================================

bitflags! {
    /// Scheduling flags of a context
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct SchedFlags: u16 {
        /// Firmware knows the context under its id
        const REGISTERED = 1 << 0;
        /// Scheduling enabled (acknowledged)
        const ENABLED = 1 << 1;
        /// Enable sent, not yet acknowledged
        const PENDING_ENABLE = 1 << 2;
        /// Disable sent, not yet acknowledged
        const PENDING_DISABLE = 1 << 3;
        /// Stolen id still registered to its previous owner
        const WAIT_FOR_DEREGISTER = 1 << 4;
        /// Banned
        const BANNED = 1 << 5;
        /// Deregistration sent after the last reference dropped
        const DESTROYED = 1 << 6;
        /// Closed by its owner
        const CLOSED = 1 << 7;
        /// Policies must be sent before the next enable
        const POLICY_REQUIRED = 1 << 8;
    }
}

const FLAG_NAMES: [(SchedFlags, &str); 9] = [
    (SchedFlags::REGISTERED, "registered"),
    (SchedFlags::ENABLED, "enabled"),
    (SchedFlags::PENDING_ENABLE, "pending-enable"),
    (SchedFlags::PENDING_DISABLE, "pending-disable"),
    (SchedFlags::WAIT_FOR_DEREGISTER, "wait-deregister"),
    (SchedFlags::BANNED, "banned"),
    (SchedFlags::DESTROYED, "destroyed"),
    (SchedFlags::CLOSED, "closed"),
    (SchedFlags::POLICY_REQUIRED, "policy-required"),
];

/// Scheduling state of one context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextState {
    flags: SchedFlags,
    blocked: u16,
}

impl ContextState {
    /// Fresh, unregistered state
    pub const fn new() -> Self {
        Self {
            flags: SchedFlags::empty(),
            blocked: 0,
        }
    }

    fn check(&self, ok: bool, transition: Transition) -> Result<(), StateError> {
        if ok {
            Ok(())
        } else {
            Err(StateError {
                transition,
                state: *self,
            })
        }
    }

    #[inline]
    fn has(&self, flag: SchedFlags) -> bool {
        self.flags.contains(flag)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Raw flag set
    pub fn flags(&self) -> SchedFlags {
        self.flags
    }

    /// Registered with the firmware
    pub fn registered(&self) -> bool {
        self.has(SchedFlags::REGISTERED)
    }

    /// Scheduling enabled (acknowledged)
    pub fn enabled(&self) -> bool {
        self.has(SchedFlags::ENABLED)
    }

    /// Enable sent, not yet acknowledged
    pub fn pending_enable(&self) -> bool {
        self.has(SchedFlags::PENDING_ENABLE)
    }

    /// Disable sent, not yet acknowledged
    pub fn pending_disable(&self) -> bool {
        self.has(SchedFlags::PENDING_DISABLE)
    }

    /// Waiting for the previous owner of a stolen id to deregister
    pub fn wait_for_deregister_to_register(&self) -> bool {
        self.has(SchedFlags::WAIT_FOR_DEREGISTER)
    }

    /// Banned
    pub fn banned(&self) -> bool {
        self.has(SchedFlags::BANNED)
    }

    /// Deregistration sent after the last reference dropped
    pub fn destroyed(&self) -> bool {
        self.has(SchedFlags::DESTROYED)
    }

    /// Closed by its owner
    pub fn closed(&self) -> bool {
        self.has(SchedFlags::CLOSED)
    }

    /// Policies must be sent before the next enable
    pub fn policy_required(&self) -> bool {
        self.has(SchedFlags::POLICY_REQUIRED)
    }

    /// Block depth
    pub fn blocked(&self) -> u16 {
        self.blocked
    }

    /// No enable or disable in flight and not enabled
    pub fn is_idle(&self) -> bool {
        !self.flags.intersects(
            SchedFlags::ENABLED | SchedFlags::PENDING_ENABLE | SchedFlags::PENDING_DISABLE,
        )
    }

    /// Requests must be held back instead of dispatched
    pub fn must_fence(&self) -> bool {
        self.blocked > 0
            || self
                .flags
                .intersects(SchedFlags::WAIT_FOR_DEREGISTER | SchedFlags::PENDING_DISABLE)
    }

    /// An enable/disable acknowledgement is owed
    pub fn awaiting_ack(&self) -> bool {
        self.flags
            .intersects(SchedFlags::PENDING_ENABLE | SchedFlags::PENDING_DISABLE)
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// idle → pending_enable
    pub fn begin_enable(&mut self) -> Result<(), StateError> {
        self.check(
            self.registered()
                && self.is_idle()
                && !self.flags.intersects(
                    SchedFlags::BANNED | SchedFlags::DESTROYED | SchedFlags::WAIT_FOR_DEREGISTER,
                ),
            Transition::BeginEnable,
        )?;
        self.flags.insert(SchedFlags::PENDING_ENABLE);
        Ok(())
    }

    /// pending_enable → enabled
    pub fn finish_enable(&mut self) -> Result<(), StateError> {
        self.check(self.pending_enable(), Transition::FinishEnable)?;
        self.flags.remove(SchedFlags::PENDING_ENABLE);
        self.flags.insert(SchedFlags::ENABLED);
        Ok(())
    }

    /// pending_enable → idle
    pub fn abort_enable(&mut self) -> Result<(), StateError> {
        self.check(self.pending_enable(), Transition::AbortEnable)?;
        self.flags.remove(SchedFlags::PENDING_ENABLE);
        Ok(())
    }

    /// enabled → pending_disable
    pub fn begin_disable(&mut self) -> Result<(), StateError> {
        self.check(
            self.enabled() && !self.awaiting_ack(),
            Transition::BeginDisable,
        )?;
        self.flags.remove(SchedFlags::ENABLED);
        self.flags.insert(SchedFlags::PENDING_DISABLE);
        Ok(())
    }

    /// pending_disable → idle
    pub fn finish_disable(&mut self) -> Result<(), StateError> {
        self.check(self.pending_disable(), Transition::FinishDisable)?;
        self.flags.remove(SchedFlags::PENDING_DISABLE);
        Ok(())
    }

    /// pending_disable → enabled
    pub fn abort_disable(&mut self) -> Result<(), StateError> {
        self.check(self.pending_disable(), Transition::AbortDisable)?;
        self.flags.remove(SchedFlags::PENDING_DISABLE);
        self.flags.insert(SchedFlags::ENABLED);
        Ok(())
    }

    /// Whether a disable may be sent now
    pub fn can_disable(&self) -> bool {
        self.enabled() && !self.awaiting_ack() && !self.destroyed()
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// unregistered → registered
    pub fn mark_registered(&mut self) -> Result<(), StateError> {
        self.check(
            !self.flags.intersects(
                SchedFlags::REGISTERED | SchedFlags::WAIT_FOR_DEREGISTER | SchedFlags::DESTROYED,
            ),
            Transition::Register,
        )?;
        self.flags
            .insert(SchedFlags::REGISTERED | SchedFlags::POLICY_REQUIRED);
        Ok(())
    }

    /// Forget the firmware registration (id stolen)
    pub fn mark_unregistered(&mut self) {
        self.flags
            .remove(SchedFlags::REGISTERED | SchedFlags::POLICY_REQUIRED);
    }

    /// unregistered → wait_for_deregister_to_register
    pub fn begin_wait_for_deregister(&mut self) -> Result<(), StateError> {
        self.check(
            !self
                .flags
                .intersects(SchedFlags::REGISTERED | SchedFlags::WAIT_FOR_DEREGISTER),
            Transition::BeginWaitForDeregister,
        )?;
        self.flags.insert(SchedFlags::WAIT_FOR_DEREGISTER);
        Ok(())
    }

    /// wait_for_deregister_to_register → unregistered
    pub fn finish_wait_for_deregister(&mut self) -> Result<(), StateError> {
        self.check(
            self.wait_for_deregister_to_register(),
            Transition::FinishWaitForDeregister,
        )?;
        self.flags.remove(SchedFlags::WAIT_FOR_DEREGISTER);
        Ok(())
    }

    /// Policies were sent
    pub fn clear_policy_required(&mut self) {
        self.flags.remove(SchedFlags::POLICY_REQUIRED);
    }

    /// Policies changed and must be resent
    pub fn set_policy_required(&mut self) {
        if self.registered() {
            self.flags.insert(SchedFlags::POLICY_REQUIRED);
        }
    }

    // -------------------------------------------------------------------------
    // Lifetime
    // -------------------------------------------------------------------------

    fn set_once(&mut self, flag: SchedFlags) -> bool {
        let first = !self.has(flag);
        self.flags.insert(flag);
        first
    }

    /// Ban, returns false if already banned
    pub fn ban(&mut self) -> bool {
        self.set_once(SchedFlags::BANNED)
    }

    /// Close, returns false if already closed
    pub fn close(&mut self) -> bool {
        self.set_once(SchedFlags::CLOSED)
    }

    /// registered → destroyed
    pub fn mark_destroyed(&mut self) -> Result<(), StateError> {
        self.check(
            self.registered() && !self.destroyed(),
            Transition::Destroy,
        )?;
        self.flags.insert(SchedFlags::DESTROYED);
        Ok(())
    }

    /// Enter a blocked section, returns the new depth
    pub fn block(&mut self) -> u16 {
        if self.blocked == BLOCKED_MAX {
            log::warn!("guc: context block depth saturated at {}", BLOCKED_MAX);
        } else {
            self.blocked += 1;
        }
        self.blocked
    }

    /// Leave a blocked section, returns the new depth
    pub fn unblock(&mut self) -> Result<u16, StateError> {
        self.check(self.blocked > 0, Transition::Unblock)?;
        self.blocked -= 1;
        Ok(self.blocked)
    }

    // -------------------------------------------------------------------------
    // Reset
    // -------------------------------------------------------------------------

    /// Resolve every owed acknowledgement as if it had arrived
    pub fn scrub(&mut self) -> Scrubbed {
        let done = Scrubbed {
            enable: self.pending_enable(),
            disable: self.pending_disable(),
            deregister_wait: self.wait_for_deregister_to_register(),
        };
        if done.enable {
            self.flags.insert(SchedFlags::ENABLED);
        }
        self.flags.remove(
            SchedFlags::PENDING_ENABLE
                | SchedFlags::PENDING_DISABLE
                | SchedFlags::WAIT_FOR_DEREGISTER,
        );
        done
    }

    /// Drop everything the firmware knew about the context
    pub fn clear_firmware_state(&mut self) {
        self.flags.remove(
            SchedFlags::REGISTERED
                | SchedFlags::ENABLED
                | SchedFlags::PENDING_ENABLE
                | SchedFlags::PENDING_DISABLE
                | SchedFlags::WAIT_FOR_DEREGISTER
                | SchedFlags::POLICY_REQUIRED,
        );
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        for (flag, name) in FLAG_NAMES {
            if self.has(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        write!(f, "] blocked={}", self.blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered() -> ContextState {
        let mut s = ContextState::new();
        s.mark_registered().unwrap();
        s
    }

    #[test]
    fn test_enable_disable_cycle() {
        let mut s = registered();
        assert!(s.policy_required());
        s.begin_enable().unwrap();
        assert!(s.begin_enable().is_err());
        assert!(s.begin_disable().is_err());
        s.finish_enable().unwrap();
        assert!(s.enabled());
        s.begin_disable().unwrap();
        assert!(!s.enabled() && s.pending_disable());
        assert!(s.must_fence());
        s.finish_disable().unwrap();
        assert!(s.is_idle());
    }

    #[test]
    fn test_pending_flags_exclusive() {
        let mut s = registered();
        s.begin_enable().unwrap();
        // a disable cannot start while an enable is in flight
        assert_eq!(
            s.begin_disable().unwrap_err().transition,
            Transition::BeginDisable
        );
        assert!(!(s.pending_enable() && s.pending_disable()));
    }

    #[test]
    fn test_enable_requires_registration() {
        let mut s = ContextState::new();
        assert!(s.begin_enable().is_err());
        s.begin_wait_for_deregister().unwrap();
        assert!(s.mark_registered().is_err());
        s.finish_wait_for_deregister().unwrap();
        s.mark_registered().unwrap();
        s.begin_enable().unwrap();
    }

    #[test]
    fn test_ban_idempotent() {
        let mut s = registered();
        assert!(s.ban());
        let once = s;
        assert!(!s.ban());
        assert_eq!(s, once);
        assert!(s.begin_enable().is_err());
    }

    #[test]
    fn test_blocked_saturates() {
        let mut s = ContextState::new();
        for _ in 0..BLOCKED_MAX as u32 + 10 {
            s.block();
        }
        assert_eq!(s.blocked(), BLOCKED_MAX);
        assert_eq!(s.unblock().unwrap(), BLOCKED_MAX - 1);
        let mut t = ContextState::new();
        assert!(t.unblock().is_err());
    }

    #[test]
    fn test_scrub_resolves_pending() {
        let mut s = registered();
        s.begin_enable().unwrap();
        let done = s.scrub();
        assert!(done.enable && !done.disable);
        assert!(s.enabled());

        s.begin_disable().unwrap();
        let done = s.scrub();
        assert_eq!(done.count(), 1);
        assert!(s.is_idle());
    }

    #[test]
    fn test_destroy_terminal() {
        let mut s = registered();
        s.mark_destroyed().unwrap();
        assert!(s.mark_destroyed().is_err());
        assert!(s.begin_enable().is_err());
    }

    #[test]
    fn test_flags_view() {
        let mut s = registered();
        s.begin_enable().unwrap();
        assert_eq!(
            s.flags(),
            SchedFlags::REGISTERED | SchedFlags::POLICY_REQUIRED | SchedFlags::PENDING_ENABLE
        );
        s.clear_firmware_state();
        assert!(s.flags().is_empty());
    }

    #[test]
    fn test_display() {
        let mut s = registered();
        s.ban();
        let text = alloc::format!("{}", s);
        assert_eq!(text, "[registered|banned|policy-required] blocked=0");
    }
}
