//! # Action Opcodes
//!
//! Every host-to-GuC (H2G) and GuC-to-host (G2H) message starts with an
//! action word. Replies are correlated with requests by the context id they
//! carry, never by sequence number.

use crate::error::{AbiError, Result};

// =============================================================================
// ACTIONS
// =============================================================================

/// GuC action opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Action {
    // =========================================================================
    // Host to GuC
    // =========================================================================
    /// Lightweight "new work available" kick for an enabled context
    SchedContext = 0x1000,
    /// Enable or disable scheduling of a context
    SchedContextModeSet = 0x1002,
    /// Update per-context scheduling policies (KLV payload)
    UpdateContextPolicies = 0x100B,
    /// Change global scheduling policy (KLV payload)
    GlobalSchedPolicyChange = 0x0506,
    /// Register a single-LRC context
    RegisterContext = 0x4502,
    /// Deregister a context, freeing its id on the firmware side
    DeregisterContext = 0x4503,
    /// Register a parent + children (parallel) context
    RegisterContextMultiLrc = 0x4601,

    // =========================================================================
    // GuC to Host
    // =========================================================================
    /// Acknowledgement of a `SchedContextModeSet`
    SchedContextModeDone = 0x1003,
    /// Firmware reset a context after a hang
    ContextResetNotification = 0x1008,
    /// Firmware could not recover an engine
    EngineFailureNotification = 0x1009,
    /// Acknowledgement of a `DeregisterContext`
    DeregisterContextDone = 0x4600,
    /// Engine state was captured for error reporting
    StateCaptureNotification = 0x8002,
}

impl Action {
    /// Raw opcode
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Decode an opcode
    pub fn from_raw(raw: u32) -> Result<Self> {
        Ok(match raw {
            0x1000 => Self::SchedContext,
            0x1002 => Self::SchedContextModeSet,
            0x100B => Self::UpdateContextPolicies,
            0x0506 => Self::GlobalSchedPolicyChange,
            0x4502 => Self::RegisterContext,
            0x4503 => Self::DeregisterContext,
            0x4601 => Self::RegisterContextMultiLrc,
            0x1003 => Self::SchedContextModeDone,
            0x1008 => Self::ContextResetNotification,
            0x1009 => Self::EngineFailureNotification,
            0x4600 => Self::DeregisterContextDone,
            0x8002 => Self::StateCaptureNotification,
            other => return Err(AbiError::UnknownAction(other)),
        })
    }

    /// Whether the message travels from the GuC to the host
    pub const fn is_g2h(self) -> bool {
        matches!(
            self,
            Self::SchedContextModeDone
                | Self::ContextResetNotification
                | Self::EngineFailureNotification
                | Self::DeregisterContextDone
                | Self::StateCaptureNotification
        )
    }

    /// Length in dwords of the G2H reply a request expects, 0 if none
    pub const fn reply_len(self) -> u32 {
        match self {
            Self::SchedContextModeSet => SCHED_CONTEXT_MODE_DONE_LEN,
            Self::DeregisterContext => DEREGISTER_CONTEXT_DONE_LEN,
            _ => 0,
        }
    }
}

/// `SchedContextModeDone` payload: action, id, state
pub const SCHED_CONTEXT_MODE_DONE_LEN: u32 = 3;

/// `DeregisterContextDone` payload: action, id
pub const DEREGISTER_CONTEXT_DONE_LEN: u32 = 2;

/// `SchedContextModeSet` argument: stop scheduling
pub const MODE_DISABLE: u32 = 0;

/// `SchedContextModeSet` argument: start scheduling
pub const MODE_ENABLE: u32 = 1;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for action in [
            Action::SchedContext,
            Action::RegisterContextMultiLrc,
            Action::DeregisterContextDone,
            Action::GlobalSchedPolicyChange,
        ] {
            assert_eq!(Action::from_raw(action.raw()), Ok(action));
        }
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(Action::from_raw(0xdead), Err(AbiError::UnknownAction(0xdead)));
    }

    #[test]
    fn test_reply_lengths() {
        assert_eq!(Action::SchedContextModeSet.reply_len(), 3);
        assert_eq!(Action::DeregisterContext.reply_len(), 2);
        assert_eq!(Action::SchedContext.reply_len(), 0);
        assert_eq!(Action::RegisterContext.reply_len(), 0);
        assert!(Action::DeregisterContextDone.is_g2h());
        assert!(!Action::DeregisterContext.is_g2h());
    }
}
