//! # Submission Errors
//!
//! Error handling follows the driver-wide rules:
//! - Transient transport back-pressure is retried inside the dispatcher and
//!   never surfaces here
//! - A closed transport suspends submission and is reported upward as
//!   "device needs reset", never as a crash
//! - Malformed or unexpected firmware messages are protocol violations:
//!   logged, counted, returned

use core::fmt;

use helix_guc_abi::AbiError;

use crate::state::StateError;
use crate::transport::TransportError;
use crate::types::ContextId;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Submission Result type alias
pub type Result<T> = core::result::Result<T, SubmitError>;

// =============================================================================
// PROTOCOL ERRORS
// =============================================================================

/// An inbound message did not match the host's view of the world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Message could not be decoded
    Malformed(AbiError),
    /// No context is registered under this id
    UnknownId(u16),
    /// Mode-set acknowledgement with no matching pending enable/disable
    UnexpectedSchedDone {
        /// Context id
        guc_id: u16,
        /// State the firmware reported
        enabled: bool,
    },
    /// Deregistration acknowledgement nobody was waiting for
    UnexpectedDeregisterDone(u16),
    /// Parallel work-queue descriptor reports an error status
    WorkQueueStatus {
        /// Parent context
        context: ContextId,
        /// Status word
        status: u32,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed message: {}", e),
            Self::UnknownId(id) => write!(f, "no context registered under guc id {}", id),
            Self::UnexpectedSchedDone { guc_id, enabled } => write!(
                f,
                "unexpected sched done ({}) for guc id {}",
                if *enabled { "enable" } else { "disable" },
                guc_id
            ),
            Self::UnexpectedDeregisterDone(id) => {
                write!(f, "unexpected deregister done for guc id {}", id)
            }
            Self::WorkQueueStatus { context, status } => {
                write!(f, "work queue of {} in error state {:#x}", context, status)
            }
        }
    }
}

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Submission error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubmitError {
    /// Transport is out of space right now
    TransportBusy,
    /// Transport is permanently closed, device needs reset
    TransportClosed,
    /// Firmware sent something the host did not expect
    ProtocolViolation(ProtocolError),
    /// No GuC id could be obtained after all retries
    IdExhausted,
    /// A firmware reset is being handled
    ResetInProgress,
    /// Context is banned
    Banned,
    /// Context id does not name a live context
    InvalidContext(ContextId),
    /// Operation is not legal in the context's current state
    InvalidState(StateError),
    /// Argument out of range
    InvalidParameter,
    /// Request not found
    NotFound,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportBusy => write!(f, "transport busy"),
            Self::TransportClosed => write!(f, "transport closed, device needs reset"),
            Self::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            Self::IdExhausted => write!(f, "guc ids exhausted"),
            Self::ResetInProgress => write!(f, "firmware reset in progress"),
            Self::Banned => write!(f, "context banned"),
            Self::InvalidContext(id) => write!(f, "invalid context {}", id),
            Self::InvalidState(e) => write!(f, "invalid state: {}", e),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "request not found"),
        }
    }
}

impl From<ProtocolError> for SubmitError {
    fn from(e: ProtocolError) -> Self {
        Self::ProtocolViolation(e)
    }
}

impl From<AbiError> for SubmitError {
    fn from(e: AbiError) -> Self {
        Self::ProtocolViolation(ProtocolError::Malformed(e))
    }
}

impl From<StateError> for SubmitError {
    fn from(e: StateError) -> Self {
        Self::InvalidState(e)
    }
}

impl From<TransportError> for SubmitError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Busy => Self::TransportBusy,
            TransportError::Closed | TransportError::Stopped => Self::TransportClosed,
        }
    }
}
