//! # ABI Errors
//!
//! Decoding failures for firmware-originated data. Encoding never fails:
//! builders are sized for the largest message the protocol defines.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// ABI Result type alias
pub type Result<T> = core::result::Result<T, AbiError>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Firmware data could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AbiError {
    /// Message shorter than its action requires
    Truncated {
        /// Action word of the message
        action: u32,
        /// Dwords received
        len: usize,
    },
    /// Action word not known to this driver
    UnknownAction(u32),
    /// A field holds a value outside its defined range
    BadValue {
        /// Action word of the message
        action: u32,
        /// Offending value
        value: u32,
    },
    /// Empty message
    Empty,
}

impl fmt::Display for AbiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { action, len } => {
                write!(f, "truncated message for action {:#x} ({} dwords)", action, len)
            }
            Self::UnknownAction(a) => write!(f, "unknown action {:#x}", a),
            Self::BadValue { action, value } => {
                write!(f, "bad value {:#x} in action {:#x}", value, action)
            }
            Self::Empty => write!(f, "empty message"),
        }
    }
}
