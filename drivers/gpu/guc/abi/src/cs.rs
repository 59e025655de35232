//! # Command-Stream Instructions
//!
//! The handful of MI instructions the parallel rendezvous emits into rings.

use arrayvec::ArrayVec;

const fn mi_instr(opcode: u32, flags: u32) -> u32 {
    (opcode << 23) | flags
}

/// No-op
pub const MI_NOOP: u32 = 0;
/// Arbitration (preemption point) on/off
pub const MI_ARB_ON_OFF: u32 = mi_instr(0x08, 0);
/// `MI_ARB_ON_OFF` enable bit
pub const MI_ARB_ENABLE: u32 = 1 << 0;
/// Semaphore wait, 4 dwords
pub const MI_SEMAPHORE_WAIT: u32 = mi_instr(0x1c, 2);
/// Address is in the global GTT
pub const MI_USE_GGTT: u32 = 1 << 22;
/// Poll instead of waiting for a signal
pub const MI_SEMAPHORE_POLL: u32 = 1 << 15;
/// Compare: semaphore == data
pub const MI_SEMAPHORE_SAD_EQ_SDD: u32 = 4 << 12;
/// Store dword immediate, 4 dwords
pub const MI_STORE_DWORD_IMM: u32 = mi_instr(0x20, 2);
/// Batch buffer start, 3 dwords
pub const MI_BATCH_BUFFER_START: u32 = mi_instr(0x31, 1);

/// Longest single instruction in dwords
pub const MAX_CS_OP_DW: usize = 4;

/// One rendezvous command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsOp {
    /// Disallow preemption until re-enabled
    ArbDisable,
    /// Allow preemption again
    ArbEnable,
    /// Spin until the dword at `addr` equals `value`
    SemaphoreWait {
        /// GGTT address
        addr: u64,
        /// Value to wait for
        value: u32,
    },
    /// Write `value` to `addr`
    StoreDword {
        /// GGTT address
        addr: u64,
        /// Value to write
        value: u32,
    },
    /// Jump into the user batch
    BatchStart {
        /// Batch address
        addr: u64,
    },
    /// Padding
    Noop,
}

impl CsOp {
    /// Encode into command-stream dwords
    pub fn encode(&self) -> ArrayVec<u32, MAX_CS_OP_DW> {
        let mut out = ArrayVec::new();
        match *self {
            Self::ArbDisable => out.push(MI_ARB_ON_OFF),
            Self::ArbEnable => out.push(MI_ARB_ON_OFF | MI_ARB_ENABLE),
            Self::SemaphoreWait { addr, value } => {
                out.push(MI_SEMAPHORE_WAIT | MI_USE_GGTT | MI_SEMAPHORE_POLL | MI_SEMAPHORE_SAD_EQ_SDD);
                out.push(value);
                out.push(addr as u32);
                out.push((addr >> 32) as u32);
            }
            Self::StoreDword { addr, value } => {
                out.push(MI_STORE_DWORD_IMM | MI_USE_GGTT);
                out.push(addr as u32);
                out.push((addr >> 32) as u32);
                out.push(value);
            }
            Self::BatchStart { addr } => {
                out.push(MI_BATCH_BUFFER_START | MI_USE_GGTT);
                out.push(addr as u32);
                out.push((addr >> 32) as u32);
            }
            Self::Noop => out.push(MI_NOOP),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodings() {
        assert_eq!(CsOp::ArbDisable.encode().as_slice(), &[0x0400_0000]);
        assert_eq!(CsOp::ArbEnable.encode().as_slice(), &[0x0400_0001]);
        let wait = CsOp::SemaphoreWait { addr: 0x1_0000_0080, value: 1 }.encode();
        assert_eq!(wait.len(), 4);
        assert_eq!(wait[0] >> 23, 0x1c);
        assert_eq!(&wait[1..], &[1, 0x80, 1]);
        let store = CsOp::StoreDword { addr: 0x40, value: 7 }.encode();
        assert_eq!(&store[1..], &[0x40, 0, 7]);
        assert_eq!(CsOp::BatchStart { addr: 0 }.encode().len(), 3);
    }
}
