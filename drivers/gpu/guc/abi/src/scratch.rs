//! # Parent Scratch Page
//!
//! Each parallel group owns one page, addressed through the parent, laid out
//! as:
//!
//! ```text
//! 0x000 ┌──────────────────────────┐
//!       │ work-queue descriptor    │ head / tail / status
//! 0x040 ├──────────────────────────┤
//!       │ go semaphore             │ parent → children
//! 0x080 ├──────────────────────────┤
//!       │ join semaphore [0..8]    │ child i → parent, one cacheline each
//! 0x280 ├──────────────────────────┤
//!       │ (unused)                 │
//! 0x800 ├──────────────────────────┤
//!       │ work-queue ring          │ WQ_SIZE bytes
//! 0x1000└──────────────────────────┘
//! ```

use static_assertions::const_assert;

use crate::engine::MAX_ENGINE_INSTANCE;

/// Size of the parent scratch page
pub const PARENT_SCRATCH_SIZE: usize = 4096;

/// Work-queue descriptor: firmware-owned head (bytes)
pub const WQ_DESC_HEAD_OFFSET: usize = 0x00;
/// Work-queue descriptor: host-owned tail (bytes)
pub const WQ_DESC_TAIL_OFFSET: usize = 0x04;
/// Work-queue descriptor: status word
pub const WQ_DESC_STATUS_OFFSET: usize = 0x08;

/// Go semaphore written by the parent to release its children
pub const GO_SEMAPHORE_OFFSET: usize = 0x40;

/// First join semaphore
pub const JOIN_SEMAPHORE_BASE: usize = 0x80;

/// Stride between join semaphores (one cacheline)
pub const SEMAPHORE_STRIDE: usize = 0x40;

/// Number of join semaphore slots
pub const MAX_JOIN_SLOTS: usize = MAX_ENGINE_INSTANCE + 1;

/// Work-queue ring size in bytes
pub const WQ_SIZE: usize = PARENT_SCRATCH_SIZE / 2;

/// Work-queue ring offset in the scratch page
pub const WQ_OFFSET: usize = PARENT_SCRATCH_SIZE - WQ_SIZE;

/// Offset of child `idx`'s join semaphore
pub const fn join_semaphore_offset(idx: usize) -> usize {
    JOIN_SEMAPHORE_BASE + idx * SEMAPHORE_STRIDE
}

const_assert!(WQ_SIZE.is_power_of_two());
const_assert!(GO_SEMAPHORE_OFFSET >= WQ_DESC_STATUS_OFFSET + 4);
const_assert!(join_semaphore_offset(MAX_JOIN_SLOTS) <= WQ_OFFSET);
const_assert!(WQ_OFFSET + WQ_SIZE == PARENT_SCRATCH_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_slots_disjoint() {
        assert_eq!(join_semaphore_offset(0), 0x80);
        assert_eq!(join_semaphore_offset(1), 0xc0);
        assert!(join_semaphore_offset(0) > GO_SEMAPHORE_OFFSET);
        assert_eq!(WQ_OFFSET, 0x800);
    }
}
