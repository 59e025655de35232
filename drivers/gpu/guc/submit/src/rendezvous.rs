//! # Parallel Rendezvous
//!
//! Command-stream handshake that keeps a parallel group in lock-step. Before
//! its batch the parent waits for every child to join, then releases them
//! through the go semaphore. Each child joins, waits for go, and only then
//! turns preemption off for the length of its own batch. The fini breadcrumb
//! repeats the handshake with the opposite values and turns preemption back
//! on, so a preemption either hits the whole group between batches or none
//! of it.

use alloc::vec::Vec;

use helix_guc_abi::cs::CsOp;

/// Value a child writes to its join semaphore before its batch
pub const PARENT_GO_BB: u32 = 1;
/// Value a child writes to its join semaphore after its batch
pub const PARENT_GO_FINI_BREADCRUMB: u32 = 0;
/// Value the parent writes to the go semaphore before the batches
pub const CHILD_GO_BB: u32 = 1;
/// Value the parent writes to the go semaphore after the batches
pub const CHILD_GO_FINI_BREADCRUMB: u32 = 0;

/// Semaphore addresses of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSemaphores {
    /// Go semaphore
    pub go: u64,
    /// First join semaphore
    pub join_base: u64,
    /// Distance between join semaphores
    pub join_stride: u64,
    /// Number of children
    pub children: usize,
}

impl GroupSemaphores {
    /// Join semaphore of child `idx`
    pub fn join(&self, idx: usize) -> u64 {
        self.join_base + idx as u64 * self.join_stride
    }
}

/// Parent: wait for children, lock out preemption, release, run
pub fn parent_bb_start(sem: &GroupSemaphores, batch: u64) -> Vec<CsOp> {
    let mut ops = Vec::with_capacity(sem.children + 3);
    for i in 0..sem.children {
        ops.push(CsOp::SemaphoreWait {
            addr: sem.join(i),
            value: PARENT_GO_BB,
        });
    }
    ops.push(CsOp::ArbDisable);
    ops.push(CsOp::StoreDword {
        addr: sem.go,
        value: CHILD_GO_BB,
    });
    ops.push(CsOp::BatchStart { addr: batch });
    ops
}

/// Child `idx`: join, wait for go, lock out preemption, run
pub fn child_bb_start(sem: &GroupSemaphores, idx: usize, batch: u64) -> Vec<CsOp> {
    alloc::vec![
        CsOp::StoreDword {
            addr: sem.join(idx),
            value: PARENT_GO_BB,
        },
        CsOp::SemaphoreWait {
            addr: sem.go,
            value: CHILD_GO_BB,
        },
        CsOp::ArbDisable,
        CsOp::BatchStart { addr: batch },
    ]
}

/// Parent fini: wait for children to finish, allow preemption, release
pub fn parent_fini(sem: &GroupSemaphores) -> Vec<CsOp> {
    let mut ops = Vec::with_capacity(sem.children + 2);
    for i in 0..sem.children {
        ops.push(CsOp::SemaphoreWait {
            addr: sem.join(i),
            value: PARENT_GO_FINI_BREADCRUMB,
        });
    }
    ops.push(CsOp::ArbEnable);
    ops.push(CsOp::StoreDword {
        addr: sem.go,
        value: CHILD_GO_FINI_BREADCRUMB,
    });
    ops
}

/// Child fini: report done, wait for release, allow preemption
pub fn child_fini(sem: &GroupSemaphores, idx: usize) -> Vec<CsOp> {
    alloc::vec![
        CsOp::StoreDword {
            addr: sem.join(idx),
            value: PARENT_GO_FINI_BREADCRUMB,
        },
        CsOp::SemaphoreWait {
            addr: sem.go,
            value: CHILD_GO_FINI_BREADCRUMB,
        },
        CsOp::ArbEnable,
    ]
}

/// Flatten ops into command-stream dwords
pub fn encode(ops: &[CsOp]) -> Vec<u32> {
    ops.iter().flat_map(|op| op.encode()).collect()
}
