//! # Parallel Work Queue
//!
//! Host side of the per-parent work-queue ring. The firmware owns `head`,
//! the host owns `tail`; both live in the parent scratch page next to the
//! rendezvous semaphores.
//!
//! An append either writes a whole item or nothing. When an item would run
//! past the end of the ring, the remainder is filled with a `NOOP` pad and
//! the item starts at offset 0. One dword is always kept free so a full
//! ring is distinguishable from an empty one.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use helix_guc_abi::scratch::{
    self, join_semaphore_offset, GO_SEMAPHORE_OFFSET, MAX_JOIN_SLOTS, WQ_DESC_HEAD_OFFSET,
};
use helix_guc_abi::wq::{self as abi_wq, WQ_STATUS_ACTIVE};

// =============================================================================
// SHARED PAGE
// =============================================================================

/// Parent scratch page shared with the firmware
#[derive(Debug)]
pub struct ParentScratch {
    /// GGTT address of the page
    addr: u64,
    /// Firmware-owned consumer offset (bytes)
    head: AtomicU32,
    /// Host-owned producer offset (bytes)
    tail: AtomicU32,
    /// Queue status written by firmware
    status: AtomicU32,
    /// Go semaphore
    go: AtomicU32,
    /// Join semaphores, one per child
    join: [AtomicU32; MAX_JOIN_SLOTS],
    /// Ring storage, one entry per dword
    ring: Box<[AtomicU32]>,
}

impl ParentScratch {
    /// Page at `addr` with a ring of `wq_size` bytes
    pub fn new(addr: u64, wq_size: u32) -> Self {
        let ring: Vec<AtomicU32> = (0..wq_size / 4).map(|_| AtomicU32::new(0)).collect();
        Self {
            addr,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            status: AtomicU32::new(WQ_STATUS_ACTIVE),
            go: AtomicU32::new(0),
            join: core::array::from_fn(|_| AtomicU32::new(0)),
            ring: ring.into_boxed_slice(),
        }
    }

    /// Ring size in bytes
    pub fn wq_size(&self) -> u32 {
        (self.ring.len() * 4) as u32
    }

    /// Page address
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Work-queue descriptor address
    pub fn wq_desc_addr(&self) -> u64 {
        self.addr + WQ_DESC_HEAD_OFFSET as u64
    }

    /// Work-queue ring address
    pub fn wq_base_addr(&self) -> u64 {
        self.addr + scratch::WQ_OFFSET as u64
    }

    /// Go semaphore address
    pub fn go_addr(&self) -> u64 {
        self.addr + GO_SEMAPHORE_OFFSET as u64
    }

    /// Join semaphore address of child `idx`
    pub fn join_addr(&self, idx: usize) -> u64 {
        self.addr + join_semaphore_offset(idx) as u64
    }

    /// Descriptor status
    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    /// Published tail
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    /// Consumer head
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    /// Reinitialise the descriptor and semaphores before registration
    pub fn reset(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.go.store(0, Ordering::Relaxed);
        for j in &self.join {
            j.store(0, Ordering::Relaxed);
        }
        self.status.store(WQ_STATUS_ACTIVE, Ordering::Release);
    }

    fn write_dw(&self, offset: u32, value: u32) {
        let idx = (offset / 4) as usize % self.ring.len();
        self.ring[idx].store(value, Ordering::Relaxed);
    }

    /// Read a ring dword
    pub fn read_dw(&self, offset: u32) -> u32 {
        let idx = (offset / 4) as usize % self.ring.len();
        self.ring[idx].load(Ordering::Relaxed)
    }

    /// Firmware side: advance head
    pub fn set_head(&self, head: u32) {
        self.head.store(head, Ordering::Release);
    }

    /// Firmware side: report a queue error
    pub fn set_status(&self, status: u32) {
        self.status.store(status, Ordering::Release);
    }

    /// Firmware side: consume every published item, skipping pads
    #[cfg(any(test, feature = "testing"))]
    pub fn consume(&self) -> Vec<Vec<u32>> {
        let size = self.wq_size();
        let tail = self.tail.load(Ordering::Acquire);
        let mut head = self.head.load(Ordering::Relaxed);
        let mut items = Vec::new();
        while head != tail {
            let hdr = self.read_dw(head);
            let len = abi_wq::header_len_dw(hdr) as u32;
            if abi_wq::header_type(hdr) != abi_wq::WQ_TYPE_NOOP {
                items.push((0..len).map(|i| self.read_dw(head + i * 4)).collect());
            }
            head = (head + len * 4) & (size - 1);
        }
        self.head.store(head, Ordering::Release);
        items
    }
}

// =============================================================================
// PRODUCER
// =============================================================================

/// Why an append did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqError {
    /// Not enough space, nothing written
    Busy,
    /// Descriptor reports an error status
    Status(u32),
    /// Item larger than the ring can ever hold
    TooLarge,
}

/// Host-side producer state, kept under the parent's lock
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    tail: u32,
    head_cache: u32,
    appended: u64,
    pads: u64,
}

/// Free bytes between producer `tail` and consumer `head`
pub const fn circ_space(tail: u32, head: u32, size: u32) -> u32 {
    head.wrapping_sub(tail).wrapping_sub(4) & (size - 1)
}

/// Bytes pending between consumer `head` and producer `tail`
pub const fn circ_count(tail: u32, head: u32, size: u32) -> u32 {
    tail.wrapping_sub(head) & (size - 1)
}

impl WorkQueue {
    /// Empty producer
    pub const fn new() -> Self {
        Self {
            tail: 0,
            head_cache: 0,
            appended: 0,
            pads: 0,
        }
    }

    /// Producer offset
    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Items appended since the last reset
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Pads inserted since the last reset
    pub fn pads(&self) -> u64 {
        self.pads
    }

    /// Forget everything, paired with [`ParentScratch::reset`]
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Append one item, padding to the ring start if it would wrap
    pub fn append(&mut self, page: &ParentScratch, item: &[u32]) -> Result<(), WqError> {
        let size = page.wq_size();
        let bytes = (item.len() * 4) as u32;
        if bytes == 0 || bytes > size - 4 {
            return Err(WqError::TooLarge);
        }

        let until_wrap = size - self.tail;
        let needed = if until_wrap < bytes {
            bytes + until_wrap
        } else {
            bytes
        };

        if circ_space(self.tail, self.head_cache, size) < needed {
            self.head_cache = page.head.load(Ordering::Acquire);
            if circ_space(self.tail, self.head_cache, size) < needed {
                return Err(WqError::Busy);
            }
        }

        let status = page.status();
        if status != WQ_STATUS_ACTIVE {
            return Err(WqError::Status(status));
        }

        if until_wrap < bytes {
            page.write_dw(self.tail, abi_wq::noop_header(until_wrap as usize));
            for off in (4..until_wrap).step_by(4) {
                page.write_dw(self.tail + off, 0);
            }
            self.tail = 0;
            self.pads += 1;
        }

        fence(Ordering::Release);
        for (i, &dw) in item.iter().enumerate() {
            page.write_dw(self.tail + (i as u32) * 4, dw);
        }
        fence(Ordering::Release);

        self.tail = (self.tail + bytes) & (size - 1);
        page.tail.store(self.tail, Ordering::Release);
        self.appended += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_guc_abi::wq::multi_lrc_item;

    fn item(children: usize, tag: u32) -> Vec<u32> {
        let tails: Vec<u32> = (0..children as u32).map(|c| c + tag).collect();
        multi_lrc_item(0x1000, tag as u16, tag, &tails).unwrap().to_vec()
    }

    #[test]
    fn test_circ_helpers() {
        assert_eq!(circ_space(0, 0, 128), 124);
        assert_eq!(circ_count(32, 0, 128), 32);
        assert_eq!(circ_space(120, 0, 128), 4);
    }

    #[test]
    fn test_fill_then_pad() {
        let page = ParentScratch::new(0x10_0000, 128);
        let mut wq = WorkQueue::new();

        // 24-byte items: five fit before the wrap point
        let mut last_tail = 0;
        for k in 0..5 {
            wq.append(&page, &item(2, k)).unwrap();
            assert!(wq.tail() > last_tail);
            last_tail = wq.tail();
            assert!(circ_count(page.tail(), page.head(), 128) <= 124);
        }
        assert_eq!(wq.tail(), 120);
        assert_eq!(wq.append(&page, &item(2, 9)), Err(WqError::Busy));
        assert_eq!(page.tail(), 120);

        // firmware consumes everything, no data lost
        let got = page.consume();
        assert_eq!(got.len(), 5);
        for (k, it) in got.iter().enumerate() {
            assert_eq!(it, &item(2, k as u32));
        }

        // next item wraps: pad at 120, item at 0
        wq.append(&page, &item(2, 9)).unwrap();
        assert_eq!(wq.pads(), 1);
        assert_eq!(abi_wq::header_type(page.read_dw(120)), abi_wq::WQ_TYPE_NOOP);
        assert_eq!(abi_wq::header_len_dw(page.read_dw(120)), 2);
        assert_eq!(page.read_dw(0), item(2, 9)[0]);
        assert_eq!(wq.tail(), 24);
        assert_eq!(page.consume(), vec![item(2, 9)]);
    }

    #[test]
    fn test_exact_fill_with_consumer() {
        let page = ParentScratch::new(0, 128);
        let mut wq = WorkQueue::new();
        // 32-byte items exactly tile the ring
        for k in 0..4 {
            wq.append(&page, &item(4, k)).unwrap();
            assert_eq!(page.consume().len(), 1);
        }
        assert_eq!(wq.tail(), 0);
        assert_eq!(wq.pads(), 0);
        assert_eq!(wq.appended(), 4);
    }

    #[test]
    fn test_busy_writes_nothing() {
        let page = ParentScratch::new(0, 64);
        let mut wq = WorkQueue::new();
        wq.append(&page, &item(4, 1)).unwrap();
        let before: Vec<u32> = (0..16).map(|i| page.read_dw(i * 4)).collect();
        assert_eq!(wq.append(&page, &item(4, 2)), Err(WqError::Busy));
        let after: Vec<u32> = (0..16).map(|i| page.read_dw(i * 4)).collect();
        assert_eq!(before, after);
        assert_eq!(wq.tail(), 32);
    }

    #[test]
    fn test_error_status() {
        let page = ParentScratch::new(0, 128);
        let mut wq = WorkQueue::new();
        page.set_status(0x3);
        assert_eq!(wq.append(&page, &item(1, 0)), Err(WqError::Status(3)));
        page.reset();
        assert!(wq.append(&page, &item(1, 0)).is_ok());
    }

    #[test]
    fn test_addresses() {
        let page = ParentScratch::new(0x20_0000, 2048);
        assert_eq!(page.wq_base_addr(), 0x20_0800);
        assert_eq!(page.go_addr(), 0x20_0040);
        assert_eq!(page.join_addr(1), 0x20_00c0);
    }
}
