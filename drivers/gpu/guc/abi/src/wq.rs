//! # Work-Queue Items
//!
//! Item layout for the parallel work queue. Every item starts with a header
//! dword holding the item type (bits 7:0) and the item length in dwords minus
//! one (bits 26:16).
//!
//! A `MULTI_LRC` item:
//!
//! ```text
//! dw0  header (type MULTI_LRC, len)
//! dw1  parent hardware context pointer (low dword)
//! dw2  guc id (15:0) | parent ring tail in qwords (28:18)
//! dw3  fence id (unused, 0)
//! dw4+ one ring tail in qwords per child
//! ```

use arrayvec::ArrayVec;

use crate::action::Action;
use crate::engine::MAX_ENGINE_INSTANCE;
use crate::error::{AbiError, Result};

/// Item type field
pub const WQ_TYPE_MASK: u32 = 0xff;
/// Item length field shift
pub const WQ_LEN_SHIFT: u32 = 16;
/// Item length field (dwords - 1)
pub const WQ_LEN_MASK: u32 = 0x7ff << WQ_LEN_SHIFT;

/// Padding item
pub const WQ_TYPE_NOOP: u32 = 0x4;
/// Parallel submission item
pub const WQ_TYPE_MULTI_LRC: u32 = 0x5;

/// Guc id field of dw2
pub const WQ_GUC_ID_MASK: u32 = 0xffff;
/// Ring tail field shift of dw2
pub const WQ_RING_TAIL_SHIFT: u32 = 18;
/// Largest ring tail in qwords that fits dw2
pub const WQ_RING_TAIL_MAX: u32 = 0x7ff;

/// Descriptor status: firmware is consuming the queue
pub const WQ_STATUS_ACTIVE: u32 = 1;

/// Fixed dwords ahead of the per-child tails
pub const WQ_ITEM_FIXED_DW: usize = 4;
/// Largest item in dwords
pub const WQ_ITEM_MAX_DW: usize = WQ_ITEM_FIXED_DW + MAX_ENGINE_INSTANCE;

/// An encoded work-queue item
pub type WqItem = ArrayVec<u32, WQ_ITEM_MAX_DW>;

/// Header dword for an item of `len_dw` total dwords
pub const fn header(ty: u32, len_dw: usize) -> u32 {
    (ty & WQ_TYPE_MASK) | ((((len_dw - 1) as u32) << WQ_LEN_SHIFT) & WQ_LEN_MASK)
}

/// Item type from a header dword
pub const fn header_type(hdr: u32) -> u32 {
    hdr & WQ_TYPE_MASK
}

/// Item length in dwords from a header dword
pub const fn header_len_dw(hdr: u32) -> usize {
    (((hdr & WQ_LEN_MASK) >> WQ_LEN_SHIFT) + 1) as usize
}

/// Size in bytes of a `MULTI_LRC` item for a group with `children` children
pub const fn multi_lrc_item_bytes(children: usize) -> usize {
    (WQ_ITEM_FIXED_DW + children) * 4
}

fn tail_field(tail_qw: u32) -> Result<u32> {
    if tail_qw > WQ_RING_TAIL_MAX {
        return Err(AbiError::BadValue {
            action: Action::RegisterContextMultiLrc.raw(),
            value: tail_qw,
        });
    }
    Ok(tail_qw)
}

/// Encode a `MULTI_LRC` item
pub fn multi_lrc_item(
    lrca: u64,
    guc_id: u16,
    parent_tail_qw: u32,
    child_tails_qw: &[u32],
) -> Result<WqItem> {
    if child_tails_qw.len() > MAX_ENGINE_INSTANCE {
        return Err(AbiError::BadValue {
            action: Action::RegisterContextMultiLrc.raw(),
            value: child_tails_qw.len() as u32,
        });
    }
    let total = WQ_ITEM_FIXED_DW + child_tails_qw.len();
    let mut item = WqItem::new();
    item.push(header(WQ_TYPE_MULTI_LRC, total));
    item.push(lrca as u32);
    item.push((guc_id as u32 & WQ_GUC_ID_MASK) | (tail_field(parent_tail_qw)? << WQ_RING_TAIL_SHIFT));
    item.push(0);
    for &t in child_tails_qw {
        item.push(tail_field(t)?);
    }
    Ok(item)
}

/// Header of a `NOOP` pad covering `bytes` (a multiple of 4, at least 4)
pub const fn noop_header(bytes: usize) -> u32 {
    header(WQ_TYPE_NOOP, bytes / 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_lrc_layout() {
        let item = multi_lrc_item(0xdead_b000, 9, 0x20, &[0x10, 0x30]).unwrap();
        assert_eq!(item.len(), 6);
        assert_eq!(header_type(item[0]), WQ_TYPE_MULTI_LRC);
        assert_eq!(header_len_dw(item[0]), 6);
        assert_eq!(item[1], 0xdead_b000);
        assert_eq!(item[2], 9 | (0x20 << 18));
        assert_eq!(item[3], 0);
        assert_eq!(&item[4..], &[0x10, 0x30]);
        assert_eq!(multi_lrc_item_bytes(2), 24);
    }

    #[test]
    fn test_tail_overflow() {
        assert!(multi_lrc_item(0, 1, WQ_RING_TAIL_MAX + 1, &[]).is_err());
        assert!(multi_lrc_item(0, 1, 0, &[WQ_RING_TAIL_MAX + 1]).is_err());
    }

    #[test]
    fn test_noop_header() {
        let hdr = noop_header(40);
        assert_eq!(header_type(hdr), WQ_TYPE_NOOP);
        assert_eq!(header_len_dw(hdr), 10);
    }
}
