//! # Key-Length-Value Encoding
//!
//! Policy messages carry a list of KLVs. Each KLV is a header dword holding
//! the key in bits 31:16 and the value length (in dwords) in bits 15:0,
//! followed by the value dwords.

use arrayvec::ArrayVec;

// =============================================================================
// KEYS
// =============================================================================

/// Global: render/compute yield (duration ms, ratio %)
pub const KEY_RENDER_COMPUTE_YIELD: u16 = 0x1001;
/// Context: execution quantum in microseconds
pub const KEY_EXECUTION_QUANTUM: u16 = 0x2001;
/// Context: preemption timeout in microseconds
pub const KEY_PREEMPTION_TIMEOUT: u16 = 0x2002;
/// Context: GuC scheduling priority
pub const KEY_SCHEDULING_PRIORITY: u16 = 0x2003;
/// Context: preempt to idle on quantum expiry
pub const KEY_PREEMPT_TO_IDLE: u16 = 0x2004;

/// Default render/compute yield duration
pub const RC_YIELD_DEFAULT_DURATION_MS: u32 = 100;
/// Default render/compute yield ratio
pub const RC_YIELD_DEFAULT_RATIO: u32 = 50;

const KEY_SHIFT: u32 = 16;
const LEN_MASK: u32 = 0xffff;

/// Largest value any defined key carries
pub const MAX_KLV_VALUE_LEN: usize = 2;

// =============================================================================
// KLV
// =============================================================================

/// A single key-length-value entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Klv {
    /// Key
    pub key: u16,
    /// Value dwords
    pub value: ArrayVec<u32, MAX_KLV_VALUE_LEN>,
}

impl Klv {
    /// Single-dword KLV
    pub fn single(key: u16, value: u32) -> Self {
        let mut v = ArrayVec::new();
        v.push(value);
        Self { key, value: v }
    }

    /// Two-dword KLV
    pub fn pair(key: u16, a: u32, b: u32) -> Self {
        let mut v = ArrayVec::new();
        v.push(a);
        v.push(b);
        Self { key, value: v }
    }

    /// Header dword
    pub fn header(&self) -> u32 {
        ((self.key as u32) << KEY_SHIFT) | (self.value.len() as u32 & LEN_MASK)
    }

    /// Encoded length in dwords
    pub fn encoded_len(&self) -> usize {
        1 + self.value.len()
    }

    /// Append the encoded KLV to `out`, returns false if it does not fit
    pub fn encode_into<const N: usize>(&self, out: &mut ArrayVec<u32, N>) -> bool {
        if out.remaining_capacity() < self.encoded_len() {
            return false;
        }
        out.push(self.header());
        for &v in &self.value {
            out.push(v);
        }
        true
    }

    /// Decode one KLV from the front of `words`, returning it and the rest
    pub fn decode(words: &[u32]) -> Option<(Self, &[u32])> {
        let (&hdr, rest) = words.split_first()?;
        let key = (hdr >> KEY_SHIFT) as u16;
        let len = (hdr & LEN_MASK) as usize;
        if len > MAX_KLV_VALUE_LEN || rest.len() < len {
            return None;
        }
        let mut value = ArrayVec::new();
        value.try_extend_from_slice(&rest[..len]).ok()?;
        Some((Self { key, value }, &rest[len..]))
    }
}

// =============================================================================
// CONTEXT POLICY SET
// =============================================================================

/// Per-context policy values sent with `UPDATE_CONTEXT_POLICIES`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyKlvs {
    /// Execution quantum (µs)
    pub execution_quantum_us: u32,
    /// Preemption timeout (µs)
    pub preemption_timeout_us: u32,
    /// GuC priority level
    pub priority: u32,
    /// Preempt to idle
    pub preempt_to_idle: bool,
}

/// Encoded dwords of a full context policy set
pub const POLICY_KLV_LEN: usize = 8;

impl PolicyKlvs {
    /// Encode as a KLV list in the order the firmware documents
    pub fn encode(&self) -> ArrayVec<u32, POLICY_KLV_LEN> {
        let mut out = ArrayVec::new();
        for klv in [
            Klv::single(KEY_EXECUTION_QUANTUM, self.execution_quantum_us),
            Klv::single(KEY_PREEMPTION_TIMEOUT, self.preemption_timeout_us),
            Klv::single(KEY_SCHEDULING_PRIORITY, self.priority),
            Klv::single(KEY_PREEMPT_TO_IDLE, self.preempt_to_idle as u32),
        ] {
            klv.encode_into(&mut out);
        }
        out
    }
}
