//! # H2G / G2H Messages
//!
//! Builders for every host-to-GuC message the submission backend sends and a
//! decoder for the GuC-to-host notifications it consumes. H2G messages are
//! dword arrays with the action opcode first.

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::action::{Action, MODE_DISABLE, MODE_ENABLE};
use crate::engine::{EngineClass, MAX_ENGINE_INSTANCE};
use crate::error::{AbiError, Result};
use crate::klv::{Klv, PolicyKlvs, KEY_RENDER_COMPUTE_YIELD};

/// Largest H2G message in dwords
pub const MAX_H2G_LEN: usize = 32;

/// Encoded H2G message
pub type H2gMessage = ArrayVec<u32, MAX_H2G_LEN>;

/// Contexts in the largest parallel group (parent included)
pub const MAX_GROUP_WIDTH: usize = MAX_ENGINE_INSTANCE + 1;

bitflags! {
    /// Flags carried in registration messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegisterFlags: u32 {
        /// Context belongs to the kernel driver
        const KMD = 1 << 0;
    }
}

// =============================================================================
// REGISTRATION
// =============================================================================

/// Everything needed to register a context (or parallel group) with the GuC
#[derive(Debug, Clone)]
pub struct RegisterDesc<'a> {
    /// GuC id (the parent's id for a group)
    pub guc_id: u16,
    /// Registration flags
    pub flags: RegisterFlags,
    /// Engine class
    pub class: EngineClass,
    /// Logical mask of engines the context may run on
    pub submit_mask: u32,
    /// GPU address of the work-queue descriptor (0 for single contexts)
    pub wq_desc_addr: u64,
    /// GPU address of the work-queue ring (0 for single contexts)
    pub wq_base_addr: u64,
    /// Size of the work-queue ring in bytes (0 for single contexts)
    pub wq_size: u32,
    /// Hardware context pointers, parent first then children in order
    pub lrcas: &'a [u64],
}

#[inline]
fn lo(v: u64) -> u32 {
    v as u32
}

#[inline]
fn hi(v: u64) -> u32 {
    (v >> 32) as u32
}

/// Build `REGISTER_CONTEXT` or, for groups, `REGISTER_CONTEXT_MULTI_LRC`
pub fn register_context(desc: &RegisterDesc<'_>) -> Result<H2gMessage> {
    let count = desc.lrcas.len();
    if count == 0 || count > MAX_GROUP_WIDTH {
        return Err(AbiError::BadValue {
            action: Action::RegisterContextMultiLrc.raw(),
            value: count as u32,
        });
    }
    let multi = count > 1;
    let action = if multi {
        Action::RegisterContextMultiLrc
    } else {
        Action::RegisterContext
    };

    let mut msg = H2gMessage::new();
    msg.push(action.raw());
    msg.push(desc.guc_id as u32);
    msg.push(desc.flags.bits());
    msg.push(desc.class.raw());
    msg.push(desc.submit_mask);
    msg.push(lo(desc.wq_desc_addr));
    msg.push(hi(desc.wq_desc_addr));
    msg.push(lo(desc.wq_base_addr));
    msg.push(hi(desc.wq_base_addr));
    msg.push(desc.wq_size);
    if multi {
        msg.push(count as u32);
    }
    for &lrca in desc.lrcas {
        msg.push(lo(lrca));
        msg.push(hi(lrca));
    }
    Ok(msg)
}

// =============================================================================
// SCHEDULING
// =============================================================================

/// Build `SCHED_CONTEXT_MODE_SET`
pub fn sched_context_mode_set(guc_id: u16, enable: bool) -> H2gMessage {
    let mut msg = H2gMessage::new();
    msg.push(Action::SchedContextModeSet.raw());
    msg.push(guc_id as u32);
    msg.push(if enable { MODE_ENABLE } else { MODE_DISABLE });
    msg
}

/// Build `SCHED_CONTEXT`
pub fn sched_context(guc_id: u16) -> H2gMessage {
    let mut msg = H2gMessage::new();
    msg.push(Action::SchedContext.raw());
    msg.push(guc_id as u32);
    msg
}

/// Build `DEREGISTER_CONTEXT`
pub fn deregister_context(guc_id: u16) -> H2gMessage {
    let mut msg = H2gMessage::new();
    msg.push(Action::DeregisterContext.raw());
    msg.push(guc_id as u32);
    msg
}

/// Build `UPDATE_CONTEXT_POLICIES`
pub fn update_context_policies(guc_id: u16, policy: &PolicyKlvs) -> H2gMessage {
    let mut msg = H2gMessage::new();
    msg.push(Action::UpdateContextPolicies.raw());
    msg.push(guc_id as u32);
    for w in policy.encode() {
        msg.push(w);
    }
    msg
}

/// Build `GLOBAL_SCHED_POLICY_CHANGE`; `None` clears the render/compute yield
pub fn global_sched_policy_change(render_compute_yield: Option<(u32, u32)>) -> H2gMessage {
    let mut msg = H2gMessage::new();
    msg.push(Action::GlobalSchedPolicyChange.raw());
    let (duration, ratio) = render_compute_yield.unwrap_or((0, 0));
    Klv::pair(KEY_RENDER_COMPUTE_YIELD, duration, ratio).encode_into(&mut msg);
    msg
}

// =============================================================================
// G2H DECODING
// =============================================================================

/// A decoded GuC-to-host notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G2hMessage {
    /// Reply to `SCHED_CONTEXT_MODE_SET`
    SchedDone {
        /// Context id
        guc_id: u16,
        /// `true` if the context is now enabled
        enabled: bool,
    },
    /// Reply to `DEREGISTER_CONTEXT`
    DeregisterDone {
        /// Context id
        guc_id: u16,
    },
    /// Firmware reset a hung context
    ContextReset {
        /// Context id
        guc_id: u16,
    },
    /// Firmware failed to reset an engine
    EngineFailure {
        /// Engine class
        class: u32,
        /// Engine instance
        instance: u32,
        /// Firmware reason code
        reason: u32,
    },
    /// Engine state was captured
    ErrorCapture {
        /// Capture status word
        status: u32,
    },
}

fn need(action: Action, words: &[u32], len: usize) -> Result<()> {
    if words.len() < len {
        Err(AbiError::Truncated {
            action: action.raw(),
            len: words.len(),
        })
    } else {
        Ok(())
    }
}

fn id_word(action: Action, raw: u32) -> Result<u16> {
    u16::try_from(raw).map_err(|_| AbiError::BadValue {
        action: action.raw(),
        value: raw,
    })
}

impl G2hMessage {
    /// Decode a G2H message, action word first
    pub fn parse(words: &[u32]) -> Result<Self> {
        let &first = words.first().ok_or(AbiError::Empty)?;
        let action = Action::from_raw(first)?;
        match action {
            Action::SchedContextModeDone => {
                need(action, words, 3)?;
                let enabled = match words[2] {
                    MODE_ENABLE => true,
                    MODE_DISABLE => false,
                    value => {
                        return Err(AbiError::BadValue {
                            action: first,
                            value,
                        })
                    }
                };
                Ok(Self::SchedDone {
                    guc_id: id_word(action, words[1])?,
                    enabled,
                })
            }
            Action::DeregisterContextDone => {
                need(action, words, 2)?;
                Ok(Self::DeregisterDone {
                    guc_id: id_word(action, words[1])?,
                })
            }
            Action::ContextResetNotification => {
                need(action, words, 2)?;
                Ok(Self::ContextReset {
                    guc_id: id_word(action, words[1])?,
                })
            }
            Action::EngineFailureNotification => {
                need(action, words, 4)?;
                Ok(Self::EngineFailure {
                    class: words[1],
                    instance: words[2],
                    reason: words[3],
                })
            }
            Action::StateCaptureNotification => {
                need(action, words, 2)?;
                Ok(Self::ErrorCapture { status: words[1] })
            }
            _ => Err(AbiError::UnknownAction(first)),
        }
    }
}
