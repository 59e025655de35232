//! # GuC Firmware Interface
//!
//! Wire formats shared between the host driver and the GuC scheduling
//! firmware.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Host ⇄ GuC ABI                           │
//! │                                                                  │
//! │  ┌────────────┐   ┌────────────┐   ┌────────────────────────┐   │
//! │  │  action    │   │  message   │   │   klv                  │   │
//! │  │ (opcodes)  │──▶│ (H2G/G2H)  │◀──│ (policy key/len/value) │   │
//! │  └────────────┘   └────────────┘   └────────────────────────┘   │
//! │                                                                  │
//! │  ┌────────────┐   ┌────────────┐   ┌────────────────────────┐   │
//! │  │  scratch   │──▶│    wq      │   │   cs                   │   │
//! │  │ (page map) │   │ (items)    │   │ (rendezvous commands)  │   │
//! │  └────────────┘   └────────────┘   └────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything in this crate is plain data: no locking, no allocation.

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod cs;
pub mod engine;
pub mod error;
pub mod klv;
pub mod message;
pub mod scratch;
pub mod wq;

// Re-exports
pub use action::Action;
pub use engine::{EngineClass, GucPriority};
pub use error::{AbiError, Result};
pub use klv::{Klv, PolicyKlvs};
pub use message::{G2hMessage, H2gMessage, RegisterFlags, MAX_H2G_LEN};
