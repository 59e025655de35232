//! # GuC Command Submission
//!
//! Client-side scheduler that hands GPU work to the GuC firmware scheduler
//! and keeps host and firmware views of every context consistent across an
//! asynchronous message protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                         GucSubmission                              │
//! │                                                                    │
//! │  submit_request ──▶ ┌──────────────┐   dispatch()                  │
//! │                     │ PriorityQueue │──────────┐                   │
//! │                     └──────────────┘           ▼                   │
//! │  ┌──────────┐   ┌──────────────┐   ┌──────────────────────────┐   │
//! │  │ IdTable  │◀──│ registration │◀──│ Register → MoveTail →    │   │
//! │  │ (ids,LRU)│   └──────────────┘   │ AddRequest (stashed on   │   │
//! │  └──────────┘                      │ busy)                    │   │
//! │        ▲                           └────────────┬─────────────┘   │
//! │        │        ┌──────────────┐                │  H2G            │
//! │  process_g2h ◀──│ GucCt        │◀───────────────┘                  │
//! │                 └──────────────┘                                   │
//! │  reset_prepare / reset / reset_finish: scrub, unwind, resume       │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lock Order
//!
//! 1. dispatch lock (`DispatchState`)
//! 2. id-table lock (`IdTable`)
//! 3. per-context lock (`ContextInner`)
//!
//! The context arena, timer queue and destroyed list are leaf locks.

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod fence;
pub mod g2h;
pub mod id;
pub mod registration;
pub mod rendezvous;
pub mod request;
pub mod reset;
pub mod state;
pub mod submission;
pub mod telemetry;
pub mod timer;
pub mod transport;
pub mod types;
pub mod wakeref;
pub mod wq;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports
pub use config::{SubmissionConfig, SubmissionConfigBuilder};
pub use context::{ContextDesc, ContextPolicy, ContextSnapshot, ParallelDesc};
pub use dispatch::{DispatchOutcome, Stage};
pub use error::{ProtocolError, Result, SubmitError};
pub use fence::{Fence, FenceError, FenceStatus};
pub use request::Request;
pub use reset::ResetPhase;
pub use state::{ContextState, SchedFlags, StateError, Transition};
pub use submission::{GucSubmission, ResetReason, StatsSnapshot, SubmissionHost};
pub use telemetry::{BusynessTracker, LifecycleEvent, LifecycleObserver};
pub use transport::{CommandTransport, TransportError};
pub use types::{ContextId, EngineMask, GucId, IdPartition};
