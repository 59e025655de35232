//! # Command Transport
//!
//! The host↔GuC command channel is an external collaborator. The backend
//! sees it through [`CommandTransport`] and wraps it in [`GucCt`], which adds
//! the stop/start gate used during resets and the outstanding-acknowledgement
//! counter.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

/// Why a send did not go out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Out of space, retry later
    Busy,
    /// Channel is permanently closed, device needs reset
    Closed,
    /// Channel is stopped for a firmware reset, the message is dropped
    Stopped,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "busy"),
            Self::Closed => write!(f, "closed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Host-to-GuC message channel
pub trait CommandTransport: Send + Sync {
    /// Send without blocking; `g2h_len` is the length of the expected reply,
    /// 0 if none
    fn send_nb(&self, action: &[u32], g2h_len: u32) -> Result<(), TransportError>;

    /// Send and wait for the firmware to consume the message
    ///
    /// Only used outside the dispatch path (init, reset finish).
    fn send_blocking(&self, action: &[u32]) -> Result<(), TransportError>;
}

// =============================================================================
// CT WRAPPER
// =============================================================================

/// Transport wrapper tracking replies still owed by the firmware
#[derive(Debug)]
pub struct GucCt<T> {
    inner: T,
    enabled: AtomicBool,
    outstanding: AtomicI32,
    sent: AtomicU64,
}

impl<T: CommandTransport> GucCt<T> {
    /// Wrap a transport, initially enabled
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            enabled: AtomicBool::new(true),
            outstanding: AtomicI32::new(0),
            sent: AtomicU64::new(0),
        }
    }

    /// The wrapped transport
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Send a message, counting it as outstanding if it expects a reply
    pub fn send(&self, action: &[u32], g2h_len: u32) -> Result<(), TransportError> {
        if !self.enabled.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        if g2h_len > 0 {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
        }
        match self.inner.send_nb(action, g2h_len) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if g2h_len > 0 {
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                }
                Err(e)
            }
        }
    }

    /// Blocking send, never expects a reply
    pub fn send_blocking(&self, action: &[u32]) -> Result<(), TransportError> {
        if !self.enabled.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        self.inner.send_blocking(action)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// A reply arrived, or was resolved by scrubbing
    pub fn ack(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            log::warn!("guc: ack with no outstanding request ({})", prev);
            self.outstanding.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Replies still owed
    pub fn outstanding(&self) -> i32 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Forget every owed reply, returning how many were dropped
    pub fn clear_outstanding(&self) -> i32 {
        self.outstanding.swap(0, Ordering::AcqRel)
    }

    /// Messages sent since creation
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Stop accepting outgoing messages
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Accept outgoing messages again
    pub fn start(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Whether outgoing messages are accepted
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}
