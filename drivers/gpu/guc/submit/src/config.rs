//! # Submission Configuration
//!
//! Tunables of the submission backend. Defaults match what the firmware
//! expects on current platforms; the id-retry back-off and the delayed
//! schedule-disable are platform-tuned and therefore configurable.

use alloc::vec;
use alloc::vec::Vec;

use helix_guc_abi::klv::{RC_YIELD_DEFAULT_DURATION_MS, RC_YIELD_DEFAULT_RATIO};
use helix_guc_abi::scratch;

use crate::error::{Result, SubmitError};

/// Size of the firmware id space
pub const GUC_MAX_CONTEXT_ID: u32 = 65535;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Submission backend configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionConfig {
    /// Total GuC ids
    pub num_guc_ids: u32,
    /// The first `num_guc_ids >> multi_lrc_shift` ids are reserved for
    /// parallel contexts
    pub multi_lrc_shift: u32,
    /// Delay before an unpinned context has scheduling disabled
    pub sched_disable_delay_ms: u64,
    /// Used single ids above which unpin disables immediately;
    /// `None` means three quarters of the single pool
    pub sched_disable_gucid_threshold: Option<u32>,
    /// Sleep before each id-allocation retry; its length bounds the retries
    pub id_retry_backoff_ms: Vec<u64>,
    /// Default execution quantum (µs)
    pub exec_quantum_us: u32,
    /// Default preemption timeout (µs)
    pub preempt_timeout_us: u32,
    /// Preempt to idle on quantum expiry
    pub preempt_to_idle: bool,
    /// Global render/compute yield (duration ms, ratio %)
    pub render_compute_yield: Option<(u32, u32)>,
    /// Parallel work-queue ring size in bytes
    pub wq_size: u32,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            num_guc_ids: GUC_MAX_CONTEXT_ID,
            multi_lrc_shift: 4,
            sched_disable_delay_ms: 34,
            sched_disable_gucid_threshold: None,
            id_retry_backoff_ms: vec![0, 10, 20],
            exec_quantum_us: 1000,
            preempt_timeout_us: 640_000,
            preempt_to_idle: false,
            render_compute_yield: Some((RC_YIELD_DEFAULT_DURATION_MS, RC_YIELD_DEFAULT_RATIO)),
            wq_size: scratch::WQ_SIZE as u32,
        }
    }
}

impl SubmissionConfig {
    /// Ids reserved for parallel contexts
    pub fn multi_lrc_ids(&self) -> u32 {
        self.num_guc_ids >> self.multi_lrc_shift
    }

    /// Ids in the single-context pool
    pub fn single_ids(&self) -> u32 {
        self.num_guc_ids - self.multi_lrc_ids()
    }

    /// Used single ids above which unpin disables scheduling immediately
    pub fn sched_disable_threshold(&self) -> u32 {
        self.sched_disable_gucid_threshold
            .unwrap_or(self.single_ids() / 4 * 3)
    }

    /// Total allocation attempts a pin makes
    pub fn id_attempts(&self) -> usize {
        self.id_retry_backoff_ms.len() + 1
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if self.num_guc_ids == 0 || self.num_guc_ids > GUC_MAX_CONTEXT_ID {
            return Err(SubmitError::InvalidParameter);
        }
        if self.multi_lrc_shift >= 16 || self.single_ids() == 0 {
            return Err(SubmitError::InvalidParameter);
        }
        let wq = self.wq_size as usize;
        if !wq.is_power_of_two() || wq > scratch::WQ_SIZE || wq < 64 {
            return Err(SubmitError::InvalidParameter);
        }
        Ok(())
    }

    /// Start a builder
    pub fn builder() -> SubmissionConfigBuilder {
        SubmissionConfigBuilder::new()
    }
}

// =============================================================================
// CONFIGURATION BUILDER
// =============================================================================

/// Builder for SubmissionConfig
#[derive(Debug, Clone, Default)]
pub struct SubmissionConfigBuilder {
    config: SubmissionConfig,
}

impl SubmissionConfigBuilder {
    /// Create new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the id space size
    pub fn num_guc_ids(mut self, n: u32) -> Self {
        self.config.num_guc_ids = n;
        self
    }

    /// Set the multi-context reservation shift
    pub fn multi_lrc_shift(mut self, shift: u32) -> Self {
        self.config.multi_lrc_shift = shift;
        self
    }

    /// Set the delayed schedule-disable
    pub fn sched_disable_delay_ms(mut self, ms: u64) -> Self {
        self.config.sched_disable_delay_ms = ms;
        self
    }

    /// Set the id-pressure threshold
    pub fn sched_disable_gucid_threshold(mut self, ids: u32) -> Self {
        self.config.sched_disable_gucid_threshold = Some(ids);
        self
    }

    /// Set the id-retry back-off schedule
    pub fn id_retry_backoff_ms(mut self, delays: Vec<u64>) -> Self {
        self.config.id_retry_backoff_ms = delays;
        self
    }

    /// Set the default execution quantum
    pub fn exec_quantum_us(mut self, us: u32) -> Self {
        self.config.exec_quantum_us = us;
        self
    }

    /// Set the default preemption timeout
    pub fn preempt_timeout_us(mut self, us: u32) -> Self {
        self.config.preempt_timeout_us = us;
        self
    }

    /// Set preempt-to-idle
    pub fn preempt_to_idle(mut self, on: bool) -> Self {
        self.config.preempt_to_idle = on;
        self
    }

    /// Set the global render/compute yield
    pub fn render_compute_yield(mut self, yield_: Option<(u32, u32)>) -> Self {
        self.config.render_compute_yield = yield_;
        self
    }

    /// Set the parallel work-queue size
    pub fn wq_size(mut self, bytes: u32) -> Self {
        self.config.wq_size = bytes;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<SubmissionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SubmissionConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.multi_lrc_ids(), 4095);
        assert_eq!(cfg.single_ids(), 65535 - 4095);
        assert_eq!(cfg.id_attempts(), 4);
        assert_eq!(cfg.sched_disable_threshold(), (65535 - 4095) / 4 * 3);
    }

    #[test]
    fn test_builder() {
        let cfg = SubmissionConfig::builder()
            .num_guc_ids(64)
            .wq_size(128)
            .sched_disable_gucid_threshold(10)
            .build()
            .unwrap();
        assert_eq!(cfg.multi_lrc_ids(), 4);
        assert_eq!(cfg.single_ids(), 60);
        assert_eq!(cfg.sched_disable_threshold(), 10);
    }

    #[test]
    fn test_invalid() {
        assert!(SubmissionConfig::builder().num_guc_ids(0).build().is_err());
        assert!(SubmissionConfig::builder().wq_size(100).build().is_err());
        assert!(SubmissionConfig::builder().wq_size(8192).build().is_err());
        assert!(SubmissionConfig::builder().multi_lrc_shift(16).build().is_err());
    }
}
