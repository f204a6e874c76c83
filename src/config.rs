//! Engine configuration.
//!
//! Plain data with validated defaults. Ring sizes must be powers of two
//! because the kernel addresses both rings through an index mask of
//! `length - 1`.

use crate::error::{EngineError, Result};

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of submission ring entries. Must be a nonzero power of two.
    pub sq_entries: u32,
    /// Number of completion ring entries. `0` uses the kernel default
    /// (twice the submission ring). When nonzero, must be a power of two
    /// no smaller than `sq_entries`.
    pub cq_entries: u32,
    /// Maximum entries pushed before an intermediate kernel submit is
    /// issued. Batching amortizes the syscall over many operations.
    pub max_submit_batch: usize,
    /// Retry ceiling for a kernel submit that keeps reporting busy.
    /// Exceeding it under a blocking wait is a fatal engine error.
    pub max_submit_retries: u32,
    /// Whether read/write/poll/receive encodings should try the
    /// fixed-descriptor table before falling back to raw descriptors.
    pub use_registered_fds: bool,
    /// Capacity of the fixed-descriptor table registered with the kernel.
    /// Ignored unless `use_registered_fds` is set.
    pub registered_fd_slots: u32,
    /// Upper bound on retained pool slots for internally generated
    /// descriptors (readiness polls, cancellations).
    pub pool_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sq_entries: 128,
            cq_entries: 0,
            max_submit_batch: 64,
            max_submit_retries: 3,
            use_registered_fds: false,
            registered_fd_slots: 0,
            pool_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Configuration with an explicit submission ring size and defaults
    /// for everything else.
    pub fn with_capacity(sq_entries: u32) -> Self {
        Self {
            sq_entries,
            ..Self::default()
        }
    }

    /// Enable the fixed-descriptor optimization with `slots` table entries.
    pub fn registered_fds(mut self, slots: u32) -> Self {
        self.use_registered_fds = slots > 0;
        self.registered_fd_slots = slots;
        self
    }

    /// Validate the configuration before any ring setup.
    pub fn validate(&self) -> Result<()> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "submission ring size must be a nonzero power of two, got {}",
                    self.sq_entries
                ),
            });
        }
        if self.cq_entries != 0 {
            if !self.cq_entries.is_power_of_two() {
                return Err(EngineError::InvalidConfig {
                    reason: format!(
                        "completion ring size must be a power of two, got {}",
                        self.cq_entries
                    ),
                });
            }
            if self.cq_entries < self.sq_entries {
                return Err(EngineError::InvalidConfig {
                    reason: "completion ring must be at least as large as the submission ring"
                        .into(),
                });
            }
        }
        if self.max_submit_batch == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "max_submit_batch must be nonzero".into(),
            });
        }
        if self.max_submit_retries == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "max_submit_retries must be nonzero".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_sq() {
        let config = EngineConfig::with_capacity(3);
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_zero_sq() {
        let config = EngineConfig::with_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_cq_smaller_than_sq() {
        let config = EngineConfig {
            sq_entries: 128,
            cq_entries: 64,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn registered_fds_builder_enables_flag() {
        let config = EngineConfig::default().registered_fds(32);
        assert!(config.use_registered_fds);
        assert_eq!(config.registered_fd_slots, 32);
        assert!(config.validate().is_ok());

        let config = EngineConfig::default().registered_fds(0);
        assert!(!config.use_registered_fds);
    }
}
