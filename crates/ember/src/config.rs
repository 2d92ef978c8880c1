//! Device configuration

use core::time::Duration;

use ember_mem::RegistryConfig;

/// Device configuration
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// AIE columns in the array
    pub columns: u32,
    /// Partition width granularity in columns
    pub min_partition_width: u32,
    /// Outstanding submissions per context
    pub max_pending: usize,
    /// CUs a context may configure per column it holds
    pub max_cus_per_column: usize,
    /// Let contexts share a partition when no free range is left
    pub time_share: bool,
    /// Live hardware contexts
    pub max_contexts: usize,
    /// Bytes between context doorbells
    pub doorbell_stride: u64,
    /// Drain bound for contexts without their own timeout
    pub default_op_timeout: Option<Duration>,
    /// Buffer object registry
    pub registry: RegistryConfig,
    /// Force preemption enabled at start
    pub force_preempt: bool,
    /// Frame-boundary preemption enabled at start
    pub frame_boundary_preempt: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            columns: 8,
            min_partition_width: 1,
            max_pending: 64,
            max_cus_per_column: 4,
            time_share: false,
            max_contexts: 64,
            doorbell_stride: 0x1000,
            default_op_timeout: None,
            registry: RegistryConfig::default(),
            force_preempt: false,
            frame_boundary_preempt: false,
        }
    }
}

impl DeviceConfig {
    /// Set the column count
    pub const fn with_columns(mut self, columns: u32) -> Self {
        self.columns = columns;
        self
    }

    /// Set the partition width granularity
    pub const fn with_min_partition_width(mut self, width: u32) -> Self {
        self.min_partition_width = width;
        self
    }

    /// Set the per-context queue depth
    pub const fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Enable or disable partition time sharing
    pub const fn with_time_share(mut self, enabled: bool) -> Self {
        self.time_share = enabled;
        self
    }

    /// Set the context limit
    pub const fn with_max_contexts(mut self, max: usize) -> Self {
        self.max_contexts = max;
        self
    }

    /// Set the drain bound used when a context has no timeout of its own
    pub const fn with_default_op_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_op_timeout = timeout;
        self
    }

    /// Set the initial preemption policies
    pub const fn with_preemption(mut self, force: bool, frame_boundary: bool) -> Self {
        self.force_preempt = force;
        self.frame_boundary_preempt = frame_boundary;
        self
    }
}
