//! Boot-time configuration of the scheduling core.

use crate::errors::ConfigError;
use crate::sched::priority;

/// Upper bound on logical CPUs.
pub const MAX_CPUS: usize = 64;

/// Smallest stack a thread may be created with.
pub const MIN_STACK_SIZE: usize = 4096;

/// Scheduling policy instantiated by [`Kernel::new`](crate::kernel::Kernel::new).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Per-CPU FIFO ready queues with work stealing.
    #[default]
    RoundRobin,
    /// Multi-level priority queues with aging.
    Priority,
}

/// How an RCU writer waits for readers to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RcuWaitPolicy {
    /// Give up the CPU between polls when called from a schedulable thread.
    #[default]
    Yield,
    /// Spin between polls.
    Spin,
}

/// Kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of logical CPUs.
    pub num_cpus: usize,
    /// Scheduler plugin to instantiate.
    pub policy: SchedPolicy,
    /// Timer ticks a thread may run before the scheduler asks for preemption.
    pub time_slice_ticks: u32,
    /// Maximum number of live threads, idle threads excluded.
    pub max_threads: usize,
    /// Stack size for threads that do not ask for one.
    pub default_stack_size: usize,
    /// Priority for threads that do not ask for one.
    pub default_priority: u8,
    /// RCU writer wait strategy.
    pub rcu_wait: RcuWaitPolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            policy: SchedPolicy::RoundRobin,
            time_slice_ticks: 10,
            max_threads: 1024,
            default_stack_size: 16 * 1024,
            default_priority: priority::NORMAL,
            rcu_wait: RcuWaitPolicy::Yield,
        }
    }
}

impl KernelConfig {
    pub fn with_cpus(mut self, num_cpus: usize) -> Self {
        self.num_cpus = num_cpus;
        self
    }

    pub fn with_policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_time_slice(mut self, ticks: u32) -> Self {
        self.time_slice_ticks = ticks;
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.default_stack_size = bytes;
        self
    }

    pub fn with_default_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_rcu_wait(mut self, policy: RcuWaitPolicy) -> Self {
        self.rcu_wait = policy;
        self
    }

    /// Check the configuration for values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.num_cpus > MAX_CPUS {
            return Err(ConfigError::TooManyCpus(self.num_cpus));
        }
        if self.time_slice_ticks == 0 {
            return Err(ConfigError::ZeroTimeSlice);
        }
        if self.max_threads == 0 {
            return Err(ConfigError::ZeroThreadLimit);
        }
        if self.default_stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidStackSize(self.default_stack_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_bad_values() {
        let base = KernelConfig::default();
        assert_eq!(base.clone().with_cpus(0).validate(), Err(ConfigError::NoCpus));
        assert_eq!(
            base.clone().with_cpus(MAX_CPUS + 1).validate(),
            Err(ConfigError::TooManyCpus(MAX_CPUS + 1))
        );
        assert_eq!(base.clone().with_time_slice(0).validate(), Err(ConfigError::ZeroTimeSlice));
        assert_eq!(base.clone().with_max_threads(0).validate(), Err(ConfigError::ZeroThreadLimit));
        assert_eq!(
            base.with_stack_size(512).validate(),
            Err(ConfigError::InvalidStackSize(512))
        );
    }
}
