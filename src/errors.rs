//! Error handling for the scheduling core.
//!
//! Only genuinely recoverable failures are errors here: bad configuration and
//! resource exhaustion while creating threads. Broken calling contracts
//! (blocking from an interrupt handler, waking a thread no scheduler owns,
//! unlocking a mutex held by someone else) are assertions, not variants.

#![allow(clippy::uninlined_format_args)]

use core::fmt;

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Top-level error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// Thread creation errors
    Spawn(SpawnError),
    /// Configuration errors
    Config(ConfigError),
}

/// Errors that can occur during thread creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Out of memory for the execution context or its stack
    OutOfMemory,
    /// Maximum number of threads reached
    TooManyThreads,
    /// Invalid stack size specified
    InvalidStackSize(usize),
    /// CPU does not exist
    InvalidAffinity(usize),
}

/// Errors found while validating a [`KernelConfig`](crate::config::KernelConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// At least one CPU is required
    NoCpus,
    /// More CPUs than the per-CPU table supports
    TooManyCpus(usize),
    /// Time slice must be at least one tick
    ZeroTimeSlice,
    /// Thread limit must allow at least one thread
    ZeroThreadLimit,
    /// Default stack size is unusable
    InvalidStackSize(usize),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Spawn(e) => write!(f, "Thread spawn error: {}", e),
            KernelError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::OutOfMemory => write!(f, "Out of memory for thread creation"),
            SpawnError::TooManyThreads => write!(f, "Maximum number of threads reached"),
            SpawnError::InvalidStackSize(size) => write!(f, "Invalid stack size: {}", size),
            SpawnError::InvalidAffinity(cpu) => write!(f, "Invalid CPU affinity: {}", cpu),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoCpus => write!(f, "At least one CPU is required"),
            ConfigError::TooManyCpus(n) => write!(f, "Too many CPUs: {}", n),
            ConfigError::ZeroTimeSlice => write!(f, "Time slice must be at least one tick"),
            ConfigError::ZeroThreadLimit => write!(f, "Thread limit must be non-zero"),
            ConfigError::InvalidStackSize(size) => write!(f, "Invalid default stack size: {}", size),
        }
    }
}

// Conversion implementations for ergonomic error handling

impl From<SpawnError> for KernelError {
    fn from(error: SpawnError) -> Self {
        KernelError::Spawn(error)
    }
}

impl From<ConfigError> for KernelError {
    fn from(error: ConfigError) -> Self {
        KernelError::Config(error)
    }
}

impl SpawnError {
    /// POSIX errno equivalent, for emulation layers that surface this error.
    pub fn errno(self) -> i32 {
        const ENOMEM: i32 = 12;
        const EAGAIN: i32 = 11;
        const EINVAL: i32 = 22;
        match self {
            SpawnError::OutOfMemory => ENOMEM,
            SpawnError::TooManyThreads => EAGAIN,
            SpawnError::InvalidStackSize(_) | SpawnError::InvalidAffinity(_) => EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display_nests_source() {
        let err: KernelError = SpawnError::InvalidAffinity(7).into();
        assert_eq!(err.to_string(), "Thread spawn error: Invalid CPU affinity: 7");

        let err: KernelError = ConfigError::TooManyCpus(65).into();
        assert_eq!(err.to_string(), "Configuration error: Too many CPUs: 65");
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(SpawnError::OutOfMemory.errno(), 12);
        assert_eq!(SpawnError::TooManyThreads.errno(), 11);
        assert_eq!(SpawnError::InvalidStackSize(3).errno(), 22);
    }
}
