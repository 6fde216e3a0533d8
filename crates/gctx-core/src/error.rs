//! Error types for the context runtime
//!
//! `Interrupted` and `Terminated` are signals, not ordinary failures: they
//! are delivered at interruption points and are expected to propagate to
//! the context's entry function. Use [`CtxError::is_signal`] before treating
//! an error as recoverable.

use core::fmt;

/// Result type for runtime operations
pub type CtxResult<T> = Result<T, CtxError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtxError {
    /// Interruption delivered at an interruption point
    Interrupted,

    /// Termination delivered at an interruption point
    Terminated,

    /// Deadline reached in a throwing wait
    Timeout,

    /// Blocking operation called outside of any context
    NotInContext,

    /// No reactor installed on this thread (or executor singleton not set)
    NoReactor,

    /// A reactor is already installed on this thread
    ReactorExists,

    /// Suspension refused because this thread is unwinding a panic
    SwitchDuringUnwind,

    /// The reactor ran out of work before the awaited condition held
    Stalled,

    /// Stack or memory layer failure
    Memory(MemoryError),

    /// Runtime configuration rejected
    Config(ConfigError),
}

impl CtxError {
    /// Interruption or termination
    #[inline]
    pub const fn is_signal(&self) -> bool {
        matches!(self, CtxError::Interrupted | CtxError::Terminated)
    }

    /// Errors a generic handler may absorb and continue from
    #[inline]
    pub const fn is_recoverable(&self) -> bool {
        !self.is_signal() && !matches!(self, CtxError::SwitchDuringUnwind)
    }
}

impl fmt::Display for CtxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtxError::Interrupted => write!(f, "context interrupted"),
            CtxError::Terminated => write!(f, "context terminated"),
            CtxError::Timeout => write!(f, "operation timed out"),
            CtxError::NotInContext => write!(f, "not running in a context"),
            CtxError::NoReactor => write!(f, "no reactor available"),
            CtxError::ReactorExists => write!(f, "reactor already installed on this thread"),
            CtxError::SwitchDuringUnwind => write!(f, "context switch refused during unwind"),
            CtxError::Stalled => write!(f, "reactor stalled with no runnable work"),
            CtxError::Memory(e) => write!(f, "out of memory: {}", e),
            CtxError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CtxError {}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect failed
    ProtectionFailed,

    /// madvise failed
    AdviseFailed,

    /// Requested or supplied stack below the minimum size
    StackTooSmall,

    /// No free slots in the stack pool
    PoolExhausted,

    /// Slot position out of range
    InvalidSlot,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::AdviseFailed => write!(f, "memory advise failed"),
            MemoryError::StackTooSmall => write!(f, "stack too small"),
            MemoryError::PoolExhausted => write!(f, "stack pool exhausted"),
            MemoryError::InvalidSlot => write!(f, "invalid slot"),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<MemoryError> for CtxError {
    fn from(e: MemoryError) -> Self {
        CtxError::Memory(e)
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for CtxError {
    fn from(e: ConfigError) -> Self {
        CtxError::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_family() {
        assert!(CtxError::Interrupted.is_signal());
        assert!(CtxError::Terminated.is_signal());
        assert!(!CtxError::Timeout.is_signal());
        assert!(!CtxError::Terminated.is_recoverable());
        assert!(CtxError::Timeout.is_recoverable());
    }

    #[test]
    fn test_memory_conversion() {
        let e: CtxError = MemoryError::AllocationFailed.into();
        assert_eq!(e, CtxError::Memory(MemoryError::AllocationFailed));
        assert_eq!(e.to_string(), "out of memory: memory allocation failed");
    }

    #[test]
    fn test_config_conversion() {
        let e: CtxError = ConfigError::InvalidValue("stack_size must be >= 16KB").into();
        assert!(e.is_recoverable());
        assert_eq!(e.to_string(), "Invalid config: stack_size must be >= 16KB");
    }
}
