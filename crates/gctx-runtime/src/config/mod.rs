//! Runtime configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables (runtime)
//! 3. User's file named by `GCTX_CONFIG_RS` (compile-time)
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use gctx_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .stack_size(128 * 1024)
//!     .slice_warning(Duration::from_millis(20));
//! ```

pub mod defaults;

use gctx_core::constants::MIN_STACK_SIZE;
pub use gctx_core::error::ConfigError;
use gctx_core::env::{env_get, env_get_bool, env_get_duration_ms};
use gctx_core::kinfo;
use std::sync::OnceLock;
use std::time::Duration;

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Default stack size of a context
    pub stack_size: usize,
    /// Stacks of the default size kept in each reactor's pool
    pub stack_pool_slots: usize,
    /// Guard page below mapped stacks
    pub stack_guard: bool,
    /// Sample stack usage at every suspension
    pub stack_profiling: bool,
    /// Stack usage percentage that triggers a warning (with profiling)
    pub stack_warn_percent: u8,
    /// Execution slice that triggers a warning; zero disables
    pub slice_warning: Duration,
    /// Longest reactor park while waiting for remote work or timers
    pub park_timeout: Duration,
    /// Minimum offload worker threads
    pub ole_threads: usize,
    /// Record per-descriptor slice history; handlers running off any
    /// reactor thread use the global setting
    pub ios_history: bool,
    /// Raise the log level to debug
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `GCTX_STACK_SIZE` - Default stack size in bytes
    /// - `GCTX_STACK_POOL_SLOTS` - Pooled stacks per reactor
    /// - `GCTX_STACK_GUARD` - Guard page below stacks (0/1)
    /// - `GCTX_STACK_PROFILING` - Sample stack usage (0/1)
    /// - `GCTX_STACK_WARN_PERCENT` - Stack usage warning threshold
    /// - `GCTX_SLICE_WARNING_MS` - Slice warning threshold, 0 disables
    /// - `GCTX_PARK_TIMEOUT_MS` - Reactor park timeout
    /// - `GCTX_OLE_THREADS` - Offload worker threads
    /// - `GCTX_IOS_HISTORY` - Descriptor slice history (0/1)
    /// - `GCTX_DEBUG` - Debug logging (0/1)
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            stack_size: env_get("GCTX_STACK_SIZE", base.stack_size),
            stack_pool_slots: env_get("GCTX_STACK_POOL_SLOTS", base.stack_pool_slots),
            stack_guard: env_get_bool("GCTX_STACK_GUARD", base.stack_guard),
            stack_profiling: env_get_bool("GCTX_STACK_PROFILING", base.stack_profiling),
            stack_warn_percent: env_get("GCTX_STACK_WARN_PERCENT", base.stack_warn_percent),
            slice_warning: env_get_duration_ms("GCTX_SLICE_WARNING_MS", defaults::SLICE_WARNING_MS),
            park_timeout: env_get_duration_ms("GCTX_PARK_TIMEOUT_MS", defaults::PARK_TIMEOUT_MS),
            ole_threads: env_get("GCTX_OLE_THREADS", base.ole_threads),
            ios_history: env_get_bool("GCTX_IOS_HISTORY", base.ios_history),
            debug_logging: env_get_bool("GCTX_DEBUG", base.debug_logging),
        }
    }

    /// Create config with compile-time defaults (no env override).
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            stack_pool_slots: defaults::STACK_POOL_SLOTS,
            stack_guard: defaults::STACK_GUARD,
            stack_profiling: defaults::STACK_PROFILING,
            stack_warn_percent: defaults::STACK_WARN_PERCENT,
            slice_warning: Duration::from_millis(defaults::SLICE_WARNING_MS),
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            ole_threads: defaults::OLE_THREADS,
            ios_history: defaults::IOS_HISTORY,
            debug_logging: defaults::DEBUG_LOGGING || cfg!(feature = "debug-logging"),
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn stack_pool_slots(mut self, n: usize) -> Self {
        self.stack_pool_slots = n;
        self
    }

    pub fn stack_guard(mut self, enable: bool) -> Self {
        self.stack_guard = enable;
        self
    }

    pub fn stack_profiling(mut self, enable: bool) -> Self {
        self.stack_profiling = enable;
        self
    }

    pub fn stack_warn_percent(mut self, percent: u8) -> Self {
        self.stack_warn_percent = percent;
        self
    }

    pub fn slice_warning(mut self, d: Duration) -> Self {
        self.slice_warning = d;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn ole_threads(mut self, n: usize) -> Self {
        self.ole_threads = n;
        self
    }

    pub fn ios_history(mut self, enable: bool) -> Self {
        self.ios_history = enable;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.stack_warn_percent == 0 || self.stack_warn_percent > 100 {
            return Err(ConfigError::InvalidValue("stack_warn_percent must be in 1..=100"));
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("park_timeout must be > 0"));
        }
        if self.ole_threads == 0 {
            return Err(ConfigError::InvalidValue("ole_threads must be > 0"));
        }
        if self.ole_threads > 256 {
            return Err(ConfigError::InvalidValue("ole_threads must be <= 256"));
        }
        Ok(())
    }

    /// Print configuration (info level)
    pub fn print(&self) {
        kinfo!("gctx configuration:");
        kinfo!("  stack_size:          {}", self.stack_size);
        kinfo!("  stack_pool_slots:    {}", self.stack_pool_slots);
        kinfo!("  stack_guard:         {}", self.stack_guard);
        kinfo!("  stack_profiling:     {}", self.stack_profiling);
        kinfo!("  stack_warn_percent:  {}", self.stack_warn_percent);
        kinfo!("  slice_warning:       {:?}", self.slice_warning);
        kinfo!("  park_timeout:        {:?}", self.park_timeout);
        kinfo!("  ole_threads:         {}", self.ole_threads);
        kinfo!("  ios_history:         {}", self.ios_history);
        kinfo!("  debug_logging:       {}", self.debug_logging);
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration used by the offload engine, and by the ios
/// layer on threads without a reactor
///
/// Initialised from the environment on first use unless `set_global` ran
/// before.
pub fn global() -> &'static RuntimeConfig {
    GLOBAL.get_or_init(RuntimeConfig::from_env)
}

/// Install the process-wide configuration
///
/// Fails, returning the rejected config, once `global()` has been observed.
pub fn set_global(config: RuntimeConfig) -> Result<(), RuntimeConfig> {
    GLOBAL.set(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::new();
        assert_eq!(config.stack_size, defaults::STACK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .stack_size(64 * 1024)
            .slice_warning(Duration::ZERO)
            .ios_history(true);

        assert_eq!(config.stack_size, 64 * 1024);
        assert!(config.slice_warning.is_zero());
        assert!(config.ios_history);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().stack_size(4096).validate().is_err());
        assert!(RuntimeConfig::new().stack_warn_percent(0).validate().is_err());
        assert!(RuntimeConfig::new().ole_threads(0).validate().is_err());
        assert_eq!(
            RuntimeConfig::new().park_timeout(Duration::ZERO).validate(),
            Err(ConfigError::InvalidValue("park_timeout must be > 0"))
        );
    }
}
