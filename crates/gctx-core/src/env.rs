//! Environment variable utilities
//!
//! All runtime tunables are read through these helpers so that a missing
//! or unparsable variable silently falls back to the compiled default.
//!
//! ```ignore
//! use gctx_core::env::{env_get, env_get_bool, env_get_duration_ms};
//!
//! let stack: usize = env_get("GCTX_STACK_SIZE", 256 * 1024);
//! let guard = env_get_bool("GCTX_STACK_GUARD", true);
//! let park = env_get_duration_ms("GCTX_PARK_TIMEOUT_MS", 10);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as `T`, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as optional value
///
/// `None` when unset or when the value does not parse.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (any case) are true; any other value is false.
/// Unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable holding milliseconds as a `Duration`
#[inline]
pub fn env_get_duration_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Check if environment variable is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let val: usize = env_get("__GCTX_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__GCTX_TEST_UNSET__", true));
        assert!(env_get_opt::<u32>("__GCTX_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__GCTX_TEST_UNSET__", "hello"), "hello");
        assert!(!env_is_set("__GCTX_TEST_UNSET__"));
    }

    #[test]
    fn test_parse_and_fallback() {
        std::env::set_var("__GCTX_TEST_NUM__", " 123 ");
        assert_eq!(env_get::<usize>("__GCTX_TEST_NUM__", 0), 123);
        assert_eq!(
            env_get_duration_ms("__GCTX_TEST_NUM__", 5),
            Duration::from_millis(123)
        );

        std::env::set_var("__GCTX_TEST_NUM__", "not_a_number");
        assert_eq!(env_get::<usize>("__GCTX_TEST_NUM__", 99), 99);
        std::env::remove_var("__GCTX_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        for (val, expect) in [("1", true), ("TRUE", true), ("yes", true), ("on", true),
                              ("0", false), ("false", false), ("garbage", false)] {
            std::env::set_var("__GCTX_TEST_BOOL__", val);
            assert_eq!(env_get_bool("__GCTX_TEST_BOOL__", !expect), expect, "{}", val);
        }
        std::env::remove_var("__GCTX_TEST_BOOL__");
    }
}
