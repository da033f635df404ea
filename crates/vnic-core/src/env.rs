//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing `VNIC_*` overrides with defaults.
//!
//! # Usage
//!
//! ```ignore
//! use vnic_core::env::{env_get, env_get_bool};
//!
//! let size: u16 = env_get("VNIC_RING_SIZE", 1024);
//! let llq: bool = env_get_bool("VNIC_LLQ", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default.
/// Unparseable values fall back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
