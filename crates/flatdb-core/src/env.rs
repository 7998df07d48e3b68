//! Environment variable overrides
//!
//! Every tunable in FlatDB can be overridden with a `FLATDB_`-prefixed
//! environment variable. Values that fail to parse are ignored and the
//! current value is kept.
//!
//! ```ignore
//! use flatdb_core::env::{env_override, env_override_bool};
//!
//! let port: u16 = env_override("PORT", 7707);          // FLATDB_PORT
//! let verbose = env_override_bool("VERBOSE_ERRORS", false);
//! ```

use std::str::FromStr;

/// Prefix shared by all FlatDB environment variables.
pub const ENV_PREFIX: &str = "FLATDB_";

/// Build the full variable name for a setting (`PORT` → `FLATDB_PORT`).
#[inline]
pub fn env_key(name: &str) -> String {
    format!("{}{}", ENV_PREFIX, name)
}

/// Return the parsed value of `FLATDB_<name>`, or `current` if the
/// variable is unset or does not parse.
#[inline]
pub fn env_override<T>(name: &str, current: T) -> T
where
    T: FromStr,
{
    env_get_opt(&env_key(name)).unwrap_or(current)
}

/// Boolean flavour of [`env_override`].
///
/// Accepts "1", "true", "yes", "on" as true and "0", "false", "no", "off"
/// as false (case-insensitive). Anything else keeps `current`.
#[inline]
pub fn env_override_bool(name: &str, current: bool) -> bool {
    match std::env::var(env_key(name)) {
        Ok(val) => parse_bool(&val).unwrap_or(current),
        Err(_) => current,
    }
}

/// Get a raw environment variable parsed as `T`.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Lenient boolean parsing shared by env overrides and config files.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
