//! `NB_*` environment overrides
//!
//! Every tunable of the runtime can be overridden through an environment
//! variable. Values are trimmed before parsing; an unset or unparsable
//! variable yields the caller's default.
//!
//! ```ignore
//! use noblock_core::env::{env_get, env_get_bool, env_get_millis};
//!
//! let pool: usize = env_get("NB_POOL_SIZE", 50);
//! let fair = env_get_bool("NB_FAIR_HANDOFF", false);
//! let cap = env_get_millis("NB_MAX_POLL_MS", Duration::from_millis(500));
//! ```

use std::str::FromStr;
use std::time::Duration;

fn raw(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_owned())
}

/// `Some(T)` if the variable is set and parses
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    raw(key)?.parse().ok()
}

pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Accepts 1/0, true/false, yes/no, on/off in any case. Anything else,
/// including an empty value, keeps `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    raw(key).and_then(|v| parse_flag(&v)).unwrap_or(default)
}

fn parse_flag(v: &str) -> Option<bool> {
    const TRUE: [&str; 4] = ["1", "true", "yes", "on"];
    const FALSE: [&str; 4] = ["0", "false", "no", "off"];
    if TRUE.iter().any(|t| t.eq_ignore_ascii_case(v)) {
        Some(true)
    } else if FALSE.iter().any(|f| f.eq_ignore_ascii_case(v)) {
        Some(false)
    } else {
        None
    }
}

/// Whole milliseconds as a `Duration`
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt(key).map(Duration::from_millis).unwrap_or(default)
}

/// Untrimmed value, or `default` when unset
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}
