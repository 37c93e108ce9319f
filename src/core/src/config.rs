//! Cache location resolution.
//!
//! The cache directory is picked in order of precedence: an explicit value
//! (CLI flag), the `ROOTPULL_CACHE` environment variable, then a platform
//! default depending on the current user.

use std::path::PathBuf;

/// Environment variable overriding the cache directory.
pub const CACHE_ENV: &str = "ROOTPULL_CACHE";

/// Resolve the cache directory from an optional explicit value.
///
/// Precedence: `explicit` → `$ROOTPULL_CACHE` → [`default_cache_dir`].
pub fn resolve_cache_dir(explicit: Option<&str>) -> PathBuf {
    if let Some(dir) = explicit.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }

    if let Ok(dir) = std::env::var(CACHE_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    default_cache_dir()
}

/// The default cache directory for the current user.
///
/// Root (or a user without a home directory) caches under `/var/cache`,
/// everyone else under `~/.cache`.
pub fn default_cache_dir() -> PathBuf {
    let home = dirs::home_dir();

    if rustix::process::geteuid().is_root() || home.is_none() {
        return PathBuf::from("/var/cache/rootpull");
    }

    home.unwrap().join(".cache").join("rootpull").join("roots")
}
