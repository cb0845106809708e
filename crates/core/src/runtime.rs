// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-process runtime singletons.
//!
//! Exactly three pieces of process-global mutable state exist: the active
//! flag (cleared by shutdown signals), the numeric debug level, and the
//! stream name used to tag log output. All are set during startup and
//! read-only afterwards; everything else that looks global lives in shared
//! memory under the page contracts.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;

static ACTIVE: AtomicBool = AtomicBool::new(true);
static DEBUG_LEVEL: AtomicU8 = AtomicU8::new(DEFAULT_DEBUG_LEVEL);
static STREAM_NAME: OnceLock<String> = OnceLock::new();

/// Debug level compiled in when neither `--debug` nor `DEBUG` is given.
pub const DEFAULT_DEBUG_LEVEL: u8 = 4;

/// Whether the process should keep running. Cleared by signal handlers.
pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Relaxed)
}

/// Requests a clean shutdown at the next safe boundary.
pub fn deactivate() {
    ACTIVE.store(false, Ordering::Relaxed);
}

/// Re-arms the active flag. Only used by supervisors between restarts.
pub fn reactivate() {
    ACTIVE.store(true, Ordering::Relaxed);
}

/// Current numeric debug level (0 = quiet, 10 = everything).
pub fn debug_level() -> u8 {
    DEBUG_LEVEL.load(Ordering::Relaxed)
}

/// Sets the debug level. The `DEBUG` environment variable wins over the
/// compiled default; `--debug` wins over both.
pub fn set_debug_level(level: u8) {
    DEBUG_LEVEL.store(level, Ordering::Relaxed);
}

/// Stream name this process serves, for log tagging. Empty before
/// [`set_stream_name`].
pub fn stream_name() -> &'static str {
    STREAM_NAME.get().map_or("", String::as_str)
}

/// Records the served stream name. First caller wins.
pub fn set_stream_name(name: &str) {
    let _ = STREAM_NAME.set(name.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_flag() {
        assert!(is_active());
        deactivate();
        assert!(!is_active());
        reactivate();
        assert!(is_active());
    }

    #[test]
    fn test_debug_level_default() {
        assert_eq!(debug_level(), DEFAULT_DEBUG_LEVEL);
    }
}
