// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Scratch directory resolution.
//!
//! Pages and semaphores are backed by files in a per-host scratch
//! directory, resolved from `TMP`, `TEMP`, or `TMPDIR` with a `/tmp`
//! fallback.

use std::path::PathBuf;

/// Returns the scratch directory for shared pages, creating it if needed.
pub fn scratch_dir() -> PathBuf {
    let base = std::env::var_os("TMP")
        .or_else(|| std::env::var_os("TEMP"))
        .or_else(|| std::env::var_os("TMPDIR"))
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    let dir = base.join("mist");
    // Creation failures surface later as open errors with better context.
    let _ = std::fs::create_dir_all(&dir);
    dir
}

/// Backing file path for the page or semaphore with the given name.
pub fn backing_path(name: &str) -> PathBuf {
    scratch_dir().join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backing_path_under_scratch() {
        let p = backing_path("MstSTATE@test");
        assert!(p.ends_with("mist/MstSTATE@test"));
    }
}
