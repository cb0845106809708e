// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Child process registry.
//!
//! Every process Manifold spawns is handed to [`watch`], which reaps it
//! from a waiter thread and records the exit. [`is_running`] is what the
//! supervisor polls while waiting for a freshly started input to take its
//! lock.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

static REGISTRY: OnceLock<Mutex<HashMap<u32, Arc<AtomicBool>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<u32, Arc<AtomicBool>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Takes ownership of a spawned child, reaps it on a waiter thread, and
/// returns its pid.
pub fn watch(mut child: Child) -> u32 {
    let pid = child.id();
    let running = Arc::new(AtomicBool::new(true));
    if let Ok(mut map) = registry().lock() {
        map.insert(pid, Arc::clone(&running));
    }
    std::thread::spawn(move || {
        match child.wait() {
            Ok(status) => tracing::debug!(pid, %status, "child exited"),
            Err(e) => tracing::warn!(pid, error = %e, "waiting for child failed"),
        }
        running.store(false, Ordering::Relaxed);
    });
    pid
}

/// Whether a watched child is still alive. Unknown pids count as dead.
pub fn is_running(pid: u32) -> bool {
    registry()
        .lock()
        .ok()
        .and_then(|map| map.get(&pid).map(|r| r.load(Ordering::Relaxed)))
        .unwrap_or(false)
}

/// Sends SIGTERM to a child.
pub fn stop(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_watch_reaps_exit() {
        let child = Command::new("true").spawn().unwrap();
        let pid = watch(child);
        // The waiter thread flips the flag once the child is reaped.
        for _ in 0..100 {
            if !is_running(pid) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("child was never reaped");
    }

    #[test]
    fn test_unknown_pid_is_dead() {
        assert!(!is_running(999_999_999));
    }

    #[test]
    fn test_stop_terminates_sleeper() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = watch(child);
        assert!(is_running(pid));
        stop(pid);
        for _ in 0..100 {
            if !is_running(pid) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("child survived SIGTERM");
    }
}
