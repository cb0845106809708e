// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The angel process: crash supervision for inputs.
//!
//! An input binary first runs as the *angel*: it claims the stream lock,
//! publishes INIT, and then launches a *worker* copy of itself (same
//! binary, same arguments, `MANIFOLD_WORKER=1`) that does the actual
//! serving. A clean worker exit ends the angel; an abnormal exit publishes
//! INVALID and restarts the worker with a backoff growing by one second
//! per crash. SIGTERM to the angel is forwarded to the worker.
//!
//! `NOFORK=1` skips supervision and runs the worker inline, for
//! development.

use crate::supervisor::StatePage;
use manifold_core::{runtime, ManifoldError, Result, StreamState};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

/// Environment marker distinguishing the worker copy from the angel.
pub const WORKER_ENV: &str = "MANIFOLD_WORKER";

/// Whether this process is the worker copy.
pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Whether supervision is disabled for this process.
pub fn no_fork() -> bool {
    std::env::var_os("NOFORK").is_some()
}

/// Runs the supervision loop until the worker exits cleanly or shutdown is
/// requested. Returns the exit code for the angel process.
///
/// The caller holds the stream lock and keeps holding it across worker
/// restarts; the worker never touches it.
pub async fn supervise(stream: &str, mut on_crash: impl FnMut()) -> Result<i32> {
    let exe = std::env::current_exe()
        .map_err(|e| ManifoldError::Fatal(format!("cannot locate own binary: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| ManifoldError::Fatal(format!("cannot install SIGTERM handler: {e}")))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| ManifoldError::Fatal(format!("cannot install SIGINT handler: {e}")))?;

    let mut backoff_ms = 0u64;
    while runtime::is_active() {
        let mut cmd = tokio::process::Command::new(&exe);
        cmd.args(std::env::args_os().skip(1)).env(WORKER_ENV, "1");
        let mut child = cmd
            .spawn()
            .map_err(|e| ManifoldError::Fatal(format!("unable to spawn worker: {e}")))?;
        let worker_pid = child.id();
        tracing::debug!(%stream, pid = worker_pid, "worker started");

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| {
                        ManifoldError::Fatal(format!("waiting for worker failed: {e}"))
                    })?;
                }
                _ = sigterm.recv() => forward_term(stream, worker_pid),
                _ = sigint.recv() => forward_term(stream, worker_pid),
            }
        };

        if status.success() {
            tracing::info!(%stream, "input shut down cleanly");
            return Ok(0);
        }

        if let Ok(mut page) = StatePage::claim(stream) {
            page.set(StreamState::Invalid);
        }
        if !runtime::is_active() {
            break;
        }
        tracing::warn!(%stream, %status, backoff_ms, "input shut down uncleanly, restarting");
        on_crash();
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms += 1000;
    }
    Ok(0)
}

fn forward_term(stream: &str, worker_pid: Option<u32>) {
    tracing::info!(%stream, "shutting down input because of signal");
    runtime::deactivate();
    if let Some(pid) = worker_pid {
        if let Ok(pid) = i32::try_from(pid) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }
}

/// Installs process-wide SIGTERM/SIGINT handling that clears the active
/// flag, for worker and output processes.
pub fn spawn_signal_watcher() {
    tokio::spawn(async {
        let term = signal(SignalKind::terminate());
        let int = signal(SignalKind::interrupt());
        match (term, int) {
            (Ok(mut term), Ok(mut int)) => {
                tokio::select! {
                    _ = term.recv() => {},
                    _ = int.recv() => {},
                }
                tracing::info!("shutdown signal received");
                runtime::deactivate();
            },
            _ => tracing::warn!("could not install signal handlers"),
        }
    });
}
