// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Input auto-start and the boot handshake.
//!
//! Any output that decides a stream must be live calls [`start_input`].
//! Exactly one input ends up owning the stream: the exclusivity semaphore
//! `MstInLock@<name>` arbitrates, and the one-byte state page tells
//! everyone else how far along the owner is.

use crate::capa::{read_capabilities, stream_config};
use crate::name::checked_name;
use crate::procs;
use crate::resolver::{assemble_params, input_by_source};
use crate::vars::expand_variables;
use manifold_core::limits::{BOOT_POLL_MS, BOOT_POLL_TRIES};
use manifold_core::{runtime, ManifoldError, Result, StreamState};
use manifold_shm::sem::is_locked;
use manifold_shm::{names, SharedPage};
use std::collections::BTreeMap;
use std::time::Duration;

/// Reads the stream-state byte. A missing page reads as OFF.
pub fn stream_status(stream: &str) -> StreamState {
    SharedPage::open(&names::stream_state(stream))
        .ok()
        .and_then(|page| page.bytes().first().copied())
        .map_or(StreamState::Off, StreamState::from_byte)
}

/// Writable handle on a stream's state page, held by the owning input.
pub struct StatePage {
    page: SharedPage,
}

impl StatePage {
    /// Opens (creating if needed) the state page for writing. The page is
    /// deliberately not mastered: it outlives worker restarts and is
    /// removed explicitly on clean shutdown.
    pub fn claim(stream: &str) -> Result<Self> {
        let name = names::stream_state(stream);
        let page = if SharedPage::exists(&name) {
            SharedPage::open_rw(&name, 1)?
        } else {
            let mut page = SharedPage::create(&name, 1)?;
            page.set_master(false);
            page
        };
        Ok(Self { page })
    }

    pub fn set(&mut self, state: StreamState) {
        if let Ok(bytes) = self.page.bytes_mut() {
            bytes[0] = state.as_byte();
            tracing::debug!(stream = runtime::stream_name(), %state, "stream state published");
        }
    }

    /// Removes the page. Called once on the final clean shutdown.
    pub fn destroy(stream: &str) {
        SharedPage::unlink(&names::stream_state(stream));
    }
}

/// Checks whether an active input is serving the stream, by probing its
/// exclusivity semaphore. Assumes the name is already sanitized.
pub fn stream_alive(stream: &str) -> bool {
    is_locked(&names::sem_input(stream)).unwrap_or(false)
}

/// Polls the state byte through transitional states, for at most
/// 240 x 250 ms. OFF and READY always end the wait; WAIT ends it for
/// providers; `throughboot` ends it in BOOT.
pub async fn wait_through_boot(stream: &str, is_provider: bool, throughboot: bool) -> StreamState {
    let mut state = stream_status(stream);
    let mut sleeps = 0u32;
    loop {
        let done = !state.is_transitional()
            && (state != StreamState::Wait || is_provider);
        if done || sleeps >= BOOT_POLL_TRIES {
            return state;
        }
        if state == StreamState::Boot && throughboot {
            return state;
        }
        sleeps += 1;
        tokio::time::sleep(Duration::from_millis(BOOT_POLL_MS)).await;
        state = stream_status(stream);
    }
}

/// How [`start_input`] should launch and track the input process.
#[derive(Debug, Default, Clone)]
pub struct StartOptions {
    /// Manual source override; `None` uses the configured source.
    pub source: Option<String>,
    /// When false, the input replaces the current process image instead of
    /// being spawned.
    pub no_fork: bool,
    /// Whether the caller will produce the stream itself.
    pub is_provider: bool,
    /// Free-form overrides; also carries the `throughboot`, `alwaysStart`
    /// and `singular` behavior switches.
    pub overrides: BTreeMap<String, String>,
}

/// Outcome of a successful [`start_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    /// An input already owned the stream; nothing was spawned.
    AlreadyActive,
    /// A new input was spawned and has taken the stream lock.
    Spawned(u32),
}

/// Assures an input is active for the given stream.
///
/// Sanitizes the name, rides out the boot handshake, and returns early
/// when the stream is already owned. Otherwise resolves source and input,
/// assembles parameters, spawns `mf-in-<name>`, and waits for the spawned
/// process to take the stream lock.
pub async fn start_input(stream: &str, opts: StartOptions) -> Result<Started> {
    let stream = checked_name(stream)?;

    let state = wait_through_boot(
        &stream,
        opts.is_provider,
        opts.overrides.contains_key("throughboot"),
    )
    .await;
    tracing::debug!(%stream, %state, "boot handshake settled");

    // The whole name, wildcard included, scopes the lock: test+a and
    // test+b boot independently.
    if stream_alive(&stream) && !opts.overrides.contains_key("alwaysStart") {
        tracing::debug!(%stream, "stream already active; continuing");
        return Ok(Started::AlreadyActive);
    }

    let config = stream_config(&stream)?;
    if config.is_none() {
        tracing::debug!(%stream, "stream not configured - attempting to ignore");
    }

    let source = match opts.source.clone() {
        Some(manual) if !manual.is_empty() => manual,
        _ => config
            .as_ref()
            .and_then(|c| c.source().map(ToString::to_string))
            .ok_or_else(|| {
                ManifoldError::NotFound(format!(
                    "stream {stream} not configured, no source manually given"
                ))
            })?,
    };
    let source = expand_variables(&source, &stream, "");

    let capa = read_capabilities()?;
    let input = input_by_source(&capa, &source, opts.is_provider)?;
    let params = assemble_params(input, config.as_ref(), &opts.overrides)?;

    if opts.is_provider {
        // Forwarded so a re-exec'ing child knows it acts for a provider.
        std::env::set_var("MISTPROVIDER", "1");
    }

    let binary = input_binary_path(&input.name)?;
    let mut cmd = std::process::Command::new(&binary);
    cmd.arg("-s").arg(&stream).arg(&source);
    if runtime::debug_level() != runtime::DEFAULT_DEBUG_LEVEL
        && !params.iter().any(|(opt, _)| opt == "--debug")
    {
        cmd.arg("--debug").arg(runtime::debug_level().to_string());
    }
    for (opt, value) in &params {
        cmd.arg(opt);
        if !value.is_empty() {
            cmd.arg(value);
        }
    }
    tracing::info!(%stream, binary = %binary.display(), %source, "starting input");

    if opts.no_fork {
        use std::os::unix::process::CommandExt;
        let err = cmd.exec();
        return Err(ManifoldError::Fatal(format!("exec {} failed: {err}", binary.display())));
    }

    let child = cmd
        .spawn()
        .map_err(|e| ManifoldError::Fatal(format!("spawning input for {stream} failed: {e}")))?;
    let pid = procs::watch(child);

    let mut waiting = 0u32;
    while !stream_alive(&stream) && waiting < BOOT_POLL_TRIES {
        waiting += 1;
        tokio::time::sleep(Duration::from_millis(BOOT_POLL_MS)).await;
        if !procs::is_running(pid) {
            tracing::error!(%stream, pid, "input process shut down before stream came online");
            break;
        }
    }

    if stream_alive(&stream) {
        Ok(Started::Spawned(pid))
    } else {
        Err(ManifoldError::Timeout(format!("input for {stream} never took the stream lock")))
    }
}

fn input_binary_path(input_name: &str) -> Result<std::path::PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| ManifoldError::Fatal(format!("cannot locate own binary: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| ManifoldError::Fatal("own binary has no parent directory".to_string()))?;
    Ok(dir.join(format!("mf-in-{input_name}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use manifold_shm::NamedSemaphore;

    fn unique(prefix: &str) -> String {
        format!("{prefix}{}", std::process::id())
    }

    #[test]
    fn test_missing_state_page_reads_off() {
        assert_eq!(stream_status("no-such-stream-ever"), StreamState::Off);
    }

    #[test]
    fn test_state_page_round_trip() {
        let stream = unique("statetest");
        let mut page = StatePage::claim(&stream).unwrap();
        page.set(StreamState::Boot);
        assert_eq!(stream_status(&stream), StreamState::Boot);
        page.set(StreamState::Ready);
        assert_eq!(stream_status(&stream), StreamState::Ready);
        StatePage::destroy(&stream);
        assert_eq!(stream_status(&stream), StreamState::Off);
    }

    #[test]
    fn test_stream_alive_follows_lock() {
        let stream = unique("alivetest");
        assert!(!stream_alive(&stream));
        let mut lock = NamedSemaphore::open(&names::sem_input(&stream)).unwrap();
        assert!(lock.try_wait());
        assert!(stream_alive(&stream));
        lock.post();
        assert!(!stream_alive(&stream));
        lock.unlink();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_through_boot_breaks_on_ready() {
        let stream = unique("boottest");
        let mut page = StatePage::claim(&stream).unwrap();
        page.set(StreamState::Boot);

        // Another task flips the state to READY while we wait, the way a
        // booting input would.
        let stream2 = stream.clone();
        let flipper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(900)).await;
            let mut page = StatePage::claim(&stream2).unwrap();
            page.set(StreamState::Ready);
        });

        let state = wait_through_boot(&stream, false, false).await;
        assert_eq!(state, StreamState::Ready);
        flipper.await.unwrap();
        StatePage::destroy(&stream);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_through_boot_provider_accepts_wait() {
        let stream = unique("waittest");
        let mut page = StatePage::claim(&stream).unwrap();
        page.set(StreamState::Wait);

        assert_eq!(wait_through_boot(&stream, true, false).await, StreamState::Wait);
        StatePage::destroy(&stream);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughboot_breaks_out_of_boot() {
        let stream = unique("tbtest");
        let mut page = StatePage::claim(&stream).unwrap();
        page.set(StreamState::Boot);

        assert_eq!(wait_through_boot(&stream, false, true).await, StreamState::Boot);
        StatePage::destroy(&stream);
    }
}
