// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! User slot pages.
//!
//! Every connected output owns one fixed-size slot on `MstUsers@<name>`:
//! a heartbeat control byte plus, per selected track, the number of the
//! next key it expects. The producer sweeps the page once per second to
//! prefetch hinted pages and to evict slots whose heartbeat went stale.
//!
//! Slot layout (32 bytes):
//!
//! ```text
//! [control u8][reserved u8] + 5 x [track u32 BE][nextKey u16 BE]
//! ```
//!
//! The control byte cycles 1..=125 as heartbeat; 126 and 127 mean
//! "disconnecting - last record"; 0 is a free slot.

use manifold_core::limits::{INPUT_TIMEOUT_SECS, SIMUL_TRACKS, USER_SLOT_COUNT};
use manifold_core::{ManifoldError, Result};
use manifold_shm::{names, NamedSemaphore, SharedPage};
use std::collections::HashMap;
use std::time::Instant;

/// Size of one slot in bytes.
pub const SLOT_SIZE: usize = 2 + SIMUL_TRACKS * 6;

/// First control value that means "disconnecting".
pub const CTRL_DISCONNECT: u8 = 126;

const HEARTBEAT_MAX: u8 = 125;

fn slot_offset(idx: usize) -> usize {
    idx * SLOT_SIZE
}

/// One output's claimed slot. Consumer side.
pub struct SlotHandle {
    page: SharedPage,
    idx: usize,
    counter: u8,
}

impl SlotHandle {
    /// Claims a free slot on the stream's user page. Claiming is guarded
    /// by the page's semaphore so two outputs never race onto one slot.
    pub fn claim(stream: &str) -> Result<Self> {
        let mut page =
            SharedPage::open_rw(&names::users(stream), USER_SLOT_COUNT * SLOT_SIZE)?;
        let mut guard = NamedSemaphore::open(&names::users(stream))?;
        guard.wait()?;
        let claimed = (0..USER_SLOT_COUNT).find(|&idx| {
            let at = slot_offset(idx);
            page.bytes()[at] == 0
        });
        let outcome = match claimed {
            Some(idx) => {
                let buf = page.bytes_mut()?;
                let at = slot_offset(idx);
                buf[at..at + SLOT_SIZE].fill(0);
                buf[at] = 1;
                Ok(idx)
            },
            None => Err(ManifoldError::Fatal(format!("no free user slot for {stream}"))),
        };
        guard.post();
        let idx = outcome?;
        tracing::debug!(%stream, slot = idx, "claimed user slot");
        Ok(Self { page, idx, counter: 1 })
    }

    /// Refreshes the heartbeat. Call at least every few seconds while
    /// connected, including inside playback sleeps.
    pub fn keep_alive(&mut self) {
        self.counter = if self.counter >= HEARTBEAT_MAX { 1 } else { self.counter + 1 };
        let at = slot_offset(self.idx);
        if let Ok(buf) = self.page.bytes_mut() {
            buf[at] = self.counter;
        }
    }

    /// Publishes the next expected key for the track in hint position `i`.
    pub fn set_hint(&mut self, i: usize, track: u32, next_key: u64) {
        if i >= SIMUL_TRACKS {
            return;
        }
        let key = u16::try_from(next_key.min(u64::from(u16::MAX))).unwrap_or(u16::MAX);
        let at = slot_offset(self.idx) + 2 + i * 6;
        if let Ok(buf) = self.page.bytes_mut() {
            buf[at..at + 4].copy_from_slice(&track.to_be_bytes());
            buf[at + 4..at + 6].copy_from_slice(&key.to_be_bytes());
        }
    }

    /// Marks the slot as disconnecting. The producer frees it on its next
    /// sweep.
    pub fn finish(&mut self) {
        let at = slot_offset(self.idx);
        if let Ok(buf) = self.page.bytes_mut() {
            buf[at] = CTRL_DISCONNECT;
        }
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

/// A `(track, next key)` prefetch hint read from a live slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHint {
    pub track: u32,
    pub next_key: u64,
}

/// Result of one producer sweep over the slot page.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Number of live (heartbeating) slots.
    pub connected: usize,
    /// All hints across live slots.
    pub hints: Vec<SlotHint>,
}

/// The producer's ownership of the slot page.
pub struct UserPage {
    page: SharedPage,
    seen: HashMap<usize, (u8, Instant)>,
}

impl UserPage {
    /// Creates the slot page for a stream. Producer side.
    pub fn create(stream: &str) -> Result<Self> {
        let page = SharedPage::create(&names::users(stream), USER_SLOT_COUNT * SLOT_SIZE)?;
        Ok(Self { page, seen: HashMap::new() })
    }

    /// Scans all slots: collects hints from live ones, frees disconnected
    /// ones, and evicts slots whose heartbeat has not moved within half
    /// the input timeout.
    pub fn sweep(&mut self) -> SweepReport {
        let now = Instant::now();
        let stale_after = std::time::Duration::from_secs(INPUT_TIMEOUT_SECS / 2);
        let mut report = SweepReport::default();

        for idx in 0..USER_SLOT_COUNT {
            let at = slot_offset(idx);
            let control = self.page.bytes()[at];
            if control == 0 {
                self.seen.remove(&idx);
                continue;
            }
            if control >= CTRL_DISCONNECT {
                tracing::debug!(slot = idx, "user disconnected");
                self.free_slot(idx);
                continue;
            }
            let stale = match self.seen.get(&idx) {
                Some(&(last, since)) if last == control => now.duration_since(since) > stale_after,
                _ => {
                    self.seen.insert(idx, (control, now));
                    false
                },
            };
            if stale {
                tracing::warn!(slot = idx, "user heartbeat expired, evicting slot");
                self.free_slot(idx);
                continue;
            }
            report.connected += 1;
            let buf = self.page.bytes();
            for i in 0..SIMUL_TRACKS {
                let h = at + 2 + i * 6;
                let mut track4 = [0u8; 4];
                track4.copy_from_slice(&buf[h..h + 4]);
                let track = u32::from_be_bytes(track4);
                if track == 0 {
                    continue;
                }
                let mut key2 = [0u8; 2];
                key2.copy_from_slice(&buf[h + 4..h + 6]);
                report.hints.push(SlotHint { track, next_key: u64::from(u16::from_be_bytes(key2)) });
            }
        }
        report
    }

    fn free_slot(&mut self, idx: usize) {
        let at = slot_offset(idx);
        if let Ok(buf) = self.page.bytes_mut() {
            buf[at..at + SLOT_SIZE].fill(0);
        }
        self.seen.remove(&idx);
    }
}
