// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Tuning constants shared across processes.
//!
//! These values are part of the cross-process contract: changing a page
//! size or a slot count requires restarting every process on the host.

/// Maximum stream name length after sanitization, in bytes.
pub const MAX_STREAM_NAME: usize = 100;

/// Default capacity of a track data page: ~8 MiB of payload plus headroom
/// for the key that crosses the flip threshold.
pub const DATA_PAGE_SIZE: usize = 9 * 1024 * 1024;

/// Default capacity of a stream metadata page.
pub const META_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Default capacity of the capability / stream-config snapshot pages.
pub const CONF_PAGE_SIZE: usize = 512 * 1024;

/// Size of a track index page: room for 1024 `(firstKey, keyCount)` entries.
pub const TRACK_INDEX_SIZE: usize = 8 * 1024;

/// A data page is flipped at the next keyframe once it holds this many
/// payload bytes (and at least [`FLIP_MIN_DURATION`] of media).
pub const FLIP_DATA_PAGE_SIZE: u64 = 8 * 1024 * 1024;

/// A data page is flipped at the next keyframe once it spans this many
/// milliseconds, regardless of size.
pub const FLIP_TARGET_DURATION: u64 = 5_000;

/// A page is never flipped before it spans this many milliseconds.
pub const FLIP_MIN_DURATION: u64 = 1_000;

/// Target duration of one fragment, in milliseconds.
pub const FRAGMENT_TARGET_DURATION: u64 = 1_900;

/// Tracks without keyframe flags (audio, subtitles) start a new key every
/// this many milliseconds.
pub const AUDIO_KEY_INTERVAL: u64 = 5_000;

/// Live pages overlapping the most recent fragments this many fragments
/// back are never evicted.
pub const LIVE_MIN_FRAGMENTS: usize = 2;

/// Sweep ticks a page stays resident after its last hinted access.
pub const PAGE_USE_TTL: u32 = 15;

/// Simultaneously trackable tracks per user slot.
pub const SIMUL_TRACKS: usize = 5;

/// Number of user slots on a `MstUsers@` page.
pub const USER_SLOT_COUNT: usize = 128;

/// Interval of the boot-handshake poll, in milliseconds.
pub const BOOT_POLL_MS: u64 = 250;

/// Boot-handshake poll attempts: 240 x 250ms = 60 seconds.
pub const BOOT_POLL_TRIES: u32 = 240;

/// Seconds of inactivity after which an input without users (and without
/// `always_on`) shuts itself down.
pub const INPUT_TIMEOUT_SECS: u64 = 30;

/// Milliseconds between input serve-loop iterations.
pub const INPUT_USER_INTERVAL_MS: u64 = 1_000;

/// Seconds an output may sit idle (no bytes, no playback) before being
/// disconnected.
pub const IDLE_DISCONNECT_SECS: u64 = 300;

/// Default playback pacing: milliseconds of media per wall-clock second.
/// 0 disables throttling.
pub const DEFAULT_REAL_TIME: u64 = 1_000;

/// Default maximum milliseconds an output runs ahead of its pacing target.
pub const DEFAULT_MAX_SKIP_AHEAD: u64 = 7_500;

/// Keep-away applied to simulated-live inputs, in milliseconds.
pub const SIMULATED_LIVE_BUFFER: u64 = 3_000;

/// Seconds a statistics sample is retained before eviction.
pub const STAT_CUTOFF_SECS: u64 = 600;

/// Seconds without samples after which an output/viewer session is retired.
pub const STATS_DELAY_SECS: u64 = 15;

/// Seconds without samples after which an input session is retired. Inputs
/// report less often and must survive source hiccups.
pub const STATS_INPUT_DELAY_SECS: u64 = 180;

/// Cumulative bytes (up + down) after which a session counts as a viewer.
pub const COUNTABLE_BYTES: u64 = 128 * 1024;

/// Seconds a header cache file must be newer than its source to be trusted.
pub const HEADER_CACHE_WINDOW_SECS: u64 = 15;
