// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! VoD serving: on-demand page loading driven by consumer hints.

use crate::file_format::FileSource;
use manifold_bus::{Buffer, UserPage};
use manifold_core::limits::{INPUT_TIMEOUT_SECS, INPUT_USER_INTERVAL_MS};
use manifold_core::{runtime, Result, StreamState};
use manifold_stream::StatePage;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The serve-mode state of a file input: the bus pages plus the page plan
/// derived from the header.
pub struct VodServer {
    buffer: Buffer,
    users: UserPage,
    source: FileSource,
    plans: HashMap<u32, Vec<(u64, u64)>>,
}

impl VodServer {
    /// Builds the bus state for a stream backed by the given file and
    /// pre-buffers the first page of every track.
    pub fn new(stream: &str, source: FileSource) -> Result<Self> {
        let meta = source.load_meta()?;
        let mut buffer =
            Buffer::create(stream, false, &source.path().display().to_string())?;
        let mut plans = HashMap::new();
        for track in meta.tracks.values() {
            plans.insert(track.id, Buffer::page_plan(track));
            buffer.add_track(track.clone())?;
        }
        let users = UserPage::create(stream)?;
        let mut server = Self { buffer, users, source, plans };
        let ids: Vec<u32> = server.buffer.meta.tracks.keys().copied().collect();
        for id in ids {
            server.buffer_frame(id, 1)?;
        }
        Ok(server)
    }

    fn plan_for(&self, track: u32, key: u64) -> Option<(u64, u64)> {
        self.plans
            .get(&track)?
            .iter()
            .find(|&&(first, count)| first <= key && key < first + count)
            .copied()
    }

    /// Makes sure the page holding the given key is resident, loading it
    /// from the source file when needed. Requests close to a page end also
    /// pre-buffer the successor page.
    pub fn buffer_frame(&mut self, track_id: u32, key: u64) -> Result<bool> {
        let Some(track) = self.buffer.meta.tracks.get(&track_id) else {
            tracing::warn!(track = track_id, "no such track, cancelling buffer");
            return Ok(false);
        };
        let total_keys = track.keys.last().map_or(0, |k| k.number);
        if key > total_keys {
            // End of the file; not an error.
            return Ok(true);
        }
        let key = key.max(1);

        if self.buffer.is_buffered(track_id, key) {
            self.buffer.touch(track_id, key);
            if let Some((first, count)) = self.plan_for(track_id, key) {
                // Within 10% of the page end: make sure the next page is
                // ready before the reader gets there.
                if key + count / 10 > first + count && first + count <= total_keys {
                    return self.buffer_frame(track_id, first + count);
                }
            }
            return Ok(true);
        }

        let Some((first, count)) = self.plan_for(track_id, key) else {
            tracing::warn!(track = track_id, key, "no page planned for key");
            return Ok(false);
        };
        let track = self
            .buffer
            .meta
            .tracks
            .get(&track_id)
            .ok_or_else(|| manifold_core::ManifoldError::NotFound(format!("track {track_id}")))?;
        let from_time = track.key(first).map_or(0, |k| k.time);
        let stop_time = track.key(first + count).map_or(track.lastms + 1, |k| k.time);

        let started = Instant::now();
        let packets = self.source.packets_between(track_id, from_time, stop_time)?;
        let packet_count = packets.len();
        self.buffer.buffer_page(track_id, first, count, packets)?;
        tracing::debug!(
            track = track_id,
            first_key = first,
            keys = count,
            packets = packet_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "page buffered from file"
        );
        Ok(true)
    }

    /// The main serve loop: sweep the user slots, prefetch hinted pages,
    /// age out unused ones, and shut down once idle past the timeout.
    pub async fn run(&mut self, state: &mut StatePage, always_on: bool) -> Result<()> {
        state.set(StreamState::Ready);
        tracing::info!("input started");

        let mut activity = Instant::now();
        while runtime::is_active() {
            let report = self.users.sweep();
            for hint in &report.hints {
                let _ = self.buffer_frame(hint.track, hint.next_key + 1);
            }
            self.buffer.tick();

            if report.connected > 0 || always_on {
                activity = Instant::now();
            }
            if activity.elapsed() >= Duration::from_secs(INPUT_TIMEOUT_SECS) {
                tracing::info!("no users for {INPUT_TIMEOUT_SECS}s, shutting down");
                break;
            }
            if runtime::is_active() {
                tokio::time::sleep(Duration::from_millis(INPUT_USER_INTERVAL_MS)).await;
            }
        }

        state.set(StreamState::Shutdown);
        self.buffer.finish();
        state.set(StreamState::Off);
        tracing::info!("input closing clean");
        Ok(())
    }
}
