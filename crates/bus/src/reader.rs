// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The consumer side of the packet bus: the per-connection reader.
//!
//! A [`Reader`] keeps, per selected track, the current page mapping, the
//! read offset, the expected key number, and a next-packet candidate. A
//! priority set ordered by `(time, track)` decides which track emits next,
//! with the lower track id winning equal timestamps.
//!
//! Tracks are the unit of recovery: any irrecoverable anomaly (page load
//! timeout, time going backwards, a sentinel with no successor page) drops
//! only the affected track and playback continues with the rest.

use crate::index::TrackIndex;
use crate::meta::read_meta;
use crate::packet;
use crate::select::{main_track, select_default, SelectionPrefs};
use crate::slots::SlotHandle;
use manifold_core::capa::ConnectorDescriptor;
use manifold_core::limits::{DEFAULT_MAX_SKIP_AHEAD, DEFAULT_REAL_TIME, SIMUL_TRACKS};
use manifold_core::{runtime, ManifoldError, MediaPacket, Result, StreamMeta, TrackKind};
use manifold_shm::{names, SharedPage};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// One next-packet candidate. The derived ordering is `(time, track)`,
/// which is exactly the emission order contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct NextEntry {
    time: u64,
    track: u32,
    offset: usize,
}

/// Outcome of one `prepare_next` invocation.
#[derive(Debug)]
pub enum Step {
    /// A packet is ready for emission.
    Packet(MediaPacket),
    /// Internal state changed (page crossed, track dropped, still
    /// waiting); call again.
    Again,
    /// Playback has completed: every selected track is played out.
    Done,
}

/// Per-connection reader over one stream's bus pages.
pub struct Reader {
    stream: String,
    pub meta: StreamMeta,
    pub selected: BTreeSet<u32>,
    buffer: BTreeSet<NextEntry>,
    pages: HashMap<u32, SharedPage>,
    indexes: HashMap<u32, TrackIndex>,
    curr_key_open: HashMap<u32, u64>,
    nxt_key_num: HashMap<u32, u64>,
    slot: Option<SlotHandle>,
    /// Milliseconds of media per wall-clock second; 0 disables pacing.
    pub real_time: u64,
    /// How far emission may run ahead of the pacing target, in ms.
    pub max_skip_ahead: u64,
    /// Future milliseconds every selected track must have published before
    /// the current packet is emitted.
    pub needs_look_ahead: u64,
    extra_keep_away: u64,
    first_time_ms: u64,
    epoch: Instant,
    sought: bool,
    empty_count: u32,
    at_live_point: bool,
}

impl Reader {
    /// Attaches to a stream whose metadata page is readable. Claims a user
    /// slot when the stream has one (live and served VoD streams do).
    pub fn connect(stream: &str) -> Result<Self> {
        let meta = read_meta(stream)?;
        let slot = match SlotHandle::claim(stream) {
            Ok(slot) => Some(slot),
            Err(ManifoldError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(Self {
            stream: stream.to_string(),
            meta,
            selected: BTreeSet::new(),
            buffer: BTreeSet::new(),
            pages: HashMap::new(),
            indexes: HashMap::new(),
            curr_key_open: HashMap::new(),
            nxt_key_num: HashMap::new(),
            slot,
            real_time: DEFAULT_REAL_TIME,
            max_skip_ahead: DEFAULT_MAX_SKIP_AHEAD,
            needs_look_ahead: 0,
            extra_keep_away: 0,
            first_time_ms: 0,
            epoch: Instant::now(),
            sought: false,
            empty_count: 0,
            at_live_point: false,
        })
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn keep_going() -> bool {
        runtime::is_active()
    }

    /// Re-reads the metadata page. Failures keep the previous copy: a
    /// briefly unreadable page is not worth dropping the connection over.
    pub fn update_meta(&mut self) {
        match read_meta(&self.stream) {
            Ok(meta) => self.meta = meta,
            Err(e) => tracing::trace!(stream = %self.stream, error = %e, "metadata refresh failed"),
        }
    }

    /// Refreshes the slot heartbeat and the per-track next-key hints the
    /// producer prefetches from.
    pub fn keep_alive(&mut self) {
        let hints: Vec<(u32, u64)> = self
            .selected
            .iter()
            .take(SIMUL_TRACKS)
            .map(|&tid| (tid, self.nxt_key_num.get(&tid).copied().unwrap_or(0)))
            .collect();
        if let Some(slot) = self.slot.as_mut() {
            for (i, (track, key)) in hints.iter().enumerate() {
                slot.set_hint(i, *track, *key);
            }
            slot.keep_alive();
        }
    }

    /// Sleeps while keeping pacing honest: stalled time shifts the
    /// real-time anchor and widens the live keep-away.
    async fn playback_sleep(&mut self, ms: u64) {
        if self.real_time > 0 && self.meta.live {
            self.first_time_ms += ms;
            self.extra_keep_away += ms;
        }
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.keep_alive();
    }

    /// Applies the default selection for this connector and client.
    pub fn select_tracks(
        &mut self,
        connector: &ConnectorDescriptor,
        prefs: &SelectionPrefs<'_>,
    ) {
        let seek_target = self.current_time();
        let target = if self.buffer.is_empty() { None } else { Some(seek_target) };
        self.selected = select_default(&self.meta, connector, prefs, target);
        tracing::debug!(stream = %self.stream, selected = ?self.selected, "track selection");
    }

    /// Media time of the next packet, or 0 when nothing is buffered.
    pub fn current_time(&self) -> u64 {
        self.buffer.first().map_or(0, |e| e.time)
    }

    pub const fn has_sought(&self) -> bool {
        self.sought
    }

    /// Drops one track from playback, keeping the rest going.
    pub fn drop_track(&mut self, tid: u32, reason: &str, probably_bad: bool) {
        if probably_bad {
            tracing::warn!(stream = %self.stream, track = tid, reason, "dropping track");
        } else {
            tracing::info!(stream = %self.stream, track = tid, reason, "dropping track");
        }
        self.buffer.retain(|e| e.track != tid);
        self.selected.remove(&tid);
    }

    fn page_num_for_key(&mut self, tid: u32, key: u64) -> Option<u64> {
        if !self.indexes.contains_key(&tid) {
            match TrackIndex::open(&self.stream, tid) {
                Ok(index) => {
                    self.indexes.insert(tid, index);
                },
                Err(_) => return None,
            }
        }
        self.indexes.get(&tid).and_then(|idx| idx.page_for_key(key))
    }

    /// Drops cached page and index mappings so the next access re-attaches
    /// to whatever a (possibly restarted) input has published.
    fn reconnect(&mut self) {
        tracing::debug!(stream = %self.stream, "re-attaching to stream pages");
        self.indexes.clear();
        self.update_meta();
    }

    /// Maps the data page holding the given key, waiting for the producer
    /// to publish it when necessary.
    async fn load_page_for_key(&mut self, tid: u32, key_num: u64) {
        let (has_keys, last_key) = self
            .meta
            .tracks
            .get(&tid)
            .map_or((false, 0), |t| (!t.keys.is_empty(), t.keys.last().map_or(0, |k| k.number)));
        if !has_keys {
            tracing::warn!(track = tid, key_num, "page load aborted - track is empty");
            return;
        }
        if self.meta.is_vod() && key_num > last_key {
            self.pages.remove(&tid);
            self.curr_key_open.remove(&tid);
            return;
        }

        let mut timeout = 0u32;
        let mut page_num = self.page_num_for_key(tid, key_num);
        while Self::keep_going() && page_num.is_none() {
            timeout += 1;
            // The producer may still be writing this page; after three
            // seconds of waiting something is off, so re-attach.
            if timeout == 30 {
                tracing::debug!(stream = %self.stream, track = tid, key_num, "page load is slow, re-attaching");
                self.reconnect();
            }
            if timeout > 100 {
                tracing::error!(track = tid, key_num, "timeout waiting for page");
                self.pages.remove(&tid);
                self.curr_key_open.remove(&tid);
                return;
            }
            self.nxt_key_num.insert(tid, key_num.saturating_sub(1));
            self.keep_alive();
            self.playback_sleep(100).await;
            page_num = self.page_num_for_key(tid, key_num);
        }
        let Some(page_num) = page_num else { return };

        self.nxt_key_num.insert(tid, key_num.saturating_sub(1));
        self.keep_alive();

        if self.curr_key_open.get(&tid) == Some(&page_num) {
            return;
        }
        match SharedPage::open(&names::track_data(&self.stream, tid, page_num)) {
            Ok(page) => {
                self.pages.insert(tid, page);
                self.curr_key_open.insert(tid, page_num);
            },
            Err(e) => {
                tracing::error!(track = tid, page_num, error = %e, "mapping data page failed");
                self.curr_key_open.remove(&tid);
            },
        }
    }

    /// Seeks all selected tracks to `pos` milliseconds. When `to_key` is
    /// set and the main track is video, the position snaps back to its
    /// keyframe.
    pub async fn seek(&mut self, pos: u64, to_key: bool) {
        self.sought = true;
        self.buffer.clear();
        if self.meta.live {
            self.update_meta();
        }
        let mut pos = pos;
        if to_key {
            if let Some(main) = main_track(&self.meta, &self.selected) {
                if let Some(track) = self.meta.tracks.get(&main) {
                    if track.kind == TrackKind::Video && !track.keys.is_empty() {
                        let mut snapped = 0;
                        for key in &track.keys {
                            if key.time > pos {
                                break;
                            }
                            snapped = key.time;
                        }
                        pos = snapped;
                    }
                }
            }
        }
        tracing::debug!(stream = %self.stream, pos, "seeking");
        for tid in self.selected.clone() {
            if self.meta.tracks.contains_key(&tid) {
                self.seek_track(tid, pos).await;
            }
        }
        self.first_time_ms = self.now_ms().saturating_sub(self.current_time());
    }

    /// Seeks one track; removes it from the selection when its data is
    /// unreachable within the bounded retry window.
    async fn seek_track(&mut self, tid: u32, pos: u64) -> bool {
        // Live streams may simply not have reached `pos` yet.
        if self.meta.live && self.track_lastms(tid) < pos {
            let mut tries = 0;
            while self.track_lastms(tid) < pos && tries < 20 && Self::keep_going() {
                tries += 1;
                self.playback_sleep(500).await;
                self.update_meta();
            }
        }
        if self.track_lastms(tid) < pos {
            tracing::warn!(track = tid, pos, lastms = self.track_lastms(tid), "seek past end of track");
            self.selected.remove(&tid);
            return false;
        }

        let Some(track) = self.meta.tracks.get(&tid) else {
            self.selected.remove(&tid);
            return false;
        };
        let key_num = track.key_for_time(pos);
        let mut pos = pos;
        if let Some(key) = track.key(key_num) {
            if key.time > pos && self.meta.live {
                tracing::warn!(track = tid, wanted = pos, actual = key.time, "seek target no longer available");
                pos = key.time;
            }
        }

        self.load_page_for_key(tid, key_num).await;
        if !self.pages.contains_key(&tid) {
            tracing::warn!(track = tid, pos, "seek aborted: page not available");
            self.selected.remove(&tid);
            return false;
        }

        // Walk the page to the first packet at or after pos. An empty
        // spot can mean the producer has not written it yet: VoD pages
        // get a short growing backoff before the track is failed.
        let mut wait = 1u64;
        loop {
            let scan = {
                let page = match self.pages.get(&tid) {
                    Some(p) => p,
                    None => return false,
                };
                scan_page(page.bytes(), pos)
            };
            match scan {
                ScanOutcome::Found { offset, time } => {
                    tracing::trace!(track = tid, time, "sought");
                    self.buffer.insert(NextEntry { time, track: tid, offset });
                    self.nxt_key_num.insert(tid, key_num);
                    return true;
                },
                ScanOutcome::Corrupt { offset } => {
                    tracing::error!(track = tid, offset, "corruption while seeking");
                    self.selected.remove(&tid);
                    return false;
                },
                ScanOutcome::Empty { .. } => {
                    if self.meta.live || wait > 10 || !Self::keep_going() {
                        tracing::error!(track = tid, pos, "no data at seek point");
                        self.selected.remove(&tid);
                        return false;
                    }
                    self.playback_sleep(100 * wait).await;
                    wait += 1;
                },
            }
        }
    }

    fn track_lastms(&self, tid: u32) -> u64 {
        self.meta.tracks.get(&tid).map_or(0, |t| t.lastms)
    }

    /// Decides where playback starts: VoD at zero; live at the newest main
    /// track keyframe for which every selected track has published at
    /// least `lookahead + keep-away` ms beyond, falling back to the
    /// earliest key.
    pub async fn initial_seek(&mut self) {
        let mut seek_pos = 0;
        if self.meta.live {
            let Some(main) = main_track(&self.meta, &self.selected) else { return };
            let Some(track) = self.meta.tracks.get(&main) else { return };
            if track.keys.is_empty() {
                return;
            }
            for key in track.keys.iter().rev() {
                seek_pos = key.time;
                if seek_pos < 5_000 {
                    continue;
                }
                let mut good = true;
                for &tid in &self.selected {
                    let Some(t) = self.meta.tracks.get(&tid) else { continue };
                    let horizon =
                        seek_pos + self.needs_look_ahead + self.extra_keep_away + t.min_keep_away;
                    if t.lastms < horizon {
                        good = false;
                        break;
                    }
                }
                if good {
                    break;
                }
            }
        }
        tracing::debug!(stream = %self.stream, seek_pos, "initial seek");
        self.seek(seek_pos, false).await;
    }

    /// Attempts to prepare the next packet in playback order.
    #[allow(clippy::too_many_lines)] // faithful decision tree, one branch per failure mode
    pub async fn prepare_next(&mut self) -> Result<Step> {
        let Some(&nxt) = self.buffer.first() else {
            tracing::info!(stream = %self.stream, "buffer completely played out");
            return Ok(Step::Done);
        };

        // Every selected track needs a buffer entry and vice versa.
        if self.buffer.len() != self.selected.len() {
            let with_entries: BTreeSet<u32> = self.buffer.iter().map(|e| e.track).collect();
            let stale: Vec<u32> = self
                .selected
                .symmetric_difference(&with_entries)
                .copied()
                .collect();
            for tid in stale {
                self.drop_track(tid, "seek/select mismatch", true);
            }
            return Ok(Step::Again);
        }

        if !self.meta.tracks.contains_key(&nxt.track) {
            self.drop_track(nxt.track, "disappeared from metadata", true);
            return Ok(Step::Again);
        }

        let Some(page_len) = self.pages.get(&nxt.track).map(SharedPage::len) else {
            self.drop_track(nxt.track, "no page mapped", true);
            return Ok(Step::Again);
        };

        // Reading past the end of the mapped page: VoD page crossing.
        if nxt.offset >= page_len {
            if self.meta.is_vod() && nxt.time >= self.track_lastms(nxt.track) {
                self.drop_track(nxt.track, "end of VoD track reached", false);
                return Ok(Step::Again);
            }
            let key_num = self
                .meta
                .tracks
                .get(&nxt.track)
                .map_or(0, |t| t.key_for_time(nxt.time))
                + 1;
            self.load_page_for_key(nxt.track, key_num).await;
            self.nxt_key_num.insert(nxt.track, key_num);
            if self.pages.contains_key(&nxt.track) {
                let new_time = self
                    .pages
                    .get(&nxt.track)
                    .map_or(0, |p| packet::time_at(p.bytes(), 0));
                if new_time < nxt.time {
                    self.drop_track(nxt.track, "time going backwards", true);
                } else {
                    self.replace_entry(nxt, NextEntry { time: new_time, track: nxt.track, offset: 0 });
                }
            } else {
                self.drop_track(nxt.track, "VoD page load failure", true);
            }
            return Ok(Step::Again);
        }

        let sentinel = self
            .pages
            .get(&nxt.track)
            .is_some_and(|p| packet::is_sentinel(p.bytes(), nxt.offset));
        if sentinel {
            return self.handle_sentinel(nxt).await;
        }

        // The packet should exist here; load it.
        let parsed = self
            .pages
            .get(&nxt.track)
            .ok_or_else(|| ManifoldError::Fatal("page vanished".to_string()))
            .and_then(|p| packet::parse_at(p.bytes(), nxt.offset));
        let (pkt, total) = match parsed {
            Ok(Some(found)) => found,
            Ok(None) | Err(_) => {
                self.drop_track(nxt.track, "packet load failure", true);
                return Ok(Step::Again);
            },
        };
        self.empty_count = 0;

        // Timestamp mismatch: trust the data, reorder the candidate.
        if pkt.time != nxt.time && nxt.time != 0 {
            if !self.at_live_point {
                tracing::warn!(
                    track = nxt.track,
                    expected = nxt.time,
                    actual = pkt.time,
                    "loaded packet with unexpected timestamp, reordering"
                );
            }
            self.replace_entry(nxt, NextEntry { time: pkt.time, ..nxt });
            return Ok(Step::Again);
        }

        // On keyframes, validate that our key bookkeeping matches the
        // producer's key list; a persistent mismatch means the internal
        // state is inconsistent and playback restarts from the live point.
        if pkt.keyframe {
            let mut key_num = self
                .meta
                .tracks
                .get(&nxt.track)
                .map_or(0, |t| t.key_for_time(pkt.time));
            let mut tries = 0;
            while self.meta.live
                && tries < 40
                && self.key_time(nxt.track, key_num) != Some(pkt.time)
            {
                if tries > 0 {
                    self.playback_sleep(250).await;
                }
                tries += 1;
                self.update_meta();
                key_num = self
                    .meta
                    .tracks
                    .get(&nxt.track)
                    .map_or(0, |t| t.key_for_time(pkt.time));
            }
            if self.meta.live && self.key_time(nxt.track, key_num) != Some(pkt.time) {
                tracing::warn!(
                    track = nxt.track,
                    time = pkt.time,
                    "keyframe number mismatch, state inconsistent; restarting playback"
                );
                self.initial_seek().await;
                return Ok(Step::Again);
            }
            self.nxt_key_num.insert(nxt.track, key_num);
        }

        // Assume the next packet follows on this page; a zero time there
        // means we are at the live point.
        self.at_live_point = false;
        let mut next = nxt;
        next.offset += total;
        if next.offset < page_len {
            let next_time = self
                .pages
                .get(&nxt.track)
                .map_or(0, |p| packet::time_at(p.bytes(), next.offset));
            if next_time > 0 {
                next.time = next_time;
            } else {
                next.time += 1;
                self.at_live_point = true;
            }
        }
        self.replace_entry(nxt, next);
        Ok(Step::Packet(pkt))
    }

    /// A sentinel under the cursor: either the live point, the end of a
    /// VoD track, or a page boundary whose successor page must be found.
    async fn handle_sentinel(&mut self, nxt: NextEntry) -> Result<Step> {
        if nxt.time == 0 {
            self.drop_track(nxt.track, "timeless empty packet", true);
            return Ok(Step::Again);
        }
        if self.meta.is_vod() && nxt.time > self.track_lastms(nxt.track) {
            self.drop_track(nxt.track, "reached end of track", false);
            return Ok(Step::Again);
        }

        let key_num = self
            .meta
            .tracks
            .get(&nxt.track)
            .map_or(0, |t| t.key_for_time(nxt.time));
        self.nxt_key_num.insert(nxt.track, key_num);
        let next_page = self.page_num_for_key(nxt.track, key_num + 1);
        let cur_page = self.curr_key_open.get(&nxt.track).copied();

        if next_page.is_none() || next_page == cur_page {
            // The next key has not shown up on another page: we are
            // waiting for the producer.
            self.empty_count += 1;
            if self.empty_count < 100 {
                self.playback_sleep(250).await;
                if self.empty_count % 64 == 0 {
                    self.reconnect();
                } else if self.meta.live && self.empty_count % 4 == 0 {
                    self.update_meta();
                }
            } else {
                self.drop_track(nxt.track, "end of page: data wait timeout", true);
            }
            return Ok(Step::Again);
        }

        // The next key lives on another page; cross over to it.
        self.load_page_for_key(nxt.track, key_num + 1).await;
        self.nxt_key_num.insert(nxt.track, key_num + 1);
        if self.pages.contains_key(&nxt.track) {
            let next_time = self
                .pages
                .get(&nxt.track)
                .map_or(0, |p| packet::time_at(p.bytes(), 0));
            if next_time > 0 && next_time < nxt.time {
                self.drop_track(nxt.track, "end of page: time going backwards", true);
            } else {
                let time = if next_time > 0 { next_time } else { nxt.time };
                self.replace_entry(nxt, NextEntry { time, track: nxt.track, offset: 0 });
                tracing::debug!(track = nxt.track, time, "crossed to next page");
            }
        } else {
            self.drop_track(nxt.track, "next page load failure", true);
        }
        Ok(Step::Again)
    }

    fn key_time(&self, tid: u32, key_num: u64) -> Option<u64> {
        self.meta.tracks.get(&tid).and_then(|t| t.key(key_num)).map(|k| k.time)
    }

    fn replace_entry(&mut self, old: NextEntry, new: NextEntry) {
        self.buffer.remove(&old);
        self.buffer.insert(new);
    }

    /// Real-time pacing: sleeps in bounded slices until the packet's time
    /// is within `max_skip_ahead` of the pacing target. Heartbeats are
    /// refreshed every slice.
    pub async fn pace(&mut self, packet_time: u64) {
        if self.real_time == 0 {
            return;
        }
        for _ in 0..5 {
            if !Self::keep_going() {
                return;
            }
            let elapsed = self.now_ms().saturating_sub(self.first_time_ms);
            let target = elapsed * 1000 / self.real_time + self.max_skip_ahead;
            if packet_time <= target {
                return;
            }
            let wait = (packet_time - target).min(1000);
            tokio::time::sleep(Duration::from_millis(wait)).await;
            self.keep_alive();
        }
    }

    /// The look-ahead gate: blocks until every selected track has data
    /// `needs_look_ahead` ms past the packet, or the bounded wait expires
    /// — in which case look-ahead resets to zero and emission resumes.
    pub async fn await_look_ahead(&mut self, packet_time: u64) {
        if self.needs_look_ahead == 0 {
            return;
        }
        let sleep_time = self.needs_look_ahead.min(250);
        let mut tries = (self.needs_look_ahead / sleep_time) * 2 + 10_000 / sleep_time;
        let needs_time = packet_time + self.needs_look_ahead;
        let mut first = true;
        while tries > 0 && Self::keep_going() {
            tries -= 1;
            let ready = self
                .selected
                .iter()
                .all(|tid| self.meta.tracks.get(tid).is_none_or(|t| t.lastms > needs_time));
            if ready {
                return;
            }
            if first {
                first = false;
            } else {
                self.playback_sleep(sleep_time).await;
            }
            self.keep_alive();
            self.update_meta();
        }
        tracing::warn!(stream = %self.stream, "look-ahead wait timed out, resetting look-ahead");
        self.needs_look_ahead = 0;
    }
}

enum ScanOutcome {
    Found { offset: usize, time: u64 },
    Empty { offset: usize },
    Corrupt { offset: usize },
}

/// Walks records from the page start to the first one at or after `pos`.
fn scan_page(buf: &[u8], pos: u64) -> ScanOutcome {
    let mut offset = 0usize;
    loop {
        if packet::is_sentinel(buf, offset) {
            return ScanOutcome::Empty { offset };
        }
        match packet::parse_at(buf, offset) {
            Ok(Some((pkt, total))) => {
                if pkt.time >= pos {
                    return ScanOutcome::Found { offset, time: pkt.time };
                }
                offset += total;
            },
            Ok(None) => return ScanOutcome::Empty { offset },
            Err(_) => return ScanOutcome::Corrupt { offset },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::producer::Buffer;
    use crate::slots::UserPage;
    use bytes::Bytes;
    use manifold_core::Track;

    fn unique(prefix: &str) -> String {
        format!("{prefix}{}", std::process::id())
    }

    fn pkt(track: u32, time: u64, keyframe: bool, tag: u8) -> MediaPacket {
        MediaPacket { track, time, offset: 0, keyframe, data: Bytes::from(vec![tag; 16]) }
    }

    /// Builds a two-track VoD stream: video keys at 0/1000/2000 with two
    /// packets each, audio packets every 250 ms.
    fn produce_vod(stream: &str) -> (Buffer, UserPage) {
        let users = UserPage::create(stream).unwrap();
        let mut buffer = Buffer::create(stream, false, "/test.mfs").unwrap();
        buffer.add_track(Track::new(1, TrackKind::Video, "h264")).unwrap();
        buffer.add_track(Track::new(2, TrackKind::Audio, "aac")).unwrap();
        for k in 0..3u64 {
            buffer.live_packet(&pkt(1, k * 1000, true, 1)).unwrap();
            buffer.live_packet(&pkt(1, k * 1000 + 500, false, 1)).unwrap();
        }
        for i in 0..12u64 {
            buffer.live_packet(&pkt(2, i * 250, false, 2)).unwrap();
        }
        buffer.finish();
        (buffer, users)
    }

    async fn collect_all(reader: &mut Reader) -> Vec<MediaPacket> {
        let mut out = Vec::new();
        loop {
            match reader.prepare_next().await.unwrap() {
                Step::Packet(p) => out.push(p),
                Step::Again => {},
                Step::Done => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_vod_playback_order() {
        let stream = unique("rdorder");
        let (_buffer, _users) = produce_vod(&stream);

        let mut reader = Reader::connect(&stream).unwrap();
        reader.real_time = 0;
        reader.selected = BTreeSet::from([1, 2]);
        reader.seek(0, false).await;
        let packets = collect_all(&mut reader).await;

        assert_eq!(packets.len(), 18);
        // Global emission order is (time, track).
        let emitted: Vec<(u64, u32)> = packets.iter().map(|p| (p.time, p.track)).collect();
        let mut sorted = emitted.clone();
        sorted.sort_unstable();
        assert_eq!(emitted, sorted);
        // Tie-break: at t=0 and t=1000 both tracks have data; video (id 1)
        // wins.
        assert_eq!(emitted[0], (0, 1));
        // Per-track monotonicity.
        let mut last: HashMap<u32, u64> = HashMap::new();
        for p in &packets {
            assert!(last.get(&p.track).is_none_or(|&t| t <= p.time));
            last.insert(p.track, p.time);
        }
    }

    #[tokio::test]
    async fn test_seek_mid_stream() {
        let stream = unique("rdseek");
        let (_buffer, _users) = produce_vod(&stream);

        let mut reader = Reader::connect(&stream).unwrap();
        reader.real_time = 0;
        reader.selected = BTreeSet::from([1]);
        // 1700 is between keys: the video track resumes at the first
        // packet at or after the seek point.
        reader.seek(1700, false).await;
        let packets = collect_all(&mut reader).await;
        assert_eq!(packets.first().map(|p| p.time), Some(2000));
    }

    #[tokio::test]
    async fn test_seek_to_key_snaps_video() {
        let stream = unique("rdsnap");
        let (_buffer, _users) = produce_vod(&stream);

        let mut reader = Reader::connect(&stream).unwrap();
        reader.real_time = 0;
        reader.selected = BTreeSet::from([1]);
        reader.seek(1700, true).await;
        let packets = collect_all(&mut reader).await;
        assert_eq!(packets.first().map(|p| p.time), Some(1000));
    }

    #[tokio::test]
    async fn test_seek_past_end_drops_track() {
        let stream = unique("rdpast");
        let (_buffer, _users) = produce_vod(&stream);

        let mut reader = Reader::connect(&stream).unwrap();
        reader.real_time = 0;
        reader.selected = BTreeSet::from([1, 2]);
        // Audio ends at 2750; video at 2500. Seeking to 2600 keeps only
        // the audio track.
        reader.seek(2600, false).await;
        assert_eq!(reader.selected, BTreeSet::from([2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_look_ahead_blocks_until_catch_up() {
        let stream = unique("rdlook");
        let users = UserPage::create(&stream).unwrap();
        let mut buffer = Buffer::create(&stream, true, "push://test").unwrap();
        buffer.add_track(Track::new(1, TrackKind::Video, "h264")).unwrap();
        buffer.add_track(Track::new(2, TrackKind::Audio, "aac")).unwrap();
        for k in 0..10u64 {
            buffer.live_packet(&pkt(1, k * 1000, true, 1)).unwrap();
        }
        // Track 2 paused at 2000.
        for i in 0..9u64 {
            buffer.live_packet(&pkt(2, i * 250, false, 2)).unwrap();
        }

        let mut reader = Reader::connect(&stream).unwrap();
        reader.real_time = 0;
        reader.needs_look_ahead = 420;
        reader.selected = BTreeSet::from([1, 2]);

        // Emitting t=3000 requires every track past 3420; feed track 2 the
        // rest from a delayed task, as a recovering source would.
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_000)).await;
            for i in 9..40u64 {
                buffer.live_packet(&pkt(2, i * 250, false, 2)).unwrap();
            }
            buffer
        });

        let before = tokio::time::Instant::now();
        reader.await_look_ahead(3_000).await;
        // The gate had to actually wait for the delayed producer.
        assert!(before.elapsed() >= Duration::from_millis(1_900));
        assert_eq!(reader.needs_look_ahead, 420, "no timeout reset expected");
        assert!(reader.meta.tracks[&2].lastms > 3_420);

        let _buffer = producer.await.unwrap();
        drop(users);
    }

    #[tokio::test(start_paused = true)]
    async fn test_look_ahead_timeout_resets() {
        let stream = unique("rdlooktime");
        let _users = UserPage::create(&stream).unwrap();
        let mut buffer = Buffer::create(&stream, true, "push://test").unwrap();
        buffer.add_track(Track::new(1, TrackKind::Video, "h264")).unwrap();
        buffer.live_packet(&pkt(1, 0, true, 1)).unwrap();

        let mut reader = Reader::connect(&stream).unwrap();
        reader.real_time = 0;
        reader.needs_look_ahead = 420;
        reader.selected = BTreeSet::from([1]);

        // Nothing ever publishes past the gate; the bounded wait expires
        // and look-ahead resets to zero.
        reader.await_look_ahead(5_000).await;
        assert_eq!(reader.needs_look_ahead, 0);
    }

    #[tokio::test]
    async fn test_initial_seek_vod_starts_at_zero() {
        let stream = unique("rdinit");
        let (_buffer, _users) = produce_vod(&stream);
        let mut reader = Reader::connect(&stream).unwrap();
        reader.real_time = 0;
        reader.selected = BTreeSet::from([1, 2]);
        reader.initial_seek().await;
        assert_eq!(reader.current_time(), 0);
        assert!(reader.has_sought());
    }

    #[tokio::test]
    async fn test_initial_seek_live_respects_keep_away() {
        let stream = unique("rdlive");
        let _users = UserPage::create(&stream).unwrap();
        let mut buffer = Buffer::create(&stream, true, "push://test").unwrap();
        let mut video = Track::new(1, TrackKind::Video, "h264");
        video.min_keep_away = 1_500;
        buffer.add_track(video).unwrap();
        for k in 0..12u64 {
            buffer.live_packet(&pkt(1, k * 1000, true, 1)).unwrap();
        }

        let mut reader = Reader::connect(&stream).unwrap();
        reader.real_time = 0;
        reader.selected = BTreeSet::from([1]);
        reader.initial_seek().await;
        // lastms is 11000; the newest key satisfying
        // lastms >= key + keep-away(1500) is 9000.
        assert_eq!(reader.current_time(), 9_000);
    }
}
