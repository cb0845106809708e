// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The producer side of the packet bus.
//!
//! A [`Buffer`] owns every writable page of one stream: metadata, all
//! track indexes, and all data pages. Live inputs feed it packets one at a
//! time; file inputs plan pages up front and load them on demand.
//!
//! Append discipline: packets per track arrive in nondecreasing time
//! order, each record is followed by a fresh sentinel, and the sentinel is
//! overwritten by the next append. Page flips happen at key starts only,
//! once the open page holds more than the flip size (and a minimum
//! duration) or spans the target duration. Index entries are published
//! with their key count written last.

use crate::index::TrackIndex;
use crate::meta::MetaWriter;
use crate::packet;
use manifold_core::limits::{
    DATA_PAGE_SIZE, FLIP_DATA_PAGE_SIZE, FLIP_MIN_DURATION, FLIP_TARGET_DURATION,
    FRAGMENT_TARGET_DURATION, LIVE_MIN_FRAGMENTS, PAGE_USE_TTL,
};
use manifold_core::{Fragment, ManifoldError, MediaPacket, Result, StreamMeta, Track};
use manifold_shm::{names, SharedPage};
use std::collections::HashMap;

struct OpenPage {
    page: SharedPage,
    first_key: u64,
    key_count: u64,
    first_time: u64,
    payload_bytes: u64,
    offset: usize,
}

#[derive(Default)]
struct TrackState {
    open: Option<OpenPage>,
    resident: HashMap<u64, SharedPage>,
    use_count: HashMap<u64, u32>,
    frag_first_key: u64,
    frag_start_time: u64,
}

/// Writable state of one stream on the bus.
pub struct Buffer {
    stream: String,
    pub meta: StreamMeta,
    meta_writer: MetaWriter,
    indexes: HashMap<u32, TrackIndex>,
    tracks: HashMap<u32, TrackState>,
}

impl Buffer {
    /// Creates the bus pages for a stream. The caller has already claimed
    /// the stream's exclusivity semaphore.
    pub fn create(stream: &str, live: bool, source: &str) -> Result<Self> {
        let meta_writer = MetaWriter::create(stream)?;
        let meta = StreamMeta {
            live,
            source: source.to_string(),
            boot_ms_offset: 0,
            tracks: std::collections::BTreeMap::new(),
        };
        Ok(Self {
            stream: stream.to_string(),
            meta,
            meta_writer,
            indexes: HashMap::new(),
            tracks: HashMap::new(),
        })
    }

    /// Registers a track and creates its index page.
    pub fn add_track(&mut self, track: Track) -> Result<()> {
        let id = track.id;
        self.indexes.insert(id, TrackIndex::create(&self.stream, id)?);
        self.tracks.insert(id, TrackState::default());
        self.meta.tracks.insert(id, track);
        self.publish_meta()
    }

    /// Republishes the metadata page.
    pub fn publish_meta(&mut self) -> Result<()> {
        self.meta_writer.publish(&self.meta)
    }

    /// Appends one live packet, creating keys, flipping pages, and
    /// republishing metadata.
    pub fn live_packet(&mut self, pkt: &MediaPacket) -> Result<()> {
        let track = self
            .meta
            .tracks
            .get(&pkt.track)
            .ok_or_else(|| ManifoldError::NotFound(format!("track {}", pkt.track)))?;
        if !track.parts.is_empty() && pkt.time < track.lastms {
            return Err(ManifoldError::Corruption(format!(
                "time going backwards on track {}: {} < {}",
                pkt.track, pkt.time, track.lastms
            )));
        }

        if track.starts_key(pkt.time, pkt.keyframe) {
            let number = track.keys.last().map_or(1, |k| k.number + 1);
            self.prepare_page_for_key(pkt.track, number, pkt.time)?;
        }
        self.append(pkt)?;
        if let Some(track) = self.meta.tracks.get_mut(&pkt.track) {
            track.log_packet(pkt.time, pkt.data.len(), pkt.keyframe);
        }
        self.publish_meta()
    }

    /// Makes sure an open page can take the key starting at `time`:
    /// flips when the flip policy says so, extends the index entry
    /// otherwise, and closes fragments that reached their target duration.
    fn prepare_page_for_key(&mut self, track_id: u32, number: u64, time: u64) -> Result<()> {
        let state = self.tracks.entry(track_id).or_default();

        if state.frag_first_key == 0 {
            state.frag_first_key = number;
            state.frag_start_time = time;
        } else if time.saturating_sub(state.frag_start_time) >= FRAGMENT_TARGET_DURATION {
            let fragment = Fragment {
                first_key: state.frag_first_key,
                duration: time - state.frag_start_time,
            };
            if let Some(track) = self.meta.tracks.get_mut(&track_id) {
                track.fragments.push(fragment);
            }
            let state = self.tracks.entry(track_id).or_default();
            state.frag_first_key = number;
            state.frag_start_time = time;
        }

        let state = self.tracks.entry(track_id).or_default();
        let needs_flip = state.open.as_ref().is_some_and(|open| {
            let duration = time.saturating_sub(open.first_time);
            (open.payload_bytes > FLIP_DATA_PAGE_SIZE && duration > FLIP_MIN_DURATION)
                || duration > FLIP_TARGET_DURATION
        });
        if needs_flip {
            self.close_open_page(track_id);
        }

        let state = self.tracks.entry(track_id).or_default();
        let extended = state.open.as_mut().map(|open| {
            open.key_count += 1;
            (open.first_key, open.key_count)
        });
        if let Some((first_key, key_count)) = extended {
            return self.index_mut(track_id)?.update_count(first_key, key_count);
        }

        let page =
            SharedPage::create(&names::track_data(&self.stream, track_id, number), DATA_PAGE_SIZE)?;
        let state = self.tracks.entry(track_id).or_default();
        state.open = Some(OpenPage {
            page,
            first_key: number,
            key_count: 1,
            first_time: time,
            payload_bytes: 0,
            offset: 0,
        });
        tracing::debug!(stream = %self.stream, track = track_id, first_key = number, "opened data page");
        self.index_mut(track_id)?.publish(number, 1)
    }

    fn append(&mut self, pkt: &MediaPacket) -> Result<()> {
        let state = self
            .tracks
            .get_mut(&pkt.track)
            .ok_or_else(|| ManifoldError::NotFound(format!("track {}", pkt.track)))?;
        let open = state.open.as_mut().ok_or_else(|| {
            ManifoldError::Fatal(format!("no open page for track {}", pkt.track))
        })?;

        let buf = open.page.bytes_mut()?;
        let written = packet::encode_into(pkt, buf, open.offset)?;
        packet::write_sentinel(buf, open.offset + written);
        open.offset += written;
        open.payload_bytes += pkt.data.len() as u64;
        Ok(())
    }

    fn close_open_page(&mut self, track_id: u32) {
        if let Some(state) = self.tracks.get_mut(&track_id) {
            if let Some(open) = state.open.take() {
                tracing::debug!(
                    stream = %self.stream,
                    track = track_id,
                    first_key = open.first_key,
                    keys = open.key_count,
                    bytes = open.payload_bytes,
                    "closed data page"
                );
                state.use_count.insert(open.first_key, PAGE_USE_TTL);
                state.resident.insert(open.first_key, open.page);
            }
        }
    }

    /// Computes page boundaries for a fully known track, using the same
    /// flip predicate as the live path. Returns `(firstKey, keyCount)`
    /// pairs covering every key.
    pub fn page_plan(track: &Track) -> Vec<(u64, u64)> {
        let mut plan = Vec::new();
        let mut first = match track.keys.first() {
            Some(k) => k.number,
            None => return plan,
        };
        let mut count = 0u64;
        let mut bytes = 0u64;
        let mut start_time = track.keys.first().map_or(0, |k| k.time);

        for key in &track.keys {
            count += 1;
            bytes += track.bytes_in_key(key.number);
            let duration = key.time.saturating_sub(start_time);
            if (bytes > FLIP_DATA_PAGE_SIZE || duration > FLIP_TARGET_DURATION)
                && duration > FLIP_MIN_DURATION
            {
                plan.push((first, count));
                first = key.number + 1;
                count = 0;
                bytes = 0;
                start_time = key.time;
            }
        }
        if count > 0 {
            plan.push((first, count));
        }
        plan
    }

    /// Whether the page holding the given key is resident.
    pub fn is_buffered(&self, track_id: u32, key: u64) -> bool {
        self.indexes.get(&track_id).is_some_and(|idx| idx.page_for_key(key).is_some())
    }

    /// Writes one complete VoD page from pre-read packets. The index entry
    /// is published only after the page content is in place.
    pub fn buffer_page(
        &mut self,
        track_id: u32,
        first_key: u64,
        key_count: u64,
        packets: impl IntoIterator<Item = MediaPacket>,
    ) -> Result<()> {
        let mut page =
            SharedPage::create(&names::track_data(&self.stream, track_id, first_key), DATA_PAGE_SIZE)?;
        let mut offset = 0usize;
        let mut count = 0u64;
        {
            let buf = page.bytes_mut()?;
            for pkt in packets {
                offset += packet::encode_into(&pkt, buf, offset)?;
                count += 1;
            }
            packet::write_sentinel(buf, offset);
        }

        let state = self.tracks.entry(track_id).or_default();
        state.resident.insert(first_key, page);
        state.use_count.insert(first_key, PAGE_USE_TTL);
        self.index_mut(track_id)?.publish(first_key, key_count)?;
        tracing::debug!(
            stream = %self.stream,
            track = track_id,
            first_key,
            keys = key_count,
            packets = count,
            "buffered page"
        );
        Ok(())
    }

    /// Marks the page holding the given key as recently used.
    pub fn touch(&mut self, track_id: u32, key: u64) {
        let Some(first_key) = self.indexes.get(&track_id).and_then(|idx| idx.page_for_key(key))
        else {
            return;
        };
        if let Some(state) = self.tracks.get_mut(&track_id) {
            state.use_count.insert(first_key, PAGE_USE_TTL);
        }
    }

    /// One service tick: ages page use counters and evicts pages nobody
    /// hinted at recently. Live pages overlapping the newest fragments are
    /// never evicted, so every reader can still reach the live point.
    pub fn tick(&mut self) {
        for (&track_id, state) in &mut self.tracks {
            let floor_key = self.meta.tracks.get(&track_id).map_or(0, |track| {
                track
                    .fragments
                    .len()
                    .checked_sub(LIVE_MIN_FRAGMENTS)
                    .and_then(|i| track.fragments.get(i))
                    .map_or_else(|| track.keys.first().map_or(0, |k| k.number), |f| f.first_key)
            });

            let mut evict = Vec::new();
            for (&first_key, count) in &mut state.use_count {
                *count = count.saturating_sub(1);
                if *count > 0 {
                    continue;
                }
                let key_count = self
                    .indexes
                    .get(&track_id)
                    .and_then(|idx| {
                        idx.entries().iter().find(|&&(f, _)| f == first_key).map(|&(_, c)| c)
                    })
                    .unwrap_or(0);
                let protected = self.meta.live && first_key + key_count > floor_key;
                if !protected && state.resident.contains_key(&first_key) {
                    evict.push(first_key);
                }
            }
            for first_key in evict {
                // Clearing the index slot first upholds the consumer
                // contract: a page is unreachable before it is unmapped.
                if let Some(idx) = self.indexes.get_mut(&track_id) {
                    let _ = idx.clear(first_key);
                }
                state.resident.remove(&first_key);
                state.use_count.remove(&first_key);
                tracing::debug!(stream = %self.stream, track = track_id, first_key, "evicted page");
            }
        }
    }

    /// Flushes fragment state and releases all pages. The master drops
    /// unlink every page of the stream.
    pub fn finish(&mut self) {
        let track_ids: Vec<u32> = self.tracks.keys().copied().collect();
        for id in track_ids {
            self.close_open_page(id);
        }
        let _ = self.publish_meta();
    }

    fn index_mut(&mut self, track_id: u32) -> Result<&mut TrackIndex> {
        self.indexes
            .get_mut(&track_id)
            .ok_or_else(|| ManifoldError::NotFound(format!("index for track {track_id}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::meta::read_meta;
    use bytes::Bytes;
    use manifold_core::{Key, TrackKind};

    fn unique(prefix: &str) -> String {
        format!("{prefix}{}", std::process::id())
    }

    fn video_packet(time: u64, keyframe: bool, len: usize) -> MediaPacket {
        MediaPacket {
            track: 1,
            time,
            offset: 0,
            keyframe,
            data: Bytes::from(vec![0xABu8; len]),
        }
    }

    fn live_buffer(stream: &str) -> Buffer {
        let mut buffer = Buffer::create(stream, true, "push://test").unwrap();
        buffer.add_track(Track::new(1, TrackKind::Video, "h264")).unwrap();
        buffer
    }

    #[test]
    fn test_live_append_updates_meta() {
        let stream = unique("prodmeta");
        let mut buffer = live_buffer(&stream);
        buffer.live_packet(&video_packet(0, true, 100)).unwrap();
        buffer.live_packet(&video_packet(40, false, 100)).unwrap();
        buffer.live_packet(&video_packet(80, false, 100)).unwrap();

        let meta = read_meta(&stream).unwrap();
        let track = &meta.tracks[&1];
        assert_eq!(track.lastms, 80);
        assert_eq!(track.keys.len(), 1);
        assert_eq!(track.keys[0].parts, 3);
        assert_eq!(track.parts.len(), 3);
        // The earlier parts learned their durations from their successors.
        assert_eq!(track.parts[0].duration, 40);
        assert_eq!(track.parts[2].duration, 0);
    }

    #[test]
    fn test_time_going_backwards_rejected() {
        let stream = unique("prodback");
        let mut buffer = live_buffer(&stream);
        buffer.live_packet(&video_packet(1000, true, 10)).unwrap();
        let err = buffer.live_packet(&video_packet(500, false, 10)).unwrap_err();
        assert!(matches!(err, ManifoldError::Corruption(_)));
    }

    #[test]
    fn test_page_flip_on_size() {
        let stream = unique("prodflip");
        let mut buffer = live_buffer(&stream);
        // Key every second, just over 2 MiB per key: four keys cross the
        // 8 MiB flip threshold with more than a second on the page, so the
        // fifth keyframe opens a new page.
        let chunk = 2 * 1024 * 1024 + 4096;
        for k in 0..5u64 {
            buffer.live_packet(&video_packet(k * 1000, true, chunk)).unwrap();
        }

        let index = TrackIndex::open(&stream, 1).unwrap();
        let mut entries = index.entries();
        entries.sort_unstable();
        assert_eq!(entries.len(), 2);
        let (first_a, count_a) = entries[0];
        let (first_b, _) = entries[1];
        // The new page starts exactly one key past the previous page.
        assert_eq!(first_b, first_a + count_a);
        assert_eq!(first_a, 1);
        assert_eq!(count_a, 4);
        assert_eq!(first_b, 5);
    }

    #[test]
    fn test_page_flip_on_duration() {
        let stream = unique("proddur");
        let mut buffer = live_buffer(&stream);
        // Tiny packets, keys 3 seconds apart: duration alone forces the
        // flip once a page spans more than 5 seconds.
        for k in 0..4u64 {
            buffer.live_packet(&video_packet(k * 3000, true, 64)).unwrap();
        }
        let index = TrackIndex::open(&stream, 1).unwrap();
        assert!(index.entries().len() > 1);
    }

    #[test]
    fn test_audio_keys_by_interval() {
        let stream = unique("prodaud");
        let mut buffer = Buffer::create(&stream, true, "push://test").unwrap();
        buffer.add_track(Track::new(2, TrackKind::Audio, "aac")).unwrap();
        for i in 0..300u64 {
            let pkt = MediaPacket {
                track: 2,
                time: i * 20,
                offset: 0,
                keyframe: false,
                data: Bytes::from_static(b"aacframe"),
            };
            buffer.live_packet(&pkt).unwrap();
        }
        let meta = read_meta(&stream).unwrap();
        // 6 seconds of audio at a 5-second key interval: two keys.
        assert_eq!(meta.tracks[&2].keys.len(), 2);
    }

    #[test]
    fn test_page_plan_covers_all_keys() {
        let mut track = Track::new(1, TrackKind::Video, "h264");
        for n in 1..=20u64 {
            track.keys.push(Key {
                number: n,
                time: (n - 1) * 1000,
                parts: n * 2,
                size: n * 1024 * 1024, // 1 MiB per key
            });
        }
        let plan = Buffer::page_plan(&track);
        assert!(!plan.is_empty());
        // Contiguity: each page starts where the previous ended.
        let mut expected_first = 1;
        let mut covered = 0;
        for &(first, count) in &plan {
            assert_eq!(first, expected_first);
            expected_first = first + count;
            covered += count;
        }
        assert_eq!(covered, 20);
    }

    #[test]
    fn test_eviction_clears_index_after_ttl() {
        let stream = unique("prodevict");
        let mut buffer = live_buffer(&stream);
        // Build several pages via duration flips.
        for k in 0..10u64 {
            buffer.live_packet(&video_packet(k * 3000, true, 64)).unwrap();
        }
        let pages_before = {
            let index = TrackIndex::open(&stream, 1).unwrap();
            index.entries().len()
        };
        assert!(pages_before > 2);

        // Age everything out; the fragment floor protects the newest pages.
        for _ in 0..=PAGE_USE_TTL {
            buffer.tick();
        }
        let index = TrackIndex::open(&stream, 1).unwrap();
        assert!(index.entries().len() < pages_before);
        assert!(index.highest_page().is_some());
    }

    #[test]
    fn test_touch_keeps_page_resident() {
        let stream = unique("prodtouch");
        let mut buffer = live_buffer(&stream);
        for k in 0..10u64 {
            buffer.live_packet(&video_packet(k * 3000, true, 64)).unwrap();
        }
        for _ in 0..PAGE_USE_TTL {
            buffer.touch(1, 1);
            buffer.tick();
        }
        let index = TrackIndex::open(&stream, 1).unwrap();
        assert_eq!(index.page_for_key(1), Some(1));
    }
}
