// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core data types shared by inputs, outputs, and the controller.
//!
//! This module defines the media data model that travels through shared
//! memory:
//! - [`MediaPacket`]: one self-describing media record
//! - [`Track`]: a numbered media stream with its keys, parts, and fragments
//! - [`Key`]: a keyframe boundary, the seek unit
//! - [`Fragment`]: a producer-declared grouping of keys for segmenters
//! - [`StreamMeta`]: the serialized content of a stream's metadata page

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
    Meta,
}

impl TrackKind {
    /// The lowercase name used in track specifications and capability
    /// templates.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
            Self::Meta => "meta",
        }
    }
}

/// One media record: payload plus the header fields every packet carries on
/// a data page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    /// Track this packet belongs to.
    pub track: u32,
    /// Presentation time in milliseconds.
    pub time: u64,
    /// Decode-time offset in milliseconds (B-frame reordering), if any.
    pub offset: i32,
    /// Whether this packet starts a keyframe.
    pub keyframe: bool,
    /// Raw payload bytes. `Bytes`-backed so fan-out clones stay cheap.
    pub data: Bytes,
}

/// A keyframe boundary within a track.
///
/// Keys are numbered from 1 and partition the track into seekable units.
/// `parts` and `size` are cumulative through this key, so the part count
/// before key `k` is simply `keys[k-2].parts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// 1-based, strictly increasing key number.
    pub number: u64,
    /// Presentation time of the keyframe in milliseconds.
    pub time: u64,
    /// Cumulative packet (part) count through this key.
    pub parts: u64,
    /// Cumulative payload byte size through this key.
    pub size: u64,
}

/// Timing and size of one packet, as recorded in the track metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Payload size in bytes.
    pub size: u32,
    /// Duration in milliseconds until the next part of this track.
    pub duration: u32,
}

/// A grouping of contiguous keys targeted at segmented containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Number of the first key in this fragment.
    pub first_key: u64,
    /// Total duration covered by the fragment in milliseconds.
    pub duration: u64,
}

mod init_bytes {
    //! Track init blobs are raw codec data; base64 keeps them intact inside
    //! the JSON-serialized metadata page.
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes.as_ref()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}

/// A numbered media stream within a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: u32,
    pub kind: TrackKind,
    /// Codec name, lowercase (`h264`, `aac`, `opus`, `subtitle`, ...).
    pub codec: String,
    /// Codec initialization blob (SPS/PPS, AudioSpecificConfig, ...).
    #[serde(with = "init_bytes", default)]
    pub init: Bytes,
    /// Sampling rate in Hz for audio, 0 otherwise.
    #[serde(default)]
    pub rate: u32,
    /// Channel count for audio, 0 otherwise.
    #[serde(default)]
    pub channels: u16,
    /// Sample size in bits for audio, 0 otherwise.
    #[serde(default)]
    pub sample_size: u16,
    /// Frames per kilosecond for video, 0 otherwise.
    #[serde(default)]
    pub fpks: u32,
    /// ISO-639-2 three-letter language tag, empty when unknown.
    #[serde(default)]
    pub lang: String,
    /// First available presentation timestamp in milliseconds.
    pub firstms: u64,
    /// Last available presentation timestamp in milliseconds.
    pub lastms: u64,
    /// Producer-declared safety margin in milliseconds between the publish
    /// frontier and the readable frontier.
    #[serde(default)]
    pub min_keep_away: u64,
    pub keys: Vec<Key>,
    pub fragments: Vec<Fragment>,
    pub parts: Vec<Part>,
}

impl Track {
    /// Creates an empty track of the given id and kind/codec.
    pub fn new(id: u32, kind: TrackKind, codec: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            codec: codec.into(),
            init: Bytes::new(),
            rate: 0,
            channels: 0,
            sample_size: 0,
            fpks: 0,
            lang: String::new(),
            firstms: 0,
            lastms: 0,
            min_keep_away: 0,
            keys: Vec::new(),
            fragments: Vec::new(),
            parts: Vec::new(),
        }
    }

    /// Returns the key with the given 1-based number, if still listed.
    pub fn key(&self, number: u64) -> Option<&Key> {
        // Keys are dense, so the lookup is an index calculation off the
        // first retained key.
        let first = self.keys.first()?.number;
        if number < first {
            return None;
        }
        let idx = usize::try_from(number - first).ok()?;
        self.keys.get(idx)
    }

    /// Number of the key holding `time`: the greatest key with
    /// `key.time <= time`, bumped by one when `time` falls after the last
    /// part of that key.
    pub fn key_for_time(&self, time: u64) -> u64 {
        let Some(first) = self.keys.first() else {
            return 0;
        };
        let mut key_no = first.number;
        let mut part_count = 0u64;
        let mut next_key = None;
        for key in &self.keys {
            if key.time > time {
                next_key = Some(key);
                break;
            }
            key_no = key.number;
            part_count = key.parts;
        }
        // Time past the last part of the chosen key belongs to the key that
        // follows it.
        if part_count > 0 {
            if let Some(next) = next_key {
                let last_part = self.parts.get(usize::try_from(part_count).unwrap_or(usize::MAX).saturating_sub(1));
                if let Some(part) = last_part {
                    if time > next.time.saturating_sub(u64::from(part.duration)) {
                        key_no += 1;
                    }
                }
            }
        }
        key_no
    }

    /// Whether a packet at `time` would start a new key: video keys start
    /// at keyframes, all other kinds at fixed intervals.
    pub fn starts_key(&self, time: u64, keyframe: bool) -> bool {
        let Some(last) = self.keys.last() else {
            return true;
        };
        match self.kind {
            TrackKind::Video => keyframe,
            _ => time.saturating_sub(last.time) >= crate::limits::AUDIO_KEY_INTERVAL,
        }
    }

    /// Records one packet in the track metadata: creates the key when
    /// needed, appends the part, fills in the previous part's duration,
    /// and advances the timestamps. Returns true when a new key started.
    pub fn log_packet(&mut self, time: u64, size: usize, keyframe: bool) -> bool {
        let started = self.starts_key(time, keyframe);
        if started {
            let number = self.keys.last().map_or(1, |k| k.number + 1);
            let (parts, key_size) = self.keys.last().map_or((0, 0), |k| (k.parts, k.size));
            self.keys.push(Key { number, time, parts, size: key_size });
        }
        if self.parts.is_empty() {
            self.firstms = time;
        } else {
            let gap = time.saturating_sub(self.lastms);
            if let Some(prev) = self.parts.last_mut() {
                prev.duration = u32::try_from(gap).unwrap_or(u32::MAX);
            }
        }
        self.parts.push(Part { size: u32::try_from(size).unwrap_or(u32::MAX), duration: 0 });
        self.lastms = time;
        if let Some(key) = self.keys.last_mut() {
            key.parts += 1;
            key.size += size as u64;
        }
        started
    }

    /// Parts contained in the key with the given number (non-cumulative).
    pub fn parts_in_key(&self, number: u64) -> u64 {
        let Some(key) = self.key(number) else { return 0 };
        let prev = number
            .checked_sub(1)
            .and_then(|n| self.key(n))
            .map_or(0, |k| k.parts);
        key.parts.saturating_sub(prev)
    }

    /// Payload bytes contained in the key with the given number.
    pub fn bytes_in_key(&self, number: u64) -> u64 {
        let Some(key) = self.key(number) else { return 0 };
        let prev = number
            .checked_sub(1)
            .and_then(|n| self.key(n))
            .map_or(0, |k| k.size);
        key.size.saturating_sub(prev)
    }
}

/// Stream-level attributes plus the full track list, as published on the
/// metadata page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMeta {
    /// True for live streams; false means video-on-demand.
    pub live: bool,
    /// Source URI this stream was started from.
    #[serde(default)]
    pub source: String,
    /// Wall-clock anchor: unix milliseconds corresponding to media time 0.
    #[serde(default)]
    pub boot_ms_offset: i64,
    /// All currently mapped tracks, keyed by track id.
    pub tracks: BTreeMap<u32, Track>,
}

impl StreamMeta {
    pub const fn is_vod(&self) -> bool {
        !self.live
    }

    /// Duration of the longest fragment across all tracks, in milliseconds.
    /// Live inputs linger for twice this long before shutting down idle.
    pub fn biggest_fragment(&self) -> u64 {
        self.tracks
            .values()
            .flat_map(|t| t.fragments.iter())
            .map(|f| f.duration)
            .max()
            .unwrap_or(0)
    }

    /// Most recent timestamp across the given tracks, or all tracks when
    /// the selection is empty.
    pub fn last_ms<'a>(&self, selection: impl IntoIterator<Item = &'a u32>) -> u64 {
        let mut sel = selection.into_iter().peekable();
        if sel.peek().is_none() {
            return self.tracks.values().map(|t| t.lastms).max().unwrap_or(0);
        }
        sel.filter_map(|id| self.tracks.get(id)).map(|t| t.lastms).max().unwrap_or(0)
    }

    /// Earliest timestamp across the given tracks, or all tracks when the
    /// selection is empty.
    pub fn first_ms<'a>(&self, selection: impl IntoIterator<Item = &'a u32>) -> u64 {
        let mut sel = selection.into_iter().peekable();
        if sel.peek().is_none() {
            return self.tracks.values().map(|t| t.firstms).min().unwrap_or(0);
        }
        sel.filter_map(|id| self.tracks.get(id)).map(|t| t.firstms).min().unwrap_or(0)
    }
}
