// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Track selection.
//!
//! Clients describe the tracks they want per kind as a comma-separated
//! list of track ids, `all`/`*`, language codes, or codec names. When a
//! kind has no specification, the default selection picks the codec
//! template from the connector's capabilities that maximizes the number of
//! simultaneously selectable tracks, honoring per-codec user-agent
//! exceptions.

use manifold_core::capa::{codec_allowed, ConnectorDescriptor};
use manifold_core::{StreamMeta, Track, TrackKind};
use std::collections::BTreeSet;

/// Expands a 2-letter ISO-639-1 code to its 3-letter ISO-639-2 form.
/// Unknown codes pass through unchanged.
pub fn two_to_three(code: &str) -> &str {
    match code {
        "aa" => "aar",
        "ab" => "abk",
        "af" => "afr",
        "ar" => "ara",
        "bg" => "bul",
        "bn" => "ben",
        "ca" => "cat",
        "cs" => "ces",
        "da" => "dan",
        "de" => "deu",
        "el" => "ell",
        "en" => "eng",
        "es" => "spa",
        "et" => "est",
        "eu" => "eus",
        "fa" => "fas",
        "fi" => "fin",
        "fr" => "fra",
        "he" => "heb",
        "hi" => "hin",
        "hr" => "hrv",
        "hu" => "hun",
        "id" => "ind",
        "it" => "ita",
        "ja" => "jpn",
        "ko" => "kor",
        "lt" => "lit",
        "lv" => "lav",
        "nb" => "nob",
        "nl" => "nld",
        "no" => "nor",
        "pl" => "pol",
        "pt" => "por",
        "ro" => "ron",
        "ru" => "rus",
        "sk" => "slk",
        "sl" => "slv",
        "sr" => "srp",
        "sv" => "swe",
        "th" => "tha",
        "tr" => "tur",
        "uk" => "ukr",
        "vi" => "vie",
        "zh" => "zho",
        other => other,
    }
}

fn track_is_kind(track: &Track, kind: TrackKind) -> bool {
    track.kind == kind || track.codec == kind.as_str()
}

/// Applies one selection specification for one kind, adding matching
/// track ids to `selected`. Elements that match nothing are ignored.
pub fn select_spec(meta: &StreamMeta, kind: TrackKind, spec: &str, selected: &mut BTreeSet<u32>) {
    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() || item == "0" || item == "none" {
            continue;
        }
        if let Ok(id) = item.parse::<u32>() {
            match meta.tracks.get(&id) {
                Some(track) if track_is_kind(track, kind) => {
                    selected.insert(id);
                },
                Some(track) => {
                    tracing::info!(id, kind = kind.as_str(), actual = track.kind.as_str(), "track kind mismatch, not selecting");
                },
                None => {
                    tracing::info!(id, "track does not exist in stream, cannot select");
                },
            }
            continue;
        }
        let lowered = item.to_ascii_lowercase();
        if lowered == "all" || lowered == "*" {
            selected.extend(
                meta.tracks.values().filter(|t| track_is_kind(t, kind)).map(|t| t.id),
            );
            continue;
        }
        // Language or codec matching; 2-letter language codes expand.
        let wanted = if lowered.len() == 2 { two_to_three(&lowered).to_string() } else { lowered };
        for track in meta.tracks.values().filter(|t| track_is_kind(t, kind)) {
            if track.lang == wanted || track.codec.to_ascii_lowercase() == wanted {
                selected.insert(track.id);
            }
        }
    }
}

/// Explicit per-kind selections plus the client's user agent.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectionPrefs<'a> {
    pub video: Option<&'a str>,
    pub audio: Option<&'a str>,
    pub subtitle: Option<&'a str>,
    pub user_agent: &'a str,
}

struct Entry<'a> {
    by_kind: bool,
    multi: bool,
    name: &'a str,
}

fn parse_entry(raw: &str) -> Entry<'_> {
    let mut name = raw;
    let by_kind = name.starts_with('@');
    if by_kind {
        name = &name[1..];
    }
    let multi = name.starts_with('+');
    if multi {
        name = &name[1..];
    }
    Entry { by_kind, multi, name }
}

fn entry_matches(entry: &Entry<'_>, track: &Track) -> bool {
    entry.name == "*"
        || if entry.by_kind { track.kind.as_str() == entry.name } else { track.codec == entry.name }
}

/// Whether the track survives the auto-seek bound: a live reconnect must
/// not pick tracks that ended more than six seconds before the target.
fn in_seek_bounds(track: &Track, seek_target: Option<u64>) -> bool {
    seek_target.is_none_or(|target| track.lastms >= target.max(6_000) - 6_000)
}

/// Computes the selected track set.
///
/// Explicit specifications are honored first; the remaining kinds are
/// filled from the connector's best codec template. Live streams prefer
/// the newest matching tracks, VoD the oldest.
pub fn select_default(
    meta: &StreamMeta,
    connector: &ConnectorDescriptor,
    prefs: &SelectionPrefs<'_>,
    seek_target: Option<u64>,
) -> BTreeSet<u32> {
    let mut selected = BTreeSet::new();
    let mut fixed_kinds: Vec<TrackKind> = Vec::new();
    for (kind, spec) in [
        (TrackKind::Video, prefs.video),
        (TrackKind::Audio, prefs.audio),
        (TrackKind::Subtitle, prefs.subtitle),
    ] {
        if let Some(spec) = spec.filter(|s| !s.is_empty()) {
            select_spec(meta, kind, spec, &mut selected);
            fixed_kinds.push(kind);
        }
    }
    selected.retain(|id| meta.tracks.get(id).is_some_and(|t| in_seek_bounds(t, seek_target)));

    // Rank templates by how many of the already selected tracks they can
    // carry; only templates carrying all of them qualify.
    let mut best: Option<&Vec<Vec<String>>> = None;
    let mut best_count = 0usize;
    for template in &connector.codecs {
        let mut covered = 0usize;
        for &id in &selected {
            let Some(track) = meta.tracks.get(&id) else { continue };
            let ok = template.iter().flatten().any(|raw| {
                let entry = parse_entry(raw);
                entry_matches(&entry, track)
                    && codec_allowed(&connector.exceptions, entry.name, prefs.user_agent)
            });
            if ok {
                covered += 1;
            }
        }
        if covered == selected.len() && (best.is_none() || covered > best_count) {
            best = Some(template);
            best_count = covered;
        }
    }

    let Some(template) = best else {
        return selected;
    };

    // Fill every group of the template that is not already satisfied.
    for group in template {
        let found = selected.iter().any(|id| {
            meta.tracks
                .get(id)
                .is_some_and(|t| group.iter().any(|raw| entry_matches(&parse_entry(raw), t)))
        });
        let multi_group = group.iter().any(|raw| parse_entry(raw).multi);
        if found && !multi_group {
            continue;
        }
        for raw in group {
            let entry = parse_entry(raw);
            if found && !entry.multi {
                continue;
            }
            let mut candidates: Vec<&Track> = meta
                .tracks
                .values()
                .filter(|t| entry_matches(&entry, t))
                .filter(|t| in_seek_bounds(t, seek_target))
                .filter(|t| !fixed_kinds.contains(&t.kind))
                .filter(|t| codec_allowed(&connector.exceptions, entry.name, prefs.user_agent))
                .collect();
            if meta.live {
                candidates.reverse();
            }
            let mut hit = false;
            for track in candidates {
                selected.insert(track.id);
                hit = true;
                if !entry.multi {
                    break;
                }
            }
            if hit && !entry.multi {
                break;
            }
        }
    }

    if selected.is_empty() && !meta.tracks.is_empty() {
        tracing::warn!(total = meta.tracks.len(), "no tracks selected for stream");
    }
    selected
}

/// The main track drives seeking: the first selected video track, falling
/// back to the lowest selected id.
pub fn main_track(meta: &StreamMeta, selected: &BTreeSet<u32>) -> Option<u32> {
    selected
        .iter()
        .find(|id| meta.tracks.get(id).is_some_and(|t| t.kind == TrackKind::Video))
        .or_else(|| selected.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::capa::UaException;

    fn meta() -> StreamMeta {
        let mut meta = StreamMeta { live: false, ..Default::default() };
        let mut v = Track::new(1, TrackKind::Video, "h264");
        v.lastms = 60_000;
        let mut a_en = Track::new(2, TrackKind::Audio, "aac");
        a_en.lang = "eng".to_string();
        a_en.lastms = 60_000;
        let mut a_nl = Track::new(3, TrackKind::Audio, "aac");
        a_nl.lang = "nld".to_string();
        a_nl.lastms = 60_000;
        let mut s = Track::new(4, TrackKind::Subtitle, "subtitle");
        s.lastms = 60_000;
        meta.tracks.insert(1, v);
        meta.tracks.insert(2, a_en);
        meta.tracks.insert(3, a_nl);
        meta.tracks.insert(4, s);
        meta
    }

    fn connector() -> ConnectorDescriptor {
        ConnectorDescriptor {
            name: "raw".to_string(),
            codecs: vec![vec![
                vec!["h264".to_string()],
                vec!["aac".to_string(), "opus".to_string()],
            ]],
            ..Default::default()
        }
    }

    #[test]
    fn test_spec_by_id() {
        let meta = meta();
        let mut sel = BTreeSet::new();
        select_spec(&meta, TrackKind::Audio, "2", &mut sel);
        assert_eq!(sel, BTreeSet::from([2]));
        // A video id under an audio spec is refused.
        select_spec(&meta, TrackKind::Audio, "1", &mut sel);
        assert_eq!(sel, BTreeSet::from([2]));
    }

    #[test]
    fn test_spec_all_and_star() {
        let meta = meta();
        let mut sel = BTreeSet::new();
        select_spec(&meta, TrackKind::Audio, "all", &mut sel);
        assert_eq!(sel, BTreeSet::from([2, 3]));
        let mut sel = BTreeSet::new();
        select_spec(&meta, TrackKind::Audio, "*", &mut sel);
        assert_eq!(sel, BTreeSet::from([2, 3]));
    }

    #[test]
    fn test_spec_two_letter_language() {
        let meta = meta();
        let mut sel = BTreeSet::new();
        select_spec(&meta, TrackKind::Audio, "nl", &mut sel);
        assert_eq!(sel, BTreeSet::from([3]));
    }

    #[test]
    fn test_spec_codec_and_comma_list() {
        let meta = meta();
        let mut sel = BTreeSet::new();
        select_spec(&meta, TrackKind::Audio, "en,aac", &mut sel);
        assert_eq!(sel, BTreeSet::from([2, 3]));
    }

    #[test]
    fn test_default_fills_template() {
        let meta = meta();
        let sel = select_default(&meta, &connector(), &SelectionPrefs::default(), None);
        // One video plus one audio; VoD picks the oldest (lowest id) audio.
        assert_eq!(sel, BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_default_live_prefers_newest() {
        let mut meta = meta();
        meta.live = true;
        let sel = select_default(&meta, &connector(), &SelectionPrefs::default(), None);
        assert!(sel.contains(&1));
        assert!(sel.contains(&3), "live selection should pick the newest audio track");
    }

    #[test]
    fn test_explicit_audio_respected() {
        let meta = meta();
        let prefs = SelectionPrefs { audio: Some("3"), ..Default::default() };
        let sel = select_default(&meta, &connector(), &prefs, None);
        assert!(sel.contains(&3));
        assert!(!sel.contains(&2));
        assert!(sel.contains(&1));
    }

    #[test]
    fn test_ua_exception_blocks_codec() {
        let meta = meta();
        let mut conn = connector();
        conn.exceptions.insert(
            "codec:h264".to_string(),
            vec![UaException { blacklist: true, matches: vec!["OldPlayer".to_string()] }],
        );
        let prefs = SelectionPrefs { user_agent: "OldPlayer/1.0", ..Default::default() };
        let sel = select_default(&meta, &conn, &prefs, None);
        assert!(!sel.contains(&1), "blacklisted codec must not be auto-selected");
        assert!(sel.contains(&2));
    }

    #[test]
    fn test_seek_bound_drops_stale_track() {
        let mut meta = meta();
        meta.live = true;
        meta.tracks.get_mut(&3).expect("track").lastms = 1_000;
        let sel = select_default(&meta, &connector(), &SelectionPrefs::default(), Some(30_000));
        assert!(!sel.contains(&3), "track far behind the seek target is unusable");
    }

    #[test]
    fn test_kind_entry_matches_by_kind() {
        let meta = meta();
        let conn = ConnectorDescriptor {
            name: "raw".to_string(),
            codecs: vec![vec![vec!["@video".to_string()]]],
            ..Default::default()
        };
        let sel = select_default(&meta, &conn, &SelectionPrefs::default(), None);
        assert_eq!(sel, BTreeSet::from([1]));
    }

    #[test]
    fn test_main_track_prefers_video() {
        let meta = meta();
        assert_eq!(main_track(&meta, &BTreeSet::from([2, 1])), Some(1));
        assert_eq!(main_track(&meta, &BTreeSet::from([2, 3])), Some(2));
        assert_eq!(main_track(&meta, &BTreeSet::new()), None);
    }
}
