// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The flat packet file format.
//!
//! A media file is a small preamble followed by packet records in the
//! same layout used on data pages:
//!
//! ```text
//! "MFS1" [len u32 BE] [track declarations JSON] [record]...
//! ```
//!
//! Track declarations carry id/kind/codec/init and rate parameters; keys,
//! parts, and timestamps are derived by scanning the records. The derived
//! metadata is cached next to the source as `<file>.dtsh` and regenerated
//! whenever the cache is not comfortably newer than the source.

use manifold_bus::packet::{self, HEADER_LEN};
use manifold_core::limits::HEADER_CACHE_WINDOW_SECS;
use manifold_core::{ManifoldError, MediaPacket, Result, StreamMeta, Track};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"MFS1";

/// Writes a complete media file: preamble plus all records, in order.
pub fn write_file(path: &Path, tracks: &[Track], packets: &[MediaPacket]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(MAGIC)?;
    let decl = serde_json::to_vec(tracks)
        .map_err(|e| ManifoldError::Fatal(format!("serialize track declarations: {e}")))?;
    let len = u32::try_from(decl.len())
        .map_err(|_| ManifoldError::Fatal("track declarations exceed u32".to_string()))?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(&decl)?;
    let mut buf = vec![0u8; 0];
    for pkt in packets {
        buf.resize(packet::encoded_len(pkt), 0);
        packet::encode_into(pkt, &mut buf, 0)?;
        out.write_all(&buf)?;
    }
    out.flush()?;
    Ok(())
}

/// Reads one record off a stream. `None` at a clean end of file.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<MediaPacket>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header[..4]) {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let payload_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if payload_len == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[4..])?;
    let mut record = vec![0u8; HEADER_LEN + payload_len];
    record[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut record[HEADER_LEN..])?;
    match packet::parse_at(&record, 0)? {
        Some((pkt, _)) => Ok(Some(pkt)),
        None => Ok(None),
    }
}

/// A readable media file.
pub struct FileSource {
    path: PathBuf,
    /// Tracks as declared in the preamble (no keys or timestamps).
    pub declared: Vec<Track>,
    records_at: u64,
}

impl FileSource {
    /// Opens the file and parses its preamble.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut reader = BufReader::new(File::open(&path)?);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ManifoldError::BadRequest(format!(
                "{} is not a media file (bad magic)",
                path.display()
            )));
        }
        let mut len4 = [0u8; 4];
        reader.read_exact(&mut len4)?;
        let decl_len = u32::from_be_bytes(len4) as usize;
        let mut decl = vec![0u8; decl_len];
        reader.read_exact(&mut decl)?;
        let declared: Vec<Track> = serde_json::from_slice(&decl)
            .map_err(|e| ManifoldError::Corruption(format!("track declarations: {e}")))?;
        let records_at = 8 + decl_len as u64;
        Ok(Self { path, declared, records_at })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Streams every record in file order.
    pub fn records(&self) -> Result<Records> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(self.records_at))?;
        Ok(Records { reader })
    }

    /// Builds stream metadata by scanning all records.
    pub fn build_meta(&self) -> Result<StreamMeta> {
        let mut meta = StreamMeta {
            live: false,
            source: self.path.display().to_string(),
            ..Default::default()
        };
        for track in &self.declared {
            let mut fresh = track.clone();
            fresh.keys.clear();
            fresh.parts.clear();
            fresh.fragments.clear();
            fresh.firstms = 0;
            fresh.lastms = 0;
            meta.tracks.insert(fresh.id, fresh);
        }
        for record in self.records()? {
            let pkt = record?;
            if let Some(track) = meta.tracks.get_mut(&pkt.track) {
                track.log_packet(pkt.time, pkt.data.len(), pkt.keyframe);
            }
        }
        Ok(meta)
    }

    fn cache_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".dtsh");
        PathBuf::from(os)
    }

    /// Whether the cached header is trustworthy: it must be at least the
    /// staleness window newer than the source.
    fn cache_fresh(&self) -> bool {
        let Ok(source_meta) = std::fs::metadata(&self.path) else { return false };
        let Ok(cache_meta) = std::fs::metadata(self.cache_path()) else { return false };
        match (source_meta.modified(), cache_meta.modified()) {
            (Ok(source), Ok(cache)) => {
                cache
                    .duration_since(source)
                    .map(|d| d.as_secs() >= HEADER_CACHE_WINDOW_SECS)
                    .unwrap_or(false)
            },
            _ => false,
        }
    }

    /// Loads the stream metadata, via the `.dtsh` cache when fresh.
    pub fn load_meta(&self) -> Result<StreamMeta> {
        if self.cache_fresh() {
            if let Ok(blob) = std::fs::read(self.cache_path()) {
                if let Ok(meta) = serde_json::from_slice::<StreamMeta>(&blob) {
                    tracing::debug!(path = %self.path.display(), "using cached header");
                    return Ok(meta);
                }
            }
            tracing::info!(path = %self.path.display(), "discarding unreadable header cache");
        }
        let meta = self.build_meta()?;
        self.write_cache(&meta);
        Ok(meta)
    }

    fn write_cache(&self, meta: &StreamMeta) {
        match serde_json::to_vec(meta) {
            Ok(blob) => {
                if let Err(e) = std::fs::write(self.cache_path(), blob) {
                    tracing::warn!(path = %self.path.display(), error = %e, "could not write header cache");
                }
            },
            Err(e) => tracing::warn!(error = %e, "could not serialize header cache"),
        }
    }

    /// All packets of one track with `from <= time < until`, in order.
    pub fn packets_between(&self, track: u32, from: u64, until: u64) -> Result<Vec<MediaPacket>> {
        let mut out = Vec::new();
        for record in self.records()? {
            let pkt = record?;
            if pkt.track != track {
                continue;
            }
            if pkt.time >= until {
                break;
            }
            if pkt.time >= from {
                out.push(pkt);
            }
        }
        Ok(out)
    }
}

/// Iterator over a file's records.
pub struct Records {
    reader: BufReader<File>,
}

impl Iterator for Records {
    type Item = Result<MediaPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        read_record(&mut self.reader).transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use manifold_core::TrackKind;

    fn pkt(track: u32, time: u64, keyframe: bool) -> MediaPacket {
        MediaPacket { track, time, offset: 0, keyframe, data: Bytes::from(vec![7u8; 32]) }
    }

    fn sample_file(dir: &Path) -> PathBuf {
        let path = dir.join("sample.mfs");
        let tracks = vec![
            Track::new(1, TrackKind::Video, "h264"),
            Track::new(2, TrackKind::Audio, "aac"),
        ];
        let mut packets = Vec::new();
        for k in 0..3u64 {
            packets.push(pkt(1, k * 1000, true));
            packets.push(pkt(2, k * 1000, false));
            packets.push(pkt(1, k * 1000 + 500, false));
            packets.push(pkt(2, k * 1000 + 500, false));
        }
        write_file(&path, &tracks, &packets).unwrap();
        path
    }

    #[test]
    fn test_write_then_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_file(dir.path());

        let source = FileSource::open(&path).unwrap();
        assert_eq!(source.declared.len(), 2);
        let all: Vec<MediaPacket> = source.records().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(all.len(), 12);
        assert_eq!(all[0].track, 1);
        assert!(all[0].keyframe);
    }

    #[test]
    fn test_build_meta_derives_keys() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::open(sample_file(dir.path())).unwrap();
        let meta = source.build_meta().unwrap();
        assert!(!meta.live);
        assert_eq!(meta.tracks[&1].keys.len(), 3);
        assert_eq!(meta.tracks[&1].lastms, 2_500);
        assert_eq!(meta.tracks[&2].keys.len(), 1);
        assert_eq!(meta.tracks[&2].parts.len(), 6);
    }

    #[test]
    fn test_header_cache_rejected_when_stale() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::open(sample_file(dir.path())).unwrap();
        // First load writes the cache, but a cache written moments after
        // the source is inside the staleness window and is not trusted.
        let first = source.load_meta().unwrap();
        assert!(source.cache_path().exists());
        assert!(!source.cache_fresh());
        let second = source.load_meta().unwrap();
        assert_eq!(first.tracks[&1].keys.len(), second.tracks[&1].keys.len());
    }

    #[test]
    fn test_packets_between_filters_track_and_range() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::open(sample_file(dir.path())).unwrap();
        let got = source.packets_between(1, 1000, 2_000).unwrap();
        let times: Vec<u64> = got.iter().map(|p| p.time).collect();
        assert_eq!(times, vec![1000, 1500]);
        assert!(got.iter().all(|p| p.track == 1));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-media.bin");
        std::fs::write(&path, b"GIF89a....").unwrap();
        assert!(matches!(FileSource::open(&path), Err(ManifoldError::BadRequest(_))));
    }
}
