// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The output run loop: ensure the input is live, attach to the bus,
//! select tracks, seek, then pump packets through the sink with pacing
//! and look-ahead applied.

use crate::sink::ContainerSink;
use manifold_bus::{Reader, SelectionPrefs, Step};
use manifold_core::capa::ConnectorDescriptor;
use manifold_core::limits::IDLE_DISCONNECT_SECS;
use manifold_core::{runtime, ManifoldError, Result};
use manifold_stats::{StatHandle, StatRecord};
use manifold_stream::{checked_name, start_input, stream_alive, StartOptions};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Everything the run loop needs to know about this connection.
#[derive(Debug, Clone, Default)]
pub struct OutputOptions {
    pub stream: String,
    pub noinput: bool,
    pub seek: Option<u64>,
    pub real_time: u64,
    pub look_ahead: u64,
    pub video: Option<String>,
    pub audio: Option<String>,
    pub subtitle: Option<String>,
    pub user_agent: String,
    /// Writing to a file target makes this an automation output in the
    /// statistics.
    pub to_file: bool,
}

/// Fallback connector when no controller has published capabilities:
/// select every track.
fn default_connector() -> ConnectorDescriptor {
    ConnectorDescriptor {
        name: "raw".to_string(),
        codecs: vec![vec![vec!["+*".to_string()]]],
        ..Default::default()
    }
}

/// A live stream is worth playing once its main track has at least two
/// keyframes or spans more than five seconds.
fn ready_for_play(reader: &Reader) -> bool {
    let Some(main) = manifold_bus::main_track(&reader.meta, &reader.selected) else {
        return false;
    };
    reader.meta.tracks.get(&main).is_some_and(|t| {
        t.keys.len() >= 2 || t.lastms.saturating_sub(t.firstms) > 5_000
    })
}

fn unix_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// The loopback address in the v6-mapped form statistics expect. A raw
/// output has no socket peer, so it reports as local.
fn local_host() -> [u8; 16] {
    let mut host = [0u8; 16];
    host[10] = 0xff;
    host[11] = 0xff;
    host[12..].copy_from_slice(&[127, 0, 0, 1]);
    host
}

struct StatsReporter {
    handle: Option<StatHandle>,
    stream: String,
    connector: String,
    crc: u32,
    started: Instant,
}

impl StatsReporter {
    fn new(stream: &str, to_file: bool) -> Self {
        // No running controller means no exchange page; playback works
        // without statistics in that case.
        let handle = match StatHandle::connect() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::debug!(error = %e, "statistics reporting disabled");
                None
            },
        };
        Self {
            handle,
            stream: stream.to_string(),
            connector: if to_file { "OUTPUT".to_string() } else { "raw".to_string() },
            crc: std::process::id(),
            started: Instant::now(),
        }
    }

    fn report(&mut self, last_second: u64, down: u64) {
        let Some(handle) = self.handle.as_mut() else { return };
        let record = StatRecord {
            host: local_host(),
            stream: self.stream.clone(),
            connector: self.connector.clone(),
            crc: self.crc,
            now: unix_secs(),
            time: self.started.elapsed().as_secs(),
            last_second,
            up: 0,
            down,
        };
        if let Err(e) = handle.write(&record) {
            tracing::debug!(error = %e, "statistics write failed");
        }
    }
}

/// Runs one output connection to completion.
pub async fn run(opts: &OutputOptions, sink: &mut dyn ContainerSink) -> Result<()> {
    let stream = checked_name(&opts.stream)?;
    runtime::set_stream_name(&stream);

    if opts.noinput {
        if !stream_alive(&stream) {
            return Err(ManifoldError::NotFound(format!(
                "stream {stream} not active already, aborting"
            )));
        }
    } else {
        start_input(&stream, StartOptions::default()).await?;
    }

    // The metadata page may lag READY by a beat; retry attaching while
    // the input holds the stream.
    let mut reader = {
        let mut attempts = 0;
        loop {
            match Reader::connect(&stream) {
                Ok(reader) => break reader,
                Err(e) => {
                    attempts += 1;
                    if attempts >= 20 || !stream_alive(&stream) {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                },
            }
        }
    };
    reader.real_time = opts.real_time;
    reader.needs_look_ahead = opts.look_ahead;

    let connector = manifold_stream::capa::read_capabilities()
        .ok()
        .and_then(|capa| capa.connector("raw").cloned())
        .unwrap_or_else(default_connector);
    let prefs = SelectionPrefs {
        video: opts.video.as_deref(),
        audio: opts.audio.as_deref(),
        subtitle: opts.subtitle.as_deref(),
        user_agent: &opts.user_agent,
    };
    reader.select_tracks(&connector, &prefs);

    if reader.meta.live {
        // Give a fresh live stream a bounded moment to become playable.
        let deadline = Instant::now() + Duration::from_secs(30);
        while runtime::is_active() && !ready_for_play(&reader) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(750)).await;
            reader.keep_alive();
            reader.update_meta();
            reader.select_tracks(&connector, &prefs);
        }
    }
    if reader.selected.is_empty() {
        return Err(ManifoldError::NotFound(format!("no selectable tracks on {stream}")));
    }

    let mut stats = StatsReporter::new(&stream, opts.to_file);

    match opts.seek {
        Some(pos) => reader.seek(pos, true).await,
        None => reader.initial_seek().await,
    }
    if reader.selected.is_empty() {
        return Err(ManifoldError::NotFound(format!("no playable tracks on {stream}")));
    }

    sink.send_header(&reader.meta)?;
    tracing::info!(%stream, tracks = ?reader.selected, "playback started");

    let mut last_stats = Instant::now();
    let mut last_progress = Instant::now();
    let mut last_packet_time = 0u64;
    let mut sent = 0u64;
    stats.report(0, sink.bytes_written());

    loop {
        if !runtime::is_active() {
            break;
        }
        match reader.prepare_next().await? {
            Step::Packet(pkt) => {
                reader.pace(pkt.time).await;
                reader.await_look_ahead(pkt.time).await;
                sink.send_next(&pkt)?;
                sent += 1;
                last_packet_time = pkt.time;
                last_progress = Instant::now();
            },
            Step::Again => {
                // No bytes and no playback progress for too long: the
                // connection is dead weight, drop it.
                if last_progress.elapsed() >= Duration::from_secs(IDLE_DISCONNECT_SECS) {
                    tracing::warn!(%stream, "disconnecting idle connection");
                    break;
                }
            },
            Step::Done => {
                tracing::info!(%stream, "shutting down because of stream end");
                break;
            },
        }
        if last_stats.elapsed() >= Duration::from_secs(1) {
            last_stats = Instant::now();
            reader.keep_alive();
            stats.report(last_packet_time, sink.bytes_written());
        }
    }

    stats.report(last_packet_time, sink.bytes_written());
    sink.finish()?;
    tracing::info!(%stream, packets = sent, "playback finished");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sink::RawSink;
    use bytes::Bytes;
    use manifold_bus::{packet, Buffer, UserPage};
    use manifold_core::{MediaPacket, StreamMeta, Track, TrackKind};
    use manifold_shm::{names, NamedSemaphore};

    fn unique(prefix: &str) -> String {
        format!("{prefix}{}", std::process::id())
    }

    fn pkt(track: u32, time: u64, keyframe: bool) -> MediaPacket {
        MediaPacket { track, time, offset: 0, keyframe, data: Bytes::from(vec![3u8; 24]) }
    }

    /// Builds a small VoD stream on the bus and holds its input lock, the
    /// way a live file input would.
    fn produce(stream: &str) -> (Buffer, UserPage, NamedSemaphore) {
        let mut lock = NamedSemaphore::open(&names::sem_input(stream)).unwrap();
        assert!(lock.try_wait());
        let users = UserPage::create(stream).unwrap();
        let mut buffer = Buffer::create(stream, false, "/test.mfs").unwrap();
        buffer.add_track(Track::new(1, TrackKind::Video, "h264")).unwrap();
        buffer.add_track(Track::new(2, TrackKind::Audio, "aac")).unwrap();
        for k in 0..4u64 {
            buffer.live_packet(&pkt(1, k * 1000, true)).unwrap();
            buffer.live_packet(&pkt(1, k * 1000 + 500, false)).unwrap();
        }
        for i in 0..16u64 {
            buffer.live_packet(&pkt(2, i * 250, false)).unwrap();
        }
        buffer.finish();
        (buffer, users, lock)
    }

    #[tokio::test]
    async fn test_end_to_end_vod_dump() {
        let stream = unique("outdump");
        let (_buffer, _users, mut lock) = produce(&stream);

        let opts = OutputOptions {
            stream: stream.clone(),
            noinput: true,
            real_time: 0,
            user_agent: String::new(),
            ..Default::default()
        };
        let mut out = Vec::new();
        {
            let mut sink = RawSink::new(&mut out);
            run(&opts, &mut sink).await.unwrap();
        }

        // One JSON header line, then every packet in (time, track) order.
        let newline = out.iter().position(|&b| b == b'\n').unwrap();
        let meta: StreamMeta = serde_json::from_slice(&out[..newline]).unwrap();
        assert_eq!(meta.tracks.len(), 2);

        let mut order = Vec::new();
        let mut at = newline + 1;
        while at < out.len() {
            let (p, total) = packet::parse_at(&out, at).unwrap().unwrap();
            order.push((p.time, p.track));
            at += total;
        }
        assert_eq!(order.len(), 24);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(order, sorted, "emission must follow (time, track) order");

        lock.post();
        lock.unlink();
    }

    #[tokio::test]
    async fn test_noinput_without_live_stream_fails() {
        let opts = OutputOptions {
            stream: unique("outdead"),
            noinput: true,
            real_time: 0,
            ..Default::default()
        };
        let mut sink = RawSink::new(Vec::new());
        let err = run(&opts, &mut sink).await.unwrap_err();
        assert!(matches!(err, ManifoldError::NotFound(_)));
    }
}
