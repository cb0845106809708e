// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Simulated live: feeds the file into the bus at its natural pace, as if
//! it were being produced right now.

use crate::file_format::FileSource;
use manifold_bus::{Buffer, UserPage};
use manifold_core::limits::SIMULATED_LIVE_BUFFER;
use manifold_core::{runtime, Result, StreamState};
use manifold_stream::StatePage;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Streams the whole file in real time. `sim_start` anchors media time 0
/// on the wall clock; zero picks "now".
pub async fn run(
    stream: &str,
    source: &FileSource,
    state: &mut StatePage,
    sim_start: u64,
) -> Result<()> {
    let mut buffer = Buffer::create(stream, true, &source.path().display().to_string())?;
    for declared in &source.declared {
        let mut track = declared.clone();
        track.keys.clear();
        track.parts.clear();
        track.fragments.clear();
        track.firstms = 0;
        track.lastms = 0;
        track.min_keep_away = SIMULATED_LIVE_BUFFER;
        buffer.add_track(track)?;
    }
    let mut users = UserPage::create(stream)?;

    let sim_start = if sim_start == 0 { unix_ms() } else { sim_start };
    buffer.meta.boot_ms_offset = i64::try_from(sim_start).unwrap_or(0);
    buffer.publish_meta()?;

    state.set(StreamState::Ready);
    tracing::info!(sim_start, "simulated live input started");

    let mut last_service = Instant::now();
    for record in source.records()? {
        if !runtime::is_active() {
            break;
        }
        let pkt = record?;
        // Hold each packet back until its wall-clock moment, minus the
        // keep-away so consumers always have a safety margin.
        loop {
            let now = unix_ms();
            if now + SIMULATED_LIVE_BUFFER >= sim_start + pkt.time || !runtime::is_active() {
                break;
            }
            let wait = (sim_start + pkt.time - SIMULATED_LIVE_BUFFER - now).min(1000);
            tokio::time::sleep(Duration::from_millis(wait)).await;
            service(&mut users, &mut buffer, &mut last_service);
        }
        buffer.live_packet(&pkt)?;
        service(&mut users, &mut buffer, &mut last_service);
    }

    state.set(StreamState::Shutdown);
    buffer.finish();
    state.set(StreamState::Off);
    tracing::info!("simulated live input finished");
    Ok(())
}

/// Once-per-second housekeeping: sweep the slots, honor their hints, age
/// the pages.
fn service(users: &mut UserPage, buffer: &mut Buffer, last: &mut Instant) {
    if last.elapsed() < Duration::from_secs(1) {
        return;
    }
    *last = Instant::now();
    let report = users.sweep();
    for hint in &report.hints {
        buffer.touch(hint.track, hint.next_key);
    }
    buffer.tick();
}
