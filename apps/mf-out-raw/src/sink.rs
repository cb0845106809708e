// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Container sinks.
//!
//! Container and protocol emission is pluggable behind one closed
//! capability set: a sink gets the header once and every prepared packet
//! after it. Reader behavior (seeking, pacing, look-ahead) stays common
//! and is composed in by the run loop, not by sinks.

use manifold_bus::packet;
use manifold_core::{ManifoldError, MediaPacket, Result, StreamMeta};
use std::io::Write;

/// What a container implementation must be able to do.
pub trait ContainerSink {
    /// Emits the stream header. Called exactly once, before any packet.
    fn send_header(&mut self, meta: &StreamMeta) -> Result<()>;

    /// Emits one media packet. Packets arrive in `(time, track)` order.
    fn send_next(&mut self, packet: &MediaPacket) -> Result<()>;

    /// Bytes pushed to the client so far, for statistics.
    fn bytes_written(&self) -> u64;

    /// Flushes any buffered output at the end of playback.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The raw sink: a JSON header line followed by verbatim packet records.
pub struct RawSink<W: Write> {
    out: W,
    written: u64,
}

impl<W: Write> RawSink<W> {
    pub const fn new(out: W) -> Self {
        Self { out, written: 0 }
    }
}

impl<W: Write> ContainerSink for RawSink<W> {
    fn send_header(&mut self, meta: &StreamMeta) -> Result<()> {
        let mut header = serde_json::to_vec(meta)
            .map_err(|e| ManifoldError::Fatal(format!("serialize header: {e}")))?;
        header.push(b'\n');
        self.out.write_all(&header)?;
        self.written += header.len() as u64;
        Ok(())
    }

    fn send_next(&mut self, pkt: &MediaPacket) -> Result<()> {
        let mut buf = vec![0u8; packet::encoded_len(pkt)];
        packet::encode_into(pkt, &mut buf, 0)?;
        self.out.write_all(&buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
