// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The packet record format used on data pages and in the flat file
//! format.
//!
//! Records are laid out back to back:
//!
//! ```text
//! [payload len u32 BE][track u32 BE][time u64 BE][offset i32 BE][flags u8][payload]
//! ```
//!
//! A zero length word terminates the live portion of a page (the
//! *sentinel*); writers always leave one after the last record and
//! overwrite it when appending. Payloads are therefore never empty.

use manifold_core::{ManifoldError, MediaPacket, Result};

/// Fixed header bytes in front of every payload.
pub const HEADER_LEN: usize = 21;

/// Width of the sentinel word.
pub const SENTINEL_LEN: usize = 4;

/// Flag bit: this packet starts a keyframe.
pub const FLAG_KEYFRAME: u8 = 0x01;

/// Total on-page size of the given packet.
pub const fn encoded_len(packet: &MediaPacket) -> usize {
    HEADER_LEN + packet.data.len()
}

/// Encodes one record into `buf` at `at`. The caller guarantees room for
/// the record itself; the trailing sentinel is the caller's business.
pub fn encode_into(packet: &MediaPacket, buf: &mut [u8], at: usize) -> Result<usize> {
    let total = encoded_len(packet);
    if packet.data.is_empty() {
        return Err(ManifoldError::BadRequest("refusing to write empty packet".to_string()));
    }
    if at + total > buf.len() {
        return Err(ManifoldError::Fatal(format!(
            "packet of {total} bytes does not fit at offset {at} (page is {} bytes)",
            buf.len()
        )));
    }
    let len = u32::try_from(packet.data.len())
        .map_err(|_| ManifoldError::BadRequest("packet payload exceeds u32".to_string()))?;
    buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
    buf[at + 4..at + 8].copy_from_slice(&packet.track.to_be_bytes());
    buf[at + 8..at + 16].copy_from_slice(&packet.time.to_be_bytes());
    buf[at + 16..at + 20].copy_from_slice(&packet.offset.to_be_bytes());
    buf[at + 20] = if packet.keyframe { FLAG_KEYFRAME } else { 0 };
    buf[at + HEADER_LEN..at + total].copy_from_slice(&packet.data);
    Ok(total)
}

/// Writes the sentinel word at `at`, when it fits. Page ends double as an
/// implicit sentinel.
pub fn write_sentinel(buf: &mut [u8], at: usize) {
    if at + SENTINEL_LEN <= buf.len() {
        buf[at..at + SENTINEL_LEN].fill(0);
    }
}

/// Whether the bytes at `at` are a sentinel. A truncated page end counts:
/// there is no room for another record there.
pub fn is_sentinel(buf: &[u8], at: usize) -> bool {
    if at + SENTINEL_LEN > buf.len() {
        return true;
    }
    buf[at..at + SENTINEL_LEN] == [0, 0, 0, 0]
}

/// Presentation time of the record at `at`, without parsing the payload.
/// Zero when the offset holds a sentinel.
pub fn time_at(buf: &[u8], at: usize) -> u64 {
    if is_sentinel(buf, at) || at + HEADER_LEN > buf.len() {
        return 0;
    }
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at + 8..at + 16]);
    u64::from_be_bytes(b)
}

/// Parses the record at `at`.
///
/// Returns `Ok(None)` on a sentinel; `Err(Corruption)` when the length
/// word points past the page.
pub fn parse_at(buf: &[u8], at: usize) -> Result<Option<(MediaPacket, usize)>> {
    if is_sentinel(buf, at) {
        return Ok(None);
    }
    if at + HEADER_LEN > buf.len() {
        return Err(ManifoldError::Corruption(format!("record header truncated at {at}")));
    }
    let mut len4 = [0u8; 4];
    len4.copy_from_slice(&buf[at..at + 4]);
    let payload_len = u32::from_be_bytes(len4) as usize;
    let total = HEADER_LEN + payload_len;
    if at + total > buf.len() {
        return Err(ManifoldError::Corruption(format!(
            "record at {at} claims {payload_len} payload bytes past the page end"
        )));
    }
    let mut track4 = [0u8; 4];
    track4.copy_from_slice(&buf[at + 4..at + 8]);
    let mut time8 = [0u8; 8];
    time8.copy_from_slice(&buf[at + 8..at + 16]);
    let mut off4 = [0u8; 4];
    off4.copy_from_slice(&buf[at + 16..at + 20]);
    let packet = MediaPacket {
        track: u32::from_be_bytes(track4),
        time: u64::from_be_bytes(time8),
        offset: i32::from_be_bytes(off4),
        keyframe: buf[at + 20] & FLAG_KEYFRAME != 0,
        data: bytes::Bytes::copy_from_slice(&buf[at + HEADER_LEN..at + total]),
    };
    Ok(Some((packet, total)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(track: u32, time: u64, keyframe: bool, data: &'static [u8]) -> MediaPacket {
        MediaPacket { track, time, offset: 0, keyframe, data: Bytes::from_static(data) }
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let mut buf = vec![0u8; 256];
        let p = packet(3, 1500, true, b"frame-data");
        let written = encode_into(&p, &mut buf, 0).unwrap();
        write_sentinel(&mut buf, written);

        let (parsed, total) = parse_at(&buf, 0).unwrap().unwrap();
        assert_eq!(parsed, p);
        assert_eq!(total, written);
        assert!(parse_at(&buf, total).unwrap().is_none());
    }

    #[test]
    fn test_back_to_back_walk() {
        let mut buf = vec![0u8; 256];
        let mut at = 0;
        for (time, data) in [(100u64, b"aa".as_slice()), (200, b"bbb"), (300, b"c")] {
            let p = MediaPacket {
                track: 1,
                time,
                offset: 0,
                keyframe: false,
                data: Bytes::copy_from_slice(data),
            };
            at += encode_into(&p, &mut buf, at).unwrap();
        }
        write_sentinel(&mut buf, at);

        let mut times = Vec::new();
        let mut cursor = 0;
        while let Some((p, total)) = parse_at(&buf, cursor).unwrap() {
            times.push(p.time);
            cursor += total;
        }
        assert_eq!(times, vec![100, 200, 300]);
    }

    #[test]
    fn test_time_at_matches_header() {
        let mut buf = vec![0u8; 64];
        let p = packet(1, 987_654, false, b"x");
        encode_into(&p, &mut buf, 0).unwrap();
        assert_eq!(time_at(&buf, 0), 987_654);
    }

    #[test]
    fn test_sentinel_at_page_end() {
        let buf = vec![1u8; 2];
        assert!(is_sentinel(&buf, 0));
        assert_eq!(time_at(&buf, 0), 0);
    }

    #[test]
    fn test_corrupt_length_detected() {
        let mut buf = vec![0u8; 64];
        let p = packet(1, 1, false, b"data");
        encode_into(&p, &mut buf, 0).unwrap();
        // Forge a length word pointing past the page.
        buf[0..4].copy_from_slice(&10_000u32.to_be_bytes());
        assert!(parse_at(&buf, 0).is_err());
    }

    #[test]
    fn test_empty_payload_refused() {
        let mut buf = vec![0u8; 64];
        let p = packet(1, 1, false, b"");
        assert!(encode_into(&p, &mut buf, 0).is_err());
    }

    #[test]
    fn test_no_room_refused() {
        let mut buf = vec![0u8; 16];
        let p = packet(1, 1, false, b"too-big-for-page");
        assert!(encode_into(&p, &mut buf, 0).is_err());
    }
}
