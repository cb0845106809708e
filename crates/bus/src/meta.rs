// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Metadata page publication and reading.
//!
//! The owning input publishes the serialized [`StreamMeta`] on
//! `MstMeta@<name>` under the `MstLive@<name>` semaphore; readers take the
//! same semaphore only while copying the blob into private memory. The
//! critical section is a bounded memcpy on both sides, so a held semaphore
//! never spans a suspension point.

use manifold_core::limits::META_PAGE_SIZE;
use manifold_core::{ManifoldError, Result, StreamMeta};
use manifold_shm::{names, NamedSemaphore, SharedPage};

/// Writer handle for a stream's metadata page. Input process only.
pub struct MetaWriter {
    page: SharedPage,
    sem: NamedSemaphore,
}

impl MetaWriter {
    /// Creates the metadata page for the stream.
    pub fn create(stream: &str) -> Result<Self> {
        let page = SharedPage::create(&names::stream_meta(stream), META_PAGE_SIZE)?;
        let sem = NamedSemaphore::open(&names::sem_live(stream))?;
        Ok(Self { page, sem })
    }

    /// Atomically publishes the given metadata.
    pub fn publish(&mut self, meta: &StreamMeta) -> Result<()> {
        let blob = serde_json::to_vec(meta)
            .map_err(|e| ManifoldError::Fatal(format!("serialize metadata: {e}")))?;
        self.sem.wait()?;
        let outcome = self.page.write_blob(&blob);
        self.sem.post();
        outcome
    }
}

/// Reads a consistent copy of the stream's metadata.
///
/// Fails with `NotFound` when no input has created the page, and with
/// `NotReady` when the page exists but nothing was published yet.
pub fn read_meta(stream: &str) -> Result<StreamMeta> {
    let page = SharedPage::open(&names::stream_meta(stream))?;
    let mut sem = NamedSemaphore::open(&names::sem_live(stream))?;
    sem.wait()?;
    let copied = page.read_blob().map(|blob| blob.map(<[u8]>::to_vec));
    sem.post();

    let blob = copied?
        .ok_or_else(|| ManifoldError::NotReady(format!("metadata for {stream} not published")))?;
    serde_json::from_slice(&blob)
        .map_err(|e| ManifoldError::Corruption(format!("metadata for {stream}: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use manifold_core::{Track, TrackKind};

    fn unique(prefix: &str) -> String {
        format!("{prefix}{}", std::process::id())
    }

    #[test]
    fn test_publish_then_read() {
        let stream = unique("metatest");
        let mut writer = MetaWriter::create(&stream).unwrap();

        let mut meta = StreamMeta { live: true, source: "push://".to_string(), ..Default::default() };
        let mut track = Track::new(1, TrackKind::Video, "h264");
        track.lastms = 4_000;
        meta.tracks.insert(1, track);
        writer.publish(&meta).unwrap();

        let read = read_meta(&stream).unwrap();
        assert!(read.live);
        assert_eq!(read.tracks[&1].lastms, 4_000);

        // Republication with a higher lastms is what readers poll for.
        meta.tracks.get_mut(&1).unwrap().lastms = 6_000;
        writer.publish(&meta).unwrap();
        assert_eq!(read_meta(&stream).unwrap().tracks[&1].lastms, 6_000);
    }

    #[test]
    fn test_unpublished_page_is_not_ready() {
        let stream = unique("metaempty");
        let _writer = MetaWriter::create(&stream).unwrap();
        assert!(matches!(read_meta(&stream), Err(ManifoldError::NotReady(_))));
    }

    #[test]
    fn test_missing_page_is_not_found() {
        assert!(matches!(read_meta("no-such-meta-stream"), Err(ManifoldError::NotFound(_))));
    }
}
