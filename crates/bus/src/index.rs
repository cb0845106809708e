// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Track index pages.
//!
//! Each track of a stream has a fixed-size index page listing which data
//! pages are resident: one 8-byte big-endian entry `(firstKey, keyCount)`
//! per page, `keyCount == 0` marking a free slot. The producer writes
//! `firstKey` before `keyCount` when opening a page, so a nonzero entry is
//! always complete. Consumers re-verify the index before every page
//! boundary crossing, which is what makes slot clearing safe.

use manifold_core::limits::TRACK_INDEX_SIZE;
use manifold_core::{ManifoldError, Result};
use manifold_shm::{names, SharedPage};

const ENTRY_SIZE: usize = 8;

/// Handle on one track's index page.
pub struct TrackIndex {
    page: SharedPage,
}

impl TrackIndex {
    /// Creates the index page. Producer side; the page is mastered and
    /// disappears with the producer.
    pub fn create(stream: &str, track: u32) -> Result<Self> {
        let page = SharedPage::create(&names::track_index(stream, track), TRACK_INDEX_SIZE)?;
        Ok(Self { page })
    }

    /// Maps an existing index page read-only. Consumer side.
    pub fn open(stream: &str, track: u32) -> Result<Self> {
        let page = SharedPage::open(&names::track_index(stream, track))?;
        Ok(Self { page })
    }

    fn entry_count(&self) -> usize {
        self.page.len() / ENTRY_SIZE
    }

    fn entry(&self, slot: usize) -> (u64, u64) {
        let at = slot * ENTRY_SIZE;
        let buf = self.page.bytes();
        let mut first = [0u8; 4];
        first.copy_from_slice(&buf[at..at + 4]);
        let mut count = [0u8; 4];
        count.copy_from_slice(&buf[at + 4..at + 8]);
        (u64::from(u32::from_be_bytes(first)), u64::from(u32::from_be_bytes(count)))
    }

    /// All live entries as `(firstKey, keyCount)` pairs.
    pub fn entries(&self) -> Vec<(u64, u64)> {
        (0..self.entry_count()).map(|i| self.entry(i)).filter(|&(_, count)| count > 0).collect()
    }

    /// The page (by its first key) holding the given key, if resident.
    /// A `firstKey` of zero still covers key 1, hence the clamp.
    pub fn page_for_key(&self, key: u64) -> Option<u64> {
        (0..self.entry_count()).find_map(|i| {
            let (first, count) = self.entry(i);
            if count == 0 {
                return None;
            }
            (first <= key && first.max(1) + count > key).then_some(first)
        })
    }

    /// The highest first-key of any resident page, i.e. the newest page.
    pub fn highest_page(&self) -> Option<u64> {
        self.entries().iter().map(|&(first, _)| first).max()
    }

    /// Publishes an entry for a freshly opened page: firstKey first,
    /// keyCount last.
    pub fn publish(&mut self, first_key: u64, key_count: u64) -> Result<()> {
        if let Some(slot) = self.slot_of(first_key) {
            return self.write_entry(slot, first_key, key_count);
        }
        let free = (0..self.entry_count())
            .find(|&i| self.entry(i).1 == 0)
            .ok_or_else(|| ManifoldError::Fatal("track index is full".to_string()))?;
        self.write_entry(free, first_key, key_count)
    }

    /// Bumps the key count of a resident page as it fills.
    pub fn update_count(&mut self, first_key: u64, key_count: u64) -> Result<()> {
        let slot = self.slot_of(first_key).ok_or_else(|| {
            ManifoldError::Corruption(format!("no index entry for page {first_key}"))
        })?;
        self.write_entry(slot, first_key, key_count)
    }

    /// Frees the entry for an evicted page by zeroing its key count.
    pub fn clear(&mut self, first_key: u64) -> Result<()> {
        if let Some(slot) = self.slot_of(first_key) {
            let at = slot * ENTRY_SIZE;
            self.page.bytes_mut()?[at + 4..at + 8].fill(0);
        }
        Ok(())
    }

    fn slot_of(&self, first_key: u64) -> Option<usize> {
        (0..self.entry_count()).find(|&i| {
            let (first, count) = self.entry(i);
            count > 0 && first == first_key
        })
    }

    fn write_entry(&mut self, slot: usize, first_key: u64, key_count: u64) -> Result<()> {
        let first = u32::try_from(first_key)
            .map_err(|_| ManifoldError::Fatal("first key exceeds u32".to_string()))?;
        let count = u32::try_from(key_count)
            .map_err(|_| ManifoldError::Fatal("key count exceeds u32".to_string()))?;
        let at = slot * ENTRY_SIZE;
        let buf = self.page.bytes_mut()?;
        buf[at..at + 4].copy_from_slice(&first.to_be_bytes());
        buf[at + 4..at + 8].copy_from_slice(&count.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn unique(prefix: &str) -> String {
        format!("{prefix}{}", std::process::id())
    }

    #[test]
    fn test_publish_lookup_clear() {
        let stream = unique("idxtest");
        let mut index = TrackIndex::create(&stream, 1).unwrap();
        index.publish(1, 10).unwrap();
        index.publish(11, 5).unwrap();

        let reader = TrackIndex::open(&stream, 1).unwrap();
        assert_eq!(reader.page_for_key(1), Some(1));
        assert_eq!(reader.page_for_key(10), Some(1));
        assert_eq!(reader.page_for_key(11), Some(11));
        assert_eq!(reader.page_for_key(15), Some(11));
        assert_eq!(reader.page_for_key(16), None);
        assert_eq!(reader.highest_page(), Some(11));

        index.clear(1).unwrap();
        assert_eq!(reader.page_for_key(5), None);
        assert_eq!(reader.entries(), vec![(11, 5)]);
    }

    #[test]
    fn test_zero_first_key_covers_key_one() {
        let stream = unique("idxzero");
        let mut index = TrackIndex::create(&stream, 2).unwrap();
        index.publish(0, 3).unwrap();
        assert_eq!(index.page_for_key(1), Some(0));
        assert_eq!(index.page_for_key(3), Some(0));
        assert_eq!(index.page_for_key(4), None);
    }

    #[test]
    fn test_update_count_grows_page() {
        let stream = unique("idxgrow");
        let mut index = TrackIndex::create(&stream, 1).unwrap();
        index.publish(21, 1).unwrap();
        assert_eq!(index.page_for_key(22), None);
        index.update_count(21, 2).unwrap();
        assert_eq!(index.page_for_key(22), Some(21));
    }

    #[test]
    fn test_cleared_slot_is_reusable() {
        let stream = unique("idxreuse");
        let mut index = TrackIndex::create(&stream, 1).unwrap();
        index.publish(1, 4).unwrap();
        index.clear(1).unwrap();
        index.publish(5, 4).unwrap();
        assert_eq!(index.entries(), vec![(5, 4)]);
    }
}
