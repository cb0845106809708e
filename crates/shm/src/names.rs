// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Page and semaphore name templates.
//!
//! These strings are shared with every other process on the host and with
//! existing deployments; they must never change shape.

/// Capabilities snapshot page, written by the controller.
pub const CAPA: &str = "MstCapa";

/// Statistics exchange page, written by every connection, read by the
/// aggregator.
pub const STATISTICS: &str = "MstStatistics";

/// Per-stream totals mirror, written by the aggregator.
pub const STREAM_TOTALS: &str = "MstStrms";

/// Controller access log.
pub const ACCESS_LOG: &str = "MstLog";

/// Stream configuration page for the given base name.
pub fn stream_conf(base_name: &str) -> String {
    format!("MstCnf@{base_name}")
}

/// One-byte stream state page.
pub fn stream_state(stream: &str) -> String {
    format!("MstSTATE@{stream}")
}

/// Stream metadata page.
pub fn stream_meta(stream: &str) -> String {
    format!("MstMeta@{stream}")
}

/// Track index page for one track of one stream.
pub fn track_index(stream: &str, track: u32) -> String {
    format!("MstTrkIdx@{stream}@{track}")
}

/// Data page holding packets starting at the given key.
pub fn track_data(stream: &str, track: u32, first_key: u64) -> String {
    format!("MstData@{stream}@{track}@{first_key}")
}

/// User slot page for the given stream.
pub fn users(stream: &str) -> String {
    format!("MstUsers@{stream}")
}

/// Stream exclusivity semaphore: held by the owning input.
pub fn sem_input(stream: &str) -> String {
    format!("MstInLock@{stream}")
}

/// Pull-input singularity semaphore.
pub fn sem_pull(stream: &str) -> String {
    format!("MstPull_{stream}")
}

/// Metadata writer/reader semaphore.
pub fn sem_live(stream: &str) -> String {
    format!("MstLive@{stream}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates() {
        assert_eq!(stream_conf("test"), "MstCnf@test");
        assert_eq!(stream_state("test+a"), "MstSTATE@test+a");
        assert_eq!(track_index("live1", 3), "MstTrkIdx@live1@3");
        assert_eq!(track_data("live1", 3, 41), "MstData@live1@3@41");
        assert_eq!(sem_pull("live1"), "MstPull_live1");
        assert_eq!(sem_live("live1"), "MstLive@live1");
    }
}
