// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Session-level statistics.
//!
//! A *session* is a logical viewer identified by `(host, crc, stream,
//! connector)`, stable across reconnects: a connection whose tuple matches
//! an existing session attaches to it, and its samples migrate with it if
//! the tuple ever changes. Sessions hold per-connection sample logs;
//! samples older than the cutoff are evicted, with cumulative totals
//! preserved in the wiped counters so `wiped + current` never decreases.

use crate::exchange::{host_to_string, StatRecord};
use manifold_core::limits::{COUNTABLE_BYTES, STAT_CUTOFF_SECS};
use std::collections::{BTreeMap, VecDeque};

/// Connection id: the connection's row on the exchange page.
pub type ConnId = u64;

/// The session identity tuple. Ordering is host, crc, stream, connector.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessIndex {
    pub host: String,
    pub crc: u32,
    pub stream: String,
    pub connector: String,
}

impl SessIndex {
    pub fn from_record(record: &StatRecord) -> Self {
        Self {
            host: host_to_string(&record.host),
            crc: record.crc,
            stream: record.stream.clone(),
            connector: record.connector.clone(),
        }
    }
}

impl std::fmt::Display for SessIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {} {}", self.host, self.crc, self.stream, self.connector)
    }
}

/// Session classification, assigned when the session first becomes
/// countable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessType {
    #[default]
    Unset,
    Input,
    Output,
    Viewer,
}

/// One sample of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatSample {
    /// Seconds connected at sample time.
    pub time: u64,
    /// Media position at sample time, milliseconds.
    pub last_second: u64,
    pub down: u64,
    pub up: u64,
}

/// The sample log of a single connection, keyed by wall time.
#[derive(Debug, Clone, Default)]
pub struct StatStorage {
    pub log: BTreeMap<u64, StatSample>,
}

impl StatStorage {
    /// Stores one sample, bounding the log length to the cutoff window.
    pub fn update(&mut self, record: &StatRecord) {
        self.log.insert(
            record.now,
            StatSample {
                time: record.time,
                last_second: record.last_second,
                down: record.down,
                up: record.up,
            },
        );
        if self.log.len() as u64 > STAT_CUTOFF_SECS {
            let first = self.log.keys().next().copied();
            if let Some(first) = first {
                self.log.remove(&first);
            }
        }
    }

    pub fn has_data_for(&self, t: u64) -> bool {
        self.log.first_key_value().is_some_and(|(&first, _)| t >= first)
    }

    /// The most recent sample at or before `t`.
    pub fn data_for(&self, t: u64) -> StatSample {
        self.log.range(..=t).next_back().map_or_else(StatSample::default, |(_, s)| *s)
    }

    fn last(&self) -> Option<&StatSample> {
        self.log.values().next_back()
    }
}

/// Per-stream totals, maintained by session classification and retirement.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTotals {
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub inputs: u64,
    pub outputs: u64,
    pub viewers: u64,
    pub curr_ins: u64,
    pub curr_outs: u64,
    pub curr_views: u64,
    pub status: u8,
}

/// A retired session's access-log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub stream: String,
    pub connector: String,
    pub host: String,
    pub duration: u64,
    pub up: u64,
    pub down: u64,
}

/// One logical viewer session.
#[derive(Debug, Clone)]
pub struct StatSession {
    cur_conns: BTreeMap<ConnId, StatStorage>,
    old_conns: VecDeque<StatStorage>,
    session_type: SessType,
    tracked: bool,
    first_active: u64,
    first_sec: u64,
    last_sec: u64,
    wiped_up: u64,
    wiped_down: u64,
}

impl Default for StatSession {
    fn default() -> Self {
        Self {
            cur_conns: BTreeMap::new(),
            old_conns: VecDeque::new(),
            session_type: SessType::Unset,
            tracked: false,
            first_active: 0,
            first_sec: u64::MAX,
            last_sec: 0,
            wiped_up: 0,
            wiped_down: 0,
        }
    }
}

impl StatSession {
    pub const fn sess_type(&self) -> SessType {
        self.session_type
    }

    pub const fn start(&self) -> u64 {
        self.first_sec
    }

    pub const fn end(&self) -> u64 {
        self.last_sec
    }

    /// Updates the given connection with a new sample, classifying the
    /// session and crediting stream totals once it becomes countable.
    pub fn update(
        &mut self,
        id: ConnId,
        record: &StatRecord,
        totals: &mut BTreeMap<String, StreamTotals>,
    ) {
        let prev_down = self.down_total();
        let prev_up = self.up_total();
        self.cur_conns.entry(id).or_default().update(record);
        if self.first_sec > record.now {
            self.first_sec = record.now;
        }
        if record.now > self.last_sec {
            self.last_sec = record.now;
            if !self.tracked {
                self.tracked = true;
                self.first_active = self.first_sec;
            }
        }
        let curr_down = self.down_total();
        let curr_up = self.up_total();
        if curr_up < prev_up || curr_down < prev_down {
            tracing::info!(
                stream = %record.stream,
                connector = %record.connector,
                id,
                "negative data usage in statistics update"
            );
        }

        if curr_down + curr_up < COUNTABLE_BYTES {
            return;
        }
        if self.session_type == SessType::Unset {
            let entry = totals.entry(record.stream.clone()).or_default();
            self.session_type = match record.connector.as_str() {
                "INPUT" => {
                    entry.inputs += 1;
                    entry.curr_ins += 1;
                    SessType::Input
                },
                "OUTPUT" => {
                    entry.outputs += 1;
                    entry.curr_outs += 1;
                    SessType::Output
                },
                _ => {
                    entry.viewers += 1;
                    entry.curr_views += 1;
                    SessType::Viewer
                },
            };
        }
        if record.stream.is_empty() {
            totals.remove(&record.stream);
            return;
        }
        let entry = totals.entry(record.stream.clone()).or_default();
        // Before the crossing nothing was counted yet, so the whole
        // cumulative amount is credited once; afterwards only deltas.
        if prev_up + prev_down < COUNTABLE_BYTES {
            entry.up_bytes += curr_up;
            entry.down_bytes += curr_down;
        } else {
            entry.up_bytes += curr_up - prev_up;
            entry.down_bytes += curr_down - prev_down;
        }
    }

    /// Archives a finished connection.
    pub fn finish(&mut self, id: ConnId) {
        if let Some(conn) = self.cur_conns.remove(&id) {
            self.old_conns.push_back(conn);
        }
    }

    /// Moves connection `id` over to `new_sess`, recalculating the first
    /// and last sample times on both sides.
    pub fn switch_over_to(&mut self, new_sess: &mut Self, id: ConnId) {
        let Some(conn) = self.cur_conns.remove(&id) else { return };
        if let (Some((&first, _)), Some((&last, _))) =
            (conn.log.first_key_value(), conn.log.last_key_value())
        {
            if new_sess.first_sec > first {
                new_sess.first_sec = first;
            }
            if new_sess.last_sec < last {
                new_sess.last_sec = last;
            }
        }
        let had_data = !conn.log.is_empty();
        new_sess.cur_conns.insert(id, conn);
        if had_data {
            self.recalculate_bounds();
        }
    }

    fn recalculate_bounds(&mut self) {
        self.first_sec = u64::MAX;
        self.last_sec = 0;
        for conn in self.old_conns.iter().chain(self.cur_conns.values()) {
            if let Some((&first, _)) = conn.log.first_key_value() {
                if self.first_sec > first {
                    self.first_sec = first;
                }
            }
            if let Some((&last, _)) = conn.log.last_key_value() {
                if self.last_sec < last {
                    self.last_sec = last;
                }
            }
        }
    }

    /// Evicts samples older than `cutoff`. The final sample of an archived
    /// connection folds its cumulative totals into the wiped counters
    /// before being dropped; live connections always keep their newest
    /// sample.
    pub fn wipe_old(&mut self, cutoff: u64) {
        if self.first_sec > cutoff {
            return;
        }
        self.first_sec = u64::MAX;
        for conn in &mut self.old_conns {
            loop {
                let Some(first) = conn.log.keys().next().copied() else { break };
                if first >= cutoff {
                    break;
                }
                if conn.log.len() == 1 {
                    let sample = conn.log[&first];
                    self.wiped_down += sample.down;
                    self.wiped_up += sample.up;
                }
                conn.log.remove(&first);
            }
            if let Some(first) = conn.log.keys().next().copied() {
                if self.first_sec > first {
                    self.first_sec = first;
                }
            }
        }
        while self.old_conns.front().is_some_and(|c| c.log.is_empty()) {
            self.old_conns.pop_front();
        }
        for conn in self.cur_conns.values_mut() {
            loop {
                if conn.log.len() <= 1 {
                    break;
                }
                let Some(first) = conn.log.keys().next().copied() else { break };
                if first >= cutoff {
                    break;
                }
                conn.log.remove(&first);
            }
            if let Some(first) = conn.log.keys().next().copied() {
                if self.first_sec > first {
                    self.first_sec = first;
                }
            }
        }
    }

    /// Retires the session when its last sample is older than
    /// `disconnect_point`: decrements the per-stream current counter and
    /// produces one access event. The session resets to untracked.
    pub fn ping(
        &mut self,
        index: &SessIndex,
        disconnect_point: u64,
        totals: &mut BTreeMap<String, StreamTotals>,
    ) -> Option<AccessEvent> {
        if !self.tracked || self.last_sec >= disconnect_point {
            return None;
        }
        if let Some(entry) = totals.get_mut(&index.stream) {
            match self.session_type {
                SessType::Input => entry.curr_ins = entry.curr_ins.saturating_sub(1),
                SessType::Output => entry.curr_outs = entry.curr_outs.saturating_sub(1),
                SessType::Viewer => entry.curr_views = entry.curr_views.saturating_sub(1),
                SessType::Unset => {},
            }
        }
        let duration = self.last_sec.saturating_sub(self.first_active).max(1);
        let event = AccessEvent {
            stream: index.stream.clone(),
            connector: index.connector.clone(),
            host: index.host.clone(),
            duration,
            up: self.up_total(),
            down: self.down_total(),
        };
        self.tracked = false;
        self.first_active = 0;
        self.first_sec = u64::MAX;
        self.last_sec = 0;
        self.wiped_up = 0;
        self.wiped_down = 0;
        self.old_conns.clear();
        self.session_type = SessType::Unset;
        Some(event)
    }

    /// Whether any sample data remains.
    pub fn has_data(&self) -> bool {
        if self.first_sec == 0 && self.last_sec == 0 {
            return false;
        }
        self.old_conns.iter().chain(self.cur_conns.values()).any(|c| !c.log.is_empty())
    }

    /// Whether there is data covering timestamp `t`.
    pub fn has_data_for(&self, t: u64) -> bool {
        if self.last_sec < t || self.first_sec > t {
            return false;
        }
        self.old_conns.iter().chain(self.cur_conns.values()).any(|c| c.has_data_for(t))
    }

    /// Whether the session counts as a viewer at timestamp `t`.
    pub fn is_viewer_on(&self, t: u64) -> bool {
        self.up_at(t) + self.down_at(t) > COUNTABLE_BYTES
    }

    /// Cumulative uploaded bytes over the session's lifetime.
    pub fn up_total(&self) -> u64 {
        self.wiped_up
            + self
                .old_conns
                .iter()
                .chain(self.cur_conns.values())
                .filter_map(|c| c.last().map(|s| s.up))
                .sum::<u64>()
    }

    /// Cumulative downloaded bytes over the session's lifetime.
    pub fn down_total(&self) -> u64 {
        self.wiped_down
            + self
                .old_conns
                .iter()
                .chain(self.cur_conns.values())
                .filter_map(|c| c.last().map(|s| s.down))
                .sum::<u64>()
    }

    /// Cumulative uploaded bytes at timestamp `t`.
    pub fn up_at(&self, t: u64) -> u64 {
        self.wiped_up
            + self
                .old_conns
                .iter()
                .chain(self.cur_conns.values())
                .filter(|c| c.has_data_for(t))
                .map(|c| c.data_for(t).up)
                .sum::<u64>()
    }

    /// Cumulative downloaded bytes at timestamp `t`.
    pub fn down_at(&self, t: u64) -> u64 {
        self.wiped_down
            + self
                .old_conns
                .iter()
                .chain(self.cur_conns.values())
                .filter(|c| c.has_data_for(t))
                .map(|c| c.data_for(t).down)
                .sum::<u64>()
    }

    /// Cumulative connected seconds at timestamp `t`.
    pub fn conn_time_at(&self, t: u64) -> u64 {
        self.old_conns
            .iter()
            .chain(self.cur_conns.values())
            .filter(|c| c.has_data_for(t))
            .map(|c| c.data_for(t).time)
            .sum()
    }

    /// Last requested media position at timestamp `t`, preferring live
    /// connections.
    pub fn last_second_at(&self, t: u64) -> u64 {
        for conn in self.cur_conns.values() {
            if conn.has_data_for(t) {
                return conn.data_for(t).last_second;
            }
        }
        for conn in self.old_conns.iter().rev() {
            if conn.has_data_for(t) {
                return conn.data_for(t).last_second;
            }
        }
        0
    }

    /// Download rate over the trailing five seconds at `t`, bytes/sec.
    pub fn bps_down_at(&self, t: u64) -> u64 {
        let a_time = (t.saturating_sub(5)).max(self.first_sec);
        if t <= a_time {
            return 0;
        }
        (self.down_at(t) - self.down_at(a_time)) / (t - a_time)
    }

    /// Upload rate over the trailing five seconds at `t`, bytes/sec.
    pub fn bps_up_at(&self, t: u64) -> u64 {
        let a_time = (t.saturating_sub(5)).max(self.first_sec);
        if t <= a_time {
            return 0;
        }
        (self.up_at(t) - self.up_at(a_time)) / (t - a_time)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(stream: &str, connector: &str, now: u64, up: u64, down: u64) -> StatRecord {
        let mut host = [0u8; 16];
        host[10] = 0xff;
        host[11] = 0xff;
        host[12..].copy_from_slice(&[10, 0, 0, 1]);
        StatRecord {
            host,
            stream: stream.to_string(),
            connector: connector.to_string(),
            crc: 7,
            now,
            time: now,
            last_second: now * 1000,
            up,
            down,
        }
    }

    #[test]
    fn test_classification_at_countable_boundary() {
        let mut session = StatSession::default();
        let mut totals = BTreeMap::new();

        session.update(1, &record("live1", "raw", 100, 0, COUNTABLE_BYTES - 1), &mut totals);
        assert_eq!(session.sess_type(), SessType::Unset);

        // Exactly 131072 cumulative bytes flips the classification.
        session.update(1, &record("live1", "raw", 101, 0, COUNTABLE_BYTES), &mut totals);
        assert_eq!(session.sess_type(), SessType::Viewer);
        assert_eq!(totals["live1"].viewers, 1);
        assert_eq!(totals["live1"].curr_views, 1);
        // The full cumulative amount is credited on the crossing update.
        assert_eq!(totals["live1"].down_bytes, COUNTABLE_BYTES);
    }

    #[test]
    fn test_input_output_classification() {
        let mut totals = BTreeMap::new();
        let mut input = StatSession::default();
        input.update(1, &record("live1", "INPUT", 100, COUNTABLE_BYTES, 0), &mut totals);
        assert_eq!(input.sess_type(), SessType::Input);
        assert_eq!(totals["live1"].curr_ins, 1);

        let mut output = StatSession::default();
        output.update(2, &record("live1", "OUTPUT", 100, COUNTABLE_BYTES, 0), &mut totals);
        assert_eq!(output.sess_type(), SessType::Output);
        assert_eq!(totals["live1"].curr_outs, 1);
    }

    #[test]
    fn test_deltas_after_crossing() {
        let mut session = StatSession::default();
        let mut totals = BTreeMap::new();
        session.update(1, &record("live1", "raw", 100, 0, COUNTABLE_BYTES), &mut totals);
        session.update(1, &record("live1", "raw", 101, 0, COUNTABLE_BYTES + 500), &mut totals);
        assert_eq!(totals["live1"].down_bytes, COUNTABLE_BYTES + 500);
    }

    #[test]
    fn test_switch_over_migrates_samples() {
        let mut totals = BTreeMap::new();
        let mut old_sess = StatSession::default();
        old_sess.update(9, &record("live1", "raw", 100, 10, 20), &mut totals);
        let mut new_sess = StatSession::default();

        old_sess.switch_over_to(&mut new_sess, 9);
        assert!(!old_sess.has_data());
        assert!(new_sess.has_data());
        assert_eq!(new_sess.start(), 100);
        assert_eq!(new_sess.end(), 100);
        assert_eq!(new_sess.down_total(), 20);
    }

    #[test]
    fn test_wipe_preserves_cumulative_totals() {
        let mut totals = BTreeMap::new();
        let mut session = StatSession::default();
        session.update(1, &record("live1", "raw", 100, 1_000, 2_000), &mut totals);
        session.update(1, &record("live1", "raw", 200, 3_000, 4_000), &mut totals);
        session.finish(1);

        let before = session.up_total() + session.down_total();
        // Wipe everything: the archived connection's last sample folds
        // into the wiped counters.
        session.wipe_old(1_000);
        assert!(!session.has_data());
        assert_eq!(session.up_total() + session.down_total(), before);
        // Monotonicity of wiped + current.
        assert_eq!(session.up_total(), 3_000);
        assert_eq!(session.down_total(), 4_000);
    }

    #[test]
    fn test_live_connection_keeps_newest_sample() {
        let mut totals = BTreeMap::new();
        let mut session = StatSession::default();
        session.update(1, &record("live1", "raw", 100, 10, 10), &mut totals);
        session.update(1, &record("live1", "raw", 200, 20, 20), &mut totals);
        session.wipe_old(1_000);
        // Still connected: the newest sample survives the wipe.
        assert!(session.has_data());
        assert_eq!(session.down_total(), 20);
    }

    #[test]
    fn test_ping_retires_idle_session() {
        let mut totals = BTreeMap::new();
        let mut session = StatSession::default();
        let index = SessIndex {
            host: "10.0.0.1".to_string(),
            crc: 7,
            stream: "live1".to_string(),
            connector: "raw".to_string(),
        };
        session.update(1, &record("live1", "raw", 100, 0, COUNTABLE_BYTES * 2), &mut totals);
        assert_eq!(totals["live1"].curr_views, 1);

        // Not yet idle at 110.
        assert!(session.ping(&index, 100, &mut totals).is_none());
        // Idle past the disconnect point: one access event, counter drops.
        let event = session.ping(&index, 200, &mut totals).unwrap();
        assert_eq!(event.stream, "live1");
        assert_eq!(event.down, COUNTABLE_BYTES * 2);
        assert_eq!(totals["live1"].curr_views, 0);
        assert_eq!(session.sess_type(), SessType::Unset);
        // A second ping is a no-op.
        assert!(session.ping(&index, 300, &mut totals).is_none());
    }

    #[test]
    fn test_at_time_queries() {
        let mut totals = BTreeMap::new();
        let mut session = StatSession::default();
        for (now, down) in [(100u64, 1_000u64), (101, 2_000), (102, 3_000)] {
            session.update(1, &record("live1", "raw", now, 0, down), &mut totals);
        }
        assert_eq!(session.down_at(101), 2_000);
        assert_eq!(session.down_at(500), 3_000);
        assert!(session.has_data_for(101));
        assert!(!session.has_data_for(99));
        assert_eq!(session.last_second_at(101), 101_000);
    }
}
