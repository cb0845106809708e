// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The statistics aggregator.
//!
//! Runs inside the controller at 1 Hz: reads every exchange record,
//! attributes connections to sessions (moving them when their identity
//! tuple changed), evicts old samples, retires idle sessions, and mirrors
//! per-stream totals onto a shared table. Also answers the `clients`,
//! `totals`, and `active_streams` queries.

use crate::access_log::AccessLog;
use crate::exchange::{StatRecord, StatServer, CTRL_DISCONNECT};
use crate::session::{ConnId, SessIndex, SessType, StatSession, StreamTotals};
use manifold_core::limits::{STATS_DELAY_SECS, STATS_INPUT_DELAY_SECS, STAT_CUTOFF_SECS};
use manifold_core::{Result, StreamState};
use manifold_shm::{names, FieldSpec, RelTable, SharedPage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

// "clients" field request bits.
pub const STAT_CLI_HOST: u32 = 1;
pub const STAT_CLI_STREAM: u32 = 2;
pub const STAT_CLI_PROTO: u32 = 4;
pub const STAT_CLI_CONNTIME: u32 = 8;
pub const STAT_CLI_POSITION: u32 = 16;
pub const STAT_CLI_DOWN: u32 = 32;
pub const STAT_CLI_UP: u32 = 64;
pub const STAT_CLI_BPS_DOWN: u32 = 128;
pub const STAT_CLI_BPS_UP: u32 = 256;
pub const STAT_CLI_CRC: u32 = 512;
pub const STAT_CLI_ALL: u32 = 0xFFFF;

// "totals" field request bits.
pub const STAT_TOT_CLIENTS: u32 = 1;
pub const STAT_TOT_BPS_DOWN: u32 = 2;
pub const STAT_TOT_BPS_UP: u32 = 4;
pub const STAT_TOT_INPUTS: u32 = 8;
pub const STAT_TOT_OUTPUTS: u32 = 16;
pub const STAT_TOT_ALL: u32 = 0xFF;

const TOTALS_PAGE_SIZE: usize = 64 * 1024;

fn totals_schema() -> Vec<FieldSpec> {
    vec![
        FieldSpec::str("stream", 100),
        FieldSpec::int("status"),
        FieldSpec::int("viewers"),
        FieldSpec::int("inputs"),
        FieldSpec::int("outputs"),
    ]
}

fn stream_status_byte(stream: &str) -> u8 {
    SharedPage::open(&names::stream_state(stream))
        .ok()
        .and_then(|p| p.bytes().first().copied())
        .unwrap_or(0)
}

/// The controller's session bookkeeping.
pub struct Aggregator {
    server: Option<StatServer>,
    totals_table: Option<RelTable>,
    access_log: Option<AccessLog>,
    sessions: BTreeMap<SessIndex, StatSession>,
    conn_to_session: HashMap<ConnId, SessIndex>,
    stream_stats: BTreeMap<String, StreamTotals>,
    shift_writes: bool,
    first_run: bool,
}

impl Aggregator {
    /// Full aggregator with shared pages: the exchange page, the totals
    /// mirror, and the access log. Controller only.
    pub fn create() -> Result<Self> {
        let server = StatServer::create()?;
        let totals_page = SharedPage::create(names::STREAM_TOTALS, TOTALS_PAGE_SIZE)?;
        let totals_table = RelTable::create(totals_page, &totals_schema())?;
        let access_log = AccessLog::create()?;
        Ok(Self {
            server: Some(server),
            totals_table: Some(totals_table),
            access_log: Some(access_log),
            ..Self::in_memory()
        })
    }

    /// Page-less aggregator operating only on ingested records. Used by
    /// tests and embedded setups.
    pub fn in_memory() -> Self {
        Self {
            server: None,
            totals_table: None,
            access_log: None,
            sessions: BTreeMap::new(),
            conn_to_session: HashMap::new(),
            stream_stats: BTreeMap::new(),
            shift_writes: true,
            first_run: true,
        }
    }

    /// One aggregation round: parse all records, then sweep.
    pub fn tick(&mut self, now: u64) {
        let scanned = self.server.as_ref().map(StatServer::scan).unwrap_or_default();
        let mut finished = Vec::new();
        for (id, ctrl, record) in scanned {
            self.ingest(id, ctrl, &record);
            if ctrl >= CTRL_DISCONNECT {
                finished.push(id);
            }
        }
        if let Some(server) = self.server.as_mut() {
            for id in finished {
                let _ = server.release(id);
            }
        }
        if self.first_run {
            // Totals carried over from a previous controller run would be
            // double-counted; restart the byte counters.
            self.first_run = false;
            for totals in self.stream_stats.values_mut() {
                totals.up_bytes = 0;
                totals.down_bytes = 0;
            }
        }
        self.sweep(now);
    }

    /// Attributes one exchange record to its session, moving the
    /// connection when its identity tuple changed.
    pub fn ingest(&mut self, id: ConnId, ctrl: u64, record: &StatRecord) {
        let idx = SessIndex::from_record(record);
        if let Some(old_idx) = self.conn_to_session.get(&id).cloned() {
            if old_idx != idx {
                tracing::info!(id, from = %old_idx, to = %idx, "switching connection between sessions");
                if let Some(mut old_sess) = self.sessions.remove(&old_idx) {
                    let new_sess = self.sessions.entry(idx.clone()).or_default();
                    old_sess.switch_over_to(new_sess, id);
                    if old_sess.has_data() {
                        self.sessions.insert(old_idx, old_sess);
                    }
                }
            }
        }
        self.conn_to_session.insert(id, idx.clone());
        self.sessions.entry(idx.clone()).or_default().update(id, record, &mut self.stream_stats);
        if ctrl >= CTRL_DISCONNECT {
            if let Some(sess) = self.sessions.get_mut(&idx) {
                sess.finish(id);
            }
            self.conn_to_session.remove(&id);
        }
    }

    /// Wipes old samples, retires idle sessions, and refreshes the totals
    /// mirror.
    pub fn sweep(&mut self, now: u64) {
        let cutoff = now.saturating_sub(STAT_CUTOFF_SECS);
        let retire_in = now.saturating_sub(STATS_INPUT_DELAY_SECS);
        let retire_out = now.saturating_sub(STATS_DELAY_SECS);

        let mut gone = Vec::new();
        for (idx, sess) in &mut self.sessions {
            let retire_point =
                if sess.sess_type() == SessType::Input { retire_in } else { retire_out };
            if let Some(event) = sess.ping(idx, retire_point, &mut self.stream_stats) {
                tracing::info!(
                    stream = %event.stream,
                    connector = %event.connector,
                    host = %event.host,
                    duration = event.duration,
                    up = event.up,
                    down = event.down,
                    "session ended"
                );
                if let Some(log) = self.access_log.as_mut() {
                    let _ = log.log(now, &event);
                }
            }
            sess.wipe_old(cutoff);
            if !sess.has_data() {
                gone.push(idx.clone());
            }
        }
        for idx in gone {
            self.sessions.remove(&idx);
        }
        self.conn_to_session.retain(|_, idx| self.sessions.contains_key(idx));

        self.mirror_totals();
    }

    /// Writes the per-stream totals onto the shared table and prunes
    /// streams that went offline.
    fn mirror_totals(&mut self) {
        let mut inactive = Vec::new();
        for (name, totals) in &mut self.stream_stats {
            totals.status = stream_status_byte(name);
            if totals.status == StreamState::Off.as_byte() {
                inactive.push(name.clone());
            }
        }

        if let Some(table) = self.totals_table.as_mut() {
            let present = table.end_pos() - table.deleted();
            let shift = self.shift_writes || present != self.stream_stats.len() as u64;
            let mut pos = if shift { table.end_pos() } else { table.deleted() };
            for (name, totals) in &self.stream_stats {
                if shift {
                    let _ = table.set_str("stream", pos, name);
                }
                let _ = table.set_int("status", pos, u64::from(totals.status));
                let _ = table.set_int("viewers", pos, totals.curr_views);
                let _ = table.set_int("inputs", pos, totals.curr_ins);
                let _ = table.set_int("outputs", pos, totals.curr_outs);
                pos += 1;
            }
            if shift {
                let prev_end = table.end_pos();
                let _ = table.set_end_pos(pos);
                let _ = table.set_deleted(prev_end);
                self.shift_writes = false;
            }
        }

        for name in inactive {
            self.stream_stats.remove(&name);
            self.shift_writes = true;
        }
    }

    pub fn stream_totals(&self, stream: &str) -> Option<&StreamTotals> {
        self.stream_stats.get(stream)
    }

    pub fn session(&self, idx: &SessIndex) -> Option<&StatSession> {
        self.sessions.get(idx)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the stream has at least one session with current data.
    pub fn has_viewers(&self, stream: &str, now: u64) -> bool {
        self.sessions.iter().any(|(idx, sess)| {
            idx.stream == stream && (sess.has_data_for(now) || sess.has_data_for(now - 1))
        })
    }

    /// Streams with a viewer-on session at the moment, with their viewer
    /// counts.
    pub fn active_streams(&self, now: u64) -> BTreeMap<String, u64> {
        let t_out = now.saturating_sub(STATS_DELAY_SECS);
        let t_in = now.saturating_sub(STATS_INPUT_DELAY_SECS);
        let mut out = BTreeMap::new();
        for (idx, sess) in &self.sessions {
            let t = if sess.sess_type() == SessType::Input { t_in } else { t_out };
            if sess.has_data_for(t) && sess.is_viewer_on(t) {
                let entry = out.entry(idx.stream.clone()).or_insert(0);
                if sess.sess_type() == SessType::Viewer {
                    *entry += 1;
                }
            }
        }
        out
    }

    /// Fills a `clients` request: a field-masked listing of all sessions
    /// active at the requested timestamp.
    pub fn fill_clients(&self, req: &ClientsRequest, now: u64) -> ClientsReply {
        let mut req_time = req.time.unwrap_or(0);
        let asked_now = req_time == 0;
        if req_time <= 0 {
            req_time += i64::try_from(now).unwrap_or(i64::MAX);
        }
        let req_time = u64::try_from(req_time).unwrap_or(0);

        let mut fields = 0u32;
        for f in &req.fields {
            fields |= match f.as_str() {
                "host" => STAT_CLI_HOST,
                "stream" => STAT_CLI_STREAM,
                "protocol" => STAT_CLI_PROTO,
                "conntime" => STAT_CLI_CONNTIME,
                "position" => STAT_CLI_POSITION,
                "down" => STAT_CLI_DOWN,
                "up" => STAT_CLI_UP,
                "downbps" => STAT_CLI_BPS_DOWN,
                "upbps" => STAT_CLI_BPS_UP,
                "crc" => STAT_CLI_CRC,
                _ => 0,
            };
        }
        if fields == 0 {
            fields = STAT_CLI_ALL;
        }

        let mut reply = ClientsReply { time: req_time, fields: Vec::new(), data: Vec::new() };
        for (name, bit) in [
            ("host", STAT_CLI_HOST),
            ("stream", STAT_CLI_STREAM),
            ("protocol", STAT_CLI_PROTO),
            ("conntime", STAT_CLI_CONNTIME),
            ("position", STAT_CLI_POSITION),
            ("down", STAT_CLI_DOWN),
            ("up", STAT_CLI_UP),
            ("downbps", STAT_CLI_BPS_DOWN),
            ("upbps", STAT_CLI_BPS_UP),
            ("crc", STAT_CLI_CRC),
        ] {
            if fields & bit != 0 {
                reply.fields.push(name.to_string());
            }
        }

        for (idx, sess) in &self.sessions {
            // "now" requests clamp onto the session's last sample when it
            // is at most five seconds old.
            let mut t = req_time;
            if asked_now && req_time.saturating_sub(sess.end()) < 5 {
                t = sess.end();
            }
            let wanted = sess.end() >= t
                && sess.start() <= t
                && (req.streams.is_empty() || req.streams.contains(&idx.stream))
                && (req.protocols.is_empty() || req.protocols.contains(&idx.connector));
            if !wanted || !sess.has_data_for(t) {
                continue;
            }
            let mut row: Vec<serde_json::Value> = Vec::new();
            if fields & STAT_CLI_HOST != 0 {
                row.push(idx.host.clone().into());
            }
            if fields & STAT_CLI_STREAM != 0 {
                row.push(idx.stream.clone().into());
            }
            if fields & STAT_CLI_PROTO != 0 {
                row.push(idx.connector.clone().into());
            }
            if fields & STAT_CLI_CONNTIME != 0 {
                row.push(sess.conn_time_at(t).into());
            }
            if fields & STAT_CLI_POSITION != 0 {
                row.push(sess.last_second_at(t).into());
            }
            if fields & STAT_CLI_DOWN != 0 {
                row.push(sess.down_at(t).into());
            }
            if fields & STAT_CLI_UP != 0 {
                row.push(sess.up_at(t).into());
            }
            if fields & STAT_CLI_BPS_DOWN != 0 {
                row.push(sess.bps_down_at(t).into());
            }
            if fields & STAT_CLI_BPS_UP != 0 {
                row.push(sess.bps_up_at(t).into());
            }
            if fields & STAT_CLI_CRC != 0 {
                row.push(idx.crc.into());
            }
            reply.data.push(row);
        }
        reply
    }

    /// Fills a `totals` request: per-second aggregates over a window, with
    /// equal step sizes compressed into `(count, step)` interval pairs.
    pub fn fill_totals(&self, req: &TotalsRequest, now: u64) -> TotalsReply {
        let now_i = i64::try_from(now).unwrap_or(i64::MAX);
        let mut req_start = req.start.unwrap_or(0);
        let mut req_end = req.end.unwrap_or(0);
        if req_start < 0 {
            req_start += now_i;
        }
        if req_start == 0 {
            req_start = now_i - i64::try_from(STAT_CUTOFF_SECS).unwrap_or(0);
        }
        if req_end <= 0 {
            req_end += now_i;
        }
        let req_start = u64::try_from(req_start).unwrap_or(0);
        let req_end = u64::try_from(req_end).unwrap_or(0);

        let mut fields = 0u32;
        for f in &req.fields {
            fields |= match f.as_str() {
                "clients" => STAT_TOT_CLIENTS,
                "inputs" => STAT_TOT_INPUTS,
                "outputs" => STAT_TOT_OUTPUTS,
                "downbps" => STAT_TOT_BPS_DOWN,
                "upbps" => STAT_TOT_BPS_UP,
                _ => 0,
            };
        }
        if fields == 0 {
            fields = STAT_TOT_ALL;
        }

        #[derive(Default, Clone, Copy)]
        struct Bucket {
            clients: u64,
            inputs: u64,
            outputs: u64,
            downbps: u64,
            upbps: u64,
        }
        let mut buckets: BTreeMap<u64, Bucket> = BTreeMap::new();
        for (idx, sess) in &self.sessions {
            let in_window = sess.end() >= req_start || sess.start() <= req_end;
            let wanted = in_window
                && (req.streams.is_empty() || req.streams.contains(&idx.stream))
                && (req.protocols.is_empty() || req.protocols.contains(&idx.connector));
            if !wanted {
                continue;
            }
            for t in req_start..=req_end {
                if !sess.has_data_for(t) {
                    continue;
                }
                let bucket = buckets.entry(t).or_default();
                match sess.sess_type() {
                    SessType::Viewer => bucket.clients += 1,
                    SessType::Input => bucket.inputs += 1,
                    SessType::Output => bucket.outputs += 1,
                    SessType::Unset => {},
                }
                bucket.downbps += sess.bps_down_at(t);
                bucket.upbps += sess.bps_up_at(t);
            }
        }

        let mut reply = TotalsReply::default();
        for (name, bit) in [
            ("clients", STAT_TOT_CLIENTS),
            ("inputs", STAT_TOT_INPUTS),
            ("outputs", STAT_TOT_OUTPUTS),
            ("downbps", STAT_TOT_BPS_DOWN),
            ("upbps", STAT_TOT_BPS_UP),
        ] {
            if fields & bit != 0 {
                reply.fields.push(name.to_string());
            }
        }
        let Some((&first, _)) = buckets.first_key_value() else {
            return reply;
        };
        let Some((&last, _)) = buckets.last_key_value() else {
            return reply;
        };
        reply.start = first;
        reply.end = last;

        let mut prev_t = 0u64;
        let mut run: Option<(u64, u64)> = None;
        for (&t, bucket) in &buckets {
            let mut row = Vec::new();
            if fields & STAT_TOT_CLIENTS != 0 {
                row.push(bucket.clients);
            }
            if fields & STAT_TOT_INPUTS != 0 {
                row.push(bucket.inputs);
            }
            if fields & STAT_TOT_OUTPUTS != 0 {
                row.push(bucket.outputs);
            }
            if fields & STAT_TOT_BPS_DOWN != 0 {
                row.push(bucket.downbps);
            }
            if fields & STAT_TOT_BPS_UP != 0 {
                row.push(bucket.upbps);
            }
            reply.data.push(row);

            if prev_t > 0 {
                let step = t - prev_t;
                run = match run {
                    None => Some((1, step)),
                    Some((count, prev_step)) if prev_step == step => Some((count + 1, step)),
                    Some(done) => {
                        reply.interval.push(done);
                        Some((1, step))
                    },
                };
            }
            prev_t = t;
        }
        if let Some(done) = run {
            reply.interval.push(done);
        }
        reply
    }
}

/// A `clients` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientsRequest {
    #[serde(default)]
    pub streams: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    /// Unix timestamp; zero or negative means relative to now.
    #[serde(default)]
    pub time: Option<i64>,
}

/// Reply to a `clients` query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientsReply {
    pub time: u64,
    pub fields: Vec<String>,
    pub data: Vec<Vec<serde_json::Value>>,
}

/// A `totals` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TotalsRequest {
    #[serde(default)]
    pub streams: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

/// Reply to a `totals` query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TotalsReply {
    pub start: u64,
    pub end: u64,
    pub fields: Vec<String>,
    pub data: Vec<Vec<u64>>,
    /// Runs of equal step sizes as `(count, step)` pairs.
    pub interval: Vec<(u64, u64)>,
}
