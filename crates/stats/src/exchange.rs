// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The statistics exchange page.
//!
//! Every input and output process periodically writes one record to the
//! `MstStatistics` relational table; the controller-side aggregator reads
//! all of them once per second. The control field follows the slot
//! heartbeat convention: 1..=125 cycling while connected, 126/127 meaning
//! "disconnecting - last record".

use manifold_core::{ManifoldError, Result};
use manifold_shm::{names, FieldSpec, NamedSemaphore, RelTable, SharedPage};

/// Size of the statistics exchange page.
pub const STAT_PAGE_SIZE: usize = 256 * 1024;

/// Control value marking a connection's final record.
pub const CTRL_DISCONNECT: u64 = 126;

const HEARTBEAT_MAX: u64 = 125;

fn schema() -> Vec<FieldSpec> {
    vec![
        FieldSpec::int("ctrl"),
        FieldSpec::str("host", 16),
        FieldSpec::str("stream", 100),
        FieldSpec::str("connector", 20),
        FieldSpec::int("crc"),
        FieldSpec::int("now"),
        FieldSpec::int("time"),
        FieldSpec::int("lastsecond"),
        FieldSpec::int("up"),
        FieldSpec::int("down"),
    ]
}

/// One statistics sample as written by a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatRecord {
    /// Raw 16-byte client address (IPv4 addresses are v6-mapped).
    pub host: [u8; 16],
    pub stream: String,
    pub connector: String,
    pub crc: u32,
    /// Wall time of this sample, unix seconds.
    pub now: u64,
    /// Seconds this connection has been up.
    pub time: u64,
    /// Media timestamp last requested, in milliseconds.
    pub last_second: u64,
    pub up: u64,
    pub down: u64,
}

/// Renders a binary host address the way the aggregator indexes it.
pub fn host_to_string(host: &[u8; 16]) -> String {
    if host[..10] == [0u8; 10] && host[10] == 0xff && host[11] == 0xff {
        return format!("{}.{}.{}.{}", host[12], host[13], host[14], host[15]);
    }
    if host == &[0u8; 16] {
        return String::new();
    }
    let mut out = String::new();
    for (i, pair) in host.chunks(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{:02x}{:02x}", pair[0], pair[1]));
    }
    out
}

/// Aggregator-side ownership of the exchange page.
pub struct StatServer {
    table: RelTable,
}

impl StatServer {
    /// Creates the exchange page. Run by the controller before anything
    /// else starts reporting.
    pub fn create() -> Result<Self> {
        let page = SharedPage::create(names::STATISTICS, STAT_PAGE_SIZE)?;
        let table = RelTable::create(page, &schema())?;
        Ok(Self { table })
    }

    /// Reads all live records as `(connection id, control, record)`.
    pub fn scan(&self) -> Vec<(u64, u64, StatRecord)> {
        let mut out = Vec::new();
        for row in self.table.deleted()..self.table.end_pos() {
            let Ok(ctrl) = self.table.get_int("ctrl", row) else { continue };
            if ctrl == 0 {
                continue;
            }
            if let Ok(record) = read_record(&self.table, row) {
                out.push((row, ctrl, record));
            }
        }
        out
    }

    /// Frees a finished connection's row and advances the head past any
    /// leading dead rows.
    pub fn release(&mut self, row: u64) -> Result<()> {
        self.table.set_int("ctrl", row, 0)?;
        let mut deleted = self.table.deleted();
        while deleted < self.table.end_pos() && self.table.get_int("ctrl", deleted)? == 0 {
            deleted += 1;
        }
        self.table.set_deleted(deleted)
    }
}

fn read_record(table: &RelTable, row: u64) -> Result<StatRecord> {
    let mut host = [0u8; 16];
    host.copy_from_slice(table.get_bytes("host", row)?);
    Ok(StatRecord {
        host,
        stream: table.get_str("stream", row)?,
        connector: table.get_str("connector", row)?,
        crc: u32::try_from(table.get_int("crc", row)?).unwrap_or(u32::MAX),
        now: table.get_int("now", row)?,
        time: table.get_int("time", row)?,
        last_second: table.get_int("lastsecond", row)?,
        up: table.get_int("up", row)?,
        down: table.get_int("down", row)?,
    })
}

/// A connection's writing end of the exchange page.
pub struct StatHandle {
    table: RelTable,
    row: u64,
    counter: u64,
}

impl StatHandle {
    /// Claims a row on the exchange page. Row claiming is serialized by
    /// the page's name lock.
    pub fn connect() -> Result<Self> {
        let page = SharedPage::open_rw(names::STATISTICS, STAT_PAGE_SIZE)?;
        let mut table = RelTable::open(page)?;
        let mut guard = NamedSemaphore::open(names::STATISTICS)?;
        guard.wait()?;
        let row = table.add_record();
        guard.post();
        let row = row.map_err(|e| {
            ManifoldError::Fatal(format!("statistics exchange is full: {e}"))
        })?;
        Ok(Self { table, row, counter: 0 })
    }

    /// Publishes one sample, advancing the heartbeat.
    pub fn write(&mut self, record: &StatRecord) -> Result<()> {
        self.counter = if self.counter >= HEARTBEAT_MAX { 1 } else { self.counter + 1 };
        let row = self.row;
        self.table.set_bytes("host", row, &record.host)?;
        self.table.set_str("stream", row, &record.stream)?;
        self.table.set_str("connector", row, &record.connector)?;
        self.table.set_int("crc", row, u64::from(record.crc))?;
        self.table.set_int("now", row, record.now)?;
        self.table.set_int("time", row, record.time)?;
        self.table.set_int("lastsecond", row, record.last_second)?;
        self.table.set_int("up", row, record.up)?;
        self.table.set_int("down", row, record.down)?;
        self.table.set_int("ctrl", row, self.counter)
    }

    /// Marks this connection's record as final.
    pub fn finish(&mut self) {
        let _ = self.table.set_int("ctrl", self.row, CTRL_DISCONNECT);
    }
}

impl Drop for StatHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_host_rendering() {
        let mut v4 = [0u8; 16];
        v4[10] = 0xff;
        v4[11] = 0xff;
        v4[12..].copy_from_slice(&[192, 168, 1, 10]);
        assert_eq!(host_to_string(&v4), "192.168.1.10");

        assert_eq!(host_to_string(&[0u8; 16]), "");

        let mut v6 = [0u8; 16];
        v6[0] = 0x20;
        v6[1] = 0x01;
        v6[15] = 0x01;
        assert!(host_to_string(&v6).starts_with("2001:"));
    }

    #[test]
    fn test_write_scan_release() {
        // The exchange page name is global per host; this test owns it for
        // the duration of the process.
        let server = StatServer::create().unwrap();
        let mut handle = StatHandle::connect().unwrap();

        let mut record = StatRecord {
            stream: "live1".to_string(),
            connector: "raw".to_string(),
            crc: 4242,
            now: 1000,
            time: 5,
            last_second: 12_000,
            up: 100,
            down: 9_000,
            ..Default::default()
        };
        record.host[10] = 0xff;
        record.host[11] = 0xff;
        record.host[12..].copy_from_slice(&[10, 0, 0, 1]);
        handle.write(&record).unwrap();

        let scanned = server.scan();
        assert_eq!(scanned.len(), 1);
        let (row, ctrl, read) = &scanned[0];
        assert_eq!(*ctrl, 1);
        assert_eq!(read, &record);

        handle.finish();
        let scanned = server.scan();
        assert_eq!(scanned[0].1, CTRL_DISCONNECT);

        let mut server = server;
        server.release(*row).unwrap();
        assert!(server.scan().is_empty());
    }
}
