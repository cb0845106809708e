// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The access log: one record per retired session.

use crate::session::AccessEvent;
use manifold_core::Result;
use manifold_shm::{names, FieldSpec, RelTable, SharedPage};

const LOG_PAGE_SIZE: usize = 64 * 1024;

fn schema() -> Vec<FieldSpec> {
    vec![
        FieldSpec::int("time"),
        FieldSpec::str("stream", 100),
        FieldSpec::str("connector", 20),
        FieldSpec::str("host", 64),
        FieldSpec::int("duration"),
        FieldSpec::int("up"),
        FieldSpec::int("down"),
    ]
}

/// Writer over the shared access-log table. Oldest records are dropped
/// once the ring fills.
pub struct AccessLog {
    table: RelTable,
}

impl AccessLog {
    pub fn create() -> Result<Self> {
        let page = SharedPage::create(names::ACCESS_LOG, LOG_PAGE_SIZE)?;
        let table = RelTable::create(page, &schema())?;
        Ok(Self { table })
    }

    /// Appends one access record, evicting the oldest when full.
    pub fn log(&mut self, now: u64, event: &AccessEvent) -> Result<()> {
        let row = match self.table.add_record() {
            Ok(row) => row,
            Err(_) => {
                self.table.set_deleted(self.table.deleted() + 1)?;
                self.table.add_record()?
            },
        };
        self.table.set_int("time", row, now)?;
        self.table.set_str("stream", row, &event.stream)?;
        self.table.set_str("connector", row, &event.connector)?;
        self.table.set_str("host", row, &event.host)?;
        self.table.set_int("duration", row, event.duration)?;
        self.table.set_int("up", row, event.up)?;
        self.table.set_int("down", row, event.down)
    }

    /// All retained records, oldest first.
    pub fn entries(&self) -> Vec<(u64, AccessEvent)> {
        (self.table.deleted()..self.table.end_pos())
            .filter_map(|row| {
                Some((
                    self.table.get_int("time", row).ok()?,
                    AccessEvent {
                        stream: self.table.get_str("stream", row).ok()?,
                        connector: self.table.get_str("connector", row).ok()?,
                        host: self.table.get_str("host", row).ok()?,
                        duration: self.table.get_int("duration", row).ok()?,
                        up: self.table.get_int("up", row).ok()?,
                        down: self.table.get_int("down", row).ok()?,
                    },
                ))
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_log_round_trip() {
        let mut log = AccessLog::create().unwrap();
        let event = AccessEvent {
            stream: "live1".to_string(),
            connector: "raw".to_string(),
            host: "10.0.0.1".to_string(),
            duration: 42,
            up: 100,
            down: 200_000,
        };
        log.log(1_700_000_000, &event).unwrap();
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, 1_700_000_000);
        assert_eq!(entries[0].1, event);
    }
}
