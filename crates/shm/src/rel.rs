// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Typed relational accessor over a shared page.
//!
//! A `RelTable` is an append-only table with a fixed field schema and
//! head/tail row pointers, used for the statistics exchange, the stream
//! totals mirror, and the access log. Readers address values by
//! `(field name, row index)`; rows wrap physically once the page fills, so
//! the table behaves as a ring bounded by `deleted..end_pos`.
//!
//! Page layout:
//!
//! ```text
//! [0]      ready flag, written last during initialization
//! [1]      field count
//! [2..6]   record size (u32 BE)
//! [6..14]  deleted / head row (u64 BE)
//! [14..22] end / tail row (u64 BE)
//! [22..26] data offset (u32 BE)
//! [26..]   field entries: name_len, name, kind, size (u32 BE)
//! [data_offset..] fixed-size records
//! ```

use crate::page::SharedPage;
use manifold_core::{ManifoldError, Result};

const HDR_READY: usize = 0;
const HDR_FIELD_COUNT: usize = 1;
const HDR_RECORD_SIZE: usize = 2;
const HDR_DELETED: usize = 6;
const HDR_END: usize = 14;
const HDR_DATA_OFFSET: usize = 22;
const HDR_FIELDS: usize = 26;

/// Value kind of one table field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Unsigned 64-bit integer, big-endian, fixed 8 bytes.
    Int,
    /// Fixed-size byte region; strings are NUL-padded.
    Str,
}

/// Schema entry for one field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub size: u32,
}

impl FieldSpec {
    pub fn int(name: &str) -> Self {
        Self { name: name.to_string(), kind: FieldKind::Int, size: 8 }
    }

    pub fn str(name: &str, size: u32) -> Self {
        Self { name: name.to_string(), kind: FieldKind::Str, size }
    }
}

struct FieldSlot {
    spec: FieldSpec,
    offset: usize,
}

/// A typed table over a shared page.
pub struct RelTable {
    page: SharedPage,
    fields: Vec<FieldSlot>,
    record_size: usize,
    data_offset: usize,
}

impl RelTable {
    /// Initializes a fresh table on the given page. The ready flag is
    /// written last so a concurrent reader never parses a half-written
    /// header.
    pub fn create(mut page: SharedPage, specs: &[FieldSpec]) -> Result<Self> {
        let field_count = u8::try_from(specs.len())
            .map_err(|_| ManifoldError::Fatal("too many table fields".to_string()))?;
        let mut fields = Vec::with_capacity(specs.len());
        let mut record_size = 0usize;
        let mut header_len = HDR_FIELDS;
        for spec in specs {
            if spec.kind == FieldKind::Int && spec.size != 8 {
                return Err(ManifoldError::Fatal(format!("int field {} must be 8 bytes", spec.name)));
            }
            header_len += 1 + spec.name.len() + 1 + 4;
            fields.push(FieldSlot { spec: spec.clone(), offset: record_size });
            record_size += spec.size as usize;
        }
        if header_len + record_size > page.len() {
            return Err(ManifoldError::Fatal(format!(
                "page {} too small for table schema",
                page.name()
            )));
        }

        let buf = page.bytes_mut()?;
        buf[HDR_READY] = 0;
        buf[HDR_FIELD_COUNT] = field_count;
        buf[HDR_RECORD_SIZE..HDR_RECORD_SIZE + 4]
            .copy_from_slice(&u32::try_from(record_size).unwrap_or(u32::MAX).to_be_bytes());
        buf[HDR_DELETED..HDR_DELETED + 8].copy_from_slice(&0u64.to_be_bytes());
        buf[HDR_END..HDR_END + 8].copy_from_slice(&0u64.to_be_bytes());
        buf[HDR_DATA_OFFSET..HDR_DATA_OFFSET + 4]
            .copy_from_slice(&u32::try_from(header_len).unwrap_or(u32::MAX).to_be_bytes());
        let mut pos = HDR_FIELDS;
        for spec in specs {
            buf[pos] = u8::try_from(spec.name.len())
                .map_err(|_| ManifoldError::Fatal(format!("field name {} too long", spec.name)))?;
            pos += 1;
            buf[pos..pos + spec.name.len()].copy_from_slice(spec.name.as_bytes());
            pos += spec.name.len();
            buf[pos] = match spec.kind {
                FieldKind::Int => 1,
                FieldKind::Str => 2,
            };
            pos += 1;
            buf[pos..pos + 4].copy_from_slice(&spec.size.to_be_bytes());
            pos += 4;
        }
        buf[HDR_READY] = 1;

        Ok(Self { page, fields, record_size, data_offset: header_len })
    }

    /// Attaches to an already initialized table.
    pub fn open(page: SharedPage) -> Result<Self> {
        let buf = page.bytes();
        if buf.len() < HDR_FIELDS || buf[HDR_READY] == 0 {
            return Err(ManifoldError::NotReady(format!("table on page {}", page.name())));
        }
        let field_count = buf[HDR_FIELD_COUNT] as usize;
        let record_size = read_u32(buf, HDR_RECORD_SIZE) as usize;
        let data_offset = read_u32(buf, HDR_DATA_OFFSET) as usize;
        let mut fields = Vec::with_capacity(field_count);
        let mut pos = HDR_FIELDS;
        let mut offset = 0usize;
        for _ in 0..field_count {
            let name_len = *buf
                .get(pos)
                .ok_or_else(|| ManifoldError::Corruption("table header truncated".to_string()))?
                as usize;
            pos += 1;
            let name = String::from_utf8_lossy(&buf[pos..pos + name_len]).into_owned();
            pos += name_len;
            let kind = match buf[pos] {
                1 => FieldKind::Int,
                2 => FieldKind::Str,
                other => {
                    return Err(ManifoldError::Corruption(format!("unknown field kind {other}")))
                },
            };
            pos += 1;
            let size = read_u32(buf, pos);
            pos += 4;
            fields.push(FieldSlot { spec: FieldSpec { name, kind, size }, offset });
            offset += size as usize;
        }
        if offset != record_size || data_offset != pos {
            return Err(ManifoldError::Corruption(format!(
                "table header on page {} is inconsistent",
                page.name()
            )));
        }
        Ok(Self { page, fields, record_size, data_offset })
    }

    /// Number of rows the page can hold at once.
    pub fn capacity(&self) -> u64 {
        ((self.page.len() - self.data_offset) / self.record_size) as u64
    }

    /// First still-present row.
    pub fn deleted(&self) -> u64 {
        read_u64(self.page.bytes(), HDR_DELETED)
    }

    /// One past the last present row.
    pub fn end_pos(&self) -> u64 {
        read_u64(self.page.bytes(), HDR_END)
    }

    pub fn set_deleted(&mut self, v: u64) -> Result<()> {
        self.page.bytes_mut()?[HDR_DELETED..HDR_DELETED + 8].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn set_end_pos(&mut self, v: u64) -> Result<()> {
        self.page.bytes_mut()?[HDR_END..HDR_END + 8].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Appends one zeroed record and returns its row index.
    pub fn add_record(&mut self) -> Result<u64> {
        let row = self.end_pos();
        if row - self.deleted() >= self.capacity() {
            return Err(ManifoldError::Fatal(format!("table on page {} is full", self.page.name())));
        }
        let start = self.record_offset(row);
        let record_size = self.record_size;
        let buf = self.page.bytes_mut()?;
        buf[start..start + record_size].fill(0);
        self.set_end_pos(row + 1)?;
        Ok(row)
    }

    pub fn set_int(&mut self, field: &str, row: u64, value: u64) -> Result<()> {
        let (offset, _) = self.locate(field, FieldKind::Int)?;
        let start = self.record_offset(row) + offset;
        self.page.bytes_mut()?[start..start + 8].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn get_int(&self, field: &str, row: u64) -> Result<u64> {
        let (offset, _) = self.locate(field, FieldKind::Int)?;
        Ok(read_u64(self.page.bytes(), self.record_offset(row) + offset))
    }

    /// Writes a NUL-padded string value, truncated to the field size.
    pub fn set_str(&mut self, field: &str, row: u64, value: &str) -> Result<()> {
        let (offset, size) = self.locate(field, FieldKind::Str)?;
        let start = self.record_offset(row) + offset;
        let buf = self.page.bytes_mut()?;
        let dst = &mut buf[start..start + size];
        dst.fill(0);
        let n = value.len().min(size);
        dst[..n].copy_from_slice(&value.as_bytes()[..n]);
        Ok(())
    }

    pub fn get_str(&self, field: &str, row: u64) -> Result<String> {
        let raw = self.get_bytes(field, row)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// Raw fixed-size field content, NULs included. Used for binary hosts.
    pub fn get_bytes(&self, field: &str, row: u64) -> Result<&[u8]> {
        let (offset, size) = self.locate(field, FieldKind::Str)?;
        let start = self.record_offset(row) + offset;
        Ok(&self.page.bytes()[start..start + size])
    }

    pub fn set_bytes(&mut self, field: &str, row: u64, value: &[u8]) -> Result<()> {
        let (offset, size) = self.locate(field, FieldKind::Str)?;
        let start = self.record_offset(row) + offset;
        let buf = self.page.bytes_mut()?;
        let dst = &mut buf[start..start + size];
        dst.fill(0);
        let n = value.len().min(size);
        dst[..n].copy_from_slice(&value[..n]);
        Ok(())
    }

    pub fn page(&self) -> &SharedPage {
        &self.page
    }

    pub fn page_mut(&mut self) -> &mut SharedPage {
        &mut self.page
    }

    fn record_offset(&self, row: u64) -> usize {
        let slot = row % self.capacity();
        self.data_offset + (slot as usize) * self.record_size
    }

    fn locate(&self, field: &str, kind: FieldKind) -> Result<(usize, usize)> {
        self.fields
            .iter()
            .find(|f| f.spec.name == field)
            .filter(|f| f.spec.kind == kind)
            .map(|f| (f.offset, f.spec.size as usize))
            .ok_or_else(|| ManifoldError::NotFound(format!("table field {field}")))
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(b)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(b)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn unique(name: &str) -> String {
        format!("{}-{}-{}", name, std::process::id(), line!())
    }

    fn schema() -> Vec<FieldSpec> {
        vec![FieldSpec::str("stream", 32), FieldSpec::int("viewers"), FieldSpec::int("status")]
    }

    #[test]
    fn test_create_write_reopen() {
        let name = unique("MstTestTbl");
        let page = SharedPage::create(&name, 4096).unwrap();
        let mut table = RelTable::create(page, &schema()).unwrap();

        let row = table.add_record().unwrap();
        table.set_str("stream", row, "live1").unwrap();
        table.set_int("viewers", row, 7).unwrap();
        table.set_int("status", row, 4).unwrap();

        // A second process maps the same page read-only.
        let reader = RelTable::open(SharedPage::open(&name).unwrap()).unwrap();
        assert_eq!(reader.end_pos(), 1);
        assert_eq!(reader.get_str("stream", row).unwrap(), "live1");
        assert_eq!(reader.get_int("viewers", row).unwrap(), 7);
        assert_eq!(reader.get_int("status", row).unwrap(), 4);
    }

    #[test]
    fn test_head_tail_window() {
        let name = unique("MstTestTbl");
        let page = SharedPage::create(&name, 4096).unwrap();
        let mut table = RelTable::create(page, &schema()).unwrap();
        for i in 0..4 {
            let row = table.add_record().unwrap();
            table.set_int("viewers", row, i).unwrap();
        }
        table.set_deleted(2).unwrap();
        assert_eq!(table.deleted(), 2);
        assert_eq!(table.end_pos(), 4);
        assert_eq!(table.get_int("viewers", 3).unwrap(), 3);
    }

    #[test]
    fn test_rows_wrap_physically() {
        let name = unique("MstTestTbl");
        // Small page: header + room for few records.
        let page = SharedPage::create(&name, 512).unwrap();
        let mut table = RelTable::create(page, &schema()).unwrap();
        let cap = table.capacity();
        assert!(cap >= 2);
        for i in 0..cap {
            let row = table.add_record().unwrap();
            table.set_int("viewers", row, i).unwrap();
        }
        // Full table refuses new records until the head advances.
        assert!(table.add_record().is_err());
        table.set_deleted(1).unwrap();
        let row = table.add_record().unwrap();
        table.set_int("viewers", row, 99).unwrap();
        assert_eq!(table.get_int("viewers", row).unwrap(), 99);
    }

    #[test]
    fn test_unknown_field_not_found() {
        let name = unique("MstTestTbl");
        let page = SharedPage::create(&name, 4096).unwrap();
        let table = RelTable::create(page, &schema()).unwrap();
        assert!(table.get_int("nope", 0).is_err());
    }

    #[test]
    fn test_binary_field_keeps_interior_nuls() {
        let name = unique("MstTestTbl");
        let page = SharedPage::create(&name, 4096).unwrap();
        let mut table =
            RelTable::create(page, &[FieldSpec::str("host", 16), FieldSpec::int("crc")]).unwrap();
        let row = table.add_record().unwrap();
        let host = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 10, 0, 0, 1];
        table.set_bytes("host", row, &host).unwrap();
        assert_eq!(table.get_bytes("host", row).unwrap(), &host);
    }
}
