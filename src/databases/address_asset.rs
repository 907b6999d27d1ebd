use std::path::Path;
use std::sync::Arc;

use crate::chain::{Attachment, Point, ShortHash};
use crate::constants::{BUSINESS_ROW_SIZE, HISTORY_ROW_SIZE, MAX_BUSINESS_DATA, SHORT_HASH_SIZE};
use crate::databases::history::{hex, HistoryRow, PointKind};
use crate::databases::{open, start_files, Component};
use crate::error::{Error, Result};
use crate::memory::{MappedFile, RemapLock};
use crate::multimap::RecordMultimap;
use crate::serial::Reader;
use crate::types::StatInfo;

/// One business (attachment carrying) history entry of an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessRow {
    pub row: HistoryRow,
    pub attachment: Attachment,
    /// Timestamp of the block header
    pub timestamp: u32,
}

impl BusinessRow {
    /// Check that `attachment` fits the fixed row.
    pub fn validate(attachment: &Attachment) -> Result<Vec<u8>> {
        let body = attachment.body();
        if body.len() > MAX_BUSINESS_DATA {
            return Err(Error::BadValueSize {
                what: "business attachment",
                size: body.len(),
                max: MAX_BUSINESS_DATA,
            });
        }
        Ok(body)
    }

    fn write_to(row: &HistoryRow, kind: u16, timestamp: u32, body: &[u8], data: &mut [u8]) {
        row.write_to(&mut data[..HISTORY_ROW_SIZE]);
        let mut position = HISTORY_ROW_SIZE;
        data[position..position + 2].copy_from_slice(&kind.to_le_bytes());
        position += 2;
        data[position..position + 4].copy_from_slice(&timestamp.to_le_bytes());
        position += 4;
        data[position..position + 2].copy_from_slice(&(body.len() as u16).to_le_bytes());
        position += 2;
        data[position..position + body.len()].copy_from_slice(body);
    }

    fn read_from(data: &[u8]) -> Result<Self> {
        let row = HistoryRow::read_from(&data[..HISTORY_ROW_SIZE])?;
        let mut reader = Reader::new(&data[HISTORY_ROW_SIZE..]);
        let kind = reader.read_u16()?;
        let timestamp = reader.read_u32()?;
        let len = reader.read_u16()? as usize;
        if len > MAX_BUSINESS_DATA {
            return Err(Error::Corrupted(format!(
                "business row data length {} exceeds {}",
                len, MAX_BUSINESS_DATA
            )));
        }
        let body = reader.read_bytes(len)?;

        Ok(BusinessRow {
            row,
            attachment: Attachment::from_body(kind, body)?,
            timestamp,
        })
    }
}

/// Address hash to most-recent-first business rows (ETP and asset moves).
#[derive(Debug)]
pub struct AddressAssetDatabase {
    lookup_file: Arc<MappedFile>,
    rows_file: Arc<MappedFile>,
    rows: RecordMultimap<SHORT_HASH_SIZE>,
}

impl AddressAssetDatabase {
    pub fn new(
        lookup_path: &Path,
        rows_path: &Path,
        bucket_count: u64,
        remap_lock: &RemapLock,
    ) -> Result<Self> {
        let lookup_file = open(lookup_path, remap_lock);
        let rows_file = open(rows_path, remap_lock);
        Ok(AddressAssetDatabase {
            rows: RecordMultimap::new(
                lookup_file.clone(),
                rows_file.clone(),
                bucket_count,
                BUSINESS_ROW_SIZE,
            )?,
            lookup_file,
            rows_file,
        })
    }

    pub fn add_output(
        &self,
        key: &ShortHash,
        outpoint: &Point,
        height: u32,
        value: u64,
        attachment: &Attachment,
        timestamp: u32,
    ) -> Result<()> {
        let row = HistoryRow {
            kind: PointKind::Output,
            point: *outpoint,
            height,
            value,
        };
        self.add(key, &row, attachment, timestamp)
    }

    pub fn add_input(
        &self,
        key: &ShortHash,
        inpoint: &Point,
        height: u32,
        previous: &Point,
        attachment: &Attachment,
        timestamp: u32,
    ) -> Result<()> {
        let row = HistoryRow {
            kind: PointKind::Spend,
            point: *inpoint,
            height,
            value: previous.checksum(),
        };
        self.add(key, &row, attachment, timestamp)
    }

    /// Remove the newest row of `key`, which must be the `kind` row for
    /// `point`.
    pub fn delete_last_row(&self, key: &ShortHash, kind: PointKind, point: &Point) -> Result<()> {
        let head = self.rows.lookup(key)?.head().ok_or_else(|| {
            Error::invariant(format!("business history of {} has no rows to delete", hex(key)))
        })?;

        let row = HistoryRow::read_from(self.rows.get(head)?.bytes(0, HISTORY_ROW_SIZE)?)?;
        if row.kind != kind || row.point != *point {
            return Err(Error::invariant(format!(
                "out of order business delete for {}",
                hex(key)
            )));
        }

        self.rows.delete_last_row(key)?;
        Ok(())
    }

    /// Business rows of `key`, newest first, with the same `limit` and
    /// `from_height` rules as address history.
    pub fn get(&self, key: &ShortHash, limit: usize, from_height: u32) -> Result<Vec<BusinessRow>> {
        let mut result = Vec::new();
        for index in self.rows.rows(key)? {
            if limit > 0 && result.len() >= limit {
                break;
            }

            let memory = self.rows.get(index?)?;
            if from_height == 0 || HistoryRow::height_of(&memory)? >= from_height {
                result.push(BusinessRow::read_from(memory.bytes(0, BUSINESS_ROW_SIZE)?)?);
            }
        }
        Ok(result)
    }

    pub fn statinfo(&self) -> StatInfo {
        self.rows.statinfo()
    }

    fn add(&self, key: &ShortHash, row: &HistoryRow, attachment: &Attachment, timestamp: u32) -> Result<()> {
        let body = BusinessRow::validate(attachment)?;
        let kind = attachment.kind();
        self.rows
            .add_row(key, |data| BusinessRow::write_to(row, kind, timestamp, &body, data))?;
        Ok(())
    }
}

impl Component for AddressAssetDatabase {
    fn files(&self) -> Vec<&Arc<MappedFile>> {
        vec![&self.lookup_file, &self.rows_file]
    }

    fn create(&self) -> Result<()> {
        start_files(self)?;
        self.rows.create()
    }

    fn start(&self) -> Result<()> {
        start_files(self)?;
        self.rows.start()
    }

    fn sync(&self) -> Result<()> {
        self.rows.sync()
    }
}
