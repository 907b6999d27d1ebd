use std::path::Path;
use std::sync::Arc;

use crate::chain::{Point, ShortHash};
use crate::constants::{HISTORY_HEIGHT_OFFSET, HISTORY_ROW_SIZE, POINT_SIZE, SHORT_HASH_SIZE};
use crate::databases::{open, start_files, Component};
use crate::error::{Error, Result};
use crate::memory::{Accessor, MappedFile, RemapLock};
use crate::multimap::RecordMultimap;
use crate::serial::Reader;
use crate::types::StatInfo;

/// Whether a history row records a received output or a spend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    Output = 0,
    Spend = 1,
}

impl PointKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PointKind::Output),
            1 => Ok(PointKind::Spend),
            other => Err(Error::Corrupted(format!("unknown point kind {}", other))),
        }
    }
}

/// One address history entry.
///
/// Layout: `[kind: u8][point: 36][height: u32][value_or_checksum: u64]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRow {
    pub kind: PointKind,
    /// The output for `Output` rows, the spending input for `Spend` rows
    pub point: Point,
    pub height: u32,
    /// Output value, or the checksum of the spent output
    pub value: u64,
}

impl HistoryRow {
    pub(crate) fn write_to(&self, data: &mut [u8]) {
        data[0] = self.kind as u8;
        data[1..1 + POINT_SIZE].copy_from_slice(&self.point.to_bytes());
        data[HISTORY_HEIGHT_OFFSET..HISTORY_HEIGHT_OFFSET + 4]
            .copy_from_slice(&self.height.to_le_bytes());
        data[HISTORY_HEIGHT_OFFSET + 4..HISTORY_ROW_SIZE]
            .copy_from_slice(&self.value.to_le_bytes());
    }

    pub(crate) fn read_from(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(HistoryRow {
            kind: PointKind::from_u8(reader.read_u8()?)?,
            point: Point::from_reader(&mut reader)?,
            height: reader.read_u32()?,
            value: reader.read_u64()?,
        })
    }

    pub(crate) fn height_of(memory: &Accessor<'_>) -> Result<u32> {
        memory.read_u32(HISTORY_HEIGHT_OFFSET)
    }
}

/// Address hash to most-recent-first history rows.
#[derive(Debug)]
pub struct HistoryDatabase {
    lookup_file: Arc<MappedFile>,
    rows_file: Arc<MappedFile>,
    rows: RecordMultimap<SHORT_HASH_SIZE>,
}

impl HistoryDatabase {
    pub fn new(
        lookup_path: &Path,
        rows_path: &Path,
        bucket_count: u64,
        remap_lock: &RemapLock,
    ) -> Result<Self> {
        let lookup_file = open(lookup_path, remap_lock);
        let rows_file = open(rows_path, remap_lock);
        Ok(HistoryDatabase {
            rows: RecordMultimap::new(
                lookup_file.clone(),
                rows_file.clone(),
                bucket_count,
                HISTORY_ROW_SIZE,
            )?,
            lookup_file,
            rows_file,
        })
    }

    /// Record `value` received by `key` at `outpoint`.
    pub fn add_output(&self, key: &ShortHash, outpoint: &Point, height: u32, value: u64) -> Result<()> {
        let row = HistoryRow {
            kind: PointKind::Output,
            point: *outpoint,
            height,
            value,
        };
        self.rows.add_row(key, |data| row.write_to(data))?;
        Ok(())
    }

    /// Record `key` spending `previous` through the input at `inpoint`.
    pub fn add_input(&self, key: &ShortHash, inpoint: &Point, height: u32, previous: &Point) -> Result<()> {
        let row = HistoryRow {
            kind: PointKind::Spend,
            point: *inpoint,
            height,
            value: previous.checksum(),
        };
        self.rows.add_row(key, |data| row.write_to(data))?;
        Ok(())
    }

    /// Remove the newest row of `key`, which must be the `kind` row for
    /// `point`. Any other head means the undo order broke.
    pub fn delete_last_row(&self, key: &ShortHash, kind: PointKind, point: &Point) -> Result<()> {
        let head = self.rows.lookup(key)?.head().ok_or_else(|| {
            Error::invariant(format!("history of {} has no rows to delete", hex(key)))
        })?;

        let row = HistoryRow::read_from(self.rows.get(head)?.bytes(0, HISTORY_ROW_SIZE)?)?;
        if row.kind != kind || row.point != *point {
            return Err(Error::invariant(format!(
                "out of order history delete for {}: head is {:?}, expected {:?}",
                hex(key),
                row.kind,
                kind
            )));
        }

        self.rows.delete_last_row(key)?;
        Ok(())
    }

    /// Rows of `key`, newest first. A zero `limit` means unlimited; rows
    /// below a nonzero `from_height` are skipped.
    pub fn get(&self, key: &ShortHash, limit: usize, from_height: u32) -> Result<Vec<HistoryRow>> {
        let mut result = Vec::new();
        for index in self.rows.rows(key)? {
            if limit > 0 && result.len() >= limit {
                break;
            }

            let memory = self.rows.get(index?)?;
            if from_height == 0 || HistoryRow::height_of(&memory)? >= from_height {
                result.push(HistoryRow::read_from(memory.bytes(0, HISTORY_ROW_SIZE)?)?);
            }
        }
        Ok(result)
    }

    pub fn statinfo(&self) -> StatInfo {
        self.rows.statinfo()
    }
}

impl Component for HistoryDatabase {
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

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::remap_lock;
    use tempfile::TempDir;

    fn database(dir: &TempDir) -> HistoryDatabase {
        let lookup = dir.path().join("history_table");
        let rows = dir.path().join("history_rows");
        MappedFile::touch(&lookup).unwrap();
        MappedFile::touch(&rows).unwrap();
        let db = HistoryDatabase::new(&lookup, &rows, 31, &remap_lock()).unwrap();
        db.create().unwrap();
        db
    }

    #[test]
    fn test_output_row_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        let address = [7u8; 20];
        let outpoint = Point::new([1u8; 32], 0);

        db.add_output(&address, &outpoint, 100, 5000).unwrap();
        let rows = db.get(&address, 0, 0).unwrap();
        assert_eq!(
            rows,
            vec![HistoryRow {
                kind: PointKind::Output,
                point: outpoint,
                height: 100,
                value: 5000,
            }]
        );
    }

    #[test]
    fn test_get_limit_and_height() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        let address = [7u8; 20];
        for height in 1..=10u32 {
            db.add_output(&address, &Point::new([height as u8; 32], 0), height, 1)
                .unwrap();
        }

        assert_eq!(db.get(&address, 0, 0).unwrap().len(), 10);
        assert_eq!(db.get(&address, 3, 0).unwrap().len(), 3);
        let recent = db.get(&address, 0, 8).unwrap();
        assert_eq!(
            recent.iter().map(|row| row.height).collect::<Vec<_>>(),
            vec![10, 9, 8]
        );
        assert!(db.get(&[0u8; 20], 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_spend_row_carries_checksum() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        let address = [3u8; 20];
        let previous = Point::new([9u8; 32], 2);
        let inpoint = Point::new([4u8; 32], 0);

        db.add_input(&address, &inpoint, 5, &previous).unwrap();
        let row = db.get(&address, 0, 0).unwrap()[0];
        assert_eq!(row.kind, PointKind::Spend);
        assert_eq!(row.value, previous.checksum());
    }

    #[test]
    fn test_delete_last_row_checks_order() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        let address = [7u8; 20];
        let first = Point::new([1u8; 32], 0);
        let second = Point::new([2u8; 32], 0);
        db.add_output(&address, &first, 1, 10).unwrap();
        db.add_output(&address, &second, 2, 20).unwrap();

        assert!(matches!(
            db.delete_last_row(&address, PointKind::Output, &first),
            Err(Error::Invariant(_))
        ));
        db.delete_last_row(&address, PointKind::Output, &second).unwrap();
        db.delete_last_row(&address, PointKind::Output, &first).unwrap();
        assert!(db.get(&address, 0, 0).unwrap().is_empty());
        assert!(matches!(
            db.delete_last_row(&address, PointKind::Output, &first),
            Err(Error::Invariant(_))
        ));
    }
}
