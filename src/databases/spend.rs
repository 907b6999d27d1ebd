use std::path::Path;
use std::sync::Arc;

use crate::chain::Point;
use crate::constants::POINT_SIZE;
use crate::databases::{open, start_files, Component};
use crate::error::{Error, Result};
use crate::hash_table::RecordHashIndex;
use crate::memory::{MappedFile, RemapLock};

/// Spent output markers: previous output point to the spending input point.
#[derive(Debug)]
pub struct SpendDatabase {
    file: Arc<MappedFile>,
    lookup: RecordHashIndex<POINT_SIZE>,
}

impl SpendDatabase {
    pub fn new(path: &Path, bucket_count: u64, remap_lock: &RemapLock) -> Result<Self> {
        let file = open(path, remap_lock);
        Ok(SpendDatabase {
            lookup: RecordHashIndex::new(file.clone(), bucket_count, POINT_SIZE as u64)?,
            file,
        })
    }

    /// Input point spending `outpoint`, if any.
    pub fn get(&self, outpoint: &Point) -> Result<Option<Point>> {
        match self.lookup.find(&outpoint.to_bytes())? {
            Some(memory) => Point::from_bytes(memory.bytes(0, POINT_SIZE)?).map(Some),
            None => Ok(None),
        }
    }

    pub fn store(&self, outpoint: &Point, spend: &Point) -> Result<()> {
        let value = spend.to_bytes();
        self.lookup
            .store(&outpoint.to_bytes(), |data| data.copy_from_slice(&value))?;
        Ok(())
    }

    pub fn remove(&self, outpoint: &Point) -> Result<()> {
        if !self.lookup.unlink(&outpoint.to_bytes())? {
            return Err(Error::invariant("spent output missing from spend table"));
        }
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.lookup.entries().count()
    }
}

impl Component for SpendDatabase {
    fn files(&self) -> Vec<&Arc<MappedFile>> {
        vec![&self.file]
    }

    fn create(&self) -> Result<()> {
        start_files(self)?;
        self.lookup.create()
    }

    fn start(&self) -> Result<()> {
        start_files(self)?;
        self.lookup.start()
    }

    fn sync(&self) -> Result<()> {
        self.lookup.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::remap_lock;
    use tempfile::TempDir;

    #[test]
    fn test_spend_marker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spend_table");
        MappedFile::touch(&path).unwrap();
        let db = SpendDatabase::new(&path, 11, &remap_lock()).unwrap();
        db.create().unwrap();

        let outpoint = Point::new([1u8; 32], 0);
        let spend = Point::new([2u8; 32], 3);
        assert!(db.get(&outpoint).unwrap().is_none());

        db.store(&outpoint, &spend).unwrap();
        assert_eq!(db.get(&outpoint).unwrap(), Some(spend));
        assert!(db.get(&Point::new([1u8; 32], 1)).unwrap().is_none());

        db.remove(&outpoint).unwrap();
        assert!(db.get(&outpoint).unwrap().is_none());
        assert!(matches!(db.remove(&outpoint), Err(Error::Invariant(_))));
        assert_eq!(db.count(), 1);
    }
}
